//! # Invocation engine.
//!
//! Book-keeping for method calls between components. The router owns one
//! [`InvocationEngine`]; the actual delivery is the callee actor's FIFO inbox,
//! which is what keeps calls from one caller to one callee in issue order.
//!
//! ```text
//! call_nonblocking ─► begin() ─► call_id ──► caller
//!                        │
//!                        └─► callee inbox ─► method runs ─► MethodResult ─► complete()
//!
//! wait_call / wait_call_list / wait_any ─► poll_wait()
//!     ├─ Some(outcome) ─► records harvested, reply now
//!     └─ None          ─► router parks the waiter until the next complete()
//! ```
//!
//! ## Rules
//! - A record lives from `begin` until its caller harvests it with a wait.
//! - Only the caller that issued a call may wait on it (`UnknownCall` otherwise).
//! - A wait timing out harvests nothing; the same id may be waited on again.
//! - When a caller is cancelled its in-flight calls keep running, but their
//!   results are dropped on arrival.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::component::ComponentId;
use crate::error::{ComponentError, InvocationError};

pub type CallId = u64;

/// Lifecycle of one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    InFlight,
    Completed,
    Failed,
}

/// What a caller is waiting for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitKind {
    One(CallId),
    /// Every id, results returned in the given order.
    All(Vec<CallId>),
    /// The first id (in list order) whose call has finished.
    Any(Vec<CallId>),
}

/// Harvested results.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    One(Value),
    All(Vec<Value>),
    Any(CallId, Value),
}

struct CallRecord {
    caller: ComponentId,
    callee: ComponentId,
    method: String,
    outcome: Option<Result<Value, InvocationError>>,
    discarded: bool,
}

impl CallRecord {
    fn state(&self) -> CallState {
        match &self.outcome {
            None => CallState::InFlight,
            Some(Ok(_)) => CallState::Completed,
            Some(Err(_)) => CallState::Failed,
        }
    }
}

/// Table of outstanding calls.
pub struct InvocationEngine {
    calls: HashMap<CallId, CallRecord>,
    next_id: CallId,
}

impl Default for InvocationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationEngine {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            next_id: 1,
        }
    }

    /// Records a new in-flight call and returns its id.
    pub fn begin(&mut self, caller: &ComponentId, callee: &ComponentId, method: &str) -> CallId {
        let call_id = self.next_id;
        self.next_id += 1;
        debug!(call_id, caller = %caller, callee = %callee, method, "call issued");
        self.calls.insert(
            call_id,
            CallRecord {
                caller: caller.clone(),
                callee: callee.clone(),
                method: method.to_string(),
                outcome: None,
                discarded: false,
            },
        );
        call_id
    }

    /// Stores the callee's answer. Returns the caller to notify, or `None` when
    /// the result was discarded (or the id is unknown).
    pub fn complete(
        &mut self,
        call_id: CallId,
        outcome: Result<Value, InvocationError>,
    ) -> Option<ComponentId> {
        let rec = self.calls.get_mut(&call_id)?;
        if rec.discarded {
            debug!(call_id, "result of cancelled caller dropped");
            self.calls.remove(&call_id);
            return None;
        }
        rec.outcome = Some(outcome);
        Some(rec.caller.clone())
    }

    /// Checks a wait without blocking.
    ///
    /// Unknown or foreign ids fail before anything is harvested. `Ok(None)`
    /// means the caller has to park.
    pub fn poll_wait(
        &mut self,
        caller: &ComponentId,
        kind: &WaitKind,
    ) -> Result<Option<WaitOutcome>, InvocationError> {
        match kind {
            WaitKind::One(id) => {
                self.check_owner(caller, *id)?;
                match self.take(*id) {
                    Some(res) => res.map(|v| Some(WaitOutcome::One(v))),
                    None => Ok(None),
                }
            }
            WaitKind::All(ids) => {
                for id in ids {
                    self.check_owner(caller, *id)?;
                }
                if !ids.iter().all(|id| self.is_done(*id)) {
                    return Ok(None);
                }
                let mut values = Vec::with_capacity(ids.len());
                let mut first_err = None;
                for id in ids {
                    match self.take(*id) {
                        Some(Ok(v)) => values.push(v),
                        Some(Err(e)) => {
                            first_err.get_or_insert(e);
                        }
                        None => {}
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(Some(WaitOutcome::All(values))),
                }
            }
            WaitKind::Any(ids) => {
                if ids.is_empty() {
                    return Err(InvocationError::UnknownCall { call_id: 0 });
                }
                for id in ids {
                    self.check_owner(caller, *id)?;
                }
                let ready = ids.iter().copied().find(|id| self.is_done(*id));
                match ready {
                    Some(id) => match self.take(id) {
                        Some(res) => res.map(|v| Some(WaitOutcome::Any(id, v))),
                        None => Ok(None),
                    },
                    None => Ok(None),
                }
            }
        }
    }

    /// Marks every call issued by `caller` as discarded. Finished results are
    /// dropped now, in-flight ones on arrival.
    pub fn discard_caller(&mut self, caller: &ComponentId) -> usize {
        let mut n = 0;
        self.calls.retain(|_, rec| {
            if &rec.caller != caller {
                return true;
            }
            n += 1;
            if rec.outcome.is_some() {
                false
            } else {
                rec.discarded = true;
                true
            }
        });
        n
    }

    /// Fails every in-flight call addressed to `callee`. Returns the callers
    /// that may now be waiting on a finished call.
    pub fn fail_callee(&mut self, callee: &ComponentId) -> Vec<ComponentId> {
        let mut callers = Vec::new();
        let mut dropped = Vec::new();
        for (id, rec) in self.calls.iter_mut() {
            if &rec.callee == callee && rec.outcome.is_none() {
                if rec.discarded {
                    dropped.push(*id);
                    continue;
                }
                rec.outcome = Some(Err(InvocationError::Cancelled));
                if !callers.contains(&rec.caller) {
                    callers.push(rec.caller.clone());
                }
            }
        }
        for id in dropped {
            self.calls.remove(&id);
        }
        callers
    }

    pub fn state(&self, call_id: CallId) -> Option<CallState> {
        self.calls.get(&call_id).map(CallRecord::state)
    }

    pub fn method(&self, call_id: CallId) -> Option<&str> {
        self.calls.get(&call_id).map(|r| r.method.as_str())
    }

    pub fn callee(&self, call_id: CallId) -> Option<&ComponentId> {
        self.calls.get(&call_id).map(|r| &r.callee)
    }

    /// Records not yet harvested.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn check_owner(&self, caller: &ComponentId, call_id: CallId) -> Result<(), InvocationError> {
        match self.calls.get(&call_id) {
            Some(rec) if &rec.caller == caller && !rec.discarded => Ok(()),
            _ => Err(InvocationError::UnknownCall { call_id }),
        }
    }

    fn is_done(&self, call_id: CallId) -> bool {
        self.calls
            .get(&call_id)
            .is_some_and(|r| r.outcome.is_some())
    }

    fn take(&mut self, call_id: CallId) -> Option<Result<Value, InvocationError>> {
        if !self.is_done(call_id) {
            return None;
        }
        self.calls.remove(&call_id).and_then(|r| r.outcome)
    }
}

/// Wraps a component method error for the caller.
///
/// The origin of a nested failure is kept, so the caller can name the
/// component where it started.
pub fn remote_failure(callee: &ComponentId, method: &str, err: &ComponentError) -> InvocationError {
    match err {
        ComponentError::Canceled => InvocationError::Cancelled,
        _ => InvocationError::RemoteFailure {
            target: callee.to_string(),
            origin: err
                .origin()
                .map(str::to_string)
                .unwrap_or_else(|| callee.to_string()),
            method: method.to_string(),
            message: err.as_message(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> (ComponentId, ComponentId, ComponentId) {
        (
            ComponentId::new("inv", "DRIVER"),
            ComponentId::new("inv", "W1"),
            ComponentId::new("inv", "W2"),
        )
    }

    #[test]
    fn test_wait_one_harvests_once() {
        let (d, w, _) = ids();
        let mut e = InvocationEngine::new();
        let id = e.begin(&d, &w, "step");
        assert_eq!(e.poll_wait(&d, &WaitKind::One(id)).unwrap(), None);
        assert_eq!(e.state(id), Some(CallState::InFlight));
        assert_eq!(e.complete(id, Ok(json!(1))), Some(d.clone()));
        assert_eq!(
            e.poll_wait(&d, &WaitKind::One(id)).unwrap(),
            Some(WaitOutcome::One(json!(1)))
        );
        assert_eq!(
            e.poll_wait(&d, &WaitKind::One(id)),
            Err(InvocationError::UnknownCall { call_id: id })
        );
        assert!(e.is_empty());
    }

    #[test]
    fn test_wait_list_keeps_order_and_waits_for_all() {
        let (d, w1, w2) = ids();
        let mut e = InvocationEngine::new();
        let a = e.begin(&d, &w1, "step");
        let b = e.begin(&d, &w2, "step");
        e.complete(b, Ok(json!("b")));
        let all = WaitKind::All(vec![a, b]);
        assert_eq!(e.poll_wait(&d, &all).unwrap(), None);
        e.complete(a, Ok(json!("a")));
        assert_eq!(
            e.poll_wait(&d, &all).unwrap(),
            Some(WaitOutcome::All(vec![json!("a"), json!("b")]))
        );
    }

    #[test]
    fn test_wait_any_takes_first_finished() {
        let (d, w1, w2) = ids();
        let mut e = InvocationEngine::new();
        let a = e.begin(&d, &w1, "step");
        let b = e.begin(&d, &w2, "step");
        let any = WaitKind::Any(vec![a, b]);
        assert_eq!(e.poll_wait(&d, &any).unwrap(), None);
        e.complete(b, Ok(json!(2)));
        assert_eq!(
            e.poll_wait(&d, &any).unwrap(),
            Some(WaitOutcome::Any(b, json!(2)))
        );
        assert_eq!(e.state(a), Some(CallState::InFlight));
    }

    #[test]
    fn test_remote_failure_keeps_origin() {
        let (d, w1, w2) = ids();
        let nested: ComponentError = crate::error::ServiceError::from(remote_failure(
            &w2,
            "step",
            &ComponentError::fail("boom"),
        ))
        .into();
        let err = remote_failure(&w1, "step", &nested);
        match &err {
            InvocationError::RemoteFailure { target, origin, .. } => {
                assert_eq!(target, &w1.to_string());
                assert_eq!(origin, &w2.to_string());
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut e = InvocationEngine::new();
        let id = e.begin(&d, &w1, "step");
        e.complete(id, Err(err.clone()));
        assert_eq!(e.state(id), Some(CallState::Failed));
        assert_eq!(e.poll_wait(&d, &WaitKind::One(id)), Err(err));
    }

    #[test]
    fn test_foreign_caller_cannot_wait() {
        let (d, w1, w2) = ids();
        let mut e = InvocationEngine::new();
        let id = e.begin(&d, &w1, "step");
        assert!(matches!(
            e.poll_wait(&w2, &WaitKind::One(id)),
            Err(InvocationError::UnknownCall { .. })
        ));
    }

    #[test]
    fn test_cancelled_caller_results_are_dropped() {
        let (d, w1, w2) = ids();
        let mut e = InvocationEngine::new();
        let done = e.begin(&d, &w1, "step");
        let running = e.begin(&d, &w2, "step");
        e.complete(done, Ok(Value::Null));
        assert_eq!(e.discard_caller(&d), 2);
        assert_eq!(e.len(), 1);
        assert_eq!(e.complete(running, Ok(Value::Null)), None);
        assert!(e.is_empty());
    }

    #[test]
    fn test_dead_callee_fails_calls() {
        let (d, w1, _) = ids();
        let mut e = InvocationEngine::new();
        let id = e.begin(&d, &w1, "step");
        assert_eq!(e.fail_callee(&w1), vec![d.clone()]);
        assert_eq!(
            e.poll_wait(&d, &WaitKind::One(id)),
            Err(InvocationError::Cancelled)
        );
    }
}
