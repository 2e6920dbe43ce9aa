//! # Component actor loop.
//!
//! Runs one component: takes invocations off its inbox one at a time, runs the
//! method and reports the outcome to the router.
//!
//! ## Rules
//! - Methods of one component never overlap; the inbox is FIFO.
//! - A panicking method is reported as [`ComponentError::Panicked`]; the actor
//!   keeps serving.
//! - On cancellation the running method is dropped and reported as
//!   [`ComponentError::Canceled`]; the loop then exits.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Component, ComponentId, Invocation};
use crate::error::ComponentError;
use crate::runtime::RouterMsg;
use crate::services::ServicesProxy;

pub(crate) async fn run_component(
    id: ComponentId,
    mut component: Box<dyn Component>,
    services: ServicesProxy,
    mut inbox: mpsc::UnboundedReceiver<Invocation>,
    router: mpsc::UnboundedSender<RouterMsg>,
    cancel: CancellationToken,
) {
    debug!(component = %id, "component actor started");
    loop {
        let inv = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = inbox.recv() => match msg {
                Some(inv) => inv,
                None => break,
            },
        };

        debug!(component = %id, call_id = inv.call_id, method = %inv.method, "invoking");
        let fut = component.invoke(&services, &inv.method, inv.args);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ComponentError::Canceled),
            res = AssertUnwindSafe(fut).catch_unwind() => match res {
                Ok(r) => r,
                Err(panic) => Err(ComponentError::Panicked { info: panic_message(panic) }),
            },
        };
        if let Err(e) = &outcome {
            warn!(component = %id, method = %inv.method, error = %e, "component method failed");
        }
        let stop = matches!(outcome, Err(ComponentError::Canceled));
        let msg = RouterMsg::MethodResult {
            callee: id.clone(),
            call_id: inv.call_id,
            method: inv.method,
            outcome,
        };
        if router.send(msg).is_err() || stop {
            break;
        }
    }
    debug!(component = %id, "component actor stopped");
    let _ = router.send(RouterMsg::Exited(id));
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
