//! # Components.
//!
//! A component is a user-supplied actor implementing some of the lifecycle
//! methods `init`, `validate`, `step`, `checkpoint` and `finalize`. Each one
//! runs in its own tokio task and reaches the rest of the framework only
//! through its [`ServicesProxy`].
//!
//! ```text
//!  router ──Invocation──► [inbox] ──► actor loop ──► Component::invoke(method, args)
//!    ▲                                                    │
//!    └────────────── MethodResult ◄───────────────────────┘
//! ```
//!
//! ## Implementing
//! ```rust
//! use async_trait::async_trait;
//! use ips_runtime::{Component, ComponentError, ServicesProxy};
//! use serde_json::Value;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Component for Echo {
//!     async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
//!         services.info(format!("step {t}"));
//!         Ok(Value::from(t))
//!     }
//! }
//! ```

mod actor;
mod catalog;
mod id;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ComponentError;
use crate::invocation::CallId;
use crate::services::ServicesProxy;

pub(crate) use actor::run_component;
pub use catalog::{ComponentCatalog, ComponentFactory};
pub use id::ComponentId;

/// One method call delivered to a component actor.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub call_id: CallId,
    pub method: String,
    pub args: Vec<Value>,
}

/// Lifecycle methods of a simulation component.
///
/// Every method has a no-op default. `args[0]`, when numeric, is the time
/// stamp passed to the lifecycle methods.
#[async_trait]
pub trait Component: Send + 'static {
    async fn init(&mut self, _services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        Ok(Value::Null)
    }

    async fn validate(
        &mut self,
        _services: &ServicesProxy,
        _t: f64,
    ) -> Result<Value, ComponentError> {
        Ok(Value::Null)
    }

    async fn step(&mut self, _services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        Ok(Value::Null)
    }

    async fn checkpoint(
        &mut self,
        _services: &ServicesProxy,
        _t: f64,
    ) -> Result<Value, ComponentError> {
        Ok(Value::Null)
    }

    async fn finalize(
        &mut self,
        _services: &ServicesProxy,
        _t: f64,
    ) -> Result<Value, ComponentError> {
        Ok(Value::Null)
    }

    /// Dispatches a method by name. Override to expose extra methods.
    async fn invoke(
        &mut self,
        services: &ServicesProxy,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ComponentError> {
        let t = args.first().and_then(Value::as_f64).unwrap_or(0.0);
        match method {
            "init" => self.init(services, t).await,
            "validate" => self.validate(services, t).await,
            "step" => self.step(services, t).await,
            "checkpoint" => self.checkpoint(services, t).await,
            "finalize" => self.finalize(services, t).await,
            other => Err(ComponentError::UnknownMethod {
                method: other.to_string(),
            }),
        }
    }
}
