use async_trait::async_trait;
use serde_json::Value;

use crate::component::Component;
use crate::error::ComponentError;
use crate::services::ServicesProxy;

/// Port the hello driver talks to.
pub const WORKER_PORT: &str = "WORKER";

/// Forwards each lifecycle call to the `WORKER` port.
pub struct HelloDriver;

impl HelloDriver {
    async fn forward(
        &self,
        services: &ServicesProxy,
        method: &str,
        t: f64,
    ) -> Result<Value, ComponentError> {
        let worker = services.get_port(WORKER_PORT).await?;
        services.debug(format!("HelloDriver: calling {worker}.{method}"));
        Ok(services.call(&worker, method, vec![Value::from(t)]).await?)
    }
}

#[async_trait]
impl Component for HelloDriver {
    async fn init(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        services.info("HelloDriver: init");
        self.forward(services, "init", t).await
    }

    async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        services.info("HelloDriver: beginning step call");
        let v = self.forward(services, "step", t).await?;
        services.info("HelloDriver: finished worker call");
        Ok(v)
    }

    async fn finalize(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        self.forward(services, "finalize", t).await
    }
}

/// Logs one line per step.
pub struct HelloWorker;

#[async_trait]
impl Component for HelloWorker {
    async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        services.info(format!("HelloWorker step t={t}"));
        Ok(Value::Null)
    }
}
