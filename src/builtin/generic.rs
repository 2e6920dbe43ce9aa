use async_trait::async_trait;
use serde_json::Value;

use crate::component::{Component, ComponentId};
use crate::config::{DRIVER_PORT, INIT_PORT};
use crate::error::{ComponentError, ConfigError, ServiceError};
use crate::services::ServicesProxy;

/// Drives every port other than `DRIVER` and `INIT`.
///
/// `init` and `finalize` go to each port in `PORTS.NAMES` order. `step`
/// calls every port concurrently for each time-loop value and waits for all
/// of them before the next value. Without a time loop there is one step at
/// the driver's own time stamp.
#[derive(Default)]
pub struct GenericDriver {
    ports: Option<Vec<ComponentId>>,
}

/// Worker port names from a `PORTS.NAMES` value.
fn worker_ports(names: &str) -> impl Iterator<Item = &str> {
    names
        .split_whitespace()
        .filter(|n| *n != DRIVER_PORT && *n != INIT_PORT)
}

impl GenericDriver {
    async fn ports(&mut self, services: &ServicesProxy) -> Result<Vec<ComponentId>, ComponentError> {
        if let Some(p) = &self.ports {
            return Ok(p.clone());
        }
        let names = services
            .get_config_param("PORTS.NAMES")
            .await?
            .unwrap_or_default();
        let mut ids = Vec::new();
        for name in worker_ports(&names) {
            ids.push(services.get_port(name).await?);
        }
        self.ports = Some(ids.clone());
        Ok(ids)
    }

    async fn each(
        &mut self,
        services: &ServicesProxy,
        method: &str,
        t: f64,
    ) -> Result<(), ComponentError> {
        for port in self.ports(services).await? {
            services.call(&port, method, vec![Value::from(t)]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Component for GenericDriver {
    async fn init(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        self.each(services, "init", t).await?;
        Ok(Value::Null)
    }

    async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        let times = match services.get_time_loop().await {
            Ok(v) => v,
            Err(ServiceError::Config(ConfigError::MissingKey { .. })) => vec![t],
            Err(e) => return Err(e.into()),
        };
        let ports = self.ports(services).await?;
        for ts in &times {
            services.info(format!("GenericDriver: step t={ts}"));
            let mut calls = Vec::with_capacity(ports.len());
            for port in &ports {
                calls.push(
                    services
                        .call_nonblocking(port, "step", vec![Value::from(*ts)])
                        .await?,
                );
            }
            services.wait_call_list(calls, None).await?;
        }
        Ok(Value::from(times.len()))
    }

    async fn finalize(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        self.each(services, "finalize", t).await?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ports_skip_driver_and_init() {
        let ports: Vec<&str> = worker_ports("INIT DRIVER  EPA\tRF_IC ").collect();
        assert_eq!(ports, vec!["EPA", "RF_IC"]);
        assert_eq!(worker_ports("DRIVER").count(), 0);
    }
}
