use async_trait::async_trait;
use serde_json::Value;

use crate::component::Component;
use crate::error::ComponentError;
use crate::services::ServicesProxy;
use crate::tasks::TaskRequest;

/// Runs an executable once per step.
///
/// The binary is `BIN_PATH`, else the `BINARY` parameter; `ARGS` is split on
/// whitespace. `INPUT_FILES` are staged at `init`, `OUTPUT_FILES` after each
/// successful step. A non-zero exit fails the step.
pub struct ExecWorker;

#[async_trait]
impl Component for ExecWorker {
    async fn init(&mut self, services: &ServicesProxy, _t: f64) -> Result<Value, ComponentError> {
        if !services.config().input_files.is_empty() {
            services.stage_input_files(None).await?;
        }
        Ok(Value::Null)
    }

    async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
        let binary = match &services.config().bin_path {
            Some(p) => p.display().to_string(),
            None => services
                .get_config_param("BINARY")
                .await?
                .ok_or_else(|| ComponentError::fail("neither BIN_PATH nor BINARY is set"))?,
        };
        let args = services
            .get_config_param("ARGS")
            .await?
            .unwrap_or_default();
        let nproc = services.config().nproc.max(1);
        let request = TaskRequest::new(binary.as_str(), nproc).args(args.split_whitespace());

        let task_id = services.launch_task(request).await?;
        let code = services.wait_task(task_id).await?;
        if code != 0 {
            return Err(ComponentError::fail(format!(
                "{binary} exited with {code} at t={t}"
            )));
        }
        if !services.config().output_files.is_empty() {
            services.stage_output_files(t, None).await?;
        }
        Ok(Value::from(code))
    }
}
