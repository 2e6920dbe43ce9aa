//! # Tracing sink for monitor events.
//!
//! [`LogWriter`] renders monitor events as `tracing` records under the
//! `ips::monitor` target, so the binary's subscriber decides where they go.
//!
//! ```text
//! INFO  ips::monitor: IPS_LAUNCH_TASK sim=hello component=hello@Worker@1 task_id=3 cores=1
//! WARN  ips::monitor: IPS_SINK_OVERFLOW component=portal comment=sink=portal reason=full
//! ```

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::Subscribe;
use crate::events::{MonitorEvent, MonitorKind};

/// Logs every monitor event.
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &MonitorEvent) {
        let fields = e
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let component = e.component.as_deref().unwrap_or("-");
        let comment = e.comment.as_deref().unwrap_or("");
        let kind = e.kind.as_str();
        match e.kind {
            MonitorKind::SinkOverflow | MonitorKind::ShutdownRequested => {
                warn!(target: "ips::monitor", "{kind} component={component} {comment}");
            }
            MonitorKind::SinkPanicked | MonitorKind::GraceExceeded => {
                error!(target: "ips::monitor", "{kind} component={component} {comment}");
            }
            MonitorKind::CallBegin | MonitorKind::CallEnd | MonitorKind::ResourceAlloc => {
                debug!(target: "ips::monitor", "{kind} sim={} component={component} {fields}", e.sim);
            }
            _ => {
                info!(target: "ips::monitor", "{kind} sim={} component={component} {fields} {comment}", e.sim);
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
