//! # Portal sink.
//!
//! Turns monitor events into portal records, appends them to the simulation's
//! event log and, when a portal URL is configured, POSTs them.
//!
//! ```text
//! MonitorEvent ─► record (key="value" ...) ─┬─► SIM_ROOT/simulation_log/<SIM_NAME>.eventlog
//!                                           └─► POST PORTAL_URL
//!                                                 ├─ ok
//!                                                 └─ fail ─► sleep(backoff.next(n)) ─► retry
//!                                                              └─ out of retries ─► SIM_ROOT/PORTAL.err
//! ```
//!
//! Runs are learned from `IPS_START` (which carries `sim_root`) and forgotten
//! after `IPS_END`. Sequence numbers are per simulation.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{PlatformConfig, RuntimeConfig};
use crate::events::{MonitorEvent, MonitorKind};
use crate::policies::BackoffPolicy;
use crate::subscribers::Subscribe;

struct PortalRun {
    sim_root: PathBuf,
    runid: String,
    seqnum: u64,
    started: Instant,
}

/// Monitor sink writing portal records.
pub struct PortalSink {
    url: Option<String>,
    host: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
    retries: u32,
    runs: Mutex<HashMap<String, PortalRun>>,
}

impl PortalSink {
    pub fn new(
        url: Option<String>,
        host: impl Into<String>,
        backoff: BackoffPolicy,
        retries: u32,
        timeout: Option<Duration>,
    ) -> Self {
        let builder = reqwest::Client::builder();
        let builder = match timeout {
            Some(t) => builder.timeout(t),
            None => builder,
        };
        Self {
            url,
            host: host.into(),
            client: builder.build().unwrap_or_else(|_| reqwest::Client::new()),
            backoff,
            retries,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Sink for `platform`; posts only when the portal is enabled.
    pub fn from_config(platform: &PlatformConfig, cfg: &RuntimeConfig) -> Self {
        let url = if platform.use_portal {
            platform.portal_url.clone()
        } else {
            None
        };
        Self::new(
            url,
            platform.host.clone(),
            cfg.portal_backoff,
            cfg.portal_retries,
            cfg.portal_request_timeout(),
        )
    }

    /// Numbers the event and renders its fields. `None` for unknown runs.
    fn record(&self, ev: &MonitorEvent) -> Option<(PathBuf, u64, Vec<(String, String)>)> {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        if ev.kind == MonitorKind::IpsStart {
            let sim_root = ev.fields.get("sim_root").map(PathBuf::from)?;
            let runid = format!(
                "{}_{}_{}",
                ev.sim,
                self.host,
                chrono::Local::now().format("%Y%m%d%H%M%S")
            );
            runs.insert(
                ev.sim.to_string(),
                PortalRun {
                    sim_root,
                    runid,
                    seqnum: 0,
                    started: Instant::now(),
                },
            );
        }
        let run = runs.get_mut(&*ev.sim)?;
        run.seqnum += 1;
        let seqnum = run.seqnum;

        let eventtype = match ev.kind {
            MonitorKind::SendPortalEvent => ev
                .fields
                .get("eventtype")
                .cloned()
                .unwrap_or_else(|| ev.kind.as_str().to_string()),
            kind => kind.as_str().to_string(),
        };
        let comment = ev.comment.as_deref().unwrap_or("").to_string();
        let state = if ev.kind == MonitorKind::IpsEnd {
            "Completed"
        } else {
            "Running"
        };
        let mut fields: Vec<(String, String)> = vec![
            (
                "publishing_time".into(),
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            ),
            ("publisher".into(), "ips".into()),
            (
                "publishing_component".into(),
                ev.component
                    .as_deref()
                    .unwrap_or("FRAMEWORK")
                    .to_string(),
            ),
            ("publishing_host".into(), self.host.clone()),
            ("action".into(), eventtype.clone()),
            ("message".into(), comment.clone()),
            ("seqnum".into(), seqnum.to_string()),
            ("portal_runid".into(), run.runid.clone()),
            ("eventtype".into(), eventtype),
            (
                "walltime".into(),
                format!("{:.2}", run.started.elapsed().as_secs_f64()),
            ),
            (
                "phystimestamp".into(),
                ev.phystimestamp.map(|t| t.to_string()).unwrap_or_default(),
            ),
            ("state".into(), state.into()),
            ("comment".into(), comment),
            ("sim_name".into(), ev.sim.to_string()),
        ];
        fields.extend(
            ev.fields
                .iter()
                .filter(|(k, _)| k.as_str() != "eventtype")
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let root = run.sim_root.clone();
        if ev.kind == MonitorKind::IpsEnd {
            runs.remove(&*ev.sim);
        }
        Some((root, seqnum, fields))
    }

    async fn post(&self, url: &str, body: &str) -> Result<(), String> {
        let mut last = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.next(attempt - 1)).await;
            }
            let res = self
                .client
                .post(url)
                .header("Content-Type", "text/plain")
                .body(body.to_string())
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match res {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!(attempt, error = %e, "portal post failed");
                    last = e.to_string();
                }
            }
        }
        Err(last)
    }
}

/// `key="value"` pairs separated by spaces; quotes in values are escaped.
pub fn format_record(fields: &[(String, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One event log line: `%8d <time> key=value ...`.
pub fn eventlog_line(seqnum: u64, fields: &[(String, String)]) -> String {
    let time = fields
        .iter()
        .find(|(k, _)| k == "publishing_time")
        .map(|(_, v)| v.as_str())
        .unwrap_or("-");
    let kv = fields
        .iter()
        .filter(|(k, _)| k != "publishing_time")
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{seqnum:8} {time} {kv}")
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")
}

#[async_trait]
impl Subscribe for PortalSink {
    async fn on_event(&self, ev: &MonitorEvent) {
        if ev.kind.is_internal() {
            return;
        }
        let Some((sim_root, seqnum, fields)) = self.record(ev) else {
            return;
        };
        let log = sim_root
            .join("simulation_log")
            .join(format!("{}.eventlog", ev.sim));
        if let Err(e) = append_line(&log, &eventlog_line(seqnum, &fields)) {
            warn!(path = %log.display(), error = %e, "event log write failed");
        }

        let Some(url) = &self.url else {
            return;
        };
        let body = format_record(&fields);
        if let Err(e) = self.post(url, &body).await {
            warn!(sim = %ev.sim, seqnum, error = %e, "portal unreachable; record kept locally");
            let err_file = sim_root.join("PORTAL.err");
            if let Err(e) = append_line(&err_file, &body) {
                warn!(path = %err_file.display(), error = %e, "portal error file write failed");
            }
        }
    }

    fn name(&self) -> &'static str {
        "portal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::JitterPolicy;

    fn start(sim: &str, root: &Path) -> MonitorEvent {
        MonitorEvent::new(MonitorKind::IpsStart, sim)
            .with_field("sim_root", root.display())
            .with_comment("starting")
    }

    #[test]
    fn test_record_format() {
        let fields = vec![
            ("a".to_string(), "plain".to_string()),
            ("b".to_string(), "say \"hi\"".to_string()),
        ];
        assert_eq!(format_record(&fields), r#"a="plain" b="say \"hi\"""#);
        assert!(eventlog_line(3, &fields).starts_with("       3 - a=plain"));
    }

    #[tokio::test]
    async fn test_eventlog_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PortalSink::new(None, "host", BackoffPolicy::default(), 0, None);
        sink.on_event(&start("s", dir.path())).await;
        sink.on_event(
            &MonitorEvent::new(MonitorKind::SendPortalEvent, "s")
                .with_component("s@D@0")
                .with_field("eventtype", "PHYS_STEP")
                .with_phystimestamp(1.5),
        )
        .await;
        sink.on_event(&MonitorEvent::new(MonitorKind::IpsEnd, "s")).await;
        sink.on_event(&MonitorEvent::new(MonitorKind::IpsEnd, "s")).await;

        let text = std::fs::read_to_string(dir.path().join("simulation_log/s.eventlog")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("       1 "));
        assert!(lines[1].contains("eventtype=PHYS_STEP"));
        assert!(lines[1].contains("phystimestamp=1.5"));
        assert!(lines[2].contains("state=Completed"));
    }

    #[tokio::test]
    async fn test_unreachable_portal_falls_back_to_error_file() {
        let dir = tempfile::tempdir().unwrap();
        let backoff = BackoffPolicy {
            first: Duration::from_millis(5),
            max: Duration::from_millis(10),
            factor: 2.0,
            jitter: JitterPolicy::None,
        };
        let sink = PortalSink::new(
            Some("http://127.0.0.1:9/portal".into()),
            "host",
            backoff,
            2,
            Some(Duration::from_secs(2)),
        );
        sink.on_event(&start("s", dir.path())).await;
        let err = std::fs::read_to_string(dir.path().join("PORTAL.err")).unwrap();
        assert!(err.contains(r#"eventtype="IPS_START""#));
    }
}
