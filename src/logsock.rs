//! # Simulation log sink.
//!
//! Collects component log records into the simulation's `LOG_FILE`.
//!
//! ```text
//! in-process proxies ───────────────► ┐
//!                                     ├─► [mpsc] ─► writer ─► LOG_FILE
//! child processes ─► UNIX socket ───► ┘
//!                    (u32 BE length + JSON LogRecord)
//! ```
//!
//! The socket lives in the system temp directory; launched tasks find it in
//! `IPS_LOG_SOCKET`.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Frames larger than this are treated as corruption.
const MAX_FRAME: usize = 1 << 20;

/// One log line from a component or task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: String,
    pub sim: String,
    pub component: String,
    pub level: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(
        sim: impl Into<String>,
        component: impl Into<String>,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            sim: sim.into(),
            component: component.into(),
            level: level.into(),
            message: message.into(),
        }
    }

    /// Line written to the log file.
    pub fn format(&self) -> String {
        format!(
            "{} {:<28} {:<7} {}",
            self.time, self.component, self.level, self.message
        )
    }
}

/// Length-prefixed JSON frame.
pub fn encode(record: &LogRecord) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(record)?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one frame. `Ok(None)` on a clean end of stream.
pub async fn read_record<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<LogRecord>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("log frame of {len} bytes"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writer task plus optional socket listener for one simulation.
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogRecord>,
    socket: Option<PathBuf>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

impl LogSink {
    /// Opens `log_file` for appending and, with `socket`, binds the UNIX socket.
    pub async fn start(sim: &str, log_file: &Path, socket: bool) -> io::Result<Self> {
        if let Some(parent) = log_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
        let cancel = CancellationToken::new();

        let stop = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                let rec = tokio::select! {
                    rec = rx.recv() => match rec {
                        Some(r) => r,
                        None => break,
                    },
                    _ = stop.cancelled() => {
                        while let Ok(r) = rx.try_recv() {
                            let _ = file.write_all(format!("{}\n", r.format()).as_bytes()).await;
                        }
                        break;
                    }
                };
                if let Err(e) = file.write_all(format!("{}\n", rec.format()).as_bytes()).await {
                    warn!(error = %e, "log file write failed");
                }
            }
            let _ = file.flush().await;
        });

        let (socket, listener) = if socket {
            let path = std::env::temp_dir().join(format!(
                "ips_{}_{}.sock",
                sanitize(sim),
                std::process::id()
            ));
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            debug!(path = %path.display(), "log socket bound");
            let handle = spawn_listener(listener, tx.clone(), cancel.clone());
            (Some(path), Some(handle))
        } else {
            (None, None)
        };

        Ok(Self {
            tx,
            socket,
            cancel,
            writer,
            listener,
        })
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<LogRecord> {
        self.tx.clone()
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    /// Flushes what is queued, closes the socket and removes its file.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some(l) = self.listener {
            let _ = l.await;
        }
        let _ = self.writer.await;
        if let Some(path) = &self.socket {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn spawn_listener(
    listener: UnixListener,
    tx: mpsc::UnboundedSender<LogRecord>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((s, _)) => s,
                    Err(e) => {
                        warn!(error = %e, "log socket accept failed");
                        continue;
                    }
                },
            };
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                loop {
                    let rec = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = read_record(&mut stream) => r,
                    };
                    match rec {
                        Ok(Some(r)) => {
                            if tx.send(r).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "dropping log connection");
                            break;
                        }
                    }
                }
            });
        }
    })
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_frame_decodes() {
        let rec = LogRecord::new("s", "s@W@1", "INFO", "hello");
        let frame = encode(&rec).unwrap();
        assert_eq!(
            u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize,
            frame.len() - 4
        );
        let mut cursor = std::io::Cursor::new(frame);
        assert_eq!(read_record(&mut cursor).await.unwrap(), Some(rec));
        assert_eq!(read_record(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut cursor = std::io::Cursor::new(u32::MAX.to_be_bytes().to_vec());
        assert!(read_record(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_socket_and_channel_reach_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sim.log");
        let sink = LogSink::start("logsock-test", &log, true).await.unwrap();

        sink.sender()
            .send(LogRecord::new("s", "s@D@1", "INFO", "in-process"))
            .unwrap();
        let mut stream = UnixStream::connect(sink.socket_path().unwrap()).await.unwrap();
        let frame = encode(&LogRecord::new("s", "s@W@2", "WARNING", "over socket")).unwrap();
        stream.write_all(&frame).await.unwrap();
        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let socket = sink.socket_path().map(Path::to_path_buf).unwrap();
        sink.shutdown().await;
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("in-process"));
        assert!(text.contains("over socket"));
        assert!(!socket.exists());
    }
}
