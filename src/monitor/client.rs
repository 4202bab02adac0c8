//! QMP client over a Unix socket.

use super::Monitor;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use vmplug_qmp::{decode_line, encode_line, Command, ErrorInfo, Event, Greeting, Message};

/// Events buffered per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 64;

type Reply = std::result::Result<Value, ErrorInfo>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;
/// Event fan-out; emptied by the reader when the connection ends so
/// subscribers observe a closed stream.
type Events = Arc<Mutex<Option<broadcast::Sender<Event>>>>;

/// A connected QMP session.
///
/// A reader task routes replies to callers by request id and fans events
/// out to subscribers. Dropping the client stops the reader.
pub struct QmpClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    events: Events,
    next_id: AtomicU64,
    timeout: Duration,
    greeting: Greeting,
    reader: JoinHandle<()>,
}

fn gone(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::NotRunning(format!("monitor {}: {}", path.display(), e))
}

async fn next_message(lines: &mut Lines<BufReader<OwnedReadHalf>>, path: &Path) -> Result<Message> {
    let line = lines
        .next_line()
        .await
        .map_err(|e| gone(path, e))?
        .ok_or_else(|| gone(path, "connection closed"))?;
    decode_line(line.as_bytes()).map_err(|e| Error::Protocol(e.to_string()))
}

/// Read the greeting and leave negotiation mode.
async fn handshake(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    path: &Path,
) -> Result<Greeting> {
    let greeting = match next_message(lines, path).await? {
        Message::Greeting(g) => g,
        other => return Err(Error::Protocol(format!("expected greeting, got {:?}", other))),
    };

    let line = encode_line(&Command::new("qmp_capabilities").id(0))
        .map_err(|e| Error::Protocol(e.to_string()))?;
    writer.write_all(&line).await.map_err(|e| gone(path, e))?;

    loop {
        match next_message(lines, path).await? {
            Message::Return { .. } => return Ok(greeting),
            Message::Error { error, .. } => {
                return Err(Error::Monitor {
                    command: "qmp_capabilities".into(),
                    class: error.class,
                    desc: error.desc,
                })
            }
            _ => continue,
        }
    }
}

impl QmpClient {
    /// Connect, read the greeting and negotiate capabilities.
    ///
    /// An unreachable socket is reported as [`Error::NotRunning`].
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| gone(path, e))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = tokio::time::timeout(timeout, handshake(&mut lines, &mut write_half, path))
            .await
            .map_err(|_| Error::timeout("qmp handshake", timeout))??;

        tracing::debug!(
            socket = %path.display(),
            version = %greeting.version.qemu,
            "monitor connected"
        );

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        let events: Events = Arc::new(Mutex::new(Some(sender)));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            lines,
            pending.clone(),
            closed.clone(),
            events.clone(),
        ));

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            closed,
            events,
            next_id: AtomicU64::new(1),
            timeout,
            greeting,
            reader,
        })
    }

    /// Greeting the server sent on connect.
    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }
}

async fn read_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    events: Events,
) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "monitor read failed");
                break;
            }
        };
        let message = match decode_line(line.as_bytes()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "discarding monitor line");
                continue;
            }
        };
        let (id, reply) = match message {
            Message::Return { id, value } => (id, Ok(value)),
            Message::Error { id, error } => (id, Err(error)),
            Message::Event(event) => {
                // No subscribers is fine.
                if let Some(sender) = events.lock().as_ref() {
                    let _ = sender.send(event);
                }
                continue;
            }
            Message::Greeting(_) => continue,
        };
        let waiter = id.and_then(|id| pending.lock().remove(&id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::warn!(?id, "reply with no waiting command"),
        }
    }
    // Dropping the senders wakes every waiter with a closed channel.
    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
    events.lock().take();
}

#[async_trait]
impl Monitor for QmpClient {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut cmd = Command::new(command).id(id);
        if let Some(arguments) = arguments {
            cmd = cmd.arguments(arguments);
        }
        let line = encode_line(&cmd).map_err(|e| Error::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            return Err(Error::NotRunning("monitor connection closed".into()));
        }

        tracing::debug!(command, id, "monitor command");
        let written = self.writer.lock().await.write_all(&line).await;
        if let Err(e) = written {
            self.pending.lock().remove(&id);
            return Err(Error::NotRunning(format!("monitor write failed: {}", e)));
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::NotRunning("monitor connection closed".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(Error::timeout(command, self.timeout));
            }
        };

        reply.map_err(|error| Error::Monitor {
            command: command.to_string(),
            class: error.class,
            desc: error.desc,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        match self.events.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Already disconnected: hand out a stream that is closed.
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        }
    }
}

impl Drop for QmpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for QmpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmpClient")
            .field("version", &self.greeting.version.qemu)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixListener;

    const GREETING: &str =
        r#"{"QMP":{"version":{"qemu":{"major":8,"minor":2,"micro":0},"package":""},"capabilities":[]}}"#;

    /// Serve one client: greeting, capabilities, then `script` answers.
    async fn serve(listener: UnixListener, script: Vec<&'static str>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        write_half
            .write_all(format!("{}\n", GREETING).as_bytes())
            .await
            .unwrap();

        let caps = lines.next_line().await.unwrap().unwrap();
        assert!(caps.contains("qmp_capabilities"));
        write_half.write_all(b"{\"return\":{},\"id\":0}\n").await.unwrap();

        for answer in script {
            let request = lines.next_line().await.unwrap().unwrap();
            let request: Value = serde_json::from_str(&request).unwrap();
            let answer = answer.replace("$ID", &request["id"].to_string());
            write_half.write_all(answer.as_bytes()).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
        }
    }

    fn socket() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm1.qmp");
        (dir, path)
    }

    #[tokio::test]
    async fn test_missing_socket_is_not_running() {
        let (_dir, path) = socket();
        let err = QmpClient::connect(&path, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_not_running());
    }

    #[tokio::test]
    async fn test_execute_routes_reply_and_events() {
        let (_dir, path) = socket();
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve(
            listener,
            vec![
                r#"{"event":"DEVICE_DELETED","data":{"device":"blk_a","path":"/machine/peripheral/blk_a"}}
{"return":{"running":true,"status":"running"},"id":$ID}"#,
                r#"{"error":{"class":"DeviceNotFound","desc":"Device 'x' not found"},"id":$ID}"#,
            ],
        ));

        let client = QmpClient::connect(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.greeting().version.qemu.major, 8);
        let mut events = client.subscribe();

        let status = client.execute("query-status", None).await.unwrap();
        assert_eq!(status["status"], json!("running"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.event, "DEVICE_DELETED");

        let err = client
            .execute("device_del", Some(json!({"id": "x"})))
            .await
            .unwrap_err();
        assert!(err.is_monitor_class("DeviceNotFound"));
        assert!(err.to_string().starts_with("device_del failed"));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_running() {
        let (_dir, path) = socket();
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve(listener, vec![]));

        let client = QmpClient::connect(&path, Duration::from_secs(5)).await.unwrap();
        server.await.unwrap();

        let err = client.execute("query-status", None).await.unwrap_err();
        assert!(err.is_not_running());
    }

    #[tokio::test]
    async fn test_event_wait_ends_when_hypervisor_exits() {
        let (_dir, path) = socket();
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve(listener, vec![]));

        let client = QmpClient::connect(&path, Duration::from_secs(5)).await.unwrap();
        let mut early = client.subscribe();
        server.await.unwrap();

        let started = std::time::Instant::now();
        let err = crate::monitor::events::wait_for(
            &mut early,
            "device_del blk_a",
            Duration::from_secs(10),
            |_| false,
        )
        .await
        .unwrap_err();
        assert!(err.is_not_running(), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));

        let mut late = client.subscribe();
        let err = crate::monitor::events::wait_for(
            &mut late,
            "device_del blk_a",
            Duration::from_secs(10),
            |_| false,
        )
        .await
        .unwrap_err();
        assert!(err.is_not_running(), "{:?}", err);
    }
}
