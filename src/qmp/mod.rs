//! QMP monitor engine over an emulator's standard streams.
//!
//! [`handshake`] consumes the greeting and negotiates capabilities, then
//! splits the connection into a clonable [`QmpMonitor`] for sending requests
//! from any task and a single [`QmpEventLoop`] that owns the reader. The loop
//! resolves pending requests by id and publishes everything else as events.
//! It returns when the stream closes, which is how the caller learns the
//! emulator has gone away.

pub mod message;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{broadcast, oneshot};

pub use message::{Greeting, QmpEvent, VncInfo};
use message::{Incoming, Request};

/// How long a request waits for its response by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum QmpError {
    #[error("monitor i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode request: {0}")]
    Json(#[from] serde_json::Error),

    #[error("monitor connection closed")]
    Closed,

    #[error("monitor handshake failed: {0}")]
    Handshake(String),

    #[error("emulator request '{command}' timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("emulator error: {0}")]
    Remote(String),
}

type Reply = Result<Value, QmpError>;

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<String, oneshot::Sender<Reply>>,
    closed: bool,
}

type Pending = Arc<Mutex<PendingTable>>;
type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Request side of a monitor connection. Cheap to clone; safe to use from any task.
#[derive(Clone)]
pub struct QmpMonitor {
    writer: Arc<tokio::sync::Mutex<BoxWriter>>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
    events_tx: broadcast::Sender<QmpEvent>,
    greeting: Arc<Greeting>,
    enabled: Arc<Vec<String>>,
}

impl std::fmt::Debug for QmpMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmpMonitor")
            .field("pending", &self.pending_count())
            .field("timeout", &self.timeout)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Read side of a monitor connection. Exactly one exists per connection.
pub struct QmpEventLoop<R> {
    lines: Lines<BufReader<R>>,
    pending: Pending,
    events_tx: broadcast::Sender<QmpEvent>,
}

impl<R> std::fmt::Debug for QmpEventLoop<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmpEventLoop")
            .field("pending", &self.pending.lock().waiters.len())
            .finish_non_exhaustive()
    }
}

/// Removes a request's waiter however its caller stops waiting.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().waiters.remove(&self.id);
    }
}

/// Wait for the greeting, negotiate capabilities and split the connection.
///
/// Lines that are not JSON objects are skipped, both here and in the event
/// loop, since the emulator interleaves diagnostics with protocol traffic.
pub async fn handshake<R, W>(
    reader: R,
    writer: W,
    timeout: Duration,
) -> Result<(QmpMonitor, QmpEventLoop<R>), QmpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    let greeting = loop {
        let obj = read_object(&mut lines)
            .await?
            .ok_or_else(|| QmpError::Handshake("stream closed before greeting".into()))?;
        match Greeting::parse(&obj) {
            Some(greeting) => break greeting,
            None => tracing::debug!(%obj, "ignoring message before greeting"),
        }
    };

    let enabled = greeting.negotiate();
    tracing::debug!(offered = ?greeting.capabilities, ?enabled, "qmp greeting received");

    let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
    let pending: Pending = Arc::default();
    let monitor = QmpMonitor {
        writer: Arc::new(tokio::sync::Mutex::new(Box::pin(writer) as BoxWriter)),
        pending: pending.clone(),
        next_id: Arc::new(AtomicU64::new(0)),
        timeout,
        events_tx: events_tx.clone(),
        greeting: Arc::new(greeting),
        enabled: Arc::new(enabled),
    };

    // The reply to this carries no id and is observed as an event.
    let arguments = serde_json::json!({ "enable": monitor.enabled.as_slice() });
    monitor
        .send(&Request {
            execute: "qmp_capabilities",
            arguments: Some(&arguments),
            id: None,
        })
        .await?;

    let event_loop = QmpEventLoop {
        lines,
        pending,
        events_tx,
    };
    Ok((monitor, event_loop))
}

impl QmpMonitor {
    /// The greeting received from the emulator.
    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Capabilities enabled during negotiation.
    pub fn enabled_capabilities(&self) -> &[String] {
        &self.enabled
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    /// Subscribe to unsolicited messages.
    pub fn subscribe(&self) -> broadcast::Receiver<QmpEvent> {
        self.events_tx.subscribe()
    }

    /// Run a command and wait for its `return` payload.
    ///
    /// Fails with [`QmpError::Timeout`] if no response arrives within the
    /// monitor timeout; a response that shows up later is logged and dropped.
    /// The request's pending entry is removed on every exit, including when
    /// the returned future is dropped early.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, QmpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(QmpError::Closed);
            }
            pending.waiters.insert(id.clone(), tx);
        }
        let _entry = PendingEntry {
            pending: &self.pending,
            id: id.clone(),
        };

        let request = Request {
            execute: command,
            arguments: arguments.as_ref(),
            id: Some(&id),
        };
        self.send(&request).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(QmpError::Closed),
            Err(_) => {
                tracing::warn!(command, id = %id, "qmp request timed out");
                Err(QmpError::Timeout {
                    command: command.to_string(),
                    after: self.timeout,
                })
            }
        }
    }

    /// Ask where the remote display is listening.
    pub async fn query_vnc(&self) -> Result<VncInfo, QmpError> {
        let ret = self.execute("query-vnc", None).await?;
        Ok(VncInfo::from_return(&ret))
    }

    async fn send(&self, request: &Request<'_>) -> Result<(), QmpError> {
        let mut line = serde_json::to_string(request)?;
        tracing::debug!(line = %line, "qmp send");
        line.push_str("\r\n");

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl<R> QmpEventLoop<R>
where
    R: AsyncRead + Unpin,
{
    /// Read until the stream closes or fails.
    ///
    /// On exit (or if this future is dropped) every request still waiting
    /// fails with [`QmpError::Closed`] and later requests are refused
    /// immediately.
    pub async fn run(mut self) -> Result<(), QmpError> {
        loop {
            match read_object(&mut self.lines).await {
                Ok(Some(obj)) => self.dispatch(obj),
                Ok(None) => return Ok(()),
                Err(e) => return Err(QmpError::Io(e)),
            }
        }
    }

    fn dispatch(&self, obj: Value) {
        match Incoming::classify(obj) {
            Incoming::Event(event) => {
                tracing::debug!(event = ?event.name, raw = %event.raw, "qmp event");
                // No subscribers is fine.
                let _ = self.events_tx.send(event);
            }
            Incoming::Response { id, result } => {
                let waiter = self.pending.lock().waiters.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(QmpError::Remote));
                    }
                    None => {
                        tracing::warn!(id = %id, "discarding qmp response nobody is waiting for");
                    }
                }
            }
        }
    }
}

impl<R> Drop for QmpEventLoop<R> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        pending.closed = true;
        let abandoned = pending.waiters.len();
        pending.waiters.clear();
        drop(pending);
        if abandoned > 0 {
            tracing::debug!(abandoned, "qmp loop ended with requests in flight");
        }
    }
}

/// Next line that parses as a JSON object, or `None` at end of stream.
async fn read_object<R>(lines: &mut Lines<BufReader<R>>) -> std::io::Result<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(obj @ Value::Object(_)) => return Ok(Some(obj)),
            Ok(_) => tracing::debug!(line, "skipping non-object json line"),
            Err(e) => tracing::debug!(line, error = %e, "skipping non-protocol line"),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, DuplexStream, ReadHalf, WriteHalf};

    /// The emulator end of an in-memory monitor connection.
    struct FakeEmulator {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeEmulator {
        async fn say(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn hear(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().expect("client closed");
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn connect(
        timeout: Duration,
    ) -> (QmpMonitor, QmpEventLoop<ReadHalf<DuplexStream>>, FakeEmulator) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut emu = FakeEmulator {
            lines: BufReader::new(server_r).lines(),
            writer: server_w,
        };
        emu.say("qemu-system-x86_64: warning: host doesn't support requested feature").await;
        emu.say(r#"{"QMP": {"version": {}, "capabilities": ["oob"]}}"#).await;

        let (monitor, event_loop) = handshake(client_r, client_w, timeout).await.unwrap();
        let caps = emu.hear().await;
        assert_eq!(caps["execute"], "qmp_capabilities");
        assert_eq!(caps["arguments"]["enable"], json!(["oob"]));
        assert!(caps.get("id").is_none());
        (monitor, event_loop, emu)
    }

    #[tokio::test]
    async fn handshake_skips_noise_and_enables_oob() {
        let (monitor, _loop, _emu) = connect(DEFAULT_TIMEOUT).await;
        assert_eq!(monitor.enabled_capabilities(), ["oob"]);
        assert_eq!(monitor.greeting().capabilities, vec!["oob"]);
    }

    #[tokio::test]
    async fn handshake_fails_when_stream_ends_first() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_r, client_w) = tokio::io::split(client);
        drop(server);
        let err = handshake(client_r, client_w, DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, QmpError::Handshake(_)));
    }

    #[tokio::test]
    async fn request_is_resolved_by_matching_id() {
        let (monitor, event_loop, mut emu) = connect(DEFAULT_TIMEOUT).await;
        let loop_task = tokio::spawn(event_loop.run());

        let m = monitor.clone();
        let request = tokio::spawn(async move { m.query_vnc().await });

        let req = emu.hear().await;
        assert_eq!(req["execute"], "query-vnc");
        assert_eq!(monitor.pending_count(), 1);

        let id = req["id"].as_str().unwrap().to_string();
        emu.say(&format!(
            r#"{{"return": {{"enabled": true, "family": "ipv4", "host": "127.0.0.1", "service": "5900"}}, "id": "{id}"}}"#
        ))
        .await;

        let info = request.await.unwrap().unwrap();
        assert_eq!(info.port, 5900);
        assert_eq!(monitor.pending_count(), 0);

        drop(emu);
        loop_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn error_response_carries_description() {
        let (monitor, event_loop, mut emu) = connect(DEFAULT_TIMEOUT).await;
        tokio::spawn(event_loop.run());

        let m = monitor.clone();
        let request = tokio::spawn(async move { m.execute("bogus", None).await });
        let req = emu.hear().await;
        emu.say(&format!(
            r#"{{"error": {{"class": "CommandNotFound", "desc": "The command bogus has not been found"}}, "id": {}}}"#,
            req["id"]
        ))
        .await;

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "emulator error: The command bogus has not been found");
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let (monitor, event_loop, mut emu) = connect(DEFAULT_TIMEOUT).await;
        tokio::spawn(event_loop.run());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let m = monitor.clone();
            let call = tokio::spawn(async move { m.execute("query-status", None).await });
            let req = emu.hear().await;
            let id = req["id"].as_str().unwrap().to_string();
            emu.say(&format!(r#"{{"return": {{}}, "id": "{id}"}}"#)).await;
            call.await.unwrap().unwrap();
            ids.push(id.parse::<u64>().unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn unknown_response_id_leaves_others_pending() {
        let (monitor, event_loop, mut emu) = connect(DEFAULT_TIMEOUT).await;
        tokio::spawn(event_loop.run());

        let m = monitor.clone();
        let request = tokio::spawn(async move { m.execute("query-status", None).await });
        let req = emu.hear().await;
        let id = req["id"].as_str().unwrap().to_string();

        emu.say(r#"{"return": {}, "id": "9999"}"#).await;
        emu.say("not json at all").await;
        emu.say(r#"{"event": "RESUME", "timestamp": {"seconds": 1}}"#).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.pending_count(), 1);
        assert!(!request.is_finished());

        emu.say(&format!(r#"{{"return": {{"status": "running"}}, "id": "{id}"}}"#)).await;
        let ret = request.await.unwrap().unwrap();
        assert_eq!(ret["status"], "running");
    }

    #[tokio::test]
    async fn events_are_published() {
        let (monitor, event_loop, mut emu) = connect(DEFAULT_TIMEOUT).await;
        let mut events = monitor.subscribe();
        tokio::spawn(event_loop.run());

        emu.say(r#"{"event": "SHUTDOWN", "data": {"guest": true}}"#).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.name.as_deref(), Some("SHUTDOWN"));
        assert_eq!(event.raw["data"]["guest"], true);
    }

    #[tokio::test]
    async fn timeout_orphans_only_the_expired_request() {
        let (monitor, event_loop, mut emu) = connect(Duration::from_millis(300)).await;
        tokio::spawn(event_loop.run());

        let m = monitor.clone();
        let first = tokio::spawn(async move { m.execute("query-status", None).await });
        let expired = emu.hear().await;

        // Issued part way through the first request's window, so it is still
        // waiting when the first one expires.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let m = monitor.clone();
        let second = tokio::spawn(async move { m.execute("query-name", None).await });
        let req = emu.hear().await;

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, QmpError::Timeout { .. }));
        assert_eq!(monitor.pending_count(), 1);
        assert!(!second.is_finished());

        // Late reply to the orphaned id is dropped without disturbing the other.
        emu.say(&format!(r#"{{"return": {{"late": true}}, "id": {}}}"#, expired["id"])).await;
        emu.say(&format!(r#"{{"return": {{"name": "vm"}}, "id": {}}}"#, req["id"])).await;
        assert_eq!(second.await.unwrap().unwrap()["name"], "vm");
        assert_eq!(monitor.pending_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_requests_leave_nothing_pending() {
        let (monitor, event_loop, mut emu) = connect(DEFAULT_TIMEOUT).await;
        tokio::spawn(event_loop.run());

        for _ in 0..5 {
            let gave_up = tokio::time::timeout(
                Duration::from_millis(20),
                monitor.execute("query-status", None),
            )
            .await;
            assert!(gave_up.is_err());
            let _ = emu.hear().await;
        }
        assert_eq!(monitor.pending_count(), 0);

        let m = monitor.clone();
        let aborted = tokio::spawn(async move { m.execute("query-vnc", None).await });
        let _ = emu.hear().await;
        assert_eq!(monitor.pending_count(), 1);
        aborted.abort();
        let _ = aborted.await;
        assert_eq!(monitor.pending_count(), 0);
    }

    #[tokio::test]
    async fn closing_stream_fails_in_flight_requests() {
        let (monitor, event_loop, mut emu) = connect(DEFAULT_TIMEOUT).await;
        let loop_task = tokio::spawn(event_loop.run());

        let m = monitor.clone();
        let request = tokio::spawn(async move { m.execute("query-status", None).await });
        let _ = emu.hear().await;
        drop(emu);

        loop_task.await.unwrap().unwrap();
        assert!(matches!(request.await.unwrap(), Err(QmpError::Closed)));
        assert!(matches!(
            monitor.execute("query-status", None).await,
            Err(QmpError::Closed)
        ));
    }
}
