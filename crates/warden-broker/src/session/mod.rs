//! Session model: the channel bundle, the session record and the live
//! session object.

mod monitor;
mod registry;

pub use monitor::Monitors;
pub use registry::OnlineSessions;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{ReadHalf, SimplexStream, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;

use warden_core::constants::{CHANNEL_DEPTH, PIPE_CAPACITY};
use warden_core::error::{Error, Result};
use warden_core::guacd::GuacdTunnel;
use warden_core::transport::{ClientTransport, WindowSize};

use crate::filter::CommandFilter;
use crate::recorder::Recorder;

/// How the client reached the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Browser over WebSocket; frames carry a tag byte.
    Web,
    /// CLI through the embedded SSH server; frames are raw bytes.
    Cli,
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Online,
    Offline,
}

/// A bounded-access share grant attached to a session.
#[derive(Debug, Clone, Serialize)]
pub struct ShareGrant {
    pub share_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// The persisted attributes of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub session_type: SessionType,
    /// `scheme` or `scheme:port`.
    pub protocol: String,
    pub asset_id: i64,
    pub account_id: i64,
    pub gateway_id: Option<i64>,
    /// Guacd-assigned; empty for SSH sessions.
    pub connection_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, on the terminal transition.
    pub closed_at: Option<DateTime<Utc>>,
    pub share: Option<ShareGrant>,
    pub client_ip: String,
}

impl SessionRecord {
    /// Protocol scheme without any port suffix.
    pub fn scheme(&self) -> &str {
        self.protocol.split(':').next().unwrap_or(&self.protocol)
    }

    /// Whether this protocol rides a guacd tunnel.
    pub fn is_guacd(&self) -> bool {
        matches!(self.scheme(), "rdp" | "vnc")
    }
}

/// Receivers of the channel bundle, taken once by the event loop.
pub struct SessionReceivers {
    pub in_rx: mpsc::Receiver<Bytes>,
    pub out_rx: mpsc::Receiver<Bytes>,
    pub err_rx: mpsc::Receiver<Result<()>>,
    pub close_rx: mpsc::Receiver<String>,
}

/// Target-facing pipe halves, taken once by the protocol connector.
pub struct TargetPipes {
    /// The target session's stdin: reads what the engine forwarded.
    pub stdin: ReadHalf<SimplexStream>,
    /// The target session's stdout/stderr sink.
    pub stdout: WriteHalf<SimplexStream>,
}

/// Engine-facing pipe halves.
pub struct EnginePipes {
    /// Engine writes accepted input here; the target's stdin reads it.
    pub input: WriteHalf<SimplexStream>,
    /// Engine reads raw target output here, for rune-safe re-publishing.
    pub output: ReadHalf<SimplexStream>,
}

/// The fixed set of typed channels and pipes wiring one session together.
pub struct SessionChans {
    pub in_tx: mpsc::Sender<Bytes>,
    pub out_tx: mpsc::Sender<Bytes>,
    /// First-error-wins; a single `Ok` signals "target connected".
    pub err_tx: mpsc::Sender<Result<()>>,
    /// Admin-close reason.
    pub close_tx: mpsc::Sender<String>,
    /// Terminal resize events toward the target.
    pub window_tx: mpsc::Sender<WindowSize>,
    /// Output accumulator, flushed then reset by the engine.
    pub out_buf: AsyncMutex<BytesMut>,
    away_tx: watch::Sender<bool>,
    away_signalled: AtomicBool,
    receivers: std::sync::Mutex<Option<SessionReceivers>>,
    window_rx: std::sync::Mutex<Option<mpsc::Receiver<WindowSize>>>,
    engine_pipes: std::sync::Mutex<Option<EnginePipes>>,
    target_pipes: std::sync::Mutex<Option<TargetPipes>>,
}

impl SessionChans {
    pub fn new() -> Arc<Self> {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (window_tx, window_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (away_tx, _) = watch::channel(false);

        let (stdin_read, input_write) = tokio::io::simplex(PIPE_CAPACITY);
        let (output_read, stdout_write) = tokio::io::simplex(PIPE_CAPACITY);

        Arc::new(Self {
            in_tx,
            out_tx,
            err_tx,
            close_tx,
            window_tx,
            out_buf: AsyncMutex::new(BytesMut::new()),
            away_tx,
            away_signalled: AtomicBool::new(false),
            receivers: std::sync::Mutex::new(Some(SessionReceivers {
                in_rx,
                out_rx,
                err_rx,
                close_rx,
            })),
            window_rx: std::sync::Mutex::new(Some(window_rx)),
            engine_pipes: std::sync::Mutex::new(Some(EnginePipes {
                input: input_write,
                output: output_read,
            })),
            target_pipes: std::sync::Mutex::new(Some(TargetPipes {
                stdin: stdin_read,
                stdout: stdout_write,
            })),
        })
    }

    /// Signal teardown. Transitions open -> closed exactly once no matter
    /// how many tasks race to call it.
    pub fn signal_away(&self) {
        if !self.away_signalled.swap(true, Ordering::SeqCst) {
            let _ = self.away_tx.send(true);
        }
    }

    /// Whether teardown has been signalled.
    pub fn is_away(&self) -> bool {
        self.away_signalled.load(Ordering::SeqCst)
    }

    /// Subscribe to the teardown signal.
    pub fn away_rx(&self) -> watch::Receiver<bool> {
        self.away_tx.subscribe()
    }

    /// Take the event-loop receivers. Panics if taken twice.
    pub fn take_receivers(&self) -> SessionReceivers {
        self.receivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("session receivers already taken")
    }

    /// Take the resize receiver. Panics if taken twice.
    pub fn take_window_rx(&self) -> mpsc::Receiver<WindowSize> {
        self.window_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("window receiver already taken")
    }

    /// Take the engine pipe halves. Panics if taken twice.
    pub fn take_engine_pipes(&self) -> EnginePipes {
        self.engine_pipes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("engine pipes already taken")
    }

    /// Take the target pipe halves. Panics if taken twice.
    pub fn take_target_pipes(&self) -> TargetPipes {
        self.target_pipes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("target pipes already taken")
    }
}

/// Tracks the last qualifying client activity against the idle timeout.
pub struct IdleTracker {
    last: std::sync::Mutex<Instant>,
    timeout: Duration,
}

impl IdleTracker {
    fn new(timeout: Duration) -> Self {
        Self {
            last: std::sync::Mutex::new(Instant::now()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record qualifying activity.
    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// When the idle timer would fire if no further activity arrives.
    pub fn deadline(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) + self.timeout
    }

    /// Whether the timeout has elapsed.
    pub fn expired(&self) -> bool {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            >= self.timeout
    }
}

/// One live remote-access session.
pub struct Session {
    session_id: String,
    session_type: SessionType,
    guacd_protocol: bool,
    record: AsyncMutex<SessionRecord>,
    pub chans: Arc<SessionChans>,
    pub monitors: Monitors,
    pub idle: IdleTracker,
    transport: Arc<dyn ClientTransport>,
    pub(crate) filter: Option<AsyncMutex<Box<dyn CommandFilter>>>,
    pub(crate) recorder: Option<AsyncMutex<Box<dyn Recorder>>>,
    guacd: AsyncMutex<Option<Arc<GuacdTunnel>>>,
    cancel_tx: watch::Sender<bool>,
    pub(crate) finished: AtomicBool,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    done_tx: watch::Sender<bool>,
    result: AsyncMutex<Option<Arc<Error>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("session_type", &self.session_type)
            .field("guacd_protocol", &self.guacd_protocol)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        record: SessionRecord,
        transport: Arc<dyn ClientTransport>,
        idle_timeout: Duration,
        filter: Option<Box<dyn CommandFilter>>,
        recorder: Option<Box<dyn Recorder>>,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            session_id: record.session_id.clone(),
            session_type: record.session_type,
            guacd_protocol: record.is_guacd(),
            record: AsyncMutex::new(record),
            chans: SessionChans::new(),
            monitors: Monitors::new(),
            idle: IdleTracker::new(idle_timeout),
            transport,
            filter: filter.map(AsyncMutex::new),
            recorder: recorder.map(AsyncMutex::new),
            guacd: AsyncMutex::new(None),
            cancel_tx,
            finished: AtomicBool::new(false),
            tasks: AsyncMutex::new(Vec::new()),
            done_tx,
            result: AsyncMutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn is_guacd(&self) -> bool {
        self.guacd_protocol
    }

    pub fn transport(&self) -> &Arc<dyn ClientTransport> {
        &self.transport
    }

    /// Snapshot of the persisted record.
    pub async fn record(&self) -> SessionRecord {
        self.record.lock().await.clone()
    }

    pub(crate) async fn set_connection_id(&self, connection_id: &str) {
        self.record.lock().await.connection_id = connection_id.to_string();
    }

    pub async fn connection_id(&self) -> String {
        self.record.lock().await.connection_id.clone()
    }

    pub(crate) async fn set_guacd(&self, tunnel: Arc<GuacdTunnel>) {
        *self.guacd.lock().await = Some(tunnel);
    }

    pub(crate) async fn guacd(&self) -> Option<Arc<GuacdTunnel>> {
        self.guacd.lock().await.clone()
    }

    /// Flip the record to Offline and stamp `closed_at`. Returns the
    /// snapshot to persist.
    pub(crate) async fn mark_offline(&self) -> SessionRecord {
        let mut record = self.record.lock().await;
        record.status = SessionStatus::Offline;
        if record.closed_at.is_none() {
            record.closed_at = Some(Utc::now());
        }
        record.clone()
    }

    /// The authoritative stop signal for all session tasks.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) async fn add_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    pub(crate) async fn abort_tasks(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    pub(crate) async fn finish(&self, cause: Option<Error>) {
        *self.result.lock().await = cause.map(Arc::new);
        let _ = self.done_tx.send(true);
    }

    /// Wait for teardown to complete; returns the terminal cause, `None`
    /// for a normal end.
    pub async fn wait(&self) -> Option<Arc<Error>> {
        let mut done = self.done_tx.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.result.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            session_id: "sess-1".into(),
            session_type: SessionType::Web,
            protocol: "ssh".into(),
            asset_id: 1,
            account_id: 1,
            gateway_id: None,
            connection_id: String::new(),
            status: SessionStatus::Online,
            created_at: Utc::now(),
            closed_at: None,
            share: None,
            client_ip: "127.0.0.1".into(),
        }
    }

    #[test]
    fn scheme_strips_port() {
        let mut r = record();
        r.protocol = "rdp:3390".into();
        assert_eq!(r.scheme(), "rdp");
        assert!(r.is_guacd());

        r.protocol = "ssh".into();
        assert_eq!(r.scheme(), "ssh");
        assert!(!r.is_guacd());
    }

    #[tokio::test]
    async fn away_signal_is_one_shot() {
        let chans = SessionChans::new();
        let mut rx = chans.away_rx();
        assert!(!*rx.borrow());

        chans.signal_away();
        chans.signal_away();
        chans.signal_away();

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(chans.is_away());
    }

    #[tokio::test]
    async fn receivers_and_pipes_are_taken_once() {
        let chans = SessionChans::new();
        let _rx = chans.take_receivers();
        let _win = chans.take_window_rx();
        let _engine = chans.take_engine_pipes();
        let _target = chans.take_target_pipes();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            chans.take_receivers();
        }));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pipes_connect_engine_to_target() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let chans = SessionChans::new();
        let mut engine = chans.take_engine_pipes();
        let mut target = chans.take_target_pipes();

        engine.input.write_all(b"ls\r").await.unwrap();
        let mut buf = [0u8; 8];
        let n = target.stdin.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ls\r");

        target.stdout.write_all(b"file.txt").await.unwrap();
        let n = engine.output.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"file.txt");
    }

    #[tokio::test]
    async fn idle_tracker_deadline_moves_with_touch() {
        let idle = IdleTracker::new(Duration::from_millis(50));
        assert!(!idle.expired());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(idle.expired());

        idle.touch();
        assert!(!idle.expired());
        assert!(idle.deadline() > Instant::now());
    }
}
