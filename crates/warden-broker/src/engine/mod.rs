//! Session engine: connection setup, per-session event loops and teardown.
//!
//! One small fixed task group runs per session: a client read pump, the
//! event loop, and one to three protocol pumps. Every termination cause
//! funnels through the event loop's single race so exactly one teardown
//! path executes, and teardown always persists the final session state.

mod guacd;
mod ssh;

pub use guacd::GuacdConnector;
pub use ssh::SshConnector;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, SimplexStream, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant as TokioInstant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_core::constants::ADMIN_CLOSE_TIMEOUT;
use warden_core::error::{Error, Result};
use warden_core::guacd::{self as guacd_proto, FileTransfer, FileTransferManager};
use warden_core::transport::{
    ClientTransport, FRAME_DATA, FRAME_HEARTBEAT, FRAME_RESIZE, WindowSize,
};

use crate::config::BrokerConfig;
use crate::filter::{CLEAR_LINE, CommandFilter, RegexCommandFilter};
use crate::policy;
use crate::providers::{
    Account, Asset, CommandLog, Directory, Gateway, GatewayProxy, SessionStore,
};
use crate::recorder::{AsciinemaRecorder, Recorder};
use crate::session::{
    EnginePipes, OnlineSessions, Session, SessionReceivers, SessionRecord, SessionStatus,
    SessionType, ShareGrant, TargetPipes,
};

/// A request to broker a new live session.
pub struct ConnectRequest {
    pub session_type: SessionType,
    /// `scheme` or `scheme:port`.
    pub protocol: String,
    pub asset_id: i64,
    pub account_id: i64,
    pub client_ip: String,
    pub size: WindowSize,
    pub dpi: u32,
    pub share: Option<ShareGrant>,
    pub transport: Arc<dyn ClientTransport>,
}

/// Everything a protocol connector needs to bring a target online.
pub struct TargetContext {
    pub session: Arc<Session>,
    pub asset: Asset,
    pub account: Account,
    pub gateway: Option<Gateway>,
    /// Target-side pipe halves (the target's stdin source and stdout sink).
    pub pipes: TargetPipes,
    /// Resize events pushed by the engine.
    pub window_rx: mpsc::Receiver<WindowSize>,
    pub size: WindowSize,
    pub dpi: u32,
}

/// Dials a target and pumps its I/O for the lifetime of the session.
///
/// Implementations send `Ok(())` on the session's error channel exactly once,
/// at the moment the target is live; the spawning wrapper forwards any `Err`
/// return onto the same channel. Failures before that signal abort session
/// creation, failures after it terminate the session through the event loop.
#[async_trait::async_trait]
pub trait TargetConnector: Send + Sync {
    async fn run(&self, ctx: TargetContext) -> Result<()>;
}

/// The session broker: owns the registry, the transfer manager and the
/// collaborator handles, and drives every live session.
pub struct Broker {
    config: BrokerConfig,
    directory: Arc<dyn Directory>,
    proxy: Arc<dyn GatewayProxy>,
    store: Arc<dyn SessionStore>,
    command_log: Arc<dyn CommandLog>,
    registry: Arc<OnlineSessions>,
    transfers: Arc<FileTransferManager>,
    ssh_connector: Arc<dyn TargetConnector>,
    guacd_connector: Arc<dyn TargetConnector>,
    connector_override: Option<Arc<dyn TargetConnector>>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        directory: Arc<dyn Directory>,
        proxy: Arc<dyn GatewayProxy>,
        store: Arc<dyn SessionStore>,
        command_log: Arc<dyn CommandLog>,
    ) -> Self {
        let transfers = Arc::new(FileTransferManager::new());
        let ssh_connector: Arc<dyn TargetConnector> =
            Arc::new(SshConnector::new(Arc::clone(&proxy)));
        let guacd_connector: Arc<dyn TargetConnector> = Arc::new(GuacdConnector::new(
            config.clone(),
            Arc::clone(&proxy),
            Arc::clone(&transfers),
        ));
        Self {
            config,
            directory,
            proxy,
            store,
            command_log,
            registry: Arc::new(OnlineSessions::new()),
            transfers,
            ssh_connector,
            guacd_connector,
            connector_override: None,
        }
    }

    /// Replace both protocol connectors, e.g. with an in-memory target.
    pub fn with_connector(mut self, connector: Arc<dyn TargetConnector>) -> Self {
        self.connector_override = Some(connector);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<OnlineSessions> {
        &self.registry
    }

    pub fn transfers(&self) -> &Arc<FileTransferManager> {
        &self.transfers
    }

    /// Progress of a file transfer by id.
    pub async fn transfer_progress(&self, transfer_id: &str) -> Option<FileTransfer> {
        self.transfers.progress(transfer_id).await
    }

    /// Broker a new session: resolve the target, enforce the access window,
    /// bring the target online, register the session and start its engine.
    ///
    /// Setup failures return before the session is ever registered, so no
    /// teardown or persistence runs for sessions that never went live.
    pub async fn connect(self: &Arc<Self>, req: ConnectRequest) -> Result<Arc<Session>> {
        let (asset, account, gateway) =
            self.directory.get_aag(req.asset_id, req.account_id).await?;

        if !policy::check_time(&asset.access) {
            return Err(Error::AccessWindow);
        }

        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            session_type: req.session_type,
            protocol: req.protocol.clone(),
            asset_id: req.asset_id,
            account_id: req.account_id,
            gateway_id: asset.gateway_id,
            connection_id: String::new(),
            status: SessionStatus::Online,
            created_at: Utc::now(),
            closed_at: None,
            share: req.share.clone(),
            client_ip: req.client_ip.clone(),
        };
        let is_guacd = record.is_guacd();
        if !is_guacd && record.scheme() != "ssh" && self.connector_override.is_none() {
            return Err(Error::Protocol {
                message: format!("unsupported protocol {}", req.protocol),
            });
        }

        let (filter, recorder) = if is_guacd {
            (None, None)
        } else {
            let filter: Box<dyn CommandFilter> = Box::new(RegexCommandFilter::new(
                &record.session_id,
                &asset.commands,
                req.size,
                Arc::clone(&self.command_log),
            ));
            let recorder: Box<dyn Recorder> = Box::new(AsciinemaRecorder::new(
                &record.session_id,
                req.size,
                self.config.replay_dir.clone(),
            )?);
            (Some(filter), Some(recorder))
        };

        let session = Session::new(
            record,
            Arc::clone(&req.transport),
            self.config.idle_timeout,
            filter,
            recorder,
        );

        let mut receivers = session.chans.take_receivers();
        let engine_pipes = session.chans.take_engine_pipes();
        let ctx = TargetContext {
            session: Arc::clone(&session),
            asset,
            account,
            gateway,
            pipes: session.chans.take_target_pipes(),
            window_rx: session.chans.take_window_rx(),
            size: req.size,
            dpi: req.dpi,
        };

        let connector = self.connector_override.clone().unwrap_or_else(|| {
            if is_guacd {
                Arc::clone(&self.guacd_connector)
            } else {
                Arc::clone(&self.ssh_connector)
            }
        });
        {
            let err_tx = session.chans.err_tx.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = connector.run(ctx).await {
                    let _ = err_tx.send(Err(e)).await;
                }
            });
            session.add_task(task).await;
        }

        // Gate on "target connected": the first message on the error channel.
        match receivers.err_rx.recv().await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!(session_id = %session.id(), error = %e, "Failed to connect target");
                session.abort_tasks().await;
                return Err(e);
            }
            None => {
                session.abort_tasks().await;
                return Err(Error::ConnectionClosed);
            }
        }

        self.registry.insert(Arc::clone(&session)).await;
        if let Err(e) = self.store.upsert(&session.record().await).await {
            warn!(session_id = %session.id(), error = %e, "Failed to persist online session");
        }
        info!(
            session_id = %session.id(),
            protocol = %req.protocol,
            client_ip = %req.client_ip,
            "Session online"
        );

        // Client read pump.
        {
            let sess = Arc::clone(&session);
            let task = tokio::spawn(async move { pump_client_frames(sess).await });
            session.add_task(task).await;
        }

        let EnginePipes { input, output } = engine_pipes;
        if !is_guacd {
            let sess = Arc::clone(&session);
            let task = tokio::spawn(async move { pump_runes(sess, output).await });
            session.add_task(task).await;
        }

        // Event loop; runs teardown itself, so it is not tracked in the
        // abortable task list.
        {
            let broker = Arc::clone(self);
            let sess = Arc::clone(&session);
            tokio::spawn(async move {
                let result = if is_guacd {
                    guacd_loop(&broker, &sess, &mut receivers).await
                } else {
                    terminal_loop(&broker, &sess, &mut receivers, input).await
                };
                teardown(&broker, &sess, result).await;
            });
        }

        Ok(session)
    }

    /// Administratively close a session, naming the closer.
    pub async fn close_session(&self, session_id: &str, closer: &str) -> Result<()> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        info!(session_id, closer, "Admin close requested");
        let _ = tokio::time::timeout(
            ADMIN_CLOSE_TIMEOUT,
            session.chans.close_tx.send(closer.to_string()),
        )
        .await;
        Ok(())
    }

    /// Attach a read-only viewer to a live session. Returns the monitor key.
    pub async fn attach_monitor(
        self: &Arc<Self>,
        session_id: &str,
        viewer: Arc<dyn ClientTransport>,
        size: WindowSize,
        dpi: u32,
    ) -> Result<String> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let key = Uuid::new_v4().to_string();
        if session.is_guacd() {
            guacd::attach_observer(self, &session, viewer, size, dpi).await?;
        } else {
            session.monitors.attach(&key, Arc::clone(&viewer)).await;

            // Viewer input is discarded; its read pump only detects
            // disconnects so the viewer can be dropped from the set.
            let sess = Arc::clone(&session);
            let viewer_key = key.clone();
            let task = tokio::spawn(async move {
                let mut away = sess.chans.away_rx();
                loop {
                    tokio::select! {
                        _ = away.changed() => return,
                        frame = viewer.recv() => {
                            if frame.is_err() {
                                sess.monitors.detach(&viewer_key).await;
                                return;
                            }
                        }
                    }
                }
            });
            session.add_task(task).await;
        }

        debug!(session_id, key = %key, "Monitor attached to session");
        Ok(key)
    }

    /// Detach a viewer previously attached with [`Broker::attach_monitor`].
    pub async fn detach_monitor(&self, session_id: &str, key: &str) {
        if let Some(session) = self.registry.get(session_id).await {
            session.monitors.detach(key).await;
        }
    }
}

// =============================================================================
// Pumps
// =============================================================================

/// Relay client frames onto the input channel, touching the idle tracker on
/// qualifying activity.
async fn pump_client_frames(session: Arc<Session>) {
    let transport = Arc::clone(session.transport());
    let mut cancel = session.cancelled();
    let mut away = session.chans.away_rx();

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            _ = away.changed() => return,
            frame = transport.recv() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(_) => {
                        let _ = session
                            .chans
                            .err_tx
                            .send(Err(Error::ConnectionClosed))
                            .await;
                        return;
                    }
                };
                if frame.is_empty() {
                    continue;
                }

                let qualifies = match (session.session_type(), session.is_guacd()) {
                    // Guacd sessions stay alive only on real user input.
                    (SessionType::Web, true) => guacd_proto::is_active(&frame),
                    (SessionType::Web, false) => frame[0] != FRAME_HEARTBEAT,
                    (SessionType::Cli, _) => true,
                };
                if qualifies {
                    session.idle.touch();
                }

                if session.chans.in_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Re-publish raw target output as whole UTF-8 scalars on the output
/// channel. Partial multi-byte sequences are buffered until complete;
/// invalid bytes are dropped.
async fn pump_runes(session: Arc<Session>, mut output: ReadHalf<SimplexStream>) {
    let out_tx = session.chans.out_tx.clone();
    let mut cancel = session.cancelled();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            read = output.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);

                let mut start = 0usize;
                loop {
                    match std::str::from_utf8(&pending[start..]) {
                        Ok(chunk) => {
                            if !send_runes(chunk, &out_tx).await {
                                return;
                            }
                            start = pending.len();
                            break;
                        }
                        Err(e) => {
                            let valid = e.valid_up_to();
                            if valid > 0 {
                                let chunk =
                                    std::str::from_utf8(&pending[start..start + valid])
                                        .expect("validated prefix");
                                if !send_runes(chunk, &out_tx).await {
                                    return;
                                }
                                start += valid;
                            }
                            match e.error_len() {
                                // Invalid sequence: drop it and continue.
                                Some(len) => start += len,
                                // Incomplete tail: wait for more bytes.
                                None => break,
                            }
                        }
                    }
                }
                pending.drain(..start);
            }
        }
    }
}

async fn send_runes(chunk: &str, out_tx: &mpsc::Sender<Bytes>) -> bool {
    let mut scratch = [0u8; 4];
    for ch in chunk.chars() {
        let encoded = ch.encode_utf8(&mut scratch);
        if out_tx
            .send(Bytes::copy_from_slice(encoded.as_bytes()))
            .await
            .is_err()
        {
            return false;
        }
    }
    true
}

// =============================================================================
// Event loops
// =============================================================================

/// The terminal (SSH-family) event loop.
async fn terminal_loop(
    broker: &Arc<Broker>,
    session: &Arc<Session>,
    rx: &mut SessionReceivers,
    mut input: WriteHalf<SimplexStream>,
) -> Result<()> {
    let config = broker.config();
    let transport = Arc::clone(session.transport());
    let mut cancel = session.cancelled();
    let mut away = session.chans.away_rx();

    let mut flush = tokio::time::interval_at(
        TokioInstant::now() + config.flush_interval,
        config.flush_interval,
    );
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive = tokio::time::interval_at(
        TokioInstant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut access = tokio::time::interval_at(
        TokioInstant::now() + config.access_recheck_interval,
        config.access_recheck_interval,
    );
    access.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let idle = tokio::time::sleep_until(TokioInstant::from_std(session.idle.deadline()));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                let _ = flush_output(session).await;
                return Ok(());
            }
            _ = away.changed() => return Ok(()),
            _ = &mut idle => {
                if session.idle.expired() {
                    let err = Error::IdleTimeout {
                        seconds: config.idle_timeout.as_secs(),
                    };
                    write_err_msg(session, &err.to_string()).await;
                    return Err(err);
                }
                idle.as_mut()
                    .reset(TokioInstant::from_std(session.idle.deadline()));
            }
            _ = access.tick() => {
                if let Some(err) = recheck_access(broker, session).await {
                    write_err_msg(session, &err.to_string()).await;
                    return Err(err);
                }
            }
            Some(closer) = rx.close_rx.recv() => {
                let err = Error::AdminClose { closer };
                write_err_msg(session, &err.to_string()).await;
                info!(session_id = %session.id(), "Session closed by admin");
                return Err(err);
            }
            Some(result) = rx.err_rx.recv() => {
                if let Err(err) = result {
                    write_err_msg(session, &err.to_string()).await;
                    return Err(err);
                }
            }
            Some(frame) = rx.in_rx.recv() => {
                handle_terminal_input(session, &mut input, frame).await?;
            }
            Some(output) = rx.out_rx.recv() => {
                session.chans.out_buf.lock().await.extend_from_slice(&output);
                if let Some(filter) = &session.filter {
                    filter.lock().await.add_output(&output);
                }
            }
            _ = flush.tick() => {
                flush_output(session).await?;
            }
            _ = keepalive.tick() => {
                if session.session_type() == SessionType::Web
                    && transport.send(b"").await.is_err()
                {
                    return Err(Error::ConnectionClosed);
                }
            }
        }
    }
}

/// The guacd (RDP/VNC) event loop: no output batching, frames are already
/// chunked by the daemon.
async fn guacd_loop(
    broker: &Arc<Broker>,
    session: &Arc<Session>,
    rx: &mut SessionReceivers,
) -> Result<()> {
    let config = broker.config();
    let transport = Arc::clone(session.transport());
    let tunnel = session.guacd().await;
    let mut cancel = session.cancelled();
    let mut away = session.chans.away_rx();

    let mut access = tokio::time::interval_at(
        TokioInstant::now() + config.access_recheck_interval,
        config.access_recheck_interval,
    );
    access.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let idle = tokio::time::sleep_until(TokioInstant::from_std(session.idle.deadline()));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = cancel.changed() => return Ok(()),
            _ = away.changed() => return Ok(()),
            _ = &mut idle => {
                if session.idle.expired() {
                    let err = Error::IdleTimeout {
                        seconds: config.idle_timeout.as_secs(),
                    };
                    write_guacd_error(&transport, &err).await;
                    return Err(err);
                }
                idle.as_mut()
                    .reset(TokioInstant::from_std(session.idle.deadline()));
            }
            _ = access.tick() => {
                if let Some(err) = recheck_access(broker, session).await {
                    write_guacd_error(&transport, &err).await;
                    return Err(err);
                }
            }
            Some(closer) = rx.close_rx.recv() => {
                let err = Error::AdminClose { closer };
                write_guacd_error(&transport, &err).await;
                info!(session_id = %session.id(), "Session closed by admin");
                return Err(err);
            }
            Some(result) = rx.err_rx.recv() => {
                if let Err(err) = result {
                    write_guacd_error(&transport, &err).await;
                    return Err(err);
                }
            }
            Some(frame) = rx.in_rx.recv() => {
                // Input goes to the daemon verbatim.
                if let Some(tunnel) = &tunnel {
                    tunnel.write(&frame).await?;
                }
            }
            Some(frame) = rx.out_rx.recv() => {
                if transport.send(&frame).await.is_err() {
                    return Err(Error::ConnectionClosed);
                }
            }
        }
    }
}

// =============================================================================
// Event-loop helpers
// =============================================================================

/// Re-evaluate the access window and any share bound. `None` means the
/// session may continue; a transient directory failure skips the tick.
async fn recheck_access(broker: &Arc<Broker>, session: &Arc<Session>) -> Option<Error> {
    let record = session.record().await;
    let asset = match broker.directory.get_asset(record.asset_id).await {
        Ok(asset) => asset,
        Err(e) => {
            debug!(session_id = %session.id(), error = %e, "Access recheck skipped");
            return None;
        }
    };

    let share_ok = record
        .share
        .as_ref()
        .map(|grant| Utc::now() < grant.expires_at)
        .unwrap_or(true);

    if policy::check_time(&asset.access) && share_ok {
        None
    } else {
        Some(Error::AccessWindow)
    }
}

/// Untag a client frame, run it through the command filter and forward the
/// accepted bytes to the target's input pipe.
async fn handle_terminal_input(
    session: &Arc<Session>,
    input: &mut WriteHalf<SimplexStream>,
    frame: Bytes,
) -> Result<()> {
    let data = if session.session_type() == SessionType::Web {
        match frame.first().copied() {
            None => return Ok(()),
            Some(FRAME_DATA) => frame.slice(1..),
            Some(FRAME_HEARTBEAT) => return Ok(()),
            Some(FRAME_RESIZE) => {
                if let Some(size) = WindowSize::parse(&frame[1..]) {
                    let _ = session.chans.window_tx.send(size).await;
                }
                return Ok(());
            }
            Some(_) => frame,
        }
    } else {
        frame
    };

    if let Some(filter) = &session.filter {
        let verdict = filter.lock().await.add_input(&data);
        if verdict.forbidden {
            let name = verdict.matched.unwrap_or_default();
            write_err_msg(session, &format!("{name} is forbidden")).await;
            // Clear the pending line on both the filter and the target so
            // the command never executes.
            filter.lock().await.add_input(CLEAR_LINE);
            input.write_all(CLEAR_LINE).await?;
            return Ok(());
        }
    }

    input.write_all(&data).await?;
    Ok(())
}

/// Flush the output buffer: client transport, recorder, monitors, reset.
/// Empty buffers flush nothing (keep-alives are a separate tick).
async fn flush_output(session: &Arc<Session>) -> Result<()> {
    let out = {
        let mut buf = session.chans.out_buf.lock().await;
        if buf.is_empty() {
            return Ok(());
        }
        buf.split().freeze()
    };

    if session.transport().send(&out).await.is_err() {
        return Err(Error::ConnectionClosed);
    }
    if let Some(recorder) = &session.recorder {
        recorder.lock().await.write(&out);
    }
    session.monitors.broadcast(&out).await;
    Ok(())
}

/// Write a red error line to the client (and recorder/monitors via flush).
async fn write_err_msg(session: &Arc<Session>, message: &str) {
    let styled = format!("\r\n \x1b[31m {message} \x1b[0m");
    session
        .chans
        .out_buf
        .lock()
        .await
        .extend_from_slice(styled.as_bytes());
    let _ = flush_output(session).await;
}

/// Write an `error` instruction to a guacd client.
async fn write_guacd_error(transport: &Arc<dyn ClientTransport>, err: &Error) {
    let notice = guacd_proto::Instruction::new(
        guacd_proto::opcodes::ERROR,
        vec![err.to_string()],
    );
    let _ = transport.send(&notice.bytes()).await;
}

// =============================================================================
// Teardown
// =============================================================================

/// The single teardown funnel. Guarded so concurrent termination causes
/// execute it exactly once; always persists the final session state.
async fn teardown(broker: &Arc<Broker>, session: &Arc<Session>, result: Result<()>) {
    if session.finished.swap(true, Ordering::SeqCst) {
        return;
    }
    let cause = result.err();
    debug!(session_id = %session.id(), cause = ?cause, "Tearing down session");

    let _ = flush_output(session).await;

    if let Some(recorder) = &session.recorder {
        if let Err(e) = recorder.lock().await.close() {
            error!(session_id = %session.id(), error = %e, "Failed to save replay");
        }
    }
    if let Some(filter) = &session.filter {
        filter.lock().await.write_db();
    }

    if let Some(tunnel) = session.guacd().await {
        tunnel.disconnect().await;
    }
    broker.proxy.close(session.id()).await;

    // Persist the terminal transition, then drop from the registry.
    let snapshot = session.mark_offline().await;
    if let Err(e) = broker.store.upsert(&snapshot).await {
        error!(session_id = %session.id(), error = %e, "Failed to persist offline session");
    }

    session
        .monitors
        .close_all(&format!("session {} ended", session.id()))
        .await;
    broker.registry.remove(session.id()).await;

    session.transport().close().await;
    session.chans.signal_away();
    session.cancel();
    session.abort_tasks().await;
    session.finish(cause).await;

    info!(session_id = %session.id(), "Session offline");
}
