//! Guacd target path and observer tunnels.
//!
//! A primary tunnel drives the RDP/VNC session: the connector negotiates the
//! handshake with the full connection configuration, records the assigned
//! connection id on the session and pumps daemon frames onto the output
//! channel. Observers are separate read-only tunnels joined to the same
//! connection id on behalf of monitoring viewers.

use std::sync::Arc;

use tracing::{debug, warn};

use warden_core::error::{Error, Result};
use warden_core::guacd::{
    FileTransferManager, GuacdTunnel, Instruction, ObserverParams, PrimaryParams, TunnelParams,
    opcodes,
};
use warden_core::transport::{ClientTransport, WindowSize};

use crate::config::BrokerConfig;
use crate::providers::{AccountSecret, GatewayProxy};
use crate::session::Session;

use super::{Broker, TargetConnector, TargetContext};

/// Connects RDP/VNC sessions through guacd.
pub struct GuacdConnector {
    config: BrokerConfig,
    proxy: Arc<dyn GatewayProxy>,
    transfers: Arc<FileTransferManager>,
}

impl GuacdConnector {
    pub fn new(
        config: BrokerConfig,
        proxy: Arc<dyn GatewayProxy>,
        transfers: Arc<FileTransferManager>,
    ) -> Self {
        Self {
            config,
            proxy,
            transfers,
        }
    }
}

#[async_trait::async_trait]
impl TargetConnector for GuacdConnector {
    async fn run(&self, ctx: TargetContext) -> Result<()> {
        let TargetContext {
            session,
            asset,
            account,
            gateway,
            pipes,
            window_rx,
            size,
            dpi,
        } = ctx;
        // Guacd sessions carry resizes and all I/O inside the instruction
        // stream; the terminal pipes stay unused.
        drop(pipes);
        drop(window_rx);

        let record = session.record().await;
        let scheme = record.scheme().to_string();
        let (host, port) = self
            .proxy
            .open(session.id(), &scheme, &asset, gateway.as_ref())
            .await?;

        let drive_path = if asset.allow_upload || asset.allow_download {
            Some(self.config.drive_root.join(format!("asset_{}", asset.id)))
        } else {
            None
        };

        let params = TunnelParams::Primary(PrimaryParams {
            scheme,
            hostname: host,
            port,
            username: account.username.clone(),
            password: match &account.secret {
                AccountSecret::Password(password) => password.clone(),
                AccountSecret::PrivateKey { .. } => String::new(),
            },
            width: size.width,
            height: size.height,
            dpi,
            recording_name: session.id().to_string(),
            allow_copy: asset.allow_copy,
            allow_paste: asset.allow_paste,
            allow_upload: asset.allow_upload,
            allow_download: asset.allow_download,
            drive_path: drive_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        });

        let tunnel = Arc::new(
            GuacdTunnel::connect(
                &self.config.guacd_host,
                self.config.guacd_port,
                session.id(),
                params,
                Arc::clone(&self.transfers),
                drive_path,
            )
            .await?,
        );

        session.set_connection_id(tunnel.connection_id()).await;
        session.set_guacd(Arc::clone(&tunnel)).await;
        debug!(
            session_id = %session.id(),
            connection_id = %tunnel.connection_id(),
            "Guacd target online"
        );

        // Target is live; unblock session setup.
        let _ = session.chans.err_tx.send(Ok(())).await;

        // Display pump: daemon frames onto the output channel.
        let out_tx = session.chans.out_tx.clone();
        let err_tx = session.chans.err_tx.clone();
        let mut cancel = session.cancelled();
        let pump_tunnel = Arc::clone(&tunnel);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.changed() => return,
                    frame = pump_tunnel.read() => match frame {
                        Ok(frame) => {
                            if frame.is_empty() {
                                continue;
                            }
                            if out_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = err_tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });
        session.add_task(task).await;

        Ok(())
    }
}

/// Join a read-only observer tunnel to a live guacd session and pump it
/// against the viewer transport until either side goes away.
pub(crate) async fn attach_observer(
    broker: &Arc<Broker>,
    session: &Arc<Session>,
    viewer: Arc<dyn ClientTransport>,
    size: WindowSize,
    dpi: u32,
) -> Result<()> {
    let connection_id = session.connection_id().await;
    if connection_id.is_empty() {
        return Err(Error::Protocol {
            message: "session has no guacd connection id".into(),
        });
    }

    let params = TunnelParams::Observer(ObserverParams {
        connection_id,
        width: size.width,
        height: size.height,
        dpi,
    });
    let tunnel = Arc::new(
        GuacdTunnel::connect(
            &broker.config.guacd_host,
            broker.config.guacd_port,
            "",
            params,
            Arc::clone(&broker.transfers),
            None,
        )
        .await?,
    );

    let sess = Arc::clone(session);
    let task = tokio::spawn(async move {
        let mut away = sess.chans.away_rx();
        loop {
            tokio::select! {
                _ = away.changed() => {
                    let notice =
                        Instruction::new(opcodes::DISCONNECT, vec!["session ended".into()]);
                    let _ = viewer.send(&notice.bytes()).await;
                    viewer.close().await;
                    tunnel.disconnect().await;
                    return;
                }
                frame = tunnel.read() => match frame {
                    Ok(frame) => {
                        if viewer.send(&frame).await.is_err() {
                            tunnel.disconnect().await;
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Observer tunnel read failed");
                        viewer.close().await;
                        return;
                    }
                },
                input = viewer.recv() => match input {
                    Ok(frame) => {
                        let _ = tunnel.write(&frame).await;
                    }
                    Err(_) => {
                        tunnel.disconnect().await;
                        return;
                    }
                },
            }
        }
    });
    session.add_task(task).await;

    Ok(())
}
