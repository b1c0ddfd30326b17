//! SSH target path.
//!
//! Dials the target over SSH (through the gateway proxy when one is
//! configured), authenticates with the account's secret, requests a PTY and
//! a shell, then wires the SSH channel to the session's pipe halves: the
//! engine's accepted input flows into the channel, channel output flows
//! into the stdout pipe for the rune pump to re-publish.

use std::sync::Arc;

use russh::ChannelMsg;
use russh::client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use warden_core::constants::SSH_DIAL_TIMEOUT;
use warden_core::error::{Error, Result};

use crate::providers::{AccountSecret, GatewayProxy};
use crate::session::TargetPipes;

use super::{TargetConnector, TargetContext};

/// Connects terminal sessions to their SSH targets.
pub struct SshConnector {
    proxy: Arc<dyn GatewayProxy>,
}

impl SshConnector {
    pub fn new(proxy: Arc<dyn GatewayProxy>) -> Self {
        Self { proxy }
    }
}

/// Target host keys are not verified: the broker, not the end user, owns
/// the trust relationship with managed assets.
struct InsecureHostKey;

#[async_trait::async_trait]
impl client::Handler for InsecureHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

fn target_err(e: russh::Error) -> Error {
    Error::Target {
        message: e.to_string(),
    }
}

#[async_trait::async_trait]
impl TargetConnector for SshConnector {
    async fn run(&self, ctx: TargetContext) -> Result<()> {
        let TargetContext {
            session,
            asset,
            account,
            gateway,
            pipes,
            mut window_rx,
            size,
            ..
        } = ctx;

        let (host, port) = self
            .proxy
            .open(session.id(), "ssh", &asset, gateway.as_ref())
            .await?;
        let addr = format!("{host}:{port}");

        let config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            SSH_DIAL_TIMEOUT,
            client::connect(config, (host.as_str(), port), InsecureHostKey),
        )
        .await
        .map_err(|_| Error::Dial {
            addr: addr.clone(),
            message: "connect timed out".into(),
        })?
        .map_err(|e| Error::Dial {
            addr: addr.clone(),
            message: e.to_string(),
        })?;

        let authenticated = match &account.secret {
            AccountSecret::Password(password) => handle
                .authenticate_password(account.username.as_str(), password.as_str())
                .await
                .map_err(target_err)?,
            AccountSecret::PrivateKey { key, passphrase } => {
                let keypair = russh_keys::decode_secret_key(key, passphrase.as_deref())
                    .map_err(|e| Error::Target {
                        message: format!("invalid private key: {e}"),
                    })?;
                handle
                    .authenticate_publickey(account.username.as_str(), Arc::new(keypair))
                    .await
                    .map_err(target_err)?
            }
        };
        if !authenticated {
            return Err(Error::AuthenticationFailed);
        }

        let mut channel = handle.channel_open_session().await.map_err(target_err)?;
        channel
            .request_pty(false, "xterm", size.width, size.height, 0, 0, &[])
            .await
            .map_err(target_err)?;
        channel.request_shell(true).await.map_err(target_err)?;

        debug!(session_id = %session.id(), addr = %addr, "SSH target online");

        // Target is live; unblock session setup.
        let _ = session.chans.err_tx.send(Ok(())).await;

        let TargetPipes {
            mut stdin,
            mut stdout,
        } = pipes;
        let mut cancel = session.cancelled();
        let mut away = session.chans.away_rx();
        let mut buf = [0u8; 4096];
        let mut exit_status = None;

        loop {
            tokio::select! {
                _ = cancel.changed() => return Ok(()),
                _ = away.changed() => return Ok(()),
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        stdout.write_all(&data).await?;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stdout.write_all(&data).await?;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                        exit_status = Some(code);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        return Err(Error::Target {
                            message: match exit_status {
                                Some(code) => format!("ssh session ended with status {code}"),
                                None => "ssh session ended".into(),
                            },
                        });
                    }
                    Some(_) => {}
                },
                read = stdin.read(&mut buf) => match read {
                    // Engine side closed the input pipe; session is ending.
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(n) => channel.data(&buf[..n]).await.map_err(target_err)?,
                },
                Some(new_size) = window_rx.recv() => {
                    if let Err(e) = channel
                        .window_change(new_size.width, new_size.height, 0, 0)
                        .await
                    {
                        warn!(session_id = %session.id(), error = %e, "Resize failed");
                        continue;
                    }
                    if let Some(recorder) = &session.recorder {
                        recorder.lock().await.resize(new_size);
                    }
                    if let Some(filter) = &session.filter {
                        filter.lock().await.resize(new_size);
                    }
                }
            }
        }
    }
}
