//! External collaborators consumed by the session engine.
//!
//! The engine does not own resource CRUD, gateway dialing or persistence;
//! it talks to them through these traits. Everything is injected as an
//! explicit handle so tests can substitute in-memory implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use warden_core::constants::{DEFAULT_RDP_PORT, DEFAULT_SSH_PORT, DEFAULT_VNC_PORT};
use warden_core::error::{Error, Result};

use crate::filter::CommandRule;
use crate::policy::AccessAuth;
use crate::session::SessionRecord;

/// A connectable target host.
#[derive(Debug, Clone)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    pub ip: String,
    /// Enabled protocols, each `scheme` or `scheme:port`.
    pub protocols: Vec<String>,
    pub gateway_id: Option<i64>,
    pub access: AccessAuth,
    pub allow_copy: bool,
    pub allow_paste: bool,
    pub allow_upload: bool,
    pub allow_download: bool,
    /// Forbidden-command rules applied to terminal sessions.
    pub commands: Vec<CommandRule>,
}

impl Asset {
    /// Resolve the port for a protocol scheme, falling back to well-known
    /// defaults when the asset does not pin one.
    pub fn port_for(&self, scheme: &str) -> u16 {
        for protocol in &self.protocols {
            let (proto_scheme, port) = match protocol.split_once(':') {
                Some((s, p)) => (s, p.parse().ok()),
                None => (protocol.as_str(), None),
            };
            if proto_scheme.eq_ignore_ascii_case(scheme) {
                if let Some(port) = port {
                    return port;
                }
                break;
            }
        }
        match scheme.to_ascii_lowercase().as_str() {
            "rdp" => DEFAULT_RDP_PORT,
            "vnc" => DEFAULT_VNC_PORT,
            _ => DEFAULT_SSH_PORT,
        }
    }
}

/// Credentials for one account on a target.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub secret: AccountSecret,
}

/// How an account authenticates.
#[derive(Debug, Clone)]
pub enum AccountSecret {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

/// An intermediate jump host.
#[derive(Debug, Clone)]
pub struct Gateway {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Resolves assets, accounts and gateways.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch the asset/account/gateway triple for a connection request.
    async fn get_aag(
        &self,
        asset_id: i64,
        account_id: i64,
    ) -> Result<(Asset, Account, Option<Gateway>)>;

    /// Reload one asset; the engine calls this on every access recheck tick.
    async fn get_asset(&self, asset_id: i64) -> Result<Asset>;
}

/// Opens a route to a target, through a gateway when one is configured.
#[async_trait]
pub trait GatewayProxy: Send + Sync {
    /// Resolve the dialable address for a target. Implementations with a
    /// gateway return a local forwarder endpoint; the session id keys the
    /// forwarding tunnel for later release.
    async fn open(
        &self,
        session_id: &str,
        protocol: &str,
        asset: &Asset,
        gateway: Option<&Gateway>,
    ) -> Result<(String, u16)>;

    /// Release any forwarding tunnel opened for the session.
    async fn close(&self, session_id: &str);
}

/// Proxy that always dials targets directly, ignoring gateways.
pub struct DirectProxy;

#[async_trait]
impl GatewayProxy for DirectProxy {
    async fn open(
        &self,
        _session_id: &str,
        protocol: &str,
        asset: &Asset,
        _gateway: Option<&Gateway>,
    ) -> Result<(String, u16)> {
        Ok((asset.ip.clone(), asset.port_for(protocol)))
    }

    async fn close(&self, _session_id: &str) {}
}

/// Persists session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, record: &SessionRecord) -> Result<()>;
}

/// Receives executed terminal commands for auditing.
pub trait CommandLog: Send + Sync {
    fn record(&self, session_id: &str, command: &str);
}

/// Command log that only traces.
pub struct NullCommandLog;

impl CommandLog for NullCommandLog {
    fn record(&self, session_id: &str, command: &str) {
        tracing::debug!(session_id, command, "Executed command");
    }
}

// =============================================================================
// In-memory implementations (tests and embedding)
// =============================================================================

/// Directory over fixed in-memory data. The asset map can be mutated at any
/// time, which is how tests flip an access window mid-session.
#[derive(Default)]
pub struct MemoryDirectory {
    assets: Mutex<HashMap<i64, Asset>>,
    accounts: Mutex<HashMap<i64, Account>>,
    gateways: Mutex<HashMap<i64, Gateway>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_asset(&self, asset: Asset) {
        self.assets.lock().await.insert(asset.id, asset);
    }

    pub async fn put_account(&self, account: Account) {
        self.accounts.lock().await.insert(account.id, account);
    }

    pub async fn put_gateway(&self, gateway: Gateway) {
        self.gateways.lock().await.insert(gateway.id, gateway);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get_aag(
        &self,
        asset_id: i64,
        account_id: i64,
    ) -> Result<(Asset, Account, Option<Gateway>)> {
        let asset = self.get_asset(asset_id).await?;
        let account = self
            .accounts
            .lock()
            .await
            .get(&account_id)
            .cloned()
            .ok_or_else(|| Error::Protocol {
                message: format!("unknown account {account_id}"),
            })?;
        let gateway = match asset.gateway_id {
            Some(id) => self.gateways.lock().await.get(&id).cloned(),
            None => None,
        };
        Ok((asset, account, gateway))
    }

    async fn get_asset(&self, asset_id: i64) -> Result<Asset> {
        self.assets
            .lock()
            .await
            .get(&asset_id)
            .cloned()
            .ok_or_else(|| Error::Protocol {
                message: format!("unknown asset {asset_id}"),
            })
    }
}

/// Session store that keeps every upserted row, newest last.
#[derive(Default)]
pub struct MemorySessionStore {
    rows: Mutex<Vec<SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<SessionRecord> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        self.rows.lock().await.push(record.clone());
        Ok(())
    }
}
