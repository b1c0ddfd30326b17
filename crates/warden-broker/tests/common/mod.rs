//! Shared harness for broker integration tests.
//!
//! Not every helper is used by every test binary.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use warden_broker::config::BrokerConfig;
use warden_broker::engine::{Broker, ConnectRequest, TargetConnector, TargetContext};
use warden_broker::providers::{
    Account, AccountSecret, Asset, DirectProxy, MemoryDirectory, MemorySessionStore,
    NullCommandLog,
};
use warden_broker::policy::AccessAuth;
use warden_broker::session::{SessionType, TargetPipes};
use warden_core::error::Result;
use warden_core::transport::{ClientTransport, WindowSize};

/// In-memory target that echoes everything the engine forwards.
pub struct EchoConnector;

#[async_trait::async_trait]
impl TargetConnector for EchoConnector {
    async fn run(&self, ctx: TargetContext) -> Result<()> {
        let TargetContext {
            session,
            pipes,
            mut window_rx,
            ..
        } = ctx;

        let _ = session.chans.err_tx.send(Ok(())).await;

        let TargetPipes {
            mut stdin,
            mut stdout,
        } = pipes;
        let mut cancel = session.cancelled();
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = cancel.changed() => return Ok(()),
                Some(_) = window_rx.recv() => {}
                read = stdin.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(n) => stdout.write_all(&buf[..n]).await?,
                }
            }
        }
    }
}

/// Test fixture bundling the broker with its injected collaborators.
pub struct Harness {
    pub broker: Arc<Broker>,
    pub directory: Arc<MemoryDirectory>,
    pub store: Arc<MemorySessionStore>,
    // Held so replay and drive directories outlive the test.
    pub tempdir: tempfile::TempDir,
}

/// Timer intervals compressed so policy tests run in well under a second of
/// wall time per tick. Replay and drive paths are rewritten onto the
/// harness tempdir.
pub fn fast_config() -> BrokerConfig {
    BrokerConfig {
        idle_timeout: Duration::from_secs(3600),
        access_recheck_interval: Duration::from_millis(100),
        flush_interval: Duration::from_millis(20),
        keepalive_interval: Duration::from_millis(200),
        ..BrokerConfig::default()
    }
}

pub fn asset() -> Asset {
    Asset {
        id: 1,
        name: "web-01".into(),
        ip: "10.0.0.7".into(),
        protocols: vec!["ssh".into()],
        gateway_id: None,
        access: AccessAuth::default(),
        allow_copy: true,
        allow_paste: true,
        allow_upload: true,
        allow_download: true,
        commands: Vec::new(),
    }
}

pub fn account() -> Account {
    Account {
        id: 1,
        name: "ops".into(),
        username: "ops".into(),
        secret: AccountSecret::Password("secret".into()),
    }
}

/// Build a broker around [`EchoConnector`] and in-memory collaborators.
pub async fn echo_harness(config: BrokerConfig, asset: Asset) -> Harness {
    harness_with(config, asset, Some(Arc::new(EchoConnector))).await
}

/// Build a broker with the real protocol connectors.
pub async fn real_harness(config: BrokerConfig, asset: Asset) -> Harness {
    harness_with(config, asset, None).await
}

async fn harness_with(
    config: BrokerConfig,
    asset: Asset,
    connector: Option<Arc<dyn TargetConnector>>,
) -> Harness {
    let tempdir = tempfile::tempdir().unwrap();
    let config = BrokerConfig {
        replay_dir: tempdir.path().join("replay"),
        drive_root: tempdir.path().join("drive"),
        ..config
    };

    let directory = Arc::new(MemoryDirectory::new());
    directory.put_asset(asset).await;
    directory.put_account(account()).await;
    let store = Arc::new(MemorySessionStore::new());

    let mut broker = Broker::new(
        config,
        directory.clone(),
        Arc::new(DirectProxy),
        store.clone(),
        Arc::new(NullCommandLog),
    );
    if let Some(connector) = connector {
        broker = broker.with_connector(connector);
    }

    Harness {
        broker: Arc::new(broker),
        directory,
        store,
        tempdir,
    }
}

pub fn request(transport: Arc<dyn ClientTransport>, protocol: &str) -> ConnectRequest {
    ConnectRequest {
        session_type: SessionType::Web,
        protocol: protocol.into(),
        asset_id: 1,
        account_id: 1,
        client_ip: "192.0.2.10".into(),
        size: WindowSize {
            width: 80,
            height: 24,
        },
        dpi: 96,
        share: None,
        transport,
    }
}
