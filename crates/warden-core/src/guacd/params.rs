//! Handshake parameter sets, tagged by tunnel role.
//!
//! A primary tunnel drives a new remote session and hands guacd the full
//! connection configuration; an observer joins an existing session by
//! connection id and may only negotiate geometry. The two roles answer the
//! daemon's `args` request from disjoint parameter sets, so they are distinct
//! types rather than one map with conditional keys.

use std::collections::HashMap;

use crate::constants::{
    CLIENT_NAME, CREATE_RECORDING_PATH, GUACD_VERSION, IGNORE_CERT, RECORDING_PATH, RESIZE_METHOD,
};

/// Parameters for a primary (session-driving) tunnel.
#[derive(Debug, Clone)]
pub struct PrimaryParams {
    /// Protocol scheme (`rdp` or `vnc`).
    pub scheme: String,
    /// Target hostname, possibly rewritten to a gateway forwarder.
    pub hostname: String,
    /// Target port, possibly rewritten to a gateway forwarder.
    pub port: u16,
    pub username: String,
    pub password: String,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    /// Recording file name; the session id.
    pub recording_name: String,
    pub allow_copy: bool,
    pub allow_paste: bool,
    pub allow_upload: bool,
    pub allow_download: bool,
    /// Drive redirection root, derived from the asset id. `None` disables
    /// drive redirection regardless of the upload/download flags.
    pub drive_path: Option<String>,
}

impl PrimaryParams {
    fn enable_drive(&self) -> bool {
        self.drive_path.is_some() && (self.allow_upload || self.allow_download)
    }

    fn to_map(&self) -> HashMap<String, String> {
        let mut params = HashMap::from([
            ("version".to_string(), GUACD_VERSION.to_string()),
            ("client-name".to_string(), CLIENT_NAME.to_string()),
            ("recording-path".to_string(), RECORDING_PATH.to_string()),
            (
                "create-recording-path".to_string(),
                CREATE_RECORDING_PATH.to_string(),
            ),
            ("recording-name".to_string(), self.recording_name.clone()),
            ("ignore-cert".to_string(), IGNORE_CERT.to_string()),
            ("width".to_string(), self.width.to_string()),
            ("height".to_string(), self.height.to_string()),
            ("dpi".to_string(), self.dpi.to_string()),
            ("scheme".to_string(), self.scheme.clone()),
            ("hostname".to_string(), self.hostname.clone()),
            ("port".to_string(), self.port.to_string()),
            ("username".to_string(), self.username.clone()),
            ("password".to_string(), self.password.clone()),
            ("resize-method".to_string(), RESIZE_METHOD.to_string()),
            ("disable-copy".to_string(), (!self.allow_copy).to_string()),
            ("disable-paste".to_string(), (!self.allow_paste).to_string()),
            ("enable-drive".to_string(), self.enable_drive().to_string()),
            (
                "disable-upload".to_string(),
                (!self.allow_upload).to_string(),
            ),
            (
                "disable-download".to_string(),
                (!self.allow_download).to_string(),
            ),
        ]);

        if self.enable_drive() {
            if let Some(ref drive) = self.drive_path {
                params.insert("drive-path".to_string(), drive.clone());
            }
            params.insert("create-drive-path".to_string(), "true".to_string());
            params.insert("drive-name".to_string(), "Drive".to_string());
        }

        params
    }
}

/// Parameters for an observer (read-only viewer) tunnel.
#[derive(Debug, Clone)]
pub struct ObserverParams {
    /// Connection id of the live session being observed.
    pub connection_id: String,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

impl ObserverParams {
    fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("width".to_string(), self.width.to_string()),
            ("height".to_string(), self.height.to_string()),
            ("dpi".to_string(), self.dpi.to_string()),
            ("read-only".to_string(), "true".to_string()),
        ])
    }
}

/// The handshake parameter set for one tunnel, tagged by role.
#[derive(Debug, Clone)]
pub enum TunnelParams {
    Primary(PrimaryParams),
    Observer(ObserverParams),
}

impl TunnelParams {
    /// The argument of the opening `select` instruction: the protocol scheme
    /// for a new session, the existing connection id for an observer.
    pub fn select_arg(&self) -> &str {
        match self {
            TunnelParams::Primary(p) => &p.scheme,
            TunnelParams::Observer(o) => &o.connection_id,
        }
    }

    /// Geometry as (width, height, dpi) strings for the `size` instruction.
    pub fn geometry(&self) -> (String, String, String) {
        let (w, h, dpi) = match self {
            TunnelParams::Primary(p) => (p.width, p.height, p.dpi),
            TunnelParams::Observer(o) => (o.width, o.height, o.dpi),
        };
        (w.to_string(), h.to_string(), dpi.to_string())
    }

    /// Resolve the parameter names requested by the daemon's `args`
    /// instruction. Names this role does not carry resolve to empty strings.
    pub fn resolve(&self, names: &[String]) -> Vec<String> {
        let map = match self {
            TunnelParams::Primary(p) => p.to_map(),
            TunnelParams::Observer(o) => o.to_map(),
        };
        names
            .iter()
            .map(|name| map.get(name).cloned().unwrap_or_default())
            .collect()
    }

    /// Whether this parameter set drives a new session.
    pub fn is_primary(&self) -> bool {
        matches!(self, TunnelParams::Primary(_))
    }
}
