//! Guacamole wire instruction codec.
//!
//! Format: `<len>.<opcode>[,<len>.<arg>]*;` where `<len>` is the UTF-8 byte
//! length of the element that follows it. Lengths are advisory on decode;
//! instruction-level framing is driven by the `;` delimiter.

use std::sync::OnceLock;

use bytes::Bytes;

/// Instruction delimiter byte.
pub const DELIMITER: u8 = b';';

/// Well-known opcodes.
pub mod opcodes {
    // Handshake phase.
    pub const SELECT: &str = "select";
    pub const ARGS: &str = "args";
    pub const SIZE: &str = "size";
    pub const AUDIO: &str = "audio";
    pub const VIDEO: &str = "video";
    pub const IMAGE: &str = "image";
    pub const CONNECT: &str = "connect";
    pub const READY: &str = "ready";

    // Session phase.
    pub const DISCONNECT: &str = "disconnect";
    pub const MOUSE: &str = "mouse";
    pub const KEY: &str = "key";
    pub const ERROR: &str = "error";

    // File-transfer sub-protocol.
    pub const FILE_UPLOAD: &str = "file-upload";
    pub const FILE_DOWNLOAD: &str = "file-download";
    pub const FILE_DATA: &str = "file-data";
    pub const FILE_ACK: &str = "file-ack";
    pub const FILE_COMPLETE: &str = "file-complete";
    pub const FILE_ERROR: &str = "file-error";
}

/// One framed Guacamole instruction.
///
/// Serialization is deterministic and cached after the first render, so
/// repeated [`Instruction::bytes`] calls do not re-encode.
#[derive(Debug)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
    cache: OnceLock<String>,
}

impl Clone for Instruction {
    fn clone(&self) -> Self {
        Self {
            opcode: self.opcode.clone(),
            args: self.args.clone(),
            cache: OnceLock::new(),
        }
    }
}

impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.opcode == other.opcode && self.args == other.args
    }
}

impl Eq for Instruction {}

impl Instruction {
    /// Create a new instruction from an opcode and arguments.
    pub fn new<S: Into<String>>(opcode: S, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
            cache: OnceLock::new(),
        }
    }

    /// Render the wire form, computing and caching it on first use.
    pub fn render(&self) -> &str {
        self.cache.get_or_init(|| {
            let mut out = format!("{}.{}", self.opcode.len(), self.opcode);
            for arg in &self.args {
                out.push(',');
                out.push_str(&arg.len().to_string());
                out.push('.');
                out.push_str(arg);
            }
            out.push(DELIMITER as char);
            out
        })
    }

    /// Wire form as bytes.
    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.render().as_bytes())
    }

    /// Decode one instruction from its wire form.
    ///
    /// A trailing delimiter is stripped if present. Each element is split at
    /// the first `.`; the declared length is advisory and ignored. Degenerate
    /// elements (no `.`) decode to empty strings, so a malformed frame yields
    /// an instruction with an empty opcode rather than an error. Callers on
    /// the general read path must tolerate that; only the handshake assert
    /// treats it as fatal.
    pub fn decode(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let text = text.strip_suffix(DELIMITER as char).unwrap_or(&text);

        let mut elements = text.split(',').map(|e| {
            e.split_once('.')
                .map(|(_, value)| value.to_string())
                .unwrap_or_default()
        });

        let opcode = elements.next().unwrap_or_default();
        Self::new(opcode, elements.collect())
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.render())
    }
}

/// Whether a raw client frame counts as user activity for the idle timer.
///
/// Only `mouse` and `key` instructions qualify; clipboard sync, acks and
/// display traffic do not keep a session alive.
pub fn is_active(frame: &[u8]) -> bool {
    let ins = Instruction::decode(frame);
    ins.opcode == opcodes::MOUSE || ins.opcode == opcodes::KEY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_select_vnc() {
        let ins = Instruction::new(opcodes::SELECT, vec!["vnc".into()]);
        assert_eq!(ins.render(), "6.select,3.vnc;");
    }

    #[test]
    fn encode_no_args() {
        let ins = Instruction::new(opcodes::VIDEO, vec![]);
        assert_eq!(ins.render(), "5.video;");
    }

    #[test]
    fn render_is_cached_and_stable() {
        let ins = Instruction::new(opcodes::SIZE, vec!["1024".into(), "768".into(), "96".into()]);
        let first = ins.render().to_string();
        assert_eq!(ins.render(), first);
        assert_eq!(first, "4.size,4.1024,3.768,2.96;");
    }

    #[test]
    fn decode_round_trip() {
        let ins = Instruction::new(opcodes::SELECT, vec!["vnc".into()]);
        let decoded = Instruction::decode(ins.render().as_bytes());
        assert_eq!(decoded.opcode, "select");
        assert_eq!(decoded.args, vec!["vnc".to_string()]);
        assert_eq!(decoded, ins);
    }

    #[test]
    fn decode_keeps_dots_in_values() {
        let ins = Instruction::new("audio", vec!["audio/L8".into(), "a.b.c".into()]);
        let decoded = Instruction::decode(ins.render().as_bytes());
        assert_eq!(decoded.args, vec!["audio/L8".to_string(), "a.b.c".to_string()]);
    }

    #[test]
    fn decode_utf8_lengths_are_advisory() {
        // Length prefix counts bytes, not chars; decode ignores it anyway.
        let decoded = Instruction::decode("3.key,6.\u{00e9}\u{00e9}\u{00e9};".as_bytes());
        assert_eq!(decoded.opcode, "key");
        assert_eq!(decoded.args, vec!["\u{00e9}\u{00e9}\u{00e9}".to_string()]);
    }

    #[test]
    fn decode_degenerate_yields_empty_opcode() {
        let decoded = Instruction::decode(b"garbage-without-dots;");
        assert_eq!(decoded.opcode, "");

        let decoded = Instruction::decode(b";");
        assert_eq!(decoded.opcode, "");
    }

    #[test]
    fn decode_without_trailing_delimiter() {
        let decoded = Instruction::decode(b"4.sync,3.123");
        assert_eq!(decoded.opcode, "sync");
        assert_eq!(decoded.args, vec!["123".to_string()]);
    }

    #[test]
    fn active_instructions() {
        assert!(is_active(b"5.mouse,3.100,3.200;"));
        assert!(is_active(b"3.key,5.65307,1.1;"));
        assert!(!is_active(b"4.sync,8.12345678;"));
        assert!(!is_active(b"garbage"));
    }
}
