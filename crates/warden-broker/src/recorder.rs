//! Session recording.
//!
//! Terminal sessions record their output stream as asciinema v2 casts:
//! a JSON header line followed by `[elapsed, "o", data]` output events and
//! `[elapsed, "r", "WxH"]` resize events. The cast is buffered in memory
//! and written under `<replay_dir>/<YYYY-MM-DD>/<session_id>.cast` when the
//! session ends.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error};

use warden_core::error::Result;
use warden_core::transport::WindowSize;

/// Sink for session output with the write/resize/close contract the engine
/// relies on.
pub trait Recorder: Send {
    fn write(&mut self, bytes: &[u8]);
    fn resize(&mut self, size: WindowSize);
    fn close(&mut self) -> Result<()>;
}

/// Asciinema v2 recorder.
pub struct AsciinemaRecorder {
    session_id: String,
    buffer: Vec<u8>,
    started_at: DateTime<Utc>,
    started: Instant,
    replay_dir: PathBuf,
    closed: bool,
}

impl AsciinemaRecorder {
    pub fn new(session_id: &str, size: WindowSize, replay_dir: PathBuf) -> Result<Self> {
        let started_at = Utc::now();
        let header = json!({
            "version": 2,
            "width": size.width,
            "height": size.height,
            "timestamp": started_at.timestamp(),
            "title": session_id,
            "env": {
                "SHELL": "/bin/bash",
                "TERM": "xterm-256color",
            },
        });

        let mut recorder = Self {
            session_id: session_id.to_string(),
            buffer: Vec::new(),
            started_at,
            started: Instant::now(),
            replay_dir,
            closed: false,
        };
        recorder.push_line(&header);
        Ok(recorder)
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_micros() as f64 / 1_000_000.0
    }

    fn push_line(&mut self, value: &serde_json::Value) {
        match serde_json::to_vec(value) {
            Ok(mut line) => {
                line.extend_from_slice(b"\r\n");
                self.buffer.extend_from_slice(&line);
            }
            Err(e) => error!(session_id = %self.session_id, error = %e, "Recorder event lost"),
        }
    }

    /// Bytes of the cast recorded so far. Used by tests; the session writes
    /// the file through [`Recorder::close`].
    pub fn cast(&self) -> &[u8] {
        &self.buffer
    }
}

impl Recorder for AsciinemaRecorder {
    fn write(&mut self, bytes: &[u8]) {
        if self.closed || bytes.is_empty() {
            return;
        }
        let event = json!([
            self.elapsed(),
            "o",
            String::from_utf8_lossy(bytes),
        ]);
        self.push_line(&event);
    }

    fn resize(&mut self, size: WindowSize) {
        if self.closed {
            return;
        }
        let event = json!([
            self.elapsed(),
            "r",
            format!("{}x{}", size.width, size.height),
        ]);
        self.push_line(&event);
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let day_dir = self
            .replay_dir
            .join(self.started_at.format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&day_dir)?;

        let path = day_dir.join(format!("{}.cast", self.session_id));
        std::fs::write(&path, &self.buffer)?;

        debug!(session_id = %self.session_id, path = %path.display(), "Replay saved");
        Ok(())
    }
}
