//! Forbidden-command filtering for terminal sessions.
//!
//! The engine feeds every inbound keystroke and every byte of target output
//! through a [`CommandFilter`]. When the accumulated input line matches a
//! forbidden rule the engine drops the line, tells the client, and injects
//! [`CLEAR_LINE`] so the target never sees the command.

use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use warden_core::transport::WindowSize;

use crate::providers::CommandLog;

/// Kill-line control sequence (NAK + CR) injected after a forbidden command.
pub const CLEAR_LINE: &[u8] = b"\x15\r";

/// One forbidden-command rule.
#[derive(Debug, Clone)]
pub struct CommandRule {
    pub pattern: String,
    pub is_regex: bool,
}

/// The filter's answer for one chunk of input.
#[derive(Debug, Default)]
pub struct FilterVerdict {
    /// The rule that matched, when `forbidden`.
    pub matched: Option<String>,
    pub forbidden: bool,
}

/// Classifies session traffic and detects forbidden commands.
pub trait CommandFilter: Send {
    /// Feed client keystrokes; returns the verdict for the line they
    /// complete, if any.
    fn add_input(&mut self, bytes: &[u8]) -> FilterVerdict;

    /// Feed target output.
    fn add_output(&mut self, bytes: &[u8]);

    /// Track the terminal size.
    fn resize(&mut self, size: WindowSize);

    /// Flush any pending audit state.
    fn write_db(&mut self);
}

enum Matcher {
    Substring,
    Regex(Regex),
}

struct CompiledRule {
    pattern: String,
    matcher: Matcher,
}

/// Line-oriented filter matching plain substrings and regexes.
pub struct RegexCommandFilter {
    session_id: String,
    rules: Vec<CompiledRule>,
    current: String,
    log: Arc<dyn CommandLog>,
    size: WindowSize,
}

impl RegexCommandFilter {
    pub fn new(
        session_id: &str,
        rules: &[CommandRule],
        size: WindowSize,
        log: Arc<dyn CommandLog>,
    ) -> Self {
        let rules = rules
            .iter()
            .filter_map(|rule| {
                let matcher = if rule.is_regex {
                    match Regex::new(&rule.pattern) {
                        Ok(re) => Matcher::Regex(re),
                        Err(e) => {
                            warn!(pattern = %rule.pattern, error = %e, "Skipping invalid command rule");
                            return None;
                        }
                    }
                } else {
                    Matcher::Substring
                };
                Some(CompiledRule {
                    pattern: rule.pattern.clone(),
                    matcher,
                })
            })
            .collect();

        Self {
            session_id: session_id.to_string(),
            rules,
            current: String::new(),
            log,
            size,
        }
    }

    /// Terminal size as last reported by the engine.
    pub fn size(&self) -> WindowSize {
        self.size
    }

    fn forbidden_rule(&self, command: &str) -> Option<String> {
        if command.is_empty() {
            return None;
        }
        for rule in &self.rules {
            let hit = match &rule.matcher {
                Matcher::Substring => command.contains(&rule.pattern),
                Matcher::Regex(re) => re.is_match(command),
            };
            if hit {
                return Some(rule.pattern.clone());
            }
        }
        None
    }

    fn finalize_line(&mut self) -> FilterVerdict {
        let command = self.current.trim().to_string();
        self.current.clear();

        if command.is_empty() {
            return FilterVerdict::default();
        }
        if let Some(pattern) = self.forbidden_rule(&command) {
            return FilterVerdict {
                matched: Some(pattern),
                forbidden: true,
            };
        }

        self.log.record(&self.session_id, &command);
        FilterVerdict::default()
    }
}

impl CommandFilter for RegexCommandFilter {
    fn add_input(&mut self, bytes: &[u8]) -> FilterVerdict {
        if bytes.contains(&0x15) {
            // Kill-line clears whatever was typed.
            self.current.clear();
        } else if bytes.len() == 1 && (bytes[0] == 0x08 || bytes[0] == 0x7F) {
            self.current.pop();
        } else {
            // Only whole printable chunks count as typed characters;
            // escape sequences and control bytes do not edit the line.
            if let Ok(text) = std::str::from_utf8(bytes) {
                let typed = text.strip_suffix('\r').unwrap_or(text);
                if !typed.is_empty() && typed.bytes().all(|b| (32..=126).contains(&b)) {
                    self.current.push_str(typed);
                }
            }
        }

        if bytes.ends_with(b"\r") || bytes.ends_with(b"\n") {
            return self.finalize_line();
        }
        FilterVerdict::default()
    }

    fn add_output(&mut self, _bytes: &[u8]) {
        // Output is not needed to reconstruct the typed command; rules match
        // on the input line alone.
    }

    fn resize(&mut self, size: WindowSize) {
        self.size = size;
    }

    fn write_db(&mut self) {
        // Session is closing; audit the line still being typed, if any.
        let command = self.current.trim().to_string();
        self.current.clear();
        if !command.is_empty() {
            self.log.record(&self.session_id, &command);
        }
    }
}
