//! Access-window policy evaluation.
//!
//! An access window restricts when a session may remain connected: optional
//! absolute start/end bounds plus per-weekday time-of-day ranges. The engine
//! evaluates the window once at connect and again every recheck tick, so a
//! window that closes mid-session terminates it.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc};

/// Time-of-day ranges for one weekday, each `"HH:MM~HH:MM"` inclusive.
#[derive(Debug, Clone)]
pub struct AccessRange {
    pub weekday: chrono::Weekday,
    pub times: Vec<String>,
}

/// The access window attached to an asset.
///
/// With no ranges configured the window is unrestricted (subject to the
/// absolute bounds). Otherwise `allow` decides whether a matching range
/// permits the session or forbids it.
#[derive(Debug, Clone)]
pub struct AccessAuth {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub ranges: Vec<AccessRange>,
    pub allow: bool,
}

impl Default for AccessAuth {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            ranges: Vec::new(),
            allow: true,
        }
    }
}

/// Whether the window permits a session right now.
pub fn check_time(auth: &AccessAuth) -> bool {
    check_time_at(auth, Utc::now(), Local::now().naive_local())
}

fn check_time_at(auth: &AccessAuth, now: DateTime<Utc>, local: NaiveDateTime) -> bool {
    if let Some(start) = auth.start
        && now < start
    {
        return false;
    }
    if let Some(end) = auth.end
        && now > end
    {
        return false;
    }

    let weekday = local.weekday();
    let hm = format!("{:02}:{:02}", local.hour(), local.minute());

    let mut has_ranges = false;
    let mut matched = false;
    for range in &auth.ranges {
        has_ranges = has_ranges || !range.times.is_empty();
        if range.weekday != weekday {
            continue;
        }
        for window in &range.times {
            if let Some((from, to)) = window.split_once('~')
                && hm.as_str() >= from
                && hm.as_str() <= to
            {
                matched = true;
            }
        }
    }

    !has_ranges || matched == auth.allow
}
