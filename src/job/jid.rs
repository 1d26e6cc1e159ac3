use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

const JID_FORMAT: &str = "%Y%m%d%H%M%S%6f";

/// Issues UTC timestamp job ids at microsecond resolution.
///
/// Ids from one generator are strictly increasing: a request landing in the
/// same microsecond as the previous one is pushed to the next microsecond.
/// UTC keeps that order across local clock changes such as the end of DST.
#[derive(Debug, Default)]
pub struct JidGenerator {
    last_micros: AtomicI64,
}

impl JidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_jid(&self) -> String {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .last_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(if now > last { now } else { last + 1 })
            })
            .unwrap_or_else(|last| last);
        let issued = if now > prev { now } else { prev + 1 };
        format_jid(issued)
    }
}

fn format_jid(micros: i64) -> String {
    match DateTime::from_timestamp_micros(micros) {
        Some(utc) => utc.format(JID_FORMAT).to_string(),
        None => micros.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jid_is_twenty_digits() {
        let jid = JidGenerator::new().next_jid();
        assert_eq!(jid.len(), 20);
        assert!(jid.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn jid_is_formatted_in_utc() {
        // 2026-11-01 05:30:00.000001 UTC, inside the hour US clocks repeat.
        let micros = 1_793_511_000_000_001;
        assert_eq!(format_jid(micros), "20261101053000000001");
        assert!(format_jid(micros) < format_jid(micros + 1));
    }

    #[test]
    fn back_to_back_jids_differ() {
        let gen = JidGenerator::new();
        let ids: Vec<String> = (0..100).map(|_| gen.next_jid()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }
}
