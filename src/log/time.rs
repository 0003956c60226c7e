/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Per-log cached UTC timer: regenerates the `YYYY-MM-DD HH:MM:` prefix only
//! when the wall-clock minute changes, appending the two-digit seconds field
//! on every call as the fast path.

use chrono::{Timelike, Utc};

pub struct CachedClock {
    minute_key: i64,
    minute_prefix: String,
}

impl CachedClock {
    pub fn new() -> Self {
        CachedClock {
            minute_key: i64::MIN,
            minute_prefix: String::new(),
        }
    }

    /// Returns the formatted `"YYYY-MM-DD HH:MM:SS"` timestamp for right
    /// now, plus the millisecond component, recomputing the minute prefix
    /// only when the minute has rolled over since the last call.
    pub fn format_now(&mut self) -> (String, u32) {
        let now = Utc::now();
        let minute_key = now.timestamp().div_euclid(60);
        if minute_key != self.minute_key {
            self.minute_prefix = now.format("%Y-%m-%d %H:%M:").to_string();
            self.minute_key = minute_key;
        }
        let seconds = now.second();
        let millis = now.nanosecond() / 1_000_000;
        (format!("{}{:02}", self.minute_prefix, seconds), millis)
    }
}

impl Default for CachedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_a_plausible_timestamp() {
        let mut clock = CachedClock::new();
        let (s, millis) = clock.format_now();
        assert_eq!(s.len(), "2026-07-28 00:00:00".len());
        assert!(millis < 1000);
    }

    #[test]
    fn reuses_the_minute_prefix_across_calls() {
        let mut clock = CachedClock::new();
        let (first, _) = clock.format_now();
        let (second, _) = clock.format_now();
        // same minute (these two calls are microseconds apart), so the
        // prefix (everything before the seconds field) must match exactly.
        assert_eq!(&first[..first.len() - 2], &second[..second.len() - 2]);
    }
}
