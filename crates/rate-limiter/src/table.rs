//! Per-arena default rate limit tables
//!
//! An arena groups collectors with the same budget shape (e.g. `social`,
//! `news`). Callers that do not pass explicit limits use their arena's
//! windows, or the default table when the arena has none configured.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// One sliding window: at most `max_calls` within `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateWindow {
    pub max_calls: u64,
    pub window_secs: u64,
}

impl RateWindow {
    pub const fn new(max_calls: u64, window_secs: u64) -> Self {
        Self {
            max_calls,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Windows applied together, plus headroom added to every window's limit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArenaLimits {
    pub windows: Vec<RateWindow>,
    #[serde(default)]
    pub burst: u64,
}

impl Default for ArenaLimits {
    /// 10 per minute, 300 per hour, 2000 per day, no burst.
    fn default() -> Self {
        Self {
            windows: vec![
                RateWindow::new(10, 60),
                RateWindow::new(300, 3600),
                RateWindow::new(2000, 86_400),
            ],
            burst: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitTable {
    arenas: HashMap<String, ArenaLimits>,
    fallback: ArenaLimits,
}

impl RateLimitTable {
    pub fn new(arenas: HashMap<String, ArenaLimits>) -> Self {
        Self {
            arenas,
            fallback: ArenaLimits::default(),
        }
    }

    pub fn with_arena(mut self, arena: impl Into<String>, limits: ArenaLimits) -> Self {
        self.arenas.insert(arena.into(), limits);
        self
    }

    /// Limits for `arena`, falling back to the default table.
    pub fn for_arena(&self, arena: &str) -> &ArenaLimits {
        self.arenas.get(arena).unwrap_or(&self.fallback)
    }

    pub fn arenas(&self) -> impl Iterator<Item = &str> {
        self.arenas.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_minute_hour_day() {
        let limits = ArenaLimits::default();
        assert_eq!(
            limits.windows,
            vec![
                RateWindow::new(10, 60),
                RateWindow::new(300, 3600),
                RateWindow::new(2000, 86_400)
            ]
        );
        assert_eq!(limits.burst, 0);
    }

    #[test]
    fn unknown_arena_uses_fallback() {
        let table = RateLimitTable::default().with_arena(
            "news",
            ArenaLimits {
                windows: vec![RateWindow::new(1, 1)],
                burst: 2,
            },
        );
        assert_eq!(table.for_arena("news").burst, 2);
        assert_eq!(table.for_arena("social"), &ArenaLimits::default());
        assert_eq!(table.arenas().collect::<Vec<_>>(), vec!["news"]);
    }

    #[test]
    fn window_converts_to_duration() {
        assert_eq!(RateWindow::new(5, 90).window(), Duration::from_secs(90));
    }
}
