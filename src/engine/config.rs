//! Engine configuration options.

use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trades replayed into each instrument's depth at bootstrap.
    pub recent_trade_count: usize,
    /// Capacity of each book's submission channel. Submitters still wait for acceptance.
    pub submission_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recent_trade_count: 20,
            submission_buffer: 1,
        }
    }
}
