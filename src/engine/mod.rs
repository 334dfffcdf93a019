// 8.0: matching engine. one OrderBook actor per instrument, serialized matching,
// lazy cancellation, stop-loss promotion. the engine itself only bootstraps and routes.

mod book;
mod config;
mod core;
mod ledger;
mod matching;
mod results;

pub use book::OrderBook;
pub use config::EngineConfig;
pub use core::MatchingEngine;
pub use ledger::DepthLedger;
pub use results::{EngineError, MatchFault, MatchStep};
