// exchange-core: stock exchange matching core.
// one order book actor per instrument. price-time priority, self-trade prevention,
// lazy cancellation, stop-loss promotion. persistence and fan-out sit behind traits.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: InstrumentId, OrderId, Side, Price, Quantity
//   2.x  order.rs: orders, shared order handles, trades
//   2.1x conditional.rs: stop-loss trigger rules
//   3.x  pqueue.rs: binary heap of resting orders, ask/bid ordering
//   4.x  depth.rs: depth sink trait, in-memory market depth
//   7.x  config.rs: exchange config, env presets, env overrides
//   8.x  engine/: order book actor, matching, depth ledger, bootstrap/routing
//   9.1  settlement.rs: fill primitive (mocked)
//   9.2  source.rs: bootstrap data source (mocked)

// core matching modules
pub mod conditional;
pub mod depth;
pub mod engine;
pub mod order;
pub mod pqueue;
pub mod types;

// integration modules
pub mod config;
pub mod settlement;
pub mod source;

// re exports for convenience
pub use conditional::*;
pub use depth::*;
pub use engine::*;
pub use order::*;
pub use pqueue::*;
pub use types::*;
pub use config::{ConfigError, Environment, ExchangeConfig};
pub use settlement::{FillOutcome, FillStatus, Settlement, SettlementError, SimulatedSettlement};
pub use source::{InMemorySource, Instrument, OrderSource, SourceError};
