// 8.0.2: result types and errors for engine operations.

use crate::order::Trade;
use crate::settlement::FillStatus;
use crate::source::SourceError;
use crate::types::{InstrumentId, OrderId, Side};

/// What one `make_trade` step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchStep {
    pub ask_done: bool,
    pub bid_done: bool,
    pub trade: Option<Trade>,
}

/// Settlement broke the progress invariant: neither side advanced.
///
/// `trade` is set when settlement still moved some quantity. It has been
/// recorded like any other trade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchFault {
    #[error("Settlement left ask {ask_id} ({ask_status:?}) and bid {bid_id} ({bid_status:?}) both open")]
    NoProgress {
        ask_id: OrderId,
        bid_id: OrderId,
        ask_status: FillStatus,
        bid_status: FillStatus,
        trade: Option<Trade>,
    },
}

impl MatchFault {
    pub fn trade(&self) -> Option<&Trade> {
        match self {
            MatchFault::NoProgress { trade, .. } => trade.as_ref(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Instrument {0} not found")]
    UnknownInstrument(InstrumentId),

    #[error("Order {order_id} is a {actual} order, expected {expected}")]
    SideMismatch {
        order_id: OrderId,
        expected: Side,
        actual: Side,
    },

    #[error("Order book for instrument {0} is not running")]
    BookStopped(InstrumentId),

    #[error("Order book for instrument {0} already started")]
    AlreadyStarted(InstrumentId),

    #[error("Bootstrap source error: {0}")]
    Source(#[from] SourceError),

    #[error("Matching task failed: {0}")]
    Task(String),
}
