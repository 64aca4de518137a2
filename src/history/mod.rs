//! Round and game history.
//!
//! - `record`: Finalized records and their byte encoding
//! - `sink`: Destinations for records (logs, write-behind channel)

pub mod record;
pub mod sink;

pub use record::{GameHistory, HistoryError, HistoryRecord, RoundHistory, SeatSummary};
pub use sink::{ChannelSink, HistorySink, SharedSink, TracingSink};
