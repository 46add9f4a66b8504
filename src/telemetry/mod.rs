pub mod poller;
pub mod types;

pub use poller::{read_snapshot, PollExit, TelemetryPoller};
pub use types::*;
