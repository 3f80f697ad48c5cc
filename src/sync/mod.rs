mod coordinator;
mod inflight;
mod notify;

pub use coordinator::{SyncCoordinator, SyncSummary};
pub use inflight::InFlight;
pub use notify::{Broadcaster, SyncEvent};
