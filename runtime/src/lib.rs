pub mod app;
pub mod discovery;
pub mod registry;
pub mod scan;
pub mod session;
pub mod sim;
pub mod store;

pub use discovery::{DiscoveryEvent, DiscoveryListener};
pub use registry::DeviceRegistry;
pub use scan::{ScanOrchestrator, ScanState};
pub use session::{
    open_session, DeviceSession, HttpDeviceSession, SessionError, SessionSnapshot,
};
pub use sim::SimulatedSession;
pub use store::AppStore;

/// Wall-clock milliseconds since the epoch. Last-seen bookkeeping uses wall
/// time because it round-trips through the persisted device list.
pub fn epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
