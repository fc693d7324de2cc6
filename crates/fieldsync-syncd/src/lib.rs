pub mod backend;
pub mod engine;
pub mod network;
pub mod service;
pub mod status;

pub use backend::{BlobUpload, MemoryBackend, RemoteBackend, RemoteError, RestBackend, TableMutation};
pub use engine::{DrainMode, DrainOutcome, DrainReport, EngineSettings, SyncEngine};
pub use network::{NetworkMonitor, ReachabilityProbe, ReconnectEvents};
pub use service::SyncService;
pub use status::StatusHub;
