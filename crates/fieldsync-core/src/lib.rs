pub mod config;
pub mod models;
pub mod overlay;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use fieldsync_proto as proto;
pub use models::{LocalPhotoRecord, PendingOperation, PhotoView, SyncStatus};
pub use storage::LocalStore;
