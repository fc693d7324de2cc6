pub mod operation;
pub mod photo;
pub mod status;

pub use operation::PendingOperation;
pub use photo::{LocalPhotoRecord, NewPhoto, PhotoView};
pub use status::SyncStatus;
