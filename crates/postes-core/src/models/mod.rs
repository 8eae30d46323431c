pub mod catalog;
pub mod record;

pub use catalog::{City, Neighborhood, RemotePoste};
pub use record::{NewRecord, Record, SyncStatus};
