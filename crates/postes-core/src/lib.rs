pub mod api;
pub mod config;
pub mod connectivity;
pub mod models;
pub mod photo;
pub mod remote;
pub mod session;
pub mod storage;
pub mod sync;
pub mod utm;

// Re-export commonly used types
pub use api::ApiClient;
pub use config::{Config, State};
pub use connectivity::{Connectivity, ConnectivityEvent, ConnectivityMonitor, ReachabilityProbe};
pub use models::{NewRecord, Record, SyncStatus};
pub use remote::{PhotoUpload, RemoteClient, SubmitOutcome};
pub use session::{SessionManager, TokenSource};
pub use storage::{LocalDb, RecordStore, StoreError};
pub use sync::{PassOutcome, Routed, SyncError, SyncOrchestrator, SyncReport, SyncTrigger};
