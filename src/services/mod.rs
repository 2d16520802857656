pub mod connectivity;
pub mod scheduler;
pub mod sync_client;

pub use connectivity::Connectivity;
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use sync_client::{
    Created, Loaded, ReplayStats, Source, SyncClient, SyncError, SyncStatus, WriteOutcome,
};
