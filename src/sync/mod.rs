//! Remote sync: git origin matching, hub client, duplex channel, sync loop.

pub mod channel;
pub mod git;
pub mod hub;
pub mod remote;

pub use channel::HubChannel;
pub use git::{normalize_git_url, normalized_fetch_remotes, remotes_intersect};
pub use hub::{HubClient, PeerMachine, PeerProject};
pub use remote::{RemoteSyncService, SyncState, SyncStatus};
