//! Session transcript parsing, caching, and change notification.

pub mod cache;
pub mod transcript;
pub mod watcher;

pub use cache::{SessionCache, SessionEntry};
pub use transcript::{is_real_user_prompt, SubagentSummary, TaskItem};
pub use watcher::{spawn_cache_invalidator, TranscriptEvent, TranscriptWatcher};
