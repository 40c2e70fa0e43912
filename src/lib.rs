//! Watch a page for an element carrying one of a few target texts and a
//! target color, and keep notifying while it stays there.

pub mod color;
pub mod config;
pub mod dom;
pub mod matcher;
pub mod notify;
pub mod runtime;
pub mod selector;
pub mod watch;

pub use config::{AppConfig, FileStore, MemoryStore, Settings, SettingsStore, StoredState};
pub use dom::{Document, Dom, MutationSource, PageSnapshot};
pub use matcher::{MatchOutcome, Matcher};
pub use notify::{Notifier, run_notifier};
pub use runtime::{spawn_watch, ControlSignal, WatchHandle};
pub use watch::{ControlResponse, Notification, WatchState, Watcher};
