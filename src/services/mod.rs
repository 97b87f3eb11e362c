pub mod assets;
pub mod dispatcher;
pub mod lifecycle;
pub mod prompt;
pub mod providers;
pub mod queue;
pub mod storage;
pub mod store;
pub mod watcher;
