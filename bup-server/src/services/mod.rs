pub mod archive;
pub mod config_store;
pub mod events;
pub mod runner;
pub mod scheduler;
pub mod status_cache;
