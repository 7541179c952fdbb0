pub mod config;
pub mod db;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod locking;
pub mod logging;
pub mod matcher;
pub mod models;
pub mod retry;
pub mod server;
pub mod terraform;
pub mod vcs;
