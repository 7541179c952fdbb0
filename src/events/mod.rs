//! Reactions to pull request lifecycle events.

pub mod pull_closed;

pub use pull_closed::{PullClosedExecutor, PullClosedSummary};
