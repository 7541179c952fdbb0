//! Terraform subprocess execution.

pub mod client;

pub use client::{AsyncClient, CommandRequest, Line};
