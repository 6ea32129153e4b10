//! Configuration for debug-host
//!
//! This crate handles:
//! - Global configuration (`~/.config/debughost/config.toml`)
//! - Per-tech port ranges and container stack templates

mod error;
mod global;
mod stacks;

pub use error::*;
pub use global::*;
pub use stacks::*;
