//! Database module for PingMeDaddy.
//!
//! Provides SQLite storage with automatic migrations, roll-up recomputation
//! and retention deletes.

mod models;
mod store;

pub use models::*;
pub use store::*;
