//! relief-core - Core library for Relief
//!
//! This crate contains the worksite models, the local libSQL store, and the
//! offline-first sync engine shared by every Relief client.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::SyncSettings;
pub use error::{Error, Result};
pub use models::{LocalChange, Worksite, WorksiteId};
