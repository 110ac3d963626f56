#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Distributed mutual exclusion over a shared key-value store.
//!
//! A lease maps a key to an ownership token with a store-managed TTL. All
//! mutations are compare-and-swap operations on that token, a background
//! watchdog keeps a held lease alive, and loss of the lease is reported
//! through a callback and a cancellation token.

mod blocking;
pub mod config;
pub mod error;
pub mod lease;
pub mod options;
mod scoped;
pub mod store;
pub mod token;
mod watchdog;

pub mod test_utils;

pub use config::LockConfig;
pub use error::{Error, Result};
pub use lease::{LeaseLock, LeaseStatus, LostCallback, ReleaseHandle};
pub use options::{LockOptions, StalenessPolicy};
pub use store::{LeaseStore, MemoryStore, RedisStore, StoreConfig};
pub use token::{DefaultTokenGenerator, FixedToken, TokenGenerator, UuidTokenGenerator};
pub use tokio_util::sync::CancellationToken;
