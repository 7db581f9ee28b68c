//! Sharded single-flight call deduplication.
//!
//! When many threads or tasks ask for the same computation at the same time,
//! [`Group`] runs it once and hands every caller a clone of the one outcome.
//! It exists to stop a "thundering herd" from recomputing the same missing
//! cache entry or hammering a slow backend with identical requests.
//!
//! - **One execution per key in flight**: the first caller becomes the owner
//!   and runs the computation; everyone arriving before it finishes waits.
//! - **No caching**: the key is released the moment the outcome is published.
//!   The next call starts fresh work.
//! - **Sharded registry**: keys are hashed (XXH3) onto a power-of-two number
//!   of independently locked shards, so unrelated keys rarely contend.
//! - **Panic safe**: a panicking computation becomes
//!   [`FlightError::Panicked`] for every caller instead of leaving waiters
//!   blocked.
//! - **Per-caller deadlines**: [`Group::execute_until`] and
//!   [`Group::execute_timeout`] bound one caller's wait without touching the
//!   shared computation.
//! - **Async support**: [`Group::execute_async`] (feature `async-tokio`) runs
//!   the computation on the tokio runtime; dropping a caller's future never
//!   cancels it.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//!
//! use shardflight::Group;
//!
//! let group: Group<String, String> = Group::new();
//! let loads = Arc::new(AtomicUsize::new(0));
//!
//! let handles: Vec<_> = (0..5)
//!    .map(|_| {
//!       let group = group.clone();
//!       let loads = Arc::clone(&loads);
//!       thread::spawn(move || {
//!          group.execute("user:123", |key| {
//!             loads.fetch_add(1, Ordering::SeqCst);
//!             thread::sleep(Duration::from_millis(50));
//!             Ok(format!("data_of_{key}"))
//!          })
//!       })
//!    })
//!    .collect();
//!
//! for handle in handles {
//!    assert_eq!(handle.join().unwrap().unwrap(), "data_of_user:123");
//! }
//! // Usually 1; a thread that arrives after the flight landed starts a new one.
//! assert!(loads.load(Ordering::SeqCst) >= 1);
//! assert_eq!(group.in_flight(), 0);
//! ```

/// In-flight call record.
mod call;

/// Error types.
mod error;

/// Deduplication engine.
mod group;

/// Key hashing and shard layout.
mod shard;

/// Internal completion gate.
mod state;

pub use error::{ConfigError, FlightError};
pub use group::Group;
pub use shard::{ShardKey, DEFAULT_SHARDS};
