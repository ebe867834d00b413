//! keypool — API key rotation and failover for rate-limited generation APIs.
//!
//! Each provider class owns a `KeyRotationScheduler`. Call sites ask it
//! for a key, make the provider call themselves, and report the outcome;
//! the scheduler handles round-robin, error backoff, daily accounting
//! and long-term quarantine.

pub mod adapters;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod pool;
pub mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use pool::dispatch::{with_key, DispatchError, Dispatcher};
pub use pool::registry::PoolRegistry;
pub use pool::{CallOutcome, KeyRotationScheduler, KeySnapshot, KeyState, PoolStats};
