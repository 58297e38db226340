//! # ru-meter
//!
//! Lightweight process resource-usage meter: samples the OS accounting
//! counters for the current process on a periodic timer and broadcasts each
//! sample together with the consumption since the previous one. Intended to
//! be embedded inside a larger monitored process (an agent, a worker), not
//! run as a service.
//!
//! ## Core Types
//!
//! - [`UsageSnapshot`]: one complete reading of the 16 `rusage` counters
//! - [`UsageEvent`]: `{ current, diff, timestamp }` emitted every tick
//! - [`MeterEngine`]: the timer-driven sampling engine with start/stop
//!   lifecycle and typed broadcast channels for events and read failures
//! - [`UsageSource`]: the platform-read seam, implemented by [`RusageSource`]
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() -> ru_meter::Result<()> {
//! use ru_meter::{MeterConfig, MeterEngine};
//!
//! let engine = MeterEngine::new(MeterConfig::default())?;
//! let mut events = engine.subscribe();
//! engine.start()?;
//!
//! let event = events.recv().await.expect("engine running");
//! tracing::info!(maxrss = event.current.ru_maxrss, "first sample");
//! engine.stop();
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod snapshot;
pub mod source;

// Re-export commonly used types at crate root
pub use engine::{EngineState, MeterConfig, MeterEngine, DEFAULT_CHANNEL_CAPACITY, DEFAULT_TIMEOUT};
pub use error::{MeterError, Result};
pub use snapshot::{UsageEvent, UsageSnapshot};
pub use source::{RusageSource, UsageSource};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
