//! Resource Governor Library
//!
//! Client-side resource governor for applications talking to remote services.
//! It watches its own load, throttles outbound work as pressure rises and
//! fails fast while a dependency is unhealthy.
//!
//! # Components
//!
//! - `pressure`: folds concurrency, failures, memory, latency and failed
//!   modules into one score in [0, 100]
//! - `degradation`: maps pressure to a tiered operating policy
//! - `breaker`: per-dependency CLOSED / OPEN / HALF_OPEN circuit breakers
//! - `governor`: concurrency-limited FIFO admission queue with expiry
//! - `loader`: deferred module loads with budgeted retry and a tagged fallback
//! - `orchestrator`: periodic sampling and the emergency state machine
//! - `events`: `resource-emergency` lifecycle notifications
//!
//! # Usage
//!
//! ```no_run
//! use resource_governor::{GovernorConfig, ResourceGovernor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let governor = ResourceGovernor::new(GovernorConfig::from_env()?)?.shared();
//! let shutdown = CancellationToken::new();
//! let sampler = governor.start(shutdown.clone());
//!
//! let rows: Result<u32, _> = governor
//!     .submit("supabase", || async { Ok::<_, std::io::Error>(42) })
//!     .await;
//! assert_eq!(rows?, 42);
//!
//! shutdown.cancel();
//! sampler.await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod breaker;
pub mod config;
pub mod degradation;
pub mod error;
pub mod events;
pub mod governor;
pub mod loader;
pub mod orchestrator;
pub mod pressure;
pub mod service;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use config::GovernorConfig;
pub use degradation::{DegradationPolicy, DegradationTable, DegradationTier};
pub use error::{ConfigError, ConfigResult, GovernorError, GovernorResult};
pub use events::{EmergencyNotification, NotificationBus, SharedNotificationBus, EMERGENCY_EVENT};
pub use governor::{GovernorCounters, RequestGovernor};
pub use loader::{FallbackModule, ModuleLoad, ModuleLoadRecord, ModuleLoadRetrier};
pub use orchestrator::{CacheEvictor, EmergencyConfig, EmergencyOrchestrator, EmergencyState, Transition};
pub use pressure::{
    MemoryProbe, PressureConfig, PressureEstimator, PressureReading, PressureSignals,
    StaticMemoryProbe, SystemMemoryProbe,
};
pub use service::{GovernorStatus, ResourceGovernor, SharedResourceGovernor};
