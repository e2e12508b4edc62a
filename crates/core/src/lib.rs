//! Concurrent value store, device restart-supervisor, and MQTT forwarder
//! for heterogeneous IoT telemetry.
//!
//! The core is organized bottom-up: register/value types, the filters
//! built on top of them, the value store actor, the device contract,
//! the restart supervisor and pool that run devices, configuration, and
//! finally the MQTT forwarder and Home Assistant discovery that consume
//! the store.

pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod hass;
pub mod mqtt;
pub mod pool;
pub mod register_db;
pub mod store;
pub mod supervisor;
pub mod value;

pub use device::{AvailabilityState, Device, RunOutcome, SharedDevice};
pub use error::{CoreError, Result};
pub use filter::Filter;
pub use pool::Pool;
pub use register_db::{RegisterDb, RegisterFilterConfig};
pub use store::{State, Subscription, ValueStore};
pub use supervisor::{RestartSupervisor, SupervisorConfig, SupervisorState};
pub use value::{Payload, Register, RegisterType, Value};

/// Initializes `tracing` the way the gateway binary does at startup, for
/// tests and tools that want equivalent log output without depending on
/// the gateway crate.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
