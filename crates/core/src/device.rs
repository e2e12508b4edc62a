//! The device contract and availability tracking. `AvailabilityState`
//! always returns the live receiving end of its broadcast channel, so a
//! subscriber observes every transition made after it subscribes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::register_db::RegisterDb;
use crate::value::{Register, RegisterType, Value};

/// Register name under which availability is published into the store.
pub const AVAILABILITY_REGISTER_NAME: &str = "Availability";

/// Minimum capacity for the availability broadcast channel; availability
/// flips rarely, so this only needs to absorb bursty subscriber churn.
const AVAILABILITY_CHANNEL_CAPACITY: usize = 16;

/// Per-device availability tracking. Devices hold one
/// of these and publish transitions both onto the broadcast channel
/// returned by [`AvailabilityState::subscribe`] and, via the caller, into
/// the value store as an `Availability` enum register.
pub struct AvailabilityState {
    available: AtomicBool,
    tx: broadcast::Sender<bool>,
}

impl Default for AvailabilityState {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(AVAILABILITY_CHANNEL_CAPACITY);
        Self {
            available: AtomicBool::new(false),
            tx,
        }
    }
}

impl AvailabilityState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Sets availability and broadcasts the new value if it changed.
    /// A no-op if the value is unchanged (mirrors I1 at the device layer).
    pub fn set_available(&self, available: bool) {
        let prev = self.available.swap(available, Ordering::SeqCst);
        if prev != available {
            // No active receivers is not an error: it just means nobody is
            // watching this particular transition.
            let _ = self.tx.send(available);
        }
    }

    /// Returns the live receiving end of the availability broadcast: the
    /// channel a caller should actually read from, observing every
    /// transition made after it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.tx.subscribe()
    }

    /// The register under which availability is published into the value
    /// store: a two-value enum, 0 = unavailable, 1 = available.
    pub fn register() -> Register {
        let mut enum_map = std::collections::BTreeMap::new();
        enum_map.insert(0, "Unavailable".to_string());
        enum_map.insert(1, "Available".to_string());
        Register::new(
            "system",
            AVAILABILITY_REGISTER_NAME,
            "Device availability",
            RegisterType::Enum,
            "",
            -1,
            false,
            0,
            1.0,
            false,
        )
        .with_enum_map(enum_map)
    }

    /// The `Value` to fill into the store for the current availability.
    pub fn to_value(&self, device_name: &str) -> Value {
        let idx = if self.is_available() { 1 } else { 0 };
        Value::enum_value(device_name, Self::register(), idx)
    }
}

/// Outcome of a device's `run` loop: the error (if any) and whether it was
/// an *immediate* error — one occurring before the device ever reached a
/// stable running state, which the supervisor treats as a fast-retry
/// signal rather than counting toward the normal backoff schedule.
#[derive(Debug)]
pub struct RunOutcome {
    pub error: Option<anyhow::Error>,
    pub immediate_error: bool,
}

impl RunOutcome {
    pub fn ok() -> Self {
        Self {
            error: None,
            immediate_error: false,
        }
    }

    pub fn immediate(error: anyhow::Error) -> Self {
        Self {
            error: Some(error),
            immediate_error: true,
        }
    }

    pub fn failed(error: anyhow::Error) -> Self {
        Self {
            error: Some(error),
            immediate_error: false,
        }
    }
}

/// The contract every device implementation satisfies.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable identifier used as the device's key in the pool and as the
    /// `%DeviceName%` topic placeholder.
    fn name(&self) -> &str;

    /// Human-readable model string, published in telemetry/structure
    /// messages.
    fn model(&self) -> &str;

    /// The device's register catalog.
    fn register_db(&self) -> &RegisterDb;

    /// Current availability.
    fn is_available(&self) -> bool;

    /// A live feed of availability transitions.
    fn subscribe_available(&self) -> broadcast::Receiver<bool>;

    /// Runs the device until `cancel` fires or an unrecoverable error
    /// occurs. Implementations are expected to publish readings into the
    /// store they were constructed with and keep their `AvailabilityState`
    /// current as connectivity changes.
    async fn run(&self, cancel: CancellationToken) -> RunOutcome;
}

/// Convenience alias for the common `Arc<dyn Device>` pool entries use.
pub type SharedDevice = Arc<dyn Device>;
