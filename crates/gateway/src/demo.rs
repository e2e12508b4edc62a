//! Simulated devices exercising the full store → supervisor → forwarder
//! pipeline without real hardware: a battery monitor and a solar charge
//! controller, each driven by a mean-reverting random walk plus small
//! per-tick noise.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use iotdevice_core::device::{AvailabilityState, RunOutcome};
use iotdevice_core::register_db::RegisterDb;
use iotdevice_core::value::{Register, RegisterType, Value};
use iotdevice_core::{Device, ValueStore};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Mean-reverting random walk, generic over any start/center/sigma.
struct Walk {
    value: f64,
    center: f64,
    mean_reversion: f64,
    sigma: f64,
}

impl Walk {
    fn new(start: f64, center: f64, mean_reversion: f64, sigma: f64) -> Self {
        Self {
            value: start,
            center,
            mean_reversion,
            sigma,
        }
    }

    fn next(&mut self) -> f64 {
        let pull = self.mean_reversion * (self.center - self.value);
        let noise = (fastrand::f64() - 0.5) * 2.0 * self.sigma;
        self.value += pull + noise;
        self.value
    }
}

fn battery_registers() -> Vec<Register> {
    vec![
        Register::new("battery", "Voltage", "Battery voltage", RegisterType::Number, "V", 0, false, 0xED8D, 0.01, false),
        Register::new("battery", "Current", "Battery current", RegisterType::Number, "A", 1, false, 0xED8F, 0.1, true),
        Register::new("battery", "Soc", "State of charge", RegisterType::Number, "%", 2, false, 0x0FFF, 0.1, false),
        Register::new("battery", "Consumed", "Consumed amp hours", RegisterType::Number, "Ah", 3, false, 0x0FFE, -0.1, true),
    ]
}

/// A simulated Victron-style battery monitor.
pub struct RandomBmvDevice {
    name: String,
    register_db: RegisterDb,
    availability: AvailabilityState,
    store: ValueStore,
    poll_interval: Duration,
}

impl RandomBmvDevice {
    pub fn new(name: impl Into<String>, store: ValueStore, poll_interval: Duration) -> Self {
        let register_db = RegisterDb::new();
        register_db.add_all(battery_registers());
        register_db.add(AvailabilityState::register());
        Self {
            name: name.into(),
            register_db,
            availability: AvailabilityState::new(),
            store,
            poll_interval,
        }
    }
}

#[async_trait]
impl Device for RandomBmvDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "BMV-712 (simulated)"
    }

    fn register_db(&self) -> &RegisterDb {
        &self.register_db
    }

    fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    fn subscribe_available(&self) -> broadcast::Receiver<bool> {
        self.availability.subscribe()
    }

    async fn run(&self, cancel: CancellationToken) -> RunOutcome {
        info!(device = self.name(), "starting simulated battery monitor");
        self.availability.set_available(true);
        self.store.fill(self.availability.to_value(self.name())).await;

        let mut voltage = Walk::new(12.8, 12.8, 0.05, 0.02);
        let mut current = Walk::new(-2.0, -1.0, 0.03, 0.3);
        let mut soc = 80.0_f64;
        let mut consumed = 0.0_f64;

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.availability.set_available(false);
                    self.store.fill(self.availability.to_value(self.name())).await;
                    return RunOutcome::ok();
                }
                _ = ticker.tick() => {
                    let v = voltage.next();
                    let c = current.next();
                    soc = (soc + c * 0.01).clamp(0.0, 100.0);
                    consumed += c * self.poll_interval.as_secs_f64() / 3600.0;

                    self.store.fill(Value::numeric_value(self.name(), self.register_db.get("Voltage").unwrap(), v)).await;
                    self.store.fill(Value::numeric_value(self.name(), self.register_db.get("Current").unwrap(), c)).await;
                    self.store.fill(Value::numeric_value(self.name(), self.register_db.get("Soc").unwrap(), soc)).await;
                    self.store.fill(Value::numeric_value(self.name(), self.register_db.get("Consumed").unwrap(), consumed)).await;
                }
            }
        }
    }
}

fn solar_state_register() -> Register {
    let mut m = BTreeMap::new();
    m.insert(0, "Off".to_string());
    m.insert(3, "Bulk".to_string());
    m.insert(4, "Absorption".to_string());
    m.insert(5, "Float".to_string());
    Register::new("solar", "State", "Charger state", RegisterType::Enum, "", 4, false, 0x0201, 1.0, false).with_enum_map(m)
}

fn solar_registers() -> Vec<Register> {
    vec![
        Register::new("solar", "Voltage", "Panel voltage", RegisterType::Number, "V", 0, false, 0xEDBB, 0.01, false),
        Register::new("solar", "Power", "Panel power", RegisterType::Number, "W", 1, false, 0xEDBC, 1.0, false),
        Register::new("solar", "YieldToday", "Yield today", RegisterType::Number, "kWh", 2, false, 0x0013, 0.01, false),
        solar_state_register(),
    ]
}

/// A simulated solar charge controller, cycling through charger states
/// across the day.
pub struct RandomSolarDevice {
    name: String,
    register_db: RegisterDb,
    availability: AvailabilityState,
    store: ValueStore,
    poll_interval: Duration,
    tick: AtomicI64,
}

impl RandomSolarDevice {
    pub fn new(name: impl Into<String>, store: ValueStore, poll_interval: Duration) -> Self {
        let register_db = RegisterDb::new();
        register_db.add_all(solar_registers());
        register_db.add(AvailabilityState::register());
        Self {
            name: name.into(),
            register_db,
            availability: AvailabilityState::new(),
            store,
            poll_interval,
            tick: AtomicI64::new(0),
        }
    }

    fn state_for_tick(tick: i64) -> i64 {
        match tick % 40 {
            0..=9 => 0,
            10..=19 => 3,
            20..=29 => 4,
            _ => 5,
        }
    }
}

#[async_trait]
impl Device for RandomSolarDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "SmartSolar (simulated)"
    }

    fn register_db(&self) -> &RegisterDb {
        &self.register_db
    }

    fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    fn subscribe_available(&self) -> broadcast::Receiver<bool> {
        self.availability.subscribe()
    }

    async fn run(&self, cancel: CancellationToken) -> RunOutcome {
        info!(device = self.name(), "starting simulated solar charger");
        self.availability.set_available(true);
        self.store.fill(self.availability.to_value(self.name())).await;

        let mut voltage = Walk::new(18.0, 18.0, 0.05, 0.1);
        let mut yield_today = 0.0_f64;

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.availability.set_available(false);
                    self.store.fill(self.availability.to_value(self.name())).await;
                    return RunOutcome::ok();
                }
                _ = ticker.tick() => {
                    let tick = self.tick.fetch_add(1, Ordering::SeqCst);
                    let state_idx = Self::state_for_tick(tick);
                    let v = voltage.next();
                    let power = if state_idx == 0 { 0.0 } else { (v * 5.0).max(0.0) };
                    yield_today += power * self.poll_interval.as_secs_f64() / 3_600_000.0;

                    self.store.fill(Value::numeric_value(self.name(), self.register_db.get("Voltage").unwrap(), v)).await;
                    self.store.fill(Value::numeric_value(self.name(), self.register_db.get("Power").unwrap(), power)).await;
                    self.store.fill(Value::numeric_value(self.name(), self.register_db.get("YieldToday").unwrap(), yield_today)).await;
                    self.store.fill(Value::enum_value(self.name(), self.register_db.get("State").unwrap(), state_idx)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_stays_near_center_over_many_steps() {
        let mut walk = Walk::new(10.0, 10.0, 0.2, 0.05);
        for _ in 0..200 {
            walk.next();
        }
        assert!((walk.value - 10.0).abs() < 2.0);
    }

    #[test]
    fn solar_state_cycles_through_known_indices() {
        let indices: Vec<i64> = (0..40).map(RandomSolarDevice::state_for_tick).collect();
        assert!(indices.contains(&0));
        assert!(indices.contains(&3));
        assert!(indices.contains(&4));
        assert!(indices.contains(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn bmv_publishes_availability_then_readings() {
        let store = ValueStore::spawn(1024);
        let device = RandomBmvDevice::new("bmv1", store.clone(), Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let mut sub = store.subscribe(iotdevice_core::Filter::for_device("bmv1")).await;
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { device.run(cancel_clone).await });

        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.register().name(), "Availability");

        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert!(outcome.error.is_none());
    }
}
