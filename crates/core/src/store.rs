//! The value store: a single-writer actor holding the latest value per
//! `(device, register)` and fanning out changes to filtered subscribers.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::filter::Filter;
use crate::value::{Payload, Value};

/// Minimum capacity of the store's input queue.
pub const MIN_INPUT_CAPACITY: usize = 1024;
/// Minimum capacity of a subscription's output queue.
pub const MIN_SUBSCRIPTION_CAPACITY: usize = 128;

/// `map[deviceName] -> map[registerName] -> Value`, as returned by
/// [`ValueStore::get_state`].
pub type State = HashMap<String, HashMap<String, Value>>;

/// A key uniquely identifying one `(device, register)` slot in the store.
type RegisterKey = (String, String);

enum Msg {
    Fill(Value),
    Subscribe {
        filter: Filter,
        reply: oneshot::Sender<Subscription>,
    },
    ReadState {
        filter: Filter,
        reply: oneshot::Sender<State>,
    },
    Shutdown,
}

struct SubscriptionEntry {
    filter: Filter,
    sender: mpsc::Sender<Value>,
    sent_once: std::collections::HashSet<RegisterKey>,
}

/// Handle to the value store actor. Cheap to clone; all clones share the
/// same underlying actor task.
#[derive(Clone)]
pub struct ValueStore {
    tx: mpsc::Sender<Msg>,
}

/// A filtered live feed of values for one consumer. Dropping a
/// `Subscription` is the idempotent-shutdown signal: the store observes
/// the closed output channel the next time it tries to forward a value to
/// it and removes the entry.
pub struct Subscription {
    output: mpsc::Receiver<Value>,
}

impl Subscription {
    /// Receive the next value, or `None` once the store has shut down.
    pub async fn recv(&mut self) -> Option<Value> {
        self.output.recv().await
    }

    /// Non-blocking receive, for callers polling alongside other work.
    pub fn try_recv(&mut self) -> Result<Value, mpsc::error::TryRecvError> {
        self.output.try_recv()
    }

    /// Explicit shutdown; equivalent to dropping the subscription, spelled
    /// out for callers that want an unambiguous call site.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl ValueStore {
    /// Spawns the actor task and returns a handle to it. `input_capacity`
    /// must be at least [`MIN_INPUT_CAPACITY`]; values below that are
    /// clamped up.
    pub fn spawn(input_capacity: usize) -> Self {
        let capacity = input_capacity.max(MIN_INPUT_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(run_actor(rx));
        Self { tx }
    }

    /// Best-effort enqueue. Blocks if the input queue is full (never drops
    /// silently). A no-op once the store has shut down.
    pub async fn fill(&self, value: Value) {
        if self.tx.send(Msg::Fill(value)).await.is_err() {
            debug!("value store: fill after shutdown, dropping");
        }
    }

    /// Non-blocking variant for callers that must never await here
    /// (e.g. a `try_send`-only producer loop); returns `Err` if the input
    /// queue is momentarily full.
    pub fn try_fill(&self, value: Value) -> Result<(), mpsc::error::TrySendError<()>> {
        self.tx.try_send(Msg::Fill(value)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => mpsc::error::TrySendError::Full(()),
            mpsc::error::TrySendError::Closed(_) => mpsc::error::TrySendError::Closed(()),
        })
    }

    /// Subscribe with the given filter. The returned subscription is
    /// guaranteed registered with the actor before this call returns, so
    /// it will observe every matching value accepted as a change from this
    /// point on.
    pub async fn subscribe(&self, filter: Filter) -> Subscription {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Msg::Subscribe {
                filter,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            // Store already shut down: hand back a subscription whose
            // output channel is immediately closed.
            let (_tx, rx) = mpsc::channel(1);
            return Subscription { output: rx };
        }
        reply_rx.await.expect("value store actor dropped reply sender")
    }

    /// Atomic snapshot of current state matching `filter`.
    pub async fn get_state(&self, filter: Filter) -> State {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Msg::ReadState {
                filter,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return State::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Flattened form of [`ValueStore::get_state`].
    pub async fn get_slice(&self, filter: Filter) -> Vec<Value> {
        self.get_state(filter)
            .await
            .into_values()
            .flat_map(|device_state| device_state.into_values())
            .collect()
    }

    /// Idempotent shutdown: drains the actor and closes all subscription
    /// outputs.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown).await;
    }
}

async fn run_actor(mut rx: mpsc::Receiver<Msg>) {
    let mut state: State = State::new();
    let mut subscriptions: Vec<SubscriptionEntry> = Vec::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            Msg::Fill(value) => handle_fill(&mut state, &mut subscriptions, value),
            Msg::Subscribe { filter, reply } => {
                let (tx, output) = mpsc::channel(MIN_SUBSCRIPTION_CAPACITY);
                subscriptions.push(SubscriptionEntry {
                    filter,
                    sender: tx,
                    sent_once: std::collections::HashSet::new(),
                });
                let _ = reply.send(Subscription { output });
            }
            Msg::ReadState { filter, reply } => {
                let snapshot = read_state(&state, &filter);
                let _ = reply.send(snapshot);
            }
            Msg::Shutdown => {
                subscriptions.clear();
                break;
            }
        }
    }
}

fn handle_fill(state: &mut State, subscriptions: &mut Vec<SubscriptionEntry>, value: Value) {
    let device = value.device_name().to_string();
    let register_name = value.register().name().to_string();

    let prev = state
        .get(&device)
        .and_then(|regs| regs.get(&register_name));

    if let Some(prev) = prev {
        if prev.equals(&value) {
            // I1: not a change, no broadcast, no state mutation.
            return;
        }
    }

    subscriptions.retain_mut(|sub| {
        if !sub.filter.matches(&value) {
            return true;
        }

        let key: RegisterKey = (device.clone(), register_name.clone());
        if sub.filter.only_once {
            if sub.sent_once.contains(&key) {
                return true;
            }
            sub.sent_once.insert(key);
        }

        match sub.sender.try_send(value.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    device = %device,
                    register = %register_name,
                    "value store: subscription output full, dropping delivery"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });

    if value.payload().is_null() {
        if let Some(regs) = state.get_mut(&device) {
            regs.remove(&register_name);
        }
    } else {
        state.entry(device).or_default().insert(register_name, value);
    }
}

fn read_state(state: &State, filter: &Filter) -> State {
    let mut out = State::new();
    for (device, regs) in state {
        if !filter.include_devices.is_empty() && !filter.include_devices.contains(device) {
            continue;
        }
        let mut kept = HashMap::new();
        for (name, value) in regs {
            if filter.matches(value) {
                kept.insert(name.clone(), value.clone());
            }
        }
        if !kept.is_empty() {
            out.insert(device.clone(), kept);
        }
    }
    out
}

/// `Payload::Null` never survives into `state` — asserted here for callers
/// that want to sanity-check invariant I2 in tests.
pub fn is_live(payload: &Payload) -> bool {
    !payload.is_null()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Register, RegisterType};
    use std::time::Duration;

    fn number_register(name: &str) -> Register {
        Register::new("battery", name, "d", RegisterType::Number, "V", 0, false, 0, 0.1, false)
    }

    async fn recv_timeout(sub: &mut Subscription) -> Option<Value> {
        tokio::time::timeout(Duration::from_millis(500), sub.recv())
            .await
            .expect("subscription did not deliver in time")
    }

    // -- Scenario 1: dedup and fan-out ---------------------------------

    #[tokio::test]
    async fn dedup_and_fan_out() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        let mut sub = store.subscribe(Filter::empty()).await;

        let reg = number_register("V");
        store.fill(Value::numeric_value("dev1", reg.clone(), 12.3)).await;
        store.fill(Value::numeric_value("dev1", reg.clone(), 12.3)).await;
        store.fill(Value::numeric_value("dev1", reg.clone(), 12.4)).await;

        let first = recv_timeout(&mut sub).await.unwrap();
        assert_eq!(first.payload(), &Payload::Numeric(12.3));
        let second = recv_timeout(&mut sub).await.unwrap();
        assert_eq!(second.payload(), &Payload::Numeric(12.4));

        // No third message: the duplicate 12.3 must not have broadcast.
        assert!(tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .is_err());

        let state = store.get_state(Filter::empty()).await;
        assert_eq!(state["dev1"]["V"].payload(), &Payload::Numeric(12.4));
    }

    // -- Scenario 2: null removal ---------------------------------------

    #[tokio::test]
    async fn null_removes_from_state() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        let reg = number_register("R");
        store.fill(Value::numeric_value("d", reg.clone(), 1.0)).await;
        store.fill(Value::null("d", reg.clone())).await;

        let state = store.get_state(Filter::empty()).await;
        assert!(state.get("d").is_none());
    }

    #[tokio::test]
    async fn null_respects_skip_null_filter() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        let reg = number_register("R");
        store.fill(Value::numeric_value("d", reg.clone(), 1.0)).await;

        let mut sees_null = store.subscribe(Filter::default()).await;
        let mut skips_null = store.subscribe(Filter::default().skip_null()).await;

        store.fill(Value::null("d", reg.clone())).await;

        let got = recv_timeout(&mut sees_null).await.unwrap();
        assert!(got.payload().is_null());

        assert!(tokio::time::timeout(Duration::from_millis(100), skips_null.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn refilling_after_null_broadcasts_again() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        let reg = number_register("R");
        let mut sub = store.subscribe(Filter::empty()).await;

        store.fill(Value::numeric_value("d", reg.clone(), 1.0)).await;
        store.fill(Value::null("d", reg.clone())).await;
        store.fill(Value::numeric_value("d", reg.clone(), 1.0)).await;

        let msgs = [
            recv_timeout(&mut sub).await.unwrap(),
            recv_timeout(&mut sub).await.unwrap(),
            recv_timeout(&mut sub).await.unwrap(),
        ];
        assert_eq!(msgs[0].payload(), &Payload::Numeric(1.0));
        assert!(msgs[1].payload().is_null());
        assert_eq!(msgs[2].payload(), &Payload::Numeric(1.0));
    }

    // -- P3: onlyOnce -----------------------------------------------------

    #[tokio::test]
    async fn only_once_delivers_at_most_one_per_register() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        let reg = number_register("R");
        let mut sub = store.subscribe(Filter::default().only_once()).await;

        store.fill(Value::numeric_value("d", reg.clone(), 1.0)).await;
        store.fill(Value::numeric_value("d", reg.clone(), 2.0)).await;
        store.fill(Value::numeric_value("d", reg.clone(), 3.0)).await;

        let first = recv_timeout(&mut sub).await.unwrap();
        assert_eq!(first.payload(), &Payload::Numeric(1.0));

        assert!(tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .is_err());
    }

    // -- P4: filter consistency ------------------------------------------

    #[tokio::test]
    async fn get_state_with_filter_is_subset_of_empty_filter() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        store.fill(Value::numeric_value("dev1", number_register("A"), 1.0)).await;
        store.fill(Value::numeric_value("dev2", number_register("B"), 2.0)).await;

        let filtered = store.get_state(Filter::for_device("dev1")).await;
        let full = store.get_state(Filter::empty()).await;

        assert!(filtered.contains_key("dev1"));
        assert!(!filtered.contains_key("dev2"));
        for (device, regs) in &filtered {
            for name in regs.keys() {
                assert!(full[device].contains_key(name));
            }
        }
    }

    // -- P5: per-producer ordering ----------------------------------------

    #[tokio::test]
    async fn single_producer_ordering_preserved() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        let mut sub = store.subscribe(Filter::empty()).await;

        for i in 0..20 {
            store
                .fill(Value::numeric_value("d", number_register("R"), i as f64))
                .await;
        }

        for i in 0..20 {
            let v = recv_timeout(&mut sub).await.unwrap();
            assert_eq!(v.payload(), &Payload::Numeric(i as f64));
        }
    }

    // -- Backpressure: full subscriber does not affect others -----------

    #[tokio::test]
    async fn full_subscription_drops_without_affecting_others() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        let mut slow = store.subscribe(Filter::empty()).await;
        let mut fast = store.subscribe(Filter::empty()).await;

        // Fill more than the subscription capacity without draining `slow`.
        for i in 0..(MIN_SUBSCRIPTION_CAPACITY + 10) {
            store
                .fill(Value::numeric_value("d", number_register("R"), i as f64))
                .await;
        }

        // `fast` drains promptly and sees the last value published.
        let mut last = None;
        while let Ok(Some(v)) = tokio::time::timeout(Duration::from_millis(50), fast.recv()).await {
            last = Some(v);
        }
        assert_eq!(
            last.unwrap().payload(),
            &Payload::Numeric((MIN_SUBSCRIPTION_CAPACITY + 9) as f64)
        );

        // `slow` still only holds its buffered capacity worth of messages,
        // the oldest ones (no silent drop of *other* subscribers' data).
        let mut count = 0;
        while tokio::time::timeout(Duration::from_millis(50), slow.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            count += 1;
        }
        assert_eq!(count, MIN_SUBSCRIPTION_CAPACITY);
    }

    // -- Shutdown ----------------------------------------------------------

    #[tokio::test]
    async fn shutdown_closes_subscription_outputs() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        let mut sub = store.subscribe(Filter::empty()).await;
        store.shutdown().await;
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        store.shutdown().await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn get_slice_flattens_state() {
        let store = ValueStore::spawn(MIN_INPUT_CAPACITY);
        store.fill(Value::numeric_value("d1", number_register("A"), 1.0)).await;
        store.fill(Value::numeric_value("d1", number_register("B"), 2.0)).await;
        store.fill(Value::numeric_value("d2", number_register("A"), 3.0)).await;

        let slice = store.get_slice(Filter::empty()).await;
        assert_eq!(slice.len(), 3);
    }
}
