//! Signal routing, match rule bookkeeping and owner resolution against the
//! mock bus.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::MockBus;
use minibus::{
    Connection, MatchRule, Message, NameRequest, ObjectPath, OwnerChange, ServiceOwnerObserver,
    SignalHandler, Value,
};

const SIGNAL_PATH: &ObjectPath = ObjectPath::new_const(b"/com/example/App");
const IFACE: &str = "com.example.App";

async fn connect(bus: &MockBus) -> Connection {
    Connection::builder()
        .address(bus.address())
        .connect()
        .await
        .expect("connect to mock bus")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("condition not reached in time");
}

struct Nop;

impl SignalHandler for Nop {
    fn on_signal(&self, _: &Message) {}
}

#[derive(Default)]
struct Collector {
    values: Mutex<Vec<u32>>,
}

impl Collector {
    fn values(&self) -> Vec<u32> {
        self.values.lock().unwrap().clone()
    }
}

impl SignalHandler for Collector {
    fn on_signal(&self, message: &Message) {
        if let Some(Value::Uint32(value)) = message.body().first() {
            self.values.lock().unwrap().push(*value);
        }
    }
}

#[derive(Default)]
struct Owners {
    events: Mutex<Vec<OwnerChange>>,
}

impl Owners {
    fn events(&self) -> Vec<OwnerChange> {
        self.events.lock().unwrap().clone()
    }
}

impl ServiceOwnerObserver for Owners {
    fn owner_changed(&self, change: &OwnerChange) {
        self.events.lock().unwrap().push(change.clone());
    }
}

#[tokio::test]
async fn shared_rules_install_and_remove_once() {
    let bus = MockBus::spawn().await;
    let c = connect(&bus).await;

    let rule = MatchRule::signal().with_interface(IFACE).with_member("Pulse");

    let h1 = c.watch(rule.clone(), Arc::new(Nop)).await.expect("first");
    let h2 = c.watch(rule.clone(), Arc::new(Nop)).await.expect("second");
    let h3 = c.watch(rule, Arc::new(Nop)).await.expect("third");

    assert_eq!(bus.add_match_count().await, 1);

    drop(h1);
    drop(h2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.remove_match_count().await, 0);

    drop(h3);

    // The removal is fire and forget, poll until the bus has seen it.
    for _ in 0..500 {
        if bus.remove_match_count().await == 1 {
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("RemoveMatch was not observed");
}

#[tokio::test]
async fn signals_fan_out_in_order_until_unsubscribed() {
    let bus = MockBus::spawn().await;
    let emitter = connect(&bus).await;
    let watcher = connect(&bus).await;

    let collector = Arc::new(Collector::default());

    let rule = MatchRule::signal().with_interface(IFACE).with_member("Pulse");
    let handle = watcher
        .watch(rule, collector.clone())
        .await
        .expect("subscribe");

    for value in 1..=5u32 {
        emitter
            .send(Message::signal(SIGNAL_PATH, IFACE, "Pulse").with_arg(value))
            .expect("emit");
    }

    wait_until(|| collector.values().len() == 5).await;
    assert_eq!(collector.values(), vec![1, 2, 3, 4, 5]);

    drop(handle);

    emitter
        .send(Message::signal(SIGNAL_PATH, IFACE, "Pulse").with_arg(6u32))
        .expect("emit after unsubscribe");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collector.values(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn rules_filter_by_member() {
    let bus = MockBus::spawn().await;
    let emitter = connect(&bus).await;
    let watcher = connect(&bus).await;

    let collector = Arc::new(Collector::default());

    let rule = MatchRule::signal().with_interface(IFACE).with_member("Pulse");
    let _handle = watcher
        .watch(rule, collector.clone())
        .await
        .expect("subscribe");

    emitter
        .send(Message::signal(SIGNAL_PATH, IFACE, "Other").with_arg(1u32))
        .expect("emit non-matching");
    emitter
        .send(Message::signal(SIGNAL_PATH, IFACE, "Pulse").with_arg(2u32))
        .expect("emit matching");

    wait_until(|| !collector.values().is_empty()).await;
    assert_eq!(collector.values(), vec![2]);
}

#[tokio::test]
async fn namespace_watch_sees_registrations_and_releases() {
    let bus = MockBus::spawn().await;
    let service = connect(&bus).await;
    let watcher = connect(&bus).await;

    let name = "com.example.app.backend";
    let owners = Arc::new(Owners::default());

    let handle = watcher
        .resolve_service_owner("com.example.app.*", owners.clone())
        .await
        .expect("watch namespace");

    service
        .register_name(NameRequest::new(name))
        .await
        .expect("acquire");

    wait_until(|| owners.events().len() == 1).await;

    let unique = service.unique_name().expect("unique name");
    assert_eq!(
        owners.events()[0],
        OwnerChange {
            name: name.to_owned(),
            old_owner: None,
            new_owner: Some(unique.clone()),
        }
    );

    assert!(service.release_name(name).await.expect("release"));

    wait_until(|| owners.events().len() == 2).await;
    assert_eq!(
        owners.events()[1],
        OwnerChange {
            name: name.to_owned(),
            old_owner: Some(unique.clone()),
            new_owner: None,
        }
    );

    // Names outside the namespace do not reach the observer.
    service
        .register_name(NameRequest::new("com.example.other"))
        .await
        .expect("unrelated name");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(owners.events().len(), 2);

    drop(handle);

    // A fresh watch over an already owned name sees a synthetic initial
    // event.
    service
        .register_name(NameRequest::new(name))
        .await
        .expect("acquire again");

    let fresh = Arc::new(Owners::default());
    let _handle = watcher
        .resolve_service_owner("com.example.app.*", fresh.clone())
        .await
        .expect("watch again");

    let events = fresh.events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0],
        OwnerChange {
            name: name.to_owned(),
            old_owner: None,
            new_owner: Some(unique),
        }
    );
}

#[tokio::test]
async fn exact_owner_watch_synthesizes_the_current_owner() {
    let bus = MockBus::spawn().await;
    let service = connect(&bus).await;
    let watcher = connect(&bus).await;

    let name = "com.example.app.settings";

    service
        .register_name(NameRequest::new(name))
        .await
        .expect("acquire");

    let owners = Arc::new(Owners::default());
    let _handle = watcher
        .resolve_service_owner(name, owners.clone())
        .await
        .expect("watch exact name");

    let events = owners.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, name);
    assert_eq!(events[0].old_owner, None);
    assert_eq!(events[0].new_owner, service.unique_name());
}

#[tokio::test]
async fn absent_name_produces_no_initial_event() {
    let bus = MockBus::spawn().await;
    let watcher = connect(&bus).await;

    let owners = Arc::new(Owners::default());
    let _handle = watcher
        .resolve_service_owner("com.example.app.absent", owners.clone())
        .await
        .expect("watch absent name");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(owners.events().is_empty());
}
