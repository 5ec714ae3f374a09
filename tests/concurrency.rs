//! Registration changes racing with dispatch.

use crossbeam_channel::{bounded, unbounded};
use feedwatch::{
    listener, Listener, ManagerConfig, MemoryStore, NotificationManager, RegistrationId, Scope,
    WorkerConfig,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn shared_manager() -> Arc<NotificationManager> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Arc::new(NotificationManager::new(ManagerConfig::default().with_worker(
        WorkerConfig::default().with_poll_interval(Duration::from_millis(5)),
    )))
}

#[test]
fn test_no_delivery_after_unregister_returns() {
    let manager = shared_manager();
    let store = MemoryStore::new();
    manager.start(Arc::new(store.clone())).unwrap();

    let removed = Arc::new(AtomicBool::new(false));
    let late = Arc::new(AtomicUsize::new(0));
    let (entered_tx, entered_rx) = bounded(1);
    let (flag, late_count) = (Arc::clone(&removed), Arc::clone(&late));
    let cb = listener(move |_| {
        let _ = entered_tx.try_send(());
        thread::sleep(Duration::from_millis(50));
        if flag.load(Ordering::SeqCst) {
            late_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });
    manager.register_listener(cb.clone(), "users").unwrap();

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for n in 0..20 {
                store.insert("users", json!({"n": n})).unwrap();
            }
        })
    };

    entered_rx.recv_timeout(TIMEOUT).unwrap();
    // Blocks until the in-flight delivery completes.
    assert_eq!(manager.unregister_listener(&cb), 1);
    removed.store(true, Ordering::SeqCst);

    writer.join().unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(late.load(Ordering::SeqCst), 0);

    manager.stop().unwrap();
}

#[test]
fn test_listener_unregisters_itself() {
    let manager = shared_manager();
    let store = MemoryStore::new();
    manager.start(Arc::new(store.clone())).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<RegistrationId>>> = Arc::new(Mutex::new(None));
    let (done_tx, done_rx) = unbounded();

    let cb = {
        let manager = Arc::clone(&manager);
        let calls = Arc::clone(&calls);
        let slot = Arc::clone(&slot);
        listener(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot.lock().take() {
                manager.unregister_registration(id);
            }
            let _ = done_tx.send(());
            Ok(())
        })
    };
    let id = manager.register_listener(cb, "users").unwrap();
    *slot.lock() = Some(id);

    store.insert("users", json!({"n": 1})).unwrap();
    done_rx.recv_timeout(TIMEOUT).unwrap();
    store.insert("users", json!({"n": 2})).unwrap();

    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.listener_count(), 0);

    manager.stop().unwrap();
}

#[test]
fn test_register_from_callback() {
    let manager = shared_manager();
    let store = MemoryStore::new();
    manager.start(Arc::new(store.clone())).unwrap();

    let (orders_tx, orders_rx) = unbounded();
    let orders_cb: Listener = listener(move |event| {
        let _ = orders_tx.send(event.clone());
        Ok(())
    });

    let registered = Arc::new(AtomicBool::new(false));
    let cb = {
        let manager = Arc::clone(&manager);
        let registered = Arc::clone(&registered);
        listener(move |_| {
            if !registered.swap(true, Ordering::SeqCst) {
                manager.register_listener(orders_cb.clone(), "orders")?;
            }
            Ok(())
        })
    };
    manager.register_listener(cb, "users").unwrap();

    store.insert("users", json!({})).unwrap();
    let deadline = std::time::Instant::now() + TIMEOUT;
    while !manager.is_watching("orders") {
        assert!(std::time::Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }

    store.insert("orders", json!({"id": 7})).unwrap();
    let event = orders_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(event.field("id"), Some(&json!(7)));

    manager.stop().unwrap();
}

#[test]
fn test_registration_churn_during_dispatch() {
    let manager = shared_manager();
    let store = MemoryStore::new();
    manager.start(Arc::new(store.clone())).unwrap();

    let (tx, rx) = unbounded();
    let stable = listener(move |event| {
        let _ = tx.send(event.field("n").cloned());
        Ok(())
    });
    manager.register_listener(stable, "users").unwrap();

    let churn = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            for i in 0..200 {
                let cb = listener(|_| Ok(()));
                let scope = if i % 2 == 0 {
                    Scope::collection("users")
                } else {
                    Scope::Global
                };
                manager.register_listener(cb.clone(), scope).unwrap();
                manager.unregister_listener(&cb);
            }
        })
    };

    for n in 0..100 {
        store.insert("users", json!({"n": n})).unwrap();
    }
    churn.join().unwrap();

    for n in 0..100 {
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some(json!(n)));
    }
    assert_eq!(manager.listener_count(), 1);

    manager.stop().unwrap();
}

#[test]
fn test_collections_delivered_independently() {
    let manager = shared_manager();
    let store = MemoryStore::new();
    manager.start(Arc::new(store.clone())).unwrap();

    // A blocked listener on one collection does not stall the other.
    let (release_tx, release_rx) = bounded::<()>(0);
    manager
        .register_listener(
            listener(move |_| {
                let _ = release_rx.recv_timeout(TIMEOUT);
                Ok(())
            }),
            "slow",
        )
        .unwrap();
    let (tx, rx) = unbounded();
    manager
        .register_listener(
            listener(move |event| {
                let _ = tx.send(event.collection_name().to_string());
                Ok(())
            }),
            "fast",
        )
        .unwrap();

    store.insert("slow", json!({})).unwrap();
    store.insert("fast", json!({})).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "fast");

    drop(release_tx);
    manager.stop().unwrap();
}

#[test]
fn test_listeners_unregister_each_other_across_collections() {
    let manager = shared_manager();
    let store = MemoryStore::new();
    manager.start(Arc::new(store.clone())).unwrap();

    // Both callbacks are in flight on their own worker threads before either
    // removes the other.
    let meet = Arc::new(Barrier::new(2));
    let slots: Arc<Mutex<Vec<Option<Listener>>>> = Arc::new(Mutex::new(vec![None, None]));
    let (done_tx, done_rx) = unbounded();

    let make = |me: usize| {
        let manager = Arc::clone(&manager);
        let meet = Arc::clone(&meet);
        let slots = Arc::clone(&slots);
        let done_tx = done_tx.clone();
        listener(move |_| {
            meet.wait();
            let other = slots.lock()[1 - me].clone();
            let removed = other.map_or(0, |other| manager.unregister_listener(&other));
            let _ = done_tx.send((me, removed));
            Ok(())
        })
    };
    let first = make(0);
    let second = make(1);
    slots.lock()[0] = Some(first.clone());
    slots.lock()[1] = Some(second.clone());

    manager.register_listener(first, "a").unwrap();
    manager.register_listener(second, "b").unwrap();

    store.insert("a", json!({})).unwrap();
    store.insert("b", json!({})).unwrap();

    let mut finished = vec![
        done_rx.recv_timeout(TIMEOUT).unwrap(),
        done_rx.recv_timeout(TIMEOUT).unwrap(),
    ];
    finished.sort();
    assert_eq!(finished, vec![(0, 1), (1, 1)]);
    assert_eq!(manager.listener_count(), 0);

    // Both workers are still free to deliver.
    let (tx, rx) = unbounded();
    manager
        .register_listener(
            listener(move |event| {
                let _ = tx.send(event.collection_name().to_string());
                Ok(())
            }),
            Scope::collections(["a", "b"]),
        )
        .unwrap();
    store.insert("a", json!({})).unwrap();
    store.insert("b", json!({})).unwrap();
    let mut seen = vec![
        rx.recv_timeout(TIMEOUT).unwrap(),
        rx.recv_timeout(TIMEOUT).unwrap(),
    ];
    seen.sort();
    assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);

    manager.stop().unwrap();
    assert!(manager.worker_statuses().is_empty());
}
