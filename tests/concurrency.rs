//! Concurrent registration and delivery.

use dbchange::native::HandleKind;
use dbchange::sim::{SimulatedClient, TableSpec};
use dbchange::{
    handler_fn, ChangeNotifier, EventKind, HandlerResult, NotificationEvent, OperationMask,
    SubscriptionId, SubscriptionOptions,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_concurrent_subscriptions_are_isolated() {
    let sim = Arc::new(SimulatedClient::new());
    let ctx = sim.connect();
    let notifier = Arc::new(ChangeNotifier::new(sim.clone()));

    let seen: Arc<Mutex<Vec<(SubscriptionId, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (id, table) in [(1u64, "HR.EMPLOYEES"), (2, "HR.DEPARTMENTS")] {
        let sink = Arc::clone(&seen);
        let handler = handler_fn(move |id: SubscriptionId, e: &NotificationEvent| -> HandlerResult {
            sink.lock().push((id, e.table_name().to_string()));
            Ok(())
        });
        let handle = notifier
            .register_subscription(
                &ctx,
                SubscriptionId(id),
                &SubscriptionOptions::default().with_rowids(true),
                Arc::new(handler),
            )
            .unwrap();
        handles.push((handle, table));
    }

    let per_thread = 50;
    let barrier = Arc::new(Barrier::new(handles.len()));
    let workers: Vec<_> = handles
        .iter()
        .map(|(handle, table)| {
            let sim = Arc::clone(&sim);
            let barrier = Arc::clone(&barrier);
            let raw = handle.raw();
            let table = table.to_string();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..per_thread {
                    let desc = sim.change_descriptor(
                        None,
                        &[TableSpec::rows(table.as_str(), OperationMask::UPDATE, &["AAAR3KAAEAAAACrAAA"])],
                    );
                    assert!(sim.notify(raw, desc));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), per_thread * 2);
    for (id, table) in seen.iter() {
        let expected = if *id == SubscriptionId(1) { "HR.EMPLOYEES" } else { "HR.DEPARTMENTS" };
        assert_eq!(table, expected);
    }
    assert_eq!(notifier.stats().delivered, (per_thread * 2) as u64);
}

#[test]
fn test_concurrent_registration_of_distinct_ids() {
    let sim = Arc::new(SimulatedClient::new());
    let notifier = Arc::new(ChangeNotifier::new(sim.clone()));

    let workers: Vec<_> = (0..8u64)
        .map(|t| {
            let sim = Arc::clone(&sim);
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || {
                let ctx = sim.connect();
                for i in 0..10 {
                    let id = SubscriptionId(t * 100 + i);
                    let (handle, _events) = notifier
                        .register_with_channel(&ctx, id, &SubscriptionOptions::default())
                        .unwrap();
                    notifier.unregister_subscription(&handle).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(notifier.registry().subscription_count(), 0);
    assert_eq!(sim.allocated(HandleKind::Subscription), 0);
}

#[test]
fn test_racing_duplicate_registration_admits_one() {
    let sim = Arc::new(SimulatedClient::new());
    let ctx = sim.connect();
    let notifier = Arc::new(ChangeNotifier::new(sim.clone()));
    let wins = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let notifier = Arc::clone(&notifier);
            let wins = Arc::clone(&wins);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let result =
                    notifier.register_with_channel(&ctx, SubscriptionId(7), &SubscriptionOptions::default());
                if result.is_ok() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(sim.registered_subscriptions(), 1);
}

#[test]
fn test_unregister_during_delivery() {
    let sim = Arc::new(SimulatedClient::new());
    let ctx = sim.connect();
    let notifier = Arc::new(ChangeNotifier::new(sim.clone()));
    let (handle, events) = notifier
        .register_with_channel(&ctx, SubscriptionId(1), &SubscriptionOptions::default())
        .unwrap();
    let (context, callback) = sim.callback(handle.raw()).unwrap();

    let sender = {
        let sim = Arc::clone(&sim);
        thread::spawn(move || {
            for _ in 0..200 {
                callback(context, sim.event_descriptor(EventKind::Shutdown, None));
            }
        })
    };
    notifier.unregister_subscription(&handle).unwrap();
    sender.join().unwrap();

    // Every notification was either delivered or counted as late.
    let stats = notifier.stats();
    assert_eq!(stats.delivered + stats.late, 200);
    assert!(events.dropped() <= stats.delivered);
}
