use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowbus::telemetry;
use flowbus::{
    Event, EventBus, EventBusConfig, EventFlow, HandlerFailure, InMemoryBroker, InMemoryMetrics,
    Value,
};
use tokio::time::sleep;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> EventBusConfig {
    EventBusConfig {
        batch_size: 1,
        broker_poll_interval: Duration::from_millis(5),
        metrics_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn test_end_to_end_next_chain() {
    init_tracing();

    let received = Arc::new(Mutex::new(None));
    let created = Event::new("order.created", |_payload: Value| async move {
        Ok(Value::from("reserved"))
    });
    let reserved = {
        let received = received.clone();
        Event::new("order.reserved", move |payload: Value| {
            let received = received.clone();
            async move {
                *received.lock().unwrap() = Some(payload);
                Ok(Value::Null)
            }
        })
    };
    let flow = EventFlow::new().next(created).next(reserved);

    let bus = EventBus::in_process(test_config());
    bus.register(&flow.flat()).unwrap();
    bus.start();

    let mut order = std::collections::HashMap::new();
    order.insert("id".to_string(), Value::Integer(1));
    bus.publish("order.created", Value::Map(order)).unwrap();

    assert!(wait_for(|| received.lock().unwrap().is_some()).await);
    assert_eq!(
        received.lock().unwrap().clone(),
        Some(Value::String("reserved".to_string()))
    );
    bus.stop();
}

#[tokio::test]
async fn test_saga_receives_failed_handler_output() {
    init_tracing();

    let compensated = Arc::new(Mutex::new(None));
    let charge = Event::new("payment.charge", |_payload: Value| async move {
        Err(HandlerFailure::with_output(
            "card declined",
            Value::from("charge-123"),
        ))
    });
    let refund = {
        let compensated = compensated.clone();
        Event::new("payment.refund", move |payload: Value| {
            let compensated = compensated.clone();
            async move {
                *compensated.lock().unwrap() = Some(payload);
                Ok(Value::Null)
            }
        })
    };
    let flow = EventFlow::new().next(charge).saga(refund);

    let bus = EventBus::in_process(test_config());
    bus.register(&flow.flat()).unwrap();
    bus.start();
    bus.publish("payment.charge", Value::Null).unwrap();

    assert!(wait_for(|| compensated.lock().unwrap().is_some()).await);
    assert_eq!(
        compensated.lock().unwrap().clone(),
        Some(Value::String("charge-123".to_string()))
    );
    bus.stop();
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_dispatch() {
    init_tracing();

    let metrics = Arc::new(InMemoryMetrics::new());
    let survived = Arc::new(AtomicUsize::new(0));

    let explode = Event::new("explode", |payload: Value| async move {
        if payload == Value::Null {
            panic!("handler blew up");
        }
        Ok(payload)
    });
    let normal = {
        let survived = survived.clone();
        Event::new("normal", move |_payload: Value| {
            let survived = survived.clone();
            async move {
                survived.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    };

    let bus = EventBus::new(None, metrics.clone(), test_config());
    bus.register(&[explode, normal]).unwrap();
    bus.start();

    bus.publish("explode", Value::Null).unwrap();
    bus.publish("normal", Value::Null).unwrap();

    assert!(wait_for(|| survived.load(Ordering::SeqCst) == 1).await);
    assert!(
        wait_for(|| metrics.counter(telemetry::ERROR_COUNT, &[("type", "panic")]) >= 1).await
    );
    bus.stop();
}

#[tokio::test]
async fn test_broker_loopback_round_trip() {
    init_tracing();

    let metrics = Arc::new(InMemoryMetrics::new());
    let broker = Arc::new(InMemoryBroker::new());
    let handled = Arc::new(AtomicUsize::new(0));

    let echo = {
        let handled = handled.clone();
        Event::new("echo", move |_payload: Value| {
            let handled = handled.clone();
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    };

    let bus = EventBus::new(Some(broker), metrics.clone(), test_config());
    bus.register(&[echo]).unwrap();
    bus.start();
    bus.publish("echo", Value::from("over the wire")).unwrap();

    assert!(wait_for(|| handled.load(Ordering::SeqCst) == 1).await);
    assert!(metrics.counter(telemetry::PUBLISH_COUNT, &[]) >= 1);
    bus.stop();
}

#[tokio::test]
async fn test_worker_pool_caps_concurrency() {
    init_tracing();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let handler_count = 8;
    let events: Vec<_> = (0..handler_count)
        .map(|_| {
            let in_flight = in_flight.clone();
            let high_water = high_water.clone();
            let done = done.clone();
            Event::new("load.test", move |_payload: Value| {
                let in_flight = in_flight.clone();
                let high_water = high_water.clone();
                let done = done.clone();
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(current, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        })
        .collect();

    let bus = EventBus::in_process(EventBusConfig {
        worker_pool_size: 2,
        ..test_config()
    });
    bus.register(&events).unwrap();
    bus.start();
    bus.publish("load.test", Value::Null).unwrap();

    assert!(wait_for(|| done.load(Ordering::SeqCst) == handler_count).await);
    assert!(high_water.load(Ordering::SeqCst) <= 2);
    bus.stop();
}

#[tokio::test]
async fn test_handler_timeout_abandons_result() {
    init_tracing();

    let metrics = Arc::new(InMemoryMetrics::new());
    let slow = Event::new("slow", |_payload: Value| async move {
        sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });

    let bus = EventBus::new(
        None,
        metrics.clone(),
        EventBusConfig {
            handler_timeout: Duration::from_millis(50),
            ..test_config()
        },
    );
    bus.register(&[slow]).unwrap();
    bus.start();
    bus.publish("slow", Value::Null).unwrap();

    assert!(
        wait_for(|| metrics.counter(telemetry::ERROR_COUNT, &[("type", "timeout")]) >= 1).await
    );
    bus.stop();
}

#[tokio::test]
async fn test_timed_out_handler_still_runs_to_completion() {
    init_tracing();

    let metrics = Arc::new(InMemoryMetrics::new());
    let finished = Arc::new(AtomicUsize::new(0));

    let slow = {
        let finished = finished.clone();
        Event::new("slow.but.steady", move |_payload: Value| {
            let finished = finished.clone();
            async move {
                sleep(Duration::from_millis(200)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    };

    let bus = EventBus::new(
        None,
        metrics.clone(),
        EventBusConfig {
            handler_timeout: Duration::from_millis(50),
            ..test_config()
        },
    );
    bus.register(&[slow]).unwrap();
    bus.start();
    bus.publish("slow.but.steady", Value::Null).unwrap();

    // The timeout is reported first, then the abandoned handler finishes
    // on its own and its result is discarded.
    assert!(
        wait_for(|| metrics.counter(telemetry::ERROR_COUNT, &[("type", "timeout")]) >= 1).await
    );
    assert!(wait_for(|| finished.load(Ordering::SeqCst) == 1).await);
    bus.stop();
}

#[tokio::test]
async fn test_unknown_event_surfaces_on_error_counter() {
    init_tracing();

    let metrics = Arc::new(InMemoryMetrics::new());
    let bus = EventBus::new(None, metrics.clone(), test_config());
    bus.start();

    bus.publish("never.registered", Value::Null).unwrap();

    // The NotFound error drains through the error channel into the
    // callback counter.
    assert!(
        wait_for(|| metrics.counter(telemetry::ERROR_COUNT, &[("type", "callback")]) >= 1).await
    );
    bus.stop();
}

#[tokio::test]
async fn test_queue_depth_sampling_records_gauges() {
    init_tracing();

    let metrics = Arc::new(InMemoryMetrics::new());
    let bus = EventBus::new(None, metrics.clone(), test_config());
    bus.start();

    assert!(
        wait_for(|| {
            metrics.gauge(telemetry::QUEUE_SIZE, &[("queue", "request")]).is_some()
                && metrics.gauge(telemetry::QUEUE_SIZE, &[("queue", "response")]).is_some()
                && metrics.gauge(telemetry::QUEUE_SIZE, &[("queue", "error")]).is_some()
        })
        .await
    );
    bus.stop();
}

#[tokio::test]
async fn test_stop_halts_processing() {
    init_tracing();

    let handled = Arc::new(AtomicUsize::new(0));
    let event = {
        let handled = handled.clone();
        Event::new("late", move |_payload: Value| {
            let handled = handled.clone();
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    };

    let bus = EventBus::in_process(test_config());
    bus.register(&[event]).unwrap();
    bus.start();
    bus.stop();
    bus.stop();

    // Once the dispatch loop exits it releases the queues, so a late
    // publish is rejected and the handler never runs.
    sleep(Duration::from_millis(100)).await;
    assert!(bus.publish("late", Value::Null).is_err());
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}
