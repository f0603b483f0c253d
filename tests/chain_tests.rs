//! Multi-stage chains: wiring, transitive waits, failure propagation in
//! both directions, draining after upstream failure, and the exactly-once
//! guarantee on executor-level callbacks.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipeflow::{Error, ExecutorBuilder, OutputQueue};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Outcomes {
    success: AtomicUsize,
    error: AtomicUsize,
    cancelled: AtomicUsize,
}

impl Outcomes {
    fn total(&self) -> usize {
        self.success.load(Ordering::SeqCst)
            + self.error.load(Ordering::SeqCst)
            + self.cancelled.load(Ordering::SeqCst)
    }
}

/// Wires the three executor-level callbacks to counters.
fn instrument(builder: ExecutorBuilder, outcomes: &Arc<Outcomes>) -> ExecutorBuilder {
    let on_success = outcomes.clone();
    let on_error = outcomes.clone();
    let on_cancelled = outcomes.clone();
    builder
        .on_executor_success(move |_event| {
            on_success.success.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .on_executor_error(move |_event| {
            on_error.error.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .on_executor_cancelled(move |_event| {
            on_cancelled.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
}

#[tokio::test(flavor = "multi_thread")]
async fn two_stage_chain_runs_to_completion() {
    let token = CancellationToken::new();
    let input_count: u32 = 300;
    let (tx, rx) = async_channel::bounded::<u32>(input_count as usize);
    for value in 1..=input_count {
        tx.send(value).await.unwrap();
    }
    drop(tx);

    let upstream_outcomes = Arc::new(Outcomes::default());
    let downstream_outcomes = Arc::new(Outcomes::default());
    let sum = Arc::new(AtomicU32::new(0));

    let doubler = instrument(ExecutorBuilder::new("double").concurrency(4), &upstream_outcomes)
        .map(
            &token,
            rx,
            OutputQueue::internal(),
            |_token, value: u32, _meta| async move { Ok(value * 2) },
        )
        .unwrap();

    let adder = sum.clone();
    let summer = doubler
        .then(instrument(
            ExecutorBuilder::new("sum").concurrency(2),
            &downstream_outcomes,
        ))
        .unwrap()
        .sink(move |_token, value: u32, _meta| {
            let adder = adder.clone();
            async move {
                adder.fetch_add(value, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    summer.wait().await.unwrap();
    assert_eq!(
        sum.load(Ordering::SeqCst),
        input_count * (input_count + 1),
        "sum of doubled 1..=n should be n(n+1)"
    );
    assert_eq!(upstream_outcomes.success.load(Ordering::SeqCst), 1);
    assert_eq!(downstream_outcomes.success.load(Ordering::SeqCst), 1);
    assert_eq!(upstream_outcomes.total(), 1, "exactly one outcome per executor");
    assert_eq!(downstream_outcomes.total(), 1);

    // Both stages are visible from the terminal handle's tracker list.
    let names: Vec<&str> = summer
        .trackers()
        .ordered()
        .iter()
        .map(|t| t.executor_name())
        .collect();
    assert_eq!(names, vec!["double", "sum"]);
    assert!(doubler.output().unwrap().is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn downstream_drains_after_upstream_error_when_configured() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(10);
    for value in 1..=10 {
        tx.send(value).await.unwrap();
    }
    drop(tx);

    let received = Arc::new(AtomicU32::new(0));
    let cancelled_with = Arc::new(Mutex::new(None::<Option<Error>>));

    let producer = ExecutorBuilder::new("producer")
        .map(
            &token,
            rx,
            OutputQueue::internal(),
            |_token, value: u32, _meta| async move {
                if value == 6 {
                    Err(Error::Processing("upstream boom".to_string()))
                } else {
                    Ok(value)
                }
            },
        )
        .unwrap();

    let counter = received.clone();
    let capture = cancelled_with.clone();
    let consumer = producer
        .then(
            ExecutorBuilder::new("consumer")
                .process_upstream_outputs_after_upstream_error(true)
                .on_executor_cancelled(move |event| {
                    *capture.lock().unwrap() = Some(event.error.clone());
                    Ok(())
                }),
        )
        .unwrap()
        .sink(move |_token, _value: u32, _meta| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    let err = consumer.wait().await.unwrap_err();
    assert_eq!(
        err,
        Error::Processing("upstream boom".to_string()),
        "the terminal wait surfaces the upstream error"
    );
    assert_eq!(
        received.load(Ordering::SeqCst),
        5,
        "everything produced before the failure should still be processed"
    );
    let captured = cancelled_with.lock().unwrap().clone();
    assert_eq!(
        captured,
        Some(Some(Error::Processing("upstream boom".to_string()))),
        "the cancelled callback should carry the adopted upstream error"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_error_reaches_the_terminal_wait() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(10);
    for value in 1..=10 {
        tx.send(value).await.unwrap();
    }
    drop(tx);

    let producer = ExecutorBuilder::new("producer")
        .map(
            &token,
            rx,
            OutputQueue::internal(),
            |_token, value: u32, _meta| async move {
                if value == 6 {
                    Err(Error::Processing("upstream boom".to_string()))
                } else {
                    Ok(value)
                }
            },
        )
        .unwrap();

    let consumer = producer
        .then(ExecutorBuilder::new("consumer"))
        .unwrap()
        .sink(|_token, _value: u32, _meta| async move { Ok(()) })
        .unwrap();

    let err = consumer.wait().await.unwrap_err();
    assert_eq!(err, Error::Processing("upstream boom".to_string()));
    assert!(consumer.errored().is_cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn downstream_error_tears_down_the_upstream_stage() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(16);
    for value in 1..=16 {
        tx.send(value).await.unwrap();
    }
    // The queue stays open: without the downstream failure the producer
    // would wait for more input indefinitely.

    let producer = ExecutorBuilder::new("producer")
        .concurrency(2)
        .map(
            &token,
            rx,
            OutputQueue::internal(),
            |_token, value: u32, _meta| async move { Ok(value) },
        )
        .unwrap();

    let consumer = producer
        .then(ExecutorBuilder::new("consumer"))
        .unwrap()
        .sink(|_token, value: u32, _meta| async move {
            if value >= 4 {
                Err(Error::Processing("downstream boom".to_string()))
            } else {
                Ok(())
            }
        })
        .unwrap();

    let err = consumer.wait().await.unwrap_err();
    assert_eq!(err, Error::Processing("downstream boom".to_string()));
    assert_eq!(
        producer.tracker().routines_running(),
        0,
        "the upstream-cancel chain should stop the producer"
    );
    assert!(
        producer.output().unwrap().is_closed(),
        "the producer's queue should be closed after the failure"
    );
    drop(tx);
}

#[tokio::test(flavor = "multi_thread")]
async fn external_cancellation_stops_the_whole_chain() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(4);

    let upstream_outcomes = Arc::new(Outcomes::default());
    let downstream_outcomes = Arc::new(Outcomes::default());

    let feeder = tokio::spawn({
        let tx = tx.clone();
        async move {
            let mut value = 0_u32;
            while tx.send(value).await.is_ok() {
                value = value.wrapping_add(1);
            }
        }
    });

    let stage_one = instrument(ExecutorBuilder::new("one"), &upstream_outcomes)
        .map(
            &token,
            rx,
            OutputQueue::internal(),
            |_token, value: u32, _meta| async move { Ok(value) },
        )
        .unwrap();
    let stage_two = stage_one
        .then(instrument(ExecutorBuilder::new("two"), &downstream_outcomes))
        .unwrap()
        .sink(|_token, _value: u32, _meta| async move { Ok(()) })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let err = stage_two.wait().await.unwrap_err();
    assert_eq!(err, Error::Cancelled);
    assert_eq!(upstream_outcomes.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(downstream_outcomes.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(upstream_outcomes.total(), 1);
    assert_eq!(downstream_outcomes.total(), 1);

    tx.close();
    feeder.await.unwrap();
}

#[tokio::test]
async fn passthrough_token_fires_only_after_wait() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(4);
    tx.send(1).await.unwrap();
    drop(tx);

    let handle = ExecutorBuilder::new("single")
        .sink(&token, rx, |_token, _value: u32, _meta| async move { Ok(()) })
        .unwrap();

    assert!(!handle.cancellation_token().is_cancelled());
    handle.wait().await.unwrap();
    assert!(
        handle.cancellation_token().is_cancelled(),
        "wait unconditionally cancels the passthrough token"
    );
    assert!(
        !handle.errored().is_cancelled(),
        "clean completion must not release the errored signal"
    );
}

#[tokio::test]
async fn executor_error_callback_replaces_the_surfaced_error() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(1);
    tx.send(1).await.unwrap();
    drop(tx);

    let handle = ExecutorBuilder::new("replaced")
        .on_executor_error(|event| {
            assert_eq!(event.error, Error::Processing("original".to_string()));
            Err(Error::Callback("replacement".to_string()))
        })
        .sink(&token, rx, |_token, _value: u32, _meta| async move {
            Err(Error::Processing("original".to_string()))
        })
        .unwrap();

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err, Error::Callback("replacement".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_finished_chain_changes_nothing() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(8);
    for value in 1..=8 {
        tx.send(value).await.unwrap();
    }
    drop(tx);

    let outcomes = Arc::new(Outcomes::default());
    let handle = instrument(ExecutorBuilder::new("done"), &outcomes)
        .sink(&token, rx, |_token, _value: u32, _meta| async move { Ok(()) })
        .unwrap();

    handle.wait().await.unwrap();
    assert_eq!(outcomes.success.load(Ordering::SeqCst), 1);

    token.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        outcomes.total(),
        1,
        "cancelling after completion must not re-fire callbacks"
    );
    handle.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_returns_the_same_error_from_every_clone() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(1);
    tx.send(1).await.unwrap();
    drop(tx);

    let handle = ExecutorBuilder::new("cloned")
        .sink(&token, rx, |_token, _value: u32, _meta| async move {
            Err(Error::Processing("boom".to_string()))
        })
        .unwrap();

    let clone = handle.clone();
    let from_clone = tokio::spawn(async move { clone.wait().await });
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err, Error::Processing("boom".to_string()));
    assert_eq!(
        from_clone.await.unwrap().unwrap_err(),
        Error::Processing("boom".to_string())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn three_stage_chain_wires_trackers_in_order() {
    let token = CancellationToken::new();
    let (tx, rx) = async_channel::bounded::<u32>(64);
    for value in 1..=64 {
        tx.send(value).await.unwrap();
    }
    drop(tx);

    let first = ExecutorBuilder::new("first")
        .map(
            &token,
            rx,
            OutputQueue::internal(),
            |_token, value: u32, _meta| async move { Ok(value + 1) },
        )
        .unwrap();
    let second = first
        .then(ExecutorBuilder::new("second").concurrency(2))
        .unwrap()
        .map(OutputQueue::internal(), |_token, value: u32, _meta| async move {
            Ok(value * 10)
        })
        .unwrap();
    let received = Arc::new(AtomicU32::new(0));
    let counter = received.clone();
    let third = second
        .then(ExecutorBuilder::new("third"))
        .unwrap()
        .sink(move |_token, _value: u32, _meta| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    third.wait().await.unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 64);
    let names: Vec<&str> = third
        .trackers()
        .ordered()
        .iter()
        .map(|t| t.executor_name())
        .collect();
    assert_eq!(names, vec!["first", "second", "third"]);
    // Snapshots serialize for export.
    let json = serde_json::to_string(&third.trackers().snapshots()).unwrap();
    assert!(json.contains("\"second\""));
}
