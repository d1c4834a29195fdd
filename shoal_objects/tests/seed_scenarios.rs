//! Producer/consumer seed scenario: one shared list plus a sentinel,
//! multiple producers appending and multiple consumers draining
//! concurrently. Split into two tests because the two properties the
//! scenario asserts need different harnesses to check honestly:
//! exactly-once delivery needs real concurrency to be worth anything,
//! while FIFO ordering is a property of `List` itself that a racy
//! multi-consumer recording step would only obscure (whichever consumer
//! thread wins the mutex to record an item doesn't necessarily match the
//! order its `pop_front` transaction actually committed in).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use shoal_common::consts::SEGMENT_MIN_SIZE;
use shoal_shm::Segment;
use shoal_txn::Engine;

use shoal_objects::{new_value, read_value, List, ScalarValue};

fn engine(tag: &str) -> Engine {
    let name = format!("test_prodcons_{tag}_{}", std::process::id());
    let segment = Segment::create(&name, SEGMENT_MIN_SIZE * 1024).unwrap();
    Engine::new(Arc::new(segment))
}

const SENTINEL: i64 = i64::MIN;

fn encode(producer: usize, seq: i64) -> i64 {
    ((producer as i64) << 32) | seq
}

fn decode(encoded: i64) -> (usize, i64) {
    ((encoded >> 32) as usize, encoded & 0xFFFF_FFFF)
}

/// Every integer appended by every producer is observed by exactly one
/// consumer, and every producer's sentinel is observed by exactly one
/// consumer — regardless of how producer and consumer transactions
/// interleave.
#[test]
fn producer_consumer_delivers_every_item_exactly_once() {
    const PRODUCERS: usize = 3;
    const CONSUMERS: usize = 3;
    const ITEMS_PER_PRODUCER: i64 = 100;

    let engine = engine("exactly_once");
    let list = engine.transaction(|ctx| Ok(List::new(ctx, &[])?)).unwrap();

    let sentinels_seen = Arc::new(AtomicUsize::new(0));
    let popped = Arc::new(Mutex::new(Vec::<i64>::new()));

    thread::scope(|scope| {
        for producer_id in 0..PRODUCERS {
            let engine = &engine;
            scope.spawn(move || {
                for seq in 0..ITEMS_PER_PRODUCER {
                    let encoded = encode(producer_id, seq);
                    engine
                        .transaction(|ctx| {
                            let value = new_value(engine, &ScalarValue::Int(encoded))?;
                            list.append(ctx, value)?;
                            Ok(())
                        })
                        .unwrap();
                }
                engine
                    .transaction(|ctx| {
                        let value = new_value(engine, &ScalarValue::Int(SENTINEL))?;
                        list.append(ctx, value)?;
                        Ok(())
                    })
                    .unwrap();
            });
        }

        for _ in 0..CONSUMERS {
            let engine = &engine;
            let sentinels_seen = Arc::clone(&sentinels_seen);
            let popped = Arc::clone(&popped);
            scope.spawn(move || loop {
                if sentinels_seen.load(Ordering::Acquire) >= PRODUCERS {
                    break;
                }
                let result = engine.transaction(|ctx| Ok(list.pop_front(ctx)?));
                let handle = match result {
                    Ok(h) => h,
                    Err(_) => {
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                };
                let ScalarValue::Int(value) = read_value(engine.segment(), handle).unwrap() else {
                    panic!("producer/consumer list only ever holds boxed ints");
                };
                if value == SENTINEL {
                    sentinels_seen.fetch_add(1, Ordering::AcqRel);
                } else {
                    popped.lock().unwrap().push(value);
                }
            });
        }
    });

    assert_eq!(sentinels_seen.load(Ordering::Acquire), PRODUCERS);

    let popped = popped.lock().unwrap();
    assert_eq!(popped.len(), PRODUCERS * ITEMS_PER_PRODUCER as usize);

    let mut per_producer: HashMap<usize, Vec<i64>> = HashMap::new();
    for &encoded in popped.iter() {
        let (producer, seq) = decode(encoded);
        per_producer.entry(producer).or_default().push(seq);
    }
    assert_eq!(per_producer.len(), PRODUCERS, "every producer's items must have been observed");
    for (producer, mut seqs) in per_producer {
        seqs.sort_unstable();
        let expected: Vec<i64> = (0..ITEMS_PER_PRODUCER).collect();
        assert_eq!(seqs, expected, "producer {producer}'s items were not all delivered exactly once");
    }
}

/// Even with two producers' appends interleaved, each producer's own
/// items are dequeued in the order they were appended — a single shared
/// queue preserves the relative order of any subsequence from one
/// source, which is what lets a consumer trust per-producer ordering
/// without needing per-producer queues.
#[test]
fn list_preserves_per_producer_fifo_order_under_interleaved_appends() {
    const ITEMS_PER_PRODUCER: i64 = 50;

    let engine = engine("fifo_order");
    let list = engine.transaction(|ctx| Ok(List::new(ctx, &[])?)).unwrap();

    engine
        .transaction(|ctx| {
            for seq in 0..ITEMS_PER_PRODUCER {
                let a = new_value(&engine, &ScalarValue::Int(encode(0, seq)))?;
                list.append(ctx, a)?;
                let b = new_value(&engine, &ScalarValue::Int(encode(1, seq)))?;
                list.append(ctx, b)?;
            }
            Ok(())
        })
        .unwrap();

    let mut seen: HashMap<usize, Vec<i64>> = HashMap::new();
    engine
        .transaction(|ctx| {
            while !list.is_empty(ctx) {
                let handle = list.pop_front(ctx)?;
                let ScalarValue::Int(encoded) = read_value(ctx.segment(), handle)? else {
                    panic!("fifo order list only ever holds boxed ints");
                };
                let (producer, seq) = decode(encoded);
                seen.entry(producer).or_default().push(seq);
            }
            Ok(())
        })
        .unwrap();

    for producer in [0usize, 1] {
        let expected: Vec<i64> = (0..ITEMS_PER_PRODUCER).collect();
        assert_eq!(seen[&producer], expected, "producer {producer}'s own items must come out in append order");
    }
}
