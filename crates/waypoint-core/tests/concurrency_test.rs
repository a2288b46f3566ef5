//! Multi-threaded behaviour of the token pools and the segmented table

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use waypoint_core::chunk::{QueryIdSet, WaypointId};
use waypoint_core::config::TokenConfig;
use waypoint_core::hash::{RecordBuilder, SegmentGeometry, SegmentedHashTable};
use waypoint_core::tokens::{TokenKind, TokenPool};

fn table(segments: usize) -> Arc<SegmentedHashTable> {
    Arc::new(SegmentedHashTable::new(SegmentGeometry::new(segments, 10).unwrap()))
}

fn record(i: u64) -> Vec<u8> {
    let mut builder = RecordBuilder::new(QueryIdSet::from_bits(1));
    builder.field(0, &i.to_le_bytes()).unwrap();
    builder.finish()
}

#[test]
fn test_checkout_is_mutually_exclusive() {
    let table = table(4);
    let held: Arc<Vec<AtomicBool>> = Arc::new((0..4).map(|_| AtomicBool::new(false)).collect());
    let threads = 8;
    let rounds = 100;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let table = Arc::clone(&table);
            let held = Arc::clone(&held);
            thread::spawn(move || {
                for r in 0..rounds {
                    let mut guard = table.checkout_one(u64::MAX).unwrap();
                    let index = guard.index();
                    assert!(
                        !held[index].swap(true, Ordering::SeqCst),
                        "segment {index} handed out twice"
                    );
                    let key = (t * rounds + r) as u64;
                    guard.insert(key, WaypointId(1), &record(key)).unwrap();
                    thread::yield_now();
                    held[index].store(false, Ordering::SeqCst);
                    guard.checkin();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(table.checked_out(), 0);
    let view = table.enter_reader();
    let stored: usize = (0..view.len()).map(|i| view.segment(i).unwrap().len()).sum();
    assert_eq!(stored, threads * rounds);
    assert_eq!(table.stats().checkouts, (threads * rounds) as u64);
    assert_eq!(view.version(), (threads * rounds) as u64);
}

#[test]
fn test_forced_wakeup_rescans_and_keeps_waiting() {
    let table = table(2);
    let guard = table.checkout_one(0b01).unwrap();
    assert_eq!(guard.index(), 0);

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let table = Arc::clone(&table);
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            let guard = table.checkout_one(0b01).unwrap();
            acquired.store(true, Ordering::SeqCst);
            guard.index()
        })
    };

    thread::sleep(Duration::from_millis(50));
    let scans_before = table.stats().scans;
    for _ in 0..3 {
        table.notify_waiters();
        thread::sleep(Duration::from_millis(20));
    }
    // the wanted segment is still held, so every wakeup goes back to sleep
    assert!(!acquired.load(Ordering::SeqCst));
    let stats = table.stats();
    assert_eq!(stats.forced_wakeups, 3);
    assert!(stats.scans >= scans_before + 3);

    guard.checkin();
    assert_eq!(waiter.join().unwrap(), 0);
    assert!(acquired.load(Ordering::SeqCst));
}

#[test]
fn test_reader_sees_all_or_nothing_of_a_checkout() {
    let table = table(2);
    // small hashes address segment 0
    let mut guard = table.checkout_one(0b01).unwrap();
    guard.insert(7, WaypointId(3), &record(7)).unwrap();

    let reader = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            let view = table.enter_reader();
            view.probe(7).unwrap().count()
        })
    };
    thread::sleep(Duration::from_millis(30));
    guard.insert(7, WaypointId(3), &record(8)).unwrap();
    guard.checkin();
    assert_eq!(reader.join().unwrap(), 2);
}

#[test]
fn test_blocking_acquire_never_exceeds_capacity() {
    let pool = TokenPool::new(&TokenConfig {
        cpu_tokens: 3,
        disk_tokens: 1,
        cleaner_cpu_tokens: 1,
        cleaner_disk_tokens: 1,
    })
    .unwrap();
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let pool = pool.clone();
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for _ in 0..20 {
                    let token = pool.acquire(TokenKind::Cpu, i % 3).unwrap();
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::yield_now();
                    live.fetch_sub(1, Ordering::SeqCst);
                    pool.release(token);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats(TokenKind::Cpu);
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.issued, 200);
    assert_eq!(stats.released, 200);
    assert_eq!(stats.waiting, 0);
}
