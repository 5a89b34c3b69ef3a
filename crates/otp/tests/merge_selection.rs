// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-producer arbitration: priority, CID tie-break, staleness
//! promotion, and replay protection. Time is injected, so every scenario
//! is deterministic.

use otp::consumer::merge::{merge_address, MergedTable};
use otp::consumer::table::{ProducerTable, TransformCommit};
use otp::protocol::{Module, PointLayer, TransformLayer};
use otp::transport::Family;
use otp::{Address, Cid};
use std::time::{Duration, Instant};

fn cid(n: u8) -> Cid {
    let mut bytes = [0u8; 16];
    bytes[15] = n;
    Cid::from_bytes(bytes)
}

fn address() -> Address {
    Address::new(1, 1, 1).expect("valid address")
}

fn transform(priority: u8, timestamp: u64, x: u32) -> TransformLayer {
    TransformLayer {
        system: 1,
        timestamp,
        full_point_set: false,
        points: vec![PointLayer {
            priority,
            group: 1,
            point: 1,
            timestamp,
            modules: vec![Module::rotation(x, 0, 0)],
        }],
    }
}

fn report(table: &mut ProducerTable, cid: Cid, priority: u8, timestamp: u64, now: Instant) {
    table.note_packet(cid, "producer", Family::V4, now);
    match table.commit_transform(cid, &transform(priority, timestamp, priority as u32), now) {
        TransformCommit::Applied(_) => {}
        other => panic!("commit should apply, got {:?}", other),
    }
}

#[test]
fn higher_priority_producer_wins() {
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let now = Instant::now();

    // P1 (CID ...01) at priority 100, P2 (CID ...02) at priority 120.
    report(&mut table, cid(1), 100, 10, now);
    report(&mut table, cid(2), 120, 10, now);

    let merged = merge_address(&table, address()).expect("merged entry");
    assert_eq!(merged.winner, cid(2));
    assert_eq!(merged.priority, 120);
}

#[test]
fn equal_priority_breaks_to_numerically_lower_cid() {
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let now = Instant::now();

    // Arrival order must not matter: report P2 first.
    report(&mut table, cid(2), 100, 10, now);
    report(&mut table, cid(1), 100, 10, now);

    let merged = merge_address(&table, address()).expect("merged entry");
    assert_eq!(merged.winner, cid(1));
}

#[test]
fn winner_equals_argmax_over_priority_then_cid() {
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let now = Instant::now();

    let producers: Vec<(Cid, u8)> = vec![
        (cid(9), 50),
        (cid(3), 150),
        (cid(7), 150),
        (cid(5), 120),
    ];
    for (cid, priority) in &producers {
        report(&mut table, *cid, *priority, 10, now);
    }

    let expected = producers
        .iter()
        .max_by_key(|(cid, priority)| (*priority, std::cmp::Reverse(*cid)))
        .map(|(cid, _)| *cid)
        .expect("nonempty");
    let merged = merge_address(&table, address()).expect("merged entry");
    assert_eq!(merged.winner, expected);
    assert_eq!(merged.winner, cid(3));
}

#[test]
fn stale_winner_is_demoted_and_next_best_promoted() {
    let timeout = Duration::from_millis(7_500);
    let mut table = ProducerTable::new(timeout);
    let merged_table = MergedTable::new();
    let t0 = Instant::now();

    report(&mut table, cid(1), 100, 10, t0);
    report(&mut table, cid(2), 120, 10, t0);
    let outcome = merged_table.apply(address(), merge_address(&table, address()));
    assert_eq!(outcome.current_winner, Some(cid(2)));

    // P2 falls silent; P1 keeps transmitting. At t0 + 8 s the sweep runs.
    let t1 = t0 + Duration::from_secs(8);
    report(&mut table, cid(1), 100, 20, t1);

    let lost = table.sweep(t1);
    assert_eq!(lost.len(), 1, "P2 exceeded the data-loss timeout");
    assert_eq!(lost[0].0, cid(2));
    assert_eq!(lost[0].1, vec![address()]);

    // Promotion lands in the same pass that detected the loss.
    let outcome = merged_table.apply(address(), merge_address(&table, address()));
    assert!(outcome.winner_changed());
    assert_eq!(outcome.previous_winner, Some(cid(2)));
    assert_eq!(outcome.current_winner, Some(cid(1)));
}

#[test]
fn silence_under_the_timeout_does_not_demote() {
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let t0 = Instant::now();
    report(&mut table, cid(2), 120, 10, t0);

    let t1 = t0 + Duration::from_secs(7);
    assert!(table.sweep(t1).is_empty(), "7 s of silence is within 7.5 s");
    assert!(merge_address(&table, address()).is_some());
}

#[test]
fn replay_is_ignored_without_table_change() {
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let merged_table = MergedTable::new();
    let now = Instant::now();

    table.note_packet(cid(1), "producer", Family::V4, now);
    let commit = table.commit_transform(cid(1), &transform(100, 1_000_000, 1), now);
    assert!(matches!(commit, TransformCommit::Applied(_)));
    let outcome = merged_table.apply(address(), merge_address(&table, address()));
    assert!(outcome.changed);

    // One microsecond earlier than the committed message: dropped.
    let commit = table.commit_transform(cid(1), &transform(100, 999_999, 2), now);
    assert!(matches!(commit, TransformCommit::Stale));

    // The merged view did not move.
    let outcome = merged_table.apply(address(), merge_address(&table, address()));
    assert!(!outcome.changed, "replay must not produce a delegate change");
}

#[test]
fn reapplying_the_same_message_is_idempotent() {
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let merged_table = MergedTable::new();
    let now = Instant::now();

    table.note_packet(cid(1), "producer", Family::V4, now);
    let message = transform(100, 42, 7);
    assert!(matches!(
        table.commit_transform(cid(1), &message, now),
        TransformCommit::Applied(_)
    ));
    let first = merged_table.apply(address(), merge_address(&table, address()));
    assert!(first.changed);

    // The identical message again: equal timestamp, dropped, no change.
    assert!(matches!(
        table.commit_transform(cid(1), &message, now),
        TransformCommit::Stale
    ));
    let second = merged_table.apply(address(), merge_address(&table, address()));
    assert!(!second.changed);
    assert!(!second.winner_changed());
}

#[test]
fn merged_entry_requires_a_live_producer() {
    let mut table = ProducerTable::new(Duration::from_millis(100));
    let merged_table = MergedTable::new();
    let t0 = Instant::now();

    report(&mut table, cid(1), 100, 10, t0);
    merged_table.apply(address(), merge_address(&table, address()));
    assert_eq!(merged_table.len(), 1);

    // Sole producer expires: the merged entry must vanish with it.
    let t1 = t0 + Duration::from_secs(1);
    let lost = table.sweep(t1);
    assert_eq!(lost.len(), 1);
    let outcome = merged_table.apply(address(), merge_address(&table, address()));
    assert!(outcome.changed);
    assert!(merged_table.is_empty());
}
