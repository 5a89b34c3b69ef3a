// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end data path without sockets: producer store -> scheduler ->
//! datagrams -> parse -> folio reassembly -> discovery table -> merge.

use otp::consumer::merge::{merge_address, MergedTable};
use otp::consumer::table::{ProducerTable, TransformCommit};
use otp::producer::scheduler::{
    build_advertisement_datagrams, build_transform_datagrams, module_advertisement,
};
use otp::producer::store::PointStore;
use otp::protocol::constants::MAX_DATAGRAM_SIZE;
use otp::protocol::{
    parse_datagram, FolioAssembler, FolioOutcome, Module, ModuleIdentifier, ModuleRegistry,
    OtpPacket, PointLayer,
};
use otp::transport::Family;
use otp::{Address, Cid, Scaling};
use std::time::{Duration, Instant};

fn producer_cid() -> Cid {
    Cid::from_bytes([0xAB; 16])
}

fn position(z: i32) -> Module {
    Module::Position {
        scaling: Scaling::Millimeters,
        x: 0,
        y: 0,
        z,
    }
}

/// Feed a datagram sequence through parse + reassembly, returning every
/// completed message.
fn ingest(
    registry: &ModuleRegistry,
    assembler: &mut FolioAssembler,
    datagrams: &[Vec<u8>],
) -> Vec<OtpPacket> {
    let mut complete = Vec::new();
    for datagram in datagrams {
        assert!(datagram.len() <= MAX_DATAGRAM_SIZE);
        let parsed = parse_datagram(datagram, registry).expect("datagram should parse");
        match assembler.insert(&parsed.root, parsed.packet) {
            FolioOutcome::Complete(packet) => complete.push(packet),
            FolioOutcome::Pending => {}
            FolioOutcome::Discarded => panic!("unexpected discard during ingest"),
        }
    }
    complete
}

#[test]
fn fragmented_point_set_survives_the_full_path() {
    let registry = ModuleRegistry::standard();
    let mut store = PointStore::new(100);
    let now_micros = 1_000_000u64;

    // Enough points with modules to exceed one datagram comfortably.
    for n in 1..=120u32 {
        let address = Address::new(7, 1, n).expect("valid address");
        store
            .add_point(address, &format!("point {}", n), None, now_micros)
            .expect("add point");
        store
            .add_module(address, position(n as i32 * 10), None, now_micros)
            .expect("add module");
        store
            .add_module(address, Module::rotation(n, 0, 0), None, now_micros)
            .expect("add module");
    }

    let points = store.snapshot_system(7, true);
    assert_eq!(points.len(), 120);
    let datagrams = build_transform_datagrams(
        producer_cid(),
        "rig",
        7,
        now_micros,
        true,
        points,
        0,
    )
    .expect("build datagrams");
    assert!(datagrams.len() > 1, "expected multiple pages");

    let mut assembler = FolioAssembler::new(16, Duration::from_millis(500));
    let complete = ingest(&registry, &mut assembler, &datagrams);
    assert_eq!(complete.len(), 1, "all pages merge into one message");

    let OtpPacket::Transform(layer) = &complete[0] else {
        panic!("expected transform message");
    };
    assert_eq!(layer.points.len(), 120);
    assert!(layer.full_point_set);

    // Commit into a consumer table and check the merged view.
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let now = Instant::now();
    table.note_packet(producer_cid(), "rig", Family::V4, now);
    let commit = table.commit_transform(producer_cid(), layer, now);
    let TransformCommit::Applied(affected) = commit else {
        panic!("commit should apply");
    };
    assert_eq!(affected.len(), 120);

    let merged = MergedTable::new();
    for address in &affected {
        merged.apply(*address, merge_address(&table, *address));
    }
    assert_eq!(merged.len(), 120);

    let probe = Address::new(7, 1, 60).expect("valid address");
    let entry = merged.get(probe).expect("merged entry");
    assert_eq!(entry.winner, producer_cid());
    assert_eq!(
        entry.modules.get(&ModuleIdentifier::standard(1)),
        Some(&position(600))
    );
}

#[test]
fn dropping_a_page_discards_the_whole_folio() {
    let registry = ModuleRegistry::standard();
    let mut store = PointStore::new(100);
    for n in 1..=120u32 {
        let address = Address::new(3, 1, n).expect("valid address");
        store.add_point(address, "p", None, 5).expect("add point");
        store
            .add_module(address, position(1), None, 5)
            .expect("add module");
        store
            .add_module(address, Module::rotation(1, 2, 3), None, 5)
            .expect("add module");
    }
    let points = store.snapshot_system(3, true);
    let datagrams =
        build_transform_datagrams(producer_cid(), "rig", 3, 5, true, points, 9)
            .expect("build datagrams");
    assert!(datagrams.len() >= 3, "need at least three pages");

    let mut assembler = FolioAssembler::new(16, Duration::from_millis(500));
    let parsed_first = parse_datagram(&datagrams[0], &registry).expect("parse");
    assert!(matches!(
        assembler.insert(&parsed_first.root, parsed_first.packet),
        FolioOutcome::Pending
    ));

    // Page 1 lost; page 2 arrives. The folio aborts.
    let parsed_third = parse_datagram(&datagrams[2], &registry).expect("parse");
    assert!(matches!(
        assembler.insert(&parsed_third.root, parsed_third.packet),
        FolioOutcome::Discarded
    ));
    assert_eq!(assembler.pending_count(), 0);
    assert_eq!(assembler.aborted_total(), 1);
}

#[test]
fn partial_update_then_full_set_prunes_points() {
    let registry = ModuleRegistry::standard();
    let mut store = PointStore::new(100);
    let a1 = Address::new(2, 1, 1).expect("valid address");
    let a2 = Address::new(2, 1, 2).expect("valid address");
    store.add_point(a1, "one", None, 10).expect("add point");
    store.add_point(a2, "two", None, 10).expect("add point");
    store.add_module(a1, position(100), None, 10).expect("add module");
    store.add_module(a2, position(200), None, 10).expect("add module");

    let mut assembler = FolioAssembler::new(16, Duration::from_millis(500));
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let merged = MergedTable::new();
    let now = Instant::now();
    table.note_packet(producer_cid(), "rig", Family::V4, now);

    // Full set with both points.
    let full = build_transform_datagrams(
        producer_cid(),
        "rig",
        2,
        20,
        true,
        store.snapshot_system(2, true),
        0,
    )
    .expect("build");
    for packet in ingest(&registry, &mut assembler, &full) {
        let OtpPacket::Transform(layer) = packet else {
            panic!("expected transform")
        };
        if let TransformCommit::Applied(affected) =
            table.commit_transform(producer_cid(), &layer, now)
        {
            for address in affected {
                merged.apply(address, merge_address(&table, address));
            }
        }
    }
    assert_eq!(merged.len(), 2);

    // The producer drops point 2; the next full set lists only point 1.
    store.remove_point(a2, None).expect("remove point");
    let full = build_transform_datagrams(
        producer_cid(),
        "rig",
        2,
        30,
        true,
        store.snapshot_system(2, true),
        1,
    )
    .expect("build");
    for packet in ingest(&registry, &mut assembler, &full) {
        let OtpPacket::Transform(layer) = packet else {
            panic!("expected transform")
        };
        if let TransformCommit::Applied(affected) =
            table.commit_transform(producer_cid(), &layer, now)
        {
            for address in affected {
                merged.apply(address, merge_address(&table, address));
            }
        }
    }
    assert_eq!(merged.len(), 1, "pruned point leaves the merged table");
    assert!(merged.get(a2).is_none());
    assert!(merged.get(a1).is_some());
}

fn random_modules(rng: &mut fastrand::Rng) -> Vec<Module> {
    let mut modules = Vec::new();
    if rng.bool() {
        let scaling = if rng.bool() {
            Scaling::Millimeters
        } else {
            Scaling::Micrometers
        };
        modules.push(Module::Position {
            scaling,
            x: rng.i32(..),
            y: rng.i32(..),
            z: rng.i32(..),
        });
    }
    if rng.bool() {
        modules.push(Module::rotation(rng.u32(..), rng.u32(..), rng.u32(..)));
    }
    if rng.bool() {
        modules.push(Module::Scale {
            x: rng.i32(..),
            y: rng.i32(..),
            z: rng.i32(..),
        });
    }
    modules
}

#[test]
fn random_point_sets_survive_fragmentation_and_reassembly() {
    let registry = ModuleRegistry::standard();
    let mut rng = fastrand::Rng::with_seed(0xD15C0);
    let mut assembler = FolioAssembler::new(16, Duration::from_millis(500));

    for round in 0..25u32 {
        let system = rng.u8(1..=200);
        let points: Vec<PointLayer> = (0..rng.usize(1..=160))
            .map(|_| PointLayer {
                priority: rng.u8(0..=200),
                group: rng.u16(1..=60_000),
                point: rng.u32(1..=4_000_000_000),
                timestamp: rng.u64(..),
                modules: random_modules(&mut rng),
            })
            .collect();

        // Folio numbers anywhere in the sequence space, including right at
        // the 2^32 - 1 -> 0 wrap.
        let folio = if rng.bool() {
            u32::MAX.wrapping_sub(rng.u32(0..2)).wrapping_add(round)
        } else {
            rng.u32(..)
        };

        let datagrams = build_transform_datagrams(
            producer_cid(),
            "prop",
            system,
            u64::from(round) + 1,
            true,
            points.clone(),
            folio,
        )
        .expect("build datagrams");

        let complete = ingest(&registry, &mut assembler, &datagrams);
        assert_eq!(complete.len(), 1, "round {}: one message per folio", round);
        let OtpPacket::Transform(layer) = &complete[0] else {
            panic!("expected transform message");
        };
        assert_eq!(layer.system, system);
        assert_eq!(
            layer.points, points,
            "round {}: reassembly must restore the exact point sequence",
            round
        );
    }
    assert_eq!(assembler.aborted_total(), 0);
}

#[test]
fn module_advertisement_response_updates_discovery() {
    let registry = ModuleRegistry::standard();
    let idents = vec![
        ModuleIdentifier::standard(1),
        ModuleIdentifier::standard(3),
        ModuleIdentifier::standard(5),
    ];
    let datagrams = build_advertisement_datagrams(
        producer_cid(),
        "rig",
        module_advertisement(idents.clone()),
        0,
    )
    .expect("build");
    assert_eq!(datagrams.len(), 1);

    let mut assembler = FolioAssembler::new(16, Duration::from_millis(500));
    let mut table = ProducerTable::new(Duration::from_millis(7_500));
    let now = Instant::now();
    table.note_packet(producer_cid(), "rig", Family::V4, now);

    for packet in ingest(&registry, &mut assembler, &datagrams) {
        let OtpPacket::Advertisement(layer) = packet else {
            panic!("expected advertisement")
        };
        assert!(table.note_advertisement(producer_cid(), &layer));
    }

    let snapshot = table.snapshot(producer_cid()).expect("snapshot");
    assert_eq!(snapshot.modules, idents);
}

#[test]
fn unknown_manufacturer_module_is_carried_opaquely() {
    let registry = ModuleRegistry::standard();
    let address = Address::new(4, 1, 1).expect("valid address");
    let vendor = Module::Opaque {
        ident: ModuleIdentifier::new(0x6A6B, 0x0100),
        payload: vec![1, 2, 3, 4, 5],
    };

    let mut store = PointStore::new(100);
    store.add_point(address, "p", None, 1).expect("add point");
    store.add_module(address, vendor.clone(), None, 1).expect("add module");

    let datagrams = build_transform_datagrams(
        producer_cid(),
        "rig",
        4,
        1,
        true,
        store.snapshot_system(4, true),
        0,
    )
    .expect("build");

    let mut assembler = FolioAssembler::new(16, Duration::from_millis(500));
    let complete = ingest(&registry, &mut assembler, &datagrams);
    let OtpPacket::Transform(layer) = &complete[0] else {
        panic!("expected transform")
    };
    assert_eq!(layer.points[0].modules, vec![vendor]);
}
