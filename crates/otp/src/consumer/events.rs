// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Coalesced delegate notifications.
//!
//! The worker accumulates events and flushes them as one batch no more
//! often than the delegate interval. The application drains batches from a
//! channel on whatever thread it likes; the worker never runs application
//! code.

use crate::consumer::table::DiscoveredProducer;
use crate::core::{Address, Cid};
use crate::protocol::module::ModuleIdentifier;
use crossbeam::channel::Sender;
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

/// A consumer delegate notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ProducerDiscovered(DiscoveredProducer),
    ProducerUpdated(DiscoveredProducer),
    ProducerLost { cid: Cid },
    /// A module outside the configured decode set was observed; reported
    /// once per (CID, identifier).
    UnknownModule { cid: Cid, ident: ModuleIdentifier },
    /// The winning producer of an address changed (promotion, first
    /// appearance, or disappearance).
    WinnerChanged {
        address: Address,
        previous: Option<Cid>,
        current: Option<Cid>,
    },
    /// Batched merged-table diff since the previous flush.
    PointsChanged {
        updated: Vec<Address>,
        removed: Vec<Address>,
    },
}

/// Worker-side accumulator feeding the application's event channel.
pub(crate) struct EventQueue {
    tx: Sender<Vec<Event>>,
    pending: Vec<Event>,
    updated: BTreeSet<Address>,
    removed: BTreeSet<Address>,
    unknown_reported: HashSet<(Cid, ModuleIdentifier)>,
    interval: Duration,
    last_flush: Option<Instant>,
}

impl EventQueue {
    pub fn new(interval: Duration, tx: Sender<Vec<Event>>) -> Self {
        Self {
            tx,
            pending: Vec::new(),
            updated: BTreeSet::new(),
            removed: BTreeSet::new(),
            unknown_reported: HashSet::new(),
            interval,
            last_flush: None,
        }
    }

    pub fn push(&mut self, event: Event) {
        self.pending.push(event);
    }

    /// Record a merged-entry update for the batched diff.
    pub fn note_point_updated(&mut self, address: Address) {
        self.removed.remove(&address);
        self.updated.insert(address);
    }

    /// Record a merged-entry removal for the batched diff.
    pub fn note_point_removed(&mut self, address: Address) {
        self.updated.remove(&address);
        self.removed.insert(address);
    }

    /// Report an undecodable module, once per (CID, identifier).
    pub fn note_unknown_module(&mut self, cid: Cid, ident: ModuleIdentifier) {
        if self.unknown_reported.insert((cid, ident)) {
            self.pending.push(Event::UnknownModule { cid, ident });
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
    }

    /// Flush if the delegate interval elapsed and anything accumulated.
    /// Returns true when a batch went out.
    pub fn flush_due(&mut self, now: Instant) -> bool {
        if !self.has_pending() {
            return false;
        }
        let due = self
            .last_flush
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !due {
            return false;
        }
        self.last_flush = Some(now);

        let mut batch = std::mem::take(&mut self.pending);
        if !self.updated.is_empty() || !self.removed.is_empty() {
            batch.push(Event::PointsChanged {
                updated: std::mem::take(&mut self.updated).into_iter().collect(),
                removed: std::mem::take(&mut self.removed).into_iter().collect(),
            });
        }
        // A dropped receiver just means the application stopped listening.
        let _ = self.tx.send(batch);
        true
    }
}
