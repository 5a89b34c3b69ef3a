// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-address winner selection and the merged address table.
//!
//! For each address the consumer ranks every (producer, priority)
//! observation: higher priority wins, ties break to the numerically lower
//! CID (compared as a 128-bit big-endian unsigned). Module values merge
//! per identifier so a lower-ranked producer still contributes module
//! types the winner does not carry.

use crate::consumer::table::ProducerTable;
use crate::core::{Address, Cid};
use crate::protocol::module::{Module, ModuleIdentifier};
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The winning view of one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPoint {
    pub address: Address,
    /// Producer whose observation ranks first.
    pub winner: Cid,
    /// The winning observation's priority.
    pub priority: u8,
    /// Module values, each taken from the best-ranked producer carrying
    /// that identifier.
    pub modules: BTreeMap<ModuleIdentifier, Module>,
    /// The winning observation's point timestamp.
    pub timestamp: u64,
}

/// Outcome of re-merging one address.
#[derive(Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub previous_winner: Option<Cid>,
    pub current_winner: Option<Cid>,
    /// Whether the stored entry changed at all (value or existence).
    pub changed: bool,
}

impl MergeOutcome {
    pub fn winner_changed(&self) -> bool {
        self.previous_winner != self.current_winner
    }
}

/// Compute the merged view of `address` from the current observations.
///
/// Returns `None` when no producer reports the address (entry removed).
pub fn merge_address(table: &ProducerTable, address: Address) -> Option<MergedPoint> {
    let mut candidates = table.candidates(address);
    if candidates.is_empty() {
        return None;
    }
    // Rank: priority descending, then CID ascending.
    candidates.sort_by_key(|(cid, priority, _, _)| (Reverse(*priority), *cid));

    let (winner, priority, _, timestamp) = candidates[0];
    let mut modules = BTreeMap::new();
    for (_, _, observed, _) in &candidates {
        for (ident, module) in observed.iter() {
            modules.entry(*ident).or_insert_with(|| module.clone());
        }
    }

    Some(MergedPoint {
        address,
        winner,
        priority,
        modules,
        timestamp,
    })
}

/// Address -> winning modules, shared between the consumer worker (writer)
/// and application threads (readers).
#[derive(Clone)]
pub struct MergedTable {
    inner: Arc<DashMap<Address, MergedPoint>>,
}

impl MergedTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, address: Address) -> Option<MergedPoint> {
        self.inner.get(&address).map(|entry| entry.value().clone())
    }

    /// Every merged entry, in address order.
    pub fn entries(&self) -> Vec<MergedPoint> {
        let mut out: Vec<MergedPoint> = self
            .inner
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|point| point.address);
        out
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop every entry (used when a consumer restarts).
    pub(crate) fn clear(&self) {
        self.inner.clear();
    }

    /// Store the freshly merged view of one address, reporting what
    /// changed.
    pub fn apply(&self, address: Address, merged: Option<MergedPoint>) -> MergeOutcome {
        match merged {
            Some(merged) => {
                let previous = self.inner.insert(address, merged.clone());
                let previous_winner = previous.as_ref().map(|point| point.winner);
                let changed = previous.as_ref() != Some(&merged);
                MergeOutcome {
                    previous_winner,
                    current_winner: Some(merged.winner),
                    changed,
                }
            }
            None => {
                let previous = self.inner.remove(&address).map(|(_, point)| point);
                MergeOutcome {
                    previous_winner: previous.as_ref().map(|point| point.winner),
                    current_winner: None,
                    changed: previous.is_some(),
                }
            }
        }
    }
}

impl Default for MergedTable {
    fn default() -> Self {
        Self::new()
    }
}
