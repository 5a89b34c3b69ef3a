// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer point store.
//!
//! Points are keyed by (address, priority): one address may coexist at
//! several priorities, each an independent point for transmission. Modules
//! added to an address without a priority apply to every point sharing the
//! address and are remembered so later same-address points inherit them.

use crate::core::address::{validate_priority, Address};
use crate::core::ser::cursor::FIXED_NAME_LEN;
use crate::error::{Error, Result};
use crate::protocol::module::{Module, ModuleIdentifier};
use crate::protocol::transform::PointLayer;
use std::collections::{BTreeMap, BTreeSet, HashMap};

struct ModuleSlot {
    value: Module,
    dirty: bool,
}

struct PointEntry {
    name: String,
    modules: BTreeMap<ModuleIdentifier, ModuleSlot>,
    last_modified: u64,
    dirty: bool,
}

impl PointEntry {
    fn is_dirty(&self) -> bool {
        self.dirty || self.modules.values().any(|slot| slot.dirty)
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
        for slot in self.modules.values_mut() {
            slot.dirty = false;
        }
    }
}

/// Mutable point/module state of a producer.
pub struct PointStore {
    points: BTreeMap<(Address, u8), PointEntry>,
    /// Modules added address-wide, inherited by points added later.
    inherited: HashMap<Address, BTreeMap<ModuleIdentifier, Module>>,
    default_priority: u8,
    dirty_systems: BTreeSet<u8>,
}

impl PointStore {
    pub fn new(default_priority: u8) -> Self {
        Self {
            points: BTreeMap::new(),
            inherited: HashMap::new(),
            default_priority,
            dirty_systems: BTreeSet::new(),
        }
    }

    fn resolve_priority(&self, priority: Option<u8>) -> Result<u8> {
        let priority = priority.unwrap_or(self.default_priority);
        validate_priority(priority)?;
        Ok(priority)
    }

    /// Add a point. Fails on duplicate (address, priority), out-of-range
    /// address/priority, or an over-long name.
    pub fn add_point(
        &mut self,
        address: Address,
        name: &str,
        priority: Option<u8>,
        now: u64,
    ) -> Result<()> {
        address.validate()?;
        let priority = self.resolve_priority(priority)?;
        validate_name(name)?;

        let key = (address, priority);
        if self.points.contains_key(&key) {
            return Err(Error::DuplicatePoint { address, priority });
        }

        let modules = self
            .inherited
            .get(&address)
            .map(|map| {
                map.iter()
                    .map(|(ident, module)| {
                        (
                            *ident,
                            ModuleSlot {
                                value: module.clone(),
                                dirty: true,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.points.insert(
            key,
            PointEntry {
                name: name.to_owned(),
                modules,
                last_modified: now,
                dirty: true,
            },
        );
        self.dirty_systems.insert(address.system);
        Ok(())
    }

    /// Remove a point at one priority, or every priority of the address.
    pub fn remove_point(&mut self, address: Address, priority: Option<u8>) -> Result<()> {
        match priority {
            Some(priority) => {
                validate_priority(priority)?;
                self.points
                    .remove(&(address, priority))
                    .map(|_| self.dirty_systems.insert(address.system))
                    .ok_or(Error::NoSuchPoint { address })?;
            }
            None => {
                let keys: Vec<_> = self
                    .points
                    .range((address, 0)..=(address, u8::MAX))
                    .map(|(key, _)| *key)
                    .collect();
                if keys.is_empty() {
                    return Err(Error::NoSuchPoint { address });
                }
                for key in keys {
                    self.points.remove(&key);
                }
                self.dirty_systems.insert(address.system);
            }
        }
        Ok(())
    }

    /// Rename a point at one priority, or every priority of the address.
    pub fn rename_point(
        &mut self,
        address: Address,
        name: &str,
        priority: Option<u8>,
        now: u64,
    ) -> Result<()> {
        validate_name(name)?;
        let targets = self.target_keys(address, priority)?;
        for key in targets {
            let entry = self.points.get_mut(&key).expect("key from target_keys");
            entry.name = name.to_owned();
            entry.last_modified = now;
            entry.dirty = true;
        }
        self.dirty_systems.insert(address.system);
        Ok(())
    }

    /// Add (or overwrite) a module. Without a priority the module lands on
    /// every point sharing the address and is inherited by points added
    /// later.
    pub fn add_module(
        &mut self,
        address: Address,
        module: Module,
        priority: Option<u8>,
        now: u64,
    ) -> Result<()> {
        let ident = module.identifier();
        let targets = self.target_keys(address, priority)?;
        for key in &targets {
            let entry = self.points.get_mut(key).expect("key from target_keys");
            entry.modules.insert(
                ident,
                ModuleSlot {
                    value: module.clone(),
                    dirty: true,
                },
            );
            entry.last_modified = now;
        }
        if priority.is_none() {
            self.inherited
                .entry(address)
                .or_default()
                .insert(ident, module);
        }
        self.dirty_systems.insert(address.system);
        Ok(())
    }

    /// Remove a module from one point, or from every point of the address.
    pub fn remove_module(
        &mut self,
        address: Address,
        ident: ModuleIdentifier,
        priority: Option<u8>,
        now: u64,
    ) -> Result<()> {
        let targets = self.target_keys(address, priority)?;
        let mut removed = false;
        for key in &targets {
            let entry = self.points.get_mut(key).expect("key from target_keys");
            if entry.modules.remove(&ident).is_some() {
                entry.last_modified = now;
                entry.dirty = true;
                removed = true;
            }
        }
        if priority.is_none() {
            if let Some(map) = self.inherited.get_mut(&address) {
                map.remove(&ident);
            }
        }
        if !removed {
            return Err(Error::NoSuchModule { ident });
        }
        self.dirty_systems.insert(address.system);
        Ok(())
    }

    fn target_keys(&self, address: Address, priority: Option<u8>) -> Result<Vec<(Address, u8)>> {
        match priority {
            Some(priority) => {
                validate_priority(priority)?;
                let key = (address, priority);
                if self.points.contains_key(&key) {
                    Ok(vec![key])
                } else {
                    Err(Error::NoSuchPoint { address })
                }
            }
            None => {
                let keys: Vec<_> = self
                    .points
                    .range((address, 0)..=(address, u8::MAX))
                    .map(|(key, _)| *key)
                    .collect();
                if keys.is_empty() {
                    Err(Error::NoSuchPoint { address })
                } else {
                    Ok(keys)
                }
            }
        }
    }

    pub fn number_of_points(&self) -> usize {
        self.points.len()
    }

    pub fn number_of_modules(&self) -> usize {
        self.points.values().map(|entry| entry.modules.len()).sum()
    }

    /// Every (address, priority, name) triple, in address order.
    pub fn point_names(&self) -> Vec<(Address, u8, String)> {
        self.points
            .iter()
            .map(|((address, priority), entry)| (*address, *priority, entry.name.clone()))
            .collect()
    }

    /// Sorted distinct module identifiers across the whole point set.
    pub fn module_identifiers(&self) -> Vec<ModuleIdentifier> {
        let idents: BTreeSet<_> = self
            .points
            .values()
            .flat_map(|entry| entry.modules.keys().copied())
            .collect();
        idents.into_iter().collect()
    }

    /// Sorted distinct systems that own at least one point.
    pub fn systems(&self) -> Vec<u8> {
        let systems: BTreeSet<u8> = self.points.keys().map(|(address, _)| address.system).collect();
        systems.into_iter().collect()
    }

    /// Drain the set of systems touched since the previous call.
    pub fn take_dirty_systems(&mut self) -> Vec<u8> {
        let drained: Vec<u8> = self.dirty_systems.iter().copied().collect();
        self.dirty_systems.clear();
        drained
    }

    /// Snapshot a system's points as wire-ready layers.
    ///
    /// `full` includes every point; otherwise only dirty points are listed.
    /// Dirty flags of the included points are cleared.
    pub fn snapshot_system(&mut self, system: u8, full: bool) -> Vec<PointLayer> {
        let mut layers = Vec::new();
        for ((address, priority), entry) in &mut self.points {
            if address.system != system {
                continue;
            }
            if !full && !entry.is_dirty() {
                continue;
            }
            layers.push(PointLayer {
                priority: *priority,
                group: address.group,
                point: address.point,
                timestamp: entry.last_modified,
                modules: entry.modules.values().map(|slot| slot.value.clone()).collect(),
            });
            entry.clear_dirty();
        }
        layers
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.len() > FIXED_NAME_LEN {
        return Err(Error::InvalidName {
            name: name.to_owned(),
        });
    }
    Ok(())
}
