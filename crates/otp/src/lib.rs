// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # OTP - Object Transform Protocol
//!
//! A pure Rust implementation of ANSI E1.59-2021 (Entertainment Technology
//! Object Transform Protocol): UDP-multicast distribution of position,
//! rotation, scale, velocity, and acceleration data for tracked points,
//! from producers to consumers in real time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use otp::{Address, Module, Producer, ProducerConfig, Result, Scaling};
//!
//! fn main() -> Result<()> {
//!     let mut producer = Producer::new(ProducerConfig::new("lift tracker"));
//!
//!     let address = Address::new(1, 1, 1)?;
//!     producer.add_point(address, "chain hoist 1", None)?;
//!     producer.add_module(
//!         address,
//!         Module::Position { scaling: Scaling::Millimeters, x: 0, y: 0, z: 2_500 },
//!         None,
//!     )?;
//!
//!     producer.start()?;
//!     // ...the worker now transmits on its own schedule...
//!     producer.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! A consumer mirrors this: build a [`ConsumerConfig`] with the systems to
//! observe, `start()` it, then drain [`Consumer::events`] and query
//! [`Consumer::merged_point`].
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |        Producer (points/modules) | Consumer (merged table)         |
//! +--------------------------------------------------------------------+
//! |                          Engine Layer                              |
//! |  Transmit scheduler | Discovery table | Merge | Delegate events    |
//! +--------------------------------------------------------------------+
//! |                         Protocol Layer                             |
//! |  Root / Transform / Point / Module PDUs | Folio reassembly         |
//! +--------------------------------------------------------------------+
//! |                         Transport Layer                            |
//! |  UDP sockets | Per-system multicast groups | TTL / hop limits      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Producer`] | Owns a point set and transmits it periodically |
//! | [`Consumer`] | Discovers producers and merges their reports per address |
//! | [`Address`] | (system, group, point) identity of a tracked object |
//! | [`Module`] | Typed payload attached to a point (position, rotation, ...) |
//! | [`Event`] | Coalesced consumer notification batch element |
//!
//! ## Modules Overview
//!
//! - [`producer`] - point store, transmit scheduler, advertisement responder
//! - [`consumer`] - discovery, folio reassembly, per-address merge, events
//! - [`protocol`] - PDU layer stack and the module registry
//! - [`transport`] - sockets, multicast membership, TTL
//!
//! ## See Also
//!
//! - ANSI E1.59-2021, Entertainment Technology Object Transform Protocol

/// Global configuration constants (port, cadence, buffer sizing).
pub mod config;
/// Consumer engine (discovery, merge, staleness, delegate events).
pub mod consumer;
/// Core identifiers and the wire codec.
pub mod core;
/// Public error type.
pub mod error;
/// Producer engine (point store, transmit scheduler).
pub mod producer;
/// OTP PDU layer stack (root, transform, point, module, advertisement).
pub mod protocol;
/// UDP transport and multicast membership.
pub mod transport;

pub use consumer::{
    Consumer, ConsumerConfig, ConsumerStatsSnapshot, DiscoveredProducer, Event, MergedPoint,
};
pub use crate::core::{Address, Cid};
pub use error::{Error, Result};
pub use producer::{Producer, ProducerConfig, ProducerStatsSnapshot};
pub use protocol::{Module, ModuleIdentifier, ModuleRegistry, Scaling};
pub use transport::{IpMode, TtlConfig};

/// OTP crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
