// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast group computation, membership, and interface discovery.
//!
//! Transform traffic for each system uses its own group so consumers only
//! receive the systems they observe:
//! - IPv4: `239.159.1.<system>`, advertisement on `239.159.2.1`
//! - IPv6: `ff18::9f:0:1:<system>`, advertisement on `ff18::9f:0:2:1`

use crate::config::{ADVERTISEMENT_MULTICAST_V4, TRANSFORM_MULTICAST_BASE_V4};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};

/// IPv4 advertisement multicast group (239.159.2.1).
pub const ADVERTISEMENT_GROUP_V4: Ipv4Addr = Ipv4Addr::new(
    ADVERTISEMENT_MULTICAST_V4[0],
    ADVERTISEMENT_MULTICAST_V4[1],
    ADVERTISEMENT_MULTICAST_V4[2],
    ADVERTISEMENT_MULTICAST_V4[3],
);

/// IPv6 advertisement multicast group (ff18::9f:0:2:1).
pub const ADVERTISEMENT_GROUP_V6: Ipv6Addr =
    Ipv6Addr::new(0xff18, 0, 0, 0, 0x009f, 0, 0x0002, 0x0001);

/// IPv4 transform multicast group for a system (239.159.1.<system>).
pub fn transform_group_v4(system: u8) -> Ipv4Addr {
    Ipv4Addr::new(
        TRANSFORM_MULTICAST_BASE_V4[0],
        TRANSFORM_MULTICAST_BASE_V4[1],
        TRANSFORM_MULTICAST_BASE_V4[2],
        system,
    )
}

/// IPv6 transform multicast group for a system (ff18::9f:0:1:<system>).
pub fn transform_group_v6(system: u8) -> Ipv6Addr {
    Ipv6Addr::new(0xff18, 0, 0, 0, 0x009f, 0, 0x0001, u16::from(system))
}

/// Get all non-loopback IPv4 interface addresses suitable for multicast.
///
/// Honors the `OTP_MULTICAST_IF` environment variable to force a specific
/// interface for testing/debugging.
pub fn multicast_interfaces() -> io::Result<Vec<Ipv4Addr>> {
    if let Ok(var) = std::env::var("OTP_MULTICAST_IF") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            log::debug!("[UDP] OTP_MULTICAST_IF override: {}", addr);
            return Ok(vec![addr]);
        }
    }

    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(err) => {
            log::debug!("[UDP] failed to list network interfaces: {}", err);
            return Ok(Vec::new());
        }
    };

    let mut addrs = Vec::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(ipv4) = ip {
            if !ipv4.is_loopback() {
                addrs.push(ipv4);
            }
        }
    }
    log::debug!("[UDP] discovered {} non-loopback interfaces", addrs.len());
    Ok(addrs)
}

/// Join IPv4 groups on the selected interface, or on every non-loopback
/// interface when none was selected.
///
/// Per-interface join failures are non-fatal when joining broadly: an
/// adapter without multicast support only costs a debug line. Joining on a
/// caller-selected interface reports failures.
pub fn join_groups_v4(
    socket: &UdpSocket,
    groups: &[Ipv4Addr],
    iface: Option<Ipv4Addr>,
) -> io::Result<()> {
    if let Some(iface) = iface {
        for group in groups {
            socket.join_multicast_v4(group, &iface)?;
            log::debug!("[UDP] join_multicast_v4({}) on {}", group, iface);
        }
        return Ok(());
    }

    let interfaces = multicast_interfaces()?;
    if interfaces.is_empty() {
        log::debug!("[UDP] no suitable interfaces found, joining on UNSPECIFIED");
        for group in groups {
            socket.join_multicast_v4(group, &Ipv4Addr::UNSPECIFIED)?;
        }
        return Ok(());
    }

    for iface in &interfaces {
        for group in groups {
            match socket.join_multicast_v4(group, iface) {
                Ok(()) => {
                    log::debug!("[UDP] join_multicast_v4({}) on {}", group, iface);
                }
                Err(err) if err.raw_os_error() == Some(98) => {
                    // EADDRINUSE: already joined on the same physical NIC.
                    log::debug!(
                        "[UDP] join_multicast_v4({}) on {} already joined, skipping",
                        group,
                        iface
                    );
                }
                Err(err) => {
                    log::debug!(
                        "[UDP] join_multicast_v4({}) on {} failed (non-fatal): {}",
                        group,
                        iface,
                        err
                    );
                }
            }
        }
    }
    Ok(())
}

/// Join IPv6 groups on the interface with the given index (0 = any).
pub fn join_groups_v6(socket: &UdpSocket, groups: &[Ipv6Addr], ifindex: u32) -> io::Result<()> {
    for group in groups {
        socket.join_multicast_v6(group, ifindex)?;
        log::debug!("[UDP] join_multicast_v6({}) on index {}", group, ifindex);
    }
    Ok(())
}
