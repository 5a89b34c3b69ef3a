// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TTL / hop-limit configuration for outbound multicast.
//!
//! OTP defaults to TTL 1 (IPv4) and hop-limit 1 (IPv6): transform traffic
//! stays on the local segment unless the operator widens it.

use socket2::Socket;
use std::io;

/// Outbound multicast TTL settings.
#[derive(Copy, Clone, Debug)]
pub struct TtlConfig {
    /// IPv4 multicast TTL.
    pub multicast_ttl: u32,
    /// IPv6 multicast hop limit.
    pub hop_limit: u32,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            multicast_ttl: 1,
            hop_limit: 1,
        }
    }
}

impl TtlConfig {
    /// Defaults, overridable through `OTP_MULTICAST_TTL` (applied to both
    /// families) for testing across routed segments.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(var) = std::env::var("OTP_MULTICAST_TTL") {
            if let Ok(ttl) = var.parse::<u32>() {
                log::debug!("[UDP] OTP_MULTICAST_TTL override: {}", ttl);
                config.multicast_ttl = ttl;
                config.hop_limit = ttl;
            }
        }
        config
    }

    /// Apply IPv4 settings; also enables multicast loopback so co-located
    /// components hear each other.
    pub fn apply_v4(&self, socket: &Socket) -> io::Result<()> {
        socket.set_multicast_ttl_v4(self.multicast_ttl)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(())
    }

    /// Apply IPv6 settings.
    pub fn apply_v6(&self, socket: &Socket) -> io::Result<()> {
        socket.set_multicast_hops_v6(self.hop_limit)?;
        socket.set_multicast_loop_v6(true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_link_local() {
        let config = TtlConfig::default();
        assert_eq!(config.multicast_ttl, 1);
        assert_eq!(config.hop_limit, 1);
    }
}
