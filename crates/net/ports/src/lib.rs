//! Randomized port allocation from reserved ranges.
//!
//! Each listener role draws its ports from its own disjoint range so that
//! overlay transport, inbound backends, and outbound tunnel listeners cannot
//! collide with each other. Selection within a range is randomized;
//! collision-freedom is not guaranteed and callers treat a failed bind as a
//! failure of that one attempt.

use std::{fmt, net::TcpListener};

use rand::Rng;
use tracing::trace;

/// Range the overlay transport listens in.
pub const OVERLAY_LISTEN_RANGE: PortRange = PortRange::new(10000, 10000);

/// Range reserved for backends serving inbound tunnels.
pub const INBOUND_BACKEND_RANGE: PortRange = PortRange::new(20000, 10000);

/// Range reserved for local listeners feeding outbound tunnels.
pub const OUTBOUND_LISTEN_RANGE: PortRange = PortRange::new(30000, 10000);

/// How many candidates [`PortAllocator::pick_free`] probes before giving up.
const FREE_PORT_PROBE_ATTEMPTS: u32 = 16;

/// A half-open range of TCP ports `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    len: u16,
}

impl PortRange {
    /// Create a range starting at `start` spanning `len` ports.
    pub const fn new(start: u16, len: u16) -> Self {
        assert!(len > 0, "port range must not be empty");
        assert!(start as u32 + len as u32 <= u16::MAX as u32 + 1);
        Self { start, len }
    }

    /// First port of the range.
    pub const fn start(&self) -> u16 {
        self.start
    }

    /// Number of ports in the range.
    pub const fn span(&self) -> u16 {
        self.len
    }

    /// Whether `port` falls inside the range.
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.start && (port as u32) < self.start as u32 + self.len as u32
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start,
            self.start as u32 + self.len as u32
        )
    }
}

/// No free port could be found in the allocator's range.
#[derive(Debug, thiserror::Error)]
#[error("no free port found in range {range} after {attempts} attempts")]
pub struct NoFreePort {
    /// The probed range.
    pub range: PortRange,
    /// How many candidates were probed.
    pub attempts: u32,
}

/// Picks ports at random from one reserved [`PortRange`].
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
}

impl PortAllocator {
    /// Create an allocator over the given range.
    pub const fn new(range: PortRange) -> Self {
        Self { range }
    }

    /// The range this allocator draws from.
    pub const fn range(&self) -> PortRange {
        self.range
    }

    /// Pick a random port from the range.
    ///
    /// The port is not probed; callers that bind it themselves get the
    /// availability check from the bind.
    pub fn pick(&self) -> u16 {
        self.range.start + rand::rng().random_range(0..self.range.len)
    }

    /// Pick a random port from the range that is currently bindable on
    /// loopback.
    ///
    /// Used when a third party (the backend process) must be able to claim
    /// the port afterwards. The check is inherently racy; a later bind
    /// failure is still possible and is the caller's to handle.
    pub fn pick_free(&self) -> Result<u16, NoFreePort> {
        for _ in 0..FREE_PORT_PROBE_ATTEMPTS {
            let port = self.pick();
            match TcpListener::bind(("127.0.0.1", port)) {
                Ok(listener) => {
                    drop(listener);
                    return Ok(port);
                }
                Err(error) => {
                    trace!(port, %error, "port in use, probing another");
                }
            }
        }
        Err(NoFreePort {
            range: self.range,
            attempts: FREE_PORT_PROBE_ATTEMPTS,
        })
    }
}
