//! The unit of routing: a CIDR plus egress policy and an optional lifetime.
//!
//! A [`Route`] lives inside the interval index; the kernel only ever sees its
//! flat [`KernelRouteSpec`]. Routes without an egress are TTL donors: they
//! contribute their TTL to matching records and are never installed.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use cidr::Ipv4Cidr;

/// Resolved egress policy for a route.
///
/// The `_DEFAULT` sentinel resolves to the host default route's interface and
/// gateway, captured once at startup (see [`crate::rules::IfaceTable`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Egress {
    pub name: String,
    pub index: u32,
    pub gateway: Option<Ipv4Addr>,
}

/// Flat descriptor handed to the kernel backend.
///
/// Pure data, cheap to copy onto the dispatch queue. The backend stamps the
/// policy table id and the fixed kernel defaults (`AF_INET`, `RTPROT_BOOT`,
/// `RTN_UNICAST`) when it encodes the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRouteSpec {
    pub dst: Ipv4Addr,
    pub prefix_len: u8,
    pub oif: u32,
    pub metric: u32,
    pub gateway: Option<Ipv4Addr>,
}

impl KernelRouteSpec {
    /// Rough rtnetlink wire size of this operation: netlink header, route
    /// message header, and the aligned dst/oif/priority/table attributes.
    /// Used by the batcher to stay below the socket send buffer.
    pub fn encoded_len(&self) -> usize {
        let mut len = 16 + 12 + 4 * 8;
        if self.gateway.is_some() {
            len += 8;
        }
        len
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub net: Ipv4Cidr,
    /// Inclusive 32-bit endpoints of `net`, precomputed for the index.
    pub net_start: u32,
    pub net_end: u32,
    /// `None` marks a TTL donor.
    pub egress: Option<Egress>,
    pub metric: u32,
    pub weight: u32,
    pub ttl: Option<u32>,
    pub expiration: Option<Instant>,
}

impl Route {
    pub fn new(net: Ipv4Cidr, egress: Option<Egress>, metric: u32, weight: u32, ttl: Option<u32>) -> Self {
        Self {
            net,
            net_start: u32::from(net.first_address()),
            net_end: u32::from(net.last_address()),
            egress,
            metric,
            weight,
            ttl,
            expiration: None,
        }
    }

    /// A `/32` route for a single resolved address.
    pub fn host(addr: Ipv4Addr, egress: Option<Egress>, metric: u32, weight: u32, ttl: Option<u32>) -> Self {
        Self::new(Ipv4Cidr::new_host(addr), egress, metric, weight, ttl)
    }

    pub fn is_donor(&self) -> bool {
        self.egress.is_none()
    }

    pub fn expired(&self) -> bool {
        self.expiration.is_some_and(|at| Instant::now() > at)
    }

    /// Re-arms the expiration clock. A given `new_ttl` can only lengthen the
    /// stored TTL, never shorten it; without a known TTL the route stays
    /// permanent.
    pub fn reset_expiration(&mut self, new_ttl: Option<u32>) {
        if let Some(new_ttl) = new_ttl {
            self.ttl = Some(self.ttl.map_or(new_ttl, |current| current.max(new_ttl)));
        }
        self.expiration = self
            .ttl
            .map(|ttl| Instant::now() + Duration::from_secs(u64::from(ttl)));
    }

    /// The kernel-level spec, or `None` for TTL donors. Idempotent and
    /// side-effect free.
    pub fn spec(&self) -> Option<KernelRouteSpec> {
        let egress = self.egress.as_ref()?;
        Some(KernelRouteSpec {
            dst: self.net.first_address(),
            prefix_len: self.net.network_length(),
            oif: egress.index,
            metric: self.metric,
            gateway: egress.gateway,
        })
    }
}
