//! Policy-table route manipulation: the kernel backends, the route engine,
//! and the background workers that keep the table in sync with the rule set
//! and the resolver event stream.

use thiserror::Error;

use markroute_lib::route::KernelRouteSpec;

pub(crate) mod batcher;
pub(crate) mod conntrack_ops;
pub(crate) mod engine;
pub(crate) mod expirer;
pub(crate) mod fwmark;
pub(crate) mod netlink_ops;

#[cfg(test)]
pub(crate) mod mocks;

#[derive(Debug, Error)]
pub enum Error {
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("interface `{0}` not found")]
    InterfaceUnknown(String),
    #[error("interface `{0}` matches more than one link")]
    InterfaceAmbiguous(String),
    #[error("no IPv4 default route on the host")]
    NoDefaultRoute,
    #[error("conntrack error: {0}")]
    Conntrack(String),
    #[error("general error: {0}")]
    General(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteOp {
    Add,
    Del,
}

/// One pending kernel operation on the dispatch queue. Carries the flat
/// spec copied out of the route, never the route itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedOp {
    pub op: RouteOp,
    pub spec: KernelRouteSpec,
}
