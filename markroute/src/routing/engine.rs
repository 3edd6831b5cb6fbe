//! The route engine: the interval-indexed route table and the A-record
//! event handler driving it.
//!
//! All index mutations are serialized by one mutex. Kernel traffic happens
//! outside the lock: permanent and expirer-driven operations go through the
//! dispatch queue, resolver-driven installs hit the kernel inline so the
//! route exists before the resolver answers the client.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use markroute_lib::interval::IntervalTree;
use markroute_lib::record::ARecord;
use markroute_lib::route::Route;
use markroute_lib::rules::RuleSet;

use super::netlink_ops::KernelOps;
use super::{QueuedOp, RouteOp};

pub(crate) type RouteIndex = Arc<Mutex<IntervalTree<Route>>>;

/// Outcome of [`RouteEngine::add_route`], carrying a snapshot of the route
/// the index ended up with.
#[derive(Debug, Clone)]
pub(crate) enum Installed {
    /// An identical route existed; its expiration was refreshed.
    Refreshed(Route),
    /// A wider route of strictly higher weight already covers the range.
    Dominated(Route),
    /// The route was inserted and its kernel install issued or queued.
    Inserted(Route),
}

#[derive(Clone)]
pub(crate) struct RouteEngine<K: KernelOps> {
    index: RouteIndex,
    rules: Arc<RuleSet>,
    kernel: K,
    queue: mpsc::UnboundedSender<QueuedOp>,
    domain_route_ttl: u32,
}

impl<K: KernelOps> RouteEngine<K> {
    pub(crate) fn new(
        index: RouteIndex,
        rules: Arc<RuleSet>,
        kernel: K,
        queue: mpsc::UnboundedSender<QueuedOp>,
        domain_route_ttl: u32,
    ) -> Self {
        Self {
            index,
            rules,
            kernel,
            queue,
            domain_route_ttl,
        }
    }

    /// Installs the permanent routes of every country and net rule. TTL
    /// donors stay out of the index; they only matter to TTL computation.
    pub(crate) async fn load_permanent(&self) {
        let mut loaded = 0usize;
        for route in self.rules.permanent_routes() {
            if route.is_donor() {
                tracing::info!(net = %route.net, "rule has no interface, used for TTL donation only");
                continue;
            }
            self.add_route(route.clone(), false).await;
            loaded += 1;
        }
        tracing::info!(loaded, "permanent routes loaded");
    }

    /// Adds `route` to the index, deduplicating against an exact match and
    /// skipping ranges dominated by a wider, higher-weight route. When
    /// `immediate` is set the kernel add happens inline; otherwise it is
    /// queued for the batcher. Kernel failures are logged, never returned:
    /// the index stays authoritative.
    pub(crate) async fn add_route(&self, mut route: Route, immediate: bool) -> Installed {
        let start = u64::from(route.net_start);
        let end = u64::from(route.net_end) + 1;

        let (snapshot, spec) = {
            let mut index = self.index.lock().expect("route index lock poisoned");

            let mut exact = None;
            let mut dominating = None;
            for entry in index.overlapping(start, end) {
                let existing = entry.value;
                if entry.start == start
                    && entry.end == end
                    && existing.metric == route.metric
                    && existing.weight == route.weight
                    && existing.egress == route.egress
                {
                    exact = Some(entry.id);
                    break;
                }
                if entry.start <= start
                    && end <= entry.end
                    && entry.end - entry.start > end - start
                    && existing.weight > route.weight
                {
                    dominating = Some(existing.clone());
                }
            }

            if let Some(id) = exact
                && let Some(existing) = index.get_mut(id, start, end)
            {
                existing.reset_expiration(route.ttl);
                return Installed::Refreshed(existing.clone());
            }
            if let Some(covering) = dominating {
                tracing::info!(
                    net = %route.net,
                    covering = %covering.net,
                    "skipping route covered by a less specific, higher-weight route"
                );
                return Installed::Dominated(covering);
            }

            route.reset_expiration(None);
            let snapshot = route.clone();
            let spec = route.spec();
            index.insert(start, end, route);
            tracing::debug!(net = %snapshot.net, metric = snapshot.metric, "added route");
            (snapshot, spec)
        };

        if let Some(spec) = spec {
            if immediate {
                if let Err(error) = self.kernel.route_add(&spec).await {
                    tracing::warn!(%error, dst = %spec.dst, "immediate route install failed");
                }
            } else if self
                .queue
                .send(QueuedOp {
                    op: RouteOp::Add,
                    spec,
                })
                .is_err()
            {
                tracing::warn!(dst = %spec.dst, "dispatch queue closed, dropping route install");
            }
        }
        Installed::Inserted(snapshot)
    }

    /// Handles one A-record observation and returns the TTL the resolver
    /// should advertise to its client.
    pub(crate) async fn on_a_record(&self, record: &ARecord) -> Option<u32> {
        let mut candidates = vec![record.ttl];
        candidates.push(self.rules.donor_ttl_for(record.addr));

        match self.rules.best_domain_match(record) {
            Some(rule) => {
                candidates.push(rule.ttl);
                let effective = min_positive(&candidates);
                let mut route = rule.build_route(record.addr);
                route.ttl = effective;
                // Installed inline: the client must not receive the answer
                // before the kernel has the route.
                match self.add_route(route, true).await {
                    Installed::Refreshed(route) => {
                        tracing::debug!(net = %route.net, name = %record.name, "refreshed route")
                    }
                    Installed::Dominated(covering) => {
                        tracing::debug!(covering = %covering.net, name = %record.name, "record already covered")
                    }
                    Installed::Inserted(route) => {
                        tracing::debug!(net = %route.net, name = %record.name, "installed route")
                    }
                }
                effective
            }
            None => {
                candidates.push(Some(self.domain_route_ttl));
                min_positive(&candidates)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> &RouteIndex {
        &self.index
    }
}

fn min_positive(candidates: &[Option<u32>]) -> Option<u32> {
    candidates.iter().flatten().copied().filter(|ttl| *ttl > 0).min()
}
