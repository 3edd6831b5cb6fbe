//! The expirer worker: reclaims DNS-derived routes whose TTL ran out, but
//! only once no tracked flow is using them anymore.
//!
//! One conntrack dump per cycle; a flow whose source or destination falls
//! into an expired range preserves every such range for this cycle (NAT
//! masquerading can present either side). A failed dump skips the whole
//! cycle: a stale route is safer than a wrongly removed one.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use markroute_lib::interval::EntryId;

use super::conntrack_ops::ConntrackOps;
use super::engine::RouteIndex;
use super::{QueuedOp, RouteOp};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct Expirer<C: ConntrackOps> {
    index: RouteIndex,
    conntrack: C,
    queue: mpsc::UnboundedSender<QueuedOp>,
    shutdown: CancellationToken,
    period: Duration,
}

impl<C: ConntrackOps> Expirer<C> {
    pub(crate) fn new(
        index: RouteIndex,
        conntrack: C,
        queue: mpsc::UnboundedSender<QueuedOp>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            index,
            conntrack,
            queue,
            shutdown,
            period: CLEANUP_INTERVAL,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
            self.sweep();
        }
        tracing::debug!("expirer stopped");
    }

    /// One expiry cycle. Runs entirely under the index lock so no refresh
    /// can race the removal decision.
    pub(crate) fn sweep(&mut self) {
        let mut index = self.index.lock().expect("route index lock poisoned");

        let expired: Vec<(EntryId, u64, u64)> = index
            .entries()
            .iter()
            .filter(|entry| entry.value.expired())
            .map(|entry| (entry.id, entry.start, entry.end))
            .collect();
        if expired.is_empty() {
            return;
        }

        let flows = match self.conntrack.dump_flows() {
            Ok(flows) => flows,
            Err(error) => {
                tracing::warn!(%error, "cannot enumerate conntrack, keeping expired routes this cycle");
                return;
            }
        };

        let mut in_use: HashSet<EntryId> = HashSet::new();
        for flow in &flows {
            let src = u64::from(u32::from(flow.src));
            let dst = u64::from(u32::from(flow.dst));
            for (id, start, end) in &expired {
                if (*start <= src && src < *end) || (*start <= dst && dst < *end) {
                    in_use.insert(*id);
                }
            }
        }

        for (id, start, end) in expired {
            if in_use.contains(&id) {
                continue;
            }
            if let Some(route) = index.remove(id, start, end) {
                if let Some(spec) = route.spec()
                    && self
                        .queue
                        .send(QueuedOp {
                            op: RouteOp::Del,
                            spec,
                        })
                        .is_err()
                {
                    tracing::warn!(net = %route.net, "dispatch queue closed, cannot enqueue removal");
                }
                tracing::info!(net = %route.net, "removed expired route");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::conntrack_ops::Flow;
    use crate::routing::mocks::MockConntrack;

    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use markroute_lib::interval::IntervalTree;
    use markroute_lib::route::{Egress, Route};

    fn ephemeral(addr: &str, ttl: u32) -> Route {
        let mut route = Route::host(
            addr.parse().unwrap(),
            Some(Egress {
                name: "eth2".into(),
                index: 3,
                gateway: None,
            }),
            300,
            5,
            Some(ttl),
        );
        route.reset_expiration(None);
        route
    }

    fn insert(index: &RouteIndex, route: Route) {
        let start = u64::from(route.net_start);
        let end = u64::from(route.net_end) + 1;
        index.lock().unwrap().insert(start, end, route);
    }

    fn expirer_for(
        index: RouteIndex,
        conntrack: MockConntrack,
    ) -> (Expirer<MockConntrack>, mpsc::UnboundedReceiver<QueuedOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Expirer::new(index, conntrack, tx, CancellationToken::new()),
            rx,
        )
    }

    fn flow(src: &str, dst: &str) -> Flow {
        Flow {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            proto: 6,
            src_port: 40000,
            dst_port: 443,
        }
    }

    #[tokio::test]
    async fn removes_expired_routes_and_enqueues_deletion() {
        let index: RouteIndex = Arc::new(Mutex::new(IntervalTree::new()));
        insert(&index, ephemeral("198.51.100.8", 0));
        std::thread::sleep(Duration::from_millis(10));

        let (mut expirer, mut rx) = expirer_for(index.clone(), MockConntrack::new());
        expirer.sweep();

        assert!(index.lock().unwrap().is_empty());
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.op, RouteOp::Del);
        assert_eq!(queued.spec.dst, Ipv4Addr::new(198, 51, 100, 8));
    }

    #[tokio::test]
    async fn keeps_routes_with_live_flows_to_the_destination() {
        let index: RouteIndex = Arc::new(Mutex::new(IntervalTree::new()));
        insert(&index, ephemeral("198.51.100.8", 0));
        std::thread::sleep(Duration::from_millis(10));

        let conntrack =
            MockConntrack::with_flows(vec![flow("10.0.0.2", "198.51.100.8")]);
        let (mut expirer, mut rx) = expirer_for(index.clone(), conntrack);
        expirer.sweep();

        assert_eq!(index.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_flow_sourced_inside_the_range_also_counts() {
        let index: RouteIndex = Arc::new(Mutex::new(IntervalTree::new()));
        insert(&index, ephemeral("198.51.100.8", 0));
        std::thread::sleep(Duration::from_millis(10));

        let conntrack =
            MockConntrack::with_flows(vec![flow("198.51.100.8", "10.0.0.2")]);
        let (mut expirer, mut rx) = expirer_for(index.clone(), conntrack);
        expirer.sweep();

        assert_eq!(index.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_flow_preserves_every_containing_interval() {
        let index: RouteIndex = Arc::new(Mutex::new(IntervalTree::new()));
        insert(&index, ephemeral("198.51.100.8", 0));
        let mut wider = Route::new(
            "198.51.100.0/24".parse().unwrap(),
            Some(Egress {
                name: "eth1".into(),
                index: 2,
                gateway: None,
            }),
            200,
            1,
            Some(0),
        );
        wider.reset_expiration(None);
        insert(&index, wider);
        std::thread::sleep(Duration::from_millis(10));

        let conntrack =
            MockConntrack::with_flows(vec![flow("10.0.0.2", "198.51.100.8")]);
        let (mut expirer, mut rx) = expirer_for(index.clone(), conntrack);
        expirer.sweep();

        assert_eq!(index.lock().unwrap().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn conntrack_failure_skips_the_cycle() {
        let index: RouteIndex = Arc::new(Mutex::new(IntervalTree::new()));
        insert(&index, ephemeral("198.51.100.8", 0));
        std::thread::sleep(Duration::from_millis(10));

        let conntrack = MockConntrack::new();
        conntrack.break_op("dump_flows", "netlink overrun");
        let (mut expirer, mut rx) = expirer_for(index.clone(), conntrack);
        expirer.sweep();

        assert_eq!(index.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn permanent_routes_never_expire() {
        let index: RouteIndex = Arc::new(Mutex::new(IntervalTree::new()));
        let mut permanent = Route::new(
            "192.0.2.0/24".parse().unwrap(),
            Some(Egress {
                name: "eth0".into(),
                index: 1,
                gateway: None,
            }),
            100,
            10,
            None,
        );
        permanent.reset_expiration(None);
        insert(&index, permanent);

        let (mut expirer, mut rx) = expirer_for(index.clone(), MockConntrack::new());
        expirer.sweep();

        assert_eq!(index.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_donor_routes_leave_without_kernel_traffic() {
        let index: RouteIndex = Arc::new(Mutex::new(IntervalTree::new()));
        let mut donor = Route::host("198.51.100.8".parse().unwrap(), None, 300, 5, Some(0));
        donor.reset_expiration(None);
        insert(&index, donor);
        std::thread::sleep(Duration::from_millis(10));

        let (mut expirer, mut rx) = expirer_for(index.clone(), MockConntrack::new());
        expirer.sweep();

        assert!(index.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
