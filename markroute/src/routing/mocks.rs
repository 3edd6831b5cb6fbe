//! Test doubles for the kernel and conntrack backends.
//!
//! Each mock keeps a small model of kernel state plus a log of what the
//! engine asked of it, so tests can assert on the resulting state (installed
//! routes, surviving flows) as well as on the operation stream. Failures are
//! armed per operation name through [`Faults`] to drive the engine's
//! log-and-continue paths.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use markroute_lib::route::KernelRouteSpec;
use markroute_lib::rules::DefaultRoute;

use super::conntrack_ops::{ConntrackOps, Flow};
use super::netlink_ops::{KernelOps, PolicyRuleSpec};
use super::{Error, QueuedOp, RouteOp};

/// Armed failures, shared across clones of a mock: operation name mapped to
/// the error text the next calls will report.
#[derive(Debug, Clone, Default)]
struct Faults(Arc<Mutex<HashMap<String, String>>>);

impl Faults {
    fn arm(&self, op: &str, message: &str) {
        self.0
            .lock()
            .unwrap()
            .insert(op.to_string(), message.to_string());
    }

    fn trip(&self, op: &str) -> Result<(), String> {
        match self.0.lock().unwrap().get(op) {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }
}

// ============================================================================
// MockKernelOps
// ============================================================================

#[derive(Debug, Default)]
pub struct KernelState {
    pub routes: Vec<KernelRouteSpec>,
    pub rules: Vec<PolicyRuleSpec>,
    pub links: Vec<(String, u32)>,
    pub default_route: Option<DefaultRoute>,
    /// Every add/del the backend saw, in order, including failed ones.
    pub ops_log: Vec<(RouteOp, KernelRouteSpec)>,
    /// One per `apply_batch` call, i.e. one per flush.
    pub batches: usize,
}

#[derive(Clone)]
pub struct MockKernelOps {
    pub state: Arc<Mutex<KernelState>>,
    faults: Faults,
}

impl MockKernelOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(KernelState::default())),
            faults: Faults::default(),
        }
    }

    pub fn with_links(self, links: &[(&str, u32)]) -> Self {
        self.state.lock().unwrap().links = links
            .iter()
            .map(|(name, index)| (name.to_string(), *index))
            .collect();
        self
    }

    pub fn with_default_route(self, default_route: DefaultRoute) -> Self {
        self.state.lock().unwrap().default_route = Some(default_route);
        self
    }

    /// Makes the named operation fail with `message` from now on.
    pub fn break_op(&self, op: &str, message: &str) {
        self.faults.arm(op, message);
    }

    fn gate(&self, op: &str) -> Result<(), Error> {
        self.faults.trip(op).map_err(Error::General)
    }
}

#[async_trait]
impl KernelOps for MockKernelOps {
    async fn route_add(&self, spec: &KernelRouteSpec) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .ops_log
            .push((RouteOp::Add, *spec));
        self.gate("route_add")?;
        let mut s = self.state.lock().unwrap();
        // A duplicate add is EEXIST in the kernel and the real backend
        // absorbs it, so the model stays a set.
        if !s.routes.contains(spec) {
            s.routes.push(*spec);
        }
        Ok(())
    }

    async fn route_del(&self, spec: &KernelRouteSpec) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .ops_log
            .push((RouteOp::Del, *spec));
        self.gate("route_del")?;
        let mut s = self.state.lock().unwrap();
        // ENOENT on a missing route is likewise absorbed.
        if let Some(pos) = s.routes.iter().position(|r| r == spec) {
            s.routes.remove(pos);
        }
        Ok(())
    }

    async fn route_list(&self) -> Result<Vec<KernelRouteSpec>, Error> {
        self.gate("route_list")?;
        Ok(self.state.lock().unwrap().routes.clone())
    }

    async fn apply_batch(&self, ops: &[QueuedOp]) -> Vec<Result<(), Error>> {
        self.state.lock().unwrap().batches += 1;
        let mut results = Vec::with_capacity(ops.len());
        for item in ops {
            let result = match item.op {
                RouteOp::Add => self.route_add(&item.spec).await,
                RouteOp::Del => self.route_del(&item.spec).await,
            };
            results.push(result);
        }
        results
    }

    async fn rule_add(&self, rule: &PolicyRuleSpec) -> Result<(), Error> {
        self.gate("rule_add")?;
        self.state.lock().unwrap().rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del(&self, rule: &PolicyRuleSpec) -> Result<(), Error> {
        self.gate("rule_del")?;
        let mut s = self.state.lock().unwrap();
        let found = s
            .rules
            .iter()
            .position(|r| r.fw_mark == rule.fw_mark && r.table_id == rule.table_id);
        match found {
            Some(pos) => {
                s.rules.remove(pos);
                Ok(())
            }
            None => Err(Error::General(format!(
                "no rule selects table {} for mark {:#x}",
                rule.table_id, rule.fw_mark
            ))),
        }
    }

    async fn rule_list(&self) -> Result<Vec<PolicyRuleSpec>, Error> {
        self.gate("rule_list")?;
        Ok(self.state.lock().unwrap().rules.clone())
    }

    async fn resolve_interface(&self, name: &str) -> Result<u32, Error> {
        self.gate("resolve_interface")?;
        let s = self.state.lock().unwrap();
        let mut matches = s.links.iter().filter(|(n, _)| n == name);
        let first = matches
            .next()
            .ok_or_else(|| Error::InterfaceUnknown(name.to_string()))?;
        if matches.next().is_some() {
            return Err(Error::InterfaceAmbiguous(name.to_string()));
        }
        Ok(first.1)
    }

    async fn default_route(&self) -> Result<DefaultRoute, Error> {
        self.gate("default_route")?;
        self.state
            .lock()
            .unwrap()
            .default_route
            .ok_or(Error::NoDefaultRoute)
    }
}

// ============================================================================
// MockConntrack
// ============================================================================

#[derive(Debug, Default)]
pub struct ConntrackState {
    pub flows: Vec<Flow>,
    pub deleted: Vec<Flow>,
}

#[derive(Clone)]
pub struct MockConntrack {
    pub state: Arc<Mutex<ConntrackState>>,
    faults: Faults,
}

impl MockConntrack {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConntrackState::default())),
            faults: Faults::default(),
        }
    }

    pub fn with_flows(flows: Vec<Flow>) -> Self {
        let mock = Self::new();
        mock.state.lock().unwrap().flows = flows;
        mock
    }

    /// Makes the named operation fail with `message` from now on.
    pub fn break_op(&self, op: &str, message: &str) {
        self.faults.arm(op, message);
    }
}

impl ConntrackOps for MockConntrack {
    fn dump_flows(&mut self) -> Result<Vec<Flow>, Error> {
        self.faults.trip("dump_flows").map_err(Error::Conntrack)?;
        Ok(self.state.lock().unwrap().flows.clone())
    }

    fn delete_flow(&mut self, flow: &Flow) -> Result<(), Error> {
        self.faults.trip("delete_flow").map_err(Error::Conntrack)?;
        let mut s = self.state.lock().unwrap();
        if let Some(pos) = s.flows.iter().position(|f| f == flow) {
            s.flows.remove(pos);
        }
        s.deleted.push(*flow);
        Ok(())
    }
}
