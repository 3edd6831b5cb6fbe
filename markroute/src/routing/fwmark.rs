//! Lifetime of the policy rule that makes the engine's table reachable:
//! `ip rule add fwmark <mark> table <table>` at startup, rule removal plus
//! a policy-table flush at shutdown. The packet-filter rules stamping the
//! mark are installed by the external firewall bootstrap, not here.

use super::netlink_ops::{KernelOps, PolicyRuleSpec};
use super::Error;

const RULE_PRIORITY: u32 = 100;

/// The installed policy rule. Must be torn down explicitly; dropping it
/// without teardown leaves the fwmark rule in the kernel.
pub(crate) struct FwmarkInfra<K: KernelOps> {
    kernel: K,
    rule: PolicyRuleSpec,
    torn_down: bool,
}

/// Removes leftovers of a previous crash: a matching fwmark rule and any
/// routes still sitting in the policy table. Best-effort, called before
/// [`setup`].
pub(crate) async fn cleanup_stale<K: KernelOps>(kernel: &K, fw_mark: u32, table_id: u32) {
    if let Ok(rules) = kernel.rule_list().await {
        for rule in rules
            .iter()
            .filter(|r| r.fw_mark == fw_mark || r.table_id == table_id)
        {
            tracing::info!(fw_mark = rule.fw_mark, "found stale policy rule, cleaning up");
            let _ = kernel.rule_del(rule).await;
        }
    }
    if let Ok(routes) = kernel.route_list().await {
        for spec in &routes {
            tracing::info!(dst = %spec.dst, "found stale route in policy table, cleaning up");
            let _ = kernel.route_del(spec).await;
        }
    }
}

pub(crate) async fn setup<K: KernelOps>(
    kernel: K,
    fw_mark: u32,
    table_id: u32,
) -> Result<FwmarkInfra<K>, Error> {
    let rule = PolicyRuleSpec {
        fw_mark,
        table_id,
        priority: RULE_PRIORITY,
    };
    kernel.rule_add(&rule).await?;
    tracing::info!(fw_mark, table = table_id, "policy rule installed");
    Ok(FwmarkInfra {
        kernel,
        rule,
        torn_down: false,
    })
}

impl<K: KernelOps> FwmarkInfra<K> {
    /// Removes the policy rule and flushes every route left in the table.
    /// Errors are logged; shutdown continues regardless.
    pub(crate) async fn teardown(mut self) {
        self.torn_down = true;

        if let Err(error) = self.kernel.rule_del(&self.rule).await {
            tracing::warn!(%error, "failed to delete policy rule, continuing anyway");
        }

        match self.kernel.route_list().await {
            Ok(routes) => {
                for spec in &routes {
                    if let Err(error) = self.kernel.route_del(spec).await {
                        tracing::warn!(%error, dst = %spec.dst, "failed to flush route from policy table");
                    }
                }
                tracing::info!(flushed = routes.len(), "policy table flushed");
            }
            Err(error) => {
                tracing::warn!(%error, "failed to list policy table for flushing");
            }
        }
    }
}

impl<K: KernelOps> Drop for FwmarkInfra<K> {
    fn drop(&mut self) {
        if !self.torn_down {
            tracing::warn!("policy rule dropped without teardown, fwmark rule may be leaked");
        }
    }
}
