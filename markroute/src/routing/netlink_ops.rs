//! Abstraction over rtnetlink operations for testability.
//!
//! Defines the [`KernelOps`] trait over the route and rule surface the
//! engine needs, decoupled from the netlink wire format. Production code
//! uses [`RealNetlinkOps`] wrapping an `rtnetlink::Handle`; tests use the
//! stateful mocks in the `mocks` module.
//!
//! `EEXIST` on add and `ENOENT` on del mean the kernel already agrees with
//! us; both are absorbed at debug level instead of surfacing as errors.

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteProtocol, RouteScope, RouteType,
};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};

use std::net::Ipv4Addr;

use markroute_lib::route::KernelRouteSpec;
use markroute_lib::rules::DefaultRoute;

use super::{Error, QueuedOp, RouteOp};

// ============================================================================
// Domain Types
// ============================================================================

/// Policy routing rule selecting the engine's table by firewall mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRuleSpec {
    pub fw_mark: u32,
    pub table_id: u32,
    pub priority: u32,
}

// ============================================================================
// Trait
// ============================================================================

/// Kernel route/rule/link operations.
///
/// Implementors must be cheaply cloneable (e.g. because the underlying
/// handle is already reference-counted).
#[async_trait]
pub trait KernelOps: Send + Sync + Clone {
    async fn route_add(&self, spec: &KernelRouteSpec) -> Result<(), Error>;
    async fn route_del(&self, spec: &KernelRouteSpec) -> Result<(), Error>;
    /// Routes currently installed in the policy table.
    async fn route_list(&self) -> Result<Vec<KernelRouteSpec>, Error>;

    /// Submits a batched sequence of operations; one outcome per operation,
    /// in order. A rejected operation never aborts the rest of the batch.
    async fn apply_batch(&self, ops: &[QueuedOp]) -> Vec<Result<(), Error>> {
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

    async fn rule_add(&self, rule: &PolicyRuleSpec) -> Result<(), Error>;
    async fn rule_del(&self, rule: &PolicyRuleSpec) -> Result<(), Error>;
    async fn rule_list(&self) -> Result<Vec<PolicyRuleSpec>, Error>;

    /// One-shot name to kernel index lookup.
    async fn resolve_interface(&self, name: &str) -> Result<u32, Error>;
    /// The host's preferred IPv4 default route.
    async fn default_route(&self) -> Result<DefaultRoute, Error>;
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Production [`KernelOps`] backed by an `rtnetlink::Handle`, scoped to one
/// policy table.
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
    table: u32,
}

fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -errno)
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle, table: u32) -> Self {
        Self { handle, table }
    }

    fn build_route_message(
        &self,
        spec: &KernelRouteSpec,
    ) -> rtnetlink::packet_route::route::RouteMessage {
        let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(spec.dst, spec.prefix_len)
            .output_interface(spec.oif)
            .table_id(self.table);
        if let Some(gw) = spec.gateway {
            builder = builder.gateway(gw);
        }
        let mut msg = builder.build();
        msg.header.protocol = RouteProtocol::Boot;
        msg.header.kind = RouteType::Unicast;
        if spec.gateway.is_none() {
            msg.header.scope = RouteScope::Link;
        }
        msg.attributes.push(RouteAttribute::Priority(spec.metric));
        msg
    }

    fn route_message_to_spec(
        msg: &rtnetlink::packet_route::route::RouteMessage,
    ) -> Option<KernelRouteSpec> {
        let oif = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        })?;

        let dst = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(*ip),
                _ => None,
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(*ip),
            _ => None,
        });

        let metric = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Priority(p) => Some(*p),
                _ => None,
            })
            .unwrap_or(0);

        Some(KernelRouteSpec {
            dst,
            prefix_len: msg.header.destination_prefix_length,
            oif,
            metric,
            gateway,
        })
    }

    /// Reduces a rule message to the mark/table/priority triple the engine
    /// keys policy rules on. Rules without a mark or table are not ours.
    fn rule_message_to_spec(msg: &RuleMessage) -> Option<PolicyRuleSpec> {
        let mut fw_mark = None;
        let mut table_id = None;
        let mut priority = 0;
        for attr in &msg.attributes {
            match attr {
                RuleAttribute::FwMark(mark) => fw_mark = Some(*mark),
                RuleAttribute::Table(table) => table_id = Some(*table),
                RuleAttribute::Priority(value) => priority = *value,
                _ => {}
            }
        }
        Some(PolicyRuleSpec {
            fw_mark: fw_mark?,
            table_id: table_id?,
            priority,
        })
    }
}

#[async_trait]
impl KernelOps for RealNetlinkOps {
    async fn route_add(&self, spec: &KernelRouteSpec) -> Result<(), Error> {
        let msg = self.build_route_message(spec);
        match self.handle.route().add(msg).execute().await {
            Ok(()) => Ok(()),
            Err(err) if is_errno(&err, libc::EEXIST) => {
                tracing::debug!(dst = %spec.dst, prefix_len = spec.prefix_len, "route already installed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn route_del(&self, spec: &KernelRouteSpec) -> Result<(), Error> {
        let msg = self.build_route_message(spec);
        match self.handle.route().del(msg).execute().await {
            Ok(()) => Ok(()),
            Err(err) if is_errno(&err, libc::ENOENT) => {
                tracing::debug!(dst = %spec.dst, prefix_len = spec.prefix_len, "route already gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn route_list(&self) -> Result<Vec<KernelRouteSpec>, Error> {
        let builder =
            rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default().table_id(self.table);
        let routes: Vec<_> = self
            .handle
            .route()
            .get(builder.build())
            .execute()
            .try_collect()
            .await?;

        Ok(routes.iter().filter_map(Self::route_message_to_spec).collect())
    }

    async fn rule_add(&self, rule: &PolicyRuleSpec) -> Result<(), Error> {
        self.handle
            .rule()
            .add()
            .v4()
            .action(RuleAction::ToTable)
            .table_id(rule.table_id)
            .fw_mark(rule.fw_mark)
            .priority(rule.priority)
            .execute()
            .await?;
        Ok(())
    }

    async fn rule_del(&self, rule: &PolicyRuleSpec) -> Result<(), Error> {
        // Deletion goes by message, so walk the dump until ours shows up.
        let mut messages = self.handle.rule().get(rtnetlink::IpVersion::V4).execute();
        while let Some(msg) = messages.try_next().await? {
            let ours = Self::rule_message_to_spec(&msg)
                .is_some_and(|spec| spec.fw_mark == rule.fw_mark && spec.table_id == rule.table_id);
            if ours {
                self.handle.rule().del(msg).execute().await?;
                return Ok(());
            }
        }

        Err(Error::General(format!(
            "no rule selects table {} for mark {:#x}",
            rule.table_id, rule.fw_mark
        )))
    }

    async fn rule_list(&self) -> Result<Vec<PolicyRuleSpec>, Error> {
        let mut specs = Vec::new();
        let mut messages = self.handle.rule().get(rtnetlink::IpVersion::V4).execute();
        while let Some(msg) = messages.try_next().await? {
            if let Some(spec) = Self::rule_message_to_spec(&msg) {
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    async fn resolve_interface(&self, name: &str) -> Result<u32, Error> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;

        let mut matches = links.iter().filter(|link| {
            link.attributes
                .iter()
                .any(|a| matches!(a, LinkAttribute::IfName(n) if n == name))
        });

        let first = matches
            .next()
            .ok_or_else(|| Error::InterfaceUnknown(name.to_string()))?;
        if matches.next().is_some() {
            return Err(Error::InterfaceAmbiguous(name.to_string()));
        }
        Ok(first.header.index)
    }

    async fn default_route(&self) -> Result<DefaultRoute, Error> {
        let routes: Vec<_> = self
            .handle
            .route()
            .get(rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default().build())
            .execute()
            .try_collect()
            .await?;

        // Prefer the default route with the lowest metric
        let default = routes
            .iter()
            .filter(|r| r.header.destination_prefix_length == 0)
            .min_by_key(|r| {
                r.attributes
                    .iter()
                    .find_map(|a| match a {
                        RouteAttribute::Priority(p) => Some(*p),
                        _ => None,
                    })
                    .unwrap_or(0)
            })
            .ok_or(Error::NoDefaultRoute)?;

        let oif = default
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Oif(idx) => Some(*idx),
                _ => None,
            })
            .ok_or(Error::NoDefaultRoute)?;

        let gateway = default.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(*ip),
            _ => None,
        });

        let metric = default
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Priority(p) => Some(*p),
                _ => None,
            })
            .unwrap_or(0);

        Ok(DefaultRoute { oif, gateway, metric })
    }
}
