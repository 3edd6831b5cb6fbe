//! Rule compilation.
//!
//! The raw config entries compile once at startup into an immutable
//! [`RuleSet`]: country and net rules materialize concrete routes, domain
//! rules are templates producing a `/32` per matching A record. Compilation
//! also runs the single metric pass: explicit metrics must be unique per
//! entry, entries without one receive sequential metrics above the highest
//! explicit value.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use cidr::Ipv4Cidr;
use regex::Regex;
use thiserror::Error;

use crate::config::{RouteEntry, Settings};
use crate::prefix::{self, PrefixSource};
use crate::record::ARecord;
use crate::route::{Egress, Route};

/// Interface sentinel meaning "follow the host default route".
pub const DEFAULT_SENTINEL: &str = "_DEFAULT";

/// Metric handed to the first rule when no entry carries an explicit one.
const METRIC_AUTO_BASE: u32 = 100;

#[derive(Debug, Error)]
pub enum Error {
    #[error("route entry {0}: expected exactly one of `country`, `domain`, `net`")]
    Discriminant(usize),
    #[error("route entry {index}: invalid domain pattern `{pattern}`: {source}")]
    BadPattern {
        index: usize,
        pattern: String,
        source: regex::Error,
    },
    #[error("explicit metric {0} is used by more than one route entry")]
    MetricCollision(u32),
    #[error("interface `{0}` is not part of the captured interface table")]
    UnknownInterface(String),
    #[error(transparent)]
    Prefix(#[from] prefix::Error),
}

/// The host default route, captured once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRoute {
    pub oif: u32,
    pub gateway: Option<Ipv4Addr>,
    pub metric: u32,
}

/// Interface name to kernel index mapping plus the captured default route.
/// Built from the kernel once at startup and passed explicitly wherever
/// egress resolution happens.
#[derive(Debug, Clone)]
pub struct IfaceTable {
    links: HashMap<String, u32>,
    default_route: DefaultRoute,
}

impl IfaceTable {
    pub fn new(links: HashMap<String, u32>, default_route: DefaultRoute) -> Self {
        Self { links, default_route }
    }

    pub fn default_route(&self) -> DefaultRoute {
        self.default_route
    }

    pub fn egress(&self, name: &str) -> Result<Egress, Error> {
        if name == DEFAULT_SENTINEL {
            return Ok(Egress {
                name: DEFAULT_SENTINEL.to_string(),
                index: self.default_route.oif,
                gateway: self.default_route.gateway,
            });
        }
        self.links
            .get(name)
            .map(|&index| Egress {
                name: name.to_string(),
                index,
                gateway: None,
            })
            .ok_or_else(|| Error::UnknownInterface(name.to_string()))
    }
}

/// A literal CIDR with policy. An optional `ttl` is donated to domain hits
/// inside the range; the installed route itself stays permanent.
#[derive(Debug, Clone)]
pub struct NetRule {
    pub net: Ipv4Cidr,
    pub ttl: Option<u32>,
    pub route: Route,
}

impl NetRule {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(&addr)
    }
}

/// A country code, expanded through the prefix source at compile time.
#[derive(Debug, Clone)]
pub struct CountryRule {
    pub country: String,
    pub routes: Vec<Route>,
}

/// A pattern over record names, producing `/32` routes on demand.
#[derive(Debug, Clone)]
pub struct DomainRule {
    pub pattern: Regex,
    pub egress: Option<Egress>,
    pub metric: u32,
    pub weight: u32,
    pub ttl: Option<u32>,
}

impl DomainRule {
    /// Matches against both the answer name and the original query,
    /// anchored at the start of either.
    pub fn matches(&self, record: &ARecord) -> bool {
        self.pattern.is_match(&record.name) || self.pattern.is_match(&record.query)
    }

    pub fn build_route(&self, addr: Ipv4Addr) -> Route {
        Route::host(addr, self.egress.clone(), self.metric, self.weight, self.ttl)
    }
}

/// The compiled rule set, immutable for the process lifetime.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub nets: Vec<NetRule>,
    pub countries: Vec<CountryRule>,
    pub domains: Vec<DomainRule>,
}

impl RuleSet {
    /// Routes created at startup, in configuration order per kind.
    pub fn permanent_routes(&self) -> impl Iterator<Item = &Route> {
        self.countries
            .iter()
            .flat_map(|rule| rule.routes.iter())
            .chain(self.nets.iter().map(|rule| &rule.route))
    }

    /// The donated TTL of the first net rule containing `addr`.
    pub fn donor_ttl_for(&self, addr: Ipv4Addr) -> Option<u32> {
        self.nets
            .iter()
            .find(|rule| rule.contains(addr) && rule.ttl.is_some())
            .and_then(|rule| rule.ttl)
    }

    /// The matching domain rule of greatest weight; ties keep the first in
    /// configuration order.
    pub fn best_domain_match(&self, record: &ARecord) -> Option<&DomainRule> {
        let mut best: Option<&DomainRule> = None;
        for rule in &self.domains {
            if rule.matches(record) && best.is_none_or(|b| rule.weight > b.weight) {
                best = Some(rule);
            }
        }
        best
    }

    pub fn compile(
        settings: &Settings,
        source: &dyn PrefixSource,
        ifaces: &IfaceTable,
    ) -> Result<Self, Error> {
        let mut next_auto = check_explicit_metrics(&settings.routes)?;
        let mut set = RuleSet::default();

        for (index, entry) in settings.routes.iter().enumerate() {
            let kind = Kind::of(entry).ok_or(Error::Discriminant(index))?;
            let egress = entry
                .interface
                .as_deref()
                .map(|name| ifaces.egress(name))
                .transpose()?;
            let weight = entry.weight.unwrap_or(0);

            for value in kind.values(entry) {
                let metric = entry.metric.unwrap_or_else(|| {
                    let metric = next_auto;
                    next_auto += 1;
                    metric
                });
                match kind {
                    Kind::Net => {
                        let net = prefix::parse_net(&value)?;
                        set.nets.push(NetRule {
                            net,
                            ttl: entry.ttl,
                            route: Route::new(net, egress.clone(), metric, weight, None),
                        });
                    }
                    Kind::Country => {
                        let routes = source
                            .prefixes(&value)?
                            .into_iter()
                            .map(|net| Route::new(net, egress.clone(), metric, weight, None))
                            .collect();
                        set.countries.push(CountryRule {
                            country: value,
                            routes,
                        });
                    }
                    Kind::Domain => {
                        // Anchor at the start, like the resolver patterns
                        // have always been written for.
                        let pattern =
                            Regex::new(&format!("^(?:{value})")).map_err(|source| Error::BadPattern {
                                index,
                                pattern: value.clone(),
                                source,
                            })?;
                        set.domains.push(DomainRule {
                            pattern,
                            egress: egress.clone(),
                            metric,
                            weight,
                            ttl: entry.ttl.or(Some(settings.domain_route_ttl)),
                        });
                    }
                }
            }
        }
        Ok(set)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Country,
    Domain,
    Net,
}

impl Kind {
    fn of(entry: &RouteEntry) -> Option<Self> {
        match (&entry.country, &entry.domain, &entry.net) {
            (Some(_), None, None) => Some(Kind::Country),
            (None, Some(_), None) => Some(Kind::Domain),
            (None, None, Some(_)) => Some(Kind::Net),
            _ => None,
        }
    }

    fn values(self, entry: &RouteEntry) -> Vec<String> {
        let tag = match self {
            Kind::Country => &entry.country,
            Kind::Domain => &entry.domain,
            Kind::Net => &entry.net,
        };
        tag.clone().map(|v| v.into_vec()).unwrap_or_default()
    }
}

/// Rejects duplicated explicit metrics and returns the first free
/// auto-assignable metric.
fn check_explicit_metrics(entries: &[RouteEntry]) -> Result<u32, Error> {
    let mut seen = HashSet::new();
    for entry in entries {
        if let Some(metric) = entry.metric {
            if !seen.insert(metric) {
                return Err(Error::MetricCollision(metric));
            }
        }
    }
    Ok(seen.iter().max().map_or(METRIC_AUTO_BASE, |max| max + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefix::StaticPrefixes;
    use crate::record::ARecord;

    fn ifaces() -> IfaceTable {
        IfaceTable::new(
            HashMap::from([
                ("eth0".to_string(), 1),
                ("eth1".to_string(), 2),
                ("eth2".to_string(), 3),
            ]),
            DefaultRoute {
                oif: 1,
                gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
                metric: 0,
            },
        )
    }

    fn prefixes() -> StaticPrefixes {
        StaticPrefixes(HashMap::from([
            (
                "US".to_string(),
                vec!["192.0.2.0/24".parse().unwrap(), "198.51.100.0/24".parse().unwrap()],
            ),
            ("UK".to_string(), vec!["203.0.113.0/24".parse().unwrap()]),
        ]))
    }

    fn settings(yaml: &str) -> Settings {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn record(name: &str, addr: &str) -> ARecord {
        ARecord {
            name: name.to_string(),
            query: name.to_string(),
            addr: addr.parse().unwrap(),
            ttl: Some(30),
        }
    }

    #[test]
    fn compiles_all_three_kinds() {
        let settings = settings(
            r#"
routes:
  - country: US
    interface: eth0
    metric: 100
    weight: 10
  - domain: '.*\.example\.com'
    interface: eth2
    metric: 300
    weight: 50
  - net: 10.0.0.0/8
    interface: _DEFAULT
    metric: 400
    weight: 2
"#,
        );
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();

        assert_eq!(set.countries.len(), 1);
        assert_eq!(set.countries[0].routes.len(), 2);
        assert_eq!(set.countries[0].routes[0].weight, 10);

        assert_eq!(set.nets.len(), 1);
        let default_egress = set.nets[0].route.egress.as_ref().unwrap();
        assert_eq!(default_egress.name, DEFAULT_SENTINEL);
        assert_eq!(default_egress.index, 1);
        assert_eq!(default_egress.gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));

        assert_eq!(set.domains.len(), 1);
        assert_eq!(set.permanent_routes().count(), 3);
    }

    #[test]
    fn entry_must_carry_exactly_one_tag() {
        let none = settings("routes:\n  - interface: eth0\n");
        assert!(matches!(
            RuleSet::compile(&none, &prefixes(), &ifaces()),
            Err(Error::Discriminant(0))
        ));

        let both = settings("routes:\n  - net: 10.0.0.0/8\n    domain: '.*'\n");
        assert!(matches!(
            RuleSet::compile(&both, &prefixes(), &ifaces()),
            Err(Error::Discriminant(0))
        ));
    }

    #[test]
    fn explicit_metric_collision_fails() {
        let settings = settings(
            r#"
routes:
  - net: 10.0.0.0/8
    interface: eth0
    metric: 200
  - net: 172.16.0.0/12
    interface: eth1
    metric: 200
"#,
        );
        assert!(matches!(
            RuleSet::compile(&settings, &prefixes(), &ifaces()),
            Err(Error::MetricCollision(200))
        ));
    }

    #[test]
    fn metrics_assigned_above_highest_explicit() {
        let settings = settings(
            r#"
routes:
  - net: 10.0.0.0/8
    interface: eth0
    metric: 250
  - net: 172.16.0.0/12
    interface: eth1
  - domain: '.*'
    interface: eth2
"#,
        );
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();
        assert_eq!(set.nets[0].route.metric, 250);
        assert_eq!(set.nets[1].route.metric, 251);
        assert_eq!(set.domains[0].metric, 252);
    }

    #[test]
    fn list_tags_fan_out_inheriting_policy() {
        let settings = settings(
            r#"
routes:
  - domain:
      - '.*\.example\.com'
      - '.*\.example\.net'
    interface: eth2
    weight: 50
"#,
        );
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();
        assert_eq!(set.domains.len(), 2);
        assert!(set.domains.iter().all(|rule| rule.weight == 50));
        assert!(
            set.domains
                .iter()
                .all(|rule| rule.egress.as_ref().unwrap().name == "eth2")
        );
    }

    #[test]
    fn domain_rules_inherit_default_ttl() {
        let settings = settings(
            r#"
domain_route_ttl: 120
routes:
  - domain: '.*'
    interface: eth0
  - domain: 'cdn\..*'
    interface: eth1
    ttl: 15
"#,
        );
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();
        assert_eq!(set.domains[0].ttl, Some(120));
        assert_eq!(set.domains[1].ttl, Some(15));
    }

    #[test]
    fn unknown_interface_is_fatal() {
        let settings = settings("routes:\n  - net: 10.0.0.0/8\n    interface: wg7\n");
        assert!(matches!(
            RuleSet::compile(&settings, &prefixes(), &ifaces()),
            Err(Error::UnknownInterface(name)) if name == "wg7"
        ));
    }

    #[test]
    fn net_rule_without_interface_is_a_donor() {
        let settings = settings("routes:\n  - net: 100.64.0.0/10\n    ttl: 60\n");
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();
        assert!(set.nets[0].route.is_donor());
        assert_eq!(set.donor_ttl_for(Ipv4Addr::new(100, 64, 1, 1)), Some(60));
        assert_eq!(set.donor_ttl_for(Ipv4Addr::new(10, 0, 0, 1)), None);
    }

    #[test]
    fn donor_ttl_uses_first_matching_net_rule_with_ttl() {
        let settings = settings(
            r#"
routes:
  - net: 10.0.0.0/8
    interface: eth0
  - net: 10.1.0.0/16
    ttl: 45
  - net: 10.1.2.0/24
    ttl: 90
"#,
        );
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();
        // The /8 has no TTL and is skipped; the first rule with one wins.
        assert_eq!(set.donor_ttl_for(Ipv4Addr::new(10, 1, 2, 3)), Some(45));
    }

    #[test]
    fn best_domain_match_prefers_weight_then_config_order() {
        let settings = settings(
            r#"
routes:
  - domain: '.*\.example\.com'
    interface: eth0
    weight: 10
  - domain: 'us\..*'
    interface: eth1
    weight: 50
  - domain: '.*'
    interface: eth2
    weight: 50
"#,
        );
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();
        let best = set.best_domain_match(&record("us.example.com", "192.0.2.1")).unwrap();
        // eth1 and eth2 tie at 50; the earlier entry wins.
        assert_eq!(best.egress.as_ref().unwrap().name, "eth1");
    }

    #[test]
    fn patterns_are_anchored_at_the_start() {
        let settings = settings(
            "routes:\n  - domain: 'test\\.example\\.com'\n    interface: eth0\n",
        );
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();
        assert!(set.domains[0].matches(&record("test.example.com", "192.0.2.1")));
        assert!(!set.domains[0].matches(&record("smtest.example.com", "192.0.2.1")));
    }

    #[test]
    fn match_also_covers_the_query_name() {
        let settings = settings(
            "routes:\n  - domain: 'alias\\..*'\n    interface: eth0\n",
        );
        let set = RuleSet::compile(&settings, &prefixes(), &ifaces()).unwrap();
        let record = ARecord {
            name: "real.example.com".to_string(),
            query: "alias.example.com".to_string(),
            addr: Ipv4Addr::new(192, 0, 2, 1),
            ttl: None,
        };
        assert!(set.domains[0].matches(&record));
    }
}
