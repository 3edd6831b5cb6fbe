//! Runtime configuration, loaded once at startup from a YAML file.
//!
//! Rule entries are heterogeneous: exactly one of the `country`, `domain` or
//! `net` tags selects the rule kind, list-valued tags fan out into one rule
//! per element, and the remaining policy fields are shared by everything the
//! entry produces. Validation beyond the YAML shape happens during rule
//! compilation (see [`crate::rules`]).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const ENV_VAR: &str = "CONFIG";
pub const DEFAULT_PATH: &str = "settings.yaml";

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found: {0}")]
    NoFile(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Kernel routing table all installed routes go into.
    #[serde(default = "default_table")]
    pub table: u32,
    /// TCP port the resolver WebSocket listener binds.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// Firewall mark selecting the policy table.
    #[serde(default = "default_pbr_mark")]
    pub pbr_mark: u32,
    /// Interfaces the external firewall bootstrap marks traffic on.
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Purge conntrack entries for destinations touched by a batch flush.
    #[serde(default)]
    pub clean_conntrack: bool,
    /// Default TTL in seconds for domain-derived routes.
    #[serde(default = "default_domain_route_ttl")]
    pub domain_route_ttl: u32,
    /// Country prefix seed file, read only when country rules exist.
    #[serde(default = "default_country_prefixes")]
    pub country_prefixes: PathBuf,
    pub routes: Vec<RouteEntry>,
}

/// One raw rule entry, before compilation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteEntry {
    #[serde(default)]
    pub country: Option<OneOrMany<String>>,
    #[serde(default)]
    pub domain: Option<OneOrMany<String>>,
    #[serde(default)]
    pub net: Option<OneOrMany<String>>,
    /// Egress interface name, `_DEFAULT`, or omitted for a TTL donor.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub metric: Option<u32>,
    #[serde(default)]
    pub weight: Option<u32>,
    /// For net rules: TTL donated to domain hits inside the range.
    /// For domain rules: lifetime of the routes the rule produces.
    #[serde(default)]
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

fn default_table() -> u32 {
    200
}

fn default_ws_port() -> u16 {
    8765
}

fn default_pbr_mark() -> u32 {
    512
}

fn default_domain_route_ttl() -> u32 {
    300
}

fn default_country_prefixes() -> PathBuf {
    PathBuf::from("country_prefixes.yaml")
}

impl Settings {
    /// Distinct egress interface names the rule set references, excluding
    /// the `_DEFAULT` sentinel. These are resolved against the kernel once
    /// at startup.
    pub fn interface_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .iter()
            .filter_map(|entry| entry.interface.clone())
            .filter(|name| name != crate::rules::DEFAULT_SENTINEL)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn has_country_rules(&self) -> bool {
        self.routes.iter().any(|entry| entry.country.is_some())
    }
}

pub fn load(path: &Path) -> Result<Settings, Error> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile(path.to_path_buf())
        } else {
            Error::Io(e)
        }
    })?;
    Ok(serde_yaml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
routes:
  - net: 10.0.0.0/8
    interface: eth0
"#;

    #[test]
    fn applies_defaults() {
        let settings: Settings = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(settings.table, 200);
        assert_eq!(settings.ws_port, 8765);
        assert_eq!(settings.pbr_mark, 512);
        assert!(!settings.clean_conntrack);
        assert_eq!(settings.domain_route_ttl, 300);
        assert_eq!(settings.routes.len(), 1);
    }

    #[test]
    fn missing_routes_is_an_error() {
        assert!(serde_yaml::from_str::<Settings>("table: 100\n").is_err());
    }

    #[test]
    fn list_valued_tags_parse() {
        let raw = r#"
routes:
  - domain:
      - '.*\.example\.com'
      - 'cdn\.example\.net'
    interface: wg0
    weight: 50
"#;
        let settings: Settings = serde_yaml::from_str(raw).unwrap();
        let domains = settings.routes[0].domain.clone().unwrap().into_vec();
        assert_eq!(domains.len(), 2);
    }

    #[test]
    fn collects_distinct_interface_names() {
        let raw = r#"
routes:
  - net: 10.0.0.0/8
    interface: eth0
  - net: 172.16.0.0/12
    interface: eth0
  - domain: '.*'
    interface: _DEFAULT
  - net: 100.64.0.0/10
    ttl: 60
"#;
        let settings: Settings = serde_yaml::from_str(raw).unwrap();
        assert_eq!(settings.interface_names(), vec!["eth0".to_string()]);
        assert!(!settings.has_country_rules());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load(Path::new("/nonexistent/settings.yaml")).unwrap_err();
        assert!(matches!(err, Error::NoFile(_)));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let settings = load(&path).unwrap();
        assert_eq!(settings.routes.len(), 1);
    }
}
