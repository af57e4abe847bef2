//! Engine configuration
//!
//! Plain records handed to [`crate::engine::Engine`] at construction. File
//! loading and parsing belong to the embedding service; nothing in here is
//! global state.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::driver::Consistency;
use crate::error::{Result, SedimentError};

/// Credentials for the cluster connection (consumed by the driver)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// One storage group: a replication name shared by a set of domains.
///
/// Domains are literal strings, or regular expressions when wrapped in
/// slashes (`"/\\.wikipedia\\.org$/"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageGroupConfig {
    pub name: String,
    pub domains: Vec<String>,
}

/// Process-wide engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub default_consistency: Consistency,
    #[serde(default)]
    pub storage_groups: Vec<StorageGroupConfig>,
    /// Datacenter names used for replication placement
    #[serde(default = "default_datacenters")]
    pub datacenters: Vec<String>,
    /// Replication-configuration version; bump to roll out new placement
    #[serde(default = "default_config_version")]
    pub version: u32,
    /// How many superseded revisions each background update examines
    #[serde(default = "default_revision_scan_limit")]
    pub revision_scan_limit: i32,
}

fn default_hosts() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_port() -> u16 {
    9042
}

fn default_datacenters() -> Vec<String> {
    vec!["datacenter1".to_string()]
}

fn default_config_version() -> u32 {
    1
}

fn default_revision_scan_limit() -> i32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            port: default_port(),
            credentials: None,
            default_consistency: Consistency::default(),
            storage_groups: Vec::new(),
            datacenters: default_datacenters(),
            version: default_config_version(),
            revision_scan_limit: default_revision_scan_limit(),
        }
    }
}

#[derive(Debug, Clone)]
enum DomainPattern {
    Literal(String),
    Pattern(Regex),
}

/// A storage group with its domain patterns compiled
#[derive(Debug, Clone)]
pub struct StorageGroup {
    pub name: String,
    patterns: Vec<DomainPattern>,
}

impl StorageGroup {
    pub fn compile(config: &StorageGroupConfig) -> Result<Self> {
        let mut patterns = Vec::with_capacity(config.domains.len());
        for domain in &config.domains {
            if let Some(inner) = domain.strip_prefix('/').and_then(|d| d.strip_suffix('/')) {
                let re = Regex::new(inner).map_err(|e| {
                    SedimentError::Validation(format!(
                        "Invalid domain pattern in storage group {}: {}",
                        config.name, e
                    ))
                })?;
                patterns.push(DomainPattern::Pattern(re));
            } else {
                patterns.push(DomainPattern::Literal(domain.clone()));
            }
        }
        Ok(Self {
            name: config.name.clone(),
            patterns,
        })
    }

    pub fn matches(&self, domain: &str) -> bool {
        self.patterns.iter().any(|p| match p {
            DomainPattern::Literal(d) => d == domain,
            DomainPattern::Pattern(re) => re.is_match(domain),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_domains_match_exactly() {
        let group = StorageGroup::compile(&StorageGroupConfig {
            name: "wikipedia".to_string(),
            domains: vec!["en.wikipedia.org".to_string()],
        })
        .unwrap();
        assert!(group.matches("en.wikipedia.org"));
        assert!(!group.matches("de.wikipedia.org"));
    }

    #[test]
    fn slash_wrapped_domains_are_patterns() {
        let group = StorageGroup::compile(&StorageGroupConfig {
            name: "wikipedia".to_string(),
            domains: vec![r"/\.wikipedia\.org$/".to_string()],
        })
        .unwrap();
        assert!(group.matches("en.wikipedia.org"));
        assert!(group.matches("de.wikipedia.org"));
        assert!(!group.matches("wikidata.org"));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let res = StorageGroup::compile(&StorageGroupConfig {
            name: "broken".to_string(),
            domains: vec!["/([/".to_string()],
        });
        assert!(res.is_err());
    }

    #[test]
    fn config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.port, 9042);
        assert_eq!(config.datacenters, vec!["datacenter1".to_string()]);
        assert_eq!(config.revision_scan_limit, 3);
    }
}
