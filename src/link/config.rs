//! Link configuration: server identity, bind addresses, and the ordered
//! list of peer link blocks.
//!
//! Loaded from a TOML file at startup and again on rehash; the whole link
//! list is swapped atomically so a half-read config is never observable.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Capability set announced in CAPAB. Both sides must announce exactly the
/// same set or the link is refused.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "ADDLINE", "FJOIN", "FMODE", "FTOPIC", "IDLE", "METADATA", "OPERTYPE", "SVSCMDS",
];

/// How often a quiet linked peer is pinged, and the grace before an
/// unanswered ping splits it.
pub const PING_INTERVAL_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("server_name must be set")]
    MissingServerName,
}

/// One `[[link]]` block: a peer this server may accept or dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkBlock {
    /// Peer server name; the index key for inbound matching.
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    /// Secret we present when dialing out to this peer.
    #[serde(default)]
    pub send_secret: String,
    /// Secret the peer must present when it connects to us.
    #[serde(default)]
    pub recv_secret: String,
    /// Seconds between automatic dial attempts; zero disables autoconnect.
    #[serde(default)]
    pub autoconnect_secs: u64,
    /// Optional symmetric key; when set, the link must be ciphered.
    #[serde(default)]
    pub cipher_key: Option<String>,
}

impl LinkBlock {
    /// A usable block names the peer, has both secrets, and a port.
    /// Mirrors the startup validation of the config reader: bad blocks are
    /// logged and skipped rather than taking the daemon down.
    fn check(&self) -> Result<(), &'static str> {
        if self.name.is_empty() {
            return Err("link block without a name");
        }
        if self.recv_secret.is_empty() {
            return Err("recv_secret not defined");
        }
        if self.send_secret.is_empty() {
            return Err("send_secret not defined");
        }
        if self.port == 0 {
            return Err("no port specified");
        }
        Ok(())
    }

    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// The daemon's link-layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Our server name, unique network-wide.
    #[serde(default)]
    pub server_name: String,
    #[serde(default = "default_description")]
    pub description: String,
    /// Addresses to accept server links on.
    #[serde(default = "default_binds")]
    pub binds: Vec<String>,
    /// Capability set override; defaults to [`DEFAULT_CAPABILITIES`].
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Ordered peer list.
    #[serde(default, rename = "link")]
    pub links: Vec<LinkBlock>,
}

fn default_description() -> String {
    "tarn server".to_owned()
}

fn default_binds() -> Vec<String> {
    vec!["127.0.0.1:7000".to_owned()]
}

impl LinkConfig {
    /// Load and validate a config file. Invalid link blocks are dropped
    /// with a warning; an unusable identity is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: LinkConfig =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.server_name.is_empty() {
            return Err(ConfigError::MissingServerName);
        }
        self.links.retain(|block| match block.check() {
            Ok(()) => true,
            Err(why) => {
                warn!(link = %block.name, "invalid link block dropped: {why}");
                false
            }
        });
        Ok(())
    }

    /// Sorted, comma-joined capability string for CAPAB. Exact equality of
    /// this string is required on both sides of a link.
    pub fn capab_string(&self) -> String {
        let mut caps: Vec<&str> = if self.capabilities.is_empty() {
            DEFAULT_CAPABILITIES.to_vec()
        } else {
            self.capabilities.iter().map(String::as_str).collect()
        };
        caps.sort_unstable();
        caps.join(",")
    }

    /// Find a link block by peer name.
    pub fn find_link(&self, name: &str) -> Option<&LinkBlock> {
        self.links
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> LinkConfig {
        let mut config: LinkConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn minimal_config() {
        let config = parse(r#"server_name = "alpha.tarn.test""#);
        assert_eq!(config.server_name, "alpha.tarn.test");
        assert_eq!(config.binds, vec!["127.0.0.1:7000"]);
        assert!(config.links.is_empty());
    }

    #[test]
    fn full_link_block() {
        let config = parse(
            r#"
            server_name = "alpha.tarn.test"
            description = "hub"
            binds = ["0.0.0.0:7000", "[::1]:7000"]

            [[link]]
            name = "beta.tarn.test"
            address = "10.0.0.2"
            port = 7000
            send_secret = "outward"
            recv_secret = "inward"
            autoconnect_secs = 120
            cipher_key = "0123456789abcdef"
            "#,
        );
        assert_eq!(config.links.len(), 1);
        let link = &config.links[0];
        assert_eq!(link.dial_addr(), "10.0.0.2:7000");
        assert_eq!(link.autoconnect_secs, 120);
        assert_eq!(link.cipher_key.as_deref(), Some("0123456789abcdef"));
    }

    #[test]
    fn invalid_blocks_are_dropped_not_fatal() {
        let config = parse(
            r#"
            server_name = "alpha.tarn.test"

            [[link]]
            name = "nosecret.tarn.test"
            address = "10.0.0.2"
            port = 7000
            send_secret = "outward"

            [[link]]
            name = "noport.tarn.test"
            address = "10.0.0.3"
            send_secret = "outward"
            recv_secret = "inward"

            [[link]]
            name = "good.tarn.test"
            address = "10.0.0.4"
            port = 7000
            send_secret = "outward"
            recv_secret = "inward"
            "#,
        );
        assert_eq!(config.links.len(), 1);
        assert_eq!(config.links[0].name, "good.tarn.test");
    }

    #[test]
    fn missing_server_name_is_fatal() {
        let mut config: LinkConfig = toml::from_str(r#"description = "x""#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingServerName)
        ));
    }

    #[test]
    fn capab_string_is_sorted_and_stable() {
        let config = parse(r#"server_name = "alpha.tarn.test""#);
        let caps = config.capab_string();
        assert_eq!(caps, config.capab_string());
        let mut sorted: Vec<&str> = caps.split(',').collect();
        let original = sorted.clone();
        sorted.sort_unstable();
        assert_eq!(original, sorted);
    }

    #[test]
    fn find_link_is_case_insensitive() {
        let config = parse(
            r#"
            server_name = "alpha.tarn.test"

            [[link]]
            name = "beta.tarn.test"
            address = "10.0.0.2"
            port = 7000
            send_secret = "o"
            recv_secret = "i"
            "#,
        );
        assert!(config.find_link("BETA.TARN.TEST").is_some());
        assert!(config.find_link("gamma.tarn.test").is_none());
    }
}
