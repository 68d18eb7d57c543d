//! `tunmux.yml` configuration file
//!
//! Lists the forwards `tunmux up` runs over one shared tunnel.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tunmux_proto::Address;

pub const DEFAULT_CONFIG_FILE: &str = "tunmux.yml";

/// Kind of logical connection a forward opens on the remote side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ForwardKind {
    #[default]
    Tcp,
    Tls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunmuxConfig {
    /// Address of the tunnel server
    pub tunnel: String,

    /// Timeout for opening the physical connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

fn default_connect_timeout() -> u64 {
    10
}

/// One local listener forwarded to a target behind the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    pub name: String,

    /// Local address to accept connections on
    pub listen: String,

    /// `host:port` as resolved by the tunnel server
    pub target: String,

    #[serde(default)]
    pub kind: ForwardKind,
}

impl ForwardConfig {
    pub fn target_address(&self) -> Result<Address> {
        self.target
            .parse()
            .with_context(|| format!("Invalid target for forward '{}'", self.name))
    }
}

impl TunmuxConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: TunmuxConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.tunnel.trim().is_empty() {
            bail!("'tunnel' must not be empty");
        }
        if self.forwards.is_empty() {
            bail!("No forwards configured");
        }

        let mut names = HashSet::new();
        for forward in &self.forwards {
            if !names.insert(forward.name.as_str()) {
                bail!("Duplicate forward name '{}'", forward.name);
            }
            forward.target_address()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
tunnel: proxy.example.com:6000
connect_timeout_secs: 5
forwards:
  - name: db
    listen: 127.0.0.1:5432
    target: db.internal:5432
  - name: api
    listen: 127.0.0.1:8443
    target: api.internal:443
    kind: tls
"#;

    #[test]
    fn test_parse_sample() {
        let config = TunmuxConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.tunnel, "proxy.example.com:6000");
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.forwards.len(), 2);
        assert_eq!(config.forwards[0].kind, ForwardKind::Tcp);
        assert_eq!(config.forwards[1].kind, ForwardKind::Tls);
        assert_eq!(
            config.forwards[1].target_address().unwrap(),
            Address::new("api.internal", 443)
        );
    }

    #[test]
    fn test_default_timeout() {
        let config = TunmuxConfig::parse(
            "tunnel: t:1\nforwards:\n  - {name: a, listen: '127.0.0.1:1', target: 'b:2'}\n",
        )
        .unwrap();
        assert_eq!(config.connect_timeout_secs, 10);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let yaml = "tunnel: t:1\nforwards:\n  - {name: a, listen: '127.0.0.1:1', target: 'b:2', kind: raw}\n";
        assert!(TunmuxConfig::parse(yaml).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = "tunnel: t:1\nforwards:\n  - {name: a, listen: '127.0.0.1:1', target: 'b:2'}\n  - {name: a, listen: '127.0.0.1:3', target: 'b:4'}\n";
        let err = TunmuxConfig::parse(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("Duplicate"));
    }

    #[test]
    fn test_target_without_port_rejected() {
        let yaml = "tunnel: t:1\nforwards:\n  - {name: a, listen: '127.0.0.1:1', target: 'b'}\n";
        let err = TunmuxConfig::parse(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("forward 'a'"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = TunmuxConfig::load(file.path()).unwrap();
        assert_eq!(config.forwards[0].name, "db");
    }

    #[test]
    fn test_load_missing_file() {
        let err = TunmuxConfig::load(Path::new("/nonexistent/tunmux.yml")).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
