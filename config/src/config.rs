use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{fs, path::Path, path::PathBuf};

/// A peer node and the bearer token to present to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub wallet_path: String,
    pub data_dir: String,
    pub listen_addr: String,
    /// `mainnet` or `regtest`.
    pub network: String,
    pub peers: Vec<PeerConfig>,
    /// Bearer token -> role name (`reader`, `transactor`, `miller`, `admin`).
    pub api_tokens: HashMap<String, String>,
    pub mine: bool,
    pub peer_timeout_secs: u64,
    pub sync_interval_secs: u64,
}

impl Config {
    fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.into_owned())
    }

    fn base_dir() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        // Use a Windows-friendly folder when building on Windows to avoid tilde expansion issues.
        if cfg!(target_os = "windows") {
            return dirs::data_dir().unwrap_or(home).join("cancelchain");
        }
        home.join(".cancelchain")
    }

    fn default_wallet_path() -> String {
        Self::base_dir()
            .join("wallet.json")
            .to_string_lossy()
            .into_owned()
    }

    fn default_data_dir() -> String {
        Self::base_dir().join("data").to_string_lossy().into_owned()
    }

    pub fn default_path() -> PathBuf {
        Self::base_dir().join("config.json")
    }

    /// Wallet path with tilde expansion applied.
    pub fn wallet_path_resolved(&self) -> PathBuf {
        Self::expand_path(&self.wallet_path)
    }

    /// Data directory with tilde expansion applied.
    pub fn data_dir_resolved(&self) -> PathBuf {
        Self::expand_path(&self.data_dir)
    }

    /// Read `path`, writing the defaults there first when it does not exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!(
                "Configuration file not found, creating defaults at {}",
                path.display()
            );
            let cfg = Self::default();
            cfg.save_to(path)?;
            return Ok(cfg);
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("configuration file format error in {}", path.display()))
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Update one scalar setting from its string form. Does not save.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "wallet_path" => self.wallet_path = value.to_string(),
            "data_dir" => self.data_dir = value.to_string(),
            "listen_addr" => self.listen_addr = value.to_string(),
            "network" => match value {
                "mainnet" | "regtest" => self.network = value.to_string(),
                other => bail!("unknown network {:?}", other),
            },
            "mine" => {
                self.mine = value
                    .parse()
                    .with_context(|| format!("mine must be true or false, got {:?}", value))?
            }
            "peer_timeout_secs" => {
                self.peer_timeout_secs = value
                    .parse()
                    .with_context(|| format!("peer_timeout_secs must be a number, got {:?}", value))?
            }
            "sync_interval_secs" => {
                self.sync_interval_secs = value
                    .parse()
                    .with_context(|| format!("sync_interval_secs must be a number, got {:?}", value))?
            }
            _ => bail!("unknown configuration key: {}", key),
        }
        Ok(())
    }

    pub fn view(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wallet_path: Self::default_wallet_path(),
            data_dir: Self::default_data_dir(),
            listen_addr: "127.0.0.1:8080".to_string(),
            network: "mainnet".to_string(),
            peers: Vec::new(),
            api_tokens: HashMap::new(),
            mine: false,
            peer_timeout_secs: 10,
            sync_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg, Config::default());
        assert_eq!(Config::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn set_value_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = Config::load_from(&path).unwrap();
        cfg.set_value("network", "regtest").unwrap();
        cfg.set_value("mine", "true").unwrap();
        cfg.set_value("peer_timeout_secs", "3").unwrap();
        cfg.save_to(&path).unwrap();

        let reread = Config::load_from(&path).unwrap();
        assert_eq!(reread.network, "regtest");
        assert!(reread.mine);
        assert_eq!(reread.peer_timeout_secs, 3);

        assert!(cfg.set_value("network", "moon").is_err());
        assert!(cfg.set_value("mine", "sometimes").is_err());
        assert!(cfg.set_value("nonsense", "1").is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"network":"regtest","peers":[{"url":"http://10.0.0.2:8080","token":"t0k"}],
                "api_tokens":{"secret":"miller"}}"#,
        )
        .unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.network, "regtest");
        assert_eq!(cfg.peers[0].token.as_deref(), Some("t0k"));
        assert_eq!(cfg.api_tokens["secret"], "miller");
        assert_eq!(cfg.sync_interval_secs, 30);
    }

    #[test]
    fn tilde_paths_expand() {
        let cfg = Config {
            wallet_path: "~/w.json".into(),
            ..Config::default()
        };
        assert!(!cfg.wallet_path_resolved().to_string_lossy().starts_with('~'));
    }
}
