//! Settings in `$AUGUSTCTL_HOME/config.json`

use std::path::{Path, PathBuf};
use std::time::Duration;

use augustctl_lock::{LockConfig, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory, set AUGUSTCTL_HOME")]
    NoHome,
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Key(#[from] ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// 32 hex digits, as provisioned in the phone app
    pub offline_key: String,
    /// Slot of the offline key on the lock
    pub offline_key_offset: u8,
    /// Only connect to the lock with this address
    pub lock_address: Option<String>,
    pub http_addr: String,
    pub base_url: String,
    pub alexa_url: String,
    /// Everlock seconds used by `/everlock` and the relock timer
    pub autolock_time: u16,
    /// Everlock seconds when a command leaves the duration out
    pub everlock_default: u16,
    /// 0 waits forever
    pub exchange_timeout_secs: u64,
    pub scan_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            offline_key: "0123456789abcdef0123456789abcdef".to_string(),
            offline_key_offset: 1,
            lock_address: None,
            http_addr: "0.0.0.0:8080".to_string(),
            base_url: "/august/control".to_string(),
            alexa_url: "/august/alexa".to_string(),
            autolock_time: 60,
            everlock_default: 30,
            exchange_timeout_secs: 10,
            scan_timeout_secs: 30,
        }
    }
}

/// `$AUGUSTCTL_HOME`, else `~/.augustctl`, created if missing
pub fn augustctl_home(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    let home = match explicit.or_else(|| std::env::var_os("AUGUSTCTL_HOME").map(PathBuf::from)) {
        Some(home) => home,
        None => dirs::home_dir().ok_or(ConfigError::NoHome)?.join(".augustctl"),
    };
    if !home.exists() {
        std::fs::create_dir_all(&home).map_err(|source| ConfigError::CreateDir {
            path: home.clone(),
            source,
        })?;
    }
    Ok(home)
}

impl Config {
    /// Reads `config.json` from `home`, writing the defaults there first if
    /// the file does not exist.
    pub fn load_or_create(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join("config.json");
        if path.exists() {
            let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            return serde_json::from_str(&data).map_err(|source| ConfigError::Parse { path, source });
        }

        let config = Config::default();
        let data = serde_json::to_string_pretty(&config).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, data).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), "wrote default config, edit offline_key before use");
        Ok(config)
    }

    pub fn exchange_timeout(&self) -> Option<Duration> {
        (self.exchange_timeout_secs > 0).then(|| Duration::from_secs(self.exchange_timeout_secs))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn lock_config(&self) -> Result<LockConfig, ConfigError> {
        Ok(LockConfig::from_hex(&self.offline_key, self.offline_key_offset)?
            .with_exchange_timeout(self.exchange_timeout())
            .with_everlock_default(self.everlock_default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_home(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("augustctl-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn first_run_writes_defaults() {
        let home = scratch_home("defaults");
        let config = Config::load_or_create(&home).unwrap();
        assert_eq!(config, Config::default());
        assert!(home.join("config.json").exists());

        // second run reads what the first one wrote
        assert_eq!(Config::load_or_create(&home).unwrap(), config);
        std::fs::remove_dir_all(home).unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let home = scratch_home("partial");
        std::fs::write(
            home.join("config.json"),
            r#"{"offline_key": "ffeeddccbbaa99887766554433221100", "autolock_time": 90}"#,
        )
        .unwrap();
        let config = Config::load_or_create(&home).unwrap();
        assert_eq!(config.autolock_time, 90);
        assert_eq!(config.base_url, "/august/control");

        let lock = config.lock_config().unwrap();
        assert_eq!(lock.offline_key[0], 0xff);
        assert_eq!(lock.offline_key_index, 1);
        assert_eq!(lock.exchange_timeout, Some(Duration::from_secs(10)));
        std::fs::remove_dir_all(home).unwrap();
    }

    #[test]
    fn broken_file_is_an_error() {
        let home = scratch_home("broken");
        std::fs::write(home.join("config.json"), "{not json").unwrap();
        assert!(matches!(
            Config::load_or_create(&home),
            Err(ConfigError::Parse { .. })
        ));
        std::fs::remove_dir_all(home).unwrap();
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let config = Config {
            exchange_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.exchange_timeout(), None);
    }

    #[test]
    fn bad_key_is_reported() {
        let config = Config {
            offline_key: "abc".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.lock_config(),
            Err(ConfigError::Key(ProtocolError::InvalidKey { .. }))
        ));
    }
}
