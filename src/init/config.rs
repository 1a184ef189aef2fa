use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

pub static CONFIG: OnceCell<GlobalConfig> = OnceCell::const_new();

static CONFIG_PATH: &str = "config/config.toml";

#[derive(Serialize, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Root of the content-addressed store.
    #[serde(default = "default_store")]
    pub store: PathBuf,
    /// Parent of the per-request sandbox directories.
    #[serde(default = "default_temp")]
    pub temp: PathBuf,
    /// Maximum concurrent executions; 0 means one per hardware thread.
    #[serde(default)]
    pub num_cores: usize,
    #[serde(default = "default_log")]
    pub log_level: usize,
}

fn default_store() -> PathBuf {
    PathBuf::from("store")
}

fn default_temp() -> PathBuf {
    PathBuf::from("temp")
}

fn default_log() -> usize {
    2
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            temp: default_temp(),
            num_cores: 0,
            log_level: default_log(),
        }
    }
}

pub async fn init() {
    if CONFIG.get().is_some() {
        return;
    }
    let config = match tokio::fs::read_to_string(CONFIG_PATH).await {
        Ok(raw) => match toml::from_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("unable to parse {}: {}, using defaults", CONFIG_PATH, err);
                GlobalConfig::default()
            }
        },
        Err(_) => GlobalConfig::default(),
    };
    CONFIG.set(config).ok();
}

#[cfg(test)]
mod test {
    use super::{init, CONFIG};

    #[tokio::test]
    async fn defaults_load() {
        init().await;
        let config = CONFIG.get().unwrap();
        assert_eq!(config.num_cores, 0);
    }
}
