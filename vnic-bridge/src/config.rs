use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use vnic_core::control::BridgeConfig;
use vnic_core::frame::ETHERMAX;
use vnic_core::MacAddr;

const CONFIG_FILE_NAME: &str = "vnic-bridge.toml";

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("org", "vnic", "vnic-bridge")
        .context("could not determine platform config directory")?;
    Ok(proj.config_dir().join(CONFIG_FILE_NAME))
}

/// Settings given on the command line for a single run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub hub: Option<String>,
    pub port: Option<u16>,
    pub instance: Option<u32>,
    pub mac: Option<MacAddr>,
}

impl RunOverrides {
    pub fn apply(self, cfg: &mut BridgeConfig) {
        if let Some(hub) = self.hub {
            cfg.hub_addr = hub;
        }
        if let Some(port) = self.port {
            cfg.hub_port = port;
        }
        if let Some(instance) = self.instance {
            cfg.instance = instance;
        }
        if self.mac.is_some() {
            cfg.mac = self.mac;
        }
    }
}

/// Reject settings the relay cannot run with
pub fn validate(cfg: &BridgeConfig) -> Result<()> {
    if cfg.hub_addr.trim().is_empty() {
        anyhow::bail!("hub_addr is empty");
    }
    if cfg.hub_port == 0 {
        anyhow::bail!("hub_port must be nonzero");
    }
    if cfg.flush_interval.is_zero() || cfg.health_interval.is_zero() {
        anyhow::bail!("flush_interval and health_interval must be nonzero");
    }
    if cfg.sendbuf_threshold < ETHERMAX {
        anyhow::bail!(
            "sendbuf_threshold {} is below one full frame ({ETHERMAX} bytes)",
            cfg.sendbuf_threshold
        );
    }
    if let Some(mac) = cfg.mac {
        if mac.is_multicast() {
            anyhow::bail!("instance address {mac} is a group address");
        }
    }
    Ok(())
}

/// Load the config at `path`, falling back to defaults if it does not exist
pub fn load(path: &Path) -> Result<BridgeConfig> {
    let cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?
    } else {
        BridgeConfig::default()
    };
    validate(&cfg).with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &BridgeConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("vnic-bridge-test-{}-{}", std::process::id(), name))
            .join(CONFIG_FILE_NAME)
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = load(&scratch_path("missing")).expect("load");
        assert_eq!(cfg, BridgeConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let path = scratch_path("save");
        let cfg = BridgeConfig {
            hub_addr: "192.0.2.7".to_string(),
            hub_port: 5500,
            mac: Some(MacAddr::new([0x02, 0, 0x5e, 0, 0, 7])),
            flush_interval: Duration::from_millis(250),
            ..BridgeConfig::default()
        };
        save(&path, &cfg, true).expect("save");
        assert_eq!(load(&path).expect("load"), cfg);

        // refuses to clobber without force
        assert!(save(&path, &BridgeConfig::default(), false).is_err());

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_load_rejects_unusable_settings() {
        let path = scratch_path("invalid");
        let dir = path.parent().expect("scratch dir");
        fs::create_dir_all(dir).expect("mkdir");
        fs::write(
            &path,
            "hub_addr = \"hub\"\nflush_interval = \"0s\"\nhealth_interval = \"5s\"\n",
        )
        .expect("write");

        let err = load(&path).expect_err("zero flush interval accepted");
        assert!(format!("{err:#}").contains("must be nonzero"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_validate() {
        assert!(validate(&BridgeConfig::default()).is_ok());

        let group = BridgeConfig {
            mac: Some(MacAddr::BROADCAST),
            ..BridgeConfig::default()
        };
        assert!(validate(&group).is_err());

        let small = BridgeConfig {
            sendbuf_threshold: 100,
            ..BridgeConfig::default()
        };
        assert!(validate(&small).is_err());
    }

    #[test]
    fn test_overrides_only_replace_given_fields() {
        let mut cfg = BridgeConfig::default();
        RunOverrides {
            port: Some(9000),
            mac: Some(MacAddr::new([0x02, 1, 2, 3, 4, 5])),
            ..RunOverrides::default()
        }
        .apply(&mut cfg);

        assert_eq!(cfg.hub_addr, "127.0.0.1");
        assert_eq!(cfg.hub_port, 9000);
        assert_eq!(cfg.instance, 0);
        assert_eq!(cfg.mac, Some(MacAddr::new([0x02, 1, 2, 3, 4, 5])));
    }
}
