//! Configuration Vault – reads/writes `~/.warden/config.toml`.
//!
//! The file holds a single `[safety]` table mirroring
//! [`SafetyConfig`]; missing keys take their defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use warden_types::{ConfigUpdate, SafetyConfig};

/// Persisted user configuration stored in `~/.warden/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub safety: SafetyConfig,
}

/// Return the path to `~/.warden/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".warden").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path, apply `WARDEN_*` overrides and
/// replace any out-of-range value with its default.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    cfg.safety = cfg.safety.sanitized();
    Ok(Some(cfg))
}

/// Apply `WARDEN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `WARDEN_COLLISION_THRESHOLD_CM` | `safety.collision_threshold_cm` |
/// | `WARDEN_CLIENT_TIMEOUT_S` | `safety.client_timeout_s` |
/// | `WARDEN_POLL_INTERVAL_MS` | `safety.poll_interval_ms` |
///
/// `WARDEN_LOG_FORMAT` is read by the tracing setup, not here.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.  Values that
/// fail to parse or validate are logged and ignored.
pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("WARDEN_COLLISION_THRESHOLD_CM") {
        override_with(cfg, "WARDEN_COLLISION_THRESHOLD_CM", &v, ConfigUpdate::CollisionThresholdCm);
    }
    if let Some(v) = lookup("WARDEN_CLIENT_TIMEOUT_S") {
        override_with(cfg, "WARDEN_CLIENT_TIMEOUT_S", &v, ConfigUpdate::ClientTimeoutS);
    }
    if let Some(v) = lookup("WARDEN_POLL_INTERVAL_MS") {
        override_with(cfg, "WARDEN_POLL_INTERVAL_MS", &v, ConfigUpdate::PollIntervalMs);
    }
}

fn override_with<T: std::str::FromStr>(
    cfg: &mut Config,
    var: &str,
    raw: &str,
    update: impl FnOnce(T) -> ConfigUpdate,
) {
    match raw.trim().parse::<T>() {
        Ok(value) => {
            if cfg.safety.apply(update(value)).is_err() {
                warn!(var, value = raw, "ignoring out-of-range override");
            }
        }
        Err(_) => warn!(var, value = raw, "ignoring unparsable override"),
    }
}

/// Save the config to disk, creating `~/.warden/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");
        let raw = std::fs::read_to_string(&path).expect("read back");
        assert!(raw.contains("[safety]"));

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.safety.collision_threshold_cm, 20.0);
        assert_eq!(loaded.safety.client_timeout_s, 3.0);
        assert_eq!(loaded.safety.edge_threshold, 200);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[safety]\nmax_speed = 60.0\nturn_in_place = true\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.safety.max_speed, 60.0);
        assert!(loaded.safety.turn_in_place);
        assert_eq!(loaded.safety.backup_power, SafetyConfig::default().backup_power);
    }

    #[test]
    fn invalid_values_are_sanitized_on_load() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[safety]\ncollision_threshold_cm = -5.0\nacceleration_factor = 3.0\nlow_battery_pct = 15.0\n",
        )
        .unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        let defaults = SafetyConfig::default();
        assert_eq!(loaded.safety.collision_threshold_cm, defaults.collision_threshold_cm);
        assert_eq!(loaded.safety.acceleration_factor, defaults.acceleration_factor);
        assert_eq!(loaded.safety.low_battery_pct, 15.0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[safety\nmax_speed = ").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_warden_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".warden"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn overrides_replace_fields() {
        let mut cfg = Config::default();
        apply_overrides_from(
            &mut cfg,
            lookup(&[
                ("WARDEN_COLLISION_THRESHOLD_CM", "25"),
                ("WARDEN_CLIENT_TIMEOUT_S", " 1.5 "),
                ("WARDEN_POLL_INTERVAL_MS", "20"),
            ]),
        );
        assert_eq!(cfg.safety.collision_threshold_cm, 25.0);
        assert_eq!(cfg.safety.client_timeout_s, 1.5);
        assert_eq!(cfg.safety.poll_interval_ms, 20);
    }

    #[test]
    fn overrides_ignore_garbage_and_out_of_range() {
        let mut cfg = Config::default();
        apply_overrides_from(
            &mut cfg,
            lookup(&[
                ("WARDEN_COLLISION_THRESHOLD_CM", "near"),
                ("WARDEN_CLIENT_TIMEOUT_S", "-2"),
                ("WARDEN_POLL_INTERVAL_MS", "0"),
            ]),
        );
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn apply_env_overrides_reads_process_env() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("WARDEN_POLL_INTERVAL_MS", "25") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        unsafe { std::env::remove_var("WARDEN_POLL_INTERVAL_MS") };
        assert_eq!(cfg.safety.poll_interval_ms, 25);
    }
}
