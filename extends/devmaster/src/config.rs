//! daemon configuration: environment tunables layered over an optional
//! TOML file, per spec §6 ("Environment tunables").
use std::path::PathBuf;

use confique::Config;

/// resolved daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub expected_seqnum: u64,
    pub event_timeout: u64,
    pub max_childs: u32,
    pub max_childs_running: u32,
    pub udev_bin: String,
    pub record_store_path: PathBuf,
    pub rules_dir: PathBuf,
    pub debug: bool,
}

/// the TOML-layerable half of [`DaemonConfig`]; environment variables still
/// take precedence where set, matching the original daemon's env-first
/// tunables.
#[derive(Debug, Config)]
pub struct FileConfig {
    #[config(default = 0)]
    pub expected_seqnum: u64,
    #[config(default = 30)]
    pub event_timeout: u64,
    #[config(default = 8)]
    pub max_childs: u32,
    #[config(default = 8)]
    pub max_childs_running: u32,
    #[config(default = "/sbin/devmaster-worker")]
    pub udev_bin: String,
    #[config(default = "/run/devmaster/data")]
    pub record_store_path: String,
    #[config(default = "/etc/devmaster/rules.d")]
    pub rules_dir: String,
    #[config(default = false)]
    pub debug: bool,
}

impl DaemonConfig {
    /// load a `FileConfig` from `path` (if it exists) and overlay any of
    /// `UDEVD_EXPECTED_SEQNUM`, `UDEVD_EVENT_TIMEOUT`, `UDEVD_MAX_CHILDS`,
    /// `UDEVD_MAX_CHILDS_RUNNING`, `UDEV_BIN`, `DEBUG` found in the process
    /// environment.
    pub fn load(path: Option<&std::path::Path>) -> DaemonConfig {
        let file = match path {
            Some(path) if path.exists() => FileConfig::builder().file(path).load().unwrap_or_else(|e| {
                log::warn!("config: failed to load {path:?}: {e}, using defaults");
                FileConfig::builder().load().expect("builtin defaults must parse")
            }),
            _ => FileConfig::builder().load().expect("builtin defaults must parse"),
        };

        DaemonConfig {
            expected_seqnum: env_u64("UDEVD_EXPECTED_SEQNUM").unwrap_or(file.expected_seqnum),
            event_timeout: env_u64("UDEVD_EVENT_TIMEOUT").unwrap_or(file.event_timeout),
            max_childs: env_u32("UDEVD_MAX_CHILDS").unwrap_or(file.max_childs),
            max_childs_running: env_u32("UDEVD_MAX_CHILDS_RUNNING").unwrap_or(file.max_childs_running),
            udev_bin: std::env::var("UDEV_BIN").unwrap_or(file.udev_bin),
            record_store_path: PathBuf::from(file.record_store_path),
            rules_dir: PathBuf::from(file.rules_dir),
            debug: std::env::var("DEBUG").map(|v| v != "0").unwrap_or(file.debug),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_builtin_defaults_when_no_file() {
        let config = DaemonConfig::load(None);
        assert_eq!(config.max_childs, 8);
        assert_eq!(config.udev_bin, "/sbin/devmaster-worker");
    }
}
