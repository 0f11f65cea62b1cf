//! devmaster-worker: forked per-event by the daemon. Builds a device view
//! from its inherited environment, resolves a name via the rule matcher,
//! applies the result to `/dev`, and updates the persisted record.
use std::path::PathBuf;

use devmaster::config::DaemonConfig;
use devmaster::node_applier::{self, NodeOps, RealNodeOps};
use devmaster::record_store::{Record, RecordStore};
use devmaster::rules::{self, ProgramRunner, Resolution, ShellRunner};
use devmaster::ruleset;
use libdevice::{RealSysfs, SysfsProvider};

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn main() {
    let subsystem = std::env::args().nth(1).unwrap_or_default();
    libutils::logging::init(libutils::logging::level_from_str(
        &env_var("UDEV_LOG").unwrap_or_else(|| "info".to_string()),
    ));

    let config = DaemonConfig::load(None);

    let devpath = match env_var("DEVPATH") {
        Some(d) => d,
        None => {
            log::error!("worker: missing DEVPATH in environment, exiting");
            std::process::exit(1);
        }
    };
    let action = env_var("ACTION").unwrap_or_else(|| "add".to_string());
    let major: Option<u64> = env_var("MAJOR").and_then(|v| v.parse().ok());
    let minor: Option<u64> = env_var("MINOR").and_then(|v| v.parse().ok());

    let syspath = format!("/sys{devpath}");
    let sysfs = RealSysfs;
    let device = match sysfs.load(&syspath) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("worker: failed to load device view for {syspath}: {e}");
            std::process::exit(0);
        }
    };

    let store = RecordStore::new(&config.record_store_path);
    let (rules, permissions) = match ruleset::load_dir(&config.rules_dir) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("worker: failed to load rules from {:?}: {e}", config.rules_dir);
            (Vec::new(), Vec::new())
        }
    };
    let runner: Box<dyn ProgramRunner> = Box::new(ShellRunner);

    if action == "remove" {
        handle_remove(&store, &device.devpath, &devpath);
        return;
    }

    match rules::resolve(&rules, &device, major, minor, runner.as_ref(), &store, &permissions) {
        Resolution::Suppressed => {
            log::debug!("worker: device {} suppressed by rule", devpath);
        }
        Resolution::Named(resolved) => {
            let ops = RealNodeOps::new();
            if let Err(e) = node_applier::apply(
                &ops,
                &ops.dev_root,
                &resolved,
                &subsystem,
                major.zip(minor),
                &device.kernel,
                &device.syspath,
            ) {
                log::error!("worker: failed to apply device {devpath}: {e}");
            }

            let record = Record {
                devpath: devpath.clone(),
                name: resolved.name.clone(),
                symlinks: resolved.symlinks.clone(),
                devnum: major.zip(minor),
                partitions: resolved.partitions,
                ignore_remove: false,
                env: Vec::new(),
            };
            if !record.is_trivial(&device.kernel) {
                if let Err(e) = store.put(&record) {
                    log::error!("worker: failed to persist record for {devpath}: {e}");
                }
            }
        }
    }
}

fn handle_remove(store: &RecordStore, devpath: &str, fallback_devpath: &str) {
    let record = store.get(devpath).ok().flatten();
    let (name, ignore_remove) = match &record {
        Some(r) => (r.name.clone(), r.ignore_remove),
        None => (
            PathBuf::from(fallback_devpath)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string(),
            false,
        ),
    };

    if ignore_remove {
        log::debug!("worker: ignoring remove for {devpath} per persisted record");
        return;
    }

    let ops = RealNodeOps::new();
    let path = ops.dev_root.join(&name);
    if let Err(e) = ops.unlink(&path) {
        log::warn!("worker: failed to remove node {path:?}: {e}");
    }
    if let Some(record) = &record {
        for link in &record.symlinks {
            let _ = ops.unlink(&ops.dev_root.join(link));
        }
    }
    let _ = store.delete(devpath);
}
