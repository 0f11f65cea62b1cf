//! sysfs traversal: the external collaborator the core treats as an
//! abstract query interface (spec §1, "Out of scope").
//!
//! [`RealSysfs`] is a minimal real implementation so the daemon has
//! something to run against; its canonicalize-the-subsystem-symlink
//! approach follows the same pattern sysMaster's `libdevice::Device`
//! uses to resolve a device's subsystem and bus.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::device::Device;

/// builds a [`Device`] view, including its ancestor chain, from a syspath.
pub trait SysfsProvider {
    /// load the device at `syspath`, with `parent` populated by walking
    /// ancestors until none remain.
    fn load(&self, syspath: &str) -> std::io::Result<Device>;
}

/// reads directly from a mounted sysfs, rooted normally at `/sys`.
#[derive(Debug, Clone, Default)]
pub struct RealSysfs;

impl RealSysfs {
    fn subsystem_of(&self, syspath: &Path) -> (String, bool) {
        let link = syspath.join("subsystem");
        match fs::canonicalize(&link) {
            Ok(target) => match target.file_name().and_then(|n| n.to_str()) {
                Some(name) => (name.to_string(), true),
                None => (String::new(), false),
            },
            Err(_) => (String::new(), false),
        }
    }

    fn bus_of(&self, subsystem: &str, has_sysfs_device: bool) -> String {
        if !has_sysfs_device {
            return String::new();
        }
        // for bus-enumerated devices the subsystem name doubles as the bus
        // name (e.g. "usb", "pci", "scsi"); class-only devices (block, net,
        // tty, ...) have no independent bus identity.
        match subsystem {
            "block" | "net" | "tty" | "input" | "misc" => String::new(),
            other => other.to_string(),
        }
    }

    fn read_sysattrs(&self, syspath: &Path) -> HashMap<String, String> {
        let mut out = HashMap::new();
        let entries = match fs::read_dir(syspath) {
            Ok(e) => e,
            Err(_) => return out,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Ok(contents) = fs::read_to_string(&path) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    out.insert(name.to_string(), contents.trim_end().to_string());
                }
            }
        }
        out
    }

    fn load_node(&self, syspath: &Path, depth: u32) -> std::io::Result<Device> {
        let syspath_str = syspath
            .to_str()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 path"))?
            .to_string();
        let devpath = syspath_str
            .strip_prefix("/sys")
            .unwrap_or(&syspath_str)
            .to_string();
        let kernel = syspath
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let (subsystem, has_sysfs_device) = self.subsystem_of(syspath);
        let bus = self.bus_of(&subsystem, has_sysfs_device);
        let bus_id = kernel.clone();
        let sysattrs = self.read_sysattrs(syspath);

        // stop walking once we leave /sys/devices or hit the configured recursion cap
        let parent = if depth < 64 {
            syspath
                .parent()
                .filter(|p| p.starts_with("/sys/devices"))
                .and_then(|p| self.load_node(p, depth + 1).ok())
                .map(Box::new)
        } else {
            None
        };

        Ok(Device {
            bus,
            kernel,
            subsystem,
            bus_id,
            syspath: syspath_str,
            devpath,
            has_sysfs_device,
            sysattrs,
            parent,
        })
    }
}

impl SysfsProvider for RealSysfs {
    fn load(&self, syspath: &str) -> std::io::Result<Device> {
        let path = PathBuf::from(syspath);
        self.load_node(&path, 0)
    }
}

/// an in-memory sysfs tree for tests: maps syspath -> device, with `parent`
/// links already resolved at construction time.
#[derive(Debug, Clone, Default)]
pub struct FakeSysfs {
    nodes: HashMap<String, Device>,
}

impl FakeSysfs {
    /// start building an empty fake tree
    pub fn new() -> FakeSysfs {
        FakeSysfs {
            nodes: HashMap::new(),
        }
    }

    /// insert a device at `syspath`, linking it to its already-inserted parent
    pub fn insert(&mut self, syspath: &str, mut device: Device, parent_syspath: Option<&str>) {
        device.syspath = syspath.to_string();
        if let Some(pp) = parent_syspath {
            device.parent = self.nodes.get(pp).cloned().map(Box::new);
        }
        self.nodes.insert(syspath.to_string(), device);
    }
}

impl SysfsProvider for FakeSysfs {
    fn load(&self, syspath: &str) -> std::io::Result<Device> {
        self.nodes.get(syspath).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such fake device")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_sysfs_links_parent() {
        let mut fake = FakeSysfs::new();
        let mut usb = Device::named("usb1");
        usb.bus = "usb".to_string();
        usb.has_sysfs_device = true;
        fake.insert("/sys/devices/usb1", usb, None);

        let mut sda = Device::named("sda");
        sda.subsystem = "block".to_string();
        fake.insert("/sys/devices/usb1/sda", sda, Some("/sys/devices/usb1"));

        let loaded = fake.load("/sys/devices/usb1/sda").unwrap();
        assert_eq!(loaded.parent().unwrap().bus, "usb");
    }
}
