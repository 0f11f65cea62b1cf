// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
//
// sysMaster is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! struct Device
//!
//! A fully materialized view of one device and its sysfs ancestor chain, as
//! handed to the rule matcher (see `extends/devmaster::rules`). Building this
//! tree from a real `/sys` hierarchy is the job of [`crate::provider`]; this
//! struct itself performs no I/O so the matching logic can be exercised
//! against hand-built fixtures.
use std::collections::HashMap;

/// one node in a device's class/sysfs ancestor chain
#[derive(Debug, Clone, Default)]
pub struct Device {
    /// bus type, e.g. "usb", "pci", "scsi"; empty if this node has no sysfs device
    pub bus: String,
    /// the class device name, e.g. "sda", "sda1", "eth0"
    pub kernel: String,
    /// subsystem, e.g. "block", "net", "tty"
    pub subsystem: String,
    /// last path component of the sysfs device path (the `id` predicate target)
    pub bus_id: String,
    /// full sysfs path of this node, e.g. "/sys/devices/pci0000:00/.../block/sda"
    pub syspath: String,
    /// devpath relative to /sys, e.g. "/devices/pci0000:00/.../block/sda"
    pub devpath: String,
    /// whether this class device has a backing sysfs device at all.
    /// `false` means bus/bus_id/place-dependent predicates can never match here.
    pub has_sysfs_device: bool,
    /// attribute key/value pairs visible at this node (already read by the provider)
    pub sysattrs: HashMap<String, String>,
    /// the parent sysfs device, if any
    pub parent: Option<Box<Device>>,
}

impl Device {
    /// a bare device with only a kernel name set; useful in tests
    pub fn named(kernel: &str) -> Device {
        Device {
            kernel: kernel.to_string(),
            ..Default::default()
        }
    }

    /// trailing digit run of the kernel name, e.g. "sda1" -> Some("1"), "sda" -> None.
    /// Used for `%n` expansion and for the whole-block-device check on `partitions`.
    pub fn kernel_number(&self) -> Option<&str> {
        let bytes = self.kernel.as_bytes();
        let mut i = bytes.len();
        while i > 0 && bytes[i - 1].is_ascii_digit() {
            i -= 1;
        }
        if i == bytes.len() {
            None
        } else {
            Some(&self.kernel[i..])
        }
    }

    /// true if this device is itself a partition (has a non-empty kernel number)
    pub fn is_partition(&self) -> bool {
        self.kernel_number().is_some()
    }

    /// last two path components of `syspath`, joined by '/'; target of the `place` predicate
    pub fn place(&self) -> String {
        let parts: Vec<&str> = self.syspath.trim_end_matches('/').rsplitn(3, '/').collect();
        match parts.len() {
            0 => String::new(),
            1 => parts[0].to_string(),
            _ => format!("{}/{}", parts[1], parts[0]),
        }
    }

    /// attribute lookup: bare key/value pairs already snapshotted onto this node
    pub fn sysattr(&self, name: &str) -> Option<&str> {
        self.sysattrs.get(name).map(|s| s.as_str())
    }

    /// the parent sysfs device, if any
    pub fn parent(&self) -> Option<&Device> {
        self.parent.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_number_extracts_trailing_digits() {
        assert_eq!(Device::named("sda1").kernel_number(), Some("1"));
        assert_eq!(Device::named("sda").kernel_number(), None);
        assert_eq!(Device::named("mmcblk0p12").kernel_number(), Some("12"));
    }

    #[test]
    fn is_partition_follows_kernel_number() {
        assert!(Device::named("sda1").is_partition());
        assert!(!Device::named("sda").is_partition());
    }

    #[test]
    fn place_takes_last_two_components() {
        let mut d = Device::named("sda");
        d.syspath = "/sys/devices/pci0000:00/0000:00:10.0/host2/target2:0:1/2:0:1:0/block/sda"
            .to_string();
        assert_eq!(d.place(), "block/sda");
    }
}
