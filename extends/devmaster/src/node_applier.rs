//! node applier (spec module F): turns a [`crate::rules::ResolvedDevice`]
//! into real device nodes, partitions and symlinks under `/dev`, or a
//! network interface rename.
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::rules::ResolvedDevice;

/// the kind of node to create
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// `mknod` with `S_IFBLK`
    Block,
    /// `mknod` with `S_IFCHR`
    Char,
}

/// everything devmaster needs from the filesystem to apply a resolved
/// device. Abstracted so node-applier logic (path math, collision
/// decisions) is testable without root or a real `/dev`.
pub trait NodeOps {
    /// `Some((is_block, rdev))` if a node already exists at `path`
    fn node_exists(&self, path: &Path) -> Option<(bool, u64)>;
    /// create a device node
    fn mknod(&self, path: &Path, kind: NodeKind, devnum: u64) -> Result<(), Error>;
    /// remove a path (node or symlink), ignoring "not found"
    fn unlink(&self, path: &Path) -> Result<(), Error>;
    /// change mode bits
    fn chmod(&self, path: &Path, mode: u32) -> Result<(), Error>;
    /// change owner/group by name; `None` leaves that half unchanged
    fn chown(&self, path: &Path, owner: Option<&str>, group: Option<&str>) -> Result<(), Error>;
    /// create a symlink at `link` pointing at `target`
    fn symlink(&self, target: &Path, link: &Path) -> Result<(), Error>;
    /// rename a network interface
    fn rename_interface(&self, old_name: &str, new_name: &str) -> Result<(), Error>;
    /// value of the `range` sysfs attribute at `syspath`, if present,
    /// capping how many partition nodes get created
    fn partition_range(&self, syspath: &str) -> Option<u32>;
}

/// real syscalls against an actual `/dev` and kernel
pub struct RealNodeOps {
    /// root directory node paths are created under, normally `/dev`
    pub dev_root: PathBuf,
}

impl RealNodeOps {
    /// a `RealNodeOps` rooted at `/dev`
    pub fn new() -> RealNodeOps {
        RealNodeOps {
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl Default for RealNodeOps {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeOps for RealNodeOps {
    fn node_exists(&self, path: &Path) -> Option<(bool, u64)> {
        use nix::sys::stat::{stat, SFlag};
        let st = stat(path).ok()?;
        let mode = SFlag::from_bits_truncate(st.st_mode);
        if mode.contains(SFlag::S_IFBLK) {
            Some((true, st.st_rdev))
        } else if mode.contains(SFlag::S_IFCHR) {
            Some((false, st.st_rdev))
        } else {
            None
        }
    }

    fn mknod(&self, path: &Path, kind: NodeKind, devnum: u64) -> Result<(), Error> {
        use nix::sys::stat::{mknod, Mode, SFlag};
        let kind_flag = match kind {
            NodeKind::Block => SFlag::S_IFBLK,
            NodeKind::Char => SFlag::S_IFCHR,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Apply {
                msg: format!("failed to create parent dir for {path:?}: {e}"),
            })?;
        }
        mknod(path, kind_flag, Mode::from_bits_truncate(0o600), devnum).map_err(|e| Error::Apply {
            msg: format!("mknod {path:?} failed: {e}"),
        })
    }

    fn unlink(&self, path: &Path) -> Result<(), Error> {
        match std::fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Apply {
                msg: format!("unlink {path:?} failed: {e}"),
            }),
        }
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<(), Error> {
        use nix::sys::stat::Mode;
        nix::sys::stat::fchmodat(
            None,
            path,
            Mode::from_bits_truncate(mode),
            nix::sys::stat::FchmodatFlags::FollowSymlink,
        )
        .map_err(|e| Error::Apply {
            msg: format!("chmod {path:?} failed: {e}"),
        })
    }

    fn chown(&self, path: &Path, owner: Option<&str>, group: Option<&str>) -> Result<(), Error> {
        use nix::unistd::{Gid, Uid};
        let uid = owner.and_then(resolve_uid).map(Uid::from_raw);
        let gid = group.and_then(resolve_gid).map(Gid::from_raw);
        nix::unistd::chown(path, uid, gid).map_err(|e| Error::Apply {
            msg: format!("chown {path:?} failed: {e}"),
        })
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<(), Error> {
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Apply {
                msg: format!("failed to create parent dir for {link:?}: {e}"),
            })?;
        }
        std::os::unix::fs::symlink(target, link).map_err(|e| Error::Apply {
            msg: format!("symlink {link:?} -> {target:?} failed: {e}"),
        })
    }

    fn rename_interface(&self, old_name: &str, new_name: &str) -> Result<(), Error> {
        rename_netif(old_name, new_name)
    }

    fn partition_range(&self, syspath: &str) -> Option<u32> {
        let text = std::fs::read_to_string(format!("{syspath}/range")).ok()?;
        text.trim().parse().ok()
    }
}

/// looks up a uid by name via `/etc/passwd`, the same mechanism `getpwnam`
/// would use, without bringing in a whole nss-glue crate for one lookup.
fn resolve_uid(name: &str) -> Option<u32> {
    if let Ok(raw) = name.parse::<u32>() {
        return Some(raw);
    }
    passwd_lookup(name, "/etc/passwd", 2)
}

fn resolve_gid(name: &str) -> Option<u32> {
    if let Ok(raw) = name.parse::<u32>() {
        return Some(raw);
    }
    passwd_lookup(name, "/etc/group", 2)
}

fn passwd_lookup(name: &str, path: &str, id_field: usize) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.first() == Some(&name) {
            return fields.get(id_field)?.parse().ok();
        }
    }
    None
}

/// issues `SIOCSIFNAME` over a throwaway `AF_INET` socket, the standard way
/// to ask the kernel to rename a network interface without netlink.
fn rename_netif(old_name: &str, new_name: &str) -> Result<(), Error> {
    #[repr(C)]
    struct IfReqName {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_newname: [libc::c_char; libc::IFNAMSIZ],
    }

    fn cstr_into(buf: &mut [libc::c_char; libc::IFNAMSIZ], s: &str) -> Result<(), Error> {
        let bytes = s.as_bytes();
        if bytes.len() >= buf.len() {
            return Err(Error::Apply {
                msg: format!("interface name '{s}' too long"),
            });
        }
        for (i, b) in bytes.iter().enumerate() {
            buf[i] = *b as libc::c_char;
        }
        Ok(())
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(Error::Apply {
            msg: format!("socket(AF_INET) failed: {}", std::io::Error::last_os_error()),
        });
    }

    let mut req: IfReqName = unsafe { std::mem::zeroed() };
    cstr_into(&mut req.ifr_name, old_name)?;
    cstr_into(&mut req.ifr_newname, new_name)?;

    let ret = unsafe { libc::ioctl(fd, libc::SIOCSIFNAME, &mut req as *mut IfReqName) };
    let err = std::io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    if ret < 0 {
        return Err(Error::Apply {
            msg: format!("SIOCSIFNAME {old_name} -> {new_name} failed: {err}"),
        });
    }
    Ok(())
}

/// compute the symlink target relative to the symlink's own directory:
/// shortest shared prefix, dot-dot-hop up, then the name suffix.
pub fn relative_symlink_target(link_path: &Path, target_path: &Path) -> PathBuf {
    let link_dir = link_path.parent().unwrap_or_else(|| Path::new(""));
    pathdiff::diff_paths(target_path, link_dir).unwrap_or_else(|| target_path.to_path_buf())
}

/// apply a resolved device: create/reuse the node, chmod/chown it, create
/// partitions and symlinks, or rename a network interface.
pub fn apply(
    ops: &dyn NodeOps,
    dev_root: &Path,
    resolved: &ResolvedDevice,
    subsystem: &str,
    devnum: Option<(u64, u64)>,
    kernel_name: &str,
    syspath: &str,
) -> Result<(), Error> {
    if subsystem == "net" {
        if resolved.name != kernel_name {
            ops.rename_interface(kernel_name, &resolved.name)?;
        }
        return Ok(());
    }

    let node_path = dev_root.join(&resolved.name);
    let is_block = subsystem == "block";
    let rdev = devnum.map(|(maj, min)| nix::sys::stat::makedev(maj, min));

    if let Some(rdev) = rdev {
        match ops.node_exists(&node_path) {
            Some((existing_is_block, existing_rdev))
                if existing_is_block == is_block && existing_rdev == rdev =>
            {
                // identical node already present: leave it, just reapply perms
            }
            Some(_) => {
                ops.unlink(&node_path)?;
                ops.mknod(
                    &node_path,
                    if is_block { NodeKind::Block } else { NodeKind::Char },
                    rdev,
                )?;
            }
            None => {
                ops.mknod(
                    &node_path,
                    if is_block { NodeKind::Block } else { NodeKind::Char },
                    rdev,
                )?;
            }
        }

        ops.chmod(&node_path, resolved.mode)?;
        if resolved.owner != "root" || resolved.group != "root" {
            ops.chown(&node_path, Some(&resolved.owner), Some(&resolved.group))?;
        }

        if resolved.partitions > 0 {
            let (maj, min) = devnum.unwrap();
            let cap = ops.partition_range(syspath).unwrap_or(resolved.partitions);
            let n = resolved.partitions.min(cap);
            for i in 1..=n {
                let part_path = dev_root.join(format!("{}{}", resolved.name, i));
                let part_rdev = nix::sys::stat::makedev(maj, min + i as u64);
                ops.mknod(&part_path, NodeKind::Block, part_rdev)?;
                ops.chmod(&part_path, resolved.mode)?;
            }
        }
    }

    for link_name in &resolved.symlinks {
        let link_path = dev_root.join(link_name);
        let target = relative_symlink_target(&link_path, &node_path);
        ops.unlink(&link_path)?;
        ops.symlink(&target, &link_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeNodeOps {
        existing: RefCell<HashMap<PathBuf, (bool, u64)>>,
        mknod_calls: RefCell<Vec<(PathBuf, NodeKind, u64)>>,
        symlink_calls: RefCell<Vec<(PathBuf, PathBuf)>>,
        renames: RefCell<Vec<(String, String)>>,
        range: Cell<Option<u32>>,
    }

    impl NodeOps for FakeNodeOps {
        fn node_exists(&self, path: &Path) -> Option<(bool, u64)> {
            self.existing.borrow().get(path).copied()
        }
        fn mknod(&self, path: &Path, kind: NodeKind, devnum: u64) -> Result<(), Error> {
            self.mknod_calls.borrow_mut().push((path.to_path_buf(), kind, devnum));
            self.existing
                .borrow_mut()
                .insert(path.to_path_buf(), (kind == NodeKind::Block, devnum));
            Ok(())
        }
        fn unlink(&self, path: &Path) -> Result<(), Error> {
            self.existing.borrow_mut().remove(path);
            Ok(())
        }
        fn chmod(&self, _path: &Path, _mode: u32) -> Result<(), Error> {
            Ok(())
        }
        fn chown(&self, _path: &Path, _owner: Option<&str>, _group: Option<&str>) -> Result<(), Error> {
            Ok(())
        }
        fn symlink(&self, target: &Path, link: &Path) -> Result<(), Error> {
            self.symlink_calls.borrow_mut().push((link.to_path_buf(), target.to_path_buf()));
            Ok(())
        }
        fn rename_interface(&self, old_name: &str, new_name: &str) -> Result<(), Error> {
            self.renames.borrow_mut().push((old_name.to_string(), new_name.to_string()));
            Ok(())
        }
        fn partition_range(&self, _syspath: &str) -> Option<u32> {
            self.range.get()
        }
    }

    #[test]
    fn creates_fresh_node_when_absent() {
        let ops = FakeNodeOps::default();
        let resolved = ResolvedDevice {
            name: "sda".to_string(),
            ..Default::default()
        };
        apply(&ops, Path::new("/dev"), &resolved, "block", Some((8, 0)), "sda", "/sys/block/sda").unwrap();
        assert_eq!(ops.mknod_calls.borrow().len(), 1);
        assert_eq!(ops.mknod_calls.borrow()[0].0, PathBuf::from("/dev/sda"));
    }

    #[test]
    fn preserves_identical_existing_node() {
        let ops = FakeNodeOps::default();
        ops.existing.borrow_mut().insert(PathBuf::from("/dev/sda"), (true, nix::sys::stat::makedev(8, 0)));
        let resolved = ResolvedDevice {
            name: "sda".to_string(),
            ..Default::default()
        };
        apply(&ops, Path::new("/dev"), &resolved, "block", Some((8, 0)), "sda", "/sys/block/sda").unwrap();
        assert!(ops.mknod_calls.borrow().is_empty());
    }

    #[test]
    fn replaces_mismatched_existing_node() {
        let ops = FakeNodeOps::default();
        ops.existing.borrow_mut().insert(PathBuf::from("/dev/sda"), (true, nix::sys::stat::makedev(8, 16)));
        let resolved = ResolvedDevice {
            name: "sda".to_string(),
            ..Default::default()
        };
        apply(&ops, Path::new("/dev"), &resolved, "block", Some((8, 0)), "sda", "/sys/block/sda").unwrap();
        assert_eq!(ops.mknod_calls.borrow().len(), 1);
    }

    #[test]
    fn creates_partitions_with_minor_offsets() {
        let ops = FakeNodeOps::default();
        let resolved = ResolvedDevice {
            name: "sda".to_string(),
            partitions: 2,
            ..Default::default()
        };
        apply(&ops, Path::new("/dev"), &resolved, "block", Some((8, 0)), "sda", "/sys/block/sda").unwrap();
        let calls = ops.mknod_calls.borrow();
        // one for the device itself, two for partitions
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].0, PathBuf::from("/dev/sda1"));
        assert_eq!(calls[2].0, PathBuf::from("/dev/sda2"));
    }

    #[test]
    fn partition_count_is_capped_by_sysfs_range() {
        let ops = FakeNodeOps::default();
        ops.range.set(Some(1));
        let resolved = ResolvedDevice {
            name: "sda".to_string(),
            partitions: 4,
            ..Default::default()
        };
        apply(&ops, Path::new("/dev"), &resolved, "block", Some((8, 0)), "sda", "/sys/block/sda").unwrap();
        let calls = ops.mknod_calls.borrow();
        // one for the device itself, one for the single partition the range attribute allows
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, PathBuf::from("/dev/sda1"));
    }

    #[test]
    fn symlinks_use_relative_paths() {
        let ops = FakeNodeOps::default();
        let resolved = ResolvedDevice {
            name: "sda".to_string(),
            symlinks: vec!["disk/by-id/foo".to_string()],
            ..Default::default()
        };
        apply(&ops, Path::new("/dev"), &resolved, "block", Some((8, 0)), "sda", "/sys/block/sda").unwrap();
        let calls = ops.symlink_calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, PathBuf::from("../../sda"));
    }

    #[test]
    fn net_interface_rename_instead_of_node() {
        let ops = FakeNodeOps::default();
        let resolved = ResolvedDevice {
            name: "wan0".to_string(),
            ..Default::default()
        };
        apply(&ops, Path::new("/dev"), &resolved, "net", None, "eth0", "/sys/class/net/eth0").unwrap();
        assert_eq!(ops.renames.borrow()[0], ("eth0".to_string(), "wan0".to_string()));
        assert!(ops.mknod_calls.borrow().is_empty());
    }
}
