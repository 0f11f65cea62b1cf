//! Rule matcher (module C) and name resolver (module D).
//!
//! A [`Rule`] is evaluated against a [`libdevice::Device`] ancestor chain:
//! `kernel` is bound once to the original class device; `bus`, `subsystem`,
//! `id`, `place` and `sysfs_pair` predicates are sysfs-derived and, on
//! failure, cause the matcher to retry the whole rule one level up the
//! parent chain (spec §4.C, §9 open question). `program`/`result` run only
//! once the pattern predicates at the winning level have passed.
use std::collections::HashMap;

use libdevice::Device;

use crate::error::Error;
use crate::format::{self, ExpandContext};
use crate::record_store::RecordStore;

/// one already-parsed rule; parsing rule *files* is out of scope (spec §1).
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// predicate: device's bus type, e.g. "usb"
    pub bus: Option<String>,
    /// predicate: class device name
    pub kernel: Option<String>,
    /// predicate: subsystem
    pub subsystem: Option<String>,
    /// predicate: last path component of the sysfs device
    pub id: Option<String>,
    /// predicate: substring match against last two syspath components
    pub place: Option<String>,
    /// predicate: attribute key -> value pattern, all must match
    pub sysfs_pairs: Vec<(String, String)>,
    /// predicate: a command (format-expanded); stdout becomes `program_result`
    pub program: Option<String>,
    /// predicate: pattern matched against `program_result`
    pub result: Option<String>,

    /// action: device node name (may be explicitly empty -> suppress)
    pub name: Option<String>,
    /// action: space-separated symlink names (format-expanded)
    pub symlink: Option<String>,
    /// action: owner
    pub owner: Option<String>,
    /// action: group
    pub group: Option<String>,
    /// action: mode
    pub mode: Option<u32>,
    /// action: create N sibling partition nodes if > 0
    pub partitions: u32,

    /// diagnostics: rule file this came from
    pub source_file: String,
    /// diagnostics: line within that file
    pub source_line: u32,
}

/// runs a rule's `program` predicate. Abstracted so the matcher is
/// testable without spawning real processes.
pub trait ProgramRunner {
    /// run `cmdline`, returning its stdout with at most one trailing
    /// newline stripped. An `Err` is a non-match, never a hard failure
    /// (spec §7: `RULE_EVAL_ERROR`).
    fn run(&self, cmdline: &str) -> Result<String, Error>;
}

/// shells out via `/bin/sh -c`, matching the original `run_program` helper.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ProgramRunner for ShellRunner {
    fn run(&self, cmdline: &str) -> Result<String, Error> {
        let output = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(cmdline)
            .output()
            .map_err(|e| Error::RuleEval {
                msg: format!("failed to spawn '{cmdline}': {e}"),
            })?;

        if !output.status.success() {
            return Err(Error::RuleEval {
                msg: format!("'{cmdline}' exited with {}", output.status),
            });
        }

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.ends_with('\n') {
            stdout.pop();
        }
        Ok(stdout)
    }
}

/// a permission-table entry consulted after rule application (spec §3).
#[derive(Debug, Clone)]
pub struct PermissionEntry {
    /// glob pattern matched against the final device name
    pub name_pattern: String,
    /// owner
    pub owner: String,
    /// group
    pub group: String,
    /// mode
    pub mode: u32,
}

/// final resolved device, or the suppression sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// the device should not get a node (matched rule had empty name and symlink)
    Suppressed,
    /// the resolved name/symlinks/permissions to apply
    Named(ResolvedDevice),
}

/// the output of the name resolver, ready for the node applier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    /// final device node name
    pub name: String,
    /// accumulated, already format-expanded symlink targets
    pub symlinks: Vec<String>,
    /// final owner
    pub owner: String,
    /// final group
    pub group: String,
    /// final mode
    pub mode: u32,
    /// sibling partitions to create, if any
    pub partitions: u32,
}

impl Default for ResolvedDevice {
    fn default() -> Self {
        ResolvedDevice {
            name: String::new(),
            symlinks: Vec::new(),
            owner: "root".to_string(),
            group: "root".to_string(),
            mode: 0o600,
            partitions: 0,
        }
    }
}

/// format-expansion context bound to one rule evaluation: class-device
/// fields (`%k`, `%n`) always come from the original device; sysfs-bound
/// fields (`%b`, `%s{attr}`) come from wherever the walk matched.
struct EvalCtx<'a> {
    original: &'a Device,
    matched: &'a Device,
    major: Option<u64>,
    minor: Option<u64>,
    program_result: Option<&'a str>,
    store: &'a RecordStore,
}

impl<'a> ExpandContext for EvalCtx<'a> {
    fn bus_id(&self) -> &str {
        &self.matched.bus_id
    }
    fn kernel(&self) -> &str {
        &self.original.kernel
    }
    fn kernel_number(&self) -> Option<&str> {
        self.original.kernel_number()
    }
    fn minor(&self) -> Option<u64> {
        self.minor
    }
    fn major(&self) -> Option<u64> {
        self.major
    }
    fn program_result(&self) -> Option<&str> {
        self.program_result
    }
    fn sysattr(&self, name: &str) -> Option<String> {
        self.matched
            .sysattr(name)
            .map(|v| v.trim_end().trim_end_matches('\n').to_string())
    }
    fn name_taken(&self, candidate: &str) -> bool {
        self.store.find_by_name(candidate).is_some()
    }
}

fn sysfs_pair_matches(device: &Device, key: &str, pattern: &str) -> bool {
    let raw = device.sysattr(key).unwrap_or("");
    let value = if pattern.ends_with(char::is_whitespace) {
        raw
    } else {
        raw.trim_end()
    };
    crate::pattern::matches(pattern, value)
}

/// try every level of the ancestor chain starting at `original`, returning
/// the device node the rule matched against and the captured program
/// result, or `None` if the rule does not apply anywhere in the chain.
fn match_rule<'a>(
    rule: &Rule,
    original: &'a Device,
    major: Option<u64>,
    minor: Option<u64>,
    runner: &dyn ProgramRunner,
    store: &RecordStore,
) -> Option<(&'a Device, Option<String>)> {
    if let Some(kernel_pattern) = &rule.kernel {
        if !crate::pattern::matches(kernel_pattern, &original.kernel) {
            return None;
        }
    }

    let mut current = original;
    loop {
        let sysfs_ok = rule
            .bus
            .as_ref()
            .map(|p| crate::pattern::matches(p, &current.bus))
            .unwrap_or(true)
            && rule
                .subsystem
                .as_ref()
                .map(|p| crate::pattern::matches(p, &current.subsystem))
                .unwrap_or(true)
            && rule
                .id
                .as_ref()
                .map(|p| crate::pattern::matches(p, &current.bus_id))
                .unwrap_or(true)
            && rule
                .place
                .as_ref()
                .map(|p| current.place().contains(p.as_str()))
                .unwrap_or(true)
            && rule
                .sysfs_pairs
                .iter()
                .all(|(key, pattern)| sysfs_pair_matches(current, key, pattern));

        if !sysfs_ok {
            match current.parent() {
                Some(parent) => {
                    current = parent;
                    continue;
                }
                None => return None,
            }
        }

        // sysfs-derived predicates passed at this level: evaluate program/result.
        let program_result = match &rule.program {
            None => None,
            Some(template) => {
                let ctx = EvalCtx {
                    original,
                    matched: current,
                    major,
                    minor,
                    program_result: None,
                    store,
                };
                let cmdline = format::expand(template, &ctx, usize::MAX);
                match runner.run(&cmdline) {
                    Ok(out) => Some(out),
                    Err(e) => {
                        log::debug!("rule program '{cmdline}' did not match: {e}");
                        return None;
                    }
                }
            }
        };

        if let Some(result_pattern) = &rule.result {
            let result = program_result.as_deref().unwrap_or("");
            if !crate::pattern::matches(result_pattern, result) {
                return None;
            }
        }

        return Some((current, program_result));
    }
}

/// run `rules` in order against `original`, applying the first match,
/// accumulating symlinks across name-empty matches (spec §4.D).
#[allow(clippy::too_many_arguments)]
pub fn resolve(
    rules: &[Rule],
    original: &Device,
    major: Option<u64>,
    minor: Option<u64>,
    runner: &dyn ProgramRunner,
    store: &RecordStore,
    permissions: &[PermissionEntry],
) -> Resolution {
    let mut symlinks: Vec<String> = Vec::new();
    let mut resolved_name: Option<String> = None;
    let mut owner_override: Option<String> = None;
    let mut group_override: Option<String> = None;
    let mut mode_override: Option<u32> = None;
    let mut partitions = 0u32;
    let mut suppressed = false;

    for rule in rules {
        if rule.partitions > 0 && original.is_partition() {
            continue;
        }

        let matched = match match_rule(rule, original, major, minor, runner, store) {
            Some(m) => m,
            None => continue,
        };
        let (matched_device, program_result) = matched;

        let name_empty = rule.name.as_deref().map(str::is_empty).unwrap_or(true);
        let symlink_empty = rule.symlink.as_deref().map(str::is_empty).unwrap_or(true);

        if name_empty && symlink_empty {
            suppressed = true;
            break;
        }

        if !symlink_empty {
            let ctx = EvalCtx {
                original,
                matched: matched_device,
                major,
                minor,
                program_result: program_result.as_deref(),
                store,
            };
            let expanded = format::expand(rule.symlink.as_deref().unwrap_or(""), &ctx, usize::MAX);
            symlinks.extend(expanded.split_whitespace().map(str::to_string));
        }

        if owner_override.is_none() {
            owner_override = rule.owner.clone();
        }
        if group_override.is_none() {
            group_override = rule.group.clone();
        }
        if mode_override.is_none() {
            mode_override = rule.mode;
        }
        if partitions == 0 {
            partitions = rule.partitions;
        }

        if !name_empty {
            let ctx = EvalCtx {
                original,
                matched: matched_device,
                major,
                minor,
                program_result: program_result.as_deref(),
                store,
            };
            let expanded = format::expand(rule.name.as_deref().unwrap_or(""), &ctx, usize::MAX);
            resolved_name = Some(expanded);
            break;
        }
        // name still empty: keep scanning for a later rule that names the device.
    }

    if suppressed {
        return Resolution::Suppressed;
    }

    let name = resolved_name.unwrap_or_else(|| original.kernel.replace('!', "/"));

    let mut resolved = ResolvedDevice {
        name: name.clone(),
        symlinks,
        partitions,
        ..Default::default()
    };

    if let Some(o) = owner_override {
        resolved.owner = o;
    }
    if let Some(g) = group_override {
        resolved.group = g;
    }
    if let Some(m) = mode_override {
        resolved.mode = m;
    }

    if owner_override.is_none() || group_override.is_none() || mode_override.is_none() {
        if let Some(perm) = permissions
            .iter()
            .find(|p| crate::pattern::matches(&p.name_pattern, &name))
        {
            if resolved.owner == "root" && owner_override.is_none() {
                resolved.owner = perm.owner.clone();
            }
            if resolved.group == "root" && group_override.is_none() {
                resolved.group = perm.group.clone();
            }
            if mode_override.is_none() {
                resolved.mode = perm.mode;
            }
        }
    }

    Resolution::Named(resolved)
}

/// look up the first permission entry whose name pattern matches
pub fn find_permission<'a>(name: &str, permissions: &'a [PermissionEntry]) -> Option<&'a PermissionEntry> {
    permissions.iter().find(|p| crate::pattern::matches(&p.name_pattern, name))
}

/// unused-key placeholder kept for callers that snapshot raw sysfs attrs
/// alongside a device node (mirrors how the original namedev.c cached
/// attribute lookups per rule evaluation).
pub type SysAttrCache = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::RecordStore;
    use tempfile::TempDir;

    struct NullRunner;
    impl ProgramRunner for NullRunner {
        fn run(&self, _cmdline: &str) -> Result<String, Error> {
            Err(Error::RuleEval {
                msg: "no program configured in test".to_string(),
            })
        }
    }

    fn sda() -> Device {
        let mut d = Device::named("sda");
        d.subsystem = "block".to_string();
        d.bus_id = "2:0:0:0".to_string();
        d.syspath = "/sys/devices/pci0000:00/host2/target2:0:0/2:0:0:0/block/sda".to_string();
        d
    }

    #[test]
    fn suppression_sentinel_when_name_and_symlink_empty() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(store_dir.path());
        let rules = vec![Rule {
            kernel: Some("sda".to_string()),
            name: Some(String::new()),
            symlink: Some(String::new()),
            ..Default::default()
        }];
        let resolution = resolve(&rules, &sda(), None, None, &NullRunner, &store, &[]);
        assert_eq!(resolution, Resolution::Suppressed);
    }

    #[test]
    fn symlink_accumulates_then_name_stops_iteration() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(store_dir.path());
        let rules = vec![
            Rule {
                kernel: Some("sda".to_string()),
                symlink: Some("disk/by-id/foo".to_string()),
                ..Default::default()
            },
            Rule {
                kernel: Some("sda".to_string()),
                name: Some("sdX".to_string()),
                symlink: Some("disk/by-path/bar".to_string()),
                ..Default::default()
            },
        ];
        let resolution = resolve(&rules, &sda(), None, None, &NullRunner, &store, &[]);
        match resolution {
            Resolution::Named(resolved) => {
                assert_eq!(resolved.name, "sdX");
                assert_eq!(
                    resolved.symlinks,
                    vec!["disk/by-id/foo".to_string(), "disk/by-path/bar".to_string()]
                );
            }
            other => panic!("expected Named, got {other:?}"),
        }
    }

    #[test]
    fn no_match_falls_back_to_kernel_name() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(store_dir.path());
        let mut dev = sda();
        dev.kernel = "tty!0".to_string();
        let resolution = resolve(&[], &dev, None, None, &NullRunner, &store, &[]);
        match resolution {
            Resolution::Named(resolved) => assert_eq!(resolved.name, "tty/0"),
            other => panic!("expected Named, got {other:?}"),
        }
    }

    #[test]
    fn partitions_rule_skipped_for_partition_device() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(store_dir.path());
        let mut dev = sda();
        dev.kernel = "sda1".to_string();
        let rules = vec![
            Rule {
                kernel: Some("sda1".to_string()),
                name: Some("ignored".to_string()),
                partitions: 4,
                ..Default::default()
            },
            Rule {
                kernel: Some("sda1".to_string()),
                name: Some("sda1-renamed".to_string()),
                ..Default::default()
            },
        ];
        let resolution = resolve(&rules, &dev, None, None, &NullRunner, &store, &[]);
        match resolution {
            Resolution::Named(resolved) => assert_eq!(resolved.name, "sda1-renamed"),
            other => panic!("expected Named, got {other:?}"),
        }
    }

    #[test]
    fn parent_walk_matches_bus_predicate_absent_on_child() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(store_dir.path());

        let mut usb_parent = Device::named("usb1");
        usb_parent.bus = "usb".to_string();
        usb_parent.bus_id = "1-1".to_string();
        usb_parent.syspath = "/sys/devices/pci0000:00/usb1".to_string();

        let mut dev = sda();
        dev.kernel = "sda".to_string();
        dev.bus = String::new(); // child level has no bus of its own
        dev.parent = Some(Box::new(usb_parent));

        let rules = vec![Rule {
            kernel: Some("sda".to_string()),
            bus: Some("usb".to_string()),
            name: Some("usb-disk".to_string()),
            ..Default::default()
        }];

        let resolution = resolve(&rules, &dev, None, None, &NullRunner, &store, &[]);
        match resolution {
            Resolution::Named(resolved) => assert_eq!(resolved.name, "usb-disk"),
            other => panic!("expected Named, got {other:?}"),
        }
    }

    #[test]
    fn permission_table_fills_unset_fields() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(store_dir.path());
        let rules = vec![Rule {
            kernel: Some("sda".to_string()),
            name: Some("sda".to_string()),
            ..Default::default()
        }];
        let perms = vec![PermissionEntry {
            name_pattern: "sd*".to_string(),
            owner: "disk".to_string(),
            group: "disk".to_string(),
            mode: 0o660,
        }];
        let resolution = resolve(&rules, &sda(), None, None, &NullRunner, &store, &perms);
        match resolution {
            Resolution::Named(resolved) => {
                assert_eq!(resolved.owner, "disk");
                assert_eq!(resolved.group, "disk");
                assert_eq!(resolved.mode, 0o660);
            }
            other => panic!("expected Named, got {other:?}"),
        }
    }
}
