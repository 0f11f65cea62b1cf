//! loading already-parsed rules and permission entries from TOML.
//!
//! Rule-file syntax (the udev `*.rules` grammar) is explicitly out of
//! scope; this module is the boundary where a TOML-expressed equivalent
//! is deserialized into the [`crate::rules::Rule`]/[`crate::rules::PermissionEntry`]
//! structures the matcher and resolver actually consume.
use serde_derive::Deserialize;

use crate::rules::{PermissionEntry, Rule};

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rule: Vec<RuleEntry>,
    #[serde(default)]
    permission: Vec<PermissionFileEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct RuleEntry {
    bus: Option<String>,
    kernel: Option<String>,
    subsystem: Option<String>,
    id: Option<String>,
    place: Option<String>,
    #[serde(default)]
    sysfs_pairs: Vec<(String, String)>,
    program: Option<String>,
    result: Option<String>,
    name: Option<String>,
    symlink: Option<String>,
    owner: Option<String>,
    group: Option<String>,
    mode: Option<u32>,
    #[serde(default)]
    partitions: u32,
}

#[derive(Debug, Deserialize)]
struct PermissionFileEntry {
    name_pattern: String,
    owner: String,
    group: String,
    mode: u32,
}

/// parse a TOML rule file's text into rules and permission entries,
/// stamping each rule with `source_file` for diagnostics.
pub fn parse(source_file: &str, text: &str) -> Result<(Vec<Rule>, Vec<PermissionEntry>), crate::error::Error> {
    let parsed: RuleFile = toml::from_str(text).map_err(|e| crate::error::Error::RuleEval {
        msg: format!("failed to parse rule file {source_file}: {e}"),
    })?;

    let rules = parsed
        .rule
        .into_iter()
        .enumerate()
        .map(|(i, entry)| Rule {
            bus: entry.bus,
            kernel: entry.kernel,
            subsystem: entry.subsystem,
            id: entry.id,
            place: entry.place,
            sysfs_pairs: entry.sysfs_pairs,
            program: entry.program,
            result: entry.result,
            name: entry.name,
            symlink: entry.symlink,
            owner: entry.owner,
            group: entry.group,
            mode: entry.mode,
            partitions: entry.partitions,
            source_file: source_file.to_string(),
            source_line: i as u32 + 1,
        })
        .collect();

    let permissions = parsed
        .permission
        .into_iter()
        .map(|p| PermissionEntry {
            name_pattern: p.name_pattern,
            owner: p.owner,
            group: p.group,
            mode: p.mode,
        })
        .collect();

    Ok((rules, permissions))
}

/// load and parse every `*.toml` file in `dir`, in sorted filename order
/// (the same "later file can override earlier" ordering rule files use).
pub fn load_dir(dir: &std::path::Path) -> Result<(Vec<Rule>, Vec<PermissionEntry>), crate::error::Error> {
    let mut rules = Vec::new();
    let mut permissions = Vec::new();

    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| crate::error::Error::RuleEval {
            msg: format!("failed to read rule directory {dir:?}: {e}"),
        })?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
        .collect();
    paths.sort();

    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|e| crate::error::Error::RuleEval {
            msg: format!("failed to read rule file {path:?}: {e}"),
        })?;
        let (file_rules, file_permissions) = parse(&path.to_string_lossy(), &text)?;
        rules.extend(file_rules);
        permissions.extend(file_permissions);
    }

    Ok((rules, permissions))
}
