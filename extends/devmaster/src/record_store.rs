//! persisted per-device record store (spec module E).
//!
//! One flat directory, one file per device keyed by devpath with '/'
//! replaced by `KEY_SEP` so the directory stays flat. Body is the
//! line-oriented format from spec §3 (`P:`/`N:`/`S:`/`M:`/`A:`/`R:`/`E:`).
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// character a devpath's '/' is replaced with in record filenames
const KEY_SEP: char = '\u{2237}'; // a character that can't appear in a devpath

/// a record loaded back from, or about to be written to, the store
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    /// the devpath this record is keyed by
    pub devpath: String,
    /// resolved device node name
    pub name: String,
    /// symlinks created for this device
    pub symlinks: Vec<String>,
    /// (major, minor), if the device has a devnum
    pub devnum: Option<(u64, u64)>,
    /// sibling partitions created
    pub partitions: u32,
    /// whether a later `remove` event should be ignored (node was kept by a rule)
    pub ignore_remove: bool,
    /// extra KEY=VALUE environment entries to restore on lookup
    pub env: Vec<String>,
}

impl Record {
    /// nothing interesting to remember: name equals the kernel name passed
    /// in, no symlinks, no partitions, no env additions, no ignore-remove.
    pub fn is_trivial(&self, kernel_name: &str) -> bool {
        self.name == kernel_name
            && self.symlinks.is_empty()
            && self.env.is_empty()
            && self.partitions == 0
            && !self.ignore_remove
    }

    fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("P:{}\n", self.devpath));
        out.push_str(&format!("N:{}\n", self.name));
        for link in &self.symlinks {
            out.push_str(&format!("S:{link}\n"));
        }
        if let Some((major, minor)) = self.devnum {
            out.push_str(&format!("M:{major}:{minor}\n"));
        }
        if self.partitions > 0 {
            out.push_str(&format!("A:{}\n", self.partitions));
        }
        if self.ignore_remove {
            out.push_str("R:1\n");
        }
        for kv in &self.env {
            out.push_str(&format!("E:{kv}\n"));
        }
        out
    }

    fn parse(devpath: &str, body: &str) -> Record {
        let mut record = Record {
            devpath: devpath.to_string(),
            ..Default::default()
        };
        for line in body.lines() {
            let (tag, rest) = match line.split_once(':') {
                Some(pair) => pair,
                None => continue,
            };
            match tag {
                "P" => record.devpath = rest.to_string(),
                "N" => record.name = rest.to_string(),
                "S" => record.symlinks.push(rest.to_string()),
                "M" => {
                    if let Some((maj, min)) = rest.split_once(':') {
                        if let (Ok(maj), Ok(min)) = (maj.parse(), min.parse()) {
                            record.devnum = Some((maj, min));
                        }
                    }
                }
                "A" => record.partitions = rest.parse().unwrap_or(0),
                "R" => record.ignore_remove = rest != "0",
                "E" => record.env.push(rest.to_string()),
                _ => {}
            }
        }
        record
    }
}

/// the flat-directory record store
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    /// open (but don't yet create) a record store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> RecordStore {
        RecordStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, devpath: &str) -> PathBuf {
        let key: String = devpath.chars().map(|c| if c == '/' { KEY_SEP } else { c }).collect();
        self.root.join(key)
    }

    /// write a record, creating the store directory if needed. Writes the
    /// whole body in one `write_all` so a crash mid-write never leaves a
    /// partially-written file visible under a different name (no
    /// temp-file-then-rename, matching the original `udev_db.c`, which
    /// writes the real path directly).
    pub fn put(&self, record: &Record) -> Result<(), Error> {
        fs::create_dir_all(&self.root).map_err(|e| Error::Store {
            msg: format!("failed to create record store dir {:?}: {e}", self.root),
        })?;
        let path = self.path_for(&record.devpath);
        let mut file = fs::File::create(&path).map_err(|e| Error::Store {
            msg: format!("failed to create record file {path:?}: {e}"),
        })?;
        file.write_all(record.serialize().as_bytes()).map_err(|e| Error::Store {
            msg: format!("failed to write record file {path:?}: {e}"),
        })?;
        Ok(())
    }

    /// read back the record for `devpath`, if any
    pub fn get(&self, devpath: &str) -> Result<Option<Record>, Error> {
        let path = self.path_for(devpath);
        match fs::read_to_string(&path) {
            Ok(body) => Ok(Some(Record::parse(devpath, &body))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store {
                msg: format!("failed to read record file {path:?}: {e}"),
            }),
        }
    }

    /// remove the record for `devpath`; idempotent (missing file is not an error)
    pub fn delete(&self, devpath: &str) -> Result<(), Error> {
        let path = self.path_for(devpath);
        match fs::remove_file(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store {
                msg: format!("failed to remove record file {path:?}: {e}"),
            }),
        }
    }

    /// linearly scan the store for a devpath whose name or any symlink
    /// equals `name` exactly. Used by `%e` and by device-by-name lookups.
    pub fn find_by_name(&self, name: &str) -> Option<String> {
        let entries = fs::read_dir(&self.root).ok()?;
        for entry in entries.flatten() {
            let body = match fs::read_to_string(entry.path()) {
                Ok(b) => b,
                Err(_) => continue,
            };
            let record = Record::parse("", &body);
            if record.name == name || record.symlinks.iter().any(|s| s == name) {
                return Some(record.devpath);
            }
        }
        None
    }

    /// yield every `(devpath, name)` pair currently in the store
    pub fn scan<F: FnMut(&str, &str)>(&self, mut cb: F) {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let body = match fs::read_to_string(entry.path()) {
                Ok(b) => b,
                Err(_) => continue,
            };
            let record = Record::parse("", &body);
            cb(&record.devpath, &record.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let record = Record {
            devpath: "/devices/pci0000:00/block/sda".to_string(),
            name: "sda".to_string(),
            symlinks: vec!["disk/by-id/foo".to_string()],
            devnum: Some((8, 0)),
            partitions: 0,
            ignore_remove: false,
            env: vec!["ID_BUS=scsi".to_string()],
        };
        store.put(&record).unwrap();
        let read_back = store.get(&record.devpath).unwrap().unwrap();
        assert_eq!(read_back, record);
    }

    #[test]
    fn get_on_missing_devpath_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        assert_eq!(store.get("/devices/nope").unwrap(), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let record = Record {
            devpath: "/devices/x".to_string(),
            name: "x".to_string(),
            ..Default::default()
        };
        store.put(&record).unwrap();
        store.delete(&record.devpath).unwrap();
        assert_eq!(store.get(&record.devpath).unwrap(), None);
        // second delete: still fine
        store.delete(&record.devpath).unwrap();
    }

    #[test]
    fn find_by_name_matches_name_or_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store
            .put(&Record {
                devpath: "/devices/block/sda".to_string(),
                name: "sda".to_string(),
                symlinks: vec!["disk/by-id/foo".to_string()],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(store.find_by_name("sda"), Some("/devices/block/sda".to_string()));
        assert_eq!(
            store.find_by_name("disk/by-id/foo"),
            Some("/devices/block/sda".to_string())
        );
        assert_eq!(store.find_by_name("nonexistent"), None);
    }

    #[test]
    fn trivial_records_are_identified() {
        let r = Record {
            devpath: "/devices/block/sda".to_string(),
            name: "sda".to_string(),
            ..Default::default()
        };
        assert!(r.is_trivial("sda"));
        assert!(!r.is_trivial("sdb"));
    }
}
