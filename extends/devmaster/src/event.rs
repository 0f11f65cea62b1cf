//! event message (spec module G): the immutable unit carried from
//! ingestion through ordering, execution and worker exec.
use std::time::Duration;

/// where an [`Event`] was ingested from
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Source {
    /// the kernel uevent netlink socket
    Netlink,
    /// the helper abstract-namespace datagram socket
    Helper,
}

/// magic cookie every helper datagram must carry
pub const HELPER_MAGIC: [u8; 8] = *b"devmastr";

/// an event as parsed from either wire format. Immutable once built.
#[derive(Debug, Clone)]
pub struct Event {
    /// monotonic sequence number; 0 means "no sequence, bypass ordering"
    pub seqnum: u64,
    /// add/remove/change/move/online/offline/bind/unbind; opaque to the core
    pub action: String,
    /// hierarchical sysfs devpath, '/'-separated, leading '/'
    pub devpath: String,
    pub subsystem: String,
    /// only meaningful during `add` collision checks
    pub physdevpath: Option<String>,
    pub major: Option<u64>,
    pub minor: Option<u64>,
    /// bypasses collision gating when set; released immediately after ordering
    pub timeout_override: Option<Duration>,
    /// ordered KEY=VALUE strings handed to the worker's environment, including
    /// the parsed fields above and the `UDEVD_EVENT=1` sentinel
    pub env: Vec<String>,
    pub source: Source,
    /// monotonic seconds at insertion into the ordering queue
    pub queue_time: u64,
    /// set only while the event is in the running set
    pub worker_pid: Option<i32>,
}

/// reasons parsing an incoming datagram can fail; all are silently dropped
/// at info level per the error handling design (`MALFORMED_EVENT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// helper datagram magic cookie mismatch
    BadMagic,
    /// datagram too short to contain a header
    Truncated,
    /// missing a required `ACTION=` (or netlink header) field
    MissingAction,
    /// missing `DEVPATH=`
    MissingDevpath,
    /// netlink header `ACTION@DEVPATH` disagrees with the buffer's `ACTION=`
    ActionMismatch,
}

impl Event {
    /// parse a helper datagram: `{ magic[8], type: u32, envbuf }`. Only
    /// `UEVENT_HELPER`/`UEVENT_INITSEND` type datagrams become events; other
    /// types (`STOP_EXEC_QUEUE` etc) are control messages handled elsewhere.
    pub fn parse_helper(buf: &[u8], queue_time: u64) -> Result<Event, ParseError> {
        if buf.len() < 12 {
            return Err(ParseError::Truncated);
        }
        if buf[0..8] != HELPER_MAGIC {
            return Err(ParseError::BadMagic);
        }
        let envbuf = &buf[12..];
        let env = split_nul_kv(envbuf);
        Event::from_env(env, Source::Helper, queue_time, None)
    }

    /// parse a netlink uevent datagram: `ACTION@DEVPATH\0KEY=VALUE\0...`.
    pub fn parse_netlink(buf: &[u8], queue_time: u64) -> Result<Event, ParseError> {
        let nul = buf.iter().position(|&b| b == 0).ok_or(ParseError::Truncated)?;
        let header = std::str::from_utf8(&buf[..nul]).map_err(|_| ParseError::Truncated)?;
        let (action, devpath) = header.split_once('@').ok_or(ParseError::MissingAction)?;
        let env = split_nul_kv(&buf[nul + 1..]);
        let event = Event::from_env(env, Source::Netlink, queue_time, None)?;
        if event.action != action || event.devpath != devpath {
            return Err(ParseError::ActionMismatch);
        }
        Ok(event)
    }

    fn from_env(
        mut env: Vec<String>,
        source: Source,
        queue_time: u64,
        worker_pid: Option<i32>,
    ) -> Result<Event, ParseError> {
        let mut action = None;
        let mut devpath = None;
        let mut subsystem = String::new();
        let mut seqnum = 0u64;
        let mut physdevpath = None;
        let mut major = None;
        let mut minor = None;
        let mut timeout_override = None;

        for kv in &env {
            let (key, value) = match kv.split_once('=') {
                Some(pair) => pair,
                None => continue,
            };
            match key {
                "ACTION" => action = Some(value.to_string()),
                "DEVPATH" => devpath = Some(value.to_string()),
                "SUBSYSTEM" => subsystem = value.to_string(),
                "SEQNUM" => seqnum = value.parse().unwrap_or(0),
                "PHYSDEVPATH" => physdevpath = Some(value.to_string()),
                "MAJOR" => major = value.parse().ok(),
                "MINOR" => minor = value.parse().ok(),
                "TIMEOUT" => timeout_override = value.parse().ok().map(Duration::from_secs),
                _ => {}
            }
        }

        let action = action.ok_or(ParseError::MissingAction)?;
        let devpath = devpath.ok_or(ParseError::MissingDevpath)?;

        env.push("UDEVD_EVENT=1".to_string());

        Ok(Event {
            seqnum,
            action,
            devpath,
            subsystem,
            physdevpath,
            major,
            minor,
            timeout_override,
            env,
            source,
            queue_time,
            worker_pid,
        })
    }
}

fn split_nul_kv(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv_buf(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn parses_helper_datagram() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HELPER_MAGIC);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend(kv_buf(&["ACTION=add", "DEVPATH=/devices/sda", "SUBSYSTEM=block", "SEQNUM=5"]));

        let event = Event::parse_helper(&buf, 100).unwrap();
        assert_eq!(event.action, "add");
        assert_eq!(event.devpath, "/devices/sda");
        assert_eq!(event.seqnum, 5);
        assert_eq!(event.source, Source::Helper);
        assert!(event.env.contains(&"UDEVD_EVENT=1".to_string()));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8; 8];
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend(kv_buf(&["ACTION=add", "DEVPATH=/x"]));
        assert_eq!(Event::parse_helper(&buf, 0), Err(ParseError::BadMagic));
    }

    #[test]
    fn parses_netlink_datagram() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"add@/devices/sda\0");
        buf.extend(kv_buf(&["ACTION=add", "DEVPATH=/devices/sda", "SUBSYSTEM=block"]));
        let event = Event::parse_netlink(&buf, 42).unwrap();
        assert_eq!(event.action, "add");
        assert_eq!(event.source, Source::Netlink);
    }

    #[test]
    fn rejects_netlink_action_mismatch() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"add@/devices/sda\0");
        buf.extend(kv_buf(&["ACTION=remove", "DEVPATH=/devices/sda"]));
        assert_eq!(Event::parse_netlink(&buf, 0), Err(ParseError::ActionMismatch));
    }

    #[test]
    fn missing_devpath_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HELPER_MAGIC);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend(kv_buf(&["ACTION=add"]));
        assert_eq!(Event::parse_helper(&buf, 0), Err(ParseError::MissingDevpath));
    }
}
