//! control protocol (spec module K): non-event helper datagrams that tell
//! the daemon to stop/start its execution queue or change a tunable.
use crate::event::{ParseError, HELPER_MAGIC};
use crate::exec_queue::ExecQueue;

/// type tag carried in byte offset 8..12 of every helper datagram
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    UeventHelper = 1,
    UeventInitsend = 2,
    StopExecQueue = 3,
    StartExecQueue = 4,
    SetLogLevel = 5,
    SetMaxChilds = 6,
}

impl MessageType {
    fn from_u32(tag: u32) -> Option<MessageType> {
        match tag {
            1 => Some(MessageType::UeventHelper),
            2 => Some(MessageType::UeventInitsend),
            3 => Some(MessageType::StopExecQueue),
            4 => Some(MessageType::StartExecQueue),
            5 => Some(MessageType::SetLogLevel),
            6 => Some(MessageType::SetMaxChilds),
            _ => None,
        }
    }
}

/// a parsed control datagram (the two `Uevent*` tags are events, not
/// control messages, and are handled by [`crate::event::Event`] instead).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    StopExecQueue,
    StartExecQueue,
    SetLogLevel(u32),
    SetMaxChilds(u32),
}

/// parse a non-event helper datagram's type tag and payload. Returns
/// `Ok(None)` for the two event type tags, since those are events and
/// belong to [`crate::event::Event::parse_helper`] instead.
pub fn parse(buf: &[u8]) -> Result<Option<ControlMessage>, ParseError> {
    if buf.len() < 12 {
        return Err(ParseError::Truncated);
    }
    if buf[0..8] != HELPER_MAGIC {
        return Err(ParseError::BadMagic);
    }
    let tag = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let message_type = MessageType::from_u32(tag).ok_or(ParseError::MissingAction)?;

    match message_type {
        MessageType::UeventHelper | MessageType::UeventInitsend => Ok(None),
        MessageType::StopExecQueue => Ok(Some(ControlMessage::StopExecQueue)),
        MessageType::StartExecQueue => Ok(Some(ControlMessage::StartExecQueue)),
        MessageType::SetLogLevel => {
            let value = read_le_i32(buf, 12)?;
            Ok(Some(ControlMessage::SetLogLevel(value)))
        }
        MessageType::SetMaxChilds => {
            let value = read_le_i32(buf, 12)?;
            Ok(Some(ControlMessage::SetMaxChilds(value)))
        }
    }
}

fn read_le_i32(buf: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes: [u8; 4] = buf.get(offset..offset + 4).ok_or(ParseError::Truncated)?.try_into().unwrap();
    Ok(u32::from_le_bytes(bytes))
}

/// apply a control message. `SetLogLevel` exports `UDEV_LOG` into the
/// daemon's own environment so forked workers inherit the new priority.
pub fn apply(message: &ControlMessage, exec_queue: &ExecQueue) {
    match message {
        ControlMessage::StopExecQueue => {
            log::info!("control: stopping execution queue");
            exec_queue.stop();
        }
        ControlMessage::StartExecQueue => {
            log::info!("control: starting execution queue");
            exec_queue.start();
        }
        ControlMessage::SetLogLevel(level) => {
            log::info!("control: setting log level to {level}");
            std::env::set_var("UDEV_LOG", level.to_string());
        }
        ControlMessage::SetMaxChilds(n) => {
            log::info!("control: setting max_childs to {n}");
            exec_queue.set_max_childs(*n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_buf(tag: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HELPER_MAGIC);
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parses_stop_and_start() {
        assert_eq!(parse(&control_buf(3, &[])).unwrap(), Some(ControlMessage::StopExecQueue));
        assert_eq!(parse(&control_buf(4, &[])).unwrap(), Some(ControlMessage::StartExecQueue));
    }

    #[test]
    fn parses_set_log_level_payload() {
        let buf = control_buf(5, &7u32.to_le_bytes());
        assert_eq!(parse(&buf).unwrap(), Some(ControlMessage::SetLogLevel(7)));
    }

    #[test]
    fn event_type_tags_return_none() {
        let buf = control_buf(1, &[]);
        assert_eq!(parse(&buf).unwrap(), None);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8; 12];
        buf.extend_from_slice(&3u32.to_le_bytes());
        assert_eq!(parse(&buf), Err(ParseError::BadMagic));
    }

    #[test]
    fn apply_stop_then_start_toggles_queue() {
        let q = ExecQueue::new("worker".to_string(), 8, 8);
        apply(&ControlMessage::StopExecQueue, &q);
        apply(&ControlMessage::SetMaxChilds(3), &q);
        apply(&ControlMessage::StartExecQueue, &q);
    }
}
