//! Frame-level protocol engine (spec.md §4.2): assembles and disassembles
//! application messages out of the frame stream, enforcing the
//! fragmentation and control-frame interleaving rules and carrying UTF-8
//! validation state across fragment boundaries. Pure with respect to I/O -
//! it only ever touches the bytes handed to it.

use crate::buffer::ByteBuffer;
use crate::config::Settings;
use crate::error::Error;
use crate::frame::{self, OpCode, ParseOutcome, Role};
use crate::message::{Message, MessageDescriptor, MessageType};
use crate::utf8::Utf8Validator;

/// A close frame's payload, decoded. No status code at all (a zero-length
/// close payload) is legal per RFC 6455 §7.1.5; `code` is `None` in that
/// case.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
}

/// What processing one frame produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// A fragmented or unfragmented message finished assembling.
    Message(Message),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(CloseInfo),
}

/// Tracks the in-progress fragmented message plus streaming UTF-8 state,
/// and drives the incremental frame parse loop of spec.md §4.2 over a
/// caller-owned read buffer.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    message: MessageDescriptor,
    message_buf: Vec<u8>,
    utf8: Utf8Validator,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to parse and process one frame from the front of `buf`.
    /// `Ok(None)` means not enough bytes yet (try again after the next
    /// read). `Ok(Some((consumed, event)))` means `consumed` bytes should
    /// be sliced off the front of `buf`; `event` carries a completed
    /// message or control frame, or is `None` when an interior fragment of
    /// a still-open message was consumed.
    pub fn process_next(
        &mut self,
        buf: &[u8],
        role: Role,
        settings: &Settings,
    ) -> Result<Option<(usize, Option<FrameEvent>)>, Error> {
        let header = match frame::parse_header(buf, role)? {
            ParseOutcome::Continue => return Ok(None),
            ParseOutcome::Header(h) => h,
        };
        let frame_end = header.payload_offset + header.payload_len;
        if buf.len() < frame_end {
            return Ok(None);
        }

        let mut payload = buf[header.payload_offset..frame_end].to_vec();
        if header.masked {
            frame::apply_mask(&mut payload, header.mask_key);
        }

        let event = if header.opcode.is_control() {
            Some(self.process_control(header.opcode, payload)?)
        } else {
            self.process_data(header.opcode, header.fin, payload, settings)?
        };

        Ok(Some((frame_end, event)))
    }

    fn process_control(&self, opcode: OpCode, payload: Vec<u8>) -> Result<FrameEvent, Error> {
        match opcode {
            OpCode::Ping => Ok(FrameEvent::Ping(payload)),
            OpCode::Pong => Ok(FrameEvent::Pong(payload)),
            OpCode::Close => Ok(FrameEvent::Close(decode_close_payload(&payload)?)),
            _ => unreachable!("non-control opcode routed to process_control"),
        }
    }

    fn process_data(
        &mut self,
        opcode: OpCode,
        fin: bool,
        payload: Vec<u8>,
        settings: &Settings,
    ) -> Result<Option<FrameEvent>, Error> {
        match opcode {
            OpCode::Continuation => {
                if !self.message.in_progress() {
                    return Err(Error::UnexpectedContinuation);
                }
            }
            _ => {
                if self.message.in_progress() {
                    return Err(Error::InterleavedDataFrame);
                }
                self.message.message_type = MessageType::from_opcode(opcode)
                    .expect("data opcode always maps to a message type");
                self.message.fragment_count = 0;
                self.message.accumulated_len = 0;
                self.message.start_offset = 0;
                self.message_buf.clear();
                self.utf8 = Utf8Validator::new();
            }
        }

        self.message.fragment_count += 1;
        if let Some(cap) = settings.read_max_num_frames {
            if self.message.fragment_count > cap {
                self.message.reset();
                self.message_buf.clear();
                return Err(Error::TooManyFragments);
            }
        }

        if self.message.message_type == MessageType::Text && self.utf8.feed(&payload).is_err() {
            self.message.reset();
            self.message_buf.clear();
            return Err(Error::InvalidUtf8);
        }

        self.message.accumulated_len += payload.len();
        if let Some(cap) = settings.read_max_msg_size {
            if self.message.accumulated_len > cap {
                self.message.reset();
                self.message_buf.clear();
                return Err(Error::MessageTooLarge);
            }
        }
        self.message_buf.extend_from_slice(&payload);

        if !fin {
            return Ok(None);
        }

        if self.message.message_type == MessageType::Text && !self.utf8.is_accepting() {
            self.message.reset();
            self.message_buf.clear();
            return Err(Error::InvalidUtf8);
        }

        let message_type = self.message.message_type;
        let bytes = std::mem::take(&mut self.message_buf);
        self.message.reset();

        let message = match message_type {
            MessageType::Text => {
                Message::Text(String::from_utf8(bytes).expect("validated incrementally above"))
            }
            MessageType::Binary => Message::Binary(bytes),
            MessageType::None => unreachable!("fin frame always has a message type set"),
        };
        Ok(Some(FrameEvent::Message(message)))
    }
}

fn decode_close_payload(payload: &[u8]) -> Result<CloseInfo, Error> {
    if payload.is_empty() {
        return Ok(CloseInfo {
            code: None,
            reason: String::new(),
        });
    }
    if payload.len() == 1 {
        return Err(Error::InvalidCloseCode);
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if crate::error::is_reserved_close_code(code) {
        return Err(Error::InvalidCloseCode);
    }
    let reason = std::str::from_utf8(&payload[2..])
        .map_err(|_| Error::InvalidUtf8)?
        .to_string();
    Ok(CloseInfo {
        code: Some(code),
        reason,
    })
}

/// Serialize an outgoing application message into `out` as one or more
/// frames (spec.md §4.2 "Frame serialization"). UTF-8 is validated before
/// any bytes are written.
pub fn serialize_outgoing(
    out: &mut Vec<u8>,
    message: &Message,
    max_frame_size: Option<usize>,
    mask_key_gen: Option<&mut dyn FnMut() -> [u8; 4]>,
) -> Result<(), Error> {
    if let Message::Text(s) = message {
        if std::str::from_utf8(s.as_bytes()).is_err() {
            return Err(Error::InvalidUtf8Outgoing);
        }
    }
    let opcode = if message.is_text() { OpCode::Text } else { OpCode::Binary };
    frame::serialize_message(out, opcode, message.as_bytes(), max_frame_size, mask_key_gen);
    Ok(())
}

/// Serialize a control frame (PING/PONG/CLOSE). Control frames are never
/// fragmented; `payload` must already be `<= 125` bytes.
pub fn serialize_control(
    out: &mut Vec<u8>,
    opcode: OpCode,
    payload: &[u8],
    mask_key_gen: Option<&mut dyn FnMut() -> [u8; 4]>,
) {
    frame::serialize_message(out, opcode, payload, None, mask_key_gen);
}

/// Compact a [`ByteBuffer`] by slicing off `consumed` bytes - the common
/// tail of every successful `process_next` call (spec.md §4.2 "Buffer
/// compaction").
pub fn compact(buf: &mut ByteBuffer, consumed: usize) {
    buf.slice_off(consumed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{apply_mask, serialize_message};

    fn assemble_all(bytes: &[u8], role: Role, settings: &Settings) -> Vec<FrameEvent> {
        let mut assembler = FrameAssembler::new();
        let mut buf = bytes.to_vec();
        let mut events = Vec::new();
        loop {
            match assembler.process_next(&buf, role, settings).unwrap() {
                None => break,
                Some((consumed, event)) => {
                    buf.drain(0..consumed);
                    if let Some(e) = event {
                        events.push(e);
                    }
                }
            }
        }
        events
    }

    #[test]
    fn s4_fragmented_masked_client_message() {
        let mut gen = || [0x11u8, 0x22, 0x33, 0x44];
        let mut out = Vec::new();
        serialize_message(&mut out, OpCode::Text, b"fragment1fragment2", Some(9), Some(&mut gen));

        let events = assemble_all(&out, Role::Server, &Settings::default());
        assert_eq!(events, vec![FrameEvent::Message(Message::Text("fragment1fragment2".into()))]);
    }

    #[test]
    fn s5_large_binary_message_unmasks_correctly() {
        let payload = vec![b'*'; 65536];
        let mut key = [0x00u8, 0x00, 0x00, 0x01];
        let mut masked = payload.clone();
        apply_mask(&mut masked, key);
        let mut out = vec![0x82u8, 0xff];
        out.extend_from_slice(&(65536u64).to_be_bytes());
        out.extend_from_slice(&key);
        out.extend_from_slice(&masked);
        key = [0, 0, 0, 0];
        let _ = key;

        let events = assemble_all(&out, Role::Server, &Settings::default());
        match &events[0] {
            FrameEvent::Message(Message::Binary(b)) => {
                assert_eq!(b.len(), 65536);
                assert_eq!(b[65535], b'*');
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn interleaved_control_frame_does_not_disturb_fragmentation() {
        let mut out = Vec::new();
        serialize_message(&mut out, OpCode::Text, b"frag-a", None, None);
        // truncate the FIN bit off the first frame so it's a non-final fragment
        out[0] &= !0b1000_0000;
        serialize_message(&mut out, OpCode::Ping, b"hi", None, None);
        serialize_message(&mut out, OpCode::Continuation, b"frag-b", None, None);

        let events = assemble_all(&out, Role::Client, &Settings::default());
        assert_eq!(
            events,
            vec![
                FrameEvent::Ping(b"hi".to_vec()),
                FrameEvent::Message(Message::Text("frag-afrag-b".into())),
            ]
        );
    }

    #[test]
    fn continuation_without_open_message_fails() {
        let mut out = Vec::new();
        serialize_message(&mut out, OpCode::Continuation, b"oops", None, None);
        let mut assembler = FrameAssembler::new();
        assert!(matches!(
            assembler.process_next(&out, Role::Client, &Settings::default()),
            Err(Error::UnexpectedContinuation)
        ));
    }

    #[test]
    fn fragment_count_cap_enforced() {
        let mut out = Vec::new();
        let mut first = Vec::new();
        serialize_message(&mut first, OpCode::Text, b"a", None, None);
        first[0] &= !0b1000_0000;
        out.extend_from_slice(&first);
        let mut cont = Vec::new();
        serialize_message(&mut cont, OpCode::Continuation, b"b", None, None);
        cont[0] &= !0b1000_0000;
        out.extend_from_slice(&cont);
        out.extend_from_slice(&cont);

        let settings = Settings {
            read_max_num_frames: Some(2),
            ..Settings::default()
        };
        let mut assembler = FrameAssembler::new();
        let mut buf = out;
        let last = loop {
            let result = assembler.process_next(&buf, Role::Client, &settings);
            match &result {
                Ok(Some((consumed, _))) => {
                    buf.drain(0..*consumed);
                }
                _ => break result,
            }
        };
        assert!(matches!(last, Err(Error::TooManyFragments)));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut out = Vec::new();
        serialize_message(&mut out, OpCode::Binary, &[0xC0, 0xAF], None, None);
        out[0] = (out[0] & 0b1111_0000) | OpCode::Text.as_u8();
        let mut assembler = FrameAssembler::new();
        assert!(matches!(
            assembler.process_next(&out, Role::Client, &Settings::default()),
            Err(Error::InvalidUtf8)
        ));
    }

    #[test]
    fn close_frame_decodes_code_and_reason() {
        let mut out = Vec::new();
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        serialize_message(&mut out, OpCode::Close, &payload, None, None);
        let events = assemble_all(&out, Role::Client, &Settings::default());
        assert_eq!(
            events,
            vec![FrameEvent::Close(CloseInfo {
                code: Some(1000),
                reason: "bye".into()
            })]
        );
    }

    #[test]
    fn reserved_close_code_rejected() {
        let mut out = Vec::new();
        let payload = 1005u16.to_be_bytes().to_vec();
        serialize_message(&mut out, OpCode::Close, &payload, None, None);
        let mut assembler = FrameAssembler::new();
        assert!(matches!(
            assembler.process_next(&out, Role::Client, &Settings::default()),
            Err(Error::InvalidCloseCode)
        ));
    }
}
