//! Codec for encoding and decoding protocol messages.
//!
//! Every message starts with a 32-bit big-endian opcode. Messages carry no
//! length field, so decoding knows each payload layout up front:
//!
//! ```text
//! +----------+------+---------------------------+
//! | Opcode   | Slot |  Payload (opcode-defined) |
//! | u32 BE   | u8   |                           |
//! +----------+------+---------------------------+
//! ```
//!
//! CA_PMT and stop-slot messages use the CI application object layout
//! instead (`9F 80 32 82 <len u16> ...`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::psi::{section_total_len, PMT_MIN_LEN};
use crate::types::*;

/// Opcode size in bytes.
pub const OPCODE_SIZE: usize = 4;

/// Size of a stop-slot message.
pub const STOP_DEMUX_SIZE: usize = 8;

/// Inner length of a placeholder CA_PMT.
const PLACEHOLDER_LENGTH: u16 = 11;

/// Bytes injected into program info: command byte plus demux descriptor.
const INJECTED_PROGRAM_INFO: usize = 5;

/// Returns `Ok(None)` from the enclosing decoder when fewer than `$n`
/// bytes remain.
macro_rules! need {
    ($cur:expr, $n:expr) => {
        if $cur.remaining() < $n {
            return Ok(None);
        }
    };
}

/// Encode the client identification sent right after connect.
pub fn encode_client_hello() -> Bytes {
    let name = CLIENT_NAME.as_bytes();
    let mut buf = BytesMut::with_capacity(OPCODE_SIZE + 3 + name.len());
    buf.put_u32(opcode::CLIENT_INFO);
    buf.put_u16(PROTOCOL_VERSION);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    buf.freeze()
}

/// Encode a server identification. Used by test peers.
pub fn encode_server_hello(hello: &ServerHello) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(opcode::SERVER_INFO);
    put_server_info_body(&mut buf, hello);
    buf.freeze()
}

fn put_server_info_body(buf: &mut BytesMut, hello: &ServerHello) {
    buf.put_u16(hello.protocol_version);
    put_string(buf, &hello.server_name);
}

/// Decode the server identification that completes the handshake.
///
/// Returns `Ok(None)` until the whole message is buffered. A different
/// opcode is an error and leaves the buffer untouched.
pub fn decode_server_hello(buf: &mut BytesMut) -> Result<Option<ServerHello>, ProtocolError> {
    let mut cur = &buf[..];
    need!(cur, OPCODE_SIZE);
    let op = cur.get_u32();
    if op != opcode::SERVER_INFO {
        return Err(ProtocolError::UnexpectedMessage {
            expected: opcode::SERVER_INFO,
            actual: op,
        });
    }
    let Some(hello) = parse_server_info_body(&mut cur) else {
        return Ok(None);
    };
    let consumed = buf.len() - cur.remaining();
    buf.advance(consumed);
    Ok(Some(hello))
}

fn parse_server_info_body(cur: &mut &[u8]) -> Option<ServerHello> {
    if cur.remaining() < 2 {
        return None;
    }
    let protocol_version = cur.get_u16();
    let server_name = get_string(cur)?;
    Some(ServerHello {
        protocol_version,
        server_name,
    })
}

/// Encode the fixed "slot no longer in use" message.
pub fn encode_stop_demux(slot: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(STOP_DEMUX_SIZE);
    buf.put_slice(&CA_STOP_TAG);
    buf.put_u8(0x83);
    buf.put_u8(0x02);
    buf.put_u8(0x00);
    buf.put_u8(slot);
    buf.freeze()
}

/// Encode one captured section for a running filter.
pub fn encode_filter_section(slot: u8, filter_index: u8, section: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(OPCODE_SIZE + 2 + section.len());
    buf.put_u32(opcode::FILTER_DATA);
    buf.put_u8(slot);
    buf.put_u8(filter_index);
    buf.put_slice(section);
    buf.freeze()
}

fn put_demux_descriptor(buf: &mut BytesMut, slot: u8) {
    buf.put_u8(DEMUX_DESCRIPTOR_TAG);
    buf.put_u8(0x02);
    buf.put_u8(slot); // demux index
    buf.put_u8(slot); // adapter index
}

/// Build a CA_PMT from a raw PMT section.
///
/// The section's program info is extended by the "ok descrambling" command
/// byte and a demux descriptor naming `slot`; everything after the section's own
/// program_info_length field is copied up to (not including) the CRC.
/// The result is `length_field + 6` bytes long, where
/// `length_field = section_length - 2`.
pub fn encode_ca_pmt(
    list_management: ListManagement,
    pmt: &[u8],
    slot: u8,
) -> Result<Bytes, ProtocolError> {
    let total_len = section_total_len(pmt)?;
    if total_len > MAX_PMT_SIZE {
        return Err(ProtocolError::PmtTooLarge(total_len, MAX_PMT_SIZE));
    }
    if total_len < PMT_MIN_LEN {
        return Err(ProtocolError::MalformedSection("section_length too small"));
    }
    if pmt.len() < total_len {
        return Err(ProtocolError::TruncatedSection {
            expected: total_len,
            actual: pmt.len(),
        });
    }

    let program_info_len =
        (((pmt[10] & 0x0F) as usize) << 8) + pmt[11] as usize + INJECTED_PROGRAM_INFO;
    let length_field = total_len - 5;

    let mut buf = BytesMut::with_capacity(length_field + 6);
    buf.put_slice(&CA_PMT_TAG);
    buf.put_u16(length_field as u16);
    buf.put_u8(list_management.into());
    buf.put_slice(&pmt[3..5]);
    buf.put_u8(0x00);
    buf.put_u16(program_info_len as u16);
    buf.put_u8(CMD_OK_DESCRAMBLING);
    put_demux_descriptor(&mut buf, slot);
    buf.put_slice(&pmt[12..total_len - 4]);

    debug_assert_eq!(buf.len(), length_field + 6);
    Ok(buf.freeze())
}

/// Build a CA_PMT for a slot whose PMT has not been seen yet.
///
/// Carries only the injected command byte and demux descriptor.
pub fn encode_ca_pmt_placeholder(
    list_management: ListManagement,
    program_number: u16,
    slot: u8,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(PLACEHOLDER_LENGTH as usize + 6);
    buf.put_slice(&CA_PMT_TAG);
    buf.put_u16(PLACEHOLDER_LENGTH);
    buf.put_u8(list_management.into());
    buf.put_u16(program_number);
    buf.put_u8(0x00);
    buf.put_u16(INJECTED_PROGRAM_INFO as u16);
    buf.put_u8(CMD_OK_DESCRAMBLING);
    put_demux_descriptor(&mut buf, slot);
    buf.freeze()
}

/// Encode a request the way the server sends it. Used by test peers.
pub fn encode_request(request: &Request) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(request.opcode());

    match request {
        Request::SetPid { slot, pid, index } => {
            buf.put_u8(*slot);
            buf.put_u32(*pid);
            buf.put_i32(*index);
        }
        Request::SetDescrambler {
            slot,
            index,
            parity,
            control_word,
        } => {
            buf.put_u8(*slot);
            buf.put_u32(*index);
            buf.put_u32(*parity);
            buf.put_slice(control_word);
        }
        Request::SetFilter {
            slot,
            filter_index,
            filter,
        } => {
            buf.put_u8(*slot);
            buf.put_u8(*filter_index);
            buf.put_u16(filter.pid);
            buf.put_slice(&filter.filter);
            buf.put_slice(&filter.mask);
        }
        Request::StopFilter {
            slot,
            filter_index,
            pid,
            flags,
        } => {
            buf.put_u8(*slot);
            buf.put_u8(*filter_index);
            buf.put_u16(*pid);
            buf.put_u8(*flags);
        }
        Request::EcmInfo { slot, info } => {
            buf.put_u8(*slot);
            buf.put_u16(info.service_id);
            buf.put_u16(info.caid);
            buf.put_u16(info.pid);
            buf.put_u32(info.provider_id);
            buf.put_u32(info.ecm_time_ms);
            put_string(&mut buf, &info.card_system);
            put_string(&mut buf, &info.reader);
            put_string(&mut buf, &info.source);
            put_string(&mut buf, &info.protocol);
            buf.put_u8(info.hops);
        }
        Request::ServerInfo(hello) => {
            put_server_info_body(&mut buf, hello);
        }
    }

    buf.freeze()
}

/// Try to decode one request from the front of `buf`.
///
/// Returns `Ok(None)` if the request is not complete yet; nothing is consumed
/// in that case. An unknown opcode is reported without consuming, see
/// [`skip_to_next_opcode`].
pub fn decode_request(buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
    let mut cur = &buf[..];
    let Some(request) = parse_request(&mut cur)? else {
        return Ok(None);
    };
    let consumed = buf.len() - cur.remaining();
    buf.advance(consumed);
    Ok(Some(request))
}

fn parse_request(cur: &mut &[u8]) -> Result<Option<Request>, ProtocolError> {
    need!(cur, OPCODE_SIZE);
    let op = cur.get_u32();

    if op == opcode::SERVER_INFO {
        return Ok(parse_server_info_body(cur).map(Request::ServerInfo));
    }
    if !opcode::is_inbound(op) {
        return Err(ProtocolError::UnknownOpcode(op));
    }

    need!(cur, 1);
    let slot = cur.get_u8();

    let request = match op {
        opcode::CA_SET_PID => {
            need!(cur, 8);
            let pid = cur.get_u32();
            let index = cur.get_i32();
            Request::SetPid { slot, pid, index }
        }
        opcode::CA_SET_DESCR => {
            need!(cur, 16);
            let index = cur.get_u32();
            let parity = cur.get_u32();
            let mut control_word = [0u8; 8];
            cur.copy_to_slice(&mut control_word);
            Request::SetDescrambler {
                slot,
                index,
                parity,
                control_word,
            }
        }
        opcode::DMX_SET_FILTER => {
            need!(cur, 3 + 2 * FILTER_LEN);
            let filter_index = cur.get_u8();
            let pid = cur.get_u16();
            let mut filter = [0u8; FILTER_LEN];
            let mut mask = [0u8; FILTER_LEN];
            cur.copy_to_slice(&mut filter);
            cur.copy_to_slice(&mut mask);
            Request::SetFilter {
                slot,
                filter_index,
                filter: SectionFilter { pid, filter, mask },
            }
        }
        opcode::DMX_STOP => {
            need!(cur, 4);
            let filter_index = cur.get_u8();
            let pid = cur.get_u16();
            let flags = cur.get_u8();
            Request::StopFilter {
                slot,
                filter_index,
                pid,
                flags,
            }
        }
        opcode::ECM_INFO => {
            need!(cur, 14);
            let service_id = cur.get_u16();
            let caid = cur.get_u16();
            let pid = cur.get_u16();
            let provider_id = cur.get_u32();
            let ecm_time_ms = cur.get_u32();
            let Some(card_system) = get_string(cur) else { return Ok(None) };
            let Some(reader) = get_string(cur) else { return Ok(None) };
            let Some(source) = get_string(cur) else { return Ok(None) };
            let Some(protocol) = get_string(cur) else { return Ok(None) };
            need!(cur, 1);
            let hops = cur.get_u8();
            Request::EcmInfo {
                slot,
                info: EcmInfo {
                    service_id,
                    caid,
                    pid,
                    provider_id,
                    ecm_time_ms,
                    card_system,
                    reader,
                    source,
                    protocol,
                    hops,
                },
            }
        }
        _ => return Err(ProtocolError::UnknownOpcode(op)),
    };

    Ok(Some(request))
}

/// Discard bytes until the buffer starts with a known inbound opcode.
///
/// Always drops at least one byte. A tail shorter than an opcode is kept,
/// since it may be the start of the next request. Returns the number of
/// bytes dropped.
pub fn skip_to_next_opcode(buf: &mut BytesMut) -> usize {
    let mut skipped = 0;
    if !buf.is_empty() {
        buf.advance(1);
        skipped += 1;
    }
    while buf.len() >= OPCODE_SIZE {
        let op = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if opcode::is_inbound(op) {
            break;
        }
        buf.advance(1);
        skipped += 1;
    }
    skipped
}

fn put_string(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&bytes[..len]);
}

fn get_string(cur: &mut &[u8]) -> Option<String> {
    if cur.remaining() < 1 {
        return None;
    }
    let len = cur.get_u8() as usize;
    if cur.remaining() < len {
        return None;
    }
    let s = String::from_utf8_lossy(&cur[..len]).into_owned();
    cur.advance(len);
    Some(s)
}
