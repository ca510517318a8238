//! Wire codec (C2): typed field pack/unpack, checksum, and the
//! `ProtoMessage` envelope. Grounded on cwdbg's `server/serio.c`
//! (`calc_checksum`) and `server/server.c` (message layout).

use static_assertions::const_assert;

use crate::error::TransportError;

pub const MAX_MSG_DATA_LEN: usize = 255;

const_assert!(MAX_MSG_DATA_LEN <= u8::MAX as usize);

/// `TargetInfo.next_instr_bytes` width on the wire: `NUM_NEXT_INSTRUCTIONS(8)
/// * MAX_INSTR_BYTES(8)`, matching cwdbg's `TargetInfo` struct.
pub const NEXT_INSTR_BYTES_LEN: usize = 64;

/// `TargetInfo.top_stack_dwords` count on the wire.
pub const TOP_STACK_DWORDS_LEN: usize = 8;

/// Fixed (non-breakpoint) portion of an encoded `TargetInfo`: 5 header
/// u32s, the `TaskContext` fields (sp, exc_num, sr, pc, d[8], a[7]),
/// `next_instr_bytes`, `top_stack_dwords`, and the breakpoint presence byte.
const TARGET_INFO_FIXED_LEN: usize =
    5 * 4 + (4 + 4 + 2 + 4 + 8 * 4 + 7 * 4) + NEXT_INSTR_BYTES_LEN + TOP_STACK_DWORDS_LEN * 4 + 1;

/// Optional trailing breakpoint record: id, addr, opcode, hit_count.
const BPOINT_RECORD_LEN: usize = 4 + 4 + 2 + 4;

/// Worst-case encoded size of a `TARGET_STOPPED` payload. Must fit inside
/// a single `ProtoMessage` data field (SPEC_FULL.md §6.1).
pub const MAX_TARGET_INFO_LEN: usize = TARGET_INFO_FIXED_LEN + BPOINT_RECORD_LEN;

const_assert!(MAX_TARGET_INFO_LEN <= MAX_MSG_DATA_LEN);

/// Message kinds, values fixed by SPEC_FULL.md §4.3 / §6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Init = 1,
    Ack = 2,
    Nack = 3,
    Run = 4,
    Quit = 5,
    Cont = 6,
    Step = 7,
    Kill = 8,
    PeekMem = 9,
    PokeMem = 10,
    SetBpoint = 11,
    ClearBpoint = 12,
    GetBaseAddress = 13,
    TargetStopped = 14,
}

impl MsgKind {
    pub fn from_u8(v: u8) -> Option<MsgKind> {
        use MsgKind::*;
        Some(match v {
            1 => Init,
            2 => Ack,
            3 => Nack,
            4 => Run,
            5 => Quit,
            6 => Cont,
            7 => Step,
            8 => Kill,
            9 => PeekMem,
            10 => PokeMem,
            11 => SetBpoint,
            12 => ClearBpoint,
            13 => GetBaseAddress,
            14 => TargetStopped,
            _ => return None,
        })
    }
}

/// One's-complement 16-bit checksum over a byte sequence, computed the
/// way IP/UDP headers are: sum all 16-bit big-endian words (the final
/// odd byte, if any, is padded with a zero low byte), fold the carries
/// out of the upper 16 bits back in, then complement.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// One complete request/response envelope (SPEC_FULL.md §6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoMessage {
    pub seq_num: u16,
    pub kind: MsgKind,
    pub data: Vec<u8>,
}

impl ProtoMessage {
    pub fn new(seq_num: u16, kind: MsgKind, data: Vec<u8>) -> ProtoMessage {
        ProtoMessage { seq_num, kind, data }
    }

    /// Serializes to `seq_num_hi, seq_num_lo, checksum_hi, checksum_lo,
    /// kind, length, data[length]`. The checksum is computed over the
    /// header-minus-checksum-field followed by the data, with the
    /// checksum field itself treated as zero, matching the IP-style
    /// convention: a receiver recomputes over the same layout with the
    /// transmitted checksum zeroed and accepts iff the result is zero's
    /// complement of what was sent (equivalently: recompute over the
    /// message with checksum zeroed and compare).
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        if self.data.len() > MAX_MSG_DATA_LEN {
            return Err(TransportError::Overflow);
        }
        let mut body = Vec::with_capacity(6 + self.data.len());
        body.extend_from_slice(&self.seq_num.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
        body.push(self.kind as u8);
        body.push(self.data.len() as u8);
        body.extend_from_slice(&self.data);

        let sum = checksum(&body);
        body[2] = (sum >> 8) as u8;
        body[3] = (sum & 0xFF) as u8;
        Ok(body)
    }

    pub fn decode(bytes: &[u8]) -> Result<ProtoMessage, TransportError> {
        if bytes.len() < 6 {
            return Err(TransportError::BadEscape);
        }
        let seq_num = u16::from_be_bytes([bytes[0], bytes[1]]);
        let recv_checksum = u16::from_be_bytes([bytes[2], bytes[3]]);
        let kind_byte = bytes[4];
        let length = bytes[5] as usize;
        if bytes.len() != 6 + length {
            return Err(TransportError::BadEscape);
        }
        let mut check_buf = bytes.to_vec();
        check_buf[2] = 0;
        check_buf[3] = 0;
        if checksum(&check_buf) != recv_checksum {
            return Err(TransportError::BadEscape);
        }
        let kind = MsgKind::from_u8(kind_byte).ok_or(TransportError::BadEscape)?;
        let data = bytes[6..].to_vec();
        Ok(ProtoMessage { seq_num, kind, data })
    }
}

/// Packs a `u32` big-endian (used for addresses, offsets, breakpoint ids).
pub fn pack_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn pack_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn unpack_u32(data: &[u8], offset: usize) -> Result<u32, TransportError> {
    let slice = data
        .get(offset..offset + 4)
        .ok_or(TransportError::Overflow)?;
    Ok(u32::from_be_bytes(slice.try_into().unwrap()))
}

pub fn unpack_u16(data: &[u8], offset: usize) -> Result<u16, TransportError> {
    let slice = data
        .get(offset..offset + 2)
        .ok_or(TransportError::Overflow)?;
    Ok(u16::from_be_bytes(slice.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_self_verifies_when_appended() {
        // Classic IP-checksum property: appending the checksum to the
        // (word-aligned) data and recomputing yields zero.
        let bytes = [0x00u8, 0x01, 0x02, 0x03];
        let sum = checksum(&bytes);
        let mut check_buf = bytes.to_vec();
        check_buf.extend_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&check_buf), 0);
    }

    #[test]
    fn checksum_handles_odd_length_with_zero_pad() {
        let bytes = [0x00u8, 0x01, 0x02];
        // Must not panic, and must differ from the checksum of the
        // same bytes with an explicit trailing zero (well-defined, just
        // documenting the pad-the-last-byte behavior is exercised).
        let a = checksum(&bytes);
        let b = checksum(&[0x00u8, 0x01, 0x02, 0x00]);
        assert_eq!(a, b);
    }

    #[test]
    fn message_encode_decode_round_trip() {
        let msg = ProtoMessage::new(0x0002, MsgKind::SetBpoint, vec![0, 0, 0, 0x18, 0, 0]);
        let encoded = msg.encode().unwrap();
        let decoded = ProtoMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn corrupted_message_fails_checksum() {
        let msg = ProtoMessage::new(1, MsgKind::Ack, vec![]);
        let mut encoded = msg.encode().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF; // length byte untouched, flip a data-adjacent area safely
        // corrupt the kind byte instead, guaranteed present and not touching length
        let kind_idx = 4;
        encoded[kind_idx] = 0xEE;
        assert!(ProtoMessage::decode(&encoded).is_err());
    }

    #[test]
    fn scenario_set_bpoint_offset_24() {
        // SPEC_FULL.md §8 scenario 2: offset=24, flags=0
        let mut data = Vec::new();
        pack_u32(&mut data, 24);
        pack_u16(&mut data, 0);
        assert_eq!(data, vec![0x00, 0x00, 0x00, 0x18, 0x00, 0x00]);
        assert_eq!(unpack_u32(&data, 0).unwrap(), 24);
        assert_eq!(unpack_u16(&data, 4).unwrap(), 0);
    }
}
