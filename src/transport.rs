//! Framed byte transport (C1): SLIP-style encode/decode over a serial
//! byte stream. Grounded on cwdbg's `serio.c` (`slip_encode_buffer` /
//! `slip_decode_buffer`).

use crate::error::TransportError;

pub const SLIP_END: u8 = 0xC0;
pub const SLIP_ESC: u8 = 0xDB;
pub const SLIP_ESCAPED_END: u8 = 0xDC;
pub const SLIP_ESCAPED_ESC: u8 = 0xDD;

pub const MAX_FRAME_SIZE: usize = 512;

/// Escapes `data` and appends the frame terminator. Fails if the
/// encoded form would exceed `MAX_FRAME_SIZE`.
pub fn slip_encode(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(data.len() + 2);
    for &b in data {
        match b {
            SLIP_END => {
                out.push(SLIP_ESC);
                out.push(SLIP_ESCAPED_END);
            }
            SLIP_ESC => {
                out.push(SLIP_ESC);
                out.push(SLIP_ESCAPED_ESC);
            }
            _ => out.push(b),
        }
        if out.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Overflow);
        }
    }
    out.push(SLIP_END);
    if out.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Overflow);
    }
    Ok(out)
}

/// Decodes one already-delimited frame (terminator already stripped by
/// the caller's reader). Fails on an escape byte not followed by one of
/// the two escaped forms.
pub fn slip_decode(frame: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(frame.len());
    let mut iter = frame.iter().copied();
    while let Some(b) = iter.next() {
        if b == SLIP_ESC {
            match iter.next() {
                Some(SLIP_ESCAPED_END) => out.push(SLIP_END),
                Some(SLIP_ESCAPED_ESC) => out.push(SLIP_ESC),
                _ => return Err(TransportError::BadEscape),
            }
        } else {
            out.push(b);
        }
        if out.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Overflow);
        }
    }
    Ok(out)
}

/// Reads bytes from `reader` up to and including the next `SLIP_END`,
/// returning the decoded payload (terminator stripped, not included).
/// Bytes seen before the first frame on a fresh connection are the
/// caller's responsibility to discard (resync per SPEC_FULL.md §4.1);
/// this function just reads one frame's worth.
pub fn recv_frame<R: std::io::Read>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }
        if byte[0] == SLIP_END {
            break;
        }
        raw.push(byte[0]);
        if raw.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Overflow);
        }
    }
    slip_decode(&raw)
}

pub fn send_frame<W: std::io::Write>(writer: &mut W, data: &[u8]) -> Result<(), TransportError> {
    let encoded = slip_encode(data)?;
    writer.write_all(&encoded)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_plain_bytes() {
        let data = vec![1, 2, 3, 4, 5];
        let encoded = slip_encode(&data).unwrap();
        let payload = &encoded[..encoded.len() - 1];
        assert_eq!(slip_decode(payload).unwrap(), data);
    }

    #[test]
    fn round_trip_with_escapes() {
        let data = vec![SLIP_END, 0x01, SLIP_ESC, 0x02, SLIP_END, SLIP_ESC];
        let encoded = slip_encode(&data).unwrap();
        let payload = &encoded[..encoded.len() - 1];
        assert_eq!(slip_decode(payload).unwrap(), data);
    }

    #[test]
    fn empty_frame_decodes_empty() {
        assert_eq!(slip_decode(&[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn bad_escape_is_error() {
        let bad = vec![SLIP_ESC, 0x42];
        assert!(matches!(slip_decode(&bad), Err(TransportError::BadEscape)));
    }

    #[test]
    fn recv_frame_reads_one_delimited_frame() {
        let mut stream = Cursor::new(vec![0x01, 0x02, SLIP_END, 0x03, SLIP_END]);
        let first = recv_frame(&mut stream).unwrap();
        assert_eq!(first, vec![0x01, 0x02]);
        let second = recv_frame(&mut stream).unwrap();
        assert_eq!(second, vec![0x03]);
    }

    #[test]
    fn send_frame_terminates_and_escapes() {
        let mut buf = Vec::new();
        send_frame(&mut buf, &[SLIP_END]).unwrap();
        assert_eq!(buf, vec![SLIP_ESC, SLIP_ESCAPED_END, SLIP_END]);
    }
}
