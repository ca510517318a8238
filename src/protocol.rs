//! Host protocol (C3): sequence-numbered request/response dispatch over
//! the framed transport. Grounded on cwdbg `server/server.c`
//! (`process_remote_commands`, `is_correct_target_state_for_command`).

use std::io::{Read, Write};

use crate::error::{DbgError, TransportError};
use crate::target::{TargetInfo, TargetState};
use crate::transport;
use crate::wire::{self, MsgKind, ProtoMessage};

/// INIT, RUN, QUIT require the target is NOT running; CONT, STEP, KILL
/// require it IS running. Every other message kind is unrestricted.
pub fn is_valid_state_for(kind: MsgKind, state: TargetState) -> bool {
    let running = state.contains(TargetState::RUNNING);
    match kind {
        MsgKind::Init | MsgKind::Run | MsgKind::Quit => !running,
        MsgKind::Cont | MsgKind::Step | MsgKind::Kill => running,
        _ => true,
    }
}

/// Fatal protocol errors end the session; there is no recovery (the
/// host and server may have lost synchronization).
#[derive(Debug)]
pub enum ProtocolError {
    SequenceMismatch { expected: u16, got: u16 },
    UnacknowledgedStop,
    Transport(TransportError),
}

impl From<TransportError> for ProtocolError {
    fn from(e: TransportError) -> Self {
        ProtocolError::Transport(e)
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::SequenceMismatch { expected, got } => {
                write!(f, "sequence number mismatch: expected {}, got {}", expected, got)
            }
            ProtocolError::UnacknowledgedStop => {
                write!(f, "host did not acknowledge TARGET_STOPPED")
            }
            ProtocolError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub struct HostConnection<S> {
    stream: S,
    expected_seq_num: u16,
    current_seq_num: u16,
}

impl<S: Read + Write> HostConnection<S> {
    pub fn new(stream: S) -> HostConnection<S> {
        HostConnection {
            stream,
            expected_seq_num: 0,
            current_seq_num: 0,
        }
    }

    fn send(&mut self, msg: &ProtoMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode().map_err(ProtocolError::Transport)?;
        transport::send_frame(&mut self.stream, &encoded).map_err(ProtocolError::Transport)
    }

    fn recv(&mut self) -> Result<ProtoMessage, ProtocolError> {
        let frame = transport::recv_frame(&mut self.stream).map_err(ProtocolError::Transport)?;
        ProtoMessage::decode(&frame).map_err(ProtocolError::Transport)
    }

    /// Reads the next request, enforcing the sequence-number rule
    /// (SPEC_FULL.md §4.3): INIT realigns `expected_seq_num`; every
    /// other request must match it exactly.
    pub fn recv_request(&mut self) -> Result<ProtoMessage, ProtocolError> {
        let msg = self.recv()?;
        if msg.kind == MsgKind::Init {
            self.expected_seq_num = msg.seq_num;
        } else if msg.seq_num != self.expected_seq_num {
            return Err(ProtocolError::SequenceMismatch {
                expected: self.expected_seq_num,
                got: msg.seq_num,
            });
        }
        self.current_seq_num = msg.seq_num;
        Ok(msg)
    }

    pub fn send_ack(&mut self, data: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = ProtoMessage::new(self.current_seq_num, MsgKind::Ack, data);
        self.send(&msg)?;
        self.expected_seq_num = self.expected_seq_num.wrapping_add(1);
        Ok(())
    }

    pub fn send_nack(&mut self, error: DbgError) -> Result<(), ProtocolError> {
        let msg = ProtoMessage::new(self.current_seq_num, MsgKind::Nack, vec![error.code()]);
        self.send(&msg)?;
        self.expected_seq_num = self.expected_seq_num.wrapping_add(1);
        Ok(())
    }

    /// Sends an unsolicited `TARGET_STOPPED` and blocks until the host
    /// acknowledges it at the same sequence number. No further command
    /// may be processed until this returns (SPEC_FULL.md §4.3).
    pub fn send_target_stopped(&mut self, info: &TargetInfo) -> Result<(), ProtocolError> {
        let seq = self.expected_seq_num;
        let msg = ProtoMessage::new(seq, MsgKind::TargetStopped, encode_target_info(info));
        self.send(&msg)?;

        let reply = self.recv()?;
        if reply.kind != MsgKind::Ack || reply.seq_num != seq {
            return Err(ProtocolError::UnacknowledgedStop);
        }
        self.expected_seq_num = self.expected_seq_num.wrapping_add(1);
        Ok(())
    }
}

/// Serializes `TargetInfo` to the fixed binary layout in SPEC_FULL.md
/// §6.1. JSON is used elsewhere (local CLI dumps, config) but the wire
/// format is packed binary, matching cwdbg's `TargetStoppedMsg`.
pub fn encode_target_info(info: &TargetInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire::MAX_TARGET_INFO_LEN);
    wire::pack_u32(&mut out, info.initial_pc);
    wire::pack_u32(&mut out, info.initial_sp);
    wire::pack_u32(&mut out, info.state);
    wire::pack_u32(&mut out, info.exit_code as u32);
    wire::pack_u32(&mut out, info.error_code);

    let ctx = &info.task_context;
    wire::pack_u32(&mut out, ctx.sp);
    wire::pack_u32(&mut out, ctx.exc_num);
    wire::pack_u16(&mut out, ctx.sr);
    wire::pack_u32(&mut out, ctx.pc);
    for d in ctx.d {
        wire::pack_u32(&mut out, d);
    }
    for a in ctx.a {
        wire::pack_u32(&mut out, a);
    }

    let mut next_bytes = info.next_instr_bytes.clone();
    next_bytes.resize(wire::NEXT_INSTR_BYTES_LEN, 0);
    out.extend_from_slice(&next_bytes);

    let mut stack_words = info.top_stack_dwords.clone();
    stack_words.resize(wire::TOP_STACK_DWORDS_LEN, 0);
    for w in stack_words {
        wire::pack_u32(&mut out, w);
    }

    match &info.bpoint {
        Some(bp) => {
            out.push(1);
            wire::pack_u32(&mut out, bp.id);
            wire::pack_u32(&mut out, bp.addr);
            wire::pack_u16(&mut out, bp.opcode);
            wire::pack_u32(&mut out, bp.hit_count);
        }
        None => out.push(0),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_bytes(msg: &ProtoMessage) -> Vec<u8> {
        transport::slip_encode(&msg.encode().unwrap()).unwrap()
    }

    #[test]
    fn state_gate_matches_spec_table() {
        let running = TargetState::RUNNING;
        let idle = TargetState::empty();
        assert!(is_valid_state_for(MsgKind::Cont, running));
        assert!(!is_valid_state_for(MsgKind::Cont, idle));
        assert!(is_valid_state_for(MsgKind::Run, idle));
        assert!(!is_valid_state_for(MsgKind::Run, running));
        assert!(is_valid_state_for(MsgKind::SetBpoint, running));
        assert!(is_valid_state_for(MsgKind::SetBpoint, idle));
    }

    #[test]
    fn handshake_realigns_sequence_number() {
        let mut input = Vec::new();
        let init = ProtoMessage::new(0x0001, MsgKind::Init, vec![]);
        input.extend_from_slice(&frame_bytes(&init));
        let mut conn = HostConnection::new(Cursor::new(input));
        let req = conn.recv_request().unwrap();
        assert_eq!(req.seq_num, 1);
        assert_eq!(conn.expected_seq_num, 1);
    }

    #[test]
    fn mismatched_sequence_is_fatal() {
        let mut input = Vec::new();
        let run = ProtoMessage::new(0x0005, MsgKind::Run, vec![]);
        input.extend_from_slice(&frame_bytes(&run));
        let mut conn: HostConnection<Cursor<Vec<u8>>> = HostConnection::new(Cursor::new(input));
        conn.expected_seq_num = 1;
        assert!(matches!(
            conn.recv_request(),
            Err(ProtocolError::SequenceMismatch { expected: 1, got: 5 })
        ));
    }
}
