//! Opaque collaborators (SPEC_FULL.md §6.4): executable loading and
//! disassembly are out of scope for this design. Expressed as narrow
//! traits so the engine can be exercised without the real Amiga
//! loader/disassembler present.

use crate::error::DbgError;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadHandle(pub u32);

/// The loaded image's code segment, owned by `Target` after `Loader::load`.
pub struct LoadedImage {
    pub entry_pc: u32,
    pub initial_sp: u32,
    pub code: Vec<u8>,
    pub handle: UnloadHandle,
}

impl LoadedImage {
    pub fn read_u16(&self, addr: u32) -> Option<u16> {
        let offset = addr.checked_sub(self.entry_pc)? as usize;
        let bytes = self.code.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), DbgError> {
        let offset = addr
            .checked_sub(self.entry_pc)
            .ok_or(DbgError::InvalidAddress)? as usize;
        if offset + 2 > self.code.len() {
            return Err(DbgError::InvalidAddress);
        }
        let bytes = value.to_be_bytes();
        self.code[offset] = bytes[0];
        self.code[offset + 1] = bytes[1];
        Ok(())
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> Result<&[u8], DbgError> {
        let offset = addr
            .checked_sub(self.entry_pc)
            .ok_or(DbgError::InvalidAddress)? as usize;
        self.code
            .get(offset..offset + len)
            .ok_or(DbgError::InvalidAddress)
    }

    /// Reads up to `len` bytes at `addr`, zero-filling whatever falls
    /// outside the code segment instead of failing outright. Used for the
    /// informational next-instructions window in `TargetInfo`, where a
    /// short read near the end of the segment should still show what is
    /// available rather than nothing at all.
    pub fn read_bytes_padded(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        if let Some(offset) = addr.checked_sub(self.entry_pc) {
            let offset = offset as usize;
            let end = offset.saturating_add(len).min(self.code.len());
            if offset < end {
                out[..end - offset].copy_from_slice(&self.code[offset..end]);
            }
        }
        out
    }

    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), DbgError> {
        let offset = addr
            .checked_sub(self.entry_pc)
            .ok_or(DbgError::InvalidAddress)? as usize;
        if offset + data.len() > self.code.len() {
            return Err(DbgError::InvalidAddress);
        }
        self.code[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

pub trait Loader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedImage, DbgError>;
    fn unload(&self, handle: UnloadHandle);
}

pub trait Disassembler: Send + Sync {
    /// Disassembles one instruction at `pc` from `code`. Returns the
    /// rendered text and the number of bytes consumed.
    fn disassemble(&self, code: &[u8], pc: u32) -> (String, usize);
}

/// Deterministic stand-in used by tests and by the CLI when no native
/// loader is configured. Treats the whole file as the code segment
/// starting at a fixed entry point.
pub struct FakeLoader {
    pub entry_pc: u32,
    pub initial_sp: u32,
}

impl Default for FakeLoader {
    fn default() -> FakeLoader {
        FakeLoader {
            entry_pc: 0x1000,
            initial_sp: 0x8000,
        }
    }
}

impl Loader for FakeLoader {
    fn load(&self, path: &Path) -> Result<LoadedImage, DbgError> {
        let code = std::fs::read(path).map_err(|_| DbgError::LoadFailed)?;
        Ok(LoadedImage {
            entry_pc: self.entry_pc,
            initial_sp: self.initial_sp,
            code,
            handle: UnloadHandle(1),
        })
    }

    fn unload(&self, _handle: UnloadHandle) {}
}

/// Loads a pre-built in-memory image without touching the filesystem;
/// used directly by unit tests that construct a code byte sequence by
/// hand (e.g. the `nop;nop;nop;trap` scenarios).
pub struct InMemoryLoader {
    pub entry_pc: u32,
    pub initial_sp: u32,
    pub code: Vec<u8>,
}

impl Loader for InMemoryLoader {
    fn load(&self, _path: &Path) -> Result<LoadedImage, DbgError> {
        Ok(LoadedImage {
            entry_pc: self.entry_pc,
            initial_sp: self.initial_sp,
            code: self.code.clone(),
            handle: UnloadHandle(1),
        })
    }

    fn unload(&self, _handle: UnloadHandle) {}
}

/// Disassembler that never decodes real opcodes; reports every
/// instruction as a fixed-width placeholder. Sufficient for exercising
/// the console command loop without a real 68k disassembler.
pub struct FakeDisassembler;

impl Disassembler for FakeDisassembler {
    fn disassemble(&self, code: &[u8], pc: u32) -> (String, usize) {
        let word = code
            .get(0..2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .unwrap_or(0);
        (format!("dc.w ${:04x} ; @{:08x}", word, pc), 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_image_read_write_round_trip() {
        let mut img = LoadedImage {
            entry_pc: 0x1000,
            initial_sp: 0x8000,
            code: vec![0x00, 0x00, 0x00, 0x00],
            handle: UnloadHandle(1),
        };
        img.write_u16(0x1000, 0x4E40).unwrap();
        assert_eq!(img.read_u16(0x1000).unwrap(), 0x4E40);
    }

    #[test]
    fn out_of_bounds_address_is_invalid() {
        let img = LoadedImage {
            entry_pc: 0x1000,
            initial_sp: 0x8000,
            code: vec![0, 0],
            handle: UnloadHandle(1),
        };
        assert!(img.read_u16(0x2000).is_none());
    }
}
