use std::fmt;
use std::io;

/// Mirrors the NACK error-code table on the wire. Numeric values are the
/// actual byte sent in a NACK's data field, so this enum must not be
/// reordered without updating the protocol documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DbgError {
    OutOfMemory = 1,
    InvalidAddress = 2,
    UnknownBreakpoint = 3,
    LoadFailed = 4,
    SpawnFailed = 5,
    UnknownStopReason = 6,
    NoTrap = 7,
    RunFailed = 8,
    BadData = 9,
    OpenLibFailed = 10,
    /// Not in the original wire table; assigned here to resolve the
    /// "wrong state" open question (SPEC_FULL.md §9).
    InvalidState = 11,
}

impl DbgError {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<DbgError> {
        use DbgError::*;
        Some(match code {
            1 => OutOfMemory,
            2 => InvalidAddress,
            3 => UnknownBreakpoint,
            4 => LoadFailed,
            5 => SpawnFailed,
            6 => UnknownStopReason,
            7 => NoTrap,
            8 => RunFailed,
            9 => BadData,
            10 => OpenLibFailed,
            11 => InvalidState,
            _ => return None,
        })
    }
}

impl fmt::Display for DbgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DbgError::OutOfMemory => "out of memory",
            DbgError::InvalidAddress => "invalid address",
            DbgError::UnknownBreakpoint => "unknown breakpoint",
            DbgError::LoadFailed => "could not load target",
            DbgError::SpawnFailed => "could not spawn target task",
            DbgError::UnknownStopReason => "unknown stop reason",
            DbgError::NoTrap => "no free trap vector",
            DbgError::RunFailed => "could not run command",
            DbgError::BadData => "malformed message data",
            DbgError::OpenLibFailed => "could not open library",
            DbgError::InvalidState => "target in wrong state for command",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DbgError {}

/// Errors from the framed byte-transport layer (C1), kept distinct from
/// `DbgError` because they can occur before any `ProtoMessage` exists to
/// carry a NACK code. Converted to `DbgError::BadData` at the protocol
/// boundary.
#[derive(Debug)]
pub enum TransportError {
    Overflow,
    BadEscape,
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Overflow => write!(f, "frame exceeds maximum size"),
            TransportError::BadEscape => write!(f, "invalid SLIP escape sequence"),
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<TransportError> for DbgError {
    fn from(_: TransportError) -> Self {
        DbgError::BadData
    }
}

pub type DbgResult<T> = Result<T, DbgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for code in 1u8..=11 {
            let err = DbgError::from_code(code).expect("code should be known");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn unknown_code_is_none() {
        assert!(DbgError::from_code(0).is_none());
        assert!(DbgError::from_code(12).is_none());
    }

    #[test]
    fn invalid_state_is_eleven() {
        assert_eq!(DbgError::InvalidState.code(), 11);
    }
}
