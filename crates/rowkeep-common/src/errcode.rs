//! Client-facing status codes
//!
//! Every reply carries exactly one code. The numeric values are part of the
//! wire contract with existing clients and must not be renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    VersionMismatch = 3,
    RecordExist = 4,
    Timeout = 5,
    ServerStopped = 6,
    SqlError = 7,
    RecordNotExist = 11,
    MissingFields = 12,
    MissingTable = 13,
    MissingKey = 14,
    InvalidTable = 15,
    InvalidField = 16,
    CasNotEqual = 17,
    Other = 20,
    RecordUnchange = 21,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            3 => Self::VersionMismatch,
            4 => Self::RecordExist,
            5 => Self::Timeout,
            6 => Self::ServerStopped,
            7 => Self::SqlError,
            11 => Self::RecordNotExist,
            12 => Self::MissingFields,
            13 => Self::MissingTable,
            14 => Self::MissingKey,
            15 => Self::InvalidTable,
            16 => Self::InvalidField,
            17 => Self::CasNotEqual,
            20 => Self::Other,
            21 => Self::RecordUnchange,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::RecordExist => "RECORD_EXIST",
            Self::Timeout => "TIMEOUT",
            Self::ServerStopped => "SERVER_STOPPED",
            Self::SqlError => "SQLERROR",
            Self::RecordNotExist => "RECORD_NOTEXIST",
            Self::MissingFields => "MISSING_FIELDS",
            Self::MissingTable => "MISSING_TABLE",
            Self::MissingKey => "MISSING_KEY",
            Self::InvalidTable => "INVALID_TABLE",
            Self::InvalidField => "INVALID_FIELD",
            Self::CasNotEqual => "CAS_NOT_EQUAL",
            Self::Other => "OTHER",
            Self::RecordUnchange => "RECORD_UNCHANGE",
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
