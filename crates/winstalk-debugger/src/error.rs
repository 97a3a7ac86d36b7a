use winstalk_engine::native::{NativeError, Pid, Tid};

/// `ERROR_INVALID_HANDLE`
const ERROR_INVALID_HANDLE: u32 = 6;

/// Facility of HRESULTs wrapping a Win32 error code.
const FACILITY_WIN32: u32 = 7;

/// Error type of this crate.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A Win32 API call failed.
    #[error("{call}: OS error {code}")]
    Os {
        /// Name of the failing API.
        call: &'static str,
        /// Win32 error code.
        code: u32,
    },

    /// The process is not debugged (anymore).
    #[error("unknown process {0}")]
    UnknownProcess(Pid),

    /// The thread is not part of a debugged process (anymore).
    #[error("unknown thread {0}")]
    UnknownThread(Tid),

    /// A memory access stopped short.
    #[error("memory read/write {0} bytes instead of {1}")]
    PartialMemOp(usize, usize),

    /// A string passed to the OS contains a nul character.
    #[error("interior nul character in {0}")]
    InteriorNul(&'static str),
}

impl Error {
    /// Builds an OS error from the HRESULT reported by a failing API.
    pub(crate) const fn from_hresult(call: &'static str, hresult: i32) -> Self {
        Self::Os {
            call,
            code: win32_code(hresult),
        }
    }
}

impl From<Error> for NativeError {
    fn from(err: Error) -> Self {
        match err {
            Error::UnknownProcess(_) | Error::UnknownThread(_) => Self::TargetGone,
            Error::Os {
                code: ERROR_INVALID_HANDLE,
                ..
            } => Self::TargetGone,
            Error::Os { code, .. } => Self::Os(code),
            // ERROR_PARTIAL_COPY
            Error::PartialMemOp(..) => Self::Os(299),
            // ERROR_INVALID_PARAMETER
            Error::InteriorNul(_) => Self::Os(87),
        }
    }
}

/// Extracts the Win32 error code wrapped in an HRESULT.
///
/// HRESULTs of other facilities are returned as is.
pub(crate) const fn win32_code(hresult: i32) -> u32 {
    let hresult = hresult as u32;

    if (hresult >> 16) & 0x1fff == FACILITY_WIN32 && hresult & 0x8000_0000 != 0 {
        hresult & 0xffff
    } else {
        hresult
    }
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
