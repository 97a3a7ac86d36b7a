//! Typed debug events.

use crate::breakpoint::BreakpointKey;
use crate::native::{Address, Pid, Tid};

mod exception;
mod factory;

pub use self::exception::{AccessType, EXCEPTION_NONCONTINUABLE, ExceptionCode, ExceptionInfo};
pub use self::factory::EventFactory;

/// Status given to the OS when resuming the thread that reported an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStatus {
    /// `DBG_CONTINUE`: the event was handled by the debugger.
    Continue,
    /// `DBG_EXCEPTION_HANDLED`.
    ExceptionHandled,
    /// `DBG_EXCEPTION_NOT_HANDLED`: the debuggee gets to handle the exception.
    ExceptionNotHandled,
    /// Any other raw status.
    Other(u32),
}

impl ContinueStatus {
    /// Raw value of `DBG_CONTINUE`.
    pub const DBG_CONTINUE: u32 = 0x0001_0002;
    /// Raw value of `DBG_EXCEPTION_HANDLED`.
    pub const DBG_EXCEPTION_HANDLED: u32 = 0x0001_0001;
    /// Raw value of `DBG_EXCEPTION_NOT_HANDLED`.
    pub const DBG_EXCEPTION_NOT_HANDLED: u32 = 0x8001_0001;

    /// Raw status code.
    pub const fn code(self) -> u32 {
        match self {
            Self::Continue => Self::DBG_CONTINUE,
            Self::ExceptionHandled => Self::DBG_EXCEPTION_HANDLED,
            Self::ExceptionNotHandled => Self::DBG_EXCEPTION_NOT_HANDLED,
            Self::Other(code) => code,
        }
    }

    /// Maps a raw status code.
    pub const fn from_code(code: u32) -> Self {
        match code {
            Self::DBG_CONTINUE => Self::Continue,
            Self::DBG_EXCEPTION_HANDLED => Self::ExceptionHandled,
            Self::DBG_EXCEPTION_NOT_HANDLED => Self::ExceptionNotHandled,
            other => Self::Other(other),
        }
    }
}

/// Kind-specific part of an [Event].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// An exception was raised.
    Exception(ExceptionInfo),
    /// A thread was created.
    CreateThread {
        /// Start address of the thread.
        start_address: Address,
        /// Thread environment block.
        teb: Address,
    },
    /// A process was created or attached to.
    CreateProcess {
        /// Base address of the main image.
        image_base: Address,
        /// Start address of the main thread.
        start_address: Address,
        /// Thread environment block of the main thread.
        teb: Address,
        /// Path of the main image, if known.
        file_name: Option<String>,
    },
    /// A thread exited.
    ExitThread {
        /// Exit code.
        exit_code: u32,
    },
    /// A process exited.
    ExitProcess {
        /// Exit code.
        exit_code: u32,
    },
    /// A DLL was loaded.
    LoadDll {
        /// Base address.
        base: Address,
        /// Path, if known.
        file_name: Option<String>,
    },
    /// A DLL was unloaded.
    UnloadDll {
        /// Base address.
        base: Address,
    },
    /// A debug string was output.
    OutputDebugString {
        /// Address of the string in the debuggee.
        address: Address,
        /// Length of the string, in characters.
        length: u32,
        /// Whether the string is UTF-16.
        unicode: bool,
    },
    /// A system debugging error occurred.
    Rip {
        /// Error code.
        error: u32,
        /// Error kind.
        kind: u32,
    },
    /// Event code unknown to this crate, or inconsistent with its payload.
    Unknown {
        /// Raw event code.
        code: u32,
    },
}

/// A debug event reported by a debuggee thread.
///
/// Everything but the continue status and the forwarding flag is fixed when
/// the event is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pid: Pid,
    tid: Tid,
    code: u32,
    kind: EventKind,
    status: ContinueStatus,
    breakpoint: Option<BreakpointKey>,
    forward: bool,
}

impl Event {
    pub(crate) fn new(pid: Pid, tid: Tid, code: u32, kind: EventKind) -> Self {
        let status = match kind {
            EventKind::Exception(_) => ContinueStatus::ExceptionNotHandled,
            _ => ContinueStatus::Continue,
        };

        Self {
            pid,
            tid,
            code,
            kind,
            status,
            breakpoint: None,
            forward: false,
        }
    }

    /// Process that reported the event.
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Thread that reported the event.
    pub const fn tid(&self) -> Tid {
        self.tid
    }

    /// Raw event code.
    pub const fn code(&self) -> u32 {
        self.code
    }

    /// Kind-specific information.
    pub const fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Exception information, for exception events.
    pub const fn exception(&self) -> Option<&ExceptionInfo> {
        match &self.kind {
            EventKind::Exception(info) => Some(info),
            _ => None,
        }
    }

    /// Exception code, for exception events.
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        self.exception().map(|info| info.code)
    }

    /// Status the thread is resumed with.
    pub const fn continue_status(&self) -> ContinueStatus {
        self.status
    }

    /// Sets the status the thread is resumed with.
    pub const fn set_continue_status(&mut self, status: ContinueStatus) {
        self.status = status;
    }

    /// Breakpoint that claimed this event, if any.
    pub const fn breakpoint(&self) -> Option<BreakpointKey> {
        self.breakpoint
    }

    pub(crate) const fn claim(&mut self, key: BreakpointKey) {
        self.breakpoint = Some(key);
        self.status = ContinueStatus::Continue;
    }

    /// Asks for the event to also reach the event handler after the
    /// breakpoint action that claimed it returns.
    pub const fn forward(&mut self) {
        self.forward = true;
    }

    /// Returns whether a breakpoint action asked for this event to reach the
    /// event handler.
    pub const fn is_forwarded(&self) -> bool {
        self.forward
    }

    /// Short name of the event.
    pub const fn name(&self) -> &'static str {
        match &self.kind {
            EventKind::Exception(info) => info.code.name(),
            EventKind::CreateThread { .. } => "CREATE_THREAD_DEBUG_EVENT",
            EventKind::CreateProcess { .. } => "CREATE_PROCESS_DEBUG_EVENT",
            EventKind::ExitThread { .. } => "EXIT_THREAD_DEBUG_EVENT",
            EventKind::ExitProcess { .. } => "EXIT_PROCESS_DEBUG_EVENT",
            EventKind::LoadDll { .. } => "LOAD_DLL_DEBUG_EVENT",
            EventKind::UnloadDll { .. } => "UNLOAD_DLL_DEBUG_EVENT",
            EventKind::OutputDebugString { .. } => "OUTPUT_DEBUG_STRING_EVENT",
            EventKind::Rip { .. } => "RIP_EVENT",
            EventKind::Unknown { .. } => "UNKNOWN_DEBUG_EVENT",
        }
    }

    /// Human-readable description of the event.
    pub const fn description(&self) -> &'static str {
        match &self.kind {
            EventKind::Exception(info) => info.code.description(),
            EventKind::CreateThread { .. } => "Thread creation event",
            EventKind::CreateProcess { .. } => "Process creation event",
            EventKind::ExitThread { .. } => "Thread termination event",
            EventKind::ExitProcess { .. } => "Process termination event",
            EventKind::LoadDll { .. } => "Module load event",
            EventKind::UnloadDll { .. } => "Module unload event",
            EventKind::OutputDebugString { .. } => "Debug string output event",
            EventKind::Rip { .. } => "RIP event",
            EventKind::Unknown { .. } => "Unknown event",
        }
    }
}
