//! Native debug API the engine drives.
//!
//! [NativeDebugger] is the only way the engine touches debuggees. Raw events
//! mirror the Win32 `DEBUG_EVENT` structure.

use std::time::Duration;

use crate::command::Command;

mod context;
mod memory;

pub use self::context::{Arch, TRAP_FLAG, ThreadContext};
pub use self::memory::*;

/// Process identifier.
pub type Pid = u32;

/// Thread identifier.
pub type Tid = u32;

/// Virtual address within a debuggee.
pub type Address = u64;

/// Raw debug event code of an exception notification.
pub const EXCEPTION_DEBUG_EVENT: u32 = 1;
/// Raw debug event code of a thread creation notification.
pub const CREATE_THREAD_DEBUG_EVENT: u32 = 2;
/// Raw debug event code of a process creation notification.
pub const CREATE_PROCESS_DEBUG_EVENT: u32 = 3;
/// Raw debug event code of a thread exit notification.
pub const EXIT_THREAD_DEBUG_EVENT: u32 = 4;
/// Raw debug event code of a process exit notification.
pub const EXIT_PROCESS_DEBUG_EVENT: u32 = 5;
/// Raw debug event code of a DLL load notification.
pub const LOAD_DLL_DEBUG_EVENT: u32 = 6;
/// Raw debug event code of a DLL unload notification.
pub const UNLOAD_DLL_DEBUG_EVENT: u32 = 7;
/// Raw debug event code of a debug string output notification.
pub const OUTPUT_DEBUG_STRING_EVENT: u32 = 8;
/// Raw debug event code of a RIP (system debugging error) notification.
pub const RIP_EVENT: u32 = 9;

/// Error returned by a [NativeDebugger].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeError {
    /// The target process or thread no longer exists.
    #[error("target process or thread is gone")]
    TargetGone,

    /// The underlying OS call failed with the given error code.
    #[error("OS error {0}")]
    Os(u32),
}

/// One debug notification, as read from the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDebugEvent {
    /// Raw event code (`*_DEBUG_EVENT`).
    pub code: u32,

    /// Process that generated the event.
    pub process_id: Pid,

    /// Thread that generated the event.
    pub thread_id: Tid,

    /// Event-specific information.
    pub payload: RawPayload,
}

/// Event-specific part of a [RawDebugEvent].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    /// An exception was raised in the debuggee.
    Exception {
        /// Exception record.
        record: RawExceptionRecord,
        /// Non-zero if the debugger gets the first chance to handle it.
        first_chance: u32,
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
    /// A thread was created.
    CreateThread {
        /// Start address of the thread.
        start_address: Address,
        /// Thread environment block.
        teb: Address,
    },
    /// A thread exited.
    ExitThread {
        /// Exit code of the thread.
        exit_code: u32,
    },
    /// A process exited.
    ExitProcess {
        /// Exit code of the process.
        exit_code: u32,
    },
    /// A DLL was loaded.
    LoadDll {
        /// Base address of the DLL.
        base: Address,
        /// Path of the DLL, if known.
        file_name: Option<String>,
    },
    /// A DLL was unloaded.
    UnloadDll {
        /// Base address of the DLL.
        base: Address,
    },
    /// The debuggee called `OutputDebugString`.
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
        /// Error kind (`SLE_*`).
        kind: u32,
    },
    /// No payload.
    None,
}

/// Raw exception record, mirroring the OS layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawExceptionRecord {
    /// Exception code.
    pub code: u32,
    /// Exception flags.
    pub flags: u32,
    /// Address where the exception occurred.
    pub address: Address,
    /// Exception-specific parameters.
    pub parameters: Vec<u64>,
    /// Chained exception record.
    pub nested: Option<Box<RawExceptionRecord>>,
}

/// Trait implemented by the native debugging backend.
///
/// The engine only talks to the OS through this trait. Every method maps to
/// one native debug API primitive, and errors are reported with
/// [NativeError].
pub trait NativeDebugger {
    /// Spawns a new process in a debugged state.
    fn create_process(&mut self, command: &Command) -> Result<Pid, NativeError>;

    /// Attaches to a running process.
    fn attach(&mut self, pid: Pid) -> Result<(), NativeError>;

    /// Detaches from a debugged process, letting it run freely.
    fn detach(&mut self, pid: Pid) -> Result<(), NativeError>;

    /// Terminates a debugged process.
    fn terminate(&mut self, pid: Pid, exit_code: u32) -> Result<(), NativeError>;

    /// Whether debuggees get killed when the debugger thread exits.
    fn set_kill_on_exit(&mut self, kill_on_exit: bool) -> Result<(), NativeError>;

    /// Waits for the next debug event.
    ///
    /// `None` timeout blocks indefinitely. `Ok(None)` means the wait timed out.
    fn wait_for_event(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<RawDebugEvent>, NativeError>;

    /// Resumes the thread that reported the last debug event.
    fn continue_event(&mut self, pid: Pid, tid: Tid, status: u32) -> Result<(), NativeError>;

    /// Reads memory of a debuggee into `buf`.
    fn read_memory(&self, pid: Pid, address: Address, buf: &mut [u8]) -> Result<(), NativeError>;

    /// Writes `data` into the memory of a debuggee.
    fn write_memory(&mut self, pid: Pid, address: Address, data: &[u8])
    -> Result<(), NativeError>;

    /// Queries the memory region containing `address`.
    fn query_memory(&self, pid: Pid, address: Address) -> Result<MemoryRegion, NativeError>;

    /// Changes the protection of a memory range, returning the old protection
    /// of its first page.
    fn protect_memory(
        &mut self,
        pid: Pid,
        address: Address,
        size: u64,
        protect: u32,
    ) -> Result<u32, NativeError>;

    /// Flushes the instruction cache after a code patch.
    fn flush_instruction_cache(
        &mut self,
        pid: Pid,
        address: Address,
        size: u64,
    ) -> Result<(), NativeError>;

    /// Reads the register context of a thread.
    fn get_context(&self, pid: Pid, tid: Tid) -> Result<ThreadContext, NativeError>;

    /// Writes the register context of a thread.
    fn set_context(&mut self, pid: Pid, tid: Tid, context: &ThreadContext)
    -> Result<(), NativeError>;

    /// Suspends a thread.
    fn suspend_thread(&mut self, pid: Pid, tid: Tid) -> Result<(), NativeError>;

    /// Resumes a thread.
    fn resume_thread(&mut self, pid: Pid, tid: Tid) -> Result<(), NativeError>;

    /// Size of a memory page.
    fn page_size(&self) -> u64;
}
