//! Breakpoints and their life cycle.
//!
//! Three kinds of breakpoints are supported:
//!
//! - **code** breakpoints patch an `int3` instruction over the first byte of
//!   an instruction,
//! - **page** breakpoints add the guard modifier to whole memory pages,
//! - **hardware** breakpoints use one of the 4 debug registers of a thread.
//!
//! A breakpoint is identified by its [BreakpointKey] and goes through the
//! [BreakpointState] machine: it is defined disabled, gets enabled (or
//! enabled as one-shot), and is temporarily *running* while its thread
//! single-steps past it before the trap is put back.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{BoxError, Result};
use crate::event::Event;
use crate::hook::Hook;
use crate::native::{Address, NativeDebugger, Pid, Tid};
use crate::session::Session;

pub mod debug_register;

mod code;
mod hardware;
mod page;
pub(crate) mod registry;

pub use self::code::INT3;
pub use self::debug_register::{Trigger, WatchSize};

pub(crate) use self::code::CodeTrap;
pub(crate) use self::hardware::HardwareTrap;
pub(crate) use self::page::PageTrap;

/// Identity of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKey {
    /// Code breakpoint at an address of a process.
    Code {
        /// Owning process.
        pid: Pid,
        /// Patched address.
        address: Address,
    },
    /// Page breakpoint starting at a page of a process.
    Page {
        /// Owning process.
        pid: Pid,
        /// First guarded page.
        address: Address,
    },
    /// Hardware breakpoint watching an address from a thread.
    Hardware {
        /// Owning thread.
        tid: Tid,
        /// Watched address.
        address: Address,
    },
}

impl BreakpointKey {
    /// Address targeted by the breakpoint.
    pub const fn address(&self) -> Address {
        match *self {
            Self::Code { address, .. }
            | Self::Page { address, .. }
            | Self::Hardware { address, .. } => address,
        }
    }
}

impl fmt::Display for BreakpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Code { pid, address } => {
                write!(f, "code breakpoint {address:#x} in process {pid}")
            }
            Self::Page { pid, address } => {
                write!(f, "page breakpoint {address:#x} in process {pid}")
            }
            Self::Hardware { tid, address } => {
                write!(f, "hardware breakpoint {address:#x} in thread {tid}")
            }
        }
    }
}

/// Anything the breakpoint API can place, used to report conflicts and
/// missing targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// A single breakpoint.
    Breakpoint(BreakpointKey),
    /// A watched buffer.
    Buffer {
        /// Owning process.
        pid: Pid,
        /// First byte of the buffer.
        address: Address,
        /// Length of the buffer.
        size: u64,
    },
}

impl From<BreakpointKey> for Target {
    fn from(key: BreakpointKey) -> Self {
        Self::Breakpoint(key)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Breakpoint(key) => key.fmt(f),
            Self::Buffer { pid, address, size } => {
                write!(f, "buffer {address:#x}+{size:#x} in process {pid}")
            }
        }
    }
}

/// State of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointState {
    /// Defined, but no trap is installed.
    Disabled,
    /// Trap installed, hits are reported.
    Enabled,
    /// Trap installed, the breakpoint is removed after its first hit.
    OneShot,
    /// Trap lifted while the hitting thread single-steps past it.
    Running,
}

/// Kind of a breakpoint, with its kind-specific settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Code breakpoint.
    Code,
    /// Page breakpoint covering `size` bytes.
    Page {
        /// Covered length, a multiple of the page size.
        size: u64,
    },
    /// Hardware breakpoint.
    Hardware {
        /// Access triggering the breakpoint.
        trigger: Trigger,
        /// Watched length.
        size: WatchSize,
    },
}

/// User callback run when a breakpoint is hit.
pub(crate) type Callback<N> =
    Rc<RefCell<dyn FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError>>>;

/// User predicate deciding whether a hit is reported.
pub(crate) type Condition<N> = Rc<dyn Fn(&mut Session<N>, &Event) -> bool>;

/// What a breakpoint does when hit.
pub(crate) enum Action<N: NativeDebugger> {
    /// Runs a user callback.
    Callback(Callback<N>),
    /// Function entry of a hook.
    Hook(Rc<Hook<N>>),
    /// Return address trap placed by hooks.
    HookReturn,
    /// Page breakpoint backing watched buffers.
    Buffer,
}

impl<N: NativeDebugger> Clone for Action<N> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(cb) => Self::Callback(cb.clone()),
            Self::Hook(hook) => Self::Hook(hook.clone()),
            Self::HookReturn => Self::HookReturn,
            Self::Buffer => Self::Buffer,
        }
    }
}

pub(crate) enum Trap {
    Code(CodeTrap),
    Page(PageTrap),
    Hardware(HardwareTrap),
}

/// A breakpoint owned by a [Session].
pub struct Breakpoint<N: NativeDebugger> {
    pub(crate) key: BreakpointKey,
    pub(crate) pid: Pid,
    pub(crate) state: BreakpointState,
    pub(crate) trap: Trap,
    pub(crate) condition: Option<Condition<N>>,
    pub(crate) action: Option<Action<N>>,
}

impl<N: NativeDebugger> Breakpoint<N> {
    pub(crate) fn new(key: BreakpointKey, pid: Pid, trap: Trap) -> Self {
        Self {
            key,
            pid,
            state: BreakpointState::Disabled,
            trap,
            condition: None,
            action: None,
        }
    }

    /// Identity of this breakpoint.
    pub const fn key(&self) -> BreakpointKey {
        self.key
    }

    /// Process owning this breakpoint (for hardware breakpoints, the process
    /// of the owning thread).
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Thread owning this breakpoint, for hardware breakpoints.
    pub const fn tid(&self) -> Option<Tid> {
        match self.key {
            BreakpointKey::Hardware { tid, .. } => Some(tid),
            _ => None,
        }
    }

    /// Targeted address.
    pub const fn address(&self) -> Address {
        self.key.address()
    }

    /// Current state.
    pub const fn state(&self) -> BreakpointState {
        self.state
    }

    /// Kind of this breakpoint.
    pub const fn kind(&self) -> BreakpointKind {
        match &self.trap {
            Trap::Code(_) => BreakpointKind::Code,
            Trap::Page(trap) => BreakpointKind::Page { size: trap.size },
            Trap::Hardware(trap) => BreakpointKind::Hardware {
                trigger: trap.trigger,
                size: trap.size,
            },
        }
    }

    /// Debug register slot in use, for enabled hardware breakpoints.
    pub const fn slot(&self) -> Option<usize> {
        match &self.trap {
            Trap::Hardware(trap) => trap.slot,
            _ => None,
        }
    }

    /// Returns whether the breakpoint is disabled.
    pub fn is_disabled(&self) -> bool {
        self.state == BreakpointState::Disabled
    }

    /// Returns whether the breakpoint is enabled (persistently).
    pub fn is_enabled(&self) -> bool {
        self.state == BreakpointState::Enabled
    }

    /// Returns whether the breakpoint is enabled as one-shot.
    pub fn is_one_shot(&self) -> bool {
        self.state == BreakpointState::OneShot
    }

    /// Returns whether the breakpoint is running.
    pub fn is_running(&self) -> bool {
        self.state == BreakpointState::Running
    }

    /// Returns whether the breakpoint has a condition.
    pub const fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// Returns whether hits are reported to the event handler instead of an
    /// action.
    pub const fn is_interactive(&self) -> bool {
        self.action.is_none()
    }

    /// Returns whether `address` lies within the range covered by this
    /// breakpoint.
    pub const fn contains(&self, address: Address) -> bool {
        let start = self.address();

        let len = match &self.trap {
            Trap::Code(_) => 1,
            Trap::Page(trap) => trap.size,
            Trap::Hardware(trap) => trap.size.bytes(),
        };

        address >= start && address - start < len
    }
}

impl<N: NativeDebugger> fmt::Debug for Breakpoint<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Installs the trap of a breakpoint in its target.
pub(crate) fn install<N: NativeDebugger>(
    native: &mut N,
    bp: &mut Breakpoint<N>,
    hostile: bool,
    reserved_slots: u8,
) -> Result<()> {
    let (pid, address) = (bp.pid, bp.address());

    match &mut bp.trap {
        Trap::Code(trap) => trap.install(native, pid, address, hostile),
        Trap::Page(trap) => trap.install(native, pid, address),
        Trap::Hardware(trap) => trap.install(native, pid, address, reserved_slots),
    }
}

/// Lifts the trap of a breakpoint.
///
/// This never fails because the target has already been restored or has
/// exited.
pub(crate) fn uninstall<N: NativeDebugger>(native: &mut N, bp: &mut Breakpoint<N>) -> Result<()> {
    let (pid, address) = (bp.pid, bp.address());

    match &mut bp.trap {
        Trap::Code(trap) => trap.remove(native, pid, address),
        Trap::Page(trap) => trap.remove(native, pid, address),
        Trap::Hardware(trap) => trap.remove(native, pid),
    }
}
