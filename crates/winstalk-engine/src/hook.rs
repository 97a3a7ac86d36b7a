//! Function hooks.
//!
//! A hook is a code breakpoint at the entry of a function. When it is hit,
//! the arguments and the return address are read from the thread context
//! and the stack, and the entry callback runs. If an exit callback is set, a
//! *return trap* (an internal code breakpoint) is placed at the return
//! address, and the call is pushed on the thread's stack of pending returns,
//! so that recursive calls are paired with their own return.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::rc::Rc;

use crate::breakpoint::{Action, BreakpointKey, BreakpointState};
use crate::error::{BoxError, Error, Result};
use crate::event::Event;
use crate::native::{Address, Arch, NativeDebugger, Pid, ThreadContext, Tid};
use crate::session::Session;

/// Calling convention of a hooked function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// 32-bit, every parameter on the stack, callee cleans up.
    Stdcall,
    /// 32-bit, every parameter on the stack, caller cleans up.
    Cdecl,
    /// First four parameters in `rcx`, `rdx`, `r8` and `r9`, the others on
    /// the stack above the 32-byte shadow space.
    Win64,
}

impl CallingConvention {
    /// Default calling convention of an architecture.
    pub const fn native(arch: Arch) -> Self {
        match arch {
            Arch::X86 => Self::Stdcall,
            Arch::X86_64 => Self::Win64,
        }
    }
}

/// Signature of a hooked function, used to fetch its parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signature {
    /// Number of integer parameters.
    pub param_count: usize,

    /// Calling convention, or the default one of the thread's architecture.
    pub convention: Option<CallingConvention>,
}

impl Signature {
    /// Signature with `param_count` parameters and the default calling
    /// convention.
    pub const fn new(param_count: usize) -> Self {
        Self {
            param_count,
            convention: None,
        }
    }

    /// Sets the calling convention.
    pub const fn with_convention(mut self, convention: CallingConvention) -> Self {
        self.convention = Some(convention);
        self
    }
}

/// A call intercepted by a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCall {
    /// Address the function returns to.
    pub return_address: Address,

    /// Parameters, as described by the hook's [Signature].
    pub params: Vec<u64>,

    /// Stack pointer at function entry.
    pub stack_pointer: Address,
}

type EnterFn<N> = Rc<
    RefCell<dyn FnMut(&mut Session<N>, &mut Event, &HookCall) -> core::result::Result<(), BoxError>>,
>;

type ExitFn<N> = Rc<
    RefCell<
        dyn FnMut(&mut Session<N>, &mut Event, &HookCall, u64) -> core::result::Result<(), BoxError>,
    >,
>;

/// Callbacks run on entry and exit of a hooked function.
///
/// ```no_run
/// # use winstalk_engine::Session;
/// # use winstalk_engine::hook::{Hook, Signature};
/// # fn place<N: winstalk_engine::native::NativeDebugger>(session: &mut Session<N>) -> winstalk_engine::Result<()> {
/// let hook = Hook::new(Signature::new(2))
///     .on_enter(|_session, _event, call| {
///         tracing::info!(params = ?call.params, "entered");
///         Ok(())
///     })
///     .on_exit(|_session, _event, _call, ret| {
///         tracing::info!(ret, "returned");
///         Ok(())
///     });
///
/// session.hook_function(1234, 0x7ff6_1000_1000, hook)?;
/// # Ok(())
/// # }
/// ```
pub struct Hook<N: NativeDebugger> {
    signature: Signature,
    enter: Option<EnterFn<N>>,
    exit: Option<ExitFn<N>>,
}

impl<N: NativeDebugger> Hook<N> {
    /// Creates a hook without callbacks.
    pub fn new(signature: Signature) -> Self {
        Self {
            signature,
            enter: None,
            exit: None,
        }
    }

    /// Sets the callback run when the function is entered.
    pub fn on_enter<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Session<N>, &mut Event, &HookCall) -> core::result::Result<(), BoxError>
            + 'static,
    {
        self.enter = Some(Rc::new(RefCell::new(f)));
        self
    }

    /// Sets the callback run when the function returns, with the call it
    /// returns from and the return value.
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Session<N>, &mut Event, &HookCall, u64) -> core::result::Result<(), BoxError>
            + 'static,
    {
        self.exit = Some(Rc::new(RefCell::new(f)));
        self
    }

    /// Signature of the hooked function.
    pub const fn signature(&self) -> Signature {
        self.signature
    }
}

struct PendingReturn<N: NativeDebugger> {
    pid: Pid,
    hook: Rc<Hook<N>>,
    call: HookCall,
}

/// Hook bookkeeping of a session.
pub(crate) struct HookTable<N: NativeDebugger> {
    /// Calls waiting for their return, innermost last.
    pending: HashMap<Tid, Vec<PendingReturn<N>>>,

    /// Return trap -> number of pending calls returning there.
    traps: HashMap<(Pid, Address), usize>,
}

impl<N: NativeDebugger> Default for HookTable<N> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            traps: HashMap::new(),
        }
    }
}

impl<N: NativeDebugger> Session<N> {
    /// Hooks the function at `address`. Every call is intercepted.
    pub fn hook_function(&mut self, pid: Pid, address: Address, hook: Hook<N>) -> Result<()> {
        self.place_hook(pid, address, hook, BreakpointState::Enabled)
    }

    /// Hooks the function at `address` for its next call only.
    ///
    /// The exit callback of that call still runs.
    pub fn stalk_function(&mut self, pid: Pid, address: Address, hook: Hook<N>) -> Result<()> {
        self.place_hook(pid, address, hook, BreakpointState::OneShot)
    }

    /// Removes the hook at `address`.
    ///
    /// Calls already entered still get their exit callback.
    pub fn dont_hook_function(&mut self, pid: Pid, address: Address) -> Result<()> {
        self.erase_breakpoint(&BreakpointKey::Code { pid, address })
    }

    /// Removes the one-shot hook at `address`, if not already hit.
    pub fn dont_stalk_function(&mut self, pid: Pid, address: Address) -> Result<()> {
        self.dont_hook_function(pid, address)
    }

    /// Number of hooked calls of `tid` waiting for their return.
    pub fn pending_returns(&self, tid: Tid) -> usize {
        self.hooks.pending.get(&tid).map_or(0, Vec::len)
    }

    fn place_hook(
        &mut self,
        pid: Pid,
        address: Address,
        hook: Hook<N>,
        state: BreakpointState,
    ) -> Result<()> {
        let key = self.define_code_breakpoint(pid, address)?;
        self.place(key, Some(Action::Hook(Rc::new(hook))), state)
    }

    /// Handles a hit on a hooked function entry.
    pub(crate) fn enter_hook(&mut self, event: &mut Event, hook: Rc<Hook<N>>) -> Result<()> {
        let (pid, tid) = (event.pid(), event.tid());

        let context = self.native.get_context(pid, tid)?;

        let convention = hook
            .signature
            .convention
            .unwrap_or(CallingConvention::native(context.arch));

        let call = HookCall {
            return_address: self.read_pointer(pid, context.sp, context.arch)?,
            params: self.read_params(pid, &context, hook.signature.param_count, convention)?,
            stack_pointer: context.sp,
        };

        tracing::debug!(
            pid,
            tid,
            ret = format_args!("{:#x}", call.return_address),
            "hooked function entered"
        );

        let entered = match &hook.enter {
            Some(enter) => (&mut *enter.borrow_mut())(self, event, &call).map_err(Error::Action),
            None => Ok(()),
        };

        if hook.exit.is_some() {
            let return_address = call.return_address;

            if let Err(e) = self.watch_return(pid, tid, hook.clone(), call) {
                tracing::warn!(
                    pid,
                    tid,
                    ret = format_args!("{return_address:#x}"),
                    error = %e,
                    "cannot watch the return of a hooked call"
                );
            }
        }

        entered
    }

    /// Handles a hit on a return trap.
    pub(crate) fn leave_hook(&mut self, event: &mut Event, address: Address) -> Result<()> {
        let (pid, tid) = (event.pid(), event.tid());

        let context = self.native.get_context(pid, tid)?;

        let Some(frame) = self.pop_frame(pid, tid, address, context.sp) else {
            tracing::trace!(pid, tid, "return trap hit outside of a hooked call");
            return Ok(());
        };

        tracing::debug!(
            pid,
            tid,
            ret = format_args!("{address:#x}"),
            "hooked function returned"
        );

        let left = match &frame.hook.exit {
            Some(exit) => (&mut *exit.borrow_mut())(self, event, &frame.call, context.ret)
                .map_err(Error::Action),
            None => Ok(()),
        };

        let released = self.release_return_trap(pid, address);

        left.and(released)
    }

    /// Drops the pending calls of an exited thread.
    pub(crate) fn forget_thread_hooks(&mut self, tid: Tid) {
        for frame in self.hooks.pending.remove(&tid).unwrap_or_default() {
            if let Err(e) = self.release_return_trap(frame.pid, frame.call.return_address) {
                tracing::warn!(tid, error = %e, "cannot remove return trap");
            }
        }
    }

    /// Drops every hook bookkeeping entry of an exited process.
    pub(crate) fn forget_process_hooks(&mut self, pid: Pid) {
        self.hooks.pending.retain(|_, frames| {
            frames.retain(|frame| frame.pid != pid);
            !frames.is_empty()
        });

        self.hooks.traps.retain(|&(owner, _), _| owner != pid);
    }

    fn watch_return(&mut self, pid: Pid, tid: Tid, hook: Rc<Hook<N>>, call: HookCall) -> Result<()> {
        if self.options.hostile_code {
            let region = self.native.query_memory(pid, call.return_address)?;

            if !region.is_executable() {
                return Err(Error::InvalidTarget {
                    address: call.return_address,
                    reason: "return address is not executable",
                });
            }
        }

        self.acquire_return_trap(pid, call.return_address)?;

        self.hooks
            .pending
            .entry(tid)
            .or_default()
            .push(PendingReturn { pid, hook, call });

        Ok(())
    }

    /// Pops the pending call returning to `address`, discarding the calls
    /// above it whose frame is already gone (e.g. after a `longjmp`).
    fn pop_frame(
        &mut self,
        pid: Pid,
        tid: Tid,
        address: Address,
        sp: Address,
    ) -> Option<PendingReturn<N>> {
        let frames = self.hooks.pending.get_mut(&tid)?;

        let mut stale = Vec::new();

        let found = loop {
            match frames.pop() {
                Some(frame) if frame.call.stack_pointer < sp => {
                    if frame.pid == pid && frame.call.return_address == address {
                        break Some(frame);
                    }
                    stale.push(frame);
                }
                Some(frame) => {
                    // still running: the trap was reached by another path
                    frames.push(frame);
                    break None;
                }
                None => break None,
            }
        };

        if frames.is_empty() {
            self.hooks.pending.remove(&tid);
        }

        for frame in stale {
            tracing::debug!(
                pid,
                tid,
                ret = format_args!("{:#x}", frame.call.return_address),
                "discarding stale hooked call"
            );

            if let Err(e) = self.release_return_trap(frame.pid, frame.call.return_address) {
                tracing::warn!(pid, tid, error = %e, "cannot remove return trap");
            }
        }

        found
    }

    fn acquire_return_trap(&mut self, pid: Pid, address: Address) -> Result<()> {
        let key = BreakpointKey::Code { pid, address };

        if let Some(count) = self.hooks.traps.get_mut(&(pid, address)) {
            if self.registry.contains(&key) {
                *count += 1;
                return Ok(());
            }
        }

        // the trap may have been erased through the breakpoint API
        self.hooks.traps.remove(&(pid, address));

        let key = self.define_code_breakpoint(pid, address)?;
        self.place(key, Some(Action::HookReturn), BreakpointState::Enabled)?;

        self.hooks.traps.insert((pid, address), 1);

        Ok(())
    }

    fn release_return_trap(&mut self, pid: Pid, address: Address) -> Result<()> {
        let Entry::Occupied(mut entry) = self.hooks.traps.entry((pid, address)) else {
            return Ok(());
        };

        *entry.get_mut() -= 1;

        if *entry.get() > 0 {
            return Ok(());
        }

        entry.remove();

        self.erase_breakpoint(&BreakpointKey::Code { pid, address })
    }

    fn read_params(
        &self,
        pid: Pid,
        context: &ThreadContext,
        count: usize,
        convention: CallingConvention,
    ) -> Result<Vec<u64>> {
        (0..count)
            .map(|i| match convention {
                CallingConvention::Win64 if i < 4 => Ok(context.args[i]),
                CallingConvention::Win64 => {
                    let offset = 8 + 32 + 8 * (i as u64 - 4);
                    self.read_u64(pid, context.sp + offset)
                }
                CallingConvention::Stdcall | CallingConvention::Cdecl => {
                    let offset = 4 + 4 * i as u64;
                    self.read_u32(pid, context.sp + offset).map(u64::from)
                }
            })
            .collect()
    }
}
