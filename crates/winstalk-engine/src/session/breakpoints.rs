use std::cell::RefCell;
use std::rc::Rc;

use super::Session;
use crate::breakpoint::{
    self, Action, Breakpoint, BreakpointKey, BreakpointState, CodeTrap, HardwareTrap, PageTrap,
    Trap, Trigger, WatchSize,
};
use crate::error::{BoxError, Error, Result};
use crate::event::Event;
use crate::native::{Address, NativeDebugger, Pid, Tid};

impl<N: NativeDebugger> Session<N> {
    /// Defines a disabled code breakpoint.
    ///
    /// Once enabled, its hits are reported to the event handler's
    /// `breakpoint` method, unless an action is set.
    pub fn define_code_breakpoint(&mut self, pid: Pid, address: Address) -> Result<BreakpointKey> {
        if !self.is_debuggee(pid) {
            return Err(Error::TargetGone);
        }

        let key = BreakpointKey::Code { pid, address };
        let trap = Trap::Code(CodeTrap::default());

        self.registry
            .insert(Breakpoint::new(key, pid, trap), self.native.page_size())?;

        Ok(key)
    }

    /// Defines a disabled page breakpoint over `size` bytes.
    ///
    /// `address` must be page aligned and `size` a non-zero multiple of the
    /// page size.
    pub fn define_page_breakpoint(
        &mut self,
        pid: Pid,
        address: Address,
        size: u64,
    ) -> Result<BreakpointKey> {
        let page_size = self.native.page_size();

        if address % page_size != 0 {
            return Err(Error::InvalidTarget {
                address,
                reason: "page breakpoints must be page aligned",
            });
        }

        if size == 0 || size % page_size != 0 {
            return Err(Error::InvalidTarget {
                address,
                reason: "page breakpoints must cover whole pages",
            });
        }

        if !self.is_debuggee(pid) {
            return Err(Error::TargetGone);
        }

        let key = BreakpointKey::Page { pid, address };
        let trap = Trap::Page(PageTrap { size });

        self.registry
            .insert(Breakpoint::new(key, pid, trap), page_size)?;

        Ok(key)
    }

    /// Defines a disabled hardware breakpoint of a thread.
    ///
    /// Execution breakpoints must watch a single byte, and `address` must be
    /// aligned on `size`. I/O breakpoints are not supported.
    pub fn define_hardware_breakpoint(
        &mut self,
        tid: Tid,
        address: Address,
        trigger: Trigger,
        size: WatchSize,
    ) -> Result<BreakpointKey> {
        if trigger == Trigger::Io {
            return Err(Error::InvalidTarget {
                address,
                reason: "I/O breakpoints are not supported",
            });
        }

        if trigger == Trigger::Execute && size != WatchSize::Byte {
            return Err(Error::InvalidTarget {
                address,
                reason: "execution breakpoints watch a single byte",
            });
        }

        if address % size.bytes() != 0 {
            return Err(Error::InvalidTarget {
                address,
                reason: "hardware breakpoints must be aligned on their size",
            });
        }

        let pid = self.owner(tid).ok_or(Error::TargetGone)?;

        let key = BreakpointKey::Hardware { tid, address };
        let trap = Trap::Hardware(HardwareTrap {
            tid,
            trigger,
            size,
            slot: None,
        });

        self.registry
            .insert(Breakpoint::new(key, pid, trap), self.native.page_size())?;

        Ok(key)
    }

    /// Sets the condition deciding whether a hit is reported.
    ///
    /// Hits failing the condition are consumed silently.
    pub fn set_condition<F>(&mut self, key: &BreakpointKey, condition: F) -> Result<()>
    where
        F: Fn(&mut Session<N>, &Event) -> bool + 'static,
    {
        let bp = self
            .registry
            .get_mut(key)
            .ok_or(Error::NotFound((*key).into()))?;

        bp.condition = Some(Rc::new(condition));

        Ok(())
    }

    /// Sets the action run on hit, instead of reporting it to the event
    /// handler.
    pub fn set_action<F>(&mut self, key: &BreakpointKey, action: F) -> Result<()>
    where
        F: FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError> + 'static,
    {
        let bp = self
            .registry
            .get_mut(key)
            .ok_or(Error::NotFound((*key).into()))?;

        bp.action = Some(Action::Callback(Rc::new(RefCell::new(action))));

        Ok(())
    }

    /// Returns whether a breakpoint is defined.
    pub fn has_breakpoint(&self, key: &BreakpointKey) -> bool {
        self.registry.contains(key)
    }

    /// Returns whether a code breakpoint is defined at `address`.
    pub fn has_code_breakpoint(&self, pid: Pid, address: Address) -> bool {
        self.has_breakpoint(&BreakpointKey::Code { pid, address })
    }

    /// Returns whether a page breakpoint starts at `address`.
    pub fn has_page_breakpoint(&self, pid: Pid, address: Address) -> bool {
        self.has_breakpoint(&BreakpointKey::Page { pid, address })
    }

    /// Returns whether a hardware breakpoint of `tid` watches `address`.
    pub fn has_hardware_breakpoint(&self, tid: Tid, address: Address) -> bool {
        self.has_breakpoint(&BreakpointKey::Hardware { tid, address })
    }

    /// Gets a defined breakpoint.
    pub fn get_breakpoint(&self, key: &BreakpointKey) -> Result<&Breakpoint<N>> {
        self.registry
            .get(key)
            .ok_or(Error::NotFound((*key).into()))
    }

    /// Enables a breakpoint, installing its trap.
    pub fn enable_breakpoint(&mut self, key: &BreakpointKey) -> Result<()> {
        self.arm(key, BreakpointState::Enabled)
    }

    /// Enables a breakpoint for its next hit only.
    pub fn enable_one_shot_breakpoint(&mut self, key: &BreakpointKey) -> Result<()> {
        self.arm(key, BreakpointState::OneShot)
    }

    /// Disables a breakpoint, lifting its trap.
    pub fn disable_breakpoint(&mut self, key: &BreakpointKey) -> Result<()> {
        let bp = self
            .registry
            .get_mut(key)
            .ok_or(Error::NotFound((*key).into()))?;

        match bp.state {
            BreakpointState::Disabled => (),
            // trap already lifted
            BreakpointState::Running => bp.state = BreakpointState::Disabled,
            BreakpointState::Enabled | BreakpointState::OneShot => {
                breakpoint::uninstall(&mut self.native, bp)?;
                bp.state = BreakpointState::Disabled;
            }
        }

        tracing::debug!(%key, "breakpoint disabled");

        Ok(())
    }

    /// Erases a breakpoint, lifting its trap.
    ///
    /// Erasing a breakpoint that was already erased (e.g. a one-shot
    /// breakpoint after its hit), or whose process or thread is gone,
    /// succeeds.
    pub fn erase_breakpoint(&mut self, key: &BreakpointKey) -> Result<()> {
        let Some(bp) = self.registry.get_mut(key) else {
            if self.registry.is_retired(&(*key).into()) || !self.is_owner_alive(key) {
                return Ok(());
            }
            return Err(Error::NotFound((*key).into()));
        };

        // the breakpoint stays defined until its trap is really gone
        breakpoint::uninstall(&mut self.native, bp)?;
        self.registry.remove(key);

        tracing::debug!(%key, "breakpoint erased");

        Ok(())
    }

    /// Every breakpoint of the session, in definition order.
    pub fn all_breakpoints(&self) -> impl Iterator<Item = &Breakpoint<N>> {
        self.registry.iter()
    }

    /// Breakpoints of a process, hardware breakpoints of its threads
    /// included.
    pub fn process_breakpoints(&self, pid: Pid) -> impl Iterator<Item = &Breakpoint<N>> {
        self.registry.iter().filter(move |bp| bp.pid() == pid)
    }

    /// Hardware breakpoints of a thread.
    pub fn thread_hardware_breakpoints(&self, tid: Tid) -> impl Iterator<Item = &Breakpoint<N>> {
        self.registry.iter().filter(move |bp| bp.tid() == Some(tid))
    }

    /// Enables every breakpoint of a process.
    pub fn enable_process_breakpoints(&mut self, pid: Pid) -> Result<()> {
        self.registry
            .process_keys(pid)
            .iter()
            .try_for_each(|key| self.enable_breakpoint(key))
    }

    /// Disables every breakpoint of a process.
    pub fn disable_process_breakpoints(&mut self, pid: Pid) -> Result<()> {
        self.registry
            .process_keys(pid)
            .iter()
            .try_for_each(|key| self.disable_breakpoint(key))
    }

    /// Erases every breakpoint of a process, hooks and watched buffers
    /// included.
    ///
    /// Every breakpoint is erased even if some fail. The first error is
    /// returned.
    pub fn erase_process_breakpoints(&mut self, pid: Pid) -> Result<()> {
        let mut res = Ok(());

        for key in self.registry.process_keys(pid) {
            res = res.and(self.erase_breakpoint(&key));
        }

        self.forget_process_hooks(pid);
        self.forget_process_buffers(pid);

        res
    }

    /// Disables every breakpoint of the session.
    pub fn disable_all_breakpoints(&mut self) -> Result<()> {
        self.registry
            .keys()
            .iter()
            .try_for_each(|key| self.disable_breakpoint(key))
    }

    /// Erases every breakpoint of the session.
    pub fn erase_all_breakpoints(&mut self) -> Result<()> {
        self.debuggee_pids()
            .into_iter()
            .fold(Ok(()), |res, pid| res.and(self.erase_process_breakpoints(pid)))
    }

    /// Places a code breakpoint running `action` on every hit.
    pub fn break_at<F>(&mut self, pid: Pid, address: Address, action: F) -> Result<()>
    where
        F: FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError> + 'static,
    {
        let key = self.define_code_breakpoint(pid, address)?;
        self.place(key, Some(callback(action)), BreakpointState::Enabled)
    }

    /// Places a code breakpoint running `action` on its next hit only.
    pub fn stalk_at<F>(&mut self, pid: Pid, address: Address, action: F) -> Result<()>
    where
        F: FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError> + 'static,
    {
        let key = self.define_code_breakpoint(pid, address)?;
        self.place(key, Some(callback(action)), BreakpointState::OneShot)
    }

    /// Removes the code breakpoint at `address`.
    pub fn dont_break_at(&mut self, pid: Pid, address: Address) -> Result<()> {
        self.erase_breakpoint(&BreakpointKey::Code { pid, address })
    }

    /// Removes the one-shot code breakpoint at `address`, if not already hit.
    pub fn dont_stalk_at(&mut self, pid: Pid, address: Address) -> Result<()> {
        self.dont_break_at(pid, address)
    }

    /// Watches reads and writes of a 1, 2, 4 or 8 byte variable from a
    /// thread, with a hardware breakpoint.
    ///
    /// Fails with [Error::ResourceExhausted] when every debug register of
    /// the thread is taken. Falling back to another kind of breakpoint is up
    /// to the caller.
    pub fn watch_variable<F>(&mut self, tid: Tid, address: Address, size: u64, action: F) -> Result<()>
    where
        F: FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError> + 'static,
    {
        let key = self.define_variable_watch(tid, address, size)?;
        self.place(key, Some(callback(action)), BreakpointState::Enabled)
    }

    /// Watches the next read or write of a variable from a thread.
    pub fn stalk_variable<F>(&mut self, tid: Tid, address: Address, size: u64, action: F) -> Result<()>
    where
        F: FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError> + 'static,
    {
        let key = self.define_variable_watch(tid, address, size)?;
        self.place(key, Some(callback(action)), BreakpointState::OneShot)
    }

    /// Stops watching a variable.
    pub fn dont_watch_variable(&mut self, tid: Tid, address: Address) -> Result<()> {
        self.erase_breakpoint(&BreakpointKey::Hardware { tid, address })
    }

    /// Stops stalking a variable, if not already hit.
    pub fn dont_stalk_variable(&mut self, tid: Tid, address: Address) -> Result<()> {
        self.dont_watch_variable(tid, address)
    }

    fn define_variable_watch(&mut self, tid: Tid, address: Address, size: u64) -> Result<BreakpointKey> {
        let size = WatchSize::from_len(size).ok_or(Error::InvalidTarget {
            address,
            reason: "watched variables are 1, 2, 4 or 8 bytes long",
        })?;

        self.define_hardware_breakpoint(tid, address, Trigger::ReadWrite, size)
    }

    /// Enables a freshly defined breakpoint with its action, dropping it if
    /// its trap cannot be installed.
    pub(crate) fn place(
        &mut self,
        key: BreakpointKey,
        action: Option<Action<N>>,
        state: BreakpointState,
    ) -> Result<()> {
        if let Some(bp) = self.registry.get_mut(&key) {
            bp.action = action;
        }

        match self.arm(&key, state) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(mut bp) = self.registry.remove(&key) {
                    if let Err(e) = breakpoint::uninstall(&mut self.native, &mut bp) {
                        tracing::warn!(%key, error = %e, "cannot lift partially installed trap");
                    }
                }
                self.registry.revive(&key.into());
                Err(e)
            }
        }
    }

    fn arm(&mut self, key: &BreakpointKey, state: BreakpointState) -> Result<()> {
        let hostile = self.options.hostile_code;

        let reserved = match *key {
            BreakpointKey::Hardware { tid, .. } => self.registry.slots_in_use(tid),
            _ => 0,
        };

        let bp = self
            .registry
            .get_mut(key)
            .ok_or(Error::NotFound((*key).into()))?;

        if bp.state == BreakpointState::Disabled {
            breakpoint::install(&mut self.native, bp, hostile, reserved)?;
        }

        // a running breakpoint gets its trap back after the step
        if bp.state != BreakpointState::Running || state == BreakpointState::OneShot {
            bp.state = state;
        }

        tracing::debug!(%key, state = ?bp.state, "breakpoint armed");

        Ok(())
    }

    /// Puts back the trap of a breakpoint whose thread stepped past it.
    pub(crate) fn rearm(&mut self, key: &BreakpointKey) {
        let hostile = self.options.hostile_code;

        let reserved = match *key {
            BreakpointKey::Hardware { tid, .. } => self.registry.slots_in_use(tid),
            _ => 0,
        };

        let Some(bp) = self.registry.get_mut(key) else {
            return;
        };

        if bp.state == BreakpointState::Disabled {
            return;
        }

        if let Err(e) = breakpoint::install(&mut self.native, bp, hostile, reserved) {
            tracing::warn!(%key, error = %e, "cannot put trap back, disabling breakpoint");
            bp.state = BreakpointState::Disabled;
            return;
        }

        if bp.state == BreakpointState::Running {
            bp.state = BreakpointState::Enabled;
        }
    }

    fn is_owner_alive(&self, key: &BreakpointKey) -> bool {
        match *key {
            BreakpointKey::Code { pid, .. } | BreakpointKey::Page { pid, .. } => self.is_debuggee(pid),
            BreakpointKey::Hardware { tid, .. } => self.owner(tid).is_some(),
        }
    }
}

fn callback<N, F>(action: F) -> Action<N>
where
    N: NativeDebugger,
    F: FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError> + 'static,
{
    Action::Callback(Rc::new(RefCell::new(action)))
}
