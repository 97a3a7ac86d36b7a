use super::Session;
use super::state::Debuggee;
use crate::breakpoint::{self, Action, BreakpointKey, BreakpointState, debug_register};
use crate::error::{Error, Result};
use crate::event::{ContinueStatus, Event, EventKind, ExceptionCode, ExceptionInfo};
use crate::native::{NativeDebugger, Pid, Tid, align_down};

/// Whether an event goes on to the event handler once the session is done
/// with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Handler,
    Consumed,
}

impl<N: NativeDebugger> Session<N> {
    pub(crate) fn track_process(&mut self, pid: Pid, attached: bool) {
        self.debuggees.entry(pid).or_insert_with(|| Debuggee {
            attached,
            ..Debuggee::default()
        });
    }

    pub(crate) fn track_thread(&mut self, pid: Pid, tid: Tid) {
        self.debuggees
            .entry(pid)
            .or_default()
            .threads
            .insert(tid);
    }

    /// Updates the session with an event before it reaches the handler,
    /// running the breakpoints it hits.
    pub(crate) fn prepare(&mut self, event: &mut Event) -> Result<Delivery> {
        let (pid, tid) = (event.pid(), event.tid());

        let code = match event.kind() {
            EventKind::CreateProcess { .. } => {
                self.track_process(pid, false);
                self.track_thread(pid, tid);
                return Ok(Delivery::Handler);
            }
            EventKind::CreateThread { .. } => {
                self.track_thread(pid, tid);
                return Ok(Delivery::Handler);
            }
            EventKind::ExitThread { .. } => {
                self.purge_thread(pid, tid);
                return Ok(Delivery::Handler);
            }
            EventKind::ExitProcess { .. } => {
                self.purge_process(pid);
                return Ok(Delivery::Handler);
            }
            EventKind::Exception(info) => info.code,
            _ => return Ok(Delivery::Handler),
        };

        if code.is_breakpoint() {
            self.on_breakpoint(event)
        } else if code.is_single_step() {
            self.on_single_step(event)
        } else if code == ExceptionCode::GuardPage {
            self.on_guard_page(event)
        } else {
            Ok(Delivery::Handler)
        }
    }

    /// Updates the session once the handler is done with an event.
    pub(crate) fn finish(&mut self, event: &Event) {
        let pid = event.pid();

        match *event.kind() {
            EventKind::ExitProcess { exit_code } => {
                if self.debuggees.shift_remove(&pid).is_some() {
                    tracing::info!(pid, exit_code, "debuggee exited");
                }
            }
            EventKind::Rip { error, kind } => {
                tracing::error!(pid, error, kind, "system debugging error");

                if self.is_debuggee(pid) && !self.pending_detach.contains(&pid) {
                    self.pending_detach.push(pid);
                }
            }
            _ => (),
        }
    }

    fn on_breakpoint(&mut self, event: &mut Event) -> Result<Delivery> {
        let (pid, tid) = (event.pid(), event.tid());

        let Some(address) = event.exception().map(|info| info.address) else {
            return Ok(Delivery::Handler);
        };

        let key = BreakpointKey::Code { pid, address };

        if self.is_armed(&key) {
            event.claim(key);

            // execution resumes on the original instruction
            let mut context = self.native.get_context(pid, tid)?;
            context.pc = address;
            self.native.set_context(pid, tid, &context)?;

            return self.fire(event, key);
        }

        let Some(debuggee) = self.debuggees.get_mut(&pid) else {
            return Ok(Delivery::Handler);
        };

        if !debuggee.system_breakpoint_hit {
            debuggee.system_breakpoint_hit = true;
            event.set_continue_status(ContinueStatus::Continue);

            tracing::debug!(pid, tid, "system breakpoint hit");
        }

        Ok(Delivery::Handler)
    }

    fn on_single_step(&mut self, event: &mut Event) -> Result<Delivery> {
        let (pid, tid) = (event.pid(), event.tid());

        let running = self.registry.take_running(tid);
        let stepped = !running.is_empty();

        for key in running {
            self.trace.release(tid);
            self.rearm(&key);
        }

        if stepped {
            event.set_continue_status(ContinueStatus::Continue);
        }

        let mut context = self.native.get_context(pid, tid)?;
        let hits = debug_register::hit_slots(context.dr6).collect::<Vec<_>>();

        if !hits.is_empty() {
            context.dr6 = debug_register::clear_hits(context.dr6);
            self.native.set_context(pid, tid, &context)?;
        }

        let mut claimed = false;
        let mut deliver = false;
        let mut res = Ok(());

        for slot in hits {
            let Some(key) = self.registry.hardware_slot(tid, slot) else {
                continue;
            };

            claimed = true;
            event.claim(key);

            match self.fire(event, key) {
                Ok(Delivery::Handler) => deliver = true,
                Ok(Delivery::Consumed) => (),
                Err(e) => res = res.and(Err(e)),
            }
        }

        let traced = self.trace.is_tracing(tid);

        if traced {
            // the trap flag is cleared on every step
            res = res.and(self.set_trap_flag(pid, tid, true));
            event.set_continue_status(ContinueStatus::Continue);
        }

        res.map(|()| {
            if deliver || traced || !(stepped || claimed) {
                Delivery::Handler
            } else {
                Delivery::Consumed
            }
        })
    }

    fn on_guard_page(&mut self, event: &mut Event) -> Result<Delivery> {
        let pid = event.pid();

        let Some(address) = event.exception().and_then(ExceptionInfo::fault_address) else {
            return Ok(Delivery::Handler);
        };

        let page = align_down(address, self.native.page_size());

        match self.registry.page_at(pid, page) {
            Some(key) if self.is_armed(&key) => {
                event.claim(key);
                self.fire(event, key)
            }
            _ => Ok(Delivery::Handler),
        }
    }

    /// Runs a breakpoint hit, then moves the breakpoint along its state
    /// machine.
    fn fire(&mut self, event: &mut Event, key: BreakpointKey) -> Result<Delivery> {
        let Some(bp) = self.registry.get(&key) else {
            return Ok(Delivery::Handler);
        };

        let condition = bp.condition.clone();
        let action = bp.action.clone();

        let mut delivery = Delivery::Consumed;
        let mut res = Ok(());

        if condition.is_none_or(|condition| condition(self, &*event)) {
            tracing::debug!(%key, "breakpoint hit");

            res = match action {
                None => {
                    delivery = Delivery::Handler;
                    Ok(())
                }
                Some(Action::Callback(cb)) => {
                    (&mut *cb.borrow_mut())(self, event).map_err(Error::Action)
                }
                Some(Action::Hook(hook)) => self.enter_hook(event, hook),
                Some(Action::HookReturn) => self.leave_hook(event, key.address()),
                Some(Action::Buffer) => self.touch_buffer(event),
            };

            if event.is_forwarded() {
                delivery = Delivery::Handler;
            }
        } else {
            tracing::trace!(%key, "breakpoint condition not met");
        }

        let advanced = self.advance(event, &key);

        res.and(advanced).map(|()| delivery)
    }

    fn advance(&mut self, event: &Event, key: &BreakpointKey) -> Result<()> {
        let (pid, tid) = (event.pid(), event.tid());

        // the action may have erased it
        let Some(bp) = self.registry.get_mut(key) else {
            return Ok(());
        };

        match bp.state {
            BreakpointState::Disabled | BreakpointState::Running => Ok(()),
            BreakpointState::OneShot => self.erase_breakpoint(key),
            BreakpointState::Enabled => {
                breakpoint::uninstall(&mut self.native, bp)?;
                bp.state = BreakpointState::Running;

                self.registry.push_running(tid, *key);
                self.trace.acquire(tid);

                self.set_trap_flag(pid, tid, true)
            }
        }
    }

    fn is_armed(&self, key: &BreakpointKey) -> bool {
        self.registry.get(key).is_some_and(|bp| {
            matches!(
                bp.state,
                BreakpointState::Enabled | BreakpointState::OneShot
            )
        })
    }

    /// Forgets everything owned by an exited thread.
    pub(crate) fn purge_thread(&mut self, pid: Pid, tid: Tid) {
        for key in self.registry.thread_keys(tid) {
            self.registry.remove(&key);
        }

        self.forget_thread_hooks(tid);
        self.trace.forget(tid);

        // traps lifted for this thread go back for the others
        for key in self.registry.take_running(tid) {
            self.rearm(&key);
        }

        if let Some(debuggee) = self.debuggees.get_mut(&pid) {
            debuggee.threads.shift_remove(&tid);
        }

        tracing::debug!(pid, tid, "thread purged");
    }

    /// Forgets everything owned by an exited process, without touching it.
    pub(crate) fn purge_process(&mut self, pid: Pid) {
        for key in self.registry.process_keys(pid) {
            self.registry.remove(&key);
        }

        self.forget_process_hooks(pid);
        self.forget_process_buffers(pid);

        for tid in self.threads(pid) {
            self.trace.forget(tid);
            self.registry.take_running(tid);
        }

        tracing::debug!(pid, "process purged");
    }
}
