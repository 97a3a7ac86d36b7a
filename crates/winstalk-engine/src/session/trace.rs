use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::native::{NativeDebugger, Pid, Tid};

use super::Session;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Reasons {
    /// Tracing requested by the user.
    user: bool,

    /// Breakpoints stepping over their own trap.
    internal: usize,
}

/// Reasons for which each thread has its trap flag set.
///
/// The trap flag is shared by user tracing and by breakpoints stepping over
/// their trap, so it is only cleared once no reason remains.
#[derive(Debug, Default)]
pub(crate) struct TraceCounter {
    threads: HashMap<Tid, Reasons>,
}

impl TraceCounter {
    pub fn start(&mut self, tid: Tid) {
        self.threads.entry(tid).or_default().user = true;
    }

    /// Returns whether the thread still needs its trap flag.
    pub fn stop(&mut self, tid: Tid) -> bool {
        let Some(reasons) = self.threads.get_mut(&tid) else {
            return false;
        };

        reasons.user = false;
        self.cleanup(tid)
    }

    pub fn acquire(&mut self, tid: Tid) {
        self.threads.entry(tid).or_default().internal += 1;
    }

    /// Returns whether the thread still needs its trap flag.
    pub fn release(&mut self, tid: Tid) -> bool {
        let Some(reasons) = self.threads.get_mut(&tid) else {
            return false;
        };

        reasons.internal = reasons.internal.saturating_sub(1);
        self.cleanup(tid)
    }

    pub fn is_tracing(&self, tid: Tid) -> bool {
        self.threads.get(&tid).is_some_and(|reasons| reasons.user)
    }

    pub fn forget(&mut self, tid: Tid) {
        self.threads.remove(&tid);
    }

    fn cleanup(&mut self, tid: Tid) -> bool {
        let needed = self
            .threads
            .get(&tid)
            .is_some_and(|reasons| reasons.user || reasons.internal > 0);

        if !needed {
            self.threads.remove(&tid);
        }

        needed
    }
}

impl<N: NativeDebugger> Session<N> {
    /// Starts single-stepping a thread.
    ///
    /// Every instruction it executes is reported to the event handler as a
    /// single-step exception, until [stop_tracing](Self::stop_tracing).
    pub fn start_tracing(&mut self, tid: Tid) -> Result<()> {
        let pid = self.owner(tid).ok_or(Error::TargetGone)?;

        self.set_trap_flag(pid, tid, true)?;
        self.trace.start(tid);

        tracing::debug!(pid, tid, "tracing started");

        Ok(())
    }

    /// Stops single-stepping a thread.
    pub fn stop_tracing(&mut self, tid: Tid) -> Result<()> {
        let pid = self.owner(tid).ok_or(Error::TargetGone)?;

        if !self.trace.stop(tid) {
            self.set_trap_flag(pid, tid, false)?;
        }

        tracing::debug!(pid, tid, "tracing stopped");

        Ok(())
    }

    /// Returns whether a thread is traced.
    pub fn is_tracing(&self, tid: Tid) -> bool {
        self.trace.is_tracing(tid)
    }

    /// Starts single-stepping every thread of a process.
    pub fn start_tracing_process(&mut self, pid: Pid) -> Result<()> {
        if !self.is_debuggee(pid) {
            return Err(Error::TargetGone);
        }

        self.threads(pid)
            .into_iter()
            .try_for_each(|tid| self.start_tracing(tid))
    }

    /// Stops single-stepping every thread of a process.
    pub fn stop_tracing_process(&mut self, pid: Pid) -> Result<()> {
        if !self.is_debuggee(pid) {
            return Err(Error::TargetGone);
        }

        self.threads(pid)
            .into_iter()
            .try_for_each(|tid| self.stop_tracing(tid))
    }

    pub(crate) fn set_trap_flag(&mut self, pid: Pid, tid: Tid, enabled: bool) -> Result<()> {
        let mut context = self.native.get_context(pid, tid)?;

        if context.trap_flag() != enabled {
            context.set_trap_flag(enabled);
            self.native.set_context(pid, tid, &context)?;
        }

        Ok(())
    }
}
