use indexmap::{IndexMap, IndexSet};

use super::trace::TraceCounter;
use crate::breakpoint::registry::Registry;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::hook::HookTable;
use crate::native::{Address, Arch, NativeDebugger, NativeError, Pid, ThreadContext, Tid};
use crate::watch::BufferTable;

/// Session options, set through the [Builder](super::Builder).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Kill the debuggees when the session stops, instead of detaching.
    pub kill_on_exit: bool,

    /// Validate addresses read from, or patched into, the debuggees.
    pub hostile_code: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Debuggee {
    /// Attached to, rather than spawned.
    pub attached: bool,

    /// Live threads, in creation order.
    pub threads: IndexSet<Tid>,

    /// The loader breakpoint was hit.
    pub system_breakpoint_hit: bool,
}

/// State of a debugging session, handed to event handlers and breakpoint
/// actions.
///
/// It owns the native debugger, every breakpoint, hook and watched buffer,
/// and the bookkeeping of debugged processes and threads.
pub struct Session<N: NativeDebugger> {
    pub(crate) native: N,
    pub(crate) options: Options,
    pub(crate) debuggees: IndexMap<Pid, Debuggee>,
    pub(crate) registry: Registry<N>,
    pub(crate) trace: TraceCounter,
    pub(crate) hooks: HookTable<N>,
    pub(crate) buffers: BufferTable<N>,

    /// A stop was requested while dispatching an event.
    pub(crate) stop_requested: bool,

    /// Every debuggee was released.
    pub(crate) stopped: bool,

    /// Processes to detach from once the current event is continued.
    pub(crate) pending_detach: Vec<Pid>,
}

impl<N: NativeDebugger> Session<N> {
    pub(crate) fn new(native: N, options: Options) -> Self {
        Self {
            native,
            options,
            debuggees: IndexMap::new(),
            registry: Registry::default(),
            trace: TraceCounter::default(),
            hooks: HookTable::default(),
            buffers: BufferTable::default(),
            stop_requested: false,
            stopped: false,
            pending_detach: Vec::new(),
        }
    }

    /// Native debugger of this session.
    pub const fn native(&self) -> &N {
        &self.native
    }

    /// Native debugger of this session, mutably.
    ///
    /// Memory or contexts changed through it bypass the breakpoint
    /// bookkeeping.
    pub const fn native_mut(&mut self) -> &mut N {
        &mut self.native
    }

    /// Options of this session.
    pub const fn options(&self) -> Options {
        self.options
    }

    /// Number of debugged processes.
    pub fn debuggee_count(&self) -> usize {
        self.debuggees.len()
    }

    /// Debugged processes, in the order they were started or attached to.
    pub fn debuggee_pids(&self) -> Vec<Pid> {
        self.debuggees.keys().copied().collect()
    }

    /// Returns whether `pid` is debugged by this session.
    pub fn is_debuggee(&self, pid: Pid) -> bool {
        self.debuggees.contains_key(&pid)
    }

    /// Returns whether `pid` was spawned by this session.
    pub fn is_debuggee_started(&self, pid: Pid) -> bool {
        self.debuggees.get(&pid).is_some_and(|d| !d.attached)
    }

    /// Returns whether `pid` was attached to by this session.
    pub fn is_debuggee_attached(&self, pid: Pid) -> bool {
        self.debuggees.get(&pid).is_some_and(|d| d.attached)
    }

    /// Live threads of a debugged process.
    pub fn threads(&self, pid: Pid) -> Vec<Tid> {
        self.debuggees
            .get(&pid)
            .map(|d| d.threads.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Debugged process owning `tid`.
    pub fn owner(&self, tid: Tid) -> Option<Pid> {
        self.debuggees
            .iter()
            .find(|(_, d)| d.threads.contains(&tid))
            .map(|(&pid, _)| pid)
    }

    /// Requests the session to stop.
    ///
    /// The stop is carried out once the event being dispatched is continued:
    /// debuggees are then killed or detached from, depending on the
    /// `kill_on_exit` option.
    pub fn stop(&mut self) {
        tracing::debug!("stop requested");
        self.stop_requested = true;
    }

    /// Returns whether the session is stopped.
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Reads memory of a debuggee.
    pub fn read_memory(&self, pid: Pid, address: Address, buf: &mut [u8]) -> Result<()> {
        Ok(self.native.read_memory(pid, address, buf)?)
    }

    /// Writes memory of a debuggee.
    ///
    /// Bytes patched by code breakpoints are not accounted for.
    pub fn write_memory(&mut self, pid: Pid, address: Address, data: &[u8]) -> Result<()> {
        self.native.write_memory(pid, address, data)?;
        self.native
            .flush_instruction_cache(pid, address, data.len() as u64)?;
        Ok(())
    }

    /// Reads a pointer of the given architecture.
    pub fn read_pointer(&self, pid: Pid, address: Address, arch: Arch) -> Result<Address> {
        match arch {
            Arch::X86 => self.read_u32(pid, address).map(u64::from),
            Arch::X86_64 => self.read_u64(pid, address),
        }
    }

    pub(crate) fn read_u32(&self, pid: Pid, address: Address) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_memory(pid, address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn read_u64(&self, pid: Pid, address: Address) -> Result<u64> {
        let mut buf = [0; 8];
        self.read_memory(pid, address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads the string of an output-debug-string event.
    ///
    /// Returns `None` for other events. Trailing NUL characters are trimmed.
    pub fn debug_string(&self, event: &Event) -> Result<Option<String>> {
        let EventKind::OutputDebugString {
            address,
            length,
            unicode,
        } = *event.kind()
        else {
            return Ok(None);
        };

        let string = if unicode {
            let mut buf = vec![0; length as usize * 2];
            self.read_memory(event.pid(), address, &mut buf)?;

            let units = buf
                .chunks_exact(2)
                .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
                .collect::<Vec<_>>();

            String::from_utf16_lossy(&units)
        } else {
            let mut buf = vec![0; length as usize];
            self.read_memory(event.pid(), address, &mut buf)?;

            String::from_utf8_lossy(&buf).into_owned()
        };

        Ok(Some(string.trim_end_matches('\0').to_owned()))
    }

    /// Reads the register context of a thread.
    pub fn get_context(&self, pid: Pid, tid: Tid) -> Result<ThreadContext> {
        Ok(self.native.get_context(pid, tid)?)
    }

    /// Writes the register context of a thread.
    ///
    /// Debug registers held by hardware breakpoints are overwritten as well.
    pub fn set_context(&mut self, pid: Pid, tid: Tid, context: &ThreadContext) -> Result<()> {
        Ok(self.native.set_context(pid, tid, context)?)
    }

    /// Detaches from a debuggee, removing its breakpoints first.
    #[tracing::instrument(name = "Detach", skip(self))]
    pub fn detach(&mut self, pid: Pid) -> Result<()> {
        if !self.is_debuggee(pid) {
            return Err(Error::TargetGone);
        }

        let erased = self.erase_process_breakpoints(pid);

        for tid in self.threads(pid) {
            self.trace.forget(tid);
        }

        let detached = match self.native.detach(pid) {
            Ok(()) | Err(NativeError::TargetGone) => Ok(()),
            Err(e) => Err(e.into()),
        };

        self.debuggees.shift_remove(&pid);

        tracing::info!("detached");

        erased.and(detached)
    }

    /// Kills a debuggee.
    ///
    /// The process stays a debuggee until its exit event is dispatched.
    #[tracing::instrument(name = "Kill", skip(self))]
    pub fn kill(&mut self, pid: Pid) -> Result<()> {
        if !self.is_debuggee(pid) {
            return Err(Error::TargetGone);
        }

        match self.native.terminate(pid, 0) {
            Ok(()) | Err(NativeError::TargetGone) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases every debuggee, by killing or detaching from them.
    #[tracing::instrument(name = "Teardown", skip_all, fields(kill = self.options.kill_on_exit))]
    pub(crate) fn teardown(&mut self) -> Result<()> {
        let mut res = Ok(());

        if self.options.kill_on_exit {
            for pid in self.debuggee_pids() {
                tracing::info!(pid, "killing debuggee");

                res = res.and(self.kill(pid));
                self.purge_process(pid);
            }
        } else {
            for pid in self.debuggee_pids() {
                res = res.and(self.detach(pid));
            }
        }

        self.debuggees.clear();
        self.pending_detach.clear();
        self.stop_requested = false;
        self.stopped = true;

        res
    }
}

impl<N: NativeDebugger> Drop for Session<N> {
    fn drop(&mut self) {
        if self.stopped || self.debuggees.is_empty() {
            return;
        }

        if let Err(e) = self.teardown() {
            tracing::error!(error = %e, "failed to release debuggees");
        }
    }
}
