mod context;
mod event;
mod handle;
mod memory;
mod process;

use std::collections::HashMap;
use std::time::Duration;

use windows::Win32::Foundation::{BOOL, HANDLE, NTSTATUS};
use windows::Win32::System::Diagnostics::Debug::{
    CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, ContinueDebugEvent, DEBUG_EVENT,
    DebugActiveProcess, DebugActiveProcessStop, DebugSetProcessKillOnExit,
    EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT, WaitForDebugEvent,
};
use windows::Win32::System::Threading::{INFINITE, ResumeThread, SuspendThread, TerminateProcess};
use winstalk_engine::Command;
use winstalk_engine::native::{
    Address, MemoryRegion, NativeDebugger, NativeError, Pid, RawDebugEvent, ThreadContext, Tid,
};

use self::handle::OwnedHandle;
use crate::error::{Error, Result};

/// `ERROR_SEM_TIMEOUT`, reported by timed out waits.
const ERROR_SEM_TIMEOUT: u32 = 121;

const PAGE_SIZE: u64 = 0x1000;

/// A debugged process.
///
/// Its handles come from debug events: the OS closes them once the matching
/// exit event is continued.
struct Process {
    handle: HANDLE,
    threads: HashMap<Tid, HANDLE>,
    wow64: bool,
}

/// Native debugger built on the Win32 debug API.
///
/// Every method must be called from the thread that spawned or attached to
/// the debuggees, as the OS ties debug events to that thread.
pub struct Win32Debugger {
    processes: HashMap<Pid, Process>,
    /// Exit event waiting for its continue before its handles are dropped.
    exiting: Option<(Pid, Option<Tid>)>,
    kill_on_exit: Option<bool>,
}

impl Win32Debugger {
    /// Creates a debugger without debuggee.
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
            exiting: None,
            kill_on_exit: None,
        }
    }

    fn process(&self, pid: Pid) -> Result<&Process> {
        self.processes.get(&pid).ok_or(Error::UnknownProcess(pid))
    }

    fn thread(&self, pid: Pid, tid: Tid) -> Result<(HANDLE, bool)> {
        let process = self.process(pid)?;

        process
            .threads
            .get(&tid)
            .map(|&thread| (thread, process.wow64))
            .ok_or(Error::UnknownThread(tid))
    }

    /// Applies the kill-on-exit setting, once the thread debugs something.
    fn apply_kill_on_exit(&self) {
        let Some(kill_on_exit) = self.kill_on_exit else {
            return;
        };

        if let Err(e) = unsafe { DebugSetProcessKillOnExit(BOOL::from(kill_on_exit)) } {
            tracing::warn!(error = %e, kill_on_exit, "DebugSetProcessKillOnExit");
        }
    }

    /// Updates the process and thread tables with an event, and translates
    /// it.
    fn record(&mut self, event: &DEBUG_EVENT) -> RawDebugEvent {
        let (pid, tid) = (event.dwProcessId, event.dwThreadId);

        match event.dwDebugEventCode {
            CREATE_PROCESS_DEBUG_EVENT => {
                // SAFETY: the union member matches the event code
                let info = unsafe { &event.u.CreateProcessInfo };

                drop(OwnedHandle::new(info.hFile));

                let wow64 = process::is_wow64(info.hProcess).unwrap_or_else(|e| {
                    tracing::warn!(pid, error = %e, "cannot tell whether the debuggee is WOW64");
                    false
                });

                self.processes.insert(pid, Process {
                    handle: info.hProcess,
                    threads: HashMap::from([(tid, info.hThread)]),
                    wow64,
                });

                tracing::debug!(pid, tid, wow64, "process created");
            }
            CREATE_THREAD_DEBUG_EVENT => {
                // SAFETY: the union member matches the event code
                let thread = unsafe { event.u.CreateThread.hThread };

                if let Some(process) = self.processes.get_mut(&pid) {
                    process.threads.insert(tid, thread);
                }
            }
            LOAD_DLL_DEBUG_EVENT => {
                // SAFETY: the union member matches the event code
                drop(OwnedHandle::new(unsafe { event.u.LoadDll.hFile }));
            }
            EXIT_THREAD_DEBUG_EVENT => self.exiting = Some((pid, Some(tid))),
            EXIT_PROCESS_DEBUG_EVENT => self.exiting = Some((pid, None)),
            _ => (),
        }

        let (handle, wow64) = self
            .processes
            .get(&pid)
            .map_or((None, false), |process| (Some(process.handle), process.wow64));

        RawDebugEvent {
            code: event.dwDebugEventCode.0,
            process_id: pid,
            thread_id: tid,
            payload: event::payload(event, handle, wow64),
        }
    }

    /// Forgets a thread or process whose exit event was just continued.
    fn forget_exited(&mut self) {
        match self.exiting.take() {
            Some((pid, Some(tid))) => {
                if let Some(process) = self.processes.get_mut(&pid) {
                    process.threads.remove(&tid);
                }
            }
            Some((pid, None)) => {
                self.processes.remove(&pid);
                tracing::debug!(pid, "process handles released");
            }
            None => (),
        }
    }
}

impl Default for Win32Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDebugger for Win32Debugger {
    #[tracing::instrument(name = "CreateProcess", skip_all)]
    fn create_process(&mut self, command: &Command) -> core::result::Result<Pid, NativeError> {
        let pid = process::spawn(command)?;

        self.apply_kill_on_exit();

        Ok(pid)
    }

    fn attach(&mut self, pid: Pid) -> core::result::Result<(), NativeError> {
        unsafe { DebugActiveProcess(pid) }
            .map_err(|e| Error::from_hresult("DebugActiveProcess", e.code().0))?;

        self.apply_kill_on_exit();

        Ok(())
    }

    fn detach(&mut self, pid: Pid) -> core::result::Result<(), NativeError> {
        unsafe { DebugActiveProcessStop(pid) }
            .map_err(|e| Error::from_hresult("DebugActiveProcessStop", e.code().0))?;

        self.processes.remove(&pid);

        Ok(())
    }

    fn terminate(&mut self, pid: Pid, exit_code: u32) -> core::result::Result<(), NativeError> {
        let process = self.process(pid)?;

        unsafe { TerminateProcess(process.handle, exit_code) }
            .map_err(|e| Error::from_hresult("TerminateProcess", e.code().0))?;

        Ok(())
    }

    fn set_kill_on_exit(&mut self, kill_on_exit: bool) -> core::result::Result<(), NativeError> {
        self.kill_on_exit = Some(kill_on_exit);

        if !self.processes.is_empty() {
            self.apply_kill_on_exit();
        }

        Ok(())
    }

    fn wait_for_event(
        &mut self,
        timeout: Option<Duration>,
    ) -> core::result::Result<Option<RawDebugEvent>, NativeError> {
        let millis = timeout.map_or(INFINITE, |timeout| {
            u32::try_from(timeout.as_millis()).map_or(INFINITE - 1, |ms| ms.min(INFINITE - 1))
        });

        let mut event = DEBUG_EVENT::default();

        match unsafe { WaitForDebugEvent(&mut event, millis) } {
            Ok(()) => Ok(Some(self.record(&event))),
            Err(e) => match Error::from_hresult("WaitForDebugEvent", e.code().0) {
                Error::Os {
                    code: ERROR_SEM_TIMEOUT,
                    ..
                } => Ok(None),
                e => Err(e.into()),
            },
        }
    }

    fn continue_event(
        &mut self,
        pid: Pid,
        tid: Tid,
        status: u32,
    ) -> core::result::Result<(), NativeError> {
        let continued = unsafe { ContinueDebugEvent(pid, tid, NTSTATUS(status as i32)) }
            .map_err(|e| Error::from_hresult("ContinueDebugEvent", e.code().0));

        self.forget_exited();

        Ok(continued?)
    }

    fn read_memory(
        &self,
        pid: Pid,
        address: Address,
        buf: &mut [u8],
    ) -> core::result::Result<(), NativeError> {
        Ok(memory::read(self.process(pid)?.handle, address, buf)?)
    }

    fn write_memory(
        &mut self,
        pid: Pid,
        address: Address,
        data: &[u8],
    ) -> core::result::Result<(), NativeError> {
        Ok(memory::write(self.process(pid)?.handle, address, data)?)
    }

    fn query_memory(
        &self,
        pid: Pid,
        address: Address,
    ) -> core::result::Result<MemoryRegion, NativeError> {
        Ok(memory::query(self.process(pid)?.handle, address)?)
    }

    fn protect_memory(
        &mut self,
        pid: Pid,
        address: Address,
        size: u64,
        protect: u32,
    ) -> core::result::Result<u32, NativeError> {
        Ok(memory::protect(self.process(pid)?.handle, address, size, protect)?)
    }

    fn flush_instruction_cache(
        &mut self,
        pid: Pid,
        address: Address,
        size: u64,
    ) -> core::result::Result<(), NativeError> {
        Ok(memory::flush_instruction_cache(self.process(pid)?.handle, address, size)?)
    }

    fn get_context(&self, pid: Pid, tid: Tid) -> core::result::Result<ThreadContext, NativeError> {
        let (thread, wow64) = self.thread(pid, tid)?;

        Ok(context::read(thread, wow64)?)
    }

    fn set_context(
        &mut self,
        pid: Pid,
        tid: Tid,
        context: &ThreadContext,
    ) -> core::result::Result<(), NativeError> {
        let (thread, wow64) = self.thread(pid, tid)?;

        Ok(context::write(thread, wow64, context)?)
    }

    fn suspend_thread(&mut self, pid: Pid, tid: Tid) -> core::result::Result<(), NativeError> {
        let (thread, _) = self.thread(pid, tid)?;

        if unsafe { SuspendThread(thread) } == u32::MAX {
            let e = windows::core::Error::from_win32();
            return Err(Error::from_hresult("SuspendThread", e.code().0).into());
        }

        Ok(())
    }

    fn resume_thread(&mut self, pid: Pid, tid: Tid) -> core::result::Result<(), NativeError> {
        let (thread, _) = self.thread(pid, tid)?;

        if unsafe { ResumeThread(thread) } == u32::MAX {
            let e = windows::core::Error::from_win32();
            return Err(Error::from_hresult("ResumeThread", e.code().0).into());
        }

        Ok(())
    }

    fn page_size(&self) -> u64 {
        PAGE_SIZE
    }
}
