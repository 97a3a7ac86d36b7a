//! Debug event handlers.

mod sift;

pub use self::sift::EventSift;

use crate::event::{Event, EventKind, ExceptionCode};
use crate::native::NativeDebugger;
use crate::session::Session;

/// Trait for implementing a debug event handler.
///
/// Every method has a default implementation falling back to a more generic
/// one: the breakpoint, single-step and guard page methods fall back to
/// [exception](Self::exception), which falls back to [event](Self::event),
/// like every other method. `event` does nothing.
///
/// Handlers decide how the reporting thread resumes by changing the
/// event's [continue status](Event::set_continue_status).
pub trait EventHandler {
    /// Native debugger of the session this handler is used with.
    type Native: NativeDebugger;

    /// Error returned by this event handler.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Function called for every event without a more specific handler.
    fn event(
        &mut self,
        _session: &mut Session<Self::Native>,
        _event: &mut Event,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Function called when an exception is raised in a debuggee.
    fn exception(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called when a breakpoint trap is hit.
    ///
    /// This includes the hits of breakpoints without an action, and traps
    /// that are not owned by the session (such as the loader breakpoint of
    /// each process).
    fn breakpoint(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.exception(session, event)
    }

    /// Function called when a thread single-steps.
    ///
    /// This includes every step of [traced](Session::start_tracing) threads
    /// and hits of hardware breakpoints without an action.
    fn single_step(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.exception(session, event)
    }

    /// Function called when a guard page is touched.
    fn guard_page(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.exception(session, event)
    }

    /// Function called when a process is created or attached to.
    fn create_process(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called when a thread is created.
    fn create_thread(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called when a process exits.
    ///
    /// Its breakpoints are already gone, but it is still a debuggee.
    fn exit_process(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called when a thread exits.
    fn exit_thread(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called when a DLL is loaded.
    fn load_dll(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called when a DLL is unloaded.
    fn unload_dll(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called when a debuggee outputs a debug string.
    ///
    /// The string can be read with [Session::debug_string].
    fn output_string(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called on a system debugging error.
    ///
    /// The process is detached from once the event is continued.
    fn rip(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }

    /// Function called for event codes unknown to this crate.
    fn unknown_event(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.event(session, event)
    }
}

/// Handler method an event is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Breakpoint,
    SingleStep,
    GuardPage,
    Exception,
    CreateProcess,
    CreateThread,
    ExitProcess,
    ExitThread,
    LoadDll,
    UnloadDll,
    OutputString,
    Rip,
    Unknown,
}

impl Method {
    pub(crate) fn of(event: &Event) -> Self {
        match event.kind() {
            EventKind::Exception(info) => match info.code {
                code if code.is_breakpoint() => Self::Breakpoint,
                code if code.is_single_step() => Self::SingleStep,
                ExceptionCode::GuardPage => Self::GuardPage,
                _ => Self::Exception,
            },
            EventKind::CreateProcess { .. } => Self::CreateProcess,
            EventKind::CreateThread { .. } => Self::CreateThread,
            EventKind::ExitProcess { .. } => Self::ExitProcess,
            EventKind::ExitThread { .. } => Self::ExitThread,
            EventKind::LoadDll { .. } => Self::LoadDll,
            EventKind::UnloadDll { .. } => Self::UnloadDll,
            EventKind::OutputDebugString { .. } => Self::OutputString,
            EventKind::Rip { .. } => Self::Rip,
            EventKind::Unknown { .. } => Self::Unknown,
        }
    }
}

/// Calls the handler method matching an event.
pub(crate) fn route<H: EventHandler>(
    handler: &mut H,
    session: &mut Session<H::Native>,
    event: &mut Event,
) -> Result<(), H::Error> {
    match Method::of(event) {
        Method::Breakpoint => handler.breakpoint(session, event),
        Method::SingleStep => handler.single_step(session, event),
        Method::GuardPage => handler.guard_page(session, event),
        Method::Exception => handler.exception(session, event),
        Method::CreateProcess => handler.create_process(session, event),
        Method::CreateThread => handler.create_thread(session, event),
        Method::ExitProcess => handler.exit_process(session, event),
        Method::ExitThread => handler.exit_thread(session, event),
        Method::LoadDll => handler.load_dll(session, event),
        Method::UnloadDll => handler.unload_dll(session, event),
        Method::OutputString => handler.output_string(session, event),
        Method::Rip => handler.rip(session, event),
        Method::Unknown => handler.unknown_event(session, event),
    }
}
