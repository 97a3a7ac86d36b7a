use indexmap::IndexMap;

use super::EventHandler;
use crate::event::Event;
use crate::native::Pid;
use crate::session::Session;

/// Event handler demultiplexing events by process.
///
/// Each debuggee gets its own instance of the wrapped handler, created by
/// `factory` on the first event of that process, and dropped after its
/// process exit event. Handlers can then be written as if a single process
/// was debugged.
///
/// ```
/// # use winstalk_engine::handler::{EventHandler, EventSift};
/// # use winstalk_engine::native::NativeDebugger;
/// # use std::marker::PhantomData;
/// struct DllCounter<N>(usize, PhantomData<N>);
///
/// impl<N> Default for DllCounter<N> {
///     fn default() -> Self {
///         Self(0, PhantomData)
///     }
/// }
///
/// impl<N: NativeDebugger> EventHandler for DllCounter<N> {
///     type Native = N;
///     type Error = std::convert::Infallible;
///
///     fn load_dll(
///         &mut self,
///         _session: &mut winstalk_engine::Session<N>,
///         _event: &mut winstalk_engine::event::Event,
///     ) -> Result<(), Self::Error> {
///         self.0 += 1;
///         Ok(())
///     }
/// }
///
/// # fn sift<N: NativeDebugger>() {
/// let sift = EventSift::<DllCounter<N>, _>::from_default();
/// assert_eq!(sift.pids().count(), 0);
/// # }
/// ```
pub struct EventSift<H, F> {
    factory: F,
    handlers: IndexMap<Pid, H>,
}

impl<H, F> EventSift<H, F>
where
    F: FnMut(Pid) -> H,
{
    /// Creates a sift building handler instances with `factory`.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            handlers: IndexMap::new(),
        }
    }

    /// Handler instance of a process, if it sent any event yet.
    pub fn handler(&self, pid: Pid) -> Option<&H> {
        self.handlers.get(&pid)
    }

    /// Handler instance of a process, mutably.
    pub fn handler_mut(&mut self, pid: Pid) -> Option<&mut H> {
        self.handlers.get_mut(&pid)
    }

    /// Processes with a live handler instance.
    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.handlers.keys().copied()
    }

}

impl<H, F> EventSift<H, F>
where
    H: EventHandler,
    F: FnMut(Pid) -> H,
{
    /// Handler instance of `pid`, created if needed.
    ///
    /// Instances of processes that left the session without an exit event
    /// (detached, or dropped after a RIP event) are released first.
    fn instance(&mut self, session: &Session<H::Native>, pid: Pid) -> &mut H {
        self.handlers.retain(|&owner, _| {
            let keep = owner == pid || session.is_debuggee(owner);
            if !keep {
                tracing::debug!(pid = owner, "handler instance dropped");
            }
            keep
        });

        let factory = &mut self.factory;

        self.handlers.entry(pid).or_insert_with(|| {
            tracing::debug!(pid, "new handler instance");
            factory(pid)
        })
    }
}

impl<H: Default> EventSift<H, fn(Pid) -> H> {
    /// Creates a sift building handler instances with [Default].
    pub fn from_default() -> Self {
        Self::new(|_| H::default())
    }
}

impl<H, F> EventHandler for EventSift<H, F>
where
    H: EventHandler,
    F: FnMut(Pid) -> H,
{
    type Native = H::Native;
    type Error = H::Error;

    fn event(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).event(session, event)
    }

    fn exception(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).exception(session, event)
    }

    fn breakpoint(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).breakpoint(session, event)
    }

    fn single_step(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).single_step(session, event)
    }

    fn guard_page(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).guard_page(session, event)
    }

    fn create_process(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).create_process(session, event)
    }

    fn create_thread(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).create_thread(session, event)
    }

    fn exit_process(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        let pid = event.pid();
        let res = self.instance(session, pid).exit_process(session, event);

        self.handlers.shift_remove(&pid);
        tracing::debug!(pid, "handler instance dropped");

        res
    }

    fn exit_thread(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).exit_thread(session, event)
    }

    fn load_dll(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).load_dll(session, event)
    }

    fn unload_dll(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).unload_dll(session, event)
    }

    fn output_string(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).output_string(session, event)
    }

    fn rip(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).rip(session, event)
    }

    fn unknown_event(
        &mut self,
        session: &mut Session<Self::Native>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.instance(session, event.pid()).unknown_event(session, event)
    }
}
