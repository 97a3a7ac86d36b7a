use std::time::Duration;

use super::Session;
use super::dispatch::Delivery;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::{Event, EventFactory};
use crate::handler::{self, EventHandler};
use crate::native::{NativeDebugger, NativeError, Pid};

/// Debugging session over any number of processes.
///
/// It runs the wait, dispatch and continue loop: every debug event is
/// turned into an [Event], checked against the session's breakpoints, routed
/// to the [EventHandler], and its thread is resumed.
///
/// Dropping it releases the debuggees (killing or detaching from them,
/// depending on the `kill_on_exit` option) if [stop](Self::stop) was not
/// called.
pub struct DebugSession<N: NativeDebugger, H> {
    pub(super) session: Session<N>,
    pub(super) handler: H,
}

impl<N, H> DebugSession<N, H>
where
    N: NativeDebugger,
    H: EventHandler<Native = N>,
{
    /// Spawns a process to debug.
    ///
    /// The process is suspended until its first events are dispatched.
    #[tracing::instrument(name = "Start", skip_all, fields(program = %command.program.display()))]
    pub fn start(&mut self, command: &Command) -> Result<Pid> {
        self.session
            .native
            .set_kill_on_exit(self.session.options.kill_on_exit)?;

        let pid = self.session.native.create_process(command)?;

        self.session.track_process(pid, false);
        self.session.stopped = false;

        tracing::info!(pid, "debuggee started");

        Ok(pid)
    }

    /// Attaches to a running process.
    #[tracing::instrument(name = "Attach", skip(self))]
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        self.session
            .native
            .set_kill_on_exit(self.session.options.kill_on_exit)?;

        self.session.native.attach(pid)?;

        self.session.track_process(pid, true);
        self.session.stopped = false;

        tracing::info!("debuggee attached");

        Ok(())
    }

    /// Waits for the next debug event.
    ///
    /// `None` blocks until an event arrives. `Ok(None)` means the wait timed
    /// out.
    #[tracing::instrument(name = "Wait", skip(self))]
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Event>> {
        let raw = self.session.native.wait_for_event(timeout)?;

        Ok(raw.map(EventFactory::from_raw))
    }

    /// Dispatches an event to the session's breakpoints and to the event
    /// handler.
    ///
    /// Whatever the outcome, the event must then be continued with
    /// [cont](Self::cont).
    #[tracing::instrument(
        name = "DebugEventDispatch",
        skip_all,
        fields(pid = event.pid(), tid = event.tid(), kind = event.name())
    )]
    pub fn dispatch(&mut self, event: &mut Event) -> Result<()> {
        let res = match self.session.prepare(event) {
            Ok(Delivery::Handler) => {
                handler::route(&mut self.handler, &mut self.session, event)
                    .map_err(|e| Error::Handler(Box::new(e)))
            }
            Ok(Delivery::Consumed) => Ok(()),
            Err(e) => Err(e),
        };

        self.session.finish(event);

        res
    }

    /// Resumes the thread that reported an event, with the event's continue
    /// status.
    ///
    /// Pending detaches and stop requests are carried out afterwards.
    pub fn cont(&mut self, event: &Event) -> Result<()> {
        let (pid, tid) = (event.pid(), event.tid());
        let status = event.continue_status();

        tracing::trace!(pid, tid, status = ?status, "continue");

        let mut res = match self.session.native.continue_event(pid, tid, status.code()) {
            Ok(()) | Err(NativeError::TargetGone) => Ok(()),
            Err(e) => Err(e.into()),
        };

        for pid in std::mem::take(&mut self.session.pending_detach) {
            if self.session.is_debuggee(pid) {
                res = res.and(self.session.detach(pid));
            }
        }

        if self.session.stop_requested {
            res = res.and(self.stop());
        }

        res
    }

    /// Waits for the next event, dispatches it and continues it.
    ///
    /// Returns `false` if the wait timed out. Dispatch errors are returned
    /// after the event is continued.
    pub fn next(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let Some(mut event) = self.wait(timeout)? else {
            return Ok(false);
        };

        let dispatched = self.dispatch(&mut event);
        let continued = self.cont(&event);

        dispatched.and(continued).map(|()| true)
    }

    /// Runs the session until every debuggee is gone or the session is
    /// stopped.
    ///
    /// Errors from event handlers and breakpoint actions are logged and the
    /// loop goes on. If waiting for or continuing an event fails, the session
    /// is stopped and the error returned.
    #[tracing::instrument(name = "Run", skip_all)]
    pub fn run(&mut self) -> Result<()> {
        while !self.session.stopped && self.session.debuggee_count() > 0 {
            let mut event = match self.wait(None) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => return self.abort(e),
            };

            if let Err(e) = self.dispatch(&mut event) {
                tracing::error!(error = %e, event = event.name(), "dispatch failed");
            }

            if let Err(e) = self.cont(&event) {
                return self.abort(e);
            }
        }

        tracing::info!("session over");

        Ok(())
    }

    fn abort(&mut self, err: Error) -> Result<()> {
        tracing::error!(error = %err, "session aborted");

        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "failed to release debuggees");
        }

        Err(err)
    }

    /// Stops the session, killing or detaching from every debuggee.
    pub fn stop(&mut self) -> Result<()> {
        self.session.teardown()
    }

    /// Session state.
    pub const fn session(&self) -> &Session<N> {
        &self.session
    }

    /// Session state, mutably.
    pub const fn session_mut(&mut self) -> &mut Session<N> {
        &mut self.session
    }

    /// Event handler.
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Event handler, mutably.
    pub const fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Returns the event handler, releasing the debuggees that are left.
    pub fn into_handler(self) -> H {
        self.handler
    }
}
