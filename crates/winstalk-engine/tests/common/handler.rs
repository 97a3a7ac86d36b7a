use std::collections::HashMap;

use winstalk_engine::Session;
use winstalk_engine::breakpoint::BreakpointKey;
use winstalk_engine::event::{ContinueStatus, Event, ExceptionCode};
use winstalk_engine::handler::EventHandler;
use winstalk_engine::native::{Pid, Tid};

use super::FakeNative;

#[derive(Debug, thiserror::Error)]
#[error("handler refused {0}")]
pub struct Refused(pub &'static str);

/// An event as seen by a [RecordingHandler], after its reaction ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub method: &'static str,
    pub pid: Pid,
    pub tid: Tid,
    pub exception: Option<ExceptionCode>,
    pub breakpoint: Option<BreakpointKey>,
    pub status: ContinueStatus,
}

type Reaction = Box<dyn FnMut(&mut Session<FakeNative>, &mut Event)>;

/// Event handler recording every event it gets.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Vec<Seen>,
    reactions: HashMap<&'static str, Reaction>,
    refused: Vec<&'static str>,
}

impl RecordingHandler {
    /// Runs `reaction` on every event routed to `method`.
    pub fn on<F>(mut self, method: &'static str, reaction: F) -> Self
    where
        F: FnMut(&mut Session<FakeNative>, &mut Event) + 'static,
    {
        self.reactions.insert(method, Box::new(reaction));
        self
    }

    /// Fails every event routed to `method`.
    pub fn refusing(mut self, method: &'static str) -> Self {
        self.refused.push(method);
        self
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.seen.iter().map(|seen| seen.method).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.seen.iter().filter(|seen| seen.method == method).count()
    }

    pub fn of(&self, method: &str) -> Vec<&Seen> {
        self.seen.iter().filter(|seen| seen.method == method).collect()
    }

    fn record(
        &mut self,
        method: &'static str,
        session: &mut Session<FakeNative>,
        event: &mut Event,
    ) -> Result<(), Refused> {
        if let Some(reaction) = self.reactions.get_mut(method) {
            reaction(session, event);
        }

        self.seen.push(Seen {
            method,
            pid: event.pid(),
            tid: event.tid(),
            exception: event.exception_code(),
            breakpoint: event.breakpoint(),
            status: event.continue_status(),
        });

        if self.refused.contains(&method) {
            return Err(Refused(method));
        }

        Ok(())
    }
}

macro_rules! recorded {
    ($($method:ident),* $(,)?) => {
        $(
            fn $method(
                &mut self,
                session: &mut Session<FakeNative>,
                event: &mut Event,
            ) -> Result<(), Self::Error> {
                self.record(stringify!($method), session, event)
            }
        )*
    };
}

impl EventHandler for RecordingHandler {
    type Native = FakeNative;
    type Error = Refused;

    recorded!(
        breakpoint,
        single_step,
        guard_page,
        exception,
        create_process,
        create_thread,
        exit_process,
        exit_thread,
        load_dll,
        unload_dll,
        output_string,
        rip,
        unknown_event,
    );
}
