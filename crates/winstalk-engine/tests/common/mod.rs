mod handler;

use std::cell::RefCell;
use std::rc::Rc;

use winstalk_engine::handler::EventHandler;
use winstalk_engine::native::{Pid, Tid};
use winstalk_engine::{Builder, Command, DebugSession};

pub use self::fake::*;
pub use self::handler::*;

pub const PID: Pid = 4;
pub const TID: Tid = 40;

pub type TestSession = DebugSession<FakeNative, RecordingHandler>;
pub type SharedJournal = Rc<RefCell<Journal>>;

/// Creation of the main thread, then the loader breakpoint.
pub fn boot(pid: Pid, tid: Tid) -> Vec<Step> {
    vec![
        step(pid, tid, Op::CreateProcess),
        step(pid, tid, Op::Raise(EXCEPTION_BREAKPOINT)),
    ]
}

/// Session running `script`, with the debuggee spawned but no event
/// dispatched yet.
pub fn spawn(
    script: impl IntoIterator<Item = Step>,
    handler: RecordingHandler,
) -> (TestSession, SharedJournal) {
    let (native, journal) = FakeNative::new(script);

    let mut debug = Builder::new()
        .with_native(native)
        .with_event_handler(handler)
        .build();

    debug.start(&Command::new("target.exe")).expect("start");

    (debug, journal)
}

/// Session running [boot] followed by `script`, past the loader breakpoint.
pub fn launch(script: impl IntoIterator<Item = Step>) -> (TestSession, SharedJournal) {
    launch_with(script, RecordingHandler::default())
}

pub fn launch_with(
    script: impl IntoIterator<Item = Step>,
    handler: RecordingHandler,
) -> (TestSession, SharedJournal) {
    let mut steps = boot(PID, TID);
    steps.extend(script);

    let (mut debug, journal) = spawn(steps, handler);
    pump(&mut debug, 2);

    (debug, journal)
}

/// Dispatches the next `count` events.
pub fn pump<H>(debug: &mut DebugSession<FakeNative, H>, count: usize)
where
    H: EventHandler<Native = FakeNative>,
{
    for _ in 0..count {
        assert!(debug.next(None).expect("next"));
    }
}
