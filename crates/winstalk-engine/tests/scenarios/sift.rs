use std::cell::RefCell;
use std::rc::Rc;

use test_log::test;
use winstalk_engine::handler::EventSift;
use winstalk_engine::native::Pid;
use winstalk_engine::{Builder, Command, DebugSession};

use crate::common::*;

const CHILD: u32 = 8;
const CHILD_TID: u32 = 80;

fn script() -> Vec<Step> {
    let mut steps = boot(PID, TID);
    steps.extend(boot(CHILD, CHILD_TID));
    steps.extend([
        step(PID, TID, Op::LoadDll(0x7ff0_0000)),
        step(CHILD, CHILD_TID, Op::LoadDll(0x7ff0_0000)),
        step(CHILD, CHILD_TID, Op::LoadDll(0x7ff1_0000)),
        step(CHILD, CHILD_TID, Op::ExitProcess(0)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);
    steps
}

#[test]
fn each_process_gets_its_own_handler() {
    let created = Rc::new(RefCell::new(Vec::new()));

    let sift = {
        let created = created.clone();

        EventSift::new(move |pid| {
            created.borrow_mut().push(pid);
            RecordingHandler::default()
        })
    };

    let (native, _journal) = FakeNative::new(script());

    let mut debug = Builder::new()
        .with_native(native)
        .with_event_handler(sift)
        .build();

    debug.start(&Command::new("target.exe")).unwrap();

    // both boots and every library load
    pump(&mut debug, 7);

    let sift = debug.handler();
    assert_eq!(sift.pids().collect::<Vec<_>>(), [PID, CHILD]);
    assert_eq!(*created.borrow(), [PID, CHILD]);

    let parent = sift.handler(PID).unwrap();
    assert_eq!(parent.methods(), ["create_process", "breakpoint", "load_dll"]);
    assert!(parent.seen.iter().all(|seen| seen.pid == PID));

    let child = sift.handler(CHILD).unwrap();
    assert_eq!(child.count("load_dll"), 2);
    assert!(child.seen.iter().all(|seen| seen.pid == CHILD));

    // the child's instance goes away with its process
    pump(&mut debug, 1);
    assert!(debug.handler().handler(CHILD).is_none());
    assert_eq!(debug.handler().pids().collect::<Vec<_>>(), [PID]);

    debug.run().unwrap();

    assert_eq!(debug.handler().pids().count(), 0);
    assert_eq!(*created.borrow(), [PID, CHILD]);
}

#[test]
fn default_instances_are_built_lazily() {
    let (native, _journal) = FakeNative::new(script());

    let mut debug = Builder::new()
        .with_native(native)
        .with_event_handler(EventSift::<RecordingHandler, _>::from_default())
        .build();

    debug.start(&Command::new("target.exe")).unwrap();
    assert_eq!(debug.handler().pids().count(), 0);

    pump(&mut debug, 2);
    assert_eq!(debug.handler().pids().collect::<Vec<_>>(), [PID]);

    debug
        .handler_mut()
        .handler_mut(PID)
        .unwrap()
        .seen
        .clear();

    pump(&mut debug, 3);

    let parent = debug.handler().handler(PID).unwrap();
    assert_eq!(parent.methods(), ["load_dll"]);

    debug.run().unwrap();
}

type Log = Rc<RefCell<Vec<(Pid, &'static str)>>>;

/// Sift whose instances append what they get to `log`, counting creations
/// in `created`.
fn logging_sift(
    log: &Log,
    created: &Rc<RefCell<Vec<Pid>>>,
) -> EventSift<RecordingHandler, impl FnMut(Pid) -> RecordingHandler> {
    let (log, created) = (log.clone(), created.clone());

    EventSift::new(move |pid| {
        created.borrow_mut().push(pid);

        ["create_process", "breakpoint", "load_dll", "exit_process"]
            .into_iter()
            .fold(RecordingHandler::default(), |handler, method| {
                let log = log.clone();
                handler.on(method, move |_, event| {
                    log.borrow_mut().push((event.pid(), method));
                })
            })
    })
}

fn run_logged(script: Vec<Step>) -> (Vec<(Pid, &'static str)>, Vec<Pid>) {
    let log = Log::default();
    let created = Rc::new(RefCell::new(Vec::new()));

    let (native, _journal) = FakeNative::new(script);

    let mut debug = Builder::new()
        .with_native(native)
        .with_event_handler(logging_sift(&log, &created))
        .build();

    debug.start(&Command::new("target.exe")).unwrap();
    debug.run().unwrap();

    assert_eq!(debug.handler().pids().count(), 0);

    let log = log.borrow().clone();
    let created = created.borrow().clone();
    (log, created)
}

#[test]
fn interleaved_processes_see_what_they_would_alone() {
    let mut interleaved = boot(PID, TID);
    interleaved.extend(boot(CHILD, CHILD_TID));
    interleaved.extend([
        step(PID, TID, Op::LoadDll(0x7ff0_0000)),
        step(CHILD, CHILD_TID, Op::LoadDll(0x7ff0_0000)),
        step(PID, TID, Op::ExitProcess(0)),
        step(CHILD, CHILD_TID, Op::LoadDll(0x7ff1_0000)),
        step(CHILD, CHILD_TID, Op::ExitProcess(0)),
    ]);

    let mut alone = boot(PID, TID);
    alone.extend([
        step(PID, TID, Op::LoadDll(0x7ff0_0000)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let (log, created) = run_logged(interleaved);
    let (alone_log, _) = run_logged(alone);

    assert_eq!(created, [PID, CHILD]);

    let parent: Vec<_> = log.iter().filter(|(pid, _)| *pid == PID).copied().collect();
    assert_eq!(parent, alone_log);

    // the child outlives its parent with the same instance
    let child: Vec<_> = log
        .iter()
        .filter(|(pid, _)| *pid == CHILD)
        .map(|&(_, method)| method)
        .collect();
    assert_eq!(child, [
        "create_process",
        "breakpoint",
        "load_dll",
        "load_dll",
        "exit_process"
    ]);
}

type Sifted = DebugSession<FakeNative, EventSift<RecordingHandler, fn(Pid) -> RecordingHandler>>;

fn sifted(script: Vec<Step>) -> Sifted {
    let (native, _journal) = FakeNative::new(script);

    let mut debug = Builder::new()
        .with_native(native)
        .with_event_handler(EventSift::from_default())
        .build();

    debug.start(&Command::new("target.exe")).unwrap();
    debug
}

#[test]
fn detached_processes_lose_their_handler() {
    let mut steps = boot(PID, TID);
    steps.extend(boot(CHILD, CHILD_TID));
    steps.extend([
        step(PID, TID, Op::LoadDll(0x7ff0_0000)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let mut debug = sifted(steps);
    pump(&mut debug, 4);

    debug.session_mut().detach(CHILD).unwrap();
    assert_eq!(debug.handler().pids().collect::<Vec<_>>(), [PID, CHILD]);

    // released on the next event
    pump(&mut debug, 1);
    assert_eq!(debug.handler().pids().collect::<Vec<_>>(), [PID]);

    debug.run().unwrap();
    assert_eq!(debug.handler().pids().count(), 0);
}

#[test]
fn rip_events_release_the_handler() {
    let mut steps = boot(PID, TID);
    steps.extend(boot(CHILD, CHILD_TID));
    steps.extend([
        step(CHILD, CHILD_TID, Op::Rip),
        step(PID, TID, Op::LoadDll(0x7ff0_0000)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let mut debug = sifted(steps);
    pump(&mut debug, 5);

    assert!(!debug.session().is_debuggee(CHILD));
    assert_eq!(debug.handler().handler(CHILD).unwrap().methods(), [
        "create_process",
        "breakpoint",
        "rip"
    ]);

    pump(&mut debug, 1);
    assert!(debug.handler().handler(CHILD).is_none());

    debug.run().unwrap();
}
