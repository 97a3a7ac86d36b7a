use std::cell::Cell;
use std::rc::Rc;

use test_log::test;
use winstalk_engine::breakpoint::{BreakpointKey, INT3, Trigger, WatchSize};
use winstalk_engine::event::{ContinueStatus, Event};
use winstalk_engine::native::PAGE_GUARD;
use winstalk_engine::{BoxError, Error, Session};

use crate::common::*;

const VARIABLE: u64 = 0x60_0100;

fn counting(
    hits: &Rc<Cell<usize>>,
) -> impl FnMut(&mut Session<FakeNative>, &mut Event) -> Result<(), BoxError> + 'static {
    let hits = hits.clone();

    move |_, _| {
        hits.set(hits.get() + 1);
        Ok(())
    }
}

#[test]
fn code_breakpoint_runs_its_action_on_every_hit() {
    let (mut debug, journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::Exec(ENTRY_POINT + 1)),
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::Exec(ENTRY_POINT + 1)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let hits = Rc::new(Cell::new(0));

    let session = debug.session_mut();
    session
        .break_at(PID, ENTRY_POINT, counting(&hits))
        .unwrap();
    assert_eq!(session.native().byte(PID, ENTRY_POINT), INT3);

    debug.run().unwrap();

    assert_eq!(hits.get(), 2);

    // hits with an action are consumed, only the loader breakpoint shows
    let handler = debug.handler();
    assert_eq!(handler.count("breakpoint"), 1);
    assert_eq!(handler.count("single_step"), 0);

    let journal = journal.borrow();
    assert_eq!(journal.statuses_of(EXCEPTION_BREAKPOINT), [DBG_CONTINUE; 3]);
    assert_eq!(journal.statuses_of(EXCEPTION_SINGLE_STEP), [DBG_CONTINUE; 2]);
}

#[test]
fn one_shot_breakpoint_is_gone_after_its_hit() {
    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let hits = Rc::new(Cell::new(0));
    let key = BreakpointKey::Code {
        pid: PID,
        address: ENTRY_POINT,
    };

    let session = debug.session_mut();
    session
        .stalk_at(PID, ENTRY_POINT, counting(&hits))
        .unwrap();
    assert!(session.get_breakpoint(&key).unwrap().is_one_shot());

    pump(&mut debug, 1);
    assert_eq!(hits.get(), 1);

    let session = debug.session_mut();
    assert!(!session.has_code_breakpoint(PID, ENTRY_POINT));
    assert_eq!(session.native().byte(PID, ENTRY_POINT), 0);

    // removing it after its hit is fine
    session.dont_stalk_at(PID, ENTRY_POINT).unwrap();

    debug.run().unwrap();
    assert_eq!(hits.get(), 1);
}

#[test]
fn interactive_breakpoint_hits_reach_the_handler() {
    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::Exec(ENTRY_POINT + 1)),
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let session = debug.session_mut();
    let key = session.define_code_breakpoint(PID, ENTRY_POINT).unwrap();
    assert!(session.get_breakpoint(&key).unwrap().is_disabled());
    assert_eq!(session.native().byte(PID, ENTRY_POINT), 0);

    session.enable_breakpoint(&key).unwrap();

    debug.run().unwrap();

    let hits = debug.handler().of("breakpoint");
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].breakpoint, None);

    for hit in &hits[1..] {
        assert_eq!(hit.breakpoint, Some(key));
        assert_eq!(hit.status, ContinueStatus::Continue);
    }
}

#[test]
fn disabled_breakpoint_lifts_its_trap() {
    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let hits = Rc::new(Cell::new(0));

    let session = debug.session_mut();
    session
        .break_at(PID, ENTRY_POINT, counting(&hits))
        .unwrap();

    let key = BreakpointKey::Code {
        pid: PID,
        address: ENTRY_POINT,
    };
    session.disable_breakpoint(&key).unwrap();
    assert_eq!(session.native().byte(PID, ENTRY_POINT), 0);

    // the action is kept
    assert!(!session.get_breakpoint(&key).unwrap().is_interactive());

    debug.run().unwrap();
    assert_eq!(hits.get(), 0);
}

#[test]
fn condition_filters_hits() {
    let script = (0..3)
        .flat_map(|_| {
            [
                step(PID, TID, Op::Exec(ENTRY_POINT)),
                step(PID, TID, Op::Exec(ENTRY_POINT + 1)),
            ]
        })
        .chain([step(PID, TID, Op::ExitProcess(0))]);

    let (mut debug, journal) = launch(script);

    let hits = Rc::new(Cell::new(0));
    let checks = Rc::new(Cell::new(0));

    let session = debug.session_mut();
    session
        .break_at(PID, ENTRY_POINT, counting(&hits))
        .unwrap();

    let counter = checks.clone();
    session
        .set_condition(
            &BreakpointKey::Code {
                pid: PID,
                address: ENTRY_POINT,
            },
            move |_, _| {
                counter.set(counter.get() + 1);
                counter.get() == 2
            },
        )
        .unwrap();

    debug.run().unwrap();

    assert_eq!(checks.get(), 3);
    assert_eq!(hits.get(), 1);

    // every hit is consumed and stepped over
    assert_eq!(debug.handler().count("breakpoint"), 1);
    assert_eq!(
        journal.borrow().statuses_of(EXCEPTION_BREAKPOINT),
        [DBG_CONTINUE; 4]
    );
}

#[test]
fn targets_are_owned_once() {
    let (mut debug, _journal) = launch([step(PID, TID, Op::ExitProcess(0))]);
    let session = debug.session_mut();

    let code = session.define_code_breakpoint(PID, ENTRY_POINT).unwrap();
    assert!(matches!(
        session.define_code_breakpoint(PID, ENTRY_POINT),
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        session.break_at(PID, ENTRY_POINT, |_, _| Ok(())),
        Err(Error::Conflict(_))
    ));

    session
        .define_page_breakpoint(PID, 0x60_0000, 0x2000)
        .unwrap();
    assert!(matches!(
        session.define_page_breakpoint(PID, 0x60_1000, 0x1000),
        Err(Error::Conflict(_))
    ));

    let hardware = session
        .define_hardware_breakpoint(TID, VARIABLE, Trigger::Write, WatchSize::Dword)
        .unwrap();
    assert!(matches!(
        session.define_hardware_breakpoint(TID, VARIABLE, Trigger::ReadWrite, WatchSize::Byte),
        Err(Error::Conflict(_))
    ));

    // a target can be taken again once freed
    session.erase_breakpoint(&code).unwrap();
    session.define_code_breakpoint(PID, ENTRY_POINT).unwrap();

    session.erase_breakpoint(&hardware).unwrap();
    session
        .define_hardware_breakpoint(TID, VARIABLE, Trigger::ReadWrite, WatchSize::Byte)
        .unwrap();

    debug.run().unwrap();
}

#[test]
fn invalid_targets_are_rejected() {
    let (mut debug, _journal) = launch([step(PID, TID, Op::ExitProcess(0))]);
    let session = debug.session_mut();

    assert!(matches!(
        session.define_page_breakpoint(PID, 0x60_0010, 0x1000),
        Err(Error::InvalidTarget { .. })
    ));
    assert!(matches!(
        session.define_page_breakpoint(PID, 0x60_0000, 0x10),
        Err(Error::InvalidTarget { .. })
    ));
    assert!(matches!(
        session.define_hardware_breakpoint(TID, ENTRY_POINT, Trigger::Execute, WatchSize::Dword),
        Err(Error::InvalidTarget { .. })
    ));
    assert!(matches!(
        session.define_hardware_breakpoint(TID, VARIABLE + 2, Trigger::Write, WatchSize::Dword),
        Err(Error::InvalidTarget { .. })
    ));
    assert!(matches!(
        session.define_hardware_breakpoint(TID, VARIABLE, Trigger::Io, WatchSize::Byte),
        Err(Error::InvalidTarget { .. })
    ));
    assert!(matches!(
        session.watch_variable(TID, VARIABLE, 3, |_, _| Ok(())),
        Err(Error::InvalidTarget { .. })
    ));

    assert!(matches!(
        session.define_code_breakpoint(99, ENTRY_POINT),
        Err(Error::TargetGone)
    ));
    assert!(matches!(
        session.define_hardware_breakpoint(999, VARIABLE, Trigger::Write, WatchSize::Byte),
        Err(Error::TargetGone)
    ));

    debug.run().unwrap();
}

#[test]
fn removal_is_idempotent() {
    let (mut debug, _journal) = launch([step(PID, TID, Op::ExitProcess(0))]);
    let session = debug.session_mut();

    session
        .break_at(PID, ENTRY_POINT, |_, _| Ok(()))
        .unwrap();

    session.dont_break_at(PID, ENTRY_POINT).unwrap();
    session.dont_break_at(PID, ENTRY_POINT).unwrap();

    assert!(matches!(
        session.dont_break_at(PID, ENTRY_POINT + 1),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        session.enable_breakpoint(&BreakpointKey::Code {
            pid: PID,
            address: ENTRY_POINT
        }),
        Err(Error::NotFound(_))
    ));

    debug.run().unwrap();

    // every breakpoint of a gone process is gone too
    debug
        .session_mut()
        .dont_break_at(PID, ENTRY_POINT + 1)
        .unwrap();
}

#[test]
fn debug_registers_run_out() {
    let (mut debug, _journal) = launch([step(PID, TID, Op::ExitProcess(0))]);
    let session = debug.session_mut();

    for i in 0..4 {
        session
            .watch_variable(TID, VARIABLE + 8 * i, 8, |_, _| Ok(()))
            .unwrap();
    }

    let slots = session
        .thread_hardware_breakpoints(TID)
        .filter_map(|bp| bp.slot())
        .collect::<Vec<_>>();
    assert_eq!(slots, [0, 1, 2, 3]);

    let extra = VARIABLE + 0x40;

    assert!(matches!(
        session.watch_variable(TID, extra, 8, |_, _| Ok(())),
        Err(Error::ResourceExhausted(TID))
    ));
    assert!(!session.has_hardware_breakpoint(TID, extra));

    session.dont_watch_variable(TID, VARIABLE).unwrap();
    session
        .watch_variable(TID, extra, 8, |_, _| Ok(()))
        .unwrap();

    let context = session.get_context(PID, TID).unwrap();
    assert_eq!(context.dr[0], extra);

    debug.run().unwrap();
}

#[test]
fn variable_watch_fires_on_access() {
    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Access {
            address: VARIABLE,
            write: true,
        }),
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::Access {
            address: VARIABLE + 0x10,
            write: true,
        }),
        step(PID, TID, Op::Exec(ENTRY_POINT + 1)),
        step(PID, TID, Op::Access {
            address: VARIABLE + 2,
            write: false,
        }),
        step(PID, TID, Op::Exec(ENTRY_POINT + 2)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let hits = Rc::new(Cell::new(0));

    debug
        .session_mut()
        .watch_variable(TID, VARIABLE, 4, counting(&hits))
        .unwrap();

    debug.run().unwrap();

    assert_eq!(hits.get(), 2);
    assert_eq!(debug.handler().count("single_step"), 0);
}

#[test]
fn one_shot_hardware_breakpoint_reaches_the_handler() {
    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let session = debug.session_mut();
    let key = session
        .define_hardware_breakpoint(TID, ENTRY_POINT, Trigger::Execute, WatchSize::Byte)
        .unwrap();
    session.enable_one_shot_breakpoint(&key).unwrap();

    pump(&mut debug, 1);

    let steps = debug.handler().of("single_step");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].breakpoint, Some(key));
    assert_eq!(steps[0].status, ContinueStatus::Continue);

    let session = debug.session();
    assert!(!session.has_hardware_breakpoint(TID, ENTRY_POINT));
    assert_eq!(session.get_context(PID, TID).unwrap().dr7, 0);

    debug.run().unwrap();
    assert_eq!(debug.handler().count("single_step"), 1);
}

#[test]
fn traced_thread_reports_every_step() {
    let (mut debug, journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::Exec(ENTRY_POINT + 1)),
        step(PID, TID, Op::Exec(ENTRY_POINT + 2)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    debug.session_mut().start_tracing(TID).unwrap();
    assert!(debug.session().is_tracing(TID));

    pump(&mut debug, 2);
    debug.session_mut().stop_tracing(TID).unwrap();
    assert!(!debug.session().get_context(PID, TID).unwrap().trap_flag());

    debug.run().unwrap();

    assert_eq!(debug.handler().count("single_step"), 2);
    assert_eq!(
        journal.borrow().statuses_of(EXCEPTION_SINGLE_STEP),
        [DBG_CONTINUE; 2]
    );
}

#[test]
fn tracing_survives_breakpoint_steps() {
    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::Exec(ENTRY_POINT + 1)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let hits = Rc::new(Cell::new(0));

    let session = debug.session_mut();
    session
        .break_at(PID, ENTRY_POINT, counting(&hits))
        .unwrap();
    session.start_tracing(TID).unwrap();

    debug.run().unwrap();

    assert_eq!(hits.get(), 1);

    // out of the loader breakpoint, over the trapped instruction, then the
    // next one: the internal step does not swallow the traced one
    assert_eq!(debug.handler().count("single_step"), 3);
}

#[test]
fn failed_removal_keeps_the_breakpoint() {
    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let hits = Rc::new(Cell::new(0));

    let session = debug.session_mut();
    session
        .break_at(PID, ENTRY_POINT, counting(&hits))
        .unwrap();

    session.native_mut().deny(PID, ENTRY_POINT);
    assert!(matches!(
        session.dont_break_at(PID, ENTRY_POINT),
        Err(Error::Os(5))
    ));
    assert!(session.has_code_breakpoint(PID, ENTRY_POINT));
    assert_eq!(session.native().byte(PID, ENTRY_POINT), INT3);

    // still owned, so its trap is claimed
    session.native_mut().allow(PID, ENTRY_POINT);
    debug.run().unwrap();
    assert_eq!(hits.get(), 1);
    assert_eq!(debug.handler().count("breakpoint"), 1);
}

#[test]
fn removal_can_be_retried() {
    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let hits = Rc::new(Cell::new(0));

    let session = debug.session_mut();
    session
        .break_at(PID, ENTRY_POINT, counting(&hits))
        .unwrap();

    session.native_mut().deny(PID, ENTRY_POINT);
    assert!(session.dont_break_at(PID, ENTRY_POINT).is_err());

    session.native_mut().allow(PID, ENTRY_POINT);
    session.dont_break_at(PID, ENTRY_POINT).unwrap();
    assert!(!session.has_code_breakpoint(PID, ENTRY_POINT));
    assert_eq!(session.native().byte(PID, ENTRY_POINT), 0);

    debug.run().unwrap();
    assert_eq!(hits.get(), 0);
}

#[test]
fn failed_placement_leaves_nothing_behind() {
    let (mut debug, _journal) = launch([step(PID, TID, Op::ExitProcess(0))]);

    let session = debug.session_mut();
    session.native_mut().deny(PID, ENTRY_POINT);

    assert!(matches!(
        session.break_at(PID, ENTRY_POINT, |_, _| Ok(())),
        Err(Error::Os(5))
    ));
    assert!(!session.has_code_breakpoint(PID, ENTRY_POINT));
    assert_eq!(session.native().byte(PID, ENTRY_POINT), 0);

    session.native_mut().allow(PID, ENTRY_POINT);
    session.break_at(PID, ENTRY_POINT, |_, _| Ok(())).unwrap();

    debug.run().unwrap();
}

#[test]
fn partially_guarded_pages_are_rolled_back() {
    const PAGE: u64 = 0x60_0000;

    let (mut debug, _journal) = launch([
        step(PID, TID, Op::Access {
            address: PAGE + 0x10,
            write: false,
        }),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let session = debug.session_mut();
    let key = session.define_page_breakpoint(PID, PAGE, 0x2000).unwrap();

    // the second page cannot be guarded
    session.native_mut().deny(PID, PAGE + 0x1000);
    assert!(matches!(
        session.enable_breakpoint(&key),
        Err(Error::Os(5))
    ));

    assert!(session.get_breakpoint(&key).unwrap().is_disabled());
    assert_eq!(session.native().protection(PID, PAGE) & PAGE_GUARD, 0);
    assert_eq!(session.native().protection(PID, PAGE + 0x1000) & PAGE_GUARD, 0);

    debug.run().unwrap();
    assert_eq!(debug.handler().count("guard_page"), 0);
}
