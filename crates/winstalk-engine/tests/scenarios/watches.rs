use std::cell::RefCell;
use std::rc::Rc;

use test_log::test;
use winstalk_engine::event::{AccessType, Event};
use winstalk_engine::native::PAGE_GUARD;
use winstalk_engine::{BoxError, Error, Session};

use crate::common::*;

const PAGE: u64 = 0x60_0000;

type Log = Rc<RefCell<Vec<(&'static str, u64)>>>;

fn logging(
    log: &Log,
    name: &'static str,
) -> impl FnMut(&mut Session<FakeNative>, &mut Event) -> Result<(), BoxError> + 'static {
    let log = log.clone();

    move |_, event| {
        let info = event.exception().expect("guard page hit");
        log.borrow_mut()
            .push((name, info.fault_address().expect("fault address")));
        Ok(())
    }
}

fn access(address: u64, write: bool) -> [Step; 2] {
    [
        step(PID, TID, Op::Access { address, write }),
        step(PID, TID, Op::Exec(ENTRY_POINT)),
    ]
}

fn accesses(list: &[(u64, bool)]) -> Vec<Step> {
    list.iter()
        .flat_map(|&(address, write)| access(address, write))
        .chain([step(PID, TID, Op::ExitProcess(0))])
        .collect()
}

#[test]
fn only_accesses_within_the_range_run_the_action() {
    let (mut debug, _journal) = launch(accesses(&[
        (PAGE, true),
        (PAGE + 0x110, false),
        (PAGE + 0x200, false),
        (PAGE + 0x11f, true),
    ]));

    let log = Log::default();

    let session = debug.session_mut();
    session
        .watch_buffer(PID, PAGE + 0x100, 0x20, logging(&log, "buffer"))
        .unwrap();
    assert!(session.is_buffer_watched(PID, PAGE + 0x100, 0x20));
    assert!(session.has_page_breakpoint(PID, PAGE));

    debug.run().unwrap();

    assert_eq!(*log.borrow(), [("buffer", PAGE + 0x110), ("buffer", PAGE + 0x11f)]);

    // every guard page hit was consumed
    assert_eq!(debug.handler().count("guard_page"), 0);
    assert_eq!(debug.handler().count("single_step"), 0);
}

#[test]
fn overlapping_ranges_share_their_page() {
    let (mut debug, _journal) = launch(accesses(&[
        (PAGE + 0x118, false),
        (PAGE + 0x105, true),
        (PAGE + 0x128, true),
    ]));

    let log = Log::default();

    let session = debug.session_mut();
    session
        .watch_buffer(PID, PAGE + 0x100, 0x20, logging(&log, "a"))
        .unwrap();
    session
        .watch_buffer(PID, PAGE + 0x110, 0x20, logging(&log, "b"))
        .unwrap();

    assert_eq!(session.process_breakpoints(PID).count(), 1);

    debug.run().unwrap();

    assert_eq!(*log.borrow(), [
        ("a", PAGE + 0x118),
        ("b", PAGE + 0x118),
        ("a", PAGE + 0x105),
        ("b", PAGE + 0x128),
    ]);
}

#[test]
fn page_is_released_with_its_last_range() {
    let (mut debug, _journal) = launch([step(PID, TID, Op::ExitProcess(0))]);
    let session = debug.session_mut();

    session
        .watch_buffer(PID, PAGE + 0x100, 0x20, |_, _| Ok(()))
        .unwrap();
    session
        .watch_buffer(PID, PAGE + 0x200, 0x20, |_, _| Ok(()))
        .unwrap();

    session.dont_watch_buffer(PID, PAGE + 0x100, 0x20).unwrap();
    assert!(session.has_page_breakpoint(PID, PAGE));
    assert_ne!(session.native().protection(PID, PAGE) & PAGE_GUARD, 0);

    session.dont_watch_buffer(PID, PAGE + 0x200, 0x20).unwrap();
    assert!(!session.has_page_breakpoint(PID, PAGE));
    assert_eq!(session.native().protection(PID, PAGE) & PAGE_GUARD, 0);

    // removing twice is fine, removing what never was is not
    session.dont_watch_buffer(PID, PAGE + 0x200, 0x20).unwrap();
    assert!(matches!(
        session.dont_watch_buffer(PID, PAGE + 0x300, 0x20),
        Err(Error::NotFound(_))
    ));

    debug.run().unwrap();
}

#[test]
fn range_spanning_pages_guards_each_of_them() {
    let (mut debug, _journal) = launch(accesses(&[(PAGE + 0x1008, true)]));

    let log = Log::default();

    let session = debug.session_mut();
    session
        .watch_buffer(PID, PAGE + 0xff0, 0x20, logging(&log, "buffer"))
        .unwrap();
    assert!(session.has_page_breakpoint(PID, PAGE));
    assert!(session.has_page_breakpoint(PID, PAGE + 0x1000));

    debug.run().unwrap();

    assert_eq!(*log.borrow(), [("buffer", PAGE + 0x1008)]);
}

#[test]
fn stalked_range_runs_its_action_once() {
    let (mut debug, _journal) = launch(accesses(&[
        (PAGE + 0x100, true),
        (PAGE + 0x100, false),
    ]));

    let log = Log::default();

    debug
        .session_mut()
        .stalk_buffer(PID, PAGE + 0x100, 0x10, logging(&log, "buffer"))
        .unwrap();

    pump(&mut debug, 1);

    let session = debug.session_mut();
    assert!(!session.is_buffer_watched(PID, PAGE + 0x100, 0x10));
    assert!(!session.has_page_breakpoint(PID, PAGE));
    session.dont_stalk_buffer(PID, PAGE + 0x100, 0x10).unwrap();

    debug.run().unwrap();

    assert_eq!(*log.borrow(), [("buffer", PAGE + 0x100)]);
}

#[test]
fn conflicting_ranges_are_rejected() {
    let (mut debug, _journal) = launch([step(PID, TID, Op::ExitProcess(0))]);
    let session = debug.session_mut();

    session
        .watch_buffer(PID, PAGE + 0x100, 0x20, |_, _| Ok(()))
        .unwrap();
    assert!(matches!(
        session.watch_buffer(PID, PAGE + 0x100, 0x20, |_, _| Ok(())),
        Err(Error::Conflict(_))
    ));

    assert!(matches!(
        session.watch_buffer(PID, PAGE + 0x100, 0, |_, _| Ok(())),
        Err(Error::InvalidTarget { .. })
    ));

    // pages of a user page breakpoint cannot be shared
    let page = session
        .define_page_breakpoint(PID, PAGE + 0x1_0000, 0x1000)
        .unwrap();
    assert!(matches!(
        session.watch_buffer(PID, PAGE + 0x1_0010, 4, |_, _| Ok(())),
        Err(Error::Conflict(_))
    ));
    assert!(!session.is_buffer_watched(PID, PAGE + 0x1_0010, 4));

    session.erase_breakpoint(&page).unwrap();
    session
        .watch_buffer(PID, PAGE + 0x1_0010, 4, |_, _| Ok(()))
        .unwrap();

    debug.run().unwrap();
}

#[test]
fn user_page_breakpoint_reports_the_access() {
    let (mut debug, _journal) = launch(accesses(&[(PAGE + 0x42, true)]));

    let session = debug.session_mut();
    let key = session.define_page_breakpoint(PID, PAGE, 0x1000).unwrap();
    session.enable_one_shot_breakpoint(&key).unwrap();

    let access_type = Rc::new(RefCell::new(None));
    let seen = access_type.clone();

    session
        .set_action(&key, move |_, event| {
            *seen.borrow_mut() = event.exception().and_then(|info| info.access_type());
            event.forward();
            Ok(())
        })
        .unwrap();

    debug.run().unwrap();

    assert_eq!(*access_type.borrow(), Some(AccessType::Write));

    let hits = debug.handler().of("guard_page");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].breakpoint, Some(key));
}
