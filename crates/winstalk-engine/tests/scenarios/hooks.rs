use std::cell::RefCell;
use std::rc::Rc;

use test_log::test;
use winstalk_engine::hook::{Hook, Signature};

use crate::common::*;

const FUNCTION: u64 = 0x40_3000;
const CALL_SITE: u64 = 0x40_1005;
const INNER_CALL_SITE: u64 = FUNCTION + 0x20;

fn logging_hook(log: &Rc<RefCell<Vec<String>>>) -> Hook<FakeNative> {
    let (enter_log, exit_log) = (log.clone(), log.clone());

    Hook::new(Signature::new(1))
        .on_enter(move |_, _, call| {
            enter_log
                .borrow_mut()
                .push(format!("enter {}", call.params[0]));
            Ok(())
        })
        .on_exit(move |_, _, call, ret| {
            exit_log
                .borrow_mut()
                .push(format!("exit {} = {ret}", call.params[0]));
            Ok(())
        })
}

fn call(arg: u64, ret: u64) -> Step {
    step(PID, TID, Op::Call {
        target: FUNCTION,
        ret,
        arg,
    })
}

#[test]
fn recursive_calls_return_in_order() {
    let (mut debug, _journal) = launch([
        call(1, CALL_SITE),
        step(PID, TID, Op::Exec(FUNCTION + 1)),
        call(2, INNER_CALL_SITE),
        step(PID, TID, Op::Exec(FUNCTION + 1)),
        step(PID, TID, Op::SetReturn(20)),
        step(PID, TID, Op::Ret),
        step(PID, TID, Op::Exec(INNER_CALL_SITE + 1)),
        step(PID, TID, Op::SetReturn(10)),
        step(PID, TID, Op::Ret),
        step(PID, TID, Op::Exec(CALL_SITE + 1)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let log = Rc::new(RefCell::new(Vec::new()));

    debug
        .session_mut()
        .hook_function(PID, FUNCTION, logging_hook(&log))
        .unwrap();

    // outer entry, its step, inner entry
    pump(&mut debug, 3);
    assert_eq!(debug.session().pending_returns(TID), 2);
    assert!(debug.session().has_code_breakpoint(PID, CALL_SITE));
    assert!(debug.session().has_code_breakpoint(PID, INNER_CALL_SITE));

    debug.run().unwrap();

    assert_eq!(*log.borrow(), ["enter 1", "enter 2", "exit 2 = 20", "exit 1 = 10"]);

    assert_eq!(debug.session().pending_returns(TID), 0);
    assert_eq!(debug.handler().count("breakpoint"), 1);
    assert_eq!(debug.handler().count("single_step"), 0);
}

#[test]
fn return_traps_are_removed_after_the_return() {
    let (mut debug, _journal) = launch([
        call(1, CALL_SITE),
        step(PID, TID, Op::SetReturn(5)),
        step(PID, TID, Op::Ret),
        step(PID, TID, Op::Exec(CALL_SITE + 1)),
        step(PID, TID, Op::Exec(ENTRY_POINT)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let log = Rc::new(RefCell::new(Vec::new()));

    debug
        .session_mut()
        .hook_function(PID, FUNCTION, logging_hook(&log))
        .unwrap();

    // entry, its step, return
    pump(&mut debug, 3);

    let session = debug.session();
    assert_eq!(*log.borrow(), ["enter 1", "exit 1 = 5"]);
    assert!(!session.has_code_breakpoint(PID, CALL_SITE));
    assert_eq!(session.native().byte(PID, CALL_SITE), 0);
    assert!(session.has_code_breakpoint(PID, FUNCTION));

    debug.run().unwrap();
}

#[test]
fn stalked_function_is_entered_once() {
    let (mut debug, _journal) = launch([
        call(1, CALL_SITE),
        step(PID, TID, Op::SetReturn(1)),
        step(PID, TID, Op::Ret),
        step(PID, TID, Op::Exec(CALL_SITE + 1)),
        call(2, CALL_SITE),
        step(PID, TID, Op::SetReturn(2)),
        step(PID, TID, Op::Ret),
        step(PID, TID, Op::Exec(CALL_SITE + 1)),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let log = Rc::new(RefCell::new(Vec::new()));

    debug
        .session_mut()
        .stalk_function(PID, FUNCTION, logging_hook(&log))
        .unwrap();

    debug.run().unwrap();

    assert_eq!(*log.borrow(), ["enter 1", "exit 1 = 1"]);
}

#[test]
fn unhooked_function_still_reports_pending_returns() {
    let (mut debug, _journal) = launch([
        call(1, CALL_SITE),
        step(PID, TID, Op::SetReturn(1)),
        step(PID, TID, Op::Ret),
        step(PID, TID, Op::Exec(CALL_SITE + 1)),
        call(2, CALL_SITE),
        step(PID, TID, Op::Ret),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    let log = Rc::new(RefCell::new(Vec::new()));

    debug
        .session_mut()
        .hook_function(PID, FUNCTION, logging_hook(&log))
        .unwrap();

    pump(&mut debug, 1);

    let session = debug.session_mut();
    session.dont_hook_function(PID, FUNCTION).unwrap();
    session.dont_hook_function(PID, FUNCTION).unwrap();
    assert_eq!(session.pending_returns(TID), 1);

    debug.run().unwrap();

    assert_eq!(*log.borrow(), ["enter 1", "exit 1 = 1"]);
}

#[test]
fn entry_callback_sees_the_stack() {
    let seen = Rc::new(RefCell::new(None));

    let hook = {
        let seen = seen.clone();

        Hook::<FakeNative>::new(Signature::new(0)).on_enter(move |session, event, call| {
            let context = session.get_context(event.pid(), event.tid()).unwrap();
            assert_eq!(context.sp, call.stack_pointer);

            *seen.borrow_mut() = Some(call.return_address);
            Ok(())
        })
    };

    let (mut debug, _journal) = launch([
        call(0, CALL_SITE),
        step(PID, TID, Op::Ret),
        step(PID, TID, Op::ExitProcess(0)),
    ]);

    debug
        .session_mut()
        .hook_function(PID, FUNCTION, hook)
        .unwrap();

    debug.run().unwrap();

    assert_eq!(*seen.borrow(), Some(CALL_SITE));

    // no exit callback, no return trap
    assert_eq!(debug.session().pending_returns(TID), 0);
}
