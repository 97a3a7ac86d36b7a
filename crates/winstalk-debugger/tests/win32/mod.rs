use std::cell::Cell;
use std::rc::Rc;

use test_log::test;
use winstalk_debugger::Win32Debugger;
use winstalk_engine::event::{Event, EventKind};
use winstalk_engine::handler::EventHandler;
use winstalk_engine::{Builder, Command, Session};

const CMD: &str = "C:\\Windows\\System32\\cmd.exe";

#[derive(Default)]
struct TestHandler {
    image_header: Option<[u8; 2]>,
    dlls: Vec<String>,
    breakpoints: usize,
    exit_code: Option<u32>,
    entry_hits: Rc<Cell<usize>>,
    break_at_entry: bool,
}

impl EventHandler for TestHandler {
    type Native = Win32Debugger;
    type Error = winstalk_engine::Error;

    fn create_process(
        &mut self,
        session: &mut Session<Win32Debugger>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        let EventKind::CreateProcess {
            image_base,
            start_address,
            ..
        } = *event.kind()
        else {
            unreachable!("routed by kind");
        };

        let mut header = [0; 2];
        session.read_memory(event.pid(), image_base, &mut header)?;
        self.image_header = Some(header);

        if self.break_at_entry {
            let hits = self.entry_hits.clone();

            session.break_at(event.pid(), start_address, move |_, _| {
                hits.set(hits.get() + 1);
                Ok(())
            })?;
        }

        Ok(())
    }

    fn load_dll(
        &mut self,
        _session: &mut Session<Win32Debugger>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        if let EventKind::LoadDll {
            file_name: Some(name),
            ..
        } = event.kind()
        {
            self.dlls.push(name.to_lowercase());
        }

        Ok(())
    }

    fn breakpoint(
        &mut self,
        _session: &mut Session<Win32Debugger>,
        _event: &mut Event,
    ) -> Result<(), Self::Error> {
        self.breakpoints += 1;
        Ok(())
    }

    fn exit_process(
        &mut self,
        _session: &mut Session<Win32Debugger>,
        event: &mut Event,
    ) -> Result<(), Self::Error> {
        if let EventKind::ExitProcess { exit_code } = *event.kind() {
            self.exit_code = Some(exit_code);
        }

        Ok(())
    }
}

fn run(command: &Command, handler: TestHandler) -> TestHandler {
    let mut debug = Builder::new()
        .with_native(Win32Debugger::new())
        .with_event_handler(handler)
        .kill_on_exit(true)
        .build();

    debug.start(command).expect("spawn");
    debug.run().expect("run");

    debug.into_handler()
}

#[test]
fn exit_code_is_reported() {
    let command = Command::new(CMD).args(["/c", "exit", "3"]);

    let handler = run(&command, TestHandler::default());

    assert_eq!(handler.exit_code, Some(3));
    assert_eq!(handler.image_header, Some(*b"MZ"));
    assert!(handler.dlls.iter().any(|dll| dll.ends_with("kernel32.dll")));

    // the loader breakpoint
    assert_eq!(handler.breakpoints, 1);
}

#[test]
fn entry_point_breakpoint_runs_once() {
    let command = Command::new(CMD).args(["/c", "exit", "0"]);

    let hits = Rc::new(Cell::new(0));

    let handler = run(&command, TestHandler {
        entry_hits: hits.clone(),
        break_at_entry: true,
        ..Default::default()
    });

    assert_eq!(hits.get(), 1);
    assert_eq!(handler.exit_code, Some(0));
    assert_eq!(handler.breakpoints, 1);
}

#[test]
fn environment_reaches_the_debuggee() {
    let command = Command::new(CMD)
        .args(["/c", "exit", "%WINSTALK_TEST%"])
        .env("WINSTALK_TEST", "42");

    let handler = run(&command, TestHandler::default());

    assert_eq!(handler.exit_code, Some(42));
}
