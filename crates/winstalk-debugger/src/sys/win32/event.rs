use std::ffi::c_void;

use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{
    CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT,
    EXCEPTION_RECORD, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
    OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use windows::Win32::System::Threading::LPTHREAD_START_ROUTINE;
use winstalk_engine::native::{Address, RawExceptionRecord, RawPayload};

use super::memory;

/// Nested exception records followed at most.
const MAX_NESTING: usize = 8;

/// Longest image path read from a debuggee.
const MAX_PATH_LEN: usize = 1024;

/// Extracts the payload of a debug event.
///
/// `process` is the handle of the reporting process, used to read what the
/// event only points to. It is `None` for processes unknown to the debugger.
pub(super) fn payload(event: &DEBUG_EVENT, process: Option<HANDLE>, wow64: bool) -> RawPayload {
    // SAFETY: the union member read always matches the event code
    unsafe {
        match event.dwDebugEventCode {
            EXCEPTION_DEBUG_EVENT => {
                let info = &event.u.Exception;

                RawPayload::Exception {
                    record: exception_record(&info.ExceptionRecord, process, wow64, 0),
                    first_chance: info.dwFirstChance,
                }
            }
            CREATE_PROCESS_DEBUG_EVENT => {
                let info = &event.u.CreateProcessInfo;

                // the process handle of this event is the one to read with
                let file_name =
                    image_name(info.hProcess, info.lpImageName, info.fUnicode != 0, wow64);

                RawPayload::CreateProcess {
                    image_base: info.lpBaseOfImage as Address,
                    start_address: start_address(info.lpStartAddress),
                    teb: info.lpThreadLocalBase as Address,
                    file_name,
                }
            }
            CREATE_THREAD_DEBUG_EVENT => {
                let info = &event.u.CreateThread;

                RawPayload::CreateThread {
                    start_address: start_address(info.lpStartAddress),
                    teb: info.lpThreadLocalBase as Address,
                }
            }
            EXIT_THREAD_DEBUG_EVENT => RawPayload::ExitThread {
                exit_code: event.u.ExitThread.dwExitCode,
            },
            EXIT_PROCESS_DEBUG_EVENT => RawPayload::ExitProcess {
                exit_code: event.u.ExitProcess.dwExitCode,
            },
            LOAD_DLL_DEBUG_EVENT => {
                let info = &event.u.LoadDll;

                RawPayload::LoadDll {
                    base: info.lpBaseOfDll as Address,
                    file_name: process.and_then(|process| {
                        image_name(process, info.lpImageName, info.fUnicode != 0, wow64)
                    }),
                }
            }
            UNLOAD_DLL_DEBUG_EVENT => RawPayload::UnloadDll {
                base: event.u.UnloadDll.lpBaseOfDll as Address,
            },
            OUTPUT_DEBUG_STRING_EVENT => {
                let info = &event.u.DebugString;

                RawPayload::OutputDebugString {
                    address: info.lpDebugStringData.0 as Address,
                    length: info.nDebugStringLength.into(),
                    unicode: info.fUnicode != 0,
                }
            }
            RIP_EVENT => RawPayload::Rip {
                error: event.u.RipInfo.dwError,
                kind: event.u.RipInfo.dwType.0,
            },
            _ => RawPayload::None,
        }
    }
}

fn start_address(routine: LPTHREAD_START_ROUTINE) -> Address {
    routine.map_or(0, |f| f as usize as Address)
}

fn exception_record(
    record: &EXCEPTION_RECORD,
    process: Option<HANDLE>,
    wow64: bool,
    depth: usize,
) -> RawExceptionRecord {
    let count = (record.NumberParameters as usize).min(record.ExceptionInformation.len());

    RawExceptionRecord {
        code: record.ExceptionCode.0 as u32,
        flags: record.ExceptionFlags,
        address: record.ExceptionAddress as Address,
        parameters: record.ExceptionInformation[..count]
            .iter()
            .map(|&p| p as u64)
            .collect(),
        nested: nested_record(record.ExceptionRecord, process, wow64, depth)
            .map(Box::new),
    }
}

/// Reads the chained record, which lives in the debuggee.
///
/// Records of WOW64 processes have a 32-bit layout, and are not followed.
fn nested_record(
    address: *mut EXCEPTION_RECORD,
    process: Option<HANDLE>,
    wow64: bool,
    depth: usize,
) -> Option<RawExceptionRecord> {
    let process = process?;

    if address.is_null() || wow64 || depth >= MAX_NESTING {
        return None;
    }

    let mut nested = EXCEPTION_RECORD::default();

    // SAFETY: EXCEPTION_RECORD is plain data
    let buf = unsafe {
        std::slice::from_raw_parts_mut(
            (&mut nested as *mut EXCEPTION_RECORD).cast::<u8>(),
            std::mem::size_of::<EXCEPTION_RECORD>(),
        )
    };

    match memory::read(process, address as Address, buf) {
        Ok(()) => Some(exception_record(&nested, Some(process), wow64, depth + 1)),
        Err(e) => {
            tracing::debug!(error = %e, "cannot read nested exception record");
            None
        }
    }
}

/// Reads the path of a loaded image.
///
/// `name` points to a pointer to the path, both in the debuggee, and either
/// may be null.
fn image_name(process: HANDLE, name: *mut c_void, unicode: bool, wow64: bool) -> Option<String> {
    if name.is_null() {
        return None;
    }

    let mut ptr = [0; 8];
    let ptr_size = if wow64 { 4 } else { 8 };

    memory::read(process, name as Address, &mut ptr[..ptr_size]).ok()?;

    let addr = u64::from_le_bytes(ptr);
    if addr == 0 {
        return None;
    }

    memory::read_string(process, addr, unicode, MAX_PATH_LEN)
        .inspect_err(|e| tracing::debug!(error = %e, "cannot read image name"))
        .ok()
        .filter(|name| !name.is_empty())
}
