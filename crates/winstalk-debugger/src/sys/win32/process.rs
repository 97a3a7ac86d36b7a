use std::ffi::c_void;

use windows::Win32::Foundation::{BOOL, HANDLE};
use windows::Win32::System::Threading::{
    CREATE_UNICODE_ENVIRONMENT, CreateProcessW, DEBUG_ONLY_THIS_PROCESS, DEBUG_PROCESS,
    IsWow64Process, PROCESS_INFORMATION, STARTUPINFOW,
};
use windows::core::{PCWSTR, PWSTR};
use winstalk_engine::Command;
use winstalk_engine::native::Pid;

use super::handle::OwnedHandle;
use crate::environment;
use crate::error::{Error, Result};

/// Spawns `command` in a debugged state.
///
/// The handles returned by the OS are closed right away: the debug events
/// of the process carry their own.
pub(super) fn spawn(command: &Command) -> Result<Pid> {
    let mut command_line = environment::wide(&command.command_line(), "command line")?;

    let current_dir = command
        .current_dir
        .as_ref()
        .map(|dir| environment::wide(&dir.to_string_lossy(), "working directory"))
        .transpose()?;

    let inherited = std::env::vars_os().map(|(key, val)| {
        (
            key.to_string_lossy().into_owned(),
            val.to_string_lossy().into_owned(),
        )
    });
    let env = environment::encode_block(&environment::resolve(&command.env, inherited))?;

    let mut flags = DEBUG_PROCESS | CREATE_UNICODE_ENVIRONMENT;
    if !command.follow_children {
        flags |= DEBUG_ONLY_THIS_PROCESS;
    }

    let startup_info = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    let mut info = PROCESS_INFORMATION::default();

    unsafe {
        CreateProcessW(
            PCWSTR::null(),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            BOOL::from(false),
            flags,
            Some(env.as_ptr().cast::<c_void>()),
            current_dir
                .as_ref()
                .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
            &startup_info,
            &mut info,
        )
    }
    .inspect_err(|e| tracing::error!(error = %e, program = %command.program.display(), "CreateProcessW"))
    .map_err(|e| Error::from_hresult("CreateProcessW", e.code().0))?;

    drop(OwnedHandle::new(info.hThread));
    drop(OwnedHandle::new(info.hProcess));

    Ok(info.dwProcessId)
}

/// Returns whether a process runs under WOW64.
pub(super) fn is_wow64(process: HANDLE) -> Result<bool> {
    let mut wow64 = BOOL::default();

    unsafe { IsWow64Process(process, &mut wow64) }
        .map_err(|e| Error::from_hresult("IsWow64Process", e.code().0))?;

    Ok(wow64.as_bool())
}
