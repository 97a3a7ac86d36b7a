use std::ffi::c_void;

use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{
    FlushInstructionCache, ReadProcessMemory, WriteProcessMemory,
};
use windows::Win32::System::Memory::{
    MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD,
    PAGE_PROTECTION_FLAGS, PAGE_READWRITE, PAGE_WRITECOPY, VirtualProtectEx, VirtualQueryEx,
};
use winstalk_engine::native::{Address, MemoryRegion};

use crate::error::{Error, Result};

/// Reads memory of a process.
pub(super) fn read(process: HANDLE, addr: Address, buf: &mut [u8]) -> Result<()> {
    let mut len = 0usize;

    unsafe {
        ReadProcessMemory(
            process,
            addr as *const c_void,
            buf.as_mut_ptr().cast(),
            buf.len(),
            Some(&mut len as *mut _),
        )
    }
    .inspect_err(|e| tracing::debug!(error = %e, addr = format_args!("{addr:#x}"), "ReadProcessMemory"))
    .map_err(|e| Error::from_hresult("ReadProcessMemory", e.code().0))?;

    if len != buf.len() {
        Err(Error::PartialMemOp(len, buf.len()))
    } else {
        Ok(())
    }
}

/// Writes memory of a process, lifting the write protection (and the guard)
/// of the first page for the time of the write.
pub(super) fn write(process: HANDLE, addr: Address, data: &[u8]) -> Result<()> {
    let writable = PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;
    let size = data.len() as u64;

    let current = query(process, addr)?.protect;

    let restore = if current & writable.0 == 0 || current & PAGE_GUARD.0 != 0 {
        Some(protect(process, addr, size, PAGE_EXECUTE_READWRITE.0)?)
    } else {
        None
    };

    let mut len = 0usize;

    let written = unsafe {
        WriteProcessMemory(
            process,
            addr as *const c_void,
            data.as_ptr().cast(),
            data.len(),
            Some(&mut len as *mut _),
        )
    }
    .inspect_err(|e| tracing::error!(error = %e, addr = format_args!("{addr:#x}"), "WriteProcessMemory"))
    .map_err(|e| Error::from_hresult("WriteProcessMemory", e.code().0));

    if let Some(old) = restore {
        protect(process, addr, size, old)?;
    }

    written?;

    if len != data.len() {
        Err(Error::PartialMemOp(len, data.len()))
    } else {
        Ok(())
    }
}

/// Queries the region containing `addr`.
pub(super) fn query(process: HANDLE, addr: Address) -> Result<MemoryRegion> {
    let mut info = MEMORY_BASIC_INFORMATION::default();

    let len = unsafe {
        VirtualQueryEx(
            process,
            Some(addr as *const c_void),
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };

    if len == 0 {
        let e = windows::core::Error::from_win32();
        return Err(Error::from_hresult("VirtualQueryEx", e.code().0));
    }

    Ok(MemoryRegion {
        base: info.BaseAddress as u64,
        size: info.RegionSize as u64,
        state: info.State.0,
        protect: info.Protect.0,
    })
}

/// Changes the protection of a range, returning the old protection of its
/// first page.
pub(super) fn protect(process: HANDLE, addr: Address, size: u64, protect: u32) -> Result<u32> {
    let mut old = PAGE_PROTECTION_FLAGS::default();

    unsafe {
        VirtualProtectEx(
            process,
            addr as *const c_void,
            size as usize,
            PAGE_PROTECTION_FLAGS(protect),
            &mut old,
        )
    }
    .inspect_err(|e| {
        tracing::error!(
            error = %e,
            addr = format_args!("{addr:#x}"),
            guard = protect & PAGE_GUARD.0 != 0,
            "VirtualProtectEx"
        )
    })
    .map_err(|e| Error::from_hresult("VirtualProtectEx", e.code().0))?;

    Ok(old.0)
}

pub(super) fn flush_instruction_cache(process: HANDLE, addr: Address, size: u64) -> Result<()> {
    unsafe { FlushInstructionCache(process, Some(addr as *const c_void), size as usize) }
        .map_err(|e| Error::from_hresult("FlushInstructionCache", e.code().0))
}

/// Reads a nul-terminated string of at most `max` characters.
pub(super) fn read_string(process: HANDLE, addr: Address, unicode: bool, max: usize) -> Result<String> {
    let char_size = if unicode { 2 } else { 1 };
    let mut buf = vec![0; max * char_size];

    // strings may end close to the end of their region
    let region = query(process, addr)?;
    let readable = (region.base + region.size).saturating_sub(addr) as usize;
    buf.truncate(readable.min(buf.len()));

    read(process, addr, &mut buf)?;

    Ok(if unicode {
        let wide = buf
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&c| c != 0)
            .collect::<Vec<_>>();
        String::from_utf16_lossy(&wide)
    } else {
        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..len]).into_owned()
    })
}
