use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{
    CONTEXT, CONTEXT_CONTROL_AMD64, CONTEXT_DEBUG_REGISTERS_AMD64, CONTEXT_INTEGER_AMD64,
    GetThreadContext, SetThreadContext, WOW64_CONTEXT, WOW64_CONTEXT_CONTROL,
    WOW64_CONTEXT_DEBUG_REGISTERS, WOW64_CONTEXT_INTEGER, Wow64GetThreadContext,
    Wow64SetThreadContext,
};
use winstalk_engine::native::{Arch, ThreadContext};

use crate::error::{Error, Result};

/// Reads the registers of a thread.
///
/// Threads of WOW64 processes are read through their 32-bit context.
pub(super) fn read(thread: HANDLE, wow64: bool) -> Result<ThreadContext> {
    if wow64 {
        read_wow64(thread).map(|ctx| from_wow64(&ctx))
    } else {
        read_native(thread).map(|ctx| from_native(&ctx))
    }
}

/// Writes the registers of a thread, leaving the others untouched.
pub(super) fn write(thread: HANDLE, wow64: bool, context: &ThreadContext) -> Result<()> {
    if wow64 {
        let mut ctx = read_wow64(thread)?;
        to_wow64(context, &mut ctx);

        unsafe { Wow64SetThreadContext(thread, &ctx) }
            .map_err(|e| Error::from_hresult("Wow64SetThreadContext", e.code().0))
    } else {
        let mut ctx = read_native(thread)?;
        to_native(context, &mut ctx);

        unsafe { SetThreadContext(thread, &ctx) }
            .map_err(|e| Error::from_hresult("SetThreadContext", e.code().0))
    }
}

fn read_native(thread: HANDLE) -> Result<CONTEXT> {
    let mut ctx = CONTEXT {
        ContextFlags: CONTEXT_CONTROL_AMD64 | CONTEXT_INTEGER_AMD64 | CONTEXT_DEBUG_REGISTERS_AMD64,
        ..Default::default()
    };

    unsafe { GetThreadContext(thread, &mut ctx) }
        .map_err(|e| Error::from_hresult("GetThreadContext", e.code().0))?;

    Ok(ctx)
}

fn read_wow64(thread: HANDLE) -> Result<WOW64_CONTEXT> {
    let mut ctx = WOW64_CONTEXT {
        ContextFlags: WOW64_CONTEXT_CONTROL | WOW64_CONTEXT_INTEGER | WOW64_CONTEXT_DEBUG_REGISTERS,
        ..Default::default()
    };

    unsafe { Wow64GetThreadContext(thread, &mut ctx) }
        .map_err(|e| Error::from_hresult("Wow64GetThreadContext", e.code().0))?;

    Ok(ctx)
}

fn from_native(ctx: &CONTEXT) -> ThreadContext {
    ThreadContext {
        arch: Arch::X86_64,
        pc: ctx.Rip,
        sp: ctx.Rsp,
        fp: ctx.Rbp,
        ret: ctx.Rax,
        args: [ctx.Rcx, ctx.Rdx, ctx.R8, ctx.R9],
        flags: u64::from(ctx.EFlags),
        dr: [ctx.Dr0, ctx.Dr1, ctx.Dr2, ctx.Dr3],
        dr6: ctx.Dr6,
        dr7: ctx.Dr7,
    }
}

fn to_native(context: &ThreadContext, ctx: &mut CONTEXT) {
    ctx.Rip = context.pc;
    ctx.Rsp = context.sp;
    ctx.Rbp = context.fp;
    ctx.Rax = context.ret;
    [ctx.Rcx, ctx.Rdx, ctx.R8, ctx.R9] = context.args;
    ctx.EFlags = context.flags as u32;
    [ctx.Dr0, ctx.Dr1, ctx.Dr2, ctx.Dr3] = context.dr;
    ctx.Dr6 = context.dr6;
    ctx.Dr7 = context.dr7;
}

fn from_wow64(ctx: &WOW64_CONTEXT) -> ThreadContext {
    ThreadContext {
        arch: Arch::X86,
        pc: ctx.Eip.into(),
        sp: ctx.Esp.into(),
        fp: ctx.Ebp.into(),
        ret: ctx.Eax.into(),
        // stdcall and cdecl pass everything on the stack
        args: [ctx.Ecx.into(), ctx.Edx.into(), 0, 0],
        flags: ctx.EFlags.into(),
        dr: [ctx.Dr0.into(), ctx.Dr1.into(), ctx.Dr2.into(), ctx.Dr3.into()],
        dr6: ctx.Dr6.into(),
        dr7: ctx.Dr7.into(),
    }
}

fn to_wow64(context: &ThreadContext, ctx: &mut WOW64_CONTEXT) {
    ctx.Eip = context.pc as u32;
    ctx.Esp = context.sp as u32;
    ctx.Ebp = context.fp as u32;
    ctx.Eax = context.ret as u32;
    ctx.Ecx = context.args[0] as u32;
    ctx.Edx = context.args[1] as u32;
    ctx.EFlags = context.flags as u32;
    ctx.Dr0 = context.dr[0] as u32;
    ctx.Dr1 = context.dr[1] as u32;
    ctx.Dr2 = context.dr[2] as u32;
    ctx.Dr3 = context.dr[3] as u32;
    ctx.Dr6 = context.dr6 as u32;
    ctx.Dr7 = context.dr7 as u32;
}
