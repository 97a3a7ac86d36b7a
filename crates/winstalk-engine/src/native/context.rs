/// Trap flag of the `EFLAGS` register.
pub const TRAP_FLAG: u64 = 0x100;

/// Architecture of a debuggee thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Arch {
    /// 32-bit x86 (native or WOW64).
    X86,
    /// x86-64.
    #[default]
    X86_64,
}

impl Arch {
    /// Size of a pointer, in bytes.
    pub const fn pointer_size(self) -> u64 {
        match self {
            Self::X86 => 4,
            Self::X86_64 => 8,
        }
    }
}

/// Portable subset of a thread's register context.
///
/// `args` holds the integer argument registers of the Win64 calling
/// convention (`rcx`, `rdx`, `r8`, `r9`). They are meaningless on x86.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadContext {
    /// Architecture this context was read from.
    pub arch: Arch,
    /// Instruction pointer.
    pub pc: u64,
    /// Stack pointer.
    pub sp: u64,
    /// Frame pointer.
    pub fp: u64,
    /// Return value register (`eax`/`rax`).
    pub ret: u64,
    /// Integer argument registers.
    pub args: [u64; 4],
    /// Flags register.
    pub flags: u64,
    /// Debug address registers `DR0` to `DR3`.
    pub dr: [u64; 4],
    /// Debug status register.
    pub dr6: u64,
    /// Debug control register.
    pub dr7: u64,
}

impl ThreadContext {
    /// Returns whether the trap flag is set.
    pub const fn trap_flag(&self) -> bool {
        self.flags & TRAP_FLAG != 0
    }

    /// Sets or clears the trap flag.
    pub const fn set_trap_flag(&mut self, enabled: bool) {
        if enabled {
            self.flags |= TRAP_FLAG;
        } else {
            self.flags &= !TRAP_FLAG;
        }
    }
}
