use crate::native::{Address, RawExceptionRecord};

/// Flag of non-continuable exceptions.
pub const EXCEPTION_NONCONTINUABLE: u32 = 0x1;

macro_rules! exception_codes {
    ($($variant:ident = $code:literal, $name:literal, $method:literal, $desc:literal;)*) => {
        /// Exception code of an exception event.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ExceptionCode {
            $(
                #[doc = $desc]
                $variant,
            )*
            /// Exception code unknown to this crate.
            Other(u32),
        }

        impl ExceptionCode {
            /// Maps a raw exception code.
            pub const fn from_code(code: u32) -> Self {
                match code {
                    $($code => Self::$variant,)*
                    other => Self::Other(other),
                }
            }

            /// Raw exception code.
            pub const fn code(self) -> u32 {
                match self {
                    $(Self::$variant => $code,)*
                    Self::Other(code) => code,
                }
            }

            /// Win32 name of the exception code.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                    Self::Other(_) => "UNKNOWN_EXCEPTION",
                }
            }

            /// Name of the handler method this exception is routed to, before
            /// falling back to the generic exception handler.
            pub const fn method_name(self) -> &'static str {
                match self {
                    $(Self::$variant => $method,)*
                    Self::Other(_) => "exception",
                }
            }

            /// Human-readable description.
            pub const fn description(self) -> &'static str {
                match self {
                    $(Self::$variant => $desc,)*
                    Self::Other(_) => "Unknown exception",
                }
            }
        }
    };
}

exception_codes! {
    AccessViolation = 0xc000_0005, "EXCEPTION_ACCESS_VIOLATION", "access_violation", "Access violation";
    ArrayBoundsExceeded = 0xc000_008c, "EXCEPTION_ARRAY_BOUNDS_EXCEEDED", "array_bounds_exceeded", "Array bounds exceeded";
    Breakpoint = 0x8000_0003, "EXCEPTION_BREAKPOINT", "breakpoint", "Breakpoint";
    DatatypeMisalignment = 0x8000_0002, "EXCEPTION_DATATYPE_MISALIGNMENT", "datatype_misalignment", "Datatype misalignment";
    FltDenormalOperand = 0xc000_008d, "EXCEPTION_FLT_DENORMAL_OPERAND", "float_denormal_operand", "Floating point denormal operand";
    FltDivideByZero = 0xc000_008e, "EXCEPTION_FLT_DIVIDE_BY_ZERO", "float_divide_by_zero", "Floating point divide by zero";
    FltInexactResult = 0xc000_008f, "EXCEPTION_FLT_INEXACT_RESULT", "float_inexact_result", "Floating point inexact result";
    FltInvalidOperation = 0xc000_0090, "EXCEPTION_FLT_INVALID_OPERATION", "float_invalid_operation", "Floating point invalid operation";
    FltOverflow = 0xc000_0091, "EXCEPTION_FLT_OVERFLOW", "float_overflow", "Floating point overflow";
    FltStackCheck = 0xc000_0092, "EXCEPTION_FLT_STACK_CHECK", "float_stack_check", "Floating point stack check";
    FltUnderflow = 0xc000_0093, "EXCEPTION_FLT_UNDERFLOW", "float_underflow", "Floating point underflow";
    IllegalInstruction = 0xc000_001d, "EXCEPTION_ILLEGAL_INSTRUCTION", "illegal_instruction", "Illegal instruction";
    InPageError = 0xc000_0006, "EXCEPTION_IN_PAGE_ERROR", "in_page_error", "In-page error";
    IntDivideByZero = 0xc000_0094, "EXCEPTION_INT_DIVIDE_BY_ZERO", "integer_divide_by_zero", "Integer divide by zero";
    IntOverflow = 0xc000_0095, "EXCEPTION_INT_OVERFLOW", "integer_overflow", "Integer overflow";
    InvalidDisposition = 0xc000_0026, "EXCEPTION_INVALID_DISPOSITION", "invalid_disposition", "Invalid disposition";
    NoncontinuableException = 0xc000_0025, "EXCEPTION_NONCONTINUABLE_EXCEPTION", "noncontinuable_exception", "Non-continuable exception";
    PrivInstruction = 0xc000_0096, "EXCEPTION_PRIV_INSTRUCTION", "privileged_instruction", "Privileged instruction";
    SingleStep = 0x8000_0004, "EXCEPTION_SINGLE_STEP", "single_step", "Single step event";
    StackOverflow = 0xc000_00fd, "EXCEPTION_STACK_OVERFLOW", "stack_overflow", "Stack overflow";
    GuardPage = 0x8000_0001, "EXCEPTION_GUARD_PAGE", "guard_page", "Guard page hit";
    InvalidHandle = 0xc000_0008, "EXCEPTION_INVALID_HANDLE", "invalid_handle", "Invalid handle";
    PossibleDeadlock = 0xc000_0194, "EXCEPTION_POSSIBLE_DEADLOCK", "possible_deadlock", "Possible deadlock";
    ControlCExit = 0xc000_013a, "STATUS_CONTROL_C_EXIT", "control_c_exit", "Control-C exit";
    DebugControlC = 0x4001_0005, "DBG_CONTROL_C", "debug_control_c", "Debug Control-C";
    MsVcException = 0x406d_1388, "MS_VC_EXCEPTION", "ms_vc_exception", "Microsoft Visual C++ exception";
    Wow64Breakpoint = 0x4000_001f, "STATUS_WX86_BREAKPOINT", "wow64_breakpoint", "WOW64 breakpoint";
    Wow64SingleStep = 0x4000_001e, "STATUS_WX86_SINGLE_STEP", "wow64_single_step", "WOW64 single step";
}

impl ExceptionCode {
    /// Returns whether this is a breakpoint trap (native or WOW64).
    pub const fn is_breakpoint(self) -> bool {
        matches!(self, Self::Breakpoint | Self::Wow64Breakpoint)
    }

    /// Returns whether this is a single-step trap (native or WOW64).
    pub const fn is_single_step(self) -> bool {
        matches!(self, Self::SingleStep | Self::Wow64SingleStep)
    }
}

/// Kind of memory access reported by access violations and guard page hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch (DEP violation).
    Execute,
}

/// Exception information carried by an exception event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    /// Exception code.
    pub code: ExceptionCode,
    /// Exception flags.
    pub flags: u32,
    /// Address where the exception occurred.
    pub address: Address,
    /// Exception-specific parameters.
    pub parameters: Vec<u64>,
    /// Whether the debugger gets the first chance to handle the exception.
    pub first_chance: bool,
    /// Chained exception.
    pub nested: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub(crate) fn from_record(record: RawExceptionRecord, first_chance: bool) -> Self {
        Self {
            code: ExceptionCode::from_code(record.code),
            flags: record.flags,
            address: record.address,
            parameters: record.parameters,
            first_chance,
            nested: record
                .nested
                .map(|nested| Box::new(Self::from_record(*nested, first_chance))),
        }
    }

    /// Returns whether the debuggee has not yet seen this exception.
    pub const fn is_first_chance(&self) -> bool {
        self.first_chance
    }

    /// Returns whether the debuggee failed to handle this exception, and is
    /// about to be killed unless the debugger handles it.
    pub const fn is_last_chance(&self) -> bool {
        !self.first_chance
    }

    /// Returns whether execution can resume after this exception.
    pub const fn is_continuable(&self) -> bool {
        self.flags & EXCEPTION_NONCONTINUABLE == 0
    }

    /// Address whose access faulted, for access violations, in-page errors
    /// and guard page hits.
    pub fn fault_address(&self) -> Option<Address> {
        match self.code {
            ExceptionCode::AccessViolation
            | ExceptionCode::InPageError
            | ExceptionCode::GuardPage => self.parameters.get(1).copied(),
            _ => None,
        }
    }

    /// Kind of access that faulted, for access violations, in-page errors and
    /// guard page hits.
    pub fn access_type(&self) -> Option<AccessType> {
        match self.code {
            ExceptionCode::AccessViolation
            | ExceptionCode::InPageError
            | ExceptionCode::GuardPage => match self.parameters.first()? {
                0 => Some(AccessType::Read),
                1 => Some(AccessType::Write),
                8 => Some(AccessType::Execute),
                _ => None,
            },
            _ => None,
        }
    }

    /// Chain of nested exceptions, from the outermost one.
    pub fn chain(&self) -> impl Iterator<Item = &ExceptionInfo> {
        std::iter::successors(Some(self), |info| info.nested.as_deref())
    }
}
