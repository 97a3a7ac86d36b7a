//! Encoding of the x86 debug registers `DR6` and `DR7`.
//!
//! Each of the 4 slots owns one address register (`DR0`-`DR3`), a local
//! enable bit `2*slot` in `DR7`, two trigger bits at `16+4*slot` and two
//! length bits at `18+4*slot`. A hit on a slot sets bit `slot` of `DR6`.

/// Number of hardware breakpoint slots per thread.
pub const SLOT_COUNT: usize = 4;

/// Access that triggers a hardware breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Instruction execution.
    Execute,
    /// Data write.
    Write,
    /// I/O port access.
    Io,
    /// Data read or write.
    ReadWrite,
}

impl Trigger {
    const fn bits(self) -> u64 {
        match self {
            Self::Execute => 0b00,
            Self::Write => 0b01,
            Self::Io => 0b10,
            Self::ReadWrite => 0b11,
        }
    }

    const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Self::Execute,
            0b01 => Self::Write,
            0b10 => Self::Io,
            _ => Self::ReadWrite,
        }
    }
}

/// Length of the range watched by a hardware breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchSize {
    /// 1 byte.
    Byte,
    /// 2 bytes.
    Word,
    /// 4 bytes.
    Dword,
    /// 8 bytes.
    Qword,
}

impl WatchSize {
    /// Returns the watch size covering exactly `len` bytes, if any.
    pub const fn from_len(len: u64) -> Option<Self> {
        match len {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Qword),
            _ => None,
        }
    }

    /// Number of bytes watched.
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    const fn bits(self) -> u64 {
        match self {
            Self::Byte => 0b00,
            Self::Word => 0b01,
            Self::Qword => 0b10,
            Self::Dword => 0b11,
        }
    }

    const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => Self::Byte,
            0b01 => Self::Word,
            0b10 => Self::Qword,
            _ => Self::Dword,
        }
    }
}

const fn control_shift(slot: usize) -> u64 {
    16 + 4 * slot as u64
}

const fn enable_bit(slot: usize) -> u64 {
    1 << (2 * slot as u64)
}

/// Returns whether `slot` is locally enabled in `dr7`.
pub const fn is_slot_enabled(dr7: u64, slot: usize) -> bool {
    dr7 & enable_bit(slot) != 0
}

/// Returns `dr7` with `slot` enabled for the given trigger and size.
pub const fn enable_slot(dr7: u64, slot: usize, trigger: Trigger, size: WatchSize) -> u64 {
    let shift = control_shift(slot);

    (dr7 & !(0b1111 << shift))
        | (trigger.bits() << shift)
        | (size.bits() << (shift + 2))
        | enable_bit(slot)
}

/// Returns `dr7` with `slot` disabled and its control bits cleared.
pub const fn disable_slot(dr7: u64, slot: usize) -> u64 {
    dr7 & !(0b1111 << control_shift(slot)) & !enable_bit(slot)
}

/// Returns the trigger configured for `slot`.
pub const fn slot_trigger(dr7: u64, slot: usize) -> Trigger {
    Trigger::from_bits(dr7 >> control_shift(slot))
}

/// Returns the watch size configured for `slot`.
pub const fn slot_size(dr7: u64, slot: usize) -> WatchSize {
    WatchSize::from_bits(dr7 >> (control_shift(slot) + 2))
}

/// Returns the first slot neither enabled in `dr7` nor set in the
/// `reserved` bit mask.
pub fn free_slot(dr7: u64, reserved: u8) -> Option<usize> {
    (0..SLOT_COUNT).find(|&slot| !is_slot_enabled(dr7, slot) && reserved & (1 << slot) == 0)
}

/// Returns the slots whose hit bit is set in `dr6`.
pub fn hit_slots(dr6: u64) -> impl Iterator<Item = usize> {
    (0..SLOT_COUNT).filter(move |&slot| dr6 & (1 << slot) != 0)
}

/// Returns `dr6` with every hit bit cleared.
pub const fn clear_hits(dr6: u64) -> u64 {
    dr6 & !0b1111
}
