use crate::error::{Error, Result};
use crate::native::{Address, NativeDebugger, NativeError, Pid};

/// Opcode of the `int3` trap instruction.
pub const INT3: u8 = 0xcc;

/// Trap of a code breakpoint.
#[derive(Debug, Default)]
pub(crate) struct CodeTrap {
    /// Byte replaced by `int3`, while installed.
    original: Option<u8>,
}

impl CodeTrap {
    pub fn install<N: NativeDebugger>(
        &mut self,
        native: &mut N,
        pid: Pid,
        address: Address,
        hostile: bool,
    ) -> Result<()> {
        if self.original.is_some() {
            return Ok(());
        }

        if hostile {
            let region = native.query_memory(pid, address)?;

            if !region.is_executable() {
                return Err(Error::InvalidTarget {
                    address,
                    reason: "memory is not executable",
                });
            }
        }

        let mut original = [0u8];
        native.read_memory(pid, address, &mut original)?;

        if hostile && original[0] == INT3 {
            return Err(Error::InvalidTarget {
                address,
                reason: "a trap instruction is already present",
            });
        }

        native.write_memory(pid, address, &[INT3])?;

        if let Err(e) = native.flush_instruction_cache(pid, address, 1) {
            if let Err(undo) = native.write_memory(pid, address, &original) {
                tracing::warn!(
                    pid,
                    addr = format_args!("{address:#x}"),
                    error = %undo,
                    "cannot undo code trap"
                );
            }
            return Err(e.into());
        }

        self.original = Some(original[0]);

        tracing::trace!(pid, addr = format_args!("{address:#x}"), "code trap installed");

        Ok(())
    }

    pub fn remove<N: NativeDebugger>(
        &mut self,
        native: &mut N,
        pid: Pid,
        address: Address,
    ) -> Result<()> {
        let Some(original) = self.original else {
            return Ok(());
        };

        let mut current = [0u8];

        match native.read_memory(pid, address, &mut current) {
            Ok(()) => (),
            Err(NativeError::TargetGone) => {
                self.original = None;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        // the debuggee may have rewritten its own code in the meantime
        if current[0] != INT3 {
            tracing::debug!(
                pid,
                addr = format_args!("{address:#x}"),
                "code trap already overwritten"
            );
            self.original = None;
            return Ok(());
        }

        // the original byte is kept while `int3` may still be in place
        match native.write_memory(pid, address, &[original]) {
            Ok(()) => self.original = None,
            Err(NativeError::TargetGone) => {
                self.original = None;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match native.flush_instruction_cache(pid, address, 1) {
            Ok(()) | Err(NativeError::TargetGone) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
