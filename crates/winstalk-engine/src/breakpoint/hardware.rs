use super::debug_register::{self, Trigger, WatchSize};
use crate::error::{Error, Result};
use crate::native::{Address, NativeDebugger, NativeError, Pid, Tid};

/// Trap of a hardware breakpoint.
#[derive(Debug)]
pub(crate) struct HardwareTrap {
    pub tid: Tid,
    pub trigger: Trigger,
    pub size: WatchSize,
    /// Debug register slot, while installed.
    pub slot: Option<usize>,
}

impl HardwareTrap {
    /// Writes the breakpoint in the first debug register slot that is neither
    /// enabled in the thread's `DR7` nor `reserved` by another breakpoint.
    pub fn install<N: NativeDebugger>(
        &mut self,
        native: &mut N,
        pid: Pid,
        address: Address,
        reserved: u8,
    ) -> Result<()> {
        if self.slot.is_some() {
            return Ok(());
        }

        let (tid, trigger, size) = (self.tid, self.trigger, self.size);

        let slot = with_suspended(native, pid, tid, |native| {
            let mut context = native.get_context(pid, tid)?;

            let slot = debug_register::free_slot(context.dr7, reserved)
                .ok_or(Error::ResourceExhausted(tid))?;

            context.dr[slot] = address;
            context.dr7 = debug_register::enable_slot(context.dr7, slot, trigger, size);
            native.set_context(pid, tid, &context)?;

            Ok(slot)
        })?;

        self.slot = Some(slot);

        tracing::trace!(
            tid,
            slot,
            addr = format_args!("{address:#x}"),
            "hardware trap installed"
        );

        Ok(())
    }

    pub fn remove<N: NativeDebugger>(&mut self, native: &mut N, pid: Pid) -> Result<()> {
        let Some(slot) = self.slot else {
            return Ok(());
        };

        let tid = self.tid;

        let res = with_suspended(native, pid, tid, |native| {
            let mut context = native.get_context(pid, tid)?;

            context.dr[slot] = 0;
            context.dr7 = debug_register::disable_slot(context.dr7, slot);
            native.set_context(pid, tid, &context)?;

            Ok(())
        });

        match res {
            Ok(()) | Err(Error::TargetGone) => {
                self.slot = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn with_suspended<N, T>(
    native: &mut N,
    pid: Pid,
    tid: Tid,
    f: impl FnOnce(&mut N) -> Result<T>,
) -> Result<T>
where
    N: NativeDebugger,
{
    native.suspend_thread(pid, tid)?;

    let res = f(native);

    match native.resume_thread(pid, tid) {
        Ok(()) | Err(NativeError::TargetGone) => res,
        Err(e) => res.and(Err(e.into())),
    }
}
