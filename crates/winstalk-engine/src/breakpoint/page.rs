use crate::error::Result;
use crate::native::{Address, NativeDebugger, NativeError, PAGE_GUARD, Pid};

/// Trap of a page breakpoint.
#[derive(Debug)]
pub(crate) struct PageTrap {
    /// Guarded length, a multiple of the page size.
    pub size: u64,
}

impl PageTrap {
    pub fn install<N: NativeDebugger>(
        &mut self,
        native: &mut N,
        pid: Pid,
        address: Address,
    ) -> Result<()> {
        let page_size = native.page_size();
        let mut guarded = Vec::new();

        for page in (address..address + self.size).step_by(page_size as usize) {
            let res = native.query_memory(pid, page).and_then(|region| {
                if region.is_guard() {
                    return Ok(false);
                }
                native
                    .protect_memory(pid, page, page_size, region.protect | PAGE_GUARD)
                    .map(|_| true)
            });

            match res {
                Ok(true) => guarded.push(page),
                Ok(false) => (),
                Err(e) => {
                    for page in guarded {
                        unguard(native, pid, page, page_size);
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::trace!(
            pid,
            addr = format_args!("{address:#x}"),
            size = self.size,
            "page trap installed"
        );

        Ok(())
    }

    /// Removes the guard modifier from every page still carrying it.
    ///
    /// Pages touched since the trap was installed already lost it.
    pub fn remove<N: NativeDebugger>(
        &mut self,
        native: &mut N,
        pid: Pid,
        address: Address,
    ) -> Result<()> {
        let page_size = native.page_size();

        for page in (address..address + self.size).step_by(page_size as usize) {
            let region = match native.query_memory(pid, page) {
                Ok(region) => region,
                Err(NativeError::TargetGone) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if region.is_guard() {
                match native.protect_memory(pid, page, page_size, region.protect & !PAGE_GUARD) {
                    Ok(_) => (),
                    Err(NativeError::TargetGone) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(())
    }
}

/// Strips the guard modifier of a page guarded by a failed install.
fn unguard<N: NativeDebugger>(native: &mut N, pid: Pid, page: Address, page_size: u64) {
    let res = native.query_memory(pid, page).and_then(|region| {
        native.protect_memory(pid, page, page_size, region.protect & !PAGE_GUARD)
    });

    if let Err(e) = res {
        tracing::warn!(
            pid,
            addr = format_args!("{page:#x}"),
            error = %e,
            "cannot unguard page"
        );
    }
}
