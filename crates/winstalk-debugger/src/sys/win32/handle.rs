use windows::Win32::Foundation::{CloseHandle, HANDLE};

/// Handle closed on drop.
///
/// Handles given by debug events belong to the system and are never wrapped
/// in this type.
#[derive(Debug)]
pub(super) struct OwnedHandle(HANDLE);

impl OwnedHandle {
    /// Takes ownership of `handle`, if valid.
    pub(super) fn new(handle: HANDLE) -> Option<Self> {
        (!handle.is_invalid()).then_some(Self(handle))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            tracing::warn!(error = %e, "CloseHandle");
        }
    }
}
