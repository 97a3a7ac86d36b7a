//! Buffer watches.
//!
//! Any byte range of a process can be watched, even when it is smaller than
//! a page or shares its pages with other watched ranges. Every page spanned
//! by a watched range is guarded by a single-page breakpoint, and each page
//! keeps the list of watched ranges overlapping it. A guard page hit runs the
//! action of every range containing the faulting address. Hits elsewhere in
//! the page are consumed silently.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::rc::Rc;

use crate::breakpoint::{Action, BreakpointKey, BreakpointState, Callback, Target};
use crate::error::{BoxError, Error, Result};
use crate::event::{Event, ExceptionInfo};
use crate::native::{Address, NativeDebugger, Pid, align_down, pages_spanned};
use crate::session::Session;

pub(crate) struct WatchedBuffer<N: NativeDebugger> {
    address: Address,
    size: u64,
    action: Callback<N>,
    one_shot: bool,
}

impl<N: NativeDebugger> WatchedBuffer<N> {
    fn contains(&self, address: Address) -> bool {
        address >= self.address && address - self.address < self.size
    }

    fn is(&self, address: Address, size: u64) -> bool {
        self.address == address && self.size == size
    }
}

/// Watched ranges of a session, indexed by guarded page.
pub(crate) struct BufferTable<N: NativeDebugger> {
    pages: HashMap<(Pid, Address), Vec<Rc<WatchedBuffer<N>>>>,
}

impl<N: NativeDebugger> Default for BufferTable<N> {
    fn default() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }
}

impl<N: NativeDebugger> Session<N> {
    /// Watches every access to `[address, address + size)`.
    ///
    /// `action` runs on each access falling within the range.
    pub fn watch_buffer<F>(&mut self, pid: Pid, address: Address, size: u64, action: F) -> Result<()>
    where
        F: FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError> + 'static,
    {
        self.place_buffer(pid, address, size, Rc::new(RefCell::new(action)), false)
    }

    /// Watches the next access to `[address, address + size)` only.
    pub fn stalk_buffer<F>(&mut self, pid: Pid, address: Address, size: u64, action: F) -> Result<()>
    where
        F: FnMut(&mut Session<N>, &mut Event) -> core::result::Result<(), BoxError> + 'static,
    {
        self.place_buffer(pid, address, size, Rc::new(RefCell::new(action)), true)
    }

    /// Stops watching `[address, address + size)`.
    ///
    /// Removing a range that was already removed, or whose process is gone,
    /// succeeds.
    pub fn dont_watch_buffer(&mut self, pid: Pid, address: Address, size: u64) -> Result<()> {
        self.unwatch(pid, address, size)
    }

    /// Stops stalking `[address, address + size)`, if not already hit.
    pub fn dont_stalk_buffer(&mut self, pid: Pid, address: Address, size: u64) -> Result<()> {
        self.unwatch(pid, address, size)
    }

    /// Returns whether exactly `[address, address + size)` is watched.
    pub fn is_buffer_watched(&self, pid: Pid, address: Address, size: u64) -> bool {
        let page = align_down(address, self.native.page_size());

        self.buffers
            .pages
            .get(&(pid, page))
            .is_some_and(|buffers| buffers.iter().any(|buffer| buffer.is(address, size)))
    }

    fn place_buffer(
        &mut self,
        pid: Pid,
        address: Address,
        size: u64,
        action: Callback<N>,
        one_shot: bool,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidTarget {
                address,
                reason: "empty buffer",
            });
        }

        if !self.is_debuggee(pid) {
            return Err(Error::TargetGone);
        }

        let target = Target::Buffer { pid, address, size };

        if self.is_buffer_watched(pid, address, size) {
            return Err(Error::Conflict(target));
        }

        let page_size = self.native.page_size();
        let pages = pages_spanned(address, size, page_size).collect::<Vec<_>>();

        // pages already guarded by a user page breakpoint cannot be shared
        for &page in &pages {
            if let Some(owner) = self.registry.page_at(pid, page) {
                if !self.is_buffer_page(&owner) {
                    return Err(Error::Conflict(owner.into()));
                }
            }
        }

        let mut created = Vec::new();

        for &page in &pages {
            if self.registry.page_at(pid, page).is_some() {
                continue;
            }

            let placed = self
                .define_page_breakpoint(pid, page, page_size)
                .and_then(|key| self.place(key, Some(Action::Buffer), BreakpointState::Enabled));

            match placed {
                Ok(()) => created.push(BreakpointKey::Page { pid, address: page }),
                Err(e) => {
                    for key in created {
                        if let Err(e) = self.erase_breakpoint(&key) {
                            tracing::warn!(%key, error = %e, "cannot roll back buffer page");
                        }
                        self.registry.revive(&key.into());
                    }
                    return Err(e);
                }
            }
        }

        let buffer = Rc::new(WatchedBuffer {
            address,
            size,
            action,
            one_shot,
        });

        for page in pages {
            self.buffers
                .pages
                .entry((pid, page))
                .or_default()
                .push(buffer.clone());
        }

        self.registry.revive(&target);

        tracing::debug!(
            pid,
            addr = format_args!("{address:#x}"),
            size,
            one_shot,
            "buffer watched"
        );

        Ok(())
    }

    fn unwatch(&mut self, pid: Pid, address: Address, size: u64) -> Result<()> {
        let target = Target::Buffer { pid, address, size };

        let mut found = false;
        let mut emptied = Vec::new();

        for page in pages_spanned(address, size, self.native.page_size()) {
            let Entry::Occupied(mut entry) = self.buffers.pages.entry((pid, page)) else {
                continue;
            };

            let count = entry.get().len();
            entry.get_mut().retain(|buffer| !buffer.is(address, size));
            found |= entry.get().len() != count;

            if entry.get().is_empty() {
                entry.remove();
                emptied.push(page);
            }
        }

        if !found {
            if self.registry.is_retired(&target) || !self.is_debuggee(pid) {
                return Ok(());
            }
            return Err(Error::NotFound(target));
        }

        self.registry.retire(target);

        tracing::debug!(pid, addr = format_args!("{address:#x}"), size, "buffer unwatched");

        let mut res = Ok(());

        for page in emptied {
            let key = BreakpointKey::Page { pid, address: page };

            if self.registry.contains(&key) {
                res = res.and(self.erase_breakpoint(&key));
            }
        }

        res
    }

    fn is_buffer_page(&self, key: &BreakpointKey) -> bool {
        self.registry
            .get(key)
            .is_some_and(|bp| matches!(bp.action, Some(Action::Buffer)))
    }

    /// Runs the actions of the watched ranges touched by a guard page hit.
    pub(crate) fn touch_buffer(&mut self, event: &mut Event) -> Result<()> {
        let Some(address) = event.exception().and_then(ExceptionInfo::fault_address) else {
            return Ok(());
        };

        let pid = event.pid();
        let page = align_down(address, self.native.page_size());

        let touched = self
            .buffers
            .pages
            .get(&(pid, page))
            .map(|buffers| {
                buffers
                    .iter()
                    .filter(|buffer| buffer.contains(address))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if touched.is_empty() {
            tracing::trace!(pid, addr = format_args!("{address:#x}"), "unwatched byte touched");
            return Ok(());
        }

        let mut res = Ok(());

        for buffer in touched {
            let done = (&mut *buffer.action.borrow_mut())(self, event).map_err(Error::Action);
            res = res.and(done);

            if buffer.one_shot && self.is_buffer_watched(pid, buffer.address, buffer.size) {
                res = res.and(self.unwatch(pid, buffer.address, buffer.size));
            }
        }

        res
    }

    /// Drops the watched ranges of an exited process.
    pub(crate) fn forget_process_buffers(&mut self, pid: Pid) {
        self.buffers.pages.retain(|&(owner, _), _| owner != pid);
    }
}
