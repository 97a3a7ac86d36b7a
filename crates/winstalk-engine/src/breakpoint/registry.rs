use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use super::{Breakpoint, BreakpointKey, Target, Trap};
use crate::error::{Error, Result};
use crate::native::{Address, NativeDebugger, Pid, Tid};

/// Owner of every breakpoint of a session.
///
/// Besides the breakpoints themselves (kept in definition order), it indexes
/// guarded pages, tracks which breakpoints are running on which thread, and
/// remembers targets that were removed, so that removing them again is not
/// reported as an error.
pub(crate) struct Registry<N: NativeDebugger> {
    breakpoints: IndexMap<BreakpointKey, Breakpoint<N>>,

    /// Guarded page -> page breakpoint covering it.
    pages: HashMap<(Pid, Address), BreakpointKey>,

    /// Breakpoints lifted while a thread single-steps past them.
    running: HashMap<Tid, Vec<BreakpointKey>>,

    retired: HashSet<Target>,
}

impl<N: NativeDebugger> Default for Registry<N> {
    fn default() -> Self {
        Self {
            breakpoints: IndexMap::new(),
            pages: HashMap::new(),
            running: HashMap::new(),
            retired: HashSet::new(),
        }
    }
}

impl<N: NativeDebugger> Registry<N> {
    pub fn get(&self, key: &BreakpointKey) -> Option<&Breakpoint<N>> {
        self.breakpoints.get(key)
    }

    pub fn get_mut(&mut self, key: &BreakpointKey) -> Option<&mut Breakpoint<N>> {
        self.breakpoints.get_mut(key)
    }

    pub fn contains(&self, key: &BreakpointKey) -> bool {
        self.breakpoints.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint<N>> {
        self.breakpoints.values()
    }

    pub fn keys(&self) -> Vec<BreakpointKey> {
        self.breakpoints.keys().copied().collect()
    }

    /// Adds a breakpoint, enforcing that a target is owned at most once.
    ///
    /// Page breakpoints conflict with any page breakpoint guarding one of the
    /// same pages.
    pub fn insert(&mut self, bp: Breakpoint<N>, page_size: u64) -> Result<()> {
        let key = bp.key;

        if self.breakpoints.contains_key(&key) {
            return Err(Error::Conflict(key.into()));
        }

        if let Trap::Page(trap) = &bp.trap {
            let pages = (key.address()..key.address() + trap.size).step_by(page_size as usize);

            for page in pages.clone() {
                if let Some(owner) = self.pages.get(&(bp.pid, page)) {
                    return Err(Error::Conflict((*owner).into()));
                }
            }

            for page in pages {
                self.pages.insert((bp.pid, page), key);
            }
        }

        self.retired.remove(&key.into());
        self.breakpoints.insert(key, bp);

        Ok(())
    }

    /// Removes a breakpoint from the registry, remembering its target.
    ///
    /// The caller is responsible for lifting its trap.
    pub fn remove(&mut self, key: &BreakpointKey) -> Option<Breakpoint<N>> {
        let bp = self.breakpoints.shift_remove(key)?;

        if let BreakpointKey::Page { pid, .. } = *key {
            self.pages.retain(|&(owner, _), page_key| owner != pid || page_key != key);
        }

        self.retired.insert((*key).into());

        Some(bp)
    }

    /// Page breakpoint guarding the page at `page`.
    pub fn page_at(&self, pid: Pid, page: Address) -> Option<BreakpointKey> {
        self.pages.get(&(pid, page)).copied()
    }

    /// Hardware breakpoint of `tid` installed in debug register `slot`.
    pub fn hardware_slot(&self, tid: Tid, slot: usize) -> Option<BreakpointKey> {
        self.breakpoints
            .values()
            .find(|bp| bp.tid() == Some(tid) && bp.slot() == Some(slot))
            .map(|bp| bp.key)
    }

    /// Bit mask of the debug register slots held by breakpoints of `tid`.
    pub fn slots_in_use(&self, tid: Tid) -> u8 {
        self.breakpoints
            .values()
            .filter(|bp| bp.tid() == Some(tid))
            .filter_map(|bp| bp.slot())
            .fold(0, |mask, slot| mask | 1 << slot)
    }

    /// Breakpoints owned by `pid`, hardware breakpoints of its threads
    /// included.
    pub fn process_keys(&self, pid: Pid) -> Vec<BreakpointKey> {
        self.breakpoints
            .values()
            .filter(|bp| bp.pid == pid)
            .map(|bp| bp.key)
            .collect()
    }

    /// Hardware breakpoints owned by `tid`.
    pub fn thread_keys(&self, tid: Tid) -> Vec<BreakpointKey> {
        self.breakpoints
            .values()
            .filter(|bp| bp.tid() == Some(tid))
            .map(|bp| bp.key)
            .collect()
    }

    pub fn push_running(&mut self, tid: Tid, key: BreakpointKey) {
        self.running.entry(tid).or_default().push(key);
    }

    pub fn take_running(&mut self, tid: Tid) -> Vec<BreakpointKey> {
        self.running.remove(&tid).unwrap_or_default()
    }

    pub fn retire(&mut self, target: Target) {
        self.retired.insert(target);
    }

    pub fn revive(&mut self, target: &Target) {
        self.retired.remove(target);
    }

    pub fn is_retired(&self, target: &Target) -> bool {
        self.retired.contains(target)
    }
}
