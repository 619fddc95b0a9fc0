//! Registry of live display handles. A handle is the revocable token other
//! layers hand to a view; the bytes behind it live here and only here, so
//! every buffer is released exactly once no matter who held the token.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

/// Opaque token for displayable image bytes. Copyable; holding one does not
/// keep the bytes alive; `resolve` fails after the tracker revokes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayHandle(u64);

/// Returned by `register_cleanup`; pass back to `unregister_cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupToken(u64);

type CleanupFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    live: FxHashMap<u64, Arc<[u8]>>,
    // Creation order, oldest first. Drives the emergency trim.
    order: VecDeque<u64>,
}

#[derive(Default)]
struct Callbacks {
    next_token: u64,
    entries: Vec<(u64, CleanupFn)>,
}

#[derive(Default)]
pub struct ResourceTracker {
    registry: Mutex<Registry>,
    callbacks: Mutex<Callbacks>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle for `bytes`. Creation and tracking are one atomic
    /// step; there is no way to obtain an untracked handle.
    pub fn create(&self, bytes: Arc<[u8]>) -> DisplayHandle {
        let mut reg = self.registry.lock().unwrap();
        reg.next_id += 1;
        let id = reg.next_id;
        reg.live.insert(id, bytes);
        reg.order.push_back(id);
        DisplayHandle(id)
    }

    pub fn resolve(&self, handle: DisplayHandle) -> Option<Arc<[u8]>> {
        self.registry.lock().unwrap().live.get(&handle.0).cloned()
    }

    /// Revoke one handle. Unknown or already-revoked handles are a no-op.
    pub fn revoke(&self, handle: DisplayHandle) {
        let mut reg = self.registry.lock().unwrap();
        if reg.live.remove(&handle.0).is_some() {
            reg.order.retain(|id| *id != handle.0);
        }
    }

    /// Revoke every tracked handle and clear tracking state.
    pub fn revoke_all(&self) {
        let mut reg = self.registry.lock().unwrap();
        reg.live.clear();
        reg.order.clear();
    }

    /// Emergency path: keep only the `keep` most recently created handles,
    /// revoking everything older. Returns how many were revoked.
    pub fn trim_to_newest(&self, keep: usize) -> usize {
        let mut reg = self.registry.lock().unwrap();
        let mut revoked = 0;
        while reg.order.len() > keep {
            if let Some(oldest) = reg.order.pop_front() {
                reg.live.remove(&oldest);
                revoked += 1;
            }
        }
        revoked
    }

    pub fn len(&self) -> usize {
        self.registry.lock().unwrap().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hook full-teardown / emergency cleanup. The callback may call back
    /// into this tracker; it is never invoked under the registry lock.
    pub fn register_cleanup(&self, f: impl Fn() + Send + Sync + 'static) -> CleanupToken {
        let mut cbs = self.callbacks.lock().unwrap();
        cbs.next_token += 1;
        let token = cbs.next_token;
        cbs.entries.push((token, Arc::new(f)));
        CleanupToken(token)
    }

    pub fn unregister_cleanup(&self, token: CleanupToken) {
        self.callbacks.lock().unwrap().entries.retain(|(t, _)| *t != token.0);
    }

    /// Invoke all cleanup callbacks. A panicking callback is logged and the
    /// rest still run.
    pub fn run_cleanup_callbacks(&self) {
        let snapshot: Vec<CleanupFn> = {
            let cbs = self.callbacks.lock().unwrap();
            cbs.entries.iter().map(|(_, f)| f.clone()).collect()
        };
        for cb in snapshot {
            if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                log::warn!("cleanup callback panicked, continuing");
            }
        }
    }
}
