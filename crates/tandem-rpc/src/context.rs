//! Per-process reference registry.
//!
//! One [`RRefContext`] is created when a worker starts and shared (as an
//! `Arc`) by the dispatcher and the request handler. It knows the worker's
//! own id, mints globally unique ids, and tracks:
//!
//! - user forks minted here that the owner has not accepted yet,
//! - owner handles for values this worker holds, and the forks of each.
//!
//! All three maps sit behind a single mutex. Acceptances arrive on the
//! transport's delivery thread while callers mint new forks.

use crate::rref::{OwnerRRef, UserRRef};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tandem_types::ids::{ForkId, GloballyUniqueId, RRefId, WorkerId};
use tracing::{debug, warn};

/// Called when the last clone of a user handle is dropped.
///
/// This is where a reference-release message would be sent to the owner.
/// No such message exists in the current protocol version, so the default
/// hook does nothing.
///
/// A fork that was never accepted (its call failed remotely or its
/// connection was lost) stays in the pending map, which holds a clone of the
/// handle. The hook therefore does not run for it until
/// [`RRefContext::shutdown`] clears the map.
pub trait ReleaseHook: Send + Sync {
    fn on_user_dropped(&self, rref_id: RRefId, fork_id: ForkId);
}

/// A [`ReleaseHook`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRelease;

impl ReleaseHook for NoopRelease {
    fn on_user_dropped(&self, _rref_id: RRefId, _fork_id: ForkId) {}
}

#[derive(Default)]
struct Registry {
    pending_users: HashMap<(RRefId, ForkId), UserRRef>,
    owners: HashMap<RRefId, Arc<OwnerRRef>>,
    forks: HashMap<RRefId, HashSet<ForkId>>,
}

/// Reference bookkeeping for one worker process.
pub struct RRefContext {
    worker_id: WorkerId,
    next_local_id: AtomicU64,
    registry: Mutex<Registry>,
    release: Arc<dyn ReleaseHook>,
}

impl RRefContext {
    pub fn new(worker_id: WorkerId) -> Arc<Self> {
        Self::with_release_hook(worker_id, Arc::new(NoopRelease))
    }

    pub fn with_release_hook(worker_id: WorkerId, release: Arc<dyn ReleaseHook>) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            next_local_id: AtomicU64::new(0),
            registry: Mutex::new(Registry::default()),
            release,
        })
    }

    /// This worker's id.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Mint an id unique across the cluster.
    pub fn gen_globally_unique_id(&self) -> GloballyUniqueId {
        GloballyUniqueId::new(
            self.worker_id,
            self.next_local_id.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Mint a user handle for a value that `owner` will hold.
    ///
    /// The handle is registered as pending before it is returned, so an
    /// acceptance can never arrive for a fork this context does not know.
    pub fn create_user_rref(&self, owner: WorkerId) -> UserRRef {
        assert_ne!(
            owner, self.worker_id,
            "User RRef must not be owned by its creator {}",
            self.worker_id
        );
        let rref_id = RRefId(self.gen_globally_unique_id());
        let fork_id = ForkId(self.gen_globally_unique_id());
        let user = UserRRef::new(owner, rref_id, fork_id, self.release.clone());
        self.lock()
            .pending_users
            .insert((rref_id, fork_id), user.clone());
        debug!(rref = %rref_id, fork = %fork_id, owner = %owner, "Created pending user RRef");
        user
    }

    /// Record the owner's acceptance of a pending fork and confirm the
    /// handle.
    ///
    /// # Panics
    ///
    /// If no pending fork matches. A duplicate or spurious acceptance means
    /// the reference bookkeeping can no longer be trusted.
    pub fn finish_user_rref(&self, rref_id: RRefId, fork_id: ForkId) {
        let user = self.lock().pending_users.remove(&(rref_id, fork_id));
        match user {
            Some(user) => user.confirm(),
            None => panic!(
                "Worker {} received an acceptance for {rref_id} {fork_id}, which is not a pending user RRef",
                self.worker_id
            ),
        }
    }

    /// Forget a pending fork whose request never left this worker.
    pub(crate) fn discard_pending(&self, rref_id: RRefId, fork_id: ForkId) {
        self.lock().pending_users.remove(&(rref_id, fork_id));
    }

    /// Number of user forks still awaiting acceptance.
    pub fn pending_count(&self) -> usize {
        self.lock().pending_users.len()
    }

    /// Whether `(rref_id, fork_id)` is awaiting acceptance.
    pub fn is_pending(&self, rref_id: RRefId, fork_id: ForkId) -> bool {
        self.lock().pending_users.contains_key(&(rref_id, fork_id))
    }

    /// The owner handle for `rref_id`, created on first use.
    pub fn get_or_create_owner_rref(&self, rref_id: RRefId) -> Arc<OwnerRRef> {
        self.lock()
            .owners
            .entry(rref_id)
            .or_insert_with(|| Arc::new(OwnerRRef::new(self.worker_id, rref_id)))
            .clone()
    }

    pub fn owner_rref(&self, rref_id: RRefId) -> Option<Arc<OwnerRRef>> {
        self.lock().owners.get(&rref_id).cloned()
    }

    /// Register a fork of a reference this worker owns.
    pub fn add_fork_of_owner(&self, rref_id: RRefId, fork_id: ForkId) {
        let inserted = self.lock().forks.entry(rref_id).or_default().insert(fork_id);
        if !inserted {
            warn!(rref = %rref_id, fork = %fork_id, "Fork registered twice");
        }
    }

    /// Forks registered for an owned reference.
    pub fn forks_of(&self, rref_id: RRefId) -> Vec<ForkId> {
        let mut forks: Vec<ForkId> = self
            .lock()
            .forks
            .get(&rref_id)
            .map(|f| f.iter().copied().collect())
            .unwrap_or_default();
        forks.sort();
        forks
    }

    /// Drop all registry state. Returns the number of user forks that were
    /// still pending, which is zero after a clean run.
    pub fn shutdown(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let pending = drained.pending_users.len();
        if pending > 0 {
            warn!(
                worker = %self.worker_id,
                pending,
                "Shutting down with user RRefs still awaiting acceptance"
            );
        }
        debug!(
            worker = %self.worker_id,
            owners = drained.owners.len(),
            "RRef context shut down"
        );
        pending
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for RRefContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RRefContext")
            .field("worker_id", &self.worker_id)
            .field("pending", &self.pending_count())
            .finish()
    }
}
