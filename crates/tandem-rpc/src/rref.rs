//! Distributed reference handles.
//!
//! An [`RRef`] designates a value that lives on one worker (its owner). The
//! owner holds an [`OwnerRRef`] with the value itself; every other worker
//! holding the reference has a [`UserRRef`], an alias that names the owner
//! and one fork of the reference.
//!
//! A user handle is usable the moment it is created. Its [`UserState`] only
//! tracks whether the owner has registered the fork yet:
//!
//! ```text
//! Pending --acceptance--> Confirmed
//!    |
//!    +--remote exception--> Failed
//!    |
//!    +--connection lost---> Disconnected
//! ```

use crate::context::ReleaseHook;
use crate::error::{ConnectionLost, RpcError, RpcResult};
use std::sync::Arc;
use tandem_types::error::TandemError;
use tandem_types::ids::{ForkId, RRefId, WorkerId};
use tandem_types::value::Value;
use tokio::sync::watch;
use tracing::debug;

/// Confirmation state of a user handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserState {
    /// Minted locally; the owner has not acknowledged the fork yet.
    Pending,
    /// The owner registered the fork.
    Confirmed,
    /// The call that should have created the value failed remotely.
    Failed(String),
    /// The connection to the owner failed before it answered. Whether the
    /// owner holds the value is unknown.
    Disconnected(ConnectionLost),
}

impl UserState {
    pub fn is_pending(&self) -> bool {
        matches!(self, UserState::Pending)
    }
}

struct UserInner {
    rref_id: RRefId,
    fork_id: ForkId,
    owner: WorkerId,
    state: watch::Sender<UserState>,
    release: Arc<dyn ReleaseHook>,
}

impl Drop for UserInner {
    fn drop(&mut self) {
        self.release.on_user_dropped(self.rref_id, self.fork_id);
    }
}

/// A consumer-side alias for a value owned by another worker.
///
/// Clones share state; the release hook runs when the last clone drops.
#[derive(Clone)]
pub struct UserRRef {
    inner: Arc<UserInner>,
}

impl UserRRef {
    pub(crate) fn new(
        owner: WorkerId,
        rref_id: RRefId,
        fork_id: ForkId,
        release: Arc<dyn ReleaseHook>,
    ) -> Self {
        let (state, _) = watch::channel(UserState::Pending);
        Self {
            inner: Arc::new(UserInner {
                rref_id,
                fork_id,
                owner,
                state,
                release,
            }),
        }
    }

    pub fn rref_id(&self) -> RRefId {
        self.inner.rref_id
    }

    pub fn fork_id(&self) -> ForkId {
        self.inner.fork_id
    }

    /// Worker that owns the value.
    pub fn owner(&self) -> WorkerId {
        self.inner.owner
    }

    pub fn state(&self) -> UserState {
        self.inner.state.borrow().clone()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state() == UserState::Confirmed
    }

    /// Why this handle failed, if it did: a [`TandemError::RemoteError`]
    /// for a failed computation, a transport error for a lost connection.
    pub fn error(&self) -> Option<RpcError> {
        settled_error(self.state())
    }

    /// Wait until the handle leaves `Pending`, then report [`Self::error`].
    pub async fn wait_settled(&self) -> RpcResult<()> {
        let mut rx = self.inner.state.subscribe();
        let settled = rx
            .wait_for(|s| !s.is_pending())
            .await
            .map(|s| (*s).clone())
            .unwrap_or(UserState::Pending);
        match settled_error(settled) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn confirm(&self) {
        self.transition(UserState::Confirmed);
    }

    pub(crate) fn fail(&self, text: String) {
        self.transition(UserState::Failed(text));
    }

    pub(crate) fn disconnect(&self, lost: ConnectionLost) {
        self.transition(UserState::Disconnected(lost));
    }

    fn transition(&self, next: UserState) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_pending() {
                *state = next.clone();
                true
            } else {
                false
            }
        });
        if changed {
            debug!(rref = %self.inner.rref_id, fork = %self.inner.fork_id, state = ?next, "User RRef settled");
        }
    }
}

fn settled_error(state: UserState) -> Option<RpcError> {
    match state {
        UserState::Failed(text) => Some(TandemError::RemoteError(text).into()),
        UserState::Disconnected(lost) => Some(lost.into()),
        UserState::Pending | UserState::Confirmed => None,
    }
}

impl std::fmt::Debug for UserRRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRRef")
            .field("rref_id", &self.inner.rref_id)
            .field("fork_id", &self.inner.fork_id)
            .field("owner", &self.inner.owner)
            .field("state", &self.state())
            .finish()
    }
}

/// The owner-side handle: holds the value once it has been computed.
pub struct OwnerRRef {
    rref_id: RRefId,
    owner: WorkerId,
    value: watch::Sender<Option<Result<Value, String>>>,
}

impl OwnerRRef {
    pub(crate) fn new(owner: WorkerId, rref_id: RRefId) -> Self {
        let (value, _) = watch::channel(None);
        Self {
            rref_id,
            owner,
            value,
        }
    }

    pub fn rref_id(&self) -> RRefId {
        self.rref_id
    }

    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn has_value(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// The value, if it has been computed.
    pub fn value(&self) -> Option<Result<Value, String>> {
        self.value.borrow().clone()
    }

    pub fn set_value(&self, value: Value) {
        self.value.send_replace(Some(Ok(value)));
    }

    pub fn set_error(&self, error: String) {
        self.value.send_replace(Some(Err(error)));
    }

    /// Wait until the value (or the error that replaced it) is set.
    pub async fn wait_value(&self) -> Result<Value, TandemError> {
        let mut rx = self.value.subscribe();
        let ready = rx
            .wait_for(|v| v.is_some())
            .await
            .map(|v| (*v).clone())
            .map_err(|_| TandemError::Internal("owner RRef dropped".to_string()))?;
        match ready {
            Some(Ok(value)) => Ok(value),
            Some(Err(text)) => Err(TandemError::RemoteError(text)),
            None => Err(TandemError::Internal("owner RRef has no value".to_string())),
        }
    }
}

impl std::fmt::Debug for OwnerRRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerRRef")
            .field("rref_id", &self.rref_id)
            .field("owner", &self.owner)
            .field("has_value", &self.has_value())
            .finish()
    }
}

/// A reference handle in either of its two roles.
#[derive(Debug, Clone)]
pub enum RRef {
    Owner(Arc<OwnerRRef>),
    User(UserRRef),
}

impl RRef {
    pub fn rref_id(&self) -> RRefId {
        match self {
            RRef::Owner(o) => o.rref_id(),
            RRef::User(u) => u.rref_id(),
        }
    }

    /// Worker that owns the value.
    pub fn owner(&self) -> WorkerId {
        match self {
            RRef::Owner(o) => o.owner(),
            RRef::User(u) => u.owner(),
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, RRef::Owner(_))
    }
}

impl From<UserRRef> for RRef {
    fn from(user: UserRRef) -> Self {
        RRef::User(user)
    }
}

impl From<Arc<OwnerRRef>> for RRef {
    fn from(owner: Arc<OwnerRRef>) -> Self {
        RRef::Owner(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoopRelease;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tandem_types::ids::GloballyUniqueId;

    fn user(release: Arc<dyn ReleaseHook>) -> UserRRef {
        UserRRef::new(
            WorkerId(2),
            RRefId(GloballyUniqueId::new(WorkerId(1), 0)),
            ForkId(GloballyUniqueId::new(WorkerId(1), 1)),
            release,
        )
    }

    #[test]
    fn test_user_settles_once() {
        let u = user(Arc::new(NoopRelease));
        assert_eq!(u.state(), UserState::Pending);
        u.confirm();
        u.fail("late".to_string());
        assert_eq!(u.state(), UserState::Confirmed);
        assert!(u.error().is_none());
    }

    #[test]
    fn test_failed_user_reports_remote_error() {
        let u = user(Arc::new(NoopRelease));
        u.fail("boom".to_string());
        u.confirm();
        assert_eq!(u.error().unwrap().remote_text(), Some("boom"));
    }

    #[test]
    fn test_disconnected_user_reports_transport_error() {
        let u = user(Arc::new(NoopRelease));
        u.disconnect(ConnectionLost::new("w2", "reset by peer"));
        u.fail("late".to_string());
        assert!(matches!(u.state(), UserState::Disconnected(ref l) if l.worker == "w2"));
        let err = u.error().unwrap();
        assert!(err.is_transport());
        assert!(err.remote_text().is_none());
    }

    #[tokio::test]
    async fn test_wait_settled_sees_failure() {
        let u = user(Arc::new(NoopRelease));
        let waiter = u.clone();
        let task = tokio::spawn(async move { waiter.wait_settled().await });
        tokio::task::yield_now().await;
        u.fail("remote failure".to_string());
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Remote error: remote failure");
    }

    struct CountingRelease(AtomicUsize);

    impl ReleaseHook for CountingRelease {
        fn on_user_dropped(&self, _rref_id: RRefId, _fork_id: ForkId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_hook_runs_when_last_clone_drops() {
        let hook = Arc::new(CountingRelease(AtomicUsize::new(0)));
        let u = user(hook.clone());
        let alias = RRef::from(u.clone());
        drop(u);
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);
        assert!(!alias.is_owner());
        drop(alias);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_owner_value() {
        let owner = Arc::new(OwnerRRef::new(
            WorkerId(2),
            RRefId(GloballyUniqueId::new(WorkerId(1), 0)),
        ));
        assert!(!owner.has_value());
        owner.set_value(Value::Int(9));
        assert_eq!(owner.wait_value().await.unwrap(), Value::Int(9));
        assert_eq!(RRef::from(owner).owner(), WorkerId(2));
    }
}
