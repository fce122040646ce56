//! # Ambient Call Context
//!
//! Every request carries an [`RpcContext`]: the deadline, the cancellation
//! signal, and a typed bag of request-scoped state. The context is the
//! universal abort channel: every suspension point in the crate (retry
//! sleeps, deadline races, rate-limiter waits) observes it and unwinds
//! promptly when it fires.
//!
//! ## Cancellation vs. deadline
//!
//! Explicit cancellation and deadline expiry are distinct outcomes:
//! cancelling a token records a cause (usually [`Code::Cancelled`]) that is
//! propagated verbatim, while a context whose deadline has passed reports
//! [`Code::DeadlineExceeded`]. [`RpcContext::error`] and
//! [`RpcContext::done`] encode that distinction.
//!
//! ## Typed extensions
//!
//! Request-scoped values are carried in [`Extensions`], keyed by type rather
//! than by string, so independent middlewares cannot collide. The
//! [`CallerIdentity`] extension is the minimal contract with authentication
//! collaborators: middlewares that care whether a caller is authenticated
//! (e.g. the response cache) look it up by type.
//!
//! [`Code::Cancelled`]: crate::error::Code::Cancelled
//! [`Code::DeadlineExceeded`]: crate::error::Code::DeadlineExceeded

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::Notify;

use crate::error::Status;

/// A cancellation signal shared between a request and everything spawned on
/// its behalf.
///
/// Tokens form a tree: cancelling a token cancels all of its descendants
/// with the same cause, while a child cancelling itself leaves the parent
/// untouched. The first cancellation wins; later causes are discarded.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    cause: Mutex<Option<Status>>,
    notify: Notify,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                cause: Mutex::new(None),
                notify: Notify::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Derives a child token that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        let child = CancelToken::new();
        if let Some(cause) = self.cause() {
            cancel_inner(&child.inner, cause);
        } else {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            children.push(Arc::downgrade(&child.inner));
            // A cancel may have slipped in while we registered.
            drop(children);
            if let Some(cause) = self.cause() {
                cancel_inner(&child.inner, cause);
            }
        }
        child
    }

    /// Cancels this token (and its descendants) with the given cause.
    ///
    /// The first cancellation wins; cancelling an already-cancelled token is
    /// a no-op.
    pub fn cancel(&self, cause: Status) {
        cancel_inner(&self.inner, cause);
    }

    /// Returns `true` once the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns the cancellation cause, if the token has been cancelled.
    pub fn cause(&self) -> Option<Status> {
        if !self.is_cancelled() {
            return None;
        }
        self.inner
            .cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolves once the token is cancelled. Resolves immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before the final check so a concurrent
            // cancel cannot slip between check and await.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Marks the token cancelled and fans out to live descendants without
/// recursing.
fn cancel_inner(inner: &Arc<TokenInner>, cause: Status) {
    let mut pending = vec![Arc::clone(inner)];
    while let Some(node) = pending.pop() {
        {
            let mut slot = node
                .cause
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_some() {
                continue;
            }
            *slot = Some(cause.clone());
        }
        node.cancelled.store(true, Ordering::Release);
        node.notify.notify_waiters();

        let children = {
            let mut children = node
                .children
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *children)
        };
        pending.extend(children.into_iter().filter_map(|weak| weak.upgrade()));
    }
}

/// A typed, request-scoped value bag.
///
/// Values are keyed by their type, so two middlewares can never collide on a
/// string key. Cloning an `Extensions` shares the stored values.
#[derive(Clone, Default)]
pub struct Extensions {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Creates an empty extension bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Returns a reference to the stored value of type `T`, if any.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Removes the stored value of type `T`.
    pub fn remove<T: Send + Sync + 'static>(&mut self) {
        self.map.remove(&TypeId::of::<T>());
    }

    /// Returns `true` if a value of type `T` is stored.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

/// The authenticated caller, as established by an authentication
/// collaborator upstream of this crate.
///
/// Presence of this extension is what "authenticated" means to the policies
/// here; its contents are otherwise opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Stable subject identifier (user id, service account, ...).
    pub subject: String,
    /// Roles granted to the caller.
    pub roles: Vec<String>,
}

impl CallerIdentity {
    /// Creates an identity with no roles.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            roles: Vec::new(),
        }
    }

    /// Adds a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// The ambient context carried by every call: deadline, cancellation, and
/// typed request-scoped state.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    deadline: Option<Instant>,
    cancel: CancelToken,
    extensions: Extensions,
}

impl RpcContext {
    /// Creates a context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the effective deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Derives a child context bounded by `deadline`.
    ///
    /// If the parent already has an earlier deadline, the earlier one wins.
    /// The child's cancellation is linked to the parent's: cancelling the
    /// parent cancels the child, but not vice versa.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let effective = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(effective),
            cancel: self.cancel.child(),
            extensions: self.extensions.clone(),
        }
    }

    /// Returns the cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Cancels the context with the given cause.
    pub fn cancel(&self, cause: Status) {
        self.cancel.cancel(cause);
    }

    /// Returns `true` once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the reason this context is no longer usable, if any.
    ///
    /// An explicit cancellation cause takes precedence; otherwise an expired
    /// deadline reports [`Code::DeadlineExceeded`].
    ///
    /// [`Code::DeadlineExceeded`]: crate::error::Code::DeadlineExceeded
    pub fn error(&self) -> Option<Status> {
        if let Some(cause) = self.cancel.cause() {
            return Some(cause);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Status::deadline_exceeded("context deadline exceeded"))
            }
            _ => None,
        }
    }

    /// Resolves with the abort cause when the context is cancelled or its
    /// deadline passes, whichever comes first. Pends forever on a context
    /// that has neither.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => {
                let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                tokio::select! {
                    _ = self.cancel.cancelled() => self.abort_cause(),
                    _ = sleep => self
                        .cancel
                        .cause()
                        .unwrap_or_else(|| Status::deadline_exceeded("context deadline exceeded")),
                }
            }
            None => {
                self.cancel.cancelled().await;
                self.abort_cause()
            }
        }
    }

    fn abort_cause(&self) -> Status {
        self.cancel
            .cause()
            .unwrap_or_else(|| Status::cancelled("context cancelled"))
    }

    /// Read access to the typed extension bag.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Write access to the typed extension bag.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Convenience accessor for the caller identity extension.
    pub fn caller(&self) -> Option<&CallerIdentity> {
        self.extensions.get::<CallerIdentity>()
    }
}
