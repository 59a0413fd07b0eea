//! Hierarchical cancellation
//!
//! A [`Context`] is a cheap, clonable cancellation token. Cancelling one
//! cancels every context derived from it. Cancellation is observed through
//! [`Context::done`], a unit channel that is closed (never sent to), so any
//! channel wait can include it in a [`Select`](crate::channel::Select).

use std::any::Any;
use std::fmt;
use std::sync::{Arc, LazyLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::channel::Channel;

static BACKGROUND: LazyLock<Context> = LazyLock::new(|| Context {
    inner: Arc::new(Inner {
        parent: None,
        kind: Kind::Background,
        deadline: None,
        done: Channel::bounded(1),
        state: Mutex::new(State::default()),
    }),
});

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

enum Kind {
    Background,
    Cancel,
    Value {
        key: &'static str,
        value: Box<dyn Any + Send + Sync>,
    },
}

#[derive(Default)]
struct State {
    err: Option<ContextError>,
    children: Vec<Weak<Inner>>,
}

struct Inner {
    parent: Option<Context>,
    kind: Kind,
    deadline: Option<Instant>,
    done: Channel<()>,
    state: Mutex<State>,
}

impl Inner {
    fn cancel(&self, err: ContextError) {
        let children = {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return;
            }
            state.err = Some(err);
            std::mem::take(&mut state.children)
        };
        self.done.close();
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(err);
            }
        }
    }
}

/// Cancellation token.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner.kind {
            Kind::Background => "background",
            Kind::Cancel => "cancel",
            Kind::Value { .. } => "value",
        };
        f.debug_struct("Context")
            .field("kind", &kind)
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

/// Cancels the context it was created with.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

impl CancelHandle {
    /// Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel(ContextError::Cancelled);
    }
}

impl Context {
    /// Root context; never cancelled.
    pub fn background() -> Self {
        BACKGROUND.clone()
    }

    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        let ctx = Self::derive(parent, Kind::Cancel, parent.inner.deadline);
        let handle = CancelHandle {
            inner: Arc::clone(&ctx.inner),
        };
        (ctx, handle)
    }

    /// Cancels automatically at `deadline` (or earlier if an ancestor does).
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
        let effective = match parent.inner.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        let ctx = Self::derive(parent, Kind::Cancel, Some(effective));
        let handle = CancelHandle {
            inner: Arc::clone(&ctx.inner),
        };
        if effective <= Instant::now() {
            ctx.inner.cancel(ContextError::DeadlineExceeded);
        } else {
            schedule_deadline(Arc::downgrade(&ctx.inner), effective);
        }
        (ctx, handle)
    }

    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelHandle) {
        Self::with_deadline(parent, Instant::now() + timeout)
    }

    /// Attaches a key/value pair; cancellation follows the parent.
    pub fn with_value<V>(parent: &Context, key: &'static str, value: V) -> Context
    where
        V: Any + Send + Sync,
    {
        Self::derive(
            parent,
            Kind::Value {
                key,
                value: Box::new(value),
            },
            parent.inner.deadline,
        )
    }

    fn derive(parent: &Context, kind: Kind, deadline: Option<Instant>) -> Context {
        let ctx = Context {
            inner: Arc::new(Inner {
                parent: Some(parent.clone()),
                kind,
                deadline,
                done: Channel::bounded(1),
                state: Mutex::new(State::default()),
            }),
        };
        if matches!(parent.inner.kind, Kind::Background) {
            return ctx;
        }
        let inherited = {
            let mut state = parent.inner.state.lock();
            match state.err {
                Some(err) => Some(err),
                None => {
                    state.children.retain(|c| c.strong_count() > 0);
                    state.children.push(Arc::downgrade(&ctx.inner));
                    None
                }
            }
        };
        if let Some(err) = inherited {
            ctx.inner.cancel(err);
        }
        ctx
    }

    /// Looks `key` up here and in every ancestor.
    pub fn value<V: Any>(&self, key: &str) -> Option<&V> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Kind::Value { key: k, value } = &ctx.inner.kind
                && *k == key
            {
                return (**value).downcast_ref::<V>();
            }
            current = ctx.inner.parent.as_ref();
        }
        None
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Closed when the context is cancelled.
    pub fn done(&self) -> &Channel<()> {
        self.check_deadline();
        &self.inner.done
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    pub fn err(&self) -> Option<ContextError> {
        self.check_deadline();
        self.inner.state.lock().err
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        let _ = self.done().recv().await;
    }

    fn check_deadline(&self) {
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            self.inner.cancel(ContextError::DeadlineExceeded);
        }
    }
}

fn schedule_deadline(inner: Weak<Inner>, deadline: Instant) {
    let fire = move || {
        if let Some(inner) = inner.upgrade() {
            inner.cancel(ContextError::DeadlineExceeded);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep_until(deadline.into()).await;
                fire();
            });
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name("pika-ctx-deadline".to_string())
                .spawn(move || {
                    std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    fire();
                });
            if let Err(err) = spawned {
                // Deadline is still enforced lazily by `err()` and `done()`.
                tracing::warn!(%err, "failed to spawn deadline timer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_never_cancels() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.err(), None);
        assert!(!ctx.done().is_closed());
    }

    #[test]
    fn cancel_propagates_to_descendants() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        let (child, _child_cancel) = Context::with_cancel(&parent);
        let grandchild = Context::with_value(&child, "k", 1u32);

        cancel.cancel();
        assert_eq!(parent.err(), Some(ContextError::Cancelled));
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(grandchild.done().is_closed());
        assert_eq!(grandchild.err().unwrap().to_string(), "context canceled");
    }

    #[test]
    fn cancelling_child_leaves_parent_alone() {
        let (parent, _cancel) = Context::with_cancel(&Context::background());
        let (child, child_cancel) = Context::with_cancel(&parent);
        child_cancel.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        cancel.cancel();
        let (child, _) = Context::with_cancel(&parent);
        assert!(child.is_cancelled());
    }

    #[test]
    fn values_resolve_through_ancestors() {
        let root = Context::with_value(&Context::background(), "relay", "wss://a".to_string());
        let (child, _) = Context::with_cancel(&root);
        let leaf = Context::with_value(&child, "attempt", 3u8);
        assert_eq!(leaf.value::<String>("relay").map(String::as_str), Some("wss://a"));
        assert_eq!(leaf.value::<u8>("attempt"), Some(&3));
        assert_eq!(leaf.value::<u8>("relay"), None);
        assert_eq!(leaf.value::<u8>("missing"), None);
    }

    #[test]
    fn past_deadline_is_cancelled_immediately() {
        let (ctx, _) = Context::with_deadline(&Context::background(), Instant::now());
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn child_deadline_never_exceeds_parent() {
        let soon = Instant::now() + Duration::from_secs(1);
        let (parent, _) = Context::with_deadline(&Context::background(), soon);
        let (child, _) =
            Context::with_deadline(&parent, Instant::now() + Duration::from_secs(60));
        assert_eq!(child.deadline(), Some(soon));
    }

    #[tokio::test]
    async fn deadline_fires_on_runtime_timer() {
        let (ctx, _) = Context::with_timeout(&Context::background(), Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(2), ctx.cancelled())
            .await
            .expect("deadline fired");
        assert_eq!(ctx.err().unwrap().to_string(), "context deadline exceeded");
    }
}
