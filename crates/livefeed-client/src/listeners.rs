//! Callback registration with owned unsubscribe handles.
//!
//! Every event source in this crate (connection open/close, inbound frames,
//! health changes) hands out an [`Unsubscribe`] when a callback is
//! registered. Dropping or consuming the handle removes the callback, exactly
//! once.
//!
//! [`Listeners::emit`] copies the callback list before invoking anything, so
//! a callback may register, unsubscribe, or trigger further emits without
//! deadlocking.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Disposer returned by every `on_*` / `subscribe` registration.
///
/// Runs its teardown when [`unsubscribe`](Self::unsubscribe) is called or the
/// handle is dropped, whichever comes first.
#[must_use = "dropping an Unsubscribe immediately removes the callback"]
pub struct Unsubscribe {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// A handle with nothing to tear down.
    pub fn noop() -> Self {
        Self { teardown: None }
    }

    pub fn unsubscribe(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.teardown.is_some())
            .finish()
    }
}

type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct ListenerSet<A> {
    next_id: u64,
    entries: Vec<(u64, Listener<A>)>,
}

/// A set of callbacks taking `&A`.
pub struct Listeners<A> {
    inner: Arc<Mutex<ListenerSet<A>>>,
}

impl<A: 'static> Listeners<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn register(&self, callback: impl Fn(&A) + Send + Sync + 'static) -> Unsubscribe {
        let listener: Listener<A> = Arc::new(callback);
        let id = {
            let mut set = self.inner.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.entries.push((id, listener));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn emit(&self, arg: &A) {
        let snapshot: Vec<Listener<A>> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(arg);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: 'static> Default for Listeners<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for Listeners<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
