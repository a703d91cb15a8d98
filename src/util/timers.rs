use std::future::Future;
use std::hash::Hash;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Scheduled tasks of one owner (a connection, the stack), at most one per kind. Scheduling a
///  kind again replaces (aborts) the previous task of that kind, and all tasks are aborted when
///  the owner cancels them or drops this.
///
/// Every scheduled task gets a token. A firing task passes its token back through
///  [Timers::fired] so that the entry is removed without aborting the task that is currently
///  running.
pub struct Timers<K> {
    handles: FxHashMap<K, (u64, Instant, JoinHandle<()>)>,
    next_token: u64,
}

impl <K: Copy + Eq + Hash + std::fmt::Debug> Default for Timers<K> {
    fn default() -> Self {
        Timers {
            handles: FxHashMap::default(),
            next_token: 0,
        }
    }
}

impl <K: Copy + Eq + Hash + std::fmt::Debug> Timers<K> {
    pub fn schedule<F, Fut>(&mut self, kind: K, at: Instant, on_fire: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(kind);

        self.next_token += 1;
        let token = self.next_token;
        let fut = on_fire(token);
        let handle = tokio::spawn(async move {
            sleep_until(at).await;
            fut.await;
        });
        self.handles.insert(kind, (token, at, handle));
    }

    /// Schedules unless a task of this kind is already due no later than `at`
    pub fn schedule_no_later<F, Fut>(&mut self, kind: K, at: Instant, on_fire: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(current) = self.deadline(kind) {
            if current <= at {
                return;
            }
        }
        self.schedule(kind, at, on_fire);
    }

    /// To be called by a firing task before doing its work. Returns `false` if the task was
    ///  replaced or cancelled in the meantime, and its work must not be done.
    pub fn fired(&mut self, kind: K, token: u64) -> bool {
        match self.handles.get(&kind) {
            Some((current, _, _)) if *current == token => {
                self.handles.remove(&kind);
                true
            }
            _ => {
                trace!("stale timer {:?} ignored", kind);
                false
            }
        }
    }

    pub fn deadline(&self, kind: K) -> Option<Instant> {
        self.handles.get(&kind).map(|(_, at, _)| *at)
    }

    pub fn is_scheduled(&self, kind: K) -> bool {
        self.handles.contains_key(&kind)
    }

    pub fn cancel(&mut self, kind: K) {
        if let Some((_, _, handle)) = self.handles.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, _, handle)) in self.handles.drain() {
            handle.abort();
        }
    }
}

impl <K> Drop for Timers<K> {
    fn drop(&mut self) {
        for (_, (_, _, handle)) in self.handles.drain() {
            handle.abort();
        }
    }
}
