//! Per-request context: breadcrumb log and the detach capability.
//!
//! The context is an explicit handle passed by reference through every
//! pipeline component. It carries the request ID, an ordered breadcrumb log
//! with elapsed milliseconds, and the capability to run a future to
//! completion outside the response lifetime.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// One entry in the per-request event log.
#[derive(Debug, Clone)]
pub struct Breadcrumb {
    pub component: &'static str,
    pub message: String,
    pub elapsed_ms: u128,
}

/// Capability to run a future to completion regardless of response lifetime.
///
/// Offered by the host runtime; optional. When absent, background work is
/// retained in the instance-wide [`BackgroundTasks`] set instead.
pub trait Detacher: Send + Sync {
    fn detach(&self, fut: BoxFuture<'static, ()>);
}

/// Detacher backed by the tokio runtime. A spawned task keeps running when
/// the response future is dropped, so client disconnect never cancels
/// persistent writes.
pub struct TokioDetacher;

impl Detacher for TokioDetacher {
    fn detach(&self, fut: BoxFuture<'static, ()>) {
        tokio::spawn(fut);
    }
}

/// Bounded set of background task handles, used when no detach capability
/// is available. Tasks still run to completion; the set only bounds the
/// bookkeeping and gives shutdown a drain point.
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn spawn(&self, fut: BoxFuture<'static, ()>) {
        let handle = tokio::spawn(fut);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        if handles.len() < self.capacity {
            handles.push(handle);
        }
        // Over capacity the handle is dropped; the task itself keeps running.
    }

    /// Await every tracked task, giving each the remaining drain window.
    pub async fn drain(&self, window: std::time::Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let deadline = tokio::time::Instant::now() + window;
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                tracing::warn!("background task did not finish within drain window");
                return;
            }
        }
    }

    pub fn pending(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Per-request bag: ID, start time, breadcrumbs, detach capability.
///
/// Created at ingress, passed by reference through all components,
/// flushed after the response is handed back.
pub struct RequestContext {
    pub id: String,
    started_at: Instant,
    breadcrumbs: Mutex<Vec<Breadcrumb>>,
    detacher: Option<Arc<dyn Detacher>>,
    background: Arc<BackgroundTasks>,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        id: String,
        detacher: Option<Arc<dyn Detacher>>,
        background: Arc<BackgroundTasks>,
    ) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            breadcrumbs: Mutex::new(Vec::new()),
            detacher,
            background,
        }
    }

    /// Context with the tokio detacher, for tests and single-purpose tools.
    #[must_use]
    pub fn detached(id: impl Into<String>) -> Self {
        Self::new(
            id.into(),
            Some(Arc::new(TokioDetacher)),
            Arc::new(BackgroundTasks::default()),
        )
    }

    pub fn breadcrumb(&self, component: &'static str, message: impl Into<String>) {
        self.breadcrumbs.lock().push(Breadcrumb {
            component,
            message: message.into(),
            elapsed_ms: self.started_at.elapsed().as_millis(),
        });
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    /// Run `fut` to completion outside the response path. Uses the host
    /// detach capability when present, else the bounded background set.
    /// Never blocks the response on the detached work.
    pub fn detach(&self, fut: BoxFuture<'static, ()>) {
        match &self.detacher {
            Some(detacher) => detacher.detach(fut),
            None => self.background.spawn(fut),
        }
    }

    /// Emit the breadcrumb log as structured tracing events.
    pub fn flush(&self) {
        let breadcrumbs = self.breadcrumbs.lock();
        for crumb in breadcrumbs.iter() {
            tracing::debug!(
                request_id = %self.id,
                component = crumb.component,
                elapsed_ms = %crumb.elapsed_ms,
                "{}",
                crumb.message
            );
        }
        tracing::info!(
            request_id = %self.id,
            breadcrumbs = breadcrumbs.len(),
            total_ms = %self.started_at.elapsed().as_millis(),
            "request finished"
        );
    }

    #[must_use]
    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.breadcrumbs.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_breadcrumbs_are_ordered() {
        let ctx = RequestContext::detached("req-1");
        ctx.breadcrumb("router", "matched pattern videos");
        ctx.breadcrumb("cache", "kv hit");

        let crumbs = ctx.breadcrumbs();
        assert_eq!(crumbs.len(), 2);
        assert_eq!(crumbs[0].component, "router");
        assert_eq!(crumbs[1].component, "cache");
        assert!(crumbs[0].elapsed_ms <= crumbs[1].elapsed_ms);
    }

    #[tokio::test]
    async fn test_detach_runs_future_to_completion() {
        let ctx = RequestContext::detached("req-2");
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();

        ctx.detach(Box::pin(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            done_clone.store(true, Ordering::SeqCst);
        }));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_background_tasks_without_detacher() {
        let background = Arc::new(BackgroundTasks::new(4));
        let ctx = RequestContext::new("req-3".to_string(), None, background.clone());
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();

        ctx.detach(Box::pin(async move {
            done_clone.store(true, Ordering::SeqCst);
        }));

        background.drain(std::time::Duration::from_secs(1)).await;
        assert!(done.load(Ordering::SeqCst));
    }
}
