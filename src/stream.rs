use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::Disposer;

/// One live logical stream (presence, incidents, geolocation watch).
///
/// Stopping is synchronous: the disposer runs before `stop` returns, so no
/// further snapshot can be delivered to the drain task afterwards.
#[derive(Debug)]
pub struct StreamHandle {
    name: &'static str,
    cancel: CancellationToken,
    disposer: Option<Disposer>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn new(
        name: &'static str,
        cancel: CancellationToken,
        disposer: Disposer,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            cancel,
            disposer: Some(disposer),
            task: Some(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True once the drain task has exited, e.g. after a subscription error.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    pub fn stop(mut self) {
        self.shutdown();
        tracing::debug!(stream = self.name, "stream stopped");
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(disposer) = self.disposer.take() {
            disposer.dispose();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_disposes_and_cancels() {
        let disposed = Arc::new(AtomicBool::new(false));
        let flag = disposed.clone();
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move { child.cancelled().await });

        let handle = StreamHandle::new(
            "presence",
            cancel.clone(),
            Disposer::new(move || flag.store(true, Ordering::SeqCst)),
            task,
        );
        assert_eq!(handle.name(), "presence");
        assert!(!handle.is_finished());

        handle.stop();
        assert!(disposed.load(Ordering::SeqCst));
        assert!(cancel.is_cancelled());
    }
}
