//! Periodic background tasks

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::NetworkError;

/// Runs a closure on a named thread at a fixed interval until stopped or
/// until the closure returns `false`.
pub(crate) struct PeriodicTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut task: F) -> Result<Self, NetworkError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !task() {
                            break;
                        }
                    }
                    // stop requested or owner dropped
                    _ => break,
                }
            })
            .map_err(|e| NetworkError::BindFailed(format!("failed to spawn {}: {}", name, e)))?;

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        // Dropping the sender wakes the thread
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("Periodic task '{}' panicked", self.name);
            }
        }
        tracing::trace!("Periodic task '{}' stopped", self.name);
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut task = PeriodicTask::spawn("test-task", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        thread::sleep(Duration::from_millis(80));
        task.stop();
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 2);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_stop_does_not_wait_for_interval() {
        let mut task = PeriodicTask::spawn("slow-task", Duration::from_secs(60), || true).unwrap();
        let start = Instant::now();
        task.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_survives_panicked_task() {
        let mut task = PeriodicTask::spawn("panicking", Duration::from_millis(5), || {
            panic!("report failed")
        })
        .unwrap();
        thread::sleep(Duration::from_millis(40));
        task.stop();
        assert!(task.handle.is_none());
    }

    #[test]
    fn test_task_can_end_itself() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let _task = PeriodicTask::spawn("once", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        })
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
