//! Single-threaded task queue that serializes all segment I/O.
//!
//! Every segment of one [`crate::CacheManager`] submits its file operations
//! here. Tasks run one at a time, in submission order, on a dedicated
//! runtime thread, so no two operations ever touch a segment file
//! concurrently.

use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, oneshot};

/// A unit of work executed on the I/O thread.
pub(crate) type IoTask = Box<dyn FnOnce() + Send + 'static>;

/// Owner of the I/O thread and its task queue.
pub(crate) struct IoWorker {
    name: String,
    handle: Handle,
    task_tx: Mutex<Option<mpsc::UnboundedSender<IoTask>>>,
    runtime: Mutex<Option<Runtime>>,
}

impl IoWorker {
    /// Start the worker thread.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(name)
            .enable_time()
            .build()?;

        let (task_tx, task_rx) = mpsc::unbounded_channel::<IoTask>();
        let task_name = name.to_string();
        runtime.spawn(async move {
            run_tasks(task_rx).await;
            debug!("[IoWorker] {} task queue drained", task_name);
        });

        Ok(Self {
            name: name.to_string(),
            handle: runtime.handle().clone(),
            task_tx: Mutex::new(Some(task_tx)),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Queue `task`. Returns false once the worker has shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.task_tx.lock().as_ref() {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Run `f` on the I/O thread and block until it returns.
    ///
    /// After `soft_timeout` a warning is logged and the caller keeps
    /// waiting; the wait itself is never abandoned. Returns `None` if the
    /// worker shut down before running the task.
    pub fn call<T, F>(&self, soft_timeout: Duration, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, mut result_rx) = oneshot::channel();
        let submitted = self.submit(move || {
            let _ = result_tx.send(f());
        });
        if !submitted {
            return None;
        }

        let first_wait = self
            .handle
            .block_on(async { tokio::time::timeout(soft_timeout, &mut result_rx).await });
        match first_wait {
            Ok(result) => result.ok(),
            Err(_) => {
                warn!(
                    "[IoWorker] {}: task still running after {:?}, waiting",
                    self.name, soft_timeout
                );
                self.handle.block_on(result_rx).ok()
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_tx.lock().is_some()
    }

    /// Stop accepting tasks and tear down the thread.
    ///
    /// Tasks still queued are dropped without running.
    pub fn shutdown(&self) {
        *self.task_tx.lock() = None;
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
            debug!("[IoWorker] {} stopped", self.name);
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_tasks(mut task_rx: mpsc::UnboundedReceiver<IoTask>) {
    while let Some(task) = task_rx.recv().await {
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tasks_run_in_order() {
        let worker = IoWorker::new("io-test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = Arc::clone(&log);
            assert!(worker.submit(move || log.lock().push(i)));
        }
        let snapshot = {
            let log = Arc::clone(&log);
            worker
                .call(Duration::from_secs(5), move || log.lock().clone())
                .unwrap()
        };
        assert_eq!(snapshot, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_call_survives_soft_timeout() {
        let worker = IoWorker::new("io-slow").unwrap();
        let value = worker.call(Duration::from_millis(10), || {
            std::thread::sleep(Duration::from_millis(100));
            7
        });
        assert_eq!(value, Some(7));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let worker = IoWorker::new("io-closed").unwrap();
        worker.shutdown();
        assert!(!worker.is_running());
        assert!(!worker.submit(|| {}));
        assert_eq!(worker.call(Duration::from_millis(10), || 1), None);
    }
}
