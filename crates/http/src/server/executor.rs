//! The worker pool requests run on.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs request tasks off the network thread. Tasks may block.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// The default executor: a tokio runtime whose blocking pool runs the tasks.
pub struct RuntimeExecutor {
    runtime: Option<Runtime>,
}

impl RuntimeExecutor {
    /// A runtime running at most `threads` tasks at once.
    pub fn new(threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("micro-poll-worker")
            .enable_all()
            .build()?;
        Ok(Self { runtime: Some(runtime) })
    }

    pub fn handle(&self) -> Option<&Handle> {
        self.runtime.as_ref().map(Runtime::handle)
    }
}

impl Executor for RuntimeExecutor {
    fn execute(&self, task: Task) {
        if let Some(runtime) = &self.runtime {
            runtime.spawn_blocking(task);
        }
    }
}

impl Drop for RuntimeExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl fmt::Debug for RuntimeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeExecutor").finish_non_exhaustive()
    }
}

/// Runs tasks on an existing tokio runtime.
impl Executor for Handle {
    fn execute(&self, task: Task) {
        self.spawn_blocking(task);
    }
}

/// Runs every task on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runtime_runs_blocking_tasks() {
        let executor = RuntimeExecutor::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                std::thread::sleep(Duration::from_millis(10));
                tx.send(i).unwrap();
            }));
        }

        let mut got: Vec<i32> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn handle_executes() {
        let executor = RuntimeExecutor::new(1).unwrap();
        let handle = executor.handle().unwrap().clone();
        let (tx, rx) = mpsc::channel();
        handle.execute(Box::new(move || tx.send(42).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }
}
