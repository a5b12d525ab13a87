//! Dedicated runtime for response parsers that must not run on the I/O thread.

use std::io;

use tokio::runtime::{Builder, Runtime};

/// Blocking-task pool backed by its own multi-threaded tokio runtime.
pub struct ParseWorkers {
    runtime: Option<Runtime>,
    threads: usize,
}

impl ParseWorkers {
    /// Starts a runtime with `threads` blocking workers.
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("respio-parse")
            .build()?;
        Ok(ParseWorkers {
            runtime: Some(runtime),
            threads,
        })
    }

    /// Configured number of parse threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `job` on a parse thread.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(runtime) = self.runtime.as_ref() {
            drop(runtime.spawn_blocking(job));
        }
    }
}

impl Drop for ParseWorkers {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics; shut it down detached.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_jobs_off_thread() {
        let workers = ParseWorkers::new(2).expect("workers");
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        workers.spawn(move || {
            tx.send(std::thread::current().id()).expect("send");
        });
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).expect("job ran");
        assert_ne!(ran_on, caller);
    }
}
