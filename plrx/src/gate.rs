//! Handing work from other threads to the native-capable thread.
//!
//! Only one thread may ever call into the engine. Code running elsewhere
//! submits a closure through the [`Gate`] and blocks until the native thread
//! has run it, which happens whenever the engine enters the bridge (see
//! [`crate::hooks::invocation_entered`]) or the host calls [`Gate::service`].
//! There is no timeout and no cancellation: a submitter waits for as long as
//! the native thread takes to get to it.
use crate::error::{BridgeError, Result, UsageError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

type Job = Box<dyn FnOnce() + Send>;

pub struct Gate {
    native: ThreadId,
    queue: Mutex<VecDeque<Job>>,
}

struct Reply<R> {
    value: Mutex<Option<thread::Result<R>>>,
    ready: Condvar,
}

impl Gate {
    pub(crate) fn new(native: ThreadId) -> Self {
        Self { native, queue: Mutex::new(VecDeque::new()) }
    }

    pub fn is_native_thread(&self) -> bool {
        thread::current().id() == self.native
    }

    /// Runs `f` on the native-capable thread and returns its result.
    ///
    /// On the native thread itself `f` simply runs. Anywhere else this blocks
    /// until the native thread services the queue.
    pub fn run<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_native_thread() {
            return Ok(f());
        }

        let reply = Arc::new(Reply { value: Mutex::new(None), ready: Condvar::new() });
        let sender = Arc::clone(&reply);
        self.queue.lock().push_back(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            *sender.value.lock() = Some(outcome);
            sender.ready.notify_one();
        }));

        let mut value = reply.value.lock();
        while value.is_none() {
            reply.ready.wait(&mut value);
        }
        match value.take() {
            Some(Ok(result)) => Ok(result),
            _ => Err(BridgeError::HandOffPanicked),
        }
    }

    /// Runs every queued job, returning how many ran. Native thread only.
    pub fn service(&self) -> Result<usize> {
        if !self.is_native_thread() {
            return Err(UsageError::NotNativeThread.into());
        }
        let mut ran = 0;
        loop {
            // the lock is not held while the job runs
            let Some(job) = self.queue.lock().pop_front() else { break };
            job();
            ran += 1;
        }
        Ok(ran)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn runs_inline_on_native_thread() {
        let gate = Gate::new(thread::current().id());
        assert_eq!(gate.run(|| 2 + 2).unwrap(), 4);
        assert_eq!(gate.queued(), 0);
    }

    #[test]
    fn worker_blocks_until_serviced() {
        let gate = Arc::new(Gate::new(thread::current().id()));
        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.run(|| thread::current().id()))
        };
        while gate.queued() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(gate.service().unwrap(), 1);
        let ran_on = worker.join().unwrap().unwrap();
        assert_eq!(ran_on, thread::current().id());
    }

    #[test]
    fn panicking_job_is_reported_to_submitter() {
        let gate = Arc::new(Gate::new(thread::current().id()));
        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.run(|| -> u32 { panic!("job failed") }))
        };
        while gate.queued() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        gate.service().unwrap();
        assert!(matches!(worker.join().unwrap(), Err(BridgeError::HandOffPanicked)));
    }

    #[test]
    fn service_refused_off_thread() {
        let gate = Arc::new(Gate::new(thread::current().id()));
        let other = Arc::clone(&gate);
        let result = thread::spawn(move || other.service()).join().unwrap();
        assert!(matches!(result, Err(BridgeError::Usage(UsageError::NotNativeThread))));
    }
}
