// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ordered, single-threaded workers.

use std::io;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A worker thread running queued jobs one at a time, in queue order.
///
/// Dropping the worker lets queued jobs drain and then joins the thread.
pub struct Worker {
    name: String,
    tx: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    tid: ThreadId,
}

impl Worker {
    pub fn new(name: &str) -> io::Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let thread = thread::Builder::new().name(name.to_string()).spawn(
            move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            },
        )?;
        let tid = thread.thread().id();
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            thread: Some(thread),
            tid,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job.  Returns `false` if the worker is shutting down.
    pub fn queue(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match self.tx.as_ref() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Wait for every job queued before this call to finish.
    ///
    /// A no-op when called from the worker itself.
    pub fn flush(&self) {
        if thread::current().id() == self.tid {
            return;
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        if self.queue(move || {
            let _ = done_tx.send(());
        }) {
            let _ = done_rx.recv();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the channel ends the thread once the queue is drained
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            // The last reference may be dropped by one of our own jobs
            if thread::current().id() != self.tid {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::{Arc, Mutex};

    #[test]
    fn jobs_run_in_order() {
        let worker = Worker::new("test-worker").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = seen.clone();
            assert!(worker.queue(move || seen.lock().unwrap().push(i)));
        }
        worker.flush();
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn drop_drains_queue() {
        let seen = Arc::new(Mutex::new(0));
        {
            let worker = Worker::new("test-drain").unwrap();
            for _ in 0..4 {
                let seen = seen.clone();
                worker.queue(move || *seen.lock().unwrap() += 1);
            }
        }
        assert_eq!(*seen.lock().unwrap(), 4);
    }
}
