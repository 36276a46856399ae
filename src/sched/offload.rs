//! Thread offload for operations that cannot be made non-blocking.
//!
//! Background OS threads pull closures from a mutex-protected queue and run
//! them; the originating task suspends and is resumed through a thread-safe
//! completion when its closure finishes. This is the only place core code
//! crosses an OS-thread boundary.

use std::{collections::VecDeque, sync::Arc, thread};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send>;

struct Shared {
    queue: Mutex<OffloadQueue>,
    available: Condvar,
}

struct OffloadQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

pub struct Offload {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Offload {
    pub fn new(name: &str, threads: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(OffloadQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("{name}.{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn offload worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    /// Run a blocking closure on an offload worker; the calling task
    /// suspends until the result comes back.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(Error::Interrupted);
            }
            queue.jobs.push_back(Box::new(move || {
                let _ = tx.send(f());
            }));
        }
        self.shared.available.notify_one();

        rx.await.map_err(|_| Error::Interrupted)
    }

    /// Drain the queue and join the worker threads.
    pub fn join(mut self) {
        self.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
    }
}

impl Drop for Offload {
    fn drop(&mut self) {
        self.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    debug!("offload worker exiting");
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };

        job();
    }
}
