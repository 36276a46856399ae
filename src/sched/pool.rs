//! Worker-task pools.
//!
//! A pool is a fixed set of tasks consuming queued work from an internal
//! dock. Submissions are FIFO; workers sleep on their task notes when the
//! dock is empty and are notified round-robin. `join` closes the dock,
//! drains the remaining work, and terminates the workers.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
};

use crate::error::Result;

use super::{spawn, Task};

type Work = Pin<Box<dyn Future<Output = ()>>>;

struct Dock {
    queue: RefCell<VecDeque<Work>>,
    closed: Cell<bool>,
}

pub struct Pool {
    dock: Rc<Dock>,
    workers: Vec<Task>,
    next: Cell<usize>,
}

impl Pool {
    pub fn new(name: &str, size: usize) -> Self {
        let dock = Rc::new(Dock {
            queue: RefCell::new(VecDeque::new()),
            closed: Cell::new(false),
        });

        let workers = (0..size.max(1))
            .map(|i| {
                let dock = dock.clone();
                spawn(format!("{name}.{i}"), worker_loop(dock))
            })
            .collect();

        Self {
            dock,
            workers,
            next: Cell::new(0),
        }
    }

    /// Queue a unit of work. FIFO with respect to other submissions.
    pub fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + 'static,
    {
        if self.dock.closed.get() {
            return;
        }
        self.dock.queue.borrow_mut().push_back(Box::pin(work));

        // round-robin notify; a busy worker re-checks the dock before it
        // next sleeps, so a misdirected note cannot strand the job
        if !self.workers.is_empty() {
            let i = self.next.get() % self.workers.len();
            self.next.set(i + 1);
            self.workers[i].notify();
        }
    }

    pub fn queued(&self) -> usize {
        self.dock.queue.borrow().len()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Close the dock, let workers drain it, then collect them.
    pub async fn join(mut self) -> Result<()> {
        self.dock.closed.set(true);
        for worker in &self.workers {
            worker.notify();
        }
        for worker in self.workers.drain(..) {
            worker.join().await?;
        }
        Ok(())
    }
}

async fn worker_loop(dock: Rc<Dock>) {
    loop {
        let work = dock.queue.borrow_mut().pop_front();
        match work {
            Some(work) => work.await,
            None if dock.closed.get() => break,
            None => {
                if super::wait().await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Scheduler, SliceCfg};

    #[test]
    fn pool_runs_submissions_in_order() {
        let sched = Scheduler::new(SliceCfg::default()).unwrap();
        sched.block_on(async {
            let results = Rc::new(RefCell::new(Vec::new()));
            let pool = Pool::new("test", 1);

            for i in 0..5 {
                let results = results.clone();
                pool.submit(async move {
                    results.borrow_mut().push(i);
                });
            }

            pool.join().await.unwrap();
            assert_eq!(*results.borrow(), [0, 1, 2, 3, 4]);
        });
    }

    #[test]
    fn workers_share_the_dock() {
        let sched = Scheduler::new(SliceCfg::default()).unwrap();
        sched.block_on(async {
            let count = Rc::new(Cell::new(0usize));
            let pool = Pool::new("test", 4);

            for _ in 0..32 {
                let count = count.clone();
                pool.submit(async move {
                    count.set(count.get() + 1);
                });
            }

            pool.join().await.unwrap();
            assert_eq!(count.get(), 32);
        });
    }

    #[test]
    fn join_drains_before_terminating() {
        let sched = Scheduler::new(SliceCfg::default()).unwrap();
        sched.block_on(async {
            let done = Rc::new(Cell::new(false));
            let pool = Pool::new("test", 2);
            let flag = done.clone();
            pool.submit(async move {
                super::super::yield_now().await;
                flag.set(true);
            });

            pool.join().await.unwrap();
            assert!(done.get());
        });
    }
}
