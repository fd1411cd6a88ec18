use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use log::{debug, error};

use crate::error::{DbError, DbResult};

type Job = Box<dyn FnOnce() -> DbResult<()> + Send + 'static>;

struct SchedulerShared {
    outstanding: Mutex<u64>,
    cvar: Condvar,
    first_error: Mutex<Option<DbError>>,
    error_flag: Arc<AtomicBool>,
}

/// Worker pool driving bulk-copy tasks and parallel operator work.
/// Tasks are closures; the first failure is kept and every
/// later task can poll [`TaskScheduler::has_error`] to stop promptly.
pub struct TaskScheduler {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<SchedulerShared>,
    max_num_threads: usize,
}

impl TaskScheduler {
    pub fn new(max_num_threads: usize) -> Self {
        let max_num_threads = std::cmp::max(1, max_num_threads);
        let (sender, receiver) = unbounded::<Job>();
        let shared = Arc::new(SchedulerShared {
            outstanding: Mutex::new(0),
            cvar: Condvar::new(),
            first_error: Mutex::new(None),
            error_flag: Arc::new(AtomicBool::new(false)),
        });
        let mut workers = Vec::with_capacity(max_num_threads);
        for worker_id in 0..max_num_threads {
            let receiver = receiver.clone();
            let shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("copier-{}", worker_id))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            let result = job();
                            if let Err(e) = result {
                                // keep only the first error; later ones are
                                // usually knock-on effects of the abort flag
                                if !matches!(e, DbError::Interrupt) {
                                    let mut slot = shared.first_error.lock().unwrap();
                                    if slot.is_none() {
                                        error!("task failed: {}", e);
                                        *slot = Some(e);
                                    }
                                }
                                shared.error_flag.store(true, Ordering::SeqCst);
                            }
                            let mut outstanding = shared.outstanding.lock().unwrap();
                            *outstanding -= 1;
                            shared.cvar.notify_all();
                        }
                    })
                    .expect("failed to spawn scheduler worker"),
            );
        }
        Self {
            sender: Some(sender),
            workers,
            shared,
            max_num_threads,
        }
    }

    pub fn max_num_threads(&self) -> usize {
        self.max_num_threads
    }

    pub fn schedule_task(&self, job: impl FnOnce() -> DbResult<()> + Send + 'static) {
        {
            let mut outstanding = self.shared.outstanding.lock().unwrap();
            *outstanding += 1;
        }
        self.sender
            .as_ref()
            .expect("scheduler already shut down")
            .send(Box::new(job))
            .expect("scheduler workers are gone");
    }

    /// Cooperative cancellation: tasks poll this between rows.
    pub fn has_error(&self) -> bool {
        self.shared.error_flag.load(Ordering::SeqCst)
    }

    /// Clonable handle to the abort flag, for task closures that must
    /// not borrow the scheduler.
    pub fn error_watcher(&self) -> Arc<AtomicBool> {
        self.shared.error_flag.clone()
    }

    /// Back-pressure for the producer: block until fewer than
    /// `threshold` tasks are outstanding.
    pub fn wait_until_enough_tasks_finish(&self, threshold: u64) {
        let mut outstanding = self.shared.outstanding.lock().unwrap();
        while *outstanding >= threshold {
            outstanding = self.shared.cvar.wait(outstanding).unwrap();
        }
    }

    /// Drain the queue; rethrow the first task error if any.
    pub fn wait_all_tasks_to_complete_or_error(&self) -> DbResult<()> {
        let mut outstanding = self.shared.outstanding.lock().unwrap();
        while *outstanding > 0 {
            outstanding = self.shared.cvar.wait(outstanding).unwrap();
        }
        drop(outstanding);
        if let Some(e) = self.shared.first_error.lock().unwrap().take() {
            self.shared.error_flag.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.shared.error_flag.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        drop(self.sender.take());
        debug!("joining {} scheduler workers", self.workers.len());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn tasks_run_and_drain() {
        let scheduler = TaskScheduler::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            scheduler.schedule_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        scheduler.wait_all_tasks_to_complete_or_error().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn first_error_is_rethrown() {
        let scheduler = TaskScheduler::new(2);
        scheduler.schedule_task(|| Ok(()));
        scheduler.schedule_task(|| Err(DbError::copy("boom")));
        scheduler.schedule_task(|| Err(DbError::Interrupt));
        let err = scheduler.wait_all_tasks_to_complete_or_error().unwrap_err();
        assert!(matches!(err, DbError::Copy(_)));
        // error state is consumed
        scheduler.schedule_task(|| Ok(()));
        assert!(scheduler.wait_all_tasks_to_complete_or_error().is_ok());
    }

    #[test]
    fn error_flag_is_visible_to_later_tasks() {
        let scheduler = TaskScheduler::new(1);
        scheduler.schedule_task(|| Err(DbError::copy("first")));
        scheduler.wait_until_enough_tasks_finish(1);
        assert!(scheduler.has_error());
        let _ = scheduler.wait_all_tasks_to_complete_or_error();
    }

    #[test]
    fn back_pressure_threshold() {
        let scheduler = TaskScheduler::new(2);
        for _ in 0..8 {
            scheduler.schedule_task(|| {
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(())
            });
        }
        scheduler.wait_until_enough_tasks_finish(4);
        let outstanding = *scheduler.shared.outstanding.lock().unwrap();
        assert!(outstanding < 4);
        scheduler.wait_all_tasks_to_complete_or_error().unwrap();
    }
}
