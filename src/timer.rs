//! Shared maintenance timer
//!
//! One background thread services the periodic maintenance of every pool in
//! the process. The thread starts when the first task is scheduled and stops
//! when the last [`TimerHandle`] is dropped, so an application that closes
//! its pools leaves no thread behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// A scheduled callback. Returning `false` cancels the task.
type Task = Box<dyn FnMut() -> bool + Send>;

enum Command {
    Schedule {
        id: u64,
        delay: Duration,
        period: Duration,
        task: Task,
    },
    Cancel {
        id: u64,
    },
    Shutdown,
}

struct TimerShared {
    tx: Sender<Command>,
    next_id: AtomicU64,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Drop for TimerShared {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Keeps one scheduled task alive; dropping the handle cancels the task and,
/// when it was the last one, shuts the timer thread down.
pub(crate) struct TimerHandle {
    shared: Arc<TimerShared>,
    task_id: u64,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        let _ = self.shared.tx.send(Command::Cancel { id: self.task_id });
    }
}

fn registry() -> &'static Mutex<Weak<TimerShared>> {
    static REGISTRY: OnceLock<Mutex<Weak<TimerShared>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Weak::new()))
}

/// Schedules `task` to run every `period` after an initial `delay`, sharing
/// the process-wide timer thread.
pub(crate) fn schedule(delay: Duration, period: Duration, task: Task) -> TimerHandle {
    let mut reg = registry().lock();
    let shared = match reg.upgrade() {
        Some(shared) => shared,
        None => {
            let shared = start_thread();
            *reg = Arc::downgrade(&shared);
            shared
        }
    };
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let _ = shared.tx.send(Command::Schedule {
        id,
        delay,
        period,
        task,
    });
    TimerHandle {
        shared,
        task_id: id,
    }
}

fn start_thread() -> Arc<TimerShared> {
    let (tx, rx) = channel::unbounded();
    let join = thread::Builder::new()
        .name("lendpool-maintenance".into())
        .spawn(move || run(rx))
        .expect("failed to spawn maintenance timer thread");
    Arc::new(TimerShared {
        tx,
        next_id: AtomicU64::new(0),
        join: Mutex::new(Some(join)),
    })
}

struct Entry {
    id: u64,
    next_run: Instant,
    period: Duration,
    task: Task,
}

fn run(rx: Receiver<Command>) {
    let mut tasks: Vec<Entry> = Vec::new();
    loop {
        let now = Instant::now();
        let mut i = 0;
        while i < tasks.len() {
            if tasks[i].next_run <= now {
                if (tasks[i].task)() {
                    let period = tasks[i].period;
                    tasks[i].next_run = Instant::now() + period;
                    i += 1;
                } else {
                    tasks.swap_remove(i);
                }
            } else {
                i += 1;
            }
        }

        let cmd = match tasks.iter().map(|t| t.next_run).min() {
            Some(at) => {
                let now = Instant::now();
                if at <= now {
                    match rx.try_recv() {
                        Ok(cmd) => Some(cmd),
                        Err(_) => continue,
                    }
                } else {
                    match rx.recv_timeout(at - now) {
                        Ok(cmd) => Some(cmd),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            }
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => return,
            },
        };

        match cmd {
            Some(Command::Schedule {
                id,
                delay,
                period,
                task,
            }) => tasks.push(Entry {
                id,
                next_run: Instant::now() + delay,
                period,
                task,
            }),
            Some(Command::Cancel { id }) => tasks.retain(|t| t.id != id),
            Some(Command::Shutdown) => return,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn periodic_task_fires_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = schedule(
            Duration::from_millis(5),
            Duration::from_millis(10),
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
                true
            }),
        );
        thread::sleep(Duration::from_millis(120));
        let fired = count.load(Ordering::Relaxed);
        assert!(fired >= 3, "expected several ticks, got {fired}");

        drop(handle);
        thread::sleep(Duration::from_millis(40));
        let after = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(count.load(Ordering::Relaxed), after);
    }

    #[test]
    fn task_self_cancels_by_returning_false() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _handle = schedule(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
                false
            }),
        );
        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn timer_thread_is_shared() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (ca, cb) = (Arc::clone(&a), Arc::clone(&b));
        let ha = schedule(
            Duration::from_millis(5),
            Duration::from_millis(10),
            Box::new(move || {
                ca.fetch_add(1, Ordering::Relaxed);
                true
            }),
        );
        let hb = schedule(
            Duration::from_millis(5),
            Duration::from_millis(10),
            Box::new(move || {
                cb.fetch_add(1, Ordering::Relaxed);
                true
            }),
        );
        assert!(Arc::ptr_eq(&ha.shared, &hb.shared));
        thread::sleep(Duration::from_millis(60));
        assert!(a.load(Ordering::Relaxed) >= 1);
        assert!(b.load(Ordering::Relaxed) >= 1);
        drop(ha);
        drop(hb);
    }
}
