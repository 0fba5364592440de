//! Delay-scheduled task execution with cancellation by token.
//!
//! One worker task owns a deadline-ordered queue. Callers hand it boxed
//! closures tagged with a [`TaskId`]; `unschedule` removes at most one
//! pending task with a matching id. The worker never exits: task panics are
//! caught and reported.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};

/// Stable identity for a logical scheduled action.
///
/// Allocate one id per action and reuse it across schedulings; cancellation
/// matches on the id, not the deadline or the closure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocates a fresh, process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type TaskFn = Box<dyn FnOnce() + Send>;

enum Cmd {
    Schedule {
        deadline: Instant,
        id: TaskId,
        run: TaskFn,
    },
    Cancel {
        id: TaskId,
    },
}

/// Handle to a timer worker. Cheap to clone; all clones feed one queue.
#[derive(Clone)]
pub struct TimerHandle {
    tx: mpsc::UnboundedSender<Cmd>,
}

impl TimerHandle {
    /// Spawns a dedicated worker and returns its handle. Must be called
    /// within a tokio runtime. Most callers want [`global`] instead.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(rx));
        TimerHandle { tx }
    }

    /// Enqueues `run` to execute at or after `deadline`. Scheduling the same
    /// id again adds another task; it does not replace the first.
    pub fn schedule(&self, deadline: Instant, id: TaskId, run: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Cmd::Schedule {
            deadline,
            id,
            run: Box::new(run),
        });
    }

    /// Removes at most one pending task with this id; no-op when absent.
    pub fn unschedule(&self, id: TaskId) {
        let _ = self.tx.send(Cmd::Cancel { id });
    }
}

/// The process-wide timer, started on first use and never stopped.
pub fn global() -> TimerHandle {
    static GLOBAL: OnceLock<TimerHandle> = OnceLock::new();
    GLOBAL.get_or_init(TimerHandle::spawn).clone()
}

struct Queue {
    // Keyed by (deadline, insertion seq) so iteration order is deadline
    // order; the seq keeps equal deadlines distinct.
    tasks: BTreeMap<(Instant, u64), (TaskId, TaskFn)>,
    seq: u64,
}

impl Queue {
    fn apply(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Schedule { deadline, id, run } => {
                self.tasks.insert((deadline, self.seq), (id, run));
                self.seq += 1;
            }
            Cmd::Cancel { id } => {
                let found = self
                    .tasks
                    .iter()
                    .find(|(_, (task, _))| *task == id)
                    .map(|(key, _)| *key);
                if let Some(key) = found {
                    self.tasks.remove(&key);
                }
            }
        }
    }

    /// Runs every due task. Tasks may schedule or cancel from inside their
    /// closure; those commands are applied before the next pop so a task can
    /// cancel a sibling due at the same instant.
    fn run_due(&mut self, rx: &mut mpsc::UnboundedReceiver<Cmd>) {
        loop {
            while let Ok(cmd) = rx.try_recv() {
                self.apply(cmd);
            }
            match self.tasks.first_key_value() {
                Some((&(deadline, _), _)) if deadline <= Instant::now() => {
                    if let Some((_, (id, run))) = self.tasks.pop_first()
                        && let Err(panic) = catch_unwind(AssertUnwindSafe(run))
                    {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "non-string panic payload".to_string());
                        tracing::error!(task = id.0, %msg, "scheduled task panicked");
                    }
                }
                _ => return,
            }
        }
    }
}

async fn worker(mut rx: mpsc::UnboundedReceiver<Cmd>) {
    let mut queue = Queue {
        tasks: BTreeMap::new(),
        seq: 0,
    };

    loop {
        let deadline = queue
            .tasks
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            cmd = rx.recv() => match cmd {
                None => return,
                Some(cmd) => queue.apply(cmd),
            },
            _ = sleep_until(deadline) => queue.run_due(&mut rx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tokio::task::yield_now;

    /// Lets the worker drain its command queue and run due tasks.
    async fn settle() {
        for _ in 0..20 {
            yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_task_at_deadline() {
        let timer = TimerHandle::spawn();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = hits.clone();
        timer.schedule(
            Instant::now() + Duration::from_millis(50),
            TaskId::next(),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        );

        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unschedule_removes_at_most_one() {
        let timer = TimerHandle::spawn();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = TaskId::next();

        for _ in 0..2 {
            let counted = hits.clone();
            timer.schedule(Instant::now() + Duration::from_millis(10), id, move || {
                counted.fetch_add(1, Ordering::SeqCst);
            });
        }
        timer.unschedule(id);

        tokio::time::sleep(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_absent_id_does_not_eat_future_schedules() {
        let timer = TimerHandle::spawn();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = TaskId::next();

        timer.unschedule(id);
        settle().await;

        let counted = hits.clone();
        timer.schedule(Instant::now() + Duration::from_millis(10), id, move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_does_not_kill_the_worker() {
        let timer = TimerHandle::spawn();
        let hits = Arc::new(AtomicUsize::new(0));

        timer.schedule(
            Instant::now() + Duration::from_millis(10),
            TaskId::next(),
            || panic!("boom"),
        );
        let counted = hits.clone();
        timer.schedule(
            Instant::now() + Duration::from_millis(20),
            TaskId::next(),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_run_in_deadline_order() {
        let timer = TimerHandle::spawn();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for (label, delay) in [("late", 30_u64), ("early", 10), ("mid", 20)] {
            let order = order.clone();
            timer.schedule(
                Instant::now() + Duration::from_millis(delay),
                TaskId::next(),
                move || order.lock().unwrap().push(label),
            );
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        settle().await;
        assert_eq!(*order.lock().unwrap(), vec!["early", "mid", "late"]);
    }
}
