//! Worker daemon: one named thread draining a bounded task queue.
//!
//! The loop is `Waiting -> Busy -> Waiting -> ... -> Stopped`. Each task
//! yields an [`Outcome`]. A fatal outcome is recorded and ends the loop;
//! nothing is ever thrown back to the submitter, so callers poll
//! [`Daemon::is_busy`] and [`Daemon::last_fatal_error`].
//!
//! Stopping is cooperative: [`Daemon::stop`] only takes effect at the next
//! loop turn. [`Daemon::interrupt`] wakes a blocked wait; a wake without a
//! stop request is fatal.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Result, SyncError};

/// Result of executing one task.
#[derive(Debug)]
pub enum Outcome {
    /// Task done, keep going.
    Ok,
    /// Interrupted because a stop was requested.
    BenignShutdown,
    /// Unexpected failure; recorded and the loop exits.
    Fatal(anyhow::Error),
}

impl From<anyhow::Result<()>> for Outcome {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Outcome::Ok,
            Err(e) => Outcome::Fatal(e),
        }
    }
}

/// Observable daemon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Blocked waiting for a task.
    Waiting,
    /// Executing a task.
    Busy,
    /// Stop requested, loop still running.
    Stopping,
    /// Loop exited.
    Stopped,
}

const WAITING: u8 = 0;
const BUSY: u8 = 1;
const STOPPED: u8 = 2;

struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    /// Submitted and not yet finished.
    in_flight: AtomicUsize,
    fatal: Mutex<Option<Arc<anyhow::Error>>>,
}

/// Handed to the task handler so blocking work can be woken.
pub struct Interrupt {
    wake: Receiver<()>,
    shared: Arc<Shared>,
}

impl Interrupt {
    /// Channel that becomes ready when the daemon is interrupted; use it
    /// in a `select!` next to any blocking operation.
    pub fn channel(&self) -> &Receiver<()> {
        &self.wake
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Outcome for a wake observed now.
    pub fn outcome(&self) -> Outcome {
        if self.is_stop_requested() {
            Outcome::BenignShutdown
        } else {
            Outcome::Fatal(anyhow!("unexpected interrupt"))
        }
    }
}

/// Cloneable handle that queues tasks on a [`Daemon`].
pub struct Submitter<W> {
    name: Arc<str>,
    tasks: Sender<W>,
    shared: Arc<Shared>,
}

impl<W> Clone for Submitter<W> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tasks: self.tasks.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W> Submitter<W> {
    /// Queue a task, blocking while the queue is full.
    pub fn submit(&self, work: W) -> Result<()> {
        if self.shared.state.load(Ordering::SeqCst) == STOPPED {
            return Err(SyncError::WorkerStopped(self.name.to_string()));
        }
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tasks.send(work).is_err() {
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(SyncError::WorkerStopped(self.name.to_string()));
        }
        Ok(())
    }
}

/// A named worker thread with a bounded task queue.
pub struct Daemon<W> {
    submitter: Submitter<W>,
    wake: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<W: Send + 'static> Daemon<W> {
    /// Start the worker thread.
    ///
    /// `handler` runs once per task on the worker thread. A panic inside
    /// it is caught and recorded as fatal.
    pub fn spawn<F>(name: impl Into<String>, capacity: usize, handler: F) -> Result<Self>
    where
        F: FnMut(W, &Interrupt) -> Outcome + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let (task_tx, task_rx) = channel::bounded(capacity);
        let (wake_tx, wake_rx) = channel::bounded(1);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(WAITING),
            stop: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        });

        let interrupt = Interrupt {
            wake: wake_rx,
            shared: Arc::clone(&shared),
        };
        let loop_name = Arc::clone(&name);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&loop_name, &task_rx, &interrupt, handler))?;

        Ok(Self {
            submitter: Submitter {
                name,
                tasks: task_tx,
                shared,
            },
            wake: wake_tx,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl<W> Daemon<W> {
    pub fn name(&self) -> &str {
        &self.submitter.name
    }

    /// Queue a task, blocking while the queue is full.
    ///
    /// Fails with [`SyncError::WorkerStopped`] once the loop has exited.
    pub fn submit(&self, work: W) -> Result<()> {
        self.submitter.submit(work)
    }

    /// A handle for queueing tasks from other threads.
    pub fn submitter(&self) -> Submitter<W> {
        self.submitter.clone()
    }

    /// Request a cooperative stop.
    pub fn stop(&self) {
        debug!(daemon = %self.name(), "stop requested");
        self.submitter.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Wake the worker out of a blocked wait. Does not imply a stop.
    pub fn interrupt(&self) {
        let _ = self.wake.try_send(());
    }

    /// [`Daemon::stop`] followed by [`Daemon::interrupt`].
    pub fn force_stop(&self) {
        self.stop();
        self.interrupt();
    }

    /// Wait until the worker thread has exited.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(daemon = %self.name(), "worker thread panicked");
            }
        }
    }

    /// A task is executing or queued.
    pub fn is_busy(&self) -> bool {
        let shared = &self.submitter.shared;
        shared.state.load(Ordering::SeqCst) != STOPPED
            && shared.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn state(&self) -> DaemonState {
        let shared = &self.submitter.shared;
        match shared.state.load(Ordering::SeqCst) {
            STOPPED => DaemonState::Stopped,
            _ if shared.stop.load(Ordering::SeqCst) => DaemonState::Stopping,
            BUSY => DaemonState::Busy,
            _ => DaemonState::Waiting,
        }
    }

    /// The failure that ended the loop, if any.
    pub fn last_fatal_error(&self) -> Option<Arc<anyhow::Error>> {
        self.submitter.shared.fatal.lock().clone()
    }
}

impl<W> Drop for Daemon<W> {
    fn drop(&mut self) {
        self.force_stop();
    }
}

impl<W> fmt::Debug for Daemon<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn run<W, F>(name: &str, tasks: &Receiver<W>, interrupt: &Interrupt, mut handler: F)
where
    F: FnMut(W, &Interrupt) -> Outcome,
{
    let shared = &interrupt.shared;
    debug!(daemon = name, "worker started");

    let outcome = loop {
        if shared.stop.load(Ordering::SeqCst) {
            break Outcome::BenignShutdown;
        }
        shared.state.store(WAITING, Ordering::SeqCst);

        // A wake that arrived while busy is seen before the next task.
        let work = match interrupt.wake.try_recv() {
            Ok(()) => Err(interrupt.outcome()),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                crossbeam::select! {
                    recv(tasks) -> work => work.map_err(|_| Outcome::BenignShutdown),
                    recv(interrupt.wake) -> _ => Err(interrupt.outcome()),
                }
            }
        };
        let work = match work {
            Ok(work) => work,
            Err(outcome) => break outcome,
        };

        shared.state.store(BUSY, Ordering::SeqCst);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(work, interrupt)))
            .unwrap_or_else(|payload| {
                Outcome::Fatal(anyhow!("unexpected panic: {}", panic_message(&*payload)))
            });
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Outcome::Ok => {}
            other => break other,
        }
    };

    match outcome {
        Outcome::Fatal(e) => {
            error!(daemon = name, error = %e, "worker failed");
            *shared.fatal.lock() = Some(Arc::new(e));
        }
        _ => debug!(daemon = name, "worker stopped"),
    }
    shared.state.store(STOPPED, Ordering::SeqCst);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_tasks_run_in_order() {
        let (seen_tx, seen_rx) = channel::unbounded();
        let daemon = Daemon::spawn("order", 4, move |n: u32, _: &Interrupt| {
            seen_tx.send(n).ok();
            Outcome::Ok
        })
        .unwrap();

        for n in 0..50 {
            daemon.submit(n).unwrap();
        }
        let seen: Vec<u32> = (0..50).map(|_| seen_rx.recv().unwrap()).collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());

        daemon.force_stop();
        daemon.join();
        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert!(daemon.last_fatal_error().is_none());
    }

    #[test]
    fn test_is_busy_while_executing() {
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let daemon = Daemon::spawn("busy", 4, move |_: (), _: &Interrupt| {
            release_rx.recv().ok();
            Outcome::Ok
        })
        .unwrap();
        assert!(!daemon.is_busy());

        daemon.submit(()).unwrap();
        wait_until(|| daemon.state() == DaemonState::Busy);
        assert!(daemon.is_busy());

        release_tx.send(()).unwrap();
        wait_until(|| !daemon.is_busy());
        assert_eq!(daemon.state(), DaemonState::Waiting);
    }

    #[test]
    fn test_cooperative_stop_needs_wake() {
        let daemon = Daemon::spawn("coop", 1, |_: (), _: &Interrupt| Outcome::Ok).unwrap();
        daemon.stop();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(daemon.state(), DaemonState::Stopping);

        daemon.interrupt();
        daemon.join();
        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert!(daemon.last_fatal_error().is_none());
    }

    #[test]
    fn test_stop_after_current_task() {
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let (done_tx, done_rx) = channel::unbounded();
        let daemon = Daemon::spawn("drain", 4, move |n: u32, _: &Interrupt| {
            release_rx.recv().ok();
            done_tx.send(n).ok();
            Outcome::Ok
        })
        .unwrap();

        daemon.submit(1).unwrap();
        wait_until(|| daemon.state() == DaemonState::Busy);
        daemon.submit(2).unwrap();
        daemon.stop();
        release_tx.send(()).unwrap();
        daemon.join();

        assert_eq!(done_rx.try_iter().collect::<Vec<_>>(), vec![1]);
        assert!(daemon.last_fatal_error().is_none());
        assert!(!daemon.is_busy());
        assert!(matches!(daemon.submit(3), Err(SyncError::WorkerStopped(_))));
    }

    #[test]
    fn test_interrupt_without_stop_is_fatal() {
        let daemon = Daemon::spawn("wake", 1, |_: (), _: &Interrupt| Outcome::Ok).unwrap();
        daemon.interrupt();
        daemon.join();

        let err = daemon.last_fatal_error().unwrap();
        assert_eq!(err.to_string(), "unexpected interrupt");
        assert_eq!(daemon.state(), DaemonState::Stopped);
    }

    #[test]
    fn test_fatal_outcome_recorded() {
        let daemon = Daemon::spawn("fatal", 1, |n: u32, _: &Interrupt| {
            if n == 2 {
                Outcome::Fatal(anyhow!("bad task {n}"))
            } else {
                Outcome::Ok
            }
        })
        .unwrap();

        daemon.submit(1).unwrap();
        daemon.submit(2).unwrap();
        daemon.join();
        assert_eq!(daemon.last_fatal_error().unwrap().to_string(), "bad task 2");
    }

    #[test]
    fn test_panic_recorded() {
        let daemon = Daemon::spawn("panic", 1, |_: (), _: &Interrupt| -> Outcome {
            panic!("handler exploded")
        })
        .unwrap();

        daemon.submit(()).unwrap();
        daemon.join();
        let err = daemon.last_fatal_error().unwrap();
        assert!(err.to_string().contains("handler exploded"));
    }

    #[test]
    fn test_interrupt_wakes_blocked_task() {
        let (_never_tx, never_rx) = channel::bounded::<()>(0);
        let daemon = Daemon::spawn("blocked", 1, move |_: (), interrupt: &Interrupt| {
            crossbeam::select! {
                recv(never_rx) -> _ => Outcome::Ok,
                recv(interrupt.channel()) -> _ => interrupt.outcome(),
            }
        })
        .unwrap();

        daemon.submit(()).unwrap();
        wait_until(|| daemon.state() == DaemonState::Busy);
        daemon.force_stop();
        daemon.join();
        assert!(daemon.last_fatal_error().is_none());
    }

    #[test]
    fn test_backpressure_blocks_submit() {
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let daemon = Arc::new(
            Daemon::spawn("bp", 1, move |_: u32, _: &Interrupt| {
                release_rx.recv().ok();
                Outcome::Ok
            })
            .unwrap(),
        );

        daemon.submit(1).unwrap();
        wait_until(|| daemon.state() == DaemonState::Busy);
        daemon.submit(2).unwrap();

        let submitted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&submitted);
        let producer = Arc::clone(&daemon);
        let handle = thread::spawn(move || {
            producer.submit(3).unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!submitted.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        wait_until(|| submitted.load(Ordering::SeqCst));
        handle.join().unwrap();

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        wait_until(|| !daemon.is_busy());
    }
}
