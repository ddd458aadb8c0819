//! Single-threaded cooperative scheduler.
//!
//! ```text
//!  any thread                         loop thread
//!  ──────────                         ───────────
//!  LoopHandle::call_soon ──┐
//!  LoopHandle::call_get  ──┼─ mpsc ─▶ run() ──▶ job(&mut S)
//!  LoopHandle::call_later ─┘            │
//!                                       ├── timers (BTreeMap by deadline)
//!                                       └── spawn_local'd socket tasks
//! ```
//!
//! The loop owns a state value `S` built on the loop thread itself, so `S`
//! may hold non-`Send` data. Every job receives `&mut S` and runs to
//! completion; nothing else touches `S` while it runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};

/// One-shot unit of work run against the loop state.
pub type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Repeating body; returns `false` to unschedule itself.
type Repeat<S> = Box<dyn FnMut(&mut S) -> bool + Send + 'static>;

/// Queued jobs processed per wakeup before timers get another look
const RUN_BUDGET: usize = 256;

/// Cancelled timers are purged once the table grows past this
const PURGE_THRESHOLD: usize = 1024;

enum Command<S> {
    Run(Job<S>),
    Timer(TimerEntry<S>),
}

struct TimerEntry<S> {
    deadline: Instant,
    task: TimerTask<S>,
    cancel: CancellationToken,
}

enum TimerTask<S> {
    Once(Job<S>),
    Every {
        interval: Duration,
        running: Arc<AtomicBool>,
        body: Repeat<S>,
    },
}

struct Shared {
    thread: OnceLock<ThreadId>,
    shutdown: CancellationToken,
}

/// Cloneable, `Send` handle for scheduling work on a loop.
pub struct LoopHandle<S> {
    tx: mpsc::UnboundedSender<Command<S>>,
    urgent: mpsc::UnboundedSender<Job<S>>,
    shared: Arc<Shared>,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            urgent: self.urgent.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S: 'static> LoopHandle<S> {
    /// Whether the caller is running on this loop's thread.
    pub fn in_event_loop(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.is_cancelled()
    }

    /// Enqueue `f` for the next loop iteration.
    pub fn call_soon<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Command::Run(Box::new(f)))
            .map_err(|_| Error::LoopStopped)
    }

    /// Run `f` on the loop.
    ///
    /// From the loop thread `f` runs as soon as the current callback returns,
    /// ahead of anything else queued, or on the next loop turn when no
    /// callback is running (e.g. from a socket task). A job that needs the
    /// effect immediately uses [`call_with`](Self::call_with). From other
    /// threads this is `call_soon`.
    pub fn call<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.in_event_loop() {
            self.urgent.send(Box::new(f)).map_err(|_| Error::LoopStopped)
        } else {
            self.call_soon(f)
        }
    }

    /// Run `f` inline against the loop state a job was handed.
    ///
    /// Its effects are visible as soon as this returns.
    ///
    /// # Panics
    ///
    /// Off the loop thread.
    pub fn call_with<R, F>(&self, state: &mut S, f: F) -> R
    where
        F: FnOnce(&mut S) -> R,
    {
        assert!(
            self.in_event_loop(),
            "call_with invoked off its event loop thread"
        );
        f(state)
    }

    /// Run `f` on the loop and block until its result is back.
    ///
    /// `f` runs after every job previously queued from this thread.
    ///
    /// # Panics
    ///
    /// On the loop thread (it would wait on itself forever), and inside an
    /// async context; use [`call_get_async`](Self::call_get_async) there.
    pub fn call_get<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        assert!(
            !self.in_event_loop(),
            "call_get invoked from its own event loop thread"
        );
        let (tx, rx) = oneshot::channel();
        self.call_soon(move |state| {
            let _ = tx.send(f(state));
        })?;
        rx.blocking_recv().map_err(|_| Error::LoopStopped)
    }

    /// Async counterpart of [`call_get`](Self::call_get).
    pub async fn call_get_async<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.call_soon(move |state| {
            let _ = tx.send(f(state));
        })?;
        rx.await.map_err(|_| Error::LoopStopped)
    }

    /// One-shot timer.
    pub fn call_later<F>(&self, delay: Duration, f: F) -> Result<TimerHandle>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.schedule(Instant::now() + delay, TimerTask::Once(Box::new(f)))
            .map(TimerHandle)
    }

    /// One-shot timer at an absolute instant.
    pub fn call_at<F>(&self, deadline: std::time::Instant, f: F) -> Result<TimerHandle>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.schedule(Instant::from_std(deadline), TimerTask::Once(Box::new(f)))
            .map(TimerHandle)
    }

    /// Periodic callback. A ticker created with `start_immediately == false`
    /// does nothing until [`Ticker::start`].
    ///
    /// A zero `interval` is rejected with [`Error::InvalidInterval`].
    pub fn call_every<F>(&self, interval: Duration, mut f: F, start_immediately: bool) -> Result<Ticker>
    where
        F: FnMut(&mut S) + Send + 'static,
    {
        if interval.is_zero() {
            return Err(Error::InvalidInterval);
        }
        let running = Arc::new(AtomicBool::new(start_immediately));
        let cancel = self.schedule(
            Instant::now() + interval,
            TimerTask::Every {
                interval,
                running: running.clone(),
                body: Box::new(move |state| {
                    f(state);
                    true
                }),
            },
        )?;
        Ok(Ticker { running, cancel })
    }

    /// Periodic callback that lives exactly as long as `target` does.
    ///
    /// The loop only holds a `Weak`; once every strong reference is gone the
    /// entry unschedules itself at its next firing.
    pub fn call_every_weak<T, F>(&self, interval: Duration, target: Weak<T>, mut f: F) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: FnMut(&mut S, &T) + Send + 'static,
    {
        if interval.is_zero() {
            return Err(Error::InvalidInterval);
        }
        self.schedule(
            Instant::now() + interval,
            TimerTask::Every {
                interval,
                running: Arc::new(AtomicBool::new(true)),
                body: Box::new(move |state| match target.upgrade() {
                    Some(target) => {
                        f(state, &target);
                        true
                    }
                    None => false,
                }),
            },
        )
        .map(|_| ())
    }

    /// Ask the loop to stop after the current callback.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    fn schedule(&self, deadline: Instant, task: TimerTask<S>) -> Result<CancellationToken> {
        let cancel = CancellationToken::new();
        self.tx
            .send(Command::Timer(TimerEntry {
                deadline,
                task,
                cancel: cancel.clone(),
            }))
            .map_err(|_| Error::LoopStopped)?;
        Ok(cancel)
    }
}

/// Cancels a pending one-shot timer. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct TimerHandle(CancellationToken);

impl TimerHandle {
    /// Handle not attached to any loop, for driving timers by hand.
    pub fn detached() -> Self {
        TimerHandle(CancellationToken::new())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Periodic timer control. Dropping it unschedules the timer.
///
/// Stopping never interrupts a firing already in progress.
#[derive(Debug)]
pub struct Ticker {
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Ticker {
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A loop thread plus its state.
///
/// Dropping the loop stops it and joins the thread; `S` is dropped on the
/// loop thread.
pub struct EventLoop<S: 'static> {
    handle: LoopHandle<S>,
    thread: Option<JoinHandle<()>>,
}

impl<S: 'static> EventLoop<S> {
    /// Spawn the loop thread and build its state there with `init`.
    pub fn spawn<F>(name: &str, init: F) -> Result<Self>
    where
        F: FnOnce(&LoopHandle<S>) -> S + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (urgent_tx, urgent_rx) = mpsc::unbounded_channel();
        let handle = LoopHandle {
            tx,
            urgent: urgent_tx,
            shared: Arc::new(Shared {
                thread: OnceLock::new(),
                shutdown: CancellationToken::new(),
            }),
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let loop_handle = handle.clone();
        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _ = loop_handle.shared.thread.set(thread::current().id());
            debug!("Event loop started");

            let local = LocalSet::new();
            local.block_on(&runtime, async move {
                let state = init(&loop_handle);
                let shutdown = loop_handle.shared.shutdown.clone();
                drop(loop_handle);
                Runner::new(state, rx, urgent_rx).run(shutdown).await;
            });

            debug!("Event loop stopped");
        })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &LoopHandle<S> {
        &self.handle
    }

    /// Wait for the loop to exit on its own, e.g. after
    /// [`LoopHandle::shutdown`] was requested from a job.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Event loop thread panicked");
            }
        }
    }

    /// Stop the loop and wait for its thread to exit.
    pub fn stop(&mut self) {
        self.handle.shutdown();
        self.join();
    }
}

impl<S: 'static> Drop for EventLoop<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Runner<S> {
    state: S,
    rx: mpsc::UnboundedReceiver<Command<S>>,
    urgent: mpsc::UnboundedReceiver<Job<S>>,
    timers: BTreeMap<(Instant, u64), TimerEntry<S>>,
    seq: u64,
}

impl<S> Runner<S> {
    fn new(
        state: S,
        rx: mpsc::UnboundedReceiver<Command<S>>,
        urgent: mpsc::UnboundedReceiver<Job<S>>,
    ) -> Self {
        Self {
            state,
            rx,
            urgent,
            timers: BTreeMap::new(),
            seq: 0,
        }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            self.fire_due_timers();
            if shutdown.is_cancelled() {
                break;
            }

            let next_deadline = self.timers.keys().next().map(|(deadline, _)| *deadline);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(job) = self.urgent.recv() => self.run_job(job),
                command = self.rx.recv() => match command {
                    Some(command) => {
                        self.apply(command);
                        for _ in 1..RUN_BUDGET {
                            match self.rx.try_recv() {
                                Ok(command) => self.apply(command),
                                Err(_) => break,
                            }
                            if shutdown.is_cancelled() {
                                break;
                            }
                        }
                    }
                    None => break,
                },
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {}
            }
        }
        trace!("Event loop runner exiting with {} timers pending", self.timers.len());
    }

    fn apply(&mut self, command: Command<S>) {
        match command {
            Command::Run(job) => self.run_job(job),
            Command::Timer(entry) => self.insert_timer(entry),
        }
    }

    fn run_job(&mut self, job: Job<S>) {
        job(&mut self.state);
        self.drain_urgent();
    }

    fn drain_urgent(&mut self) {
        while let Ok(job) = self.urgent.try_recv() {
            job(&mut self.state);
        }
    }

    fn insert_timer(&mut self, entry: TimerEntry<S>) {
        if entry.cancel.is_cancelled() {
            return;
        }
        if self.timers.len() >= PURGE_THRESHOLD {
            self.timers.retain(|_, entry| !entry.cancel.is_cancelled());
        }
        self.seq += 1;
        self.timers.insert((entry.deadline, self.seq), entry);
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let entry = entry.remove();
            if entry.cancel.is_cancelled() {
                continue;
            }
            match entry.task {
                TimerTask::Once(job) => self.run_job(job),
                TimerTask::Every {
                    interval,
                    running,
                    mut body,
                } => {
                    let keep = if running.load(Ordering::Acquire) {
                        let keep = body(&mut self.state);
                        self.drain_urgent();
                        keep
                    } else {
                        true
                    };
                    if keep && !entry.cancel.is_cancelled() {
                        let next = (entry.deadline + interval).max(now);
                        self.insert_timer(TimerEntry {
                            deadline: next,
                            task: TimerTask::Every {
                                interval,
                                running,
                                body,
                            },
                            cancel: entry.cancel,
                        });
                    }
                }
            }
        }
    }
}
