//! Execution context, process threads and deadlock detection.
//!
//! A [`Director`] owns everything a rendezvous execution shares: the single
//! lock that every channel operation synchronizes on, the table of channels
//! and the [`Ledger`] of blocked processes used for deadlock detection. It is
//! an explicit object; several directors may run side by side and a channel
//! only ever talks to the director that created it.
//!
//! Each process spawned on a director runs on its own OS thread and receives a
//! [`Context`] through which it performs rendezvous, guarded choices and
//! delays. Processes are not started until [`Director::run()`] is called,
//! which then blocks until every process has exited and reports how the
//! execution ended.
//!
//! # Termination
//!
//! An execution ends when all processes have returned, or earlier when:
//!
//! * every live process is blocked on a rendezvous (a real deadlock),
//! * the earliest delayed process would wake up past the stop time,
//! * [`Director::request_stop()`] is called,
//! * a process fails with an error other than
//!   [`RendezvousError::Terminated`] or panics.
//!
//! In the last three cases all blocked or delayed processes are woken up and
//! their pending operations return [`RendezvousError::Terminated`], which a
//! process is expected to propagate with `?`.
mod ledger;

use std::any::Any;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use slab::Slab;
use thiserror::Error;
use tracing::{debug, info, info_span};

use crate::branch::{self, Chosen, Guarded};
use crate::channel::{
    self, Batch, BatchState, Channel, ChannelBuilder, ChannelId, ChannelState, Party,
    RendezvousError, TokenGrid,
};
use crate::data::Token;
use crate::time::MonotonicTime;

pub use ledger::Ledger;
use ledger::{Exit, Failure, Outcome};

type ProcessFn = Box<dyn FnOnce(&Context) -> Result<(), RendezvousError> + Send + 'static>;

/// Unique identifier of a process within its director.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub(crate) usize);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State protected by the director lock.
pub(crate) struct Kernel {
    pub(crate) ledger: Ledger,
    pub(crate) channels: Slab<ChannelState>,
    pub(crate) batches: Slab<BatchState>,
}

/// Data shared by all handles of a director.
pub(crate) struct Shared {
    kernel: Mutex<Kernel>,
    signal: Condvar,
    pending: Mutex<Vec<PendingProcess>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stack_size: Option<usize>,
}

impl Shared {
    /// Acquires the director lock.
    pub(crate) fn lock(&self) -> Monitor<'_> {
        Monitor {
            shared: self,
            kernel: self.kernel.lock(),
        }
    }

    /// Returns a builder for a named process or branch thread.
    pub(crate) fn thread_builder(&self, name: String) -> thread::Builder {
        let builder = thread::Builder::new().name(name);
        match self.stack_size {
            Some(stack_size) => builder.stack_size(stack_size),
            None => builder,
        }
    }
}

/// The director lock, held.
///
/// If the state was flagged as changed with [`Ledger::mark_changed`], all
/// waiters are notified when the lock is released, be it by waiting or by
/// dropping the monitor.
pub(crate) struct Monitor<'a> {
    shared: &'a Shared,
    kernel: MutexGuard<'a, Kernel>,
}

impl Monitor<'_> {
    /// Releases the lock until another thread releases it after a change.
    pub(crate) fn wait(&mut self) {
        self.notify_if_changed();
        self.shared.signal.wait(&mut self.kernel);
    }

    fn notify_if_changed(&mut self) {
        if self.kernel.ledger.take_changed() {
            self.shared.signal.notify_all();
        }
    }

    /// Returns an error if the execution is stopping or if any of the watched
    /// channels was finished.
    pub(crate) fn check_stop(&self, watched: &[ChannelId]) -> Result<(), RendezvousError> {
        if self.kernel.ledger.is_stop_requested()
            || watched
                .iter()
                .any(|id| self.kernel.channels.get(id.0).map_or(true, |c| c.finished))
        {
            return Err(RendezvousError::Terminated);
        }

        Ok(())
    }

    /// Waits on behalf of `party` for a change on any of the watched
    /// channels, recording it as blocked for the duration of the wait.
    ///
    /// The stop condition is checked both before waiting and after waking up.
    pub(crate) fn wait_blocked(
        &mut self,
        party: &Party,
        blocked_on: Option<ChannelId>,
        watched: &[ChannelId],
    ) -> Result<(), RendezvousError> {
        party.block(&mut self.kernel.ledger, blocked_on);
        if let Err(err) = self.check_stop(watched) {
            party.unblock(&mut self.kernel.ledger, blocked_on);
            return Err(err);
        }
        for id in watched {
            if let Some(channel) = self.kernel.channels.get_mut(id.0) {
                channel.watch(party);
            }
        }
        self.wait();
        for id in watched {
            if let Some(channel) = self.kernel.channels.get_mut(id.0) {
                channel.unwatch(party);
            }
        }
        party.unblock(&mut self.kernel.ledger, blocked_on);

        self.check_stop(watched)
    }
}

impl Deref for Monitor<'_> {
    type Target = Kernel;

    fn deref(&self) -> &Kernel {
        &self.kernel
    }
}

impl DerefMut for Monitor<'_> {
    fn deref_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }
}

impl Drop for Monitor<'_> {
    fn drop(&mut self) {
        self.notify_if_changed();
    }
}

struct PendingProcess {
    process: ProcessId,
    name: Arc<str>,
    body: ProcessFn,
}

/// Builder for a director.
pub struct DirectorInit {
    start_time: MonotonicTime,
    stop_time: Option<MonotonicTime>,
    stack_size: Option<usize>,
}

impl DirectorInit {
    /// Creates a builder for a director starting at [`MonotonicTime::EPOCH`]
    /// with no stop time.
    pub fn new() -> Self {
        Self {
            start_time: MonotonicTime::EPOCH,
            stop_time: None,
            stack_size: None,
        }
    }

    /// Sets the model time at the beginning of each run.
    pub fn start_time(mut self, start_time: MonotonicTime) -> Self {
        self.start_time = start_time;

        self
    }

    /// Sets a model time past which delayed processes are not resumed.
    ///
    /// The run ends with [`Termination::StopTimeReached`] when the only way
    /// to progress would be to advance time beyond this point.
    pub fn stop_time(mut self, stop_time: MonotonicTime) -> Self {
        self.stop_time = Some(stop_time);

        self
    }

    /// Sets the stack size of process and branch threads.
    ///
    /// If not set, the platform default is used.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);

        self
    }

    /// Builds the director.
    pub fn init(self) -> Director {
        let kernel = Kernel {
            ledger: Ledger::new(self.start_time, self.stop_time),
            channels: Slab::new(),
            batches: Slab::new(),
        };

        Director {
            shared: Arc::new(Shared {
                kernel: Mutex::new(kernel),
                signal: Condvar::new(),
                pending: Mutex::new(Vec::new()),
                threads: Mutex::new(Vec::new()),
                stack_size: self.stack_size,
            }),
        }
    }
}

impl Default for DirectorInit {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DirectorInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectorInit")
            .field("start_time", &self.start_time)
            .field("stop_time", &self.stop_time)
            .finish_non_exhaustive()
    }
}

/// A handle to an execution context.
///
/// Handles are cheap to clone and all refer to the same context.
#[derive(Clone)]
pub struct Director {
    pub(crate) shared: Arc<Shared>,
}

impl Director {
    /// Creates a director with the default configuration.
    pub fn new() -> Self {
        DirectorInit::new().init()
    }

    /// Creates a channel with a [`General`](crate::data::TokenType::General)
    /// element type that is not connected to any boundary.
    pub fn channel(&self, name: impl Into<String>) -> Channel {
        self.channel_builder(name).build()
    }

    /// Returns a builder for a channel with a declared element type or a
    /// boundary position.
    pub fn channel_builder(&self, name: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder::new(self.clone(), name.into())
    }

    /// Spawns a process.
    ///
    /// The body runs on a dedicated thread named after the process. If the
    /// director is not running, the process starts with the next call to
    /// [`run()`](Director::run); otherwise it starts immediately.
    ///
    /// The `name` needs not be unique and is used for identification in
    /// logs and deadlock reports.
    pub fn spawn<F>(&self, name: impl Into<String>, body: F) -> ProcessId
    where
        F: FnOnce(&Context) -> Result<(), RendezvousError> + Send + 'static,
    {
        let name: Arc<str> = name.into().into();

        let mut mon = self.shared.lock();
        let process = mon.ledger.register(name.clone());
        let pending = PendingProcess {
            process,
            name,
            body: Box::new(body),
        };

        // The lock is held while the thread is recorded so that the run
        // cannot complete before the handle can be joined.
        if mon.ledger.is_armed() {
            let handle = start_process(&self.shared, pending);
            self.shared.threads.lock().push(handle);
        } else {
            self.shared.pending.lock().push(pending);
        }

        process
    }

    /// Runs all spawned processes until the execution ends.
    ///
    /// All channels are reset before the processes start.
    pub fn run(&self) -> Result<Termination, ExecutionError> {
        let mut mon = self.shared.lock();
        if mon.ledger.is_armed() {
            return Err(ExecutionError::AlreadyRunning);
        }
        for (_, channel) in mon.channels.iter_mut() {
            channel.restart();
        }
        mon.ledger.arm();

        let pending = mem::take(&mut *self.shared.pending.lock());
        info!(processes = pending.len(), "run started");
        {
            let mut threads = self.shared.threads.lock();
            for process in pending {
                threads.push(start_process(&self.shared, process));
            }
        }

        while mon.ledger.active_count() > 0 {
            mon.wait();
        }

        let (outcome, failure) = mon.ledger.disarm();
        let result = match (outcome, failure) {
            (_, Some((process, Failure::Error(source)))) => Err(ExecutionError::ProcessFailed {
                process: process.to_string(),
                source,
            }),
            (_, Some((process, Failure::Panic(message)))) => Err(ExecutionError::Panic {
                process: process.to_string(),
                message,
            }),
            (Some(Outcome::Deadlock(blocked)), None) => Ok(Termination::Deadlock(
                blocked
                    .into_iter()
                    .map(|(process, channel)| DeadlockInfo {
                        process: process.to_string(),
                        channel: channel
                            .and_then(|id| mon.channels.get(id.0))
                            .map(|c| c.info.name.clone()),
                    })
                    .collect(),
            )),
            (Some(Outcome::StopTimeReached(time)), None) => {
                Ok(Termination::StopTimeReached(time))
            }
            (Some(Outcome::Stopped | Outcome::Aborted), None) => Ok(Termination::Stopped),
            (None, None) => Ok(Termination::Completed),
        };
        drop(mon);

        loop {
            let threads = mem::take(&mut *self.shared.threads.lock());
            if threads.is_empty() {
                break;
            }
            for thread in threads {
                // Panics are caught within the thread.
                let _ = thread.join();
            }
        }
        info!(?result, "run ended");

        result
    }

    /// Requests all processes to terminate.
    ///
    /// Blocked and delayed processes are woken up immediately; the run then
    /// ends with [`Termination::Stopped`].
    pub fn request_stop(&self) {
        let mut mon = self.shared.lock();
        if mon.ledger.is_armed() {
            info!("stop requested");
            mon.ledger.request_stop(Outcome::Stopped);
        }
    }

    /// Returns `true` if the current run is being wound down.
    pub fn is_stop_requested(&self) -> bool {
        self.shared.lock().ledger.is_stop_requested()
    }

    /// Current model time.
    pub fn time(&self) -> MonotonicTime {
        self.shared.lock().ledger.time()
    }

    /// Returns the blocking statistics of the processes of the current or
    /// last run.
    pub fn ledger_snapshot(&self) -> Vec<ProcessSnapshot> {
        self.shared.lock().ledger.snapshot()
    }

    pub(crate) fn same_as(&self, other: &Director) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Default for Director {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Director {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Director");
        // The lock may be held by the formatting thread.
        if let Some(kernel) = self.shared.kernel.try_lock() {
            s.field("time", &kernel.ledger.time());
        }
        s.finish_non_exhaustive()
    }
}

fn start_process(shared: &Arc<Shared>, pending: PendingProcess) -> JoinHandle<()> {
    let PendingProcess {
        process,
        name,
        body,
    } = pending;
    let director = Director {
        shared: shared.clone(),
    };

    shared
        .thread_builder(name.to_string())
        .spawn(move || {
            let span = info_span!("process", name = %name);
            let _enter = span.enter();
            debug!("process started");

            let cx = Context {
                director,
                process,
                name,
            };
            let exit = match panic::catch_unwind(AssertUnwindSafe(|| body(&cx))) {
                Ok(Ok(())) => Exit::Returned,
                Ok(Err(RendezvousError::Terminated)) => Exit::Terminated,
                Ok(Err(err)) => Exit::Failed(Failure::Error(err)),
                Err(payload) => Exit::Failed(Failure::Panic(panic_message(payload.as_ref()))),
            };

            let mut mon = cx.director.shared.lock();
            mon.ledger.process_exited(process, exit);
        })
        .unwrap()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("Box<dyn Any>")
    }
}

/// The execution context of a process.
pub struct Context {
    director: Director,
    process: ProcessId,
    name: Arc<str>,
}

impl Context {
    /// Name of the process.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of the process.
    pub fn process_id(&self) -> ProcessId {
        self.process
    }

    /// The director running this process.
    pub fn director(&self) -> &Director {
        &self.director
    }

    /// Current model time.
    pub fn time(&self) -> MonotonicTime {
        self.director.time()
    }

    /// Receives one token from every connected channel of the batch.
    ///
    /// The call blocks until all channels have a sender ready, at which point
    /// all tokens are transferred at once. The result has the shape of the
    /// batch, with `None` in place of unconnected slots.
    pub fn get_from_all(&self, batch: &Batch) -> Result<TokenGrid, RendezvousError> {
        channel::get_from_all(self, batch)
    }

    /// Sends tokens to every connected channel of the batch.
    ///
    /// The call blocks until all channels have a receiver ready, at which
    /// point all tokens are transferred at once.
    ///
    /// If fewer token rows than batch rows are supplied, the single row is
    /// used for all rows; within a row, a single token is broadcast to all
    /// channels of the row. Each token is converted to the element type of
    /// its channel.
    pub fn put_to_all(&self, tokens: &[Vec<Token>], batch: &Batch) -> Result<(), RendezvousError> {
        channel::put_to_all(self, tokens, batch)
    }

    /// Sends the first `count` tokens in sequence, each of them to all the
    /// receivers at once.
    pub fn put_array_to_all(
        &self,
        tokens: &[Token],
        count: usize,
        receivers: &[Channel],
    ) -> Result<(), RendezvousError> {
        if tokens.len() < count {
            return Err(RendezvousError::NotEnoughTokens {
                supplied: tokens.len(),
                required: count,
            });
        }
        if receivers.is_empty() {
            return Ok(());
        }
        let batch = Batch::row(receivers);
        for token in &tokens[..count] {
            self.put_to_all(&[vec![token.clone()]], &batch)?;
        }

        Ok(())
    }

    /// Performs exactly one of the enabled guarded communications.
    ///
    /// Returns `Ok(None)` if no branch is enabled.
    pub fn choose(&self, branches: Vec<Guarded>) -> Result<Option<Chosen>, RendezvousError> {
        branch::choose(self, branches)
    }

    /// Suspends the process until model time has advanced by `duration`.
    ///
    /// A zero duration returns immediately.
    pub fn delay(&self, duration: Duration) -> Result<(), RendezvousError> {
        if duration.is_zero() {
            return Ok(());
        }
        let mut mon = self.director.shared.lock();
        mon.check_stop(&[])?;
        let until = mon.ledger.time() + duration;

        self.sleep_until(&mut mon, until)
    }

    /// Suspends the process until all other processes are blocked or delayed
    /// to a later time.
    pub fn wait_for_deadlock(&self) -> Result<(), RendezvousError> {
        let mut mon = self.director.shared.lock();
        mon.check_stop(&[])?;
        let now = mon.ledger.time();

        self.sleep_until(&mut mon, now)
    }

    fn sleep_until(&self, mon: &mut Monitor<'_>, until: MonotonicTime) -> Result<(), RendezvousError> {
        mon.ledger.delay_until(self.process, until);
        while mon.ledger.is_delayed(self.process) {
            if mon.ledger.is_stop_requested() {
                mon.ledger.cancel_delay(self.process);
                return Err(RendezvousError::Terminated);
            }
            mon.wait();
        }

        Ok(())
    }

    pub(crate) fn party(&self) -> Party {
        Party::Process(self.process)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// All processes returned.
    Completed,
    /// All live processes were blocked.
    Deadlock(Vec<DeadlockInfo>),
    /// Resuming the next delayed process would exceed the stop time; holds the
    /// model time at which the run ended.
    StopTimeReached(MonotonicTime),
    /// A stop was requested.
    Stopped,
}

/// A process found blocked when a deadlock was detected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadlockInfo {
    /// Name of the process.
    pub process: String,
    /// Name of the channel the process was waiting on, if any.
    pub channel: Option<String>,
}

/// Blocking statistics of a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessSnapshot {
    /// Name of the process.
    pub name: String,
    /// Whether the process is currently blocked.
    pub blocked: bool,
    /// Number of transitions to the blocked state.
    pub block_count: u64,
    /// Number of transitions out of the blocked state.
    pub unblock_count: u64,
    /// Whether the process has exited.
    pub exited: bool,
}

/// An error that aborted a run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A process returned an error other than
    /// [`RendezvousError::Terminated`].
    #[error("process `{process}` failed: {source}")]
    ProcessFailed {
        /// Name of the process.
        process: String,
        /// The error it returned.
        #[source]
        source: RendezvousError,
    },
    /// A process panicked.
    #[error("process `{process}` panicked: {message}")]
    Panic {
        /// Name of the process.
        process: String,
        /// The panic message.
        message: String,
    },
    /// The director is already running.
    #[error("the director is already running")]
    AlreadyRunning,
}
