//! Blocked-thread bookkeeping and deadlock detection.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use slab::Slab;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelId;
use crate::time::MonotonicTime;

use super::{ProcessId, ProcessSnapshot};

/// The registry of live processes owned by a director.
///
/// Every wait performed on behalf of a process is bracketed by
/// [`thread_blocked`](Ledger::thread_blocked) and
/// [`thread_unblocked`](Ledger::thread_unblocked). After each transition the
/// ledger checks whether the execution can still progress: when all active
/// processes are blocked or delayed, either model time is advanced to the
/// earliest delayed process (artificial deadlock) or the execution is stopped
/// (real deadlock).
///
/// The ledger is only reachable while the director lock is held.
pub struct Ledger {
    processes: Slab<ProcessRecord>,
    active_count: usize,
    blocked_count: usize,
    delayed_count: usize,
    time: MonotonicTime,
    start_time: MonotonicTime,
    stop_time: Option<MonotonicTime>,
    wakeups: BinaryHeap<Reverse<(MonotonicTime, u64, usize)>>,
    next_wakeup_seq: u64,
    armed: bool,
    stop_requested: bool,
    outcome: Option<Outcome>,
    failure: Option<(Arc<str>, Failure)>,
    changed: bool,
}

impl Ledger {
    pub(crate) fn new(start_time: MonotonicTime, stop_time: Option<MonotonicTime>) -> Self {
        Self {
            processes: Slab::new(),
            active_count: 0,
            blocked_count: 0,
            delayed_count: 0,
            time: start_time,
            start_time,
            stop_time,
            wakeups: BinaryHeap::new(),
            next_wakeup_seq: 0,
            armed: false,
            stop_requested: false,
            outcome: None,
            failure: None,
            changed: false,
        }
    }

    /// Records that a process is about to wait on `channel`, or on no channel
    /// in particular.
    ///
    /// This is a no-op if the process is already marked as blocked.
    pub fn thread_blocked(&mut self, process: ProcessId, channel: Option<ChannelId>) {
        let Some(record) = self.processes.get_mut(process.0) else {
            return;
        };
        if record.blocked || record.exited {
            return;
        }
        record.blocked = true;
        record.blocked_on = channel;
        record.block_count += 1;
        self.blocked_count += 1;
        trace!(process = %record.name, ?channel, "blocked");

        self.check_progress();
    }

    /// Records that a process can make progress again.
    ///
    /// This is a no-op if the process is not marked as blocked, which makes it
    /// possible to unblock a process on its behalf before it actually wakes up.
    pub fn thread_unblocked(&mut self, process: ProcessId, channel: Option<ChannelId>) {
        let Some(record) = self.processes.get_mut(process.0) else {
            return;
        };
        if !record.blocked {
            return;
        }
        record.blocked = false;
        record.blocked_on = None;
        record.unblock_count += 1;
        self.blocked_count -= 1;
        trace!(process = %record.name, ?channel, "unblocked");
    }

    /// Returns `true` if the execution is being wound down.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Current model time.
    pub fn time(&self) -> MonotonicTime {
        self.time
    }

    /// Number of processes that have not exited yet.
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// Number of processes currently blocked.
    pub fn blocked_count(&self) -> usize {
        self.blocked_count
    }

    /// Records that shared state has changed in a way waiting threads must
    /// re-examine.
    ///
    /// Waiters are only woken up when the director lock is next released
    /// after this call.
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Clears the change flag, returning its previous value.
    pub(crate) fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub(crate) fn register(&mut self, name: Arc<str>) -> ProcessId {
        let id = self.processes.insert(ProcessRecord::new(name));
        self.active_count += 1;

        ProcessId(id)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn arm(&mut self) {
        self.processes.retain(|_, record| !record.exited);
        self.time = self.start_time;
        self.wakeups.clear();
        self.stop_requested = false;
        self.outcome = None;
        self.failure = None;
        self.armed = true;

        // Processes may all have been blocked on a previous run.
        self.check_progress();
    }

    /// Ends a run and returns how it went.
    pub(crate) fn disarm(&mut self) -> (Option<Outcome>, Option<(Arc<str>, Failure)>) {
        self.armed = false;

        (self.outcome.take(), self.failure.take())
    }

    pub(crate) fn request_stop(&mut self, outcome: Outcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
        self.stop_requested = true;
        self.changed = true;
    }

    pub(crate) fn process_exited(&mut self, process: ProcessId, exit: Exit) {
        let Some(record) = self.processes.get_mut(process.0) else {
            return;
        };
        if record.exited {
            return;
        }
        if record.blocked {
            record.blocked = false;
            self.blocked_count -= 1;
        }
        if record.delayed_until.take().is_some() {
            self.delayed_count -= 1;
        }
        record.exited = true;
        self.active_count -= 1;
        self.changed = true;
        let name = record.name.clone();

        match exit {
            Exit::Returned => debug!(process = %name, "process completed"),
            Exit::Terminated => debug!(process = %name, "process terminated"),
            Exit::Failed(failure) => {
                warn!(process = %name, error = %failure, "process failed");
                if self.failure.is_none() {
                    self.failure = Some((name, failure));
                }
                self.request_stop(Outcome::Aborted);
            }
        }

        self.check_progress();
    }

    /// Suspends a process until model time reaches `until`.
    pub(crate) fn delay_until(&mut self, process: ProcessId, until: MonotonicTime) {
        let Some(record) = self.processes.get_mut(process.0) else {
            return;
        };
        let seq = self.next_wakeup_seq;
        self.next_wakeup_seq += 1;
        if record.delayed_until.replace((until, seq)).is_none() {
            self.delayed_count += 1;
        }
        self.wakeups.push(Reverse((until, seq, process.0)));
        trace!(process = %record.name, %until, "delayed");

        self.check_progress();
    }

    pub(crate) fn is_delayed(&self, process: ProcessId) -> bool {
        self.processes
            .get(process.0)
            .map_or(false, |record| record.delayed_until.is_some())
    }

    /// Withdraws a pending delay. Its stale wake-up is skipped later.
    pub(crate) fn cancel_delay(&mut self, process: ProcessId) {
        if let Some(record) = self.processes.get_mut(process.0) {
            if record.delayed_until.take().is_some() {
                self.delayed_count -= 1;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.processes
            .iter()
            .map(|(_, record)| ProcessSnapshot {
                name: record.name.to_string(),
                blocked: record.blocked,
                block_count: record.block_count,
                unblock_count: record.unblock_count,
                exited: record.exited,
            })
            .collect()
    }

    fn check_progress(&mut self) {
        if !self.armed || self.stop_requested || self.active_count == 0 {
            return;
        }
        if self.blocked_count + self.delayed_count < self.active_count {
            return;
        }

        if self.delayed_count == 0 {
            let blocked: Vec<_> = self
                .processes
                .iter()
                .filter(|(_, record)| record.blocked && !record.exited)
                .map(|(_, record)| (record.name.clone(), record.blocked_on))
                .collect();
            info!(processes = blocked.len(), "deadlock detected");
            self.request_stop(Outcome::Deadlock(blocked));

            return;
        }

        // Artificial deadlock: resume the earliest delayed processes.
        while let Some(&Reverse((until, seq, id))) = self.wakeups.peek() {
            let is_current = self.processes.get(id).map_or(false, |record| {
                record.delayed_until == Some((until, seq))
            });
            if !is_current {
                self.wakeups.pop();
                continue;
            }
            if self.stop_time.map_or(false, |stop_time| until > stop_time) {
                info!(%until, "stop time reached");
                self.request_stop(Outcome::StopTimeReached(self.time));

                return;
            }
            if until > self.time {
                self.time = until;
                debug!(time = %self.time, "model time advanced");
            }
            break;
        }

        while let Some(&Reverse((until, seq, id))) = self.wakeups.peek() {
            if until > self.time {
                break;
            }
            self.wakeups.pop();
            if let Some(record) = self.processes.get_mut(id) {
                if record.delayed_until == Some((until, seq)) {
                    record.delayed_until = None;
                    self.delayed_count -= 1;
                    self.changed = true;
                    trace!(process = %record.name, "resumed");
                }
            }
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("time", &self.time)
            .field("active_count", &self.active_count)
            .field("blocked_count", &self.blocked_count)
            .field("delayed_count", &self.delayed_count)
            .finish_non_exhaustive()
    }
}

struct ProcessRecord {
    name: Arc<str>,
    blocked: bool,
    blocked_on: Option<ChannelId>,
    delayed_until: Option<(MonotonicTime, u64)>,
    block_count: u64,
    unblock_count: u64,
    exited: bool,
}

impl ProcessRecord {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            blocked: false,
            blocked_on: None,
            delayed_until: None,
            block_count: 0,
            unblock_count: 0,
            exited: false,
        }
    }
}

/// How a run came to an end, when not by normal completion.
#[derive(Debug)]
pub(crate) enum Outcome {
    Deadlock(Vec<(Arc<str>, Option<ChannelId>)>),
    StopTimeReached(MonotonicTime),
    Stopped,
    Aborted,
}

/// How a process thread exited.
#[derive(Debug)]
pub(crate) enum Exit {
    Returned,
    Terminated,
    Failed(Failure),
}

/// A process error that aborts the execution.
#[derive(Debug)]
pub(crate) enum Failure {
    Error(crate::channel::RendezvousError),
    Panic(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Error(err) => err.fmt(f),
            Failure::Panic(message) => write!(f, "panicked: {}", message),
        }
    }
}
