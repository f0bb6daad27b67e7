//! The guarded-choice controller used by `Context::choose`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, Span};

use crate::channel::{Channel, RendezvousError};
use crate::data::Token;
use crate::director::{Context, Ledger, ProcessId};

use super::{Action, BranchController, BranchId, ConditionalBranch};

/// A guarded communication offered to [`Context::choose()`].
#[derive(Clone, Debug)]
pub struct Guarded {
    guard: bool,
    channel: Channel,
    action: Action,
}

impl Guarded {
    /// Offers to receive from `channel`.
    pub fn receive(channel: &Channel) -> Self {
        Self {
            guard: true,
            channel: channel.clone(),
            action: Action::Receive,
        }
    }

    /// Offers to send `token` to `channel`.
    pub fn send(channel: &Channel, token: impl Into<Token>) -> Self {
        Self {
            guard: true,
            channel: channel.clone(),
            action: Action::Send(token.into()),
        }
    }

    /// Enables the communication only if `guard` is `true`.
    pub fn when(mut self, guard: bool) -> Self {
        self.guard = guard;

        self
    }

    fn perform(self, cx: &Context, branch: usize) -> Result<Chosen, RendezvousError> {
        let token = match self.action {
            Action::Receive => Some(self.channel.get(cx)?),
            Action::Send(token) => {
                self.channel.put(cx, token)?;
                None
            }
        };

        Ok(Chosen { branch, token })
    }
}

/// The communication performed by a guarded choice.
#[derive(Clone, Debug, PartialEq)]
pub struct Chosen {
    /// Index of the branch in the list given to `choose`.
    pub branch: usize,
    /// The received token, for a receive.
    pub token: Option<Token>,
}

pub(crate) fn choose(cx: &Context, branches: Vec<Guarded>) -> Result<Option<Chosen>, RendezvousError> {
    let mut enabled: Vec<_> = branches
        .into_iter()
        .enumerate()
        .filter(|(_, branch)| branch.guard)
        .collect();

    if enabled.len() <= 1 {
        return match enabled.pop() {
            None => Ok(None),
            Some((index, branch)) => branch.perform(cx, index).map(Some),
        };
    }

    let controller = Arc::new(ChoiceController::new(cx.process_id(), enabled.len()));
    let mut conditionals = Vec::with_capacity(enabled.len());
    for (slot, (_, branch)) in enabled.iter().enumerate() {
        branch.channel.check_director(cx)?;
        let id = BranchId(slot);
        conditionals.push(match &branch.action {
            Action::Receive => ConditionalBranch::receive(controller.clone(), id, &branch.channel),
            Action::Send(token) => {
                ConditionalBranch::send(controller.clone(), id, &branch.channel, token.clone())?
            }
        });
    }

    let shared = &cx.director().shared;
    let threads: Vec<_> = conditionals
        .into_iter()
        .map(|conditional| {
            let id = conditional.id();
            let controller = controller.clone();
            let director = cx.director().clone();
            let span = Span::current();

            shared
                .thread_builder(format!("{}/branch #{}", cx.name(), id))
                .spawn(move || {
                    let _enter = span.enter();
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| conditional.run())) {
                        let mut mon = director.shared.lock();
                        controller.branch_failed(id, &mut mon.ledger);
                        mon.ledger.mark_changed();
                        drop(mon);
                        panic::resume_unwind(payload);
                    }
                })
                .unwrap()
        })
        .collect();

    let mut mon = shared.lock();
    while !controller.is_settled() {
        mon.wait();
    }
    controller.kill_losers(&mut mon.ledger);
    while controller.running_count() > 0 {
        mon.wait();
    }
    drop(mon);

    for thread in threads {
        if let Err(payload) = thread.join() {
            panic::resume_unwind(payload);
        }
    }

    match controller.take_winner() {
        Some((slot, token)) => {
            let branch = enabled[slot].0;
            debug!(branch, "guarded choice committed");

            Ok(Some(Chosen { branch, token }))
        }
        None => Err(RendezvousError::Terminated),
    }
}

#[derive(Clone, Copy, Debug)]
struct BranchFlags {
    alive: bool,
    running: bool,
    blocked: bool,
}

struct ChoiceState {
    first: Option<usize>,
    winner: Option<(usize, Option<Token>)>,
    branches: Vec<BranchFlags>,
    running_count: usize,
    actor_blocked: bool,
}

/// A controller letting the first committed branch win.
///
/// The actor running the choice is reported blocked when it cannot progress:
/// before any branch claims first-ness this is when all running branches are
/// blocked, afterwards when the claiming branch is blocked.
pub(crate) struct ChoiceController {
    actor: ProcessId,
    state: Mutex<ChoiceState>,
}

impl ChoiceController {
    pub(crate) fn new(actor: ProcessId, branch_count: usize) -> Self {
        Self {
            actor,
            state: Mutex::new(ChoiceState {
                first: None,
                winner: None,
                branches: vec![
                    BranchFlags {
                        alive: true,
                        running: true,
                        blocked: false,
                    };
                    branch_count
                ],
                running_count: branch_count,
                actor_blocked: false,
            }),
        }
    }

    /// Returns `true` once a branch has won or all branches have ended.
    fn is_settled(&self) -> bool {
        let state = self.state.lock();

        state.winner.is_some() || state.running_count == 0
    }

    fn running_count(&self) -> usize {
        self.state.lock().running_count
    }

    fn take_winner(&self) -> Option<(usize, Option<Token>)> {
        self.state.lock().winner.take()
    }

    /// Marks all branches but the winner as dead and wakes them up.
    fn kill_losers(&self, ledger: &mut Ledger) {
        let mut state = self.state.lock();
        let winner = state.winner.as_ref().map(|(slot, _)| *slot);
        for (slot, flags) in state.branches.iter_mut().enumerate() {
            if Some(slot) != winner {
                flags.alive = false;
                flags.blocked = false;
            }
        }
        self.refresh(&mut state, ledger);
        ledger.mark_changed();
    }

    fn end_branch(&self, state: &mut ChoiceState, slot: usize) -> bool {
        let flags = &mut state.branches[slot];
        if !flags.running {
            return false;
        }
        flags.running = false;
        flags.blocked = false;
        state.running_count -= 1;

        true
    }

    fn refresh(&self, state: &mut ChoiceState, ledger: &mut Ledger) {
        let blocked = match state.first {
            Some(first) => state.branches[first].running && state.branches[first].blocked,
            None => {
                state.running_count > 0
                    && state
                        .branches
                        .iter()
                        .all(|flags| !flags.running || flags.blocked)
            }
        };
        if blocked != state.actor_blocked {
            state.actor_blocked = blocked;
            if blocked {
                ledger.thread_blocked(self.actor, None);
            } else {
                ledger.thread_unblocked(self.actor, None);
            }
        }
    }
}

impl BranchController for ChoiceController {
    fn am_i_first(&self, branch: BranchId, ledger: &mut Ledger) -> bool {
        let mut state = self.state.lock();
        match state.first {
            Some(first) => first == branch.0,
            None => {
                state.first = Some(branch.0);
                self.refresh(&mut state, ledger);

                true
            }
        }
    }

    fn release_first(&self, branch: BranchId, ledger: &mut Ledger) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.first, Some(branch.0));
        if state.first == Some(branch.0) {
            state.first = None;
            self.refresh(&mut state, ledger);
        }
    }

    fn is_alive(&self, branch: BranchId) -> bool {
        self.state.lock().branches[branch.0].alive
    }

    fn branch_blocked(&self, branch: BranchId, ledger: &mut Ledger) {
        let mut state = self.state.lock();
        state.branches[branch.0].blocked = true;
        self.refresh(&mut state, ledger);
    }

    fn branch_unblocked(&self, branch: BranchId, ledger: &mut Ledger) {
        let mut state = self.state.lock();
        state.branches[branch.0].blocked = false;
        self.refresh(&mut state, ledger);
    }

    fn branch_succeeded(&self, branch: BranchId, token: Option<Token>, ledger: &mut Ledger) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.first, Some(branch.0));
        if self.end_branch(&mut state, branch.0) {
            state.winner = Some((branch.0, token));
        }
        self.refresh(&mut state, ledger);
    }

    fn branch_failed(&self, branch: BranchId, ledger: &mut Ledger) {
        let mut state = self.state.lock();
        if !self.end_branch(&mut state, branch.0) {
            return;
        }
        if state.first == Some(branch.0) {
            // Siblings waiting for the claim may now proceed.
            state.first = None;
            for flags in state.branches.iter_mut() {
                flags.blocked = false;
            }
        }
        self.refresh(&mut state, ledger);
    }
}
