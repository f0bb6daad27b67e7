//! Conditional branches and guarded choice.
//!
//! A guarded choice offers several communications at once and performs
//! exactly one of them. Each alternative is a [`ConditionalBranch`] running on
//! its own thread and racing its siblings; a [`BranchController`] arbitrates
//! which of them gets to commit.
//!
//! A branch meeting a plain operation only needs the consent of its own
//! controller. A branch meeting the conditional branch of another choice needs
//! the consent of both controllers, since each of them may still commit to a
//! different alternative: it claims first-ness on both sides, releasing its own
//! claim if the opposite side is unavailable, and then performs the transfer
//! on behalf of the parked counterpart. Claims and releases happen
//! within a single critical section of the director lock, so a released claim
//! is never observed by another branch.
//!
//! [`Context::choose()`](crate::director::Context::choose) provides a ready to
//! use controller. Custom controllers can drive branches directly:
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! use synchronix::branch::{BranchController, BranchId, BranchOutcome, ConditionalBranch};
//! use synchronix::data::Token;
//! use synchronix::director::{Director, Ledger, ProcessId, Termination};
//!
//! // A controller for a single branch acting for `actor`.
//! struct Single {
//!     actor: ProcessId,
//!     first: AtomicBool,
//! }
//!
//! impl BranchController for Single {
//!     fn am_i_first(&self, _: BranchId, _: &mut Ledger) -> bool {
//!         self.first.store(true, Ordering::Relaxed);
//!         true
//!     }
//!     fn release_first(&self, _: BranchId, _: &mut Ledger) {
//!         self.first.store(false, Ordering::Relaxed);
//!     }
//!     fn is_alive(&self, _: BranchId) -> bool {
//!         true
//!     }
//!     fn branch_blocked(&self, _: BranchId, ledger: &mut Ledger) {
//!         ledger.thread_blocked(self.actor, None);
//!     }
//!     fn branch_unblocked(&self, _: BranchId, ledger: &mut Ledger) {
//!         ledger.thread_unblocked(self.actor, None);
//!     }
//!     fn branch_succeeded(&self, _: BranchId, _: Option<Token>, _: &mut Ledger) {}
//!     fn branch_failed(&self, _: BranchId, _: &mut Ledger) {}
//! }
//!
//! let director = Director::new();
//! let channel = director.channel("c");
//!
//! let tx = channel.clone();
//! director.spawn("sender", move |cx| tx.put(cx, Token::Int(42)));
//! director.spawn("receiver", move |cx| {
//!     let controller = Arc::new(Single {
//!         actor: cx.process_id(),
//!         first: AtomicBool::new(false),
//!     });
//!     let branch = ConditionalBranch::receive(controller, BranchId(0), &channel);
//!     assert_eq!(branch.run(), BranchOutcome::Succeeded(Some(Token::Int(42))));
//!
//!     Ok(())
//! });
//!
//! assert_eq!(director.run().unwrap(), Termination::Completed);
//! ```
mod choice;

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::channel::{rendezvous, Channel, Parked, Party, Request, RendezvousError, Side};
use crate::data::Token;
use crate::director::{Kernel, Ledger, Monitor};

pub(crate) use choice::choose;
pub use choice::{Chosen, Guarded};

/// Identifier of a branch within its controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub usize);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arbiter of the branches of a guarded choice.
///
/// All methods are called with the director lock held and must neither block
/// nor operate on channels. They receive the director [`Ledger`] so that the
/// controller can report its actor as blocked or unblocked. A controller
/// changing its state outside of these calls, for instance to kill a branch,
/// must call [`Ledger::mark_changed`] for waiting branches to notice.
pub trait BranchController: Send + Sync {
    /// Claims first-ness for `branch`.
    ///
    /// Returns `true` if no other branch holds the claim. This must be
    /// idempotent: a branch holding the claim gets `true` again, and no other
    /// branch gets `true` until the claim is released.
    fn am_i_first(&self, branch: BranchId, ledger: &mut Ledger) -> bool;

    /// Releases a claim obtained with [`am_i_first`](Self::am_i_first).
    fn release_first(&self, branch: BranchId, ledger: &mut Ledger);

    /// Returns `false` once the branch should give up, typically because a
    /// sibling has committed.
    fn is_alive(&self, branch: BranchId) -> bool;

    /// The branch is about to wait.
    fn branch_blocked(&self, branch: BranchId, ledger: &mut Ledger);

    /// The branch can make progress again; may be called on behalf of the
    /// branch before it wakes up.
    fn branch_unblocked(&self, branch: BranchId, ledger: &mut Ledger);

    /// The branch has transferred a token; `token` holds the received token
    /// for a receive.
    fn branch_succeeded(&self, branch: BranchId, token: Option<Token>, ledger: &mut Ledger);

    /// The branch has given up.
    fn branch_failed(&self, branch: BranchId, ledger: &mut Ledger);
}

/// A branch together with its controller.
#[derive(Clone)]
pub(crate) struct BranchTicket {
    controller: Arc<dyn BranchController>,
    branch: BranchId,
}

impl BranchTicket {
    fn is_alive(&self) -> bool {
        self.controller.is_alive(self.branch)
    }

    fn am_i_first(&self, ledger: &mut Ledger) -> bool {
        self.controller.am_i_first(self.branch, ledger)
    }

    fn release_first(&self, ledger: &mut Ledger) {
        self.controller.release_first(self.branch, ledger);
        ledger.mark_changed();
    }

    pub(crate) fn blocked(&self, ledger: &mut Ledger) {
        self.controller.branch_blocked(self.branch, ledger)
    }

    pub(crate) fn unblocked(&self, ledger: &mut Ledger) {
        self.controller.branch_unblocked(self.branch, ledger)
    }

    pub(crate) fn same_as(&self, other: &BranchTicket) -> bool {
        self.branch == other.branch
            && Arc::as_ptr(&self.controller) as *const () == Arc::as_ptr(&other.controller) as *const ()
    }
}

/// The communication attempted by a branch.
#[derive(Clone, Debug)]
enum Action {
    Receive,
    Send(Token),
}

impl Action {
    fn side(&self) -> Side {
        match self {
            Action::Receive => Side::Get,
            Action::Send(_) => Side::Put,
        }
    }
}

/// How a conditional branch ended.
#[derive(Clone, Debug, PartialEq)]
pub enum BranchOutcome {
    /// The branch committed; holds the received token for a receive.
    Succeeded(Option<Token>),
    /// The branch gave up or was terminated.
    Failed,
}

enum Race {
    Won(Option<Token>),
    Lost,
}

/// One alternative of a guarded choice.
pub struct ConditionalBranch {
    ticket: BranchTicket,
    channel: Channel,
    action: Action,
}

impl ConditionalBranch {
    /// Creates a branch receiving from `channel`.
    pub fn receive(
        controller: Arc<dyn BranchController>,
        branch: BranchId,
        channel: &Channel,
    ) -> Self {
        Self {
            ticket: BranchTicket { controller, branch },
            channel: channel.clone(),
            action: Action::Receive,
        }
    }

    /// Creates a branch sending `token` to `channel`.
    ///
    /// The token is converted to the element type of the channel right away.
    pub fn send(
        controller: Arc<dyn BranchController>,
        branch: BranchId,
        channel: &Channel,
        token: Token,
    ) -> Result<Self, RendezvousError> {
        let token = channel.convert(&token)?;

        Ok(Self {
            ticket: BranchTicket { controller, branch },
            channel: channel.clone(),
            action: Action::Send(token),
        })
    }

    /// Identifier of the branch.
    pub fn id(&self) -> BranchId {
        self.ticket.branch
    }

    /// Races for the channel until the branch commits, dies or is
    /// terminated, blocking the calling thread.
    ///
    /// Exactly one of [`BranchController::branch_succeeded`] or
    /// [`BranchController::branch_failed`] is called before returning.
    pub fn run(self) -> BranchOutcome {
        let director = self.channel.director().clone();
        let mut mon = director.shared.lock();
        let BranchTicket { controller, branch } = &self.ticket;

        let outcome = match self.race(&mut mon) {
            Ok(Race::Won(token)) => {
                trace!(channel = %self.channel.name(), %branch, "branch succeeded");
                controller.branch_succeeded(*branch, token.clone(), &mut mon.ledger);

                BranchOutcome::Succeeded(token)
            }
            Ok(Race::Lost) | Err(_) => {
                trace!(channel = %self.channel.name(), %branch, "branch failed");
                controller.branch_failed(*branch, &mut mon.ledger);

                BranchOutcome::Failed
            }
        };
        mon.ledger.mark_changed();

        outcome
    }

    fn race(&self, mon: &mut Monitor<'_>) -> Result<Race, RendezvousError> {
        let id = self.channel.id();
        let watched = [id];
        let side = self.action.side();
        let ticket = &self.ticket;
        let party = Party::Branch(ticket.clone());

        'race: loop {
            if !ticket.is_alive() {
                return Ok(Race::Lost);
            }
            mon.check_stop(&watched)?;

            // Only one operation may be in flight on each side.
            let channel = &mon.channels[id.0];
            if channel.is_occupied(side) {
                mon.wait_blocked(&party, Some(id), &watched)?;
                continue 'race;
            }

            // A plain counterpart never withdraws: commit as soon as the
            // controller allows it.
            if channel.plain(side.opposite()).is_some() {
                loop {
                    if ticket.am_i_first(&mut mon.ledger) {
                        return self.commit(mon, &party);
                    }
                    mon.wait_blocked(&party, Some(id), &watched)?;
                    if !ticket.is_alive() {
                        return Ok(Race::Lost);
                    }
                }
            }

            // The opposing conditional branch may commit elsewhere: both
            // controllers must consent, and the transfer is then performed
            // on its behalf.
            let kernel: &mut Kernel = mon;
            if let Some(opposing) = kernel.channels[id.0].parked_mut(side.opposite()) {
                if !opposing.committed && ticket.am_i_first(&mut kernel.ledger) {
                    if opposing.ticket.am_i_first(&mut kernel.ledger) {
                        opposing.committed = true;
                        let received = match &self.action {
                            Action::Receive => opposing.token.take(),
                            Action::Send(token) => {
                                opposing.token = Some(token.clone());
                                None
                            }
                        };
                        kernel.channels[id.0].notify_watchers(&mut kernel.ledger);

                        return Ok(Race::Won(received));
                    }
                    ticket.release_first(&mut kernel.ledger);
                }
                mon.wait_blocked(&party, Some(id), &watched)?;

                continue 'race;
            }

            // Nobody there yet: park and let the counterpart find us.
            let kernel: &mut Kernel = mon;
            let channel = &mut kernel.channels[id.0];
            *channel.parked_mut(side) = Some(Parked {
                ticket: ticket.clone(),
                token: match &self.action {
                    Action::Receive => None,
                    Action::Send(token) => Some(token.clone()),
                },
                committed: false,
            });
            channel.notify_watchers(&mut kernel.ledger);
            trace!(channel = %self.channel.name(), branch = %ticket.branch, "branch parked");
            loop {
                let waited = mon.wait_blocked(&party, Some(id), &watched);
                if !self.is_parked(mon) {
                    // Evicted by a finish or a reset.
                    waited?;
                    return Err(RendezvousError::Terminated);
                }
                if let Some(received) = self.take_committed(mon) {
                    return Ok(Race::Won(received));
                }
                if let Err(err) = waited {
                    self.unpark(mon);
                    return Err(err);
                }
                if !ticket.is_alive() {
                    self.unpark(mon);
                    return Ok(Race::Lost);
                }
                if mon.channels[id.0].plain(side.opposite()).is_some()
                    && ticket.am_i_first(&mut mon.ledger)
                {
                    self.unpark(mon);
                    return self.commit(mon, &party);
                }
            }
        }
    }

    /// Performs the committed transfer as a plain operation.
    fn commit(&self, mon: &mut Monitor<'_>, party: &Party) -> Result<Race, RendezvousError> {
        let request = match &self.action {
            Action::Receive => Request::Get,
            Action::Send(token) => Request::Put(vec![token.clone()]),
        };
        let mut delivered = rendezvous(mon, party, &[self.channel.id()], request)?;

        Ok(Race::Won(delivered.pop()))
    }

    fn is_parked(&self, kernel: &Kernel) -> bool {
        kernel.channels[self.channel.id().0]
            .parked(self.action.side())
            .map_or(false, |parked| parked.ticket.same_as(&self.ticket))
    }

    /// Unparks the branch if an opposing branch has performed the transfer,
    /// returning the received token for a receive.
    fn take_committed(&self, kernel: &mut Kernel) -> Option<Option<Token>> {
        let slot = kernel.channels[self.channel.id().0].parked_mut(self.action.side());
        if !slot.as_ref().map_or(false, |parked| parked.committed) {
            return None;
        }
        let parked = slot.take()?;
        kernel.channels[self.channel.id().0].notify_watchers(&mut kernel.ledger);
        match self.action {
            Action::Receive => Some(parked.token),
            Action::Send(_) => Some(None),
        }
    }

    fn unpark(&self, kernel: &mut Kernel) {
        if self.is_parked(kernel) {
            let channel = &mut kernel.channels[self.channel.id().0];
            *channel.parked_mut(self.action.side()) = None;
            channel.notify_watchers(&mut kernel.ledger);
        }
    }
}

impl fmt::Debug for ConditionalBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalBranch")
            .field("branch", &self.ticket.branch)
            .field("channel", &self.channel)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}
