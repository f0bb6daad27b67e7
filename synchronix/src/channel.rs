//! Rendezvous channels.
//!
//! A [`Channel`] is the synchronization point between one producer and one
//! consumer at a time. It never buffers: a `put` completes only once a `get`
//! takes the token, and vice versa. Operations spanning several channels are
//! expressed as a [`Batch`], which is transferred atomically: either every
//! channel of the batch rendezvous at once or none does.
//!
//! All channel state lives behind the lock of the director that created the
//! channel, so a readiness check spanning several channels and the transfer
//! that follows it are a single critical section.
mod batch;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::boundary::{BoundaryDetector, PortKind};
use crate::branch::BranchTicket;
use crate::data::{ConversionError, Token, TokenType};
use crate::director::{Context, Director, Kernel, Ledger, ProcessId};

pub(crate) use batch::{get_from_all, put_to_all, rendezvous, BatchState, Request};
pub use batch::{Batch, TokenGrid};

/// Unique identifier of a channel within its director.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable description of a channel.
#[derive(Debug)]
pub(crate) struct ChannelInfo {
    pub(crate) name: String,
    pub(crate) element_type: TokenType,
    pub(crate) boundary: BoundaryDetector,
}

/// The direction of an operation on a channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Get,
    Put,
}

impl Side {
    pub(crate) fn opposite(self) -> Self {
        match self {
            Side::Get => Side::Put,
            Side::Put => Side::Get,
        }
    }
}

/// A batch waiting on a channel.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Registration {
    pub(crate) batch: usize,
}

/// Whoever waits on a channel: a process, or a conditional branch acting for
/// its controller.
#[derive(Clone)]
pub(crate) enum Party {
    Process(ProcessId),
    Branch(BranchTicket),
}

impl Party {
    pub(crate) fn block(&self, ledger: &mut Ledger, channel: Option<ChannelId>) {
        match self {
            Party::Process(process) => ledger.thread_blocked(*process, channel),
            Party::Branch(ticket) => ticket.blocked(ledger),
        }
    }

    pub(crate) fn unblock(&self, ledger: &mut Ledger, channel: Option<ChannelId>) {
        match self {
            Party::Process(process) => ledger.thread_unblocked(*process, channel),
            Party::Branch(ticket) => ticket.unblocked(ledger),
        }
    }

    fn same_as(&self, other: &Party) -> bool {
        match (self, other) {
            (Party::Process(a), Party::Process(b)) => a == b,
            (Party::Branch(a), Party::Branch(b)) => a.same_as(b),
            _ => false,
        }
    }
}

/// A conditional branch waiting on a channel.
pub(crate) struct Parked {
    pub(crate) ticket: BranchTicket,
    /// The token offered by a send, or the token handed to a receive.
    pub(crate) token: Option<Token>,
    /// Set by an opposing branch that has performed the transfer.
    pub(crate) committed: bool,
}

/// Mutable state of a channel, protected by the director lock.
pub(crate) struct ChannelState {
    pub(crate) info: Arc<ChannelInfo>,
    pub(crate) pending_token: Option<Token>,
    get_waiter: Option<Registration>,
    put_waiter: Option<Registration>,
    parked_receive: Option<Parked>,
    parked_send: Option<Parked>,
    watchers: Vec<Party>,
    pub(crate) finished: bool,
}

impl ChannelState {
    fn new(info: Arc<ChannelInfo>) -> Self {
        Self {
            info,
            pending_token: None,
            get_waiter: None,
            put_waiter: None,
            parked_receive: None,
            parked_send: None,
            watchers: Vec::new(),
            finished: false,
        }
    }

    /// The plain operation registered on the given side.
    pub(crate) fn plain(&self, side: Side) -> Option<Registration> {
        match side {
            Side::Get => self.get_waiter,
            Side::Put => self.put_waiter,
        }
    }

    pub(crate) fn plain_mut(&mut self, side: Side) -> &mut Option<Registration> {
        match side {
            Side::Get => &mut self.get_waiter,
            Side::Put => &mut self.put_waiter,
        }
    }

    /// The conditional branch parked on the given side.
    pub(crate) fn conditional(&self, side: Side) -> Option<&BranchTicket> {
        self.parked(side).map(|parked| &parked.ticket)
    }

    pub(crate) fn parked(&self, side: Side) -> Option<&Parked> {
        match side {
            Side::Get => self.parked_receive.as_ref(),
            Side::Put => self.parked_send.as_ref(),
        }
    }

    pub(crate) fn parked_mut(&mut self, side: Side) -> &mut Option<Parked> {
        match side {
            Side::Get => &mut self.parked_receive,
            Side::Put => &mut self.parked_send,
        }
    }

    /// Returns `true` if a plain operation or a parked conditional branch
    /// already holds the given side.
    pub(crate) fn is_occupied(&self, side: Side) -> bool {
        self.plain(side).is_some() || self.conditional(side).is_some()
    }

    pub(crate) fn watch(&mut self, party: &Party) {
        self.watchers.push(party.clone());
    }

    pub(crate) fn unwatch(&mut self, party: &Party) {
        if let Some(pos) = self.watchers.iter().position(|p| p.same_as(party)) {
            self.watchers.swap_remove(pos);
        }
    }

    /// Marks all parties waiting on the channel as unblocked.
    ///
    /// This must be called whenever the state of the channel changes so that
    /// no party is counted as blocked while it may be able to progress. Each
    /// of them blocks again once it has re-examined the channel.
    pub(crate) fn notify_watchers(&self, ledger: &mut Ledger) {
        for party in &self.watchers {
            party.unblock(ledger, None);
        }
        ledger.mark_changed();
    }

    /// Drops all registrations and parked branches, except parked branches
    /// whose transfer was already committed and remains to be collected.
    fn evict_waiters(&mut self) {
        self.pending_token = None;
        self.get_waiter = None;
        self.put_waiter = None;
        for slot in [&mut self.parked_receive, &mut self.parked_send] {
            if slot.as_ref().map_or(false, |parked| !parked.committed) {
                *slot = None;
            }
        }
    }

    /// Returns the channel to its initial state.
    pub(crate) fn restart(&mut self) {
        *self = Self::new(self.info.clone());
    }
}

/// A handle to a rendezvous channel.
///
/// Handles are cheap to clone; all clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    director: Director,
    id: ChannelId,
    info: Arc<ChannelInfo>,
}

impl Channel {
    /// Name of the channel.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Identifier of the channel within its director.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Declared type of the tokens carried by the channel.
    pub fn element_type(&self) -> &TokenType {
        &self.info.element_type
    }

    /// The director governing the channel.
    pub fn director(&self) -> &Director {
        &self.director
    }

    /// Receives a token, blocking until a sender is ready.
    pub fn get(&self, cx: &Context) -> Result<Token, RendezvousError> {
        self.check_director(cx)?;

        let mut mon = self.director.shared.lock();
        let mut delivered = rendezvous(&mut mon, &cx.party(), &[self.id], Request::Get)?;

        delivered.pop().ok_or(RendezvousError::Terminated)
    }

    /// Sends a token, blocking until a receiver has taken it.
    ///
    /// The token is first converted to the element type of the channel.
    pub fn put(&self, cx: &Context, token: Token) -> Result<(), RendezvousError> {
        self.check_director(cx)?;
        let token = self.convert(&token)?;

        let mut mon = self.director.shared.lock();
        rendezvous(&mut mon, &cx.party(), &[self.id], Request::Put(vec![token]))?;

        Ok(())
    }

    /// Always returns `true`: readiness of a rendezvous cannot be observed
    /// without attempting it.
    pub fn has_room(&self) -> bool {
        true
    }

    /// Always returns `true`.
    pub fn has_room_for(&self, _count: usize) -> bool {
        true
    }

    /// Always returns `true`: readiness of a rendezvous cannot be observed
    /// without attempting it.
    pub fn has_token(&self) -> bool {
        true
    }

    /// Always returns `true`.
    pub fn has_tokens(&self, _count: usize) -> bool {
        true
    }

    /// Returns `true` if a receiver, plain or conditional, is waiting.
    pub fn is_read_blocked(&self) -> bool {
        let mon = self.director.shared.lock();

        mon.channels[self.id.0].is_occupied(Side::Get)
    }

    /// Returns `true` if a sender, plain or conditional, is waiting.
    pub fn is_write_blocked(&self) -> bool {
        let mon = self.director.shared.lock();

        mon.channels[self.id.0].is_occupied(Side::Put)
    }

    /// Returns `true` once [`request_finish()`](Channel::request_finish) was
    /// called and until the channel is reset.
    pub fn is_finished(&self) -> bool {
        let mon = self.director.shared.lock();

        mon.channels[self.id.0].finished
    }

    /// Forces termination of all operations on the channel.
    ///
    /// Pending and future operations return
    /// [`RendezvousError::Terminated`], and parked conditional branches are
    /// forgotten. A transfer already committed between two conditional
    /// branches still completes.
    pub fn request_finish(&self) {
        let mut mon = self.director.shared.lock();
        let kernel: &mut Kernel = &mut mon;
        let channel = &mut kernel.channels[self.id.0];
        channel.finished = true;
        channel.evict_waiters();
        channel.notify_watchers(&mut kernel.ledger);
        debug!(channel = %self.info.name, "finish requested");
    }

    /// Clears all waiter state and the finish request.
    ///
    /// Pending operations return [`RendezvousError::Terminated`] while
    /// future ones proceed normally. As with
    /// [`request_finish()`](Channel::request_finish), a transfer already
    /// committed between two conditional branches still completes.
    ///
    /// Channels are reset automatically at the beginning of each run.
    pub fn reset(&self) {
        let mut mon = self.director.shared.lock();
        let kernel: &mut Kernel = &mut mon;
        let channel = &mut kernel.channels[self.id.0];
        channel.finished = false;
        channel.evict_waiters();
        channel.notify_watchers(&mut kernel.ledger);
        debug!(channel = %self.info.name, "reset");
    }

    /// The boundary detector of the channel.
    pub fn boundary(&self) -> &BoundaryDetector {
        &self.info.boundary
    }

    /// Returns `true` if the channel is fed by a boundary port.
    pub fn is_connected_to_boundary(&self) -> bool {
        self.info.boundary.is_connected_to_boundary()
    }

    /// Returns `true` if the channel is fed from the inside of a boundary port.
    pub fn is_connected_to_boundary_inside(&self) -> bool {
        self.info.boundary.is_connected_to_boundary_inside()
    }

    /// Returns `true` if the channel is fed from the outside of a boundary
    /// port.
    pub fn is_connected_to_boundary_outside(&self) -> bool {
        self.info.boundary.is_connected_to_boundary_outside()
    }

    /// Returns `true` if the channel lives inside a boundary port.
    pub fn is_inside_boundary(&self) -> bool {
        self.info.boundary.is_inside_boundary()
    }

    /// Returns `true` if the channel lives outside a boundary port.
    pub fn is_outside_boundary(&self) -> bool {
        self.info.boundary.is_outside_boundary()
    }

    /// Returns `true` if the channel consumes data crossing a boundary.
    pub fn is_consumer(&self) -> bool {
        self.info.boundary.is_consumer()
    }

    /// Returns `true` if the channel produces data crossing a boundary.
    pub fn is_producer(&self) -> bool {
        self.info.boundary.is_producer()
    }

    pub(crate) fn convert(&self, token: &Token) -> Result<Token, RendezvousError> {
        token
            .convert(&self.info.element_type)
            .map_err(|source| RendezvousError::IllegalAction {
                channel: self.info.name.clone(),
                source,
            })
    }

    pub(crate) fn check_director(&self, cx: &Context) -> Result<(), RendezvousError> {
        if self.director.same_as(cx.director()) {
            Ok(())
        } else {
            Err(RendezvousError::ForeignChannel(self.info.name.clone()))
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.director.same_as(&other.director)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.info.name)
            .field("id", &self.id)
            .field("element_type", &self.info.element_type)
            .finish_non_exhaustive()
    }
}

/// Builder for a channel.
pub struct ChannelBuilder {
    director: Director,
    name: String,
    element_type: TokenType,
    boundary: BoundaryDetector,
}

impl ChannelBuilder {
    pub(crate) fn new(director: Director, name: String) -> Self {
        Self {
            director,
            name,
            element_type: TokenType::General,
            boundary: BoundaryDetector::default(),
        }
    }

    /// Sets the declared type of the tokens carried by the channel.
    pub fn element_type(mut self, element_type: TokenType) -> Self {
        self.element_type = element_type;

        self
    }

    /// Sets the kind of the ports connected by the channel.
    pub fn endpoints(mut self, source: PortKind, destination: PortKind) -> Self {
        self.boundary = BoundaryDetector::new(source, destination);

        self
    }

    /// Creates the channel.
    pub fn build(self) -> Channel {
        let info = Arc::new(ChannelInfo {
            name: self.name,
            element_type: self.element_type,
            boundary: self.boundary,
        });
        let mut mon = self.director.shared.lock();
        let id = ChannelId(mon.channels.insert(ChannelState::new(info.clone())));
        drop(mon);

        Channel {
            director: self.director,
            id,
            info,
        }
    }
}

impl fmt::Debug for ChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBuilder")
            .field("name", &self.name)
            .field("element_type", &self.element_type)
            .field("boundary", &self.boundary)
            .finish_non_exhaustive()
    }
}

/// Error returned by rendezvous operations.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RendezvousError {
    /// The execution is being wound down or the channel was finished.
    ///
    /// Processes are expected to propagate this error, which ends them
    /// cleanly.
    #[error("the rendezvous was terminated")]
    Terminated,
    /// A multi-channel operation was given no connected channel.
    #[error("a batch must contain at least one connected channel")]
    EmptyBatch,
    /// A channel appears more than once in a batch.
    #[error("channel `{0}` appears more than once in the batch")]
    DuplicateChannel(String),
    /// A channel governed by another director was used.
    #[error("channel `{0}` does not belong to the director of this process")]
    ForeignChannel(String),
    /// The supplied tokens do not match the shape of the batch.
    #[error("{supplied} token(s) supplied for row {row} of {expected} channel(s)")]
    TokenShape {
        /// Row of the batch.
        row: usize,
        /// Number of tokens supplied for the row.
        supplied: usize,
        /// Number of slots in the row.
        expected: usize,
    },
    /// Fewer tokens were supplied than requested.
    #[error("not enough tokens supplied: {supplied} available, {required} required")]
    NotEnoughTokens {
        /// Number of tokens supplied.
        supplied: usize,
        /// Number of tokens requested.
        required: usize,
    },
    /// A token could not be converted to the element type of a channel.
    #[error("illegal action on channel `{channel}`")]
    IllegalAction {
        /// Name of the channel.
        channel: String,
        /// The conversion failure.
        #[source]
        source: ConversionError,
    },
}

impl RendezvousError {
    /// Returns `true` for [`RendezvousError::Terminated`].
    pub fn is_terminated(&self) -> bool {
        matches!(self, RendezvousError::Terminated)
    }
}
