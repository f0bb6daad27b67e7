//! Atomic multi-channel transfers.
//!
//! A batch registers its party on every channel it spans and then waits until
//! it can be committed. Commitment is decided over the whole connected set of
//! batches reachable through matching registrations: a put batch spanning
//! channels that are each awaited by different get batches can only complete
//! together with all of them, so the commit check walks this set and transfers
//! all tokens only if every channel of every batch has a counterpart.
use std::collections::HashSet;

use tracing::trace;

use crate::data::Token;
use crate::director::{Context, Kernel, Monitor};

use super::{Channel, ChannelId, Party, Registration, RendezvousError, Side};

/// Tokens returned by a multi-channel receive, shaped like the batch.
pub type TokenGrid = Vec<Vec<Option<Token>>>;

/// A two-dimensional set of channels operated on atomically.
///
/// A `None` slot stands for an unconnected position and is skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    rows: Vec<Vec<Option<Channel>>>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a batch with a single channel.
    pub fn single(channel: &Channel) -> Self {
        Self::new().with_row([Some(channel.clone())])
    }

    /// Creates a batch with a single row holding all the channels.
    pub fn row(channels: &[Channel]) -> Self {
        Self::new().with_row(channels.iter().cloned().map(Some))
    }

    /// Creates a batch with one channel per row.
    pub fn column(channels: &[Channel]) -> Self {
        channels
            .iter()
            .fold(Self::new(), |batch, channel| batch.with_row([Some(channel.clone())]))
    }

    /// Appends a row.
    pub fn with_row<I>(mut self, row: I) -> Self
    where
        I: IntoIterator<Item = Option<Channel>>,
    {
        self.rows.push(row.into_iter().collect());

        self
    }

    /// The rows of the batch.
    pub fn rows(&self) -> &[Vec<Option<Channel>>] {
        &self.rows
    }

    /// Connected slots as `(row, column, channel)`, in row-major order.
    fn slots(&self) -> impl Iterator<Item = (usize, usize, &Channel)> {
        self.rows.iter().enumerate().flat_map(|(i, row)| {
            row.iter()
                .enumerate()
                .filter_map(move |(j, slot)| slot.as_ref().map(|channel| (i, j, channel)))
        })
    }

    /// Validates the batch against the calling process and returns the
    /// identifiers of its connected channels.
    fn channel_ids(&self, cx: &Context) -> Result<Vec<ChannelId>, RendezvousError> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for (_, _, channel) in self.slots() {
            channel.check_director(cx)?;
            if !seen.insert(channel.id()) {
                return Err(RendezvousError::DuplicateChannel(channel.name().to_owned()));
            }
            ids.push(channel.id());
        }
        if ids.is_empty() {
            return Err(RendezvousError::EmptyBatch);
        }

        Ok(ids)
    }

    /// Assigns a converted token to each connected slot.
    fn assign(&self, tokens: &[Vec<Token>]) -> Result<Vec<Token>, RendezvousError> {
        let mut assigned = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            if row.iter().all(Option::is_none) {
                continue;
            }
            let row_tokens = match tokens.get(i) {
                Some(row_tokens) => row_tokens,
                None if tokens.len() == 1 => &tokens[0],
                None => {
                    return Err(RendezvousError::TokenShape {
                        row: i,
                        supplied: 0,
                        expected: row.len(),
                    })
                }
            };
            for (j, slot) in row.iter().enumerate() {
                let Some(channel) = slot else {
                    continue;
                };
                let token = match row_tokens.get(j) {
                    Some(token) => token,
                    None if row_tokens.len() == 1 => &row_tokens[0],
                    None => {
                        return Err(RendezvousError::TokenShape {
                            row: i,
                            supplied: row_tokens.len(),
                            expected: row.len(),
                        })
                    }
                };
                assigned.push(channel.convert(token)?);
            }
        }

        Ok(assigned)
    }
}

impl From<Vec<Vec<Option<Channel>>>> for Batch {
    fn from(rows: Vec<Vec<Option<Channel>>>) -> Self {
        Self { rows }
    }
}

pub(crate) fn get_from_all(cx: &Context, batch: &Batch) -> Result<TokenGrid, RendezvousError> {
    let ids = batch.channel_ids(cx)?;

    let mut mon = cx.director().shared.lock();
    let delivered = rendezvous(&mut mon, &cx.party(), &ids, Request::Get)?;
    drop(mon);

    let mut grid: TokenGrid = batch.rows.iter().map(|row| vec![None; row.len()]).collect();
    for ((i, j, _), token) in batch.slots().zip(delivered) {
        grid[i][j] = Some(token);
    }

    Ok(grid)
}

pub(crate) fn put_to_all(
    cx: &Context,
    tokens: &[Vec<Token>],
    batch: &Batch,
) -> Result<(), RendezvousError> {
    let ids = batch.channel_ids(cx)?;
    let tokens = batch.assign(tokens)?;

    let mut mon = cx.director().shared.lock();
    rendezvous(&mut mon, &cx.party(), &ids, Request::Put(tokens))?;

    Ok(())
}

/// The operation requested by a batch.
#[derive(Debug)]
pub(crate) enum Request {
    Get,
    /// Tokens for each channel, already converted.
    Put(Vec<Token>),
}

/// A batch waiting to be committed.
pub(crate) struct BatchState {
    party: Party,
    side: Side,
    channels: Vec<ChannelId>,
    delivered: Vec<Token>,
    done: bool,
}

/// Registers `party` on every channel and blocks until the whole batch was
/// transferred.
///
/// Returns the received tokens in channel order for a get, and nothing for a
/// put.
pub(crate) fn rendezvous(
    mon: &mut Monitor<'_>,
    party: &Party,
    channels: &[ChannelId],
    request: Request,
) -> Result<Vec<Token>, RendezvousError> {
    let (side, tokens) = match request {
        Request::Get => (Side::Get, Vec::new()),
        Request::Put(tokens) => (Side::Put, tokens),
    };
    mon.check_stop(channels)?;

    // At most one operation may be in flight on each side of a channel.
    while let Some(&busy) = channels
        .iter()
        .find(|id| mon.channels[id.0].is_occupied(side))
    {
        mon.wait_blocked(party, Some(busy), channels)?;
    }

    let kernel: &mut Kernel = mon;
    let batch = kernel.batches.insert(BatchState {
        party: party.clone(),
        side,
        channels: channels.to_vec(),
        delivered: Vec::new(),
        done: false,
    });
    let mut tokens = tokens.into_iter();
    for id in channels {
        let channel = &mut kernel.channels[id.0];
        *channel.plain_mut(side) = Some(Registration { batch });
        if side == Side::Put {
            channel.pending_token = tokens.next();
        }
        // A conditional branch parked on the other side can now commit.
        channel.notify_watchers(&mut kernel.ledger);
        trace!(channel = %channel.info.name, ?side, "registered");
    }

    loop {
        if mon.batches[batch].done || commit(mon, batch) {
            break;
        }
        let waiting_on = channels
            .iter()
            .copied()
            .find(|id| mon.channels[id.0].plain(side.opposite()).is_none());

        let mut waited = mon.wait_blocked(party, waiting_on, channels);
        // A reset may have cleared some of the registrations.
        if waited.is_ok() && !is_registered(mon, batch) {
            waited = Err(RendezvousError::Terminated);
        }
        if let Err(err) = waited {
            // The transfer may have been committed by the other side just
            // before the stop.
            if mon.batches[batch].done {
                break;
            }
            withdraw(mon, batch);
            return Err(err);
        }
    }

    Ok(mon.batches.remove(batch).delivered)
}

/// Commits `root` together with all the batches it is matched against if
/// every one of these has a counterpart on each of its channels.
fn commit(kernel: &mut Kernel, root: usize) -> bool {
    let mut component = vec![root];
    let mut i = 0;
    while i < component.len() {
        let state = &kernel.batches[component[i]];
        i += 1;
        for id in &state.channels {
            let Some(partner) = kernel.channels[id.0].plain(state.side.opposite()) else {
                return false;
            };
            if !component.contains(&partner.batch) {
                component.push(partner.batch);
            }
        }
    }

    // Every batch is ready: transfer in channel order.
    for &batch in &component {
        let state = &mut kernel.batches[batch];
        for id in &state.channels {
            let channel = &mut kernel.channels[id.0];
            if state.side == Side::Get {
                if let Some(token) = channel.pending_token.take() {
                    state.delivered.push(token);
                }
            }
            *channel.plain_mut(state.side) = None;
            channel.notify_watchers(&mut kernel.ledger);
        }
        state.done = true;
    }
    for &batch in &component[1..] {
        kernel.batches[batch].party.unblock(&mut kernel.ledger, None);
    }
    trace!(batches = component.len(), "rendezvous committed");

    true
}

fn is_registered(kernel: &Kernel, batch: usize) -> bool {
    let state = &kernel.batches[batch];

    state.channels.iter().all(|id| {
        kernel.channels[id.0]
            .plain(state.side)
            .map_or(false, |registration| registration.batch == batch)
    })
}

/// Removes the registrations of an uncommitted batch.
fn withdraw(kernel: &mut Kernel, batch: usize) {
    let state = kernel.batches.remove(batch);
    for id in &state.channels {
        let Some(channel) = kernel.channels.get_mut(id.0) else {
            continue;
        };
        if channel.plain(state.side).map_or(false, |r| r.batch == batch) {
            *channel.plain_mut(state.side) = None;
            if state.side == Side::Put {
                channel.pending_token = None;
            }
            channel.notify_watchers(&mut kernel.ledger);
        }
    }
}
