//! A CSP rendezvous kernel.
//!
//! Synchronix runs a set of sequential processes, each on its own thread, that
//! communicate exclusively through unbuffered rendezvous [channels]: a sender
//! blocks until a receiver takes its token and vice versa. On top of plain
//! `get` and `put`, it provides:
//!
//! * atomic multi-channel transfers, where a process exchanges tokens with
//!   several channels at once or not at all (see [`Batch`](channel::Batch)),
//! * guarded choice, where a process offers several sends and receives and
//!   exactly one of them is performed (see [`branch`]),
//! * global deadlock detection, including the resolution of artificial
//!   deadlocks caused by processes waiting for model [time] to advance,
//! * cooperative termination, which unwinds every blocked process.
//!
//! Tokens are dynamically typed [`Token`](data::Token)s, converted to the
//! declared element type of the channel they are sent to.
//!
//! [channels]: channel::Channel
//!
//! # A practical overview
//!
//! A [`Director`](director::Director) is the execution context shared by a
//! group of processes. Channels and processes are created from it, then
//! [`Director::run()`](director::Director::run) starts all processes and
//! returns once they have all exited, reporting how the execution ended.
//!
//! Each process receives a [`Context`](director::Context). Blocking operations
//! return [`RendezvousError::Terminated`](channel::RendezvousError::Terminated)
//! when the execution is wound down, which processes propagate with `?`.
//!
//! ```
//! use synchronix::branch::Guarded;
//! use synchronix::data::Token;
//! use synchronix::director::{DeadlockInfo, Director, Termination};
//!
//! let director = Director::new();
//! let numbers = director.channel("numbers");
//! let words = director.channel("words");
//!
//! let (tx1, tx2) = (numbers.clone(), words.clone());
//! director.spawn("numbers", move |cx| tx1.put(cx, Token::Int(1)));
//! director.spawn("words", move |cx| tx2.put(cx, Token::from("one")));
//!
//! director.spawn("merger", move |cx| {
//!     let mut received = Vec::new();
//!     loop {
//!         let chosen = cx
//!             .choose(vec![Guarded::receive(&numbers), Guarded::receive(&words)])?
//!             .unwrap();
//!         received.push(chosen.token.unwrap());
//!         if received.len() == 2 {
//!             break;
//!         }
//!     }
//!     assert!(received.contains(&Token::Int(1)));
//!     assert!(received.contains(&Token::from("one")));
//!
//!     // Nobody will ever send again: this is detected as a deadlock.
//!     cx.choose(vec![Guarded::receive(&numbers), Guarded::receive(&words)])?;
//!     unreachable!();
//! });
//!
//! match director.run().unwrap() {
//!     Termination::Deadlock(info) => assert_eq!(
//!         info,
//!         vec![DeadlockInfo {
//!             process: "merger".into(),
//!             channel: None
//!         }]
//!     ),
//!     other => panic!("unexpected termination: {:?}", other),
//! }
//! ```
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]

pub mod boundary;
pub mod branch;
pub mod channel;
pub mod data;
pub mod director;
pub mod time;
