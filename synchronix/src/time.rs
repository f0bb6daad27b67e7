//! Model time.
//!
//! Processes share a single model time owned by their
//! [`Director`](crate::director::Director). Time only advances when all live
//! processes are either blocked on a rendezvous or delayed, at which point it
//! jumps to the earliest pending wake-up. It is expressed as a
//! [`MonotonicTime`], a monotonic timestamp based on the [TAI] time standard.
//!
//! [TAI]: https://en.wikipedia.org/wiki/International_Atomic_Time
//!
//!
//! # Examples
//!
//! A process that wakes up twice, one second apart.
//!
//! ```
//! use std::time::Duration;
//!
//! use synchronix::director::{DirectorInit, Termination};
//! use synchronix::time::MonotonicTime;
//!
//! let t0 = MonotonicTime::new(100, 0).unwrap();
//! let director = DirectorInit::new().start_time(t0).init();
//!
//! director.spawn("ticker", move |cx| {
//!     cx.delay(Duration::from_secs(1))?;
//!     assert_eq!(cx.time(), t0 + Duration::from_secs(1));
//!     cx.delay(Duration::from_secs(1))?;
//!     assert_eq!(cx.time(), t0 + Duration::from_secs(2));
//!
//!     Ok(())
//! });
//!
//! assert_eq!(director.run().unwrap(), Termination::Completed);
//! ```

pub use tai_time::MonotonicTime;
