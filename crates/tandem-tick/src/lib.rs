//! The session tick for Tandem.
//!
//! All session state is owned by one loop task. Besides reacting to events,
//! that loop wakes on a fixed tick to resolve "wait until" conditions:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(event) = events.recv() => state.handle(event),
//!         _ = scheduler.wait_for_tick() => {
//!             guards.check(&state);
//!             scheduler.record_tick_end();
//!         }
//!     }
//! }
//! ```

mod guard;
mod scheduler;

pub use guard::{GuardSet, GuardWaiter};
pub use scheduler::{TickConfig, TickInfo, TickScheduler};
