//! Run-time side of a lowered collective: launch arguments, scratch-buffer
//! packing, and per-kind execution over a [`CommBackend`](crate::backend::CommBackend).

mod args;
mod batched;
mod direct;
mod executor;
pub mod packing;
mod scratch;
mod varying;

pub use args::LaunchArgs;
pub use executor::Executor;
pub use packing::{Batch, Geometry, Slice, pack, round_up};
pub use scratch::{CclBuffer, ScratchGuard, ScratchPool};
