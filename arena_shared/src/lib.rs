//! `arena_shared`
//!
//! Shared netcode libraries used by both client and server.
//!
//! Design goals:
//! - Single-threaded cooperative core: every socket operation either makes
//!   progress, reports `would_block` for the next tick, or fails fatally.
//! - Explicitly passed context (clock, config, session) instead of
//!   process-wide singletons.
//! - No `unsafe`.

pub mod clock;
pub mod config;
pub mod packet;
pub mod sender;
pub mod session;
pub mod tank;
pub mod tcp;
pub mod timesync;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::clock::*;
    pub use crate::config::*;
    pub use crate::packet::*;
    pub use crate::sender::*;
    pub use crate::session::*;
    pub use crate::wire::*;
}
