//! Bridge between a native torrent engine and the scheduling core
//!
//! The native engine reports piece progress through [`EngineEventSender`];
//! a single session actor applies those events to the [`PieceStore`] and the
//! schedulers of opened files, and priority decisions flow back out through
//! a [`PrioritySink`](crate::scheduler::PrioritySink).
//!
//! [`PieceStore`]: crate::pieces::PieceStore

pub mod actor;
pub mod commands;
pub mod handle;
mod priorities;

pub use actor::spawn_session;
pub use commands::{EngineEvent, SessionCommand, SessionError};
pub use handle::{EngineEventSender, FileHandle, SessionHandle};
