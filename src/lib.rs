//! Durable hook-event queue and background conversation correlator
//!
//! Producers (Claude Code hooks) drop one file per event into a queue
//! directory via [`queue::QueueWriter`]. A [`daemon::Daemon`] drains the
//! queue and the [`correlator::Correlator`] rebuilds conversations
//! (prompt → tool calls → response) in a [`store::PersistenceAdapter`].

pub mod config;
pub mod correlator;
pub mod daemon;
pub mod envelope;
pub mod health;
pub mod hook;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod util;
pub mod watcher;
