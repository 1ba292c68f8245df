//! Ordered response flushing for pipelined HTTP/1.1.
//!
//! # Data Flow
//! ```text
//! ConnectionHandle (exchanges complete in any order)
//!     → PipelinedWriter (per-connection task on the pipelining group)
//!     → sequencer.rs (holds later responses until earlier ones end)
//!     → connection writer, in request order
//! ```
//!
//! # Design Decisions
//! - The reorder buffer is a plain value; the writer task only moves commands
//! - Multiplexed streams and connection-level commands pass straight through

pub mod sequencer;
pub mod writer;

pub use sequencer::ResponseSequencer;
pub use writer::PipelinedWriter;
