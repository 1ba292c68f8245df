//! Exchange state machine subsystem.
//!
//! # Data Flow
//! ```text
//! codec event (headers / body / reset / timeout / close)
//!     → ConnectionHandle (picks the exchange by stream id or receipt order)
//!     → context.rs (ExchangeContext applies the event)
//!     → state.rs (pure transition: state × event → state + effects)
//!     → writer.rs (WriteCommands flushed in order to the ChannelWriter)
//!     → ExchangeNotice returned to the application
//! ```
//!
//! # Design Decisions
//! - One closed enum of states; a transition replaces the state value
//! - Illegal events are logged and dropped, never fatal to the connection
//! - Every exchange owns a single ordered outbound buffer, so an interim
//!   `100 Continue` can never overtake or trail the final response headers

pub mod context;
pub mod state;
pub mod writer;

pub use context::{ExchangeContext, ExchangeKey, ExchangeNotice, StreamId};
pub use state::{transition, Effect, ExchangeEvent, ExchangeFlags, ListenerState, Outcome, Transition};
pub use writer::{ChannelWriter, WriteCommand};
