//! `agents` crate: the `AgentDispatcher` seam between the orchestration
//! engine and whatever transport reaches the agent pool.
//!
//! The engine never talks to an agent directly: after a state transition has
//! committed it hands a [`DispatchRequest`] to an [`AgentDispatcher`].

pub mod error;
pub mod traits;
pub mod log;
pub mod mock;

pub use error::DispatchError;
pub use log::LogDispatcher;
pub use traits::{AgentDispatcher, DispatchRequest, SessionHandle};
