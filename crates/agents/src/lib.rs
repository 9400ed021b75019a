//! `agents` crate — the `Capability` trait, the agent registry, and test doubles.
//!
//! Every agent task, built-in or user-supplied, must implement
//! [`Capability`]. The engine crate dispatches steps through
//! [`AgentRegistry::invoke`] and never depends on concrete agent types.

pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::{AgentError, InvokeError};
pub use registry::{Agent, AgentHandle, AgentRegistry, DEFAULT_CAPACITY};
pub use traits::{Capability, FnCapability, InvocationContext};
