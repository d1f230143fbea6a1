//! Core of parley: a request/response bridge to a long-lived, line-oriented
//! chat model process.
//!
//! Layers, bottom up:
//!
//! - [`classify`] sorts raw output lines into markers, prompts, noise, and content.
//! - [`process`] launches and tears down the child and routes its output.
//! - [`session`] serializes commands and decides when each response is done.
//! - [`filter`] cleans streamed responses down to the assistant's turn.
//! - [`chat`] starts the model with an adapter and offers chat operations.

pub mod adapter;
pub mod chat;
pub mod classify;
pub mod error;
pub mod filter;
pub mod process;
pub mod session;

pub use adapter::AdapterInfo;
pub use chat::{ChatService, ModelPaths, ServiceEvent, SpecialCommand};
pub use classify::{LineKind, OutputLine, classify_line};
pub use error::{BridgeError, Result};
pub use filter::{FilterConfig, ResponseStreamFilter};
pub use process::{LaunchSpec, ProcessEvent, ProcessSupervisor, SupervisorConfig};
pub use session::{CommandSession, FragmentStream, ProcessBridge, SessionConfig};
