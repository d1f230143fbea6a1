//! The `ProcessBridge` trait: the seam between chat logic and the child.
//!
//! [`super::CommandSession`] is the production implementation. Higher
//! layers hold an `Arc<dyn ProcessBridge>` so they can be driven by a fake
//! in tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::process::{LaunchSpec, ProcessEvent};

/// Lazily produced response fragments.
///
/// The sequence ends after the last fragment or after yielding one error.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Command/response access to a long-lived interactive child process.
///
/// # Object Safety
///
/// Every method returns a concrete type or a boxed stream, so the trait can
/// be used as `dyn ProcessBridge`.
#[async_trait]
pub trait ProcessBridge: Send + Sync {
    /// Launch the child and wait for readiness.
    async fn start(&self, launch: &LaunchSpec) -> Result<()>;

    /// Send one command and return the complete response.
    async fn send(&self, command: &str, cancel: &CancellationToken) -> Result<String>;

    /// Send one command and return its response as a fragment stream.
    async fn send_streaming(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream>;

    /// Stop the child. A no-op when nothing is running.
    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> bool;

    /// Raw stdout/stderr lines, for diagnostics.
    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ProcessBridge) {}
};
