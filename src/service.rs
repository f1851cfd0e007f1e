//! The lifecycle-hook collaborator a [`crate::runtime::Runtime`] drives
//! through `add_service` (spec.md §4.1's "service lifecycle hooks").
//!
//! A `Service` is the natural place for a protocol implementation to bind
//! its listeners: `on_start` receives the runtime and typically calls
//! `Runtime::add_listener` one or more times. Failures from lifecycle hooks
//! are logged and do not abort the runtime (spec.md §4.1's "log-and-continue
//! failure policy").

use std::sync::Arc;

use crate::error::Result;
use crate::runtime::Runtime;

pub trait Service: Send + 'static {
    /// Called once, synchronously, from [`Runtime::add_service`]. Bind
    /// listeners or UDP sockets here.
    fn on_start(&mut self, runtime: &Arc<Runtime>) -> Result<()>;

    /// Called during `Runtime::shutdown`. Errors are logged, never
    /// propagated — the runtime keeps tearing down regardless.
    fn on_shutdown(&mut self) {}
}
