//! # courier-supervisor
//!
//! Keeps a subscription to a messaging transport alive and feeds every new
//! inbound message to a handler exactly once per dedup horizon.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped → Starting → Listening → Restarting → (CircuitOpen) → Starting → …
//!                                        any state → ShuttingDown → Stopped
//! ```
//!
//! - [`StreamSupervisor`] / [`start`]: open the session, spawn the consume loop
//! - [`DedupCache`]: bounded set of recently handled message keys
//! - [`MessageDispatcher`]: filter, normalize, run the handler, send the reply
//! - [`RestartPolicy`]: backoff with jitter, then a circuit breaker
//! - [`ShutdownCoordinator`]: cooperative cancellation and start guard

pub mod backoff;
pub mod dedup;
pub mod dispatcher;
pub mod resync;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use backoff::{RestartDecision, RestartPolicy, RestartState};
pub use courier_core::errors::SupervisorError;
pub use dedup::{DedupCache, DeduplicationCache};
pub use dispatcher::{
    filter_message, handler_fn, DispatchOutcome, FnHandler, HandlerResult, MessageDispatcher,
    MessageHandler, SkipReason,
};
pub use resync::spawn_resync_task;
pub use shutdown::ShutdownCoordinator;
pub use state::{transition, SupervisorEvent, SupervisorState};
pub use supervisor::{
    start, FailureCallback, StreamSupervisor, SupervisorConfig, SupervisorHandle,
    SupervisorStatus,
};
