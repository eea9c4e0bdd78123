//! Convergence primitives for kindling.
//!
//! This library provides the two waiting/converging pieces of the bootstrap
//! flow:
//!
//! - **Readiness gating**: [`ReadinessGate`] polls a cheap status predicate
//!   at a fixed interval and races it against an overall deadline.
//! - **Dependency reconciliation**: [`DependencyReconciler`] makes sure a
//!   chart's declared dependencies are materialized locally, fetching and
//!   reloading when they are not.
//!
//! # Invariants
//!
//! - The readiness gate never blocks past its deadline and never leaves its
//!   poller running after it returns
//! - Reconciliation is idempotent: a reconciled chart reconciles again
//!   without fetching
//! - Descriptors are replaced by reloads, never patched in place

mod dependencies;
mod readiness;

pub use dependencies::{
    DependencyFetcher, DependencyReconciler, ReconcileError, Reconciled, Reconciliation,
};
pub use readiness::{
    await_ready, ReadinessDeadline, ReadinessGate, DEFAULT_POLL_INTERVAL,
    DEFAULT_READINESS_TIMEOUT,
};
