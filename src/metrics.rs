//! Request lifecycle metrics.
//!
//! Counters for submissions and completions, exposed via Prometheus when
//! registered with an exposition endpoint.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "lift/requests/started",
    description = "Submissions accepted for asynchronous execution"
)]
pub static REQUESTS_STARTED: Counter = Counter::new();

#[metric(
    name = "lift/requests/completed",
    description = "Requests delivered with a transport outcome"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "lift/requests/timesup",
    description = "Requests delivered because their wall-clock budget elapsed"
)]
pub static REQUESTS_TIMESUP: Counter = Counter::new();

#[metric(
    name = "lift/requests/failed_to_start",
    description = "Requests the transport refused to start"
)]
pub static REQUESTS_FAILED_TO_START: Counter = Counter::new();

#[metric(
    name = "lift/requests/rejected",
    description = "Submissions rejected because the loop was stopping"
)]
pub static REQUESTS_REJECTED: Counter = Counter::new();

#[metric(
    name = "lift/requests/active",
    description = "Submissions accepted but not yet destroyed"
)]
pub static REQUESTS_ACTIVE: Gauge = Gauge::new();
