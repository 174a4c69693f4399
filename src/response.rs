//! The immutable result of a transfer.

use std::time::Duration;

use bytes::Bytes;

use crate::header::Header;
use crate::http::Version;
use crate::status::LiftStatus;

/// The outcome of one HTTP transaction: diagnostic status, HTTP status
/// code, observed version, ordered headers, body bytes and timing.
///
/// Immutable after delivery. A response whose status is not
/// [`LiftStatus::Success`] still carries whatever partial information the
/// transport captured before failing.
#[derive(Debug)]
pub struct Response {
    pub(crate) lift_status: LiftStatus,
    pub(crate) status_code: u32,
    pub(crate) version: Version,
    pub(crate) headers: Vec<Header>,
    pub(crate) body: Bytes,
    pub(crate) total_time: Duration,
    pub(crate) num_redirects: u32,
}

impl Response {
    pub(crate) fn new() -> Response {
        Response {
            lift_status: LiftStatus::Building,
            status_code: 0,
            version: Version::UseBest,
            headers: Vec::new(),
            body: Bytes::new(),
            total_time: Duration::ZERO,
            num_redirects: 0,
        }
    }

    /// Diagnostic status of the transfer.
    pub fn lift_status(&self) -> LiftStatus {
        self.lift_status
    }

    /// HTTP response status code, `0` when no response was received.
    pub fn status_code(&self) -> u32 {
        self.status_code
    }

    /// HTTP version observed on the response status line.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Response headers in arrival order; names may repeat, and redirect
    /// hops contribute their headers too.
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name().eq_ignore_ascii_case(name))
            .map(|h| h.value())
    }

    /// Response body bytes.
    pub fn data(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body bytes.
    pub fn into_data(self) -> Bytes {
        self.body
    }

    /// Total time the transfer took, including all redirect hops. For a
    /// timed-up request this is the wall-clock budget.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    /// Number of redirects followed.
    pub fn num_redirects(&self) -> u32 {
        self.num_redirects
    }
}
