//! Terminal diagnostic status carried by every response.

/// Diagnostic outcome of a transfer, attached to every
/// [`Response`](crate::Response).
///
/// Runtime failures are reported through this enum rather than raised; a
/// consumer always receives a response, and any status other than
/// [`Success`](LiftStatus::Success) still carries whatever partial
/// information the transport captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiftStatus {
    /// Transfer completed with a valid HTTP response.
    Success,
    /// The request is still being built; never observed by a consumer.
    Building,
    /// The request is executing; never observed by a consumer.
    Executing,
    /// Connection failed before any HTTP bytes were exchanged.
    ConnectError,
    /// Hostname resolution failed.
    ConnectDnsError,
    /// TLS negotiation or certificate verification failed.
    ConnectSslError,
    /// Transfer failed mid-body.
    DownloadError,
    /// Transport-level timeout, from the per-request `timeout`.
    Timeout,
    /// Wall-clock budget elapsed, from the per-request `timesup`.
    TimesUp,
    /// The request had no URL or was otherwise not startable.
    RequestEmpty,
    /// Residual failure kind.
    Error,
    /// The transport refused to start the transfer.
    ErrorFailedToStart,
}

impl LiftStatus {
    /// True only for a completed transfer with a valid HTTP response.
    pub fn is_success(self) -> bool {
        self == LiftStatus::Success
    }

    pub(crate) fn from_curl_result(result: Result<(), curl::Error>) -> LiftStatus {
        match result {
            Ok(()) => LiftStatus::Success,
            Err(err) => LiftStatus::from_curl_error(&err),
        }
    }

    pub(crate) fn from_curl_error(err: &curl::Error) -> LiftStatus {
        if err.is_operation_timedout() {
            LiftStatus::Timeout
        } else if err.is_couldnt_resolve_host() || err.is_couldnt_resolve_proxy() {
            LiftStatus::ConnectDnsError
        } else if err.is_ssl_connect_error()
            || err.is_peer_failed_verification()
            || err.is_ssl_certproblem()
        {
            LiftStatus::ConnectSslError
        } else if err.is_couldnt_connect() {
            LiftStatus::ConnectError
        } else if err.is_partial_file() || err.is_recv_error() || err.is_write_error() {
            LiftStatus::DownloadError
        } else if err.is_url_malformed() {
            LiftStatus::RequestEmpty
        } else if err.is_send_error() {
            LiftStatus::ErrorFailedToStart
        } else {
            LiftStatus::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_maps_to_success() {
        assert_eq!(LiftStatus::from_curl_result(Ok(())), LiftStatus::Success);
        assert!(LiftStatus::Success.is_success());
        assert!(!LiftStatus::Timeout.is_success());
    }
}
