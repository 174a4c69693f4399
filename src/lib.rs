//! lift-http — HTTP/1.1 and HTTP/2 client over a libcurl transport.
//!
//! Two execution modes share one request abstraction:
//!
//! - **Blocking**: [`Request::perform`] drives a single transfer on the
//!   calling thread and returns a [`Response`].
//! - **Event-driven**: an [`EventLoop`] owns one I/O thread and
//!   multiplexes hundreds of in-flight requests over it. Submissions move
//!   ownership of the request into the loop; the on-complete handler
//!   receives it back, exactly once, together with the response.
//!
//! Every response carries a [`LiftStatus`] diagnostic; runtime failures
//! are reported there rather than raised.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use lift_http::{EventLoop, GlobalScopeInitializer, Request};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), lift_http::Error> {
//!     let _lift = GlobalScopeInitializer::new();
//!
//!     // Blocking.
//!     let response = Request::with_timeout("http://example.com/", Duration::from_secs(5)).perform();
//!     println!("{}", response.status_code());
//!
//!     // Event-driven.
//!     let loop_ = EventLoop::new(lift_http::Config::default())?;
//!     let mut request = Request::with_timeout("http://example.com/", Duration::from_secs(5));
//!     request.on_complete_handler(|_request, response| {
//!         println!("async: {}", response.status_code());
//!     });
//!     assert!(loop_.start_request(Box::new(request)));
//!     Ok(())
//! }
//! ```

pub(crate) mod executor;
pub(crate) mod handler;
pub(crate) mod poller;

pub mod error;
pub mod event_loop;
pub mod header;
pub mod http;
pub mod metrics;
pub mod mime;
pub mod request;
pub mod response;
pub mod share;
pub mod status;

/// Loop construction errors.
pub use error::Error;
/// Body-vs-mime-fields misuse error.
pub use error::LogicConflict;
/// Event loop configuration.
pub use event_loop::Config;
/// Builder for [`Config`].
pub use event_loop::ConfigBuilder;
/// The asynchronous execution engine.
pub use event_loop::EventLoop;
/// A single HTTP header pair.
pub use header::Header;
/// HTTP request method.
pub use http::Method;
/// HTTP version selection / observation.
pub use http::Version;
/// One multipart form field.
pub use mime::MimeField;
/// Inline value or file path behind a mime field.
pub use mime::MimeSource;
/// TLS certificate encoding.
pub use request::CertificateType;
/// Proxy auth methods.
pub use request::HttpAuthType;
/// Completion callback type.
pub use request::OnCompleteHandler;
/// Proxy parameters.
pub use request::ProxyData;
/// Proxy kind.
pub use request::ProxyType;
/// An HTTP transaction's inputs.
pub use request::Request;
/// Pre-resolved DNS entry.
pub use request::ResolveHost;
/// Transfer progress callback type.
pub use request::TransferProgressHandler;
/// The result of a transfer.
pub use response::Response;
/// Shared connection/DNS/session caches.
pub use share::Share;
/// Terminal diagnostic status.
pub use status::LiftStatus;

/// Scoped acquisition of process-wide transport initialization.
///
/// Construct one before any other use of the library and keep it alive
/// for as long as the library is in use.
pub struct GlobalScopeInitializer {
    _priv: (),
}

impl GlobalScopeInitializer {
    pub fn new() -> GlobalScopeInitializer {
        curl::init();
        GlobalScopeInitializer { _priv: () }
    }
}

impl Default for GlobalScopeInitializer {
    fn default() -> GlobalScopeInitializer {
        GlobalScopeInitializer::new()
    }
}
