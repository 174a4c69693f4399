//! The request value object and its per-request options.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::LogicConflict;
use crate::executor;
use crate::header::Header;
use crate::http::{Method, Version};
use crate::mime::MimeField;
use crate::response::Response;
use crate::share::Share;

/// Completion callback for asynchronous execution. Ownership of the request
/// is transferred back to the caller together with the finished response.
pub type OnCompleteHandler = Box<dyn FnOnce(Box<Request>, Response) + Send + 'static>;

/// Periodic transfer progress callback:
/// `(download_total, download_now, upload_total, upload_now)`.
/// Returning `false` aborts the transfer.
pub type TransferProgressHandler = Arc<dyn Fn(u64, u64, u64, u64) -> bool + Send + Sync + 'static>;

/// TLS client certificate encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateType {
    Pem,
    Der,
}

impl CertificateType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            CertificateType::Pem => "PEM",
            CertificateType::Der => "DER",
        }
    }
}

/// Kind of HTTP proxy to connect through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Https,
}

impl ProxyType {
    pub(crate) fn scheme(self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
        }
    }
}

/// Authentication methods offered to a proxy. Multiple entries are OR'd
/// together into a single auth mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpAuthType {
    /// Basic HTTP authentication, the default when none is specified.
    Basic,
    /// All methods the transport was built with; it picks the most secure.
    Any,
    /// All "safe" methods, i.e. everything except Basic.
    AnySafe,
}

/// Proxy configuration for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyData {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Auth methods to offer; `None` means Basic.
    pub auth_types: Option<Vec<HttpAuthType>>,
}

/// Static DNS mapping applied before resolution: connections to
/// `host:port` use `ip_addr` directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveHost {
    host: String,
    port: u16,
    ip_addr: String,
}

impl ResolveHost {
    pub fn new(host: impl Into<String>, port: u16, ip_addr: impl Into<String>) -> ResolveHost {
        ResolveHost {
            host: host.into(),
            port,
            ip_addr: ip_addr.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip_addr(&self) -> &str {
        &self.ip_addr
    }

    /// Transport entry form, `HOST:PORT:ADDRESS`.
    pub(crate) fn to_wire(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.ip_addr)
    }
}

/// An HTTP transaction's inputs: URL, method, headers, body, TLS and proxy
/// parameters, timeouts and callbacks.
///
/// A request is a plain value until submitted. The blocking path borrows it
/// ([`perform`](Request::perform)); the asynchronous path takes ownership
/// through [`EventLoop::start_request`](crate::EventLoop::start_request)
/// and hands it back exactly once through the on-complete handler.
pub struct Request {
    url: String,
    method: Method,
    version: Version,
    timeout: Option<Duration>,
    timesup: Option<Duration>,
    follow_redirects: bool,
    /// -1 unbounded, 0 none, otherwise the exact bound.
    max_redirects: i64,
    verify_ssl_peer: bool,
    verify_ssl_host: bool,
    verify_ssl_status: bool,
    cert_file: Option<PathBuf>,
    cert_type: Option<CertificateType>,
    key_file: Option<PathBuf>,
    key_password: Option<String>,
    proxy: Option<ProxyData>,
    /// `Some(vec![])` means "all encodings the transport supports".
    accept_encodings: Option<Vec<String>>,
    resolve_hosts: Vec<ResolveHost>,
    headers: Vec<Header>,
    body: Option<Vec<u8>>,
    mime_fields: Vec<MimeField>,
    happy_eyeballs_timeout: Option<Duration>,
    on_complete: Option<OnCompleteHandler>,
    on_transfer_progress: Option<TransferProgressHandler>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Request {
        Request {
            url: url.into(),
            method: Method::Get,
            version: Version::UseBest,
            timeout: None,
            timesup: None,
            follow_redirects: true,
            max_redirects: -1,
            verify_ssl_peer: true,
            verify_ssl_host: true,
            verify_ssl_status: false,
            cert_file: None,
            cert_type: None,
            key_file: None,
            key_password: None,
            proxy: None,
            accept_encodings: None,
            resolve_hosts: Vec::new(),
            headers: Vec::new(),
            body: None,
            mime_fields: Vec::new(),
            happy_eyeballs_timeout: None,
            on_complete: None,
            on_transfer_progress: None,
        }
    }

    /// A request with a transport timeout. Without one the transfer can
    /// block for as long as the remote side stays silent.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Request {
        let mut request = Request::new(url);
        request.timeout = Some(timeout);
        request
    }

    /// Synchronously execute this request on the calling thread.
    ///
    /// Errors are folded into the response's [`LiftStatus`](crate::LiftStatus);
    /// the caller always receives a response.
    pub fn perform(&self) -> Response {
        executor::perform_blocking(self, None)
    }

    /// Like [`perform`](Request::perform), but transport caches created on
    /// behalf of `share` stay visible to later requests using the same share.
    pub fn perform_with(&self, share: &Share) -> Response {
        executor::perform_blocking(self, Some(share))
    }

    // ── URL / method / version ───────────────────────────────────────

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    // ── Time limits ──────────────────────────────────────────────────

    /// Transport-level timeout for the whole transfer.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Wall-clock budget, independent of transport I/O timeouts. When it
    /// elapses the completion callback fires with
    /// [`LiftStatus::TimesUp`](crate::LiftStatus::TimesUp).
    pub fn timesup(&self) -> Option<Duration> {
        self.timesup
    }

    pub fn set_timesup(&mut self, timesup: Option<Duration>) {
        self.timesup = timesup;
    }

    /// <https://en.wikipedia.org/wiki/Happy_Eyeballs>
    pub fn happy_eyeballs_timeout(&self) -> Option<Duration> {
        self.happy_eyeballs_timeout
    }

    pub fn set_happy_eyeballs_timeout(&mut self, timeout: Option<Duration>) {
        self.happy_eyeballs_timeout = timeout;
    }

    // ── Redirect policy ──────────────────────────────────────────────

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    /// -1 unbounded, 0 none, otherwise the exact bound.
    pub fn max_redirects(&self) -> i64 {
        self.max_redirects
    }

    /// Enable or disable following redirects. When enabling, `max` of
    /// `None` or any negative value means unbounded, `0` means none, and a
    /// positive value is the exact bound.
    pub fn set_follow_redirects(&mut self, enabled: bool, max: Option<i64>) {
        if enabled {
            self.follow_redirects = true;
            self.max_redirects = match max {
                Some(n) if n >= 0 => n,
                _ => -1,
            };
        } else {
            self.follow_redirects = false;
        }
    }

    // ── TLS ──────────────────────────────────────────────────────────

    pub fn verify_ssl_peer(&self) -> bool {
        self.verify_ssl_peer
    }

    /// Defaults to enabled.
    pub fn set_verify_ssl_peer(&mut self, verify: bool) {
        self.verify_ssl_peer = verify;
    }

    pub fn verify_ssl_host(&self) -> bool {
        self.verify_ssl_host
    }

    /// Defaults to enabled.
    pub fn set_verify_ssl_host(&mut self, verify: bool) {
        self.verify_ssl_host = verify;
    }

    pub fn verify_ssl_status(&self) -> bool {
        self.verify_ssl_status
    }

    /// Check the certificate's revocation status (OCSP stapling).
    /// Defaults to disabled.
    pub fn set_verify_ssl_status(&mut self, verify: bool) {
        self.verify_ssl_status = verify;
    }

    pub fn ssl_cert(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    pub fn set_ssl_cert(&mut self, cert_file: impl Into<PathBuf>) {
        self.cert_file = Some(cert_file.into());
    }

    pub fn ssl_cert_type(&self) -> Option<CertificateType> {
        self.cert_type
    }

    pub fn set_ssl_cert_type(&mut self, cert_type: CertificateType) {
        self.cert_type = Some(cert_type);
    }

    pub fn ssl_key(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    pub fn set_ssl_key(&mut self, key_file: impl Into<PathBuf>) {
        self.key_file = Some(key_file.into());
    }

    pub fn key_password(&self) -> Option<&str> {
        self.key_password.as_deref()
    }

    pub fn set_key_password(&mut self, password: impl Into<String>) {
        self.key_password = Some(password.into());
    }

    // ── Proxy / encodings / DNS ──────────────────────────────────────

    pub fn proxy(&self) -> Option<&ProxyData> {
        self.proxy.as_ref()
    }

    pub fn set_proxy(&mut self, proxy: ProxyData) {
        self.proxy = Some(proxy);
    }

    /// Currently requested Accept-Encoding values. `Some` with an empty
    /// list means "everything the transport supports".
    pub fn accept_encodings(&self) -> Option<&[String]> {
        self.accept_encodings.as_deref()
    }

    /// Mutually exclusive with adding an `Accept-Encoding` header manually.
    pub fn set_accept_encodings(&mut self, encodings: Option<Vec<String>>) {
        self.accept_encodings = encodings;
    }

    /// Request every encoding the transport was built with.
    pub fn accept_encoding_all_available(&mut self) {
        self.accept_encodings = Some(Vec::new());
    }

    pub fn resolve_hosts(&self) -> &[ResolveHost] {
        &self.resolve_hosts
    }

    /// Add a pre-resolved host to bypass DNS lookups.
    pub fn resolve_host(&mut self, resolve_host: ResolveHost) {
        self.resolve_hosts.push(resolve_host);
    }

    pub fn clear_resolve_hosts(&mut self) {
        self.resolve_hosts.clear();
    }

    // ── Headers / body ───────────────────────────────────────────────

    /// Append a request header. An empty `value` tells the transport to
    /// suppress its default header of that name.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    /// Suppress a header the transport would add by default, e.g.
    /// `Expect` or `Accept`.
    pub fn remove_header(&mut self, name: impl Into<String>) {
        self.header(name, "");
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn clear_headers(&mut self) {
        self.headers.clear();
    }

    /// The request body, empty if never set.
    pub fn data(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    /// Set the request body and force the method to POST. Override the
    /// method afterwards if a different verb is desired.
    ///
    /// Mutually exclusive with [`mime_field`](Request::mime_field).
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) -> Result<(), LogicConflict> {
        if !self.mime_fields.is_empty() {
            return Err(LogicConflict::BodyAfterMimeFields);
        }
        self.body = Some(data.into());
        self.method = Method::Post;
        Ok(())
    }

    pub fn mime_fields(&self) -> &[MimeField] {
        &self.mime_fields
    }

    /// Append a mime field. Mutually exclusive with
    /// [`set_data`](Request::set_data).
    pub fn mime_field(&mut self, field: MimeField) -> Result<(), LogicConflict> {
        if self.body.is_some() {
            return Err(LogicConflict::MimeFieldAfterBody);
        }
        self.mime_fields.push(field);
        Ok(())
    }

    // ── Callbacks ────────────────────────────────────────────────────

    /// Set the completion callback invoked when this request executes
    /// asynchronously. Unused by the blocking path.
    pub fn on_complete_handler<F>(&mut self, handler: F)
    where
        F: FnOnce(Box<Request>, Response) + Send + 'static,
    {
        self.on_complete = Some(Box::new(handler));
    }

    pub fn clear_on_complete_handler(&mut self) {
        self.on_complete = None;
    }

    /// Set a periodic transfer progress callback. Returning `false` from
    /// the callback aborts the transfer.
    pub fn transfer_progress_handler<F>(&mut self, handler: F)
    where
        F: Fn(u64, u64, u64, u64) -> bool + Send + Sync + 'static,
    {
        self.on_transfer_progress = Some(Arc::new(handler));
    }

    pub fn clear_transfer_progress_handler(&mut self) {
        self.on_transfer_progress = None;
    }

    pub(crate) fn take_on_complete(&mut self) -> Option<OnCompleteHandler> {
        self.on_complete.take()
    }

    pub(crate) fn progress_handler(&self) -> Option<TransferProgressHandler> {
        self.on_transfer_progress.clone()
    }

    pub(crate) fn body_data(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field("timesup", &self.timesup)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_forces_post() {
        let mut request = Request::new("http://localhost/");
        assert_eq!(request.method(), Method::Get);
        request.set_data("k=v").unwrap();
        assert_eq!(request.method(), Method::Post);
        assert_eq!(request.data(), b"k=v");
    }

    #[test]
    fn body_and_mime_fields_conflict() {
        let mut request = Request::new("http://localhost/");
        request.set_data("x").unwrap();
        assert_eq!(
            request.mime_field(MimeField::value("k", "v")),
            Err(LogicConflict::MimeFieldAfterBody)
        );

        let mut request = Request::new("http://localhost/");
        request.mime_field(MimeField::value("k", "v")).unwrap();
        assert_eq!(
            request.set_data("x"),
            Err(LogicConflict::BodyAfterMimeFields)
        );
        // The failed call left the request unchanged.
        assert!(request.data().is_empty());
        assert_eq!(request.mime_fields().len(), 1);
    }

    #[test]
    fn redirect_policy_normalization() {
        let mut request = Request::new("http://localhost/");
        assert!(request.follow_redirects());
        assert_eq!(request.max_redirects(), -1);

        request.set_follow_redirects(true, Some(5));
        assert_eq!(request.max_redirects(), 5);

        request.set_follow_redirects(true, Some(-17));
        assert_eq!(request.max_redirects(), -1);

        request.set_follow_redirects(true, Some(0));
        assert_eq!(request.max_redirects(), 0);

        request.set_follow_redirects(true, None);
        assert_eq!(request.max_redirects(), -1);

        request.set_follow_redirects(false, None);
        assert!(!request.follow_redirects());
    }

    #[test]
    fn remove_header_encodes_empty_value() {
        let mut request = Request::new("http://localhost/");
        request.remove_header("Expect");
        assert_eq!(request.headers().len(), 1);
        assert_eq!(request.headers()[0].name(), "Expect");
        assert_eq!(request.headers()[0].value(), "");
    }

    #[test]
    fn accept_encoding_all_is_empty_list() {
        let mut request = Request::new("http://localhost/");
        assert!(request.accept_encodings().is_none());
        request.accept_encoding_all_available();
        assert_eq!(request.accept_encodings(), Some(&[][..]));
    }
}
