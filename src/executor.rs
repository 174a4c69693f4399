//! Binds a request to a transport handle and drives it to a response.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use curl::easy::{Auth, Easy2, Form, List};

use crate::handler::Collector;
use crate::http::Method;
use crate::mime::{MimeField, MimeSource};
use crate::request::{HttpAuthType, Request, ResolveHost};
use crate::response::Response;
use crate::share::Share;
use crate::status::LiftStatus;

// Option ids the safe binding does not cover; the values are part of
// libcurl's stable option ABI.
const CURLOPT_SSL_VERIFYSTATUS: curl_sys::CURLoption = 232;
const CURLOPT_HAPPY_EYEBALLS_TIMEOUT_MS: curl_sys::CURLoption = 271;

/// Per-request state owned by the event loop between submission and
/// delivery.
///
/// Created and configured on the submitter's thread, then touched only by
/// the I/O thread: the easy handle moves into the multi on arming, the
/// request moves out exactly once on delivery, and the `delivered` flag
/// arbitrates the race between normal completion and time's-up expiry.
pub(crate) struct Executor {
    pub(crate) request: Option<Box<Request>>,
    pub(crate) easy: Option<Easy2<Collector>>,
    pub(crate) response: Response,
    /// Key of this executor's entry in the loop's time's-up index.
    pub(crate) timesup_key: Option<(u64, u64)>,
    /// One-shot completion flag; the loser of the normal/time's-up race
    /// only cleans up data structures.
    pub(crate) delivered: bool,
    /// Set when configuration failed on the submitter's thread; the drain
    /// completes such executors immediately instead of arming them.
    pub(crate) prepare_error: Option<LiftStatus>,
}

impl Executor {
    /// Configure `easy` from the request on the calling thread, so the
    /// I/O thread never pays for configuration work.
    pub(crate) fn prepare(
        request: Box<Request>,
        mut easy: Easy2<Collector>,
        loop_resolve: &[ResolveHost],
    ) -> Executor {
        easy.reset();
        easy.get_mut().begin(request.progress_handler());

        let prepare_error = if request.url().is_empty() {
            Some(LiftStatus::RequestEmpty)
        } else {
            match configure(&mut easy, &request, loop_resolve) {
                Ok(()) => None,
                Err(err) => {
                    tracing::debug!(url = request.url(), error = %err, "request configuration rejected");
                    Some(LiftStatus::ErrorFailedToStart)
                }
            }
        };

        Executor {
            request: Some(request),
            easy: Some(easy),
            response: Response::new(),
            timesup_key: None,
            delivered: false,
            prepare_error,
        }
    }

    /// Synthesize the delivery for an elapsed wall-clock budget: status
    /// only, timing equal to the budget, no transport data.
    pub(crate) fn timesup_response(&mut self, budget: Duration) -> Response {
        let mut response = std::mem::replace(&mut self.response, Response::new());
        response.lift_status = LiftStatus::TimesUp;
        response.total_time = budget;
        response
    }
}

/// The blocking path: configure a handle, run the transfer on the calling
/// thread, and fold any failure into the response status.
pub(crate) fn perform_blocking(request: &Request, share: Option<&Share>) -> Response {
    let mut easy = share
        .and_then(Share::lease)
        .unwrap_or_else(|| Easy2::new(Collector::new()));
    easy.reset();
    easy.get_mut().begin(request.progress_handler());

    let mut response = Response::new();
    if request.url().is_empty() {
        response.lift_status = LiftStatus::RequestEmpty;
    } else if let Err(err) = configure(&mut easy, request, &[]) {
        tracing::debug!(url = request.url(), error = %err, "request configuration rejected");
        response.lift_status = LiftStatus::ErrorFailedToStart;
    } else {
        let result = easy.perform();
        finish(&mut easy, &mut response, result);
    }

    if let Some(share) = share {
        share.restore(easy);
    }
    response
}

/// Extract status, headers, body and timing from a handle whose transfer
/// has ended, terminal status included.
pub(crate) fn finish(
    easy: &mut Easy2<Collector>,
    response: &mut Response,
    result: Result<(), curl::Error>,
) {
    response.lift_status = LiftStatus::from_curl_result(result);
    response.status_code = easy.response_code().unwrap_or(0);
    response.total_time = easy.total_time().unwrap_or(Duration::ZERO);
    response.num_redirects = easy.redirect_count().unwrap_or(0);

    let (headers, body, version) = easy.get_mut().harvest();
    response.headers = headers;
    response.body = Bytes::from(body);
    response.version = version;
}

/// Apply every request knob to the easy handle, in the fixed order the
/// transfer contract requires: url, happy-eyeballs, method, version,
/// timeout, redirects, TLS, client cert/key, proxy, encodings, resolve
/// entries, headers, body or mime fields, progress.
fn configure(
    easy: &mut Easy2<Collector>,
    request: &Request,
    loop_resolve: &[ResolveHost],
) -> Result<(), ConfigError> {
    easy.signal(false)?;
    easy.url(request.url())?;

    if let Some(timeout) = request.happy_eyeballs_timeout() {
        setopt_long(
            easy,
            CURLOPT_HAPPY_EYEBALLS_TIMEOUT_MS,
            timeout.as_millis() as libc::c_long,
            "happy_eyeballs_timeout_ms",
        )?;
    }

    match request.method() {
        Method::Get => easy.get(true)?,
        Method::Head => easy.nobody(true)?,
        Method::Post => easy.post(true)?,
        method => easy.custom_request(method.as_str())?,
    }

    easy.http_version(request.version().to_curl())?;

    if let Some(timeout) = request.timeout() {
        easy.timeout(timeout)?;
    }

    easy.follow_location(request.follow_redirects())?;
    if request.follow_redirects() && request.max_redirects() >= 0 {
        easy.max_redirections(request.max_redirects() as u32)?;
    }

    easy.ssl_verify_peer(request.verify_ssl_peer())?;
    easy.ssl_verify_host(request.verify_ssl_host())?;
    setopt_long(
        easy,
        CURLOPT_SSL_VERIFYSTATUS,
        request.verify_ssl_status() as libc::c_long,
        "ssl_verifystatus",
    )?;

    if let Some(cert) = request.ssl_cert() {
        easy.ssl_cert(cert)?;
        if let Some(cert_type) = request.ssl_cert_type() {
            easy.ssl_cert_type(cert_type.as_str())?;
        }
    }
    if let Some(key) = request.ssl_key() {
        easy.ssl_key(key)?;
    }
    if let Some(password) = request.key_password() {
        easy.key_password(password)?;
    }

    if let Some(proxy) = request.proxy() {
        easy.proxy(&format!("{}://{}", proxy.proxy_type.scheme(), proxy.host))?;
        easy.proxy_port(proxy.port)?;
        if let Some(username) = &proxy.username {
            easy.proxy_username(username)?;
        }
        if let Some(password) = &proxy.password {
            easy.proxy_password(password)?;
        }
        easy.proxy_auth(&proxy_auth_mask(proxy.auth_types.as_deref()))?;
    }

    if let Some(encodings) = request.accept_encodings() {
        // An empty list asks for every encoding the transport supports.
        easy.accept_encoding(&encodings.join(", "))?;
    }

    if !loop_resolve.is_empty() || !request.resolve_hosts().is_empty() {
        let mut list = List::new();
        for entry in loop_resolve.iter().chain(request.resolve_hosts()) {
            list.append(&entry.to_wire())?;
        }
        easy.resolve(list)?;
    }

    if !request.headers().is_empty() {
        let mut list = List::new();
        for header in request.headers() {
            list.append(&header.to_wire())?;
        }
        easy.http_headers(list)?;
    }

    if let Some(body) = request.body_data() {
        easy.post_fields_copy(body)?;
    } else if !request.mime_fields().is_empty() {
        easy.httppost(build_form(request.mime_fields())?)?;
    }

    if request.progress_handler().is_some() {
        easy.progress(true)?;
    }

    Ok(())
}

/// OR the requested auth methods into a single mask, Basic when none are
/// specified.
fn proxy_auth_mask(types: Option<&[HttpAuthType]>) -> Auth {
    let mut auth = Auth::new();
    match types {
        None => {
            auth.basic(true);
        }
        Some(types) => {
            for auth_type in types {
                match auth_type {
                    HttpAuthType::Basic => {
                        auth.basic(true);
                    }
                    HttpAuthType::Any => {
                        auth.basic(true).digest(true).gssnegotiate(true).ntlm(true);
                    }
                    HttpAuthType::AnySafe => {
                        auth.digest(true).gssnegotiate(true).ntlm(true);
                    }
                }
            }
        }
    }
    auth
}

fn build_form(fields: &[MimeField]) -> Result<Form, ConfigError> {
    let mut form = Form::new();
    for field in fields {
        match field.source() {
            MimeSource::Value(value) => form.part(field.name()).contents(value.as_bytes()).add()?,
            MimeSource::File(path) => form.part(field.name()).file(path).add()?,
        }
    }
    Ok(form)
}

fn setopt_long(
    easy: &Easy2<Collector>,
    option: curl_sys::CURLoption,
    value: libc::c_long,
    name: &'static str,
) -> Result<(), ConfigError> {
    let rc = unsafe { curl_sys::curl_easy_setopt(easy.raw(), option, value) };
    if rc == curl_sys::CURLE_OK {
        Ok(())
    } else {
        Err(ConfigError::Option(name))
    }
}

#[derive(Debug)]
enum ConfigError {
    Curl(curl::Error),
    Form(curl::FormError),
    Option(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Curl(err) => err.fmt(f),
            ConfigError::Form(err) => err.fmt(f),
            ConfigError::Option(name) => write!(f, "transport rejected option {name}"),
        }
    }
}

impl From<curl::Error> for ConfigError {
    fn from(err: curl::Error) -> ConfigError {
        ConfigError::Curl(err)
    }
}

impl From<curl::FormError> for ConfigError {
    fn from(err: curl::FormError) -> ConfigError {
        ConfigError::Form(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_never_touches_the_network() {
        let response = perform_blocking(&Request::new(""), None);
        assert_eq!(response.lift_status(), LiftStatus::RequestEmpty);
        assert_eq!(response.status_code(), 0);
        assert!(response.data().is_empty());
    }

    #[test]
    fn prepared_executor_records_empty_url() {
        let executor = Executor::prepare(
            Box::new(Request::new("")),
            Easy2::new(Collector::new()),
            &[],
        );
        assert_eq!(executor.prepare_error, Some(LiftStatus::RequestEmpty));
        assert!(!executor.delivered);
    }

    #[test]
    fn timesup_response_carries_the_budget() {
        let mut executor = Executor::prepare(
            Box::new(Request::new("http://localhost/")),
            Easy2::new(Collector::new()),
            &[],
        );
        let response = executor.timesup_response(Duration::from_millis(50));
        assert_eq!(response.lift_status(), LiftStatus::TimesUp);
        assert_eq!(response.total_time(), Duration::from_millis(50));
        assert_eq!(response.status_code(), 0);
    }
}
