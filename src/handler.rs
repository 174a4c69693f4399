//! Transfer callbacks: accumulates the response as the transport produces it.

use curl::easy::{Handler, WriteError};

use crate::header::Header;
use crate::http::Version;
use crate::request::TransferProgressHandler;

/// The handler installed on every easy handle. Buffers body bytes, parses
/// response header lines, captures the HTTP version from the status line
/// and forwards transfer progress to the request's callback.
pub(crate) struct Collector {
    body: Vec<u8>,
    headers: Vec<Header>,
    version: Version,
    progress: Option<TransferProgressHandler>,
}

impl Collector {
    pub(crate) fn new() -> Collector {
        Collector {
            body: Vec::new(),
            headers: Vec::new(),
            version: Version::UseBest,
            progress: None,
        }
    }

    /// Reset accumulated state for a fresh transfer on a recycled handle.
    pub(crate) fn begin(&mut self, progress: Option<TransferProgressHandler>) {
        self.body.clear();
        self.headers.clear();
        self.version = Version::UseBest;
        self.progress = progress;
    }

    /// Take everything accumulated, leaving the collector empty for reuse.
    pub(crate) fn harvest(&mut self) -> (Vec<Header>, Vec<u8>, Version) {
        self.progress = None;
        (
            std::mem::take(&mut self.headers),
            std::mem::take(&mut self.body),
            std::mem::replace(&mut self.version, Version::UseBest),
        )
    }
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        let line = String::from_utf8_lossy(data);
        let line = line.trim_end_matches(['\r', '\n']);
        if line.starts_with("HTTP/") {
            let token = line.split(' ').next().unwrap_or(line);
            if let Some(version) = Version::from_status_line(token) {
                self.version = version;
            }
        } else if let Some(header) = Header::parse(line) {
            self.headers.push(header);
        }
        true
    }

    fn progress(&mut self, dltotal: f64, dlnow: f64, ultotal: f64, ulnow: f64) -> bool {
        match &self.progress {
            Some(handler) => handler(dltotal as u64, dlnow as u64, ultotal as u64, ulnow as u64),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_headers_and_version() {
        let mut collector = Collector::new();
        collector.begin(None);

        assert!(collector.header(b"HTTP/1.1 200 OK\r\n"));
        assert!(collector.header(b"Content-Length: 5\r\n"));
        assert!(collector.header(b"\r\n"));
        assert_eq!(collector.write(b"hello").unwrap(), 5);

        let (headers, body, version) = collector.harvest();
        assert_eq!(version, Version::Http11);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].name(), "Content-Length");
        assert_eq!(body, b"hello");
    }

    #[test]
    fn begin_clears_previous_transfer() {
        let mut collector = Collector::new();
        collector.begin(None);
        collector.write(b"stale").unwrap();
        collector.header(b"X-Old: 1\r\n");

        collector.begin(None);
        let (headers, body, _) = collector.harvest();
        assert!(headers.is_empty());
        assert!(body.is_empty());
    }

    #[test]
    fn progress_forwards_to_handler() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let called = Arc::new(AtomicBool::new(false));
        let observer = called.clone();

        let mut collector = Collector::new();
        collector.begin(Some(Arc::new(move |_, _, _, _| {
            observer.store(true, Ordering::SeqCst);
            true
        })));

        assert!(collector.progress(10.0, 5.0, 0.0, 0.0));
        assert!(called.load(Ordering::SeqCst));

        // Without a handler progress always continues.
        collector.begin(None);
        assert!(collector.progress(0.0, 0.0, 0.0, 0.0));
    }
}
