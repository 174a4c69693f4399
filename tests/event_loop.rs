//! Integration tests: asynchronous execution through the event loop.
//!
//! Each test launches a local HTTP server thread, submits requests from
//! the test thread, and observes deliveries through channels.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lift_http::{
    Config, ConfigBuilder, EventLoop, GlobalScopeInitializer, LiftStatus, Request,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Serve HTTP/1.1 on a free port, delaying each response by `delay`.
fn spawn_server(body: &'static str, delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            thread::spawn(move || serve_conn(stream, body, delay));
        }
    });

    format!("http://{addr}/")
}

fn serve_conn(mut stream: TcpStream, body: &str, delay: Duration) {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let Ok(n) = stream.read(&mut buf) else { return };
        if n == 0 {
            return;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    if !delay.is_zero() {
        thread::sleep(delay);
    }
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

fn request_to(url: &str) -> Request {
    Request::with_timeout(url, Duration::from_secs(5))
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn async_batch_delivers_every_callback() {
    let _lift = GlobalScopeInitializer::new();
    let url = spawn_server("batch", Duration::ZERO);

    let event_loop = EventLoop::new(
        ConfigBuilder::new().reserve_connections(4).build().unwrap(),
    )
    .unwrap();
    assert!(event_loop.is_running());

    let (tx, rx) = mpsc::channel();
    for _ in 0..10 {
        let tx = tx.clone();
        let mut request = request_to(&url);
        request.on_complete_handler(move |_request, response| {
            tx.send((response.lift_status(), response.status_code())).unwrap();
        });
        assert!(event_loop.start_request(Box::new(request)));
    }

    for _ in 0..10 {
        let (status, code) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(status, LiftStatus::Success);
        assert_eq!(code, 200);
    }

    // Every delivery also drains the active count.
    for _ in 0..500 {
        if event_loop.active_request_count() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(event_loop.active_request_count(), 0);
}

#[test]
fn callbacks_capture_their_own_user_data() {
    let _lift = GlobalScopeInitializer::new();
    let url = spawn_server("user data", Duration::ZERO);

    let event_loop = EventLoop::new(Config::default()).unwrap();
    let (tx, rx) = mpsc::channel();

    for request_id in [1u64, 2u64] {
        let tx = tx.clone();
        let mut request = request_to(&url);
        request.on_complete_handler(move |_request, response| {
            tx.send((request_id, response.lift_status())).unwrap();
        });
        assert!(event_loop.start_request(Box::new(request)));
    }

    let mut seen = Vec::new();
    for _ in 0..2 {
        let (request_id, status) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(status, LiftStatus::Success);
        seen.push(request_id);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
}

#[test]
fn timesup_delivers_within_the_budget() {
    let _lift = GlobalScopeInitializer::new();
    let url = spawn_server("too slow", Duration::from_secs(2));

    let event_loop = EventLoop::new(Config::default()).unwrap();
    let (tx, rx) = mpsc::channel();

    let mut request = Request::with_timeout(&url, Duration::from_secs(10));
    request.set_timesup(Some(Duration::from_millis(50)));
    request.on_complete_handler(move |request, response| {
        tx.send((request.timesup(), response)).unwrap();
    });

    let started = Instant::now();
    assert!(event_loop.start_request(Box::new(request)));

    let (budget, response) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.lift_status(), LiftStatus::TimesUp);
    assert_eq!(response.status_code(), 0);
    assert!(response.data().is_empty());
    assert_eq!(budget, Some(Duration::from_millis(50)));
    assert_eq!(response.total_time(), Duration::from_millis(50));
    // Delivery must happen well before the 2s server delay; allow
    // generous slack over the 50ms budget for loaded CI machines.
    assert!(elapsed < Duration::from_secs(1), "elapsed: {elapsed:?}");

    // The transfer itself is still in flight; the drop below waits for
    // it to finish against the slow server.
    drop(event_loop);
}

#[test]
fn submissions_after_stop_are_rejected() {
    let _lift = GlobalScopeInitializer::new();
    let url = spawn_server("stopped", Duration::ZERO);

    let event_loop = EventLoop::new(Config::default()).unwrap();
    event_loop.stop();

    let (tx, rx) = mpsc::channel();
    let mut request = request_to(&url);
    request.on_complete_handler(move |_request, response| {
        tx.send(response.lift_status()).unwrap();
    });

    assert!(!event_loop.start_request(Box::new(request)));
    assert_eq!(event_loop.active_request_count(), 0);
    // A rejected submission never invokes its callback.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn drop_waits_for_inflight_deliveries() {
    let _lift = GlobalScopeInitializer::new();
    let url = spawn_server("draining", Duration::from_millis(300));

    let event_loop = EventLoop::new(Config::default()).unwrap();
    let delivered = Arc::new(Mutex::new(Vec::new()));

    for i in 0..5u32 {
        let delivered = delivered.clone();
        let mut request = request_to(&url);
        request.on_complete_handler(move |_request, response| {
            delivered.lock().unwrap().push((i, response.lift_status()));
        });
        assert!(event_loop.start_request(Box::new(request)));
    }

    drop(event_loop);

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 5);
    for (_, status) in delivered.iter() {
        assert_eq!(*status, LiftStatus::Success);
    }
}

#[test]
fn empty_url_is_delivered_as_request_empty() {
    let _lift = GlobalScopeInitializer::new();

    let event_loop = EventLoop::new(Config::default()).unwrap();
    let (tx, rx) = mpsc::channel();

    let mut request = Request::new("");
    request.on_complete_handler(move |_request, response| {
        tx.send(response.lift_status()).unwrap();
    });
    assert!(event_loop.start_request(Box::new(request)));

    let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(status, LiftStatus::RequestEmpty);
}

#[test]
fn connect_error_is_delivered_asynchronously() {
    let _lift = GlobalScopeInitializer::new();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let event_loop = EventLoop::new(Config::default()).unwrap();
    let (tx, rx) = mpsc::channel();

    let mut request = request_to(&format!("http://127.0.0.1:{port}/"));
    request.on_complete_handler(move |_request, response| {
        tx.send(response.lift_status()).unwrap();
    });
    assert!(event_loop.start_request(Box::new(request)));

    let status = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(status, LiftStatus::ConnectError);
}

#[test]
fn handlers_can_resubmit_to_the_same_loop() {
    let _lift = GlobalScopeInitializer::new();
    let url = spawn_server("chained", Duration::ZERO);

    let event_loop = Arc::new(EventLoop::new(Config::default()).unwrap());
    let (tx, rx) = mpsc::channel();

    let chained_url = url.clone();
    let chained_loop = event_loop.clone();
    let mut first = request_to(&url);
    first.on_complete_handler(move |_request, response| {
        assert_eq!(response.lift_status(), LiftStatus::Success);
        let mut second = request_to(&chained_url);
        second.on_complete_handler(move |_request, response| {
            tx.send(response.lift_status()).unwrap();
        });
        assert!(chained_loop.start_request(Box::new(second)));
    });

    assert!(event_loop.start_request(Box::new(first)));

    let status = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(status, LiftStatus::Success);
}
