//! The event loop: one I/O thread multiplexing every in-flight request.
//!
//! Producers hand prepared executors over a mutex-protected queue and wake
//! the I/O thread through an eventfd. The thread owns the transport multi
//! handle, the epoll poller, the per-socket poll contexts and the
//! wall-clock budget index; every transport call and every completion
//! happens on it. Ownership of each request returns to the submitter
//! exactly once, through the on-complete handler.

use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Events, Multi, Socket, SocketEvents};

use crate::error::Error;
use crate::executor::{self, Executor};
use crate::handler::Collector;
use crate::metrics;
use crate::poller::{self, ContextSlab, PollEvent, Poller};
use crate::poller::{TOKEN_TIMEOUT, TOKEN_TIMESUP, TOKEN_WAKEUP};
use crate::request::{Request, ResolveHost};
use crate::response::Response;
use crate::status::LiftStatus;

/// Event loop configuration.
#[derive(Clone, Default)]
pub struct Config {
    /// Transport handles pre-created at loop start and recycled across
    /// requests. Handles beyond the reserve are dropped on completion.
    pub reserve_connections: usize,
    /// Cap on the transport's concurrently open connections. `None`
    /// leaves the transport default. The pending-submission queue itself
    /// is unbounded; callers needing bounded memory must throttle.
    pub max_connections: Option<usize>,
    /// Resolve hosts applied to every request this loop executes, ahead
    /// of each request's own entries.
    pub resolve_hosts: Vec<ResolveHost>,
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_connections == Some(0) {
            return Err(Error::InvalidConfig(
                "max_connections must be > 0 when set".into(),
            ));
        }
        if self.reserve_connections > 65_536 {
            return Err(Error::InvalidConfig(
                "reserve_connections must be <= 65536".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with `build()` validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Number of transport handles to pre-create and recycle.
    pub fn reserve_connections(mut self, n: usize) -> ConfigBuilder {
        self.config.reserve_connections = n;
        self
    }

    /// Cap concurrent transport connections.
    pub fn max_connections(mut self, n: usize) -> ConfigBuilder {
        self.config.max_connections = Some(n);
        self
    }

    /// Add a resolve host applied to every request. Can be called
    /// multiple times.
    pub fn resolve_host(mut self, resolve_host: ResolveHost) -> ConfigBuilder {
        self.config.resolve_hosts.push(resolve_host);
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// State shared between producer threads and the I/O thread.
struct Shared {
    /// Pending submissions; swapped into the I/O thread's scratch vector,
    /// never held across a transport call.
    pending: Mutex<Vec<Executor>>,
    /// Idle transport handles, leased at prepare and returned on
    /// completion. Capped at `reserve_connections`.
    handle_pool: Mutex<Vec<Easy2<Collector>>>,
    resolve_hosts: Vec<ResolveHost>,
    reserve_connections: usize,
    /// Owned here rather than by the poller, so producer-side wakeups
    /// can never write a recycled descriptor.
    wakeup: OwnedFd,
    running: AtomicBool,
    stopping: AtomicBool,
    shutdown: AtomicBool,
    active: AtomicU64,
}

/// Which polling the transport asked for on one socket.
enum SocketPoll {
    In,
    Out,
    InOut,
    Remove,
}

struct SocketUpdate {
    socket: Socket,
    poll: SocketPoll,
}

impl SocketUpdate {
    fn new(socket: Socket, events: &SocketEvents) -> SocketUpdate {
        let poll = if events.remove() {
            SocketPoll::Remove
        } else {
            match (events.input(), events.output()) {
                (true, true) => SocketPoll::InOut,
                (false, true) => SocketPoll::Out,
                _ => SocketPoll::In,
            }
        };
        SocketUpdate { socket, poll }
    }
}

/// Wraps the transport multi handle so it can be moved onto the I/O
/// thread that will own it exclusively for its entire lifetime. The
/// underlying C binding's raw pointer field lacks a `Send` marker even
/// though handing the handle off to a single owning thread (never
/// sharing it concurrently) is the intended and safe usage.
struct SendMulti(Multi);

unsafe impl Send for SendMulti {}

impl std::ops::Deref for SendMulti {
    type Target = Multi;
    fn deref(&self) -> &Multi {
        &self.0
    }
}

impl std::ops::DerefMut for SendMulti {
    fn deref_mut(&mut self) -> &mut Multi {
        &mut self.0
    }
}

type SocketUpdates = Arc<Mutex<Vec<SocketUpdate>>>;
/// Latest timer request from the transport: `None` = cancel, zero = run
/// now, otherwise arm for the duration. Inner `Option` is the request.
type TimerDirective = Arc<Mutex<Option<Option<Duration>>>>;

/// Drives hundreds of concurrent requests over a single I/O thread.
///
/// Submissions are accepted from any thread through
/// [`start_request`](EventLoop::start_request); on-complete handlers run
/// on the I/O thread and must not block. Dropping the loop rejects new
/// work and waits for every accepted submission to deliver. Handlers may
/// submit new requests to the same loop, but must never be the ones to
/// drop it: the destructor joins the I/O thread.
pub struct EventLoop {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Construct the loop and start its I/O thread. Returns once the
    /// thread is live, so requests may be started immediately.
    pub fn new(config: Config) -> Result<EventLoop, Error> {
        config.validate()?;

        let wakeup = poller::create_wakeup_fd()?;
        let poller = Poller::new(wakeup.as_raw_fd())?;

        let mut multi = Multi::new();
        if let Some(max) = config.max_connections {
            multi.set_max_total_connections(max)?;
        }

        let socket_updates: SocketUpdates = Arc::default();
        let timer_directive: TimerDirective = Arc::default();

        {
            let updates = socket_updates.clone();
            multi.socket_function(move |socket, events, _token| {
                updates
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(SocketUpdate::new(socket, &events));
            })?;
        }
        {
            let directive = timer_directive.clone();
            multi.timer_function(move |timeout| {
                *directive.lock().unwrap_or_else(|e| e.into_inner()) = Some(timeout);
                true
            })?;
        }

        let mut handle_pool = Vec::with_capacity(config.reserve_connections);
        for _ in 0..config.reserve_connections {
            handle_pool.push(Easy2::new(Collector::new()));
        }

        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
            handle_pool: Mutex::new(handle_pool),
            resolve_hosts: config.resolve_hosts,
            reserve_connections: config.reserve_connections,
            wakeup,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            active: AtomicU64::new(0),
        });

        // Only the multi, the poller and the shared state cross the
        // thread boundary; everything else is built on the I/O thread.
        let thread_shared = shared.clone();
        let multi = SendMulti(multi);
        let thread = thread::Builder::new()
            .name("lift-event-loop".to_string())
            .spawn(move || {
                let inner = LoopInner {
                    multi,
                    poller,
                    shared: thread_shared,
                    socket_updates,
                    timer_directive,
                    contexts: ContextSlab::new(),
                    socket_tokens: HashMap::new(),
                    in_flight: HashMap::new(),
                    timesup: BTreeMap::new(),
                    next_token: 1,
                    timesup_seq: 0,
                    origin: Instant::now(),
                    scratch: Vec::new(),
                };
                inner.run();
            })
            .map_err(Error::Io)?;

        // Wait for the thread to spin up so the caller can start adding
        // requests the moment the constructor returns.
        while !shared.running.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }

        Ok(EventLoop {
            shared,
            thread: Some(thread),
        })
    }

    /// Submit a request for asynchronous execution. Callable from any
    /// thread; non-blocking. Returns whether the submission was accepted;
    /// a rejected submission never invokes its callback.
    pub fn start_request(&self, request: Box<Request>) -> bool {
        if self.shared.stopping.load(Ordering::Acquire) {
            tracing::debug!("submission rejected: event loop is stopping");
            metrics::REQUESTS_REJECTED.increment();
            return false;
        }

        // Counted before queueing so shutdown waits for this submission.
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        metrics::REQUESTS_STARTED.increment();
        metrics::REQUESTS_ACTIVE.increment();

        // Prepare on the caller's thread; configuration work never lands
        // on the I/O thread.
        let easy = self.lease_handle();
        let executor = Executor::prepare(request, easy, &self.shared.resolve_hosts);
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.push(executor);
        }
        poller::notify(self.shared.wakeup.as_raw_fd());
        true
    }

    /// Number of submissions accepted but not yet delivered.
    pub fn active_request_count(&self) -> u64 {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Reject new submissions. In-flight requests continue to completion;
    /// dropping the loop waits for them.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
    }

    fn lease_handle(&self) -> Easy2<Collector> {
        self.shared
            .handle_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| Easy2::new(Collector::new()))
    }
}

impl Drop for EventLoop {
    /// Graceful shutdown: refuse new work, wait for every accepted
    /// submission to deliver, then stop and join the I/O thread.
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);

        while self.shared.active.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_millis(1));
        }

        self.shared.shutdown.store(true, Ordering::Release);
        poller::notify(self.shared.wakeup.as_raw_fd());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// One armed transfer: its multi-attached handle plus the executor state.
struct InFlight {
    handle: Easy2Handle<Collector>,
    executor: Executor,
}

/// Everything owned by the I/O thread.
struct LoopInner {
    multi: SendMulti,
    poller: Poller,
    shared: Arc<Shared>,
    socket_updates: SocketUpdates,
    timer_directive: TimerDirective,
    contexts: ContextSlab,
    socket_tokens: HashMap<Socket, u64>,
    in_flight: HashMap<usize, InFlight>,
    /// Wall-clock budget index: (absolute deadline ms, insertion seq) ->
    /// in-flight token. The seq component realizes duplicate deadlines.
    timesup: BTreeMap<(u64, u64), usize>,
    next_token: usize,
    timesup_seq: u64,
    origin: Instant,
    scratch: Vec<Executor>,
}

impl LoopInner {
    fn run(mut self) {
        self.shared.running.store(true, Ordering::Release);
        tracing::debug!("event loop started");

        let mut events: Vec<PollEvent> = Vec::new();
        loop {
            if let Err(err) = self.poller.wait(&mut events) {
                tracing::warn!(error = %err, "poll failed, aborting in-flight requests");
                self.abort_all();
                break;
            }

            let mut woken = false;
            for event in events.drain(..) {
                match event.token {
                    TOKEN_WAKEUP => {
                        self.poller.drain(TOKEN_WAKEUP);
                        woken = true;
                    }
                    TOKEN_TIMEOUT => {
                        self.poller.drain(TOKEN_TIMEOUT);
                        self.check_actions(None);
                    }
                    TOKEN_TIMESUP => {
                        self.poller.drain(TOKEN_TIMESUP);
                        self.expire_timesup();
                    }
                    token => {
                        // Stale tokens from contexts released earlier in
                        // this batch are dropped here.
                        if let Some(socket) = self.contexts.socket(token) {
                            self.check_actions(Some((socket, event)));
                        }
                    }
                }
            }

            if woken {
                if self.shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                self.drain_pending();
            }
        }

        self.poller.disarm_timeout();
        self.poller.disarm_timesup();
        self.shared.running.store(false, Ordering::Release);
        tracing::debug!("event loop stopped");
    }

    /// Swap the pending queue into scratch under the lock, then arm each
    /// drained executor in FIFO order lock-free.
    fn drain_pending(&mut self) {
        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::swap(&mut *pending, &mut scratch);
        }
        for executor in scratch.drain(..) {
            self.arm(executor);
        }
        self.scratch = scratch;
    }

    /// Register a drained executor with the transport, or complete it
    /// immediately if it cannot start.
    fn arm(&mut self, mut executor: Executor) {
        let Some(easy) = executor.easy.take() else {
            self.complete_aborted(executor);
            return;
        };

        if let Some(status) = executor.prepare_error.take() {
            self.fail_immediate(executor, Some(easy), status);
            return;
        }

        executor.response.lift_status = LiftStatus::Executing;
        let token = self.next_token;
        self.next_token += 1;

        // Into the timer index before the multi; a transfer that finishes
        // instantly must not race its own budget entry.
        self.add_timesup(&mut executor, token);

        match self.multi.add2(easy) {
            Ok(mut handle) => {
                if let Err(err) = handle.set_token(token) {
                    tracing::warn!(error = %err, "failed to tag transfer");
                    self.remove_timesup(&mut executor);
                    let easy = self.multi.remove2(handle).ok();
                    self.fail_immediate(executor, easy, LiftStatus::ErrorFailedToStart);
                    return;
                }
                self.in_flight.insert(token, InFlight { handle, executor });
                // Kick the transfer so its first bytes go out promptly.
                self.check_actions(None);
            }
            Err(err) => {
                tracing::warn!(error = %err, "multi rejected transfer");
                self.remove_timesup(&mut executor);
                self.fail_immediate(executor, None, LiftStatus::ErrorFailedToStart);
            }
        }
    }

    /// Deliver a request that never reached the transport.
    fn fail_immediate(
        &mut self,
        mut executor: Executor,
        easy: Option<Easy2<Collector>>,
        status: LiftStatus,
    ) {
        executor.delivered = true;
        let mut response = std::mem::replace(&mut executor.response, Response::new());
        response.lift_status = status;
        metrics::REQUESTS_FAILED_TO_START.increment();
        if let Some(request) = executor.request.take() {
            deliver(request, response);
        }
        if let Some(mut easy) = easy {
            easy.get_mut().harvest();
            self.recycle(easy);
        }
        self.finish_executor();
    }

    /// Advance transport I/O for one socket (or for a timeout with no
    /// socket), then apply the transport's poll/timer directives and
    /// drain completed transfers.
    fn check_actions(&mut self, target: Option<(Socket, PollEvent)>) {
        let result = match target {
            None => self.multi.timeout(),
            Some((socket, event)) => {
                let mut events = Events::new();
                events
                    .input(event.readable)
                    .output(event.writable)
                    .error(event.error);
                self.multi.action(socket, &events)
            }
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "multi socket action failed");
        }

        self.apply_transport_directives();
        self.drain_messages();
    }

    /// Apply socket-poll and timer requests the transport queued during
    /// its callbacks.
    fn apply_transport_directives(&mut self) {
        let updates = std::mem::take(
            &mut *self
                .socket_updates
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for update in updates {
            self.apply_socket_update(update);
        }

        let directive = self
            .timer_directive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(directive) = directive {
            match directive {
                Some(after) => self.poller.arm_timeout(after),
                None => self.poller.disarm_timeout(),
            }
        }
    }

    fn apply_socket_update(&mut self, update: SocketUpdate) {
        let (readable, writable) = match update.poll {
            SocketPoll::Remove => {
                if let Some(token) = self.socket_tokens.remove(&update.socket) {
                    self.poller.unwatch(update.socket);
                    self.contexts.release(token);
                }
                return;
            }
            SocketPoll::In => (true, false),
            SocketPoll::Out => (false, true),
            SocketPoll::InOut => (true, true),
        };

        let (token, known) = match self.socket_tokens.get(&update.socket) {
            Some(&token) => (token, true),
            None => {
                let token = self.contexts.acquire(update.socket);
                self.socket_tokens.insert(update.socket, token);
                (token, false)
            }
        };
        if let Err(err) = self
            .poller
            .watch(update.socket, token, readable, writable, known)
        {
            tracing::warn!(socket = update.socket, error = %err, "failed to poll transport socket");
        }
    }

    /// Drain completed transfers out of the multi and deliver them.
    fn drain_messages(&mut self) {
        let mut finished: Vec<(usize, Result<(), curl::Error>)> = Vec::new();
        self.multi.messages(|message| {
            if let (Ok(token), Some(result)) = (message.token(), message.result()) {
                finished.push((token, result));
            }
        });
        for (token, result) in finished {
            self.complete_normal(token, result);
        }
    }

    fn complete_normal(&mut self, token: usize, result: Result<(), curl::Error>) {
        let Some(InFlight {
            handle,
            mut executor,
        }) = self.in_flight.remove(&token)
        else {
            return;
        };

        self.remove_timesup(&mut executor);

        match self.multi.remove2(handle) {
            Ok(mut easy) => {
                if executor.delivered {
                    // Time's-up won the race; clear the collector and
                    // recycle without a second delivery.
                    easy.get_mut().harvest();
                } else {
                    executor.delivered = true;
                    let mut response = std::mem::replace(&mut executor.response, Response::new());
                    executor::finish(&mut easy, &mut response, result);
                    if let Some(request) = executor.request.take() {
                        deliver(request, response);
                    }
                }
                self.recycle(easy);
            }
            Err(err) => {
                // The handle is lost to the pool; still deliver the outcome.
                tracing::warn!(error = %err, "failed to detach completed transfer");
                if !executor.delivered {
                    executor.delivered = true;
                    let mut response = std::mem::replace(&mut executor.response, Response::new());
                    response.lift_status = LiftStatus::from_curl_result(result);
                    if let Some(request) = executor.request.take() {
                        deliver(request, response);
                    }
                }
            }
        }

        self.finish_executor();
    }

    /// Sweep every budget entry that has expired, delivering synthetic
    /// time's-up responses. The transport keeps the transfer armed; its
    /// eventual completion recycles the handle without a second delivery.
    fn expire_timesup(&mut self) {
        let now = self.now_ms();
        let mut expired = 0u64;
        loop {
            let Some((&key, &token)) = self.timesup.iter().next() else {
                break;
            };
            if key.0 > now {
                break;
            }
            self.timesup.remove(&key);

            if let Some(in_flight) = self.in_flight.get_mut(&token) {
                let executor = &mut in_flight.executor;
                executor.timesup_key = None;
                if !executor.delivered {
                    executor.delivered = true;
                    let budget = executor
                        .request
                        .as_ref()
                        .and_then(|r| r.timesup())
                        .unwrap_or_default();
                    let response = executor.timesup_response(budget);
                    if let Some(request) = executor.request.take() {
                        deliver(request, response);
                    }
                    expired += 1;
                }
            }
        }
        if expired > 0 {
            tracing::trace!(expired, "wall-clock budgets elapsed");
        }
        self.rearm_timesup();
    }

    /// Insert an executor's budget entry, keyed by absolute deadline.
    fn add_timesup(&mut self, executor: &mut Executor, token: usize) {
        let Some(budget) = executor.request.as_ref().and_then(|r| r.timesup()) else {
            return;
        };
        let deadline = self.now_ms() + budget.as_millis() as u64;
        let key = (deadline, self.timesup_seq);
        self.timesup_seq += 1;
        self.timesup.insert(key, token);
        executor.timesup_key = Some(key);
        self.rearm_timesup();
    }

    fn remove_timesup(&mut self, executor: &mut Executor) {
        if let Some(key) = executor.timesup_key.take() {
            self.timesup.remove(&key);
            self.rearm_timesup();
        }
    }

    /// Point the time's-up timer at the front of the index.
    fn rearm_timesup(&mut self) {
        match self.timesup.keys().next() {
            Some(&(deadline, _)) => {
                let delta = deadline.saturating_sub(self.now_ms());
                self.poller.arm_timesup(Duration::from_millis(delta));
            }
            None => self.poller.disarm_timesup(),
        }
    }

    /// Reset a handle and return it to the pool, up to the reserve.
    fn recycle(&mut self, mut easy: Easy2<Collector>) {
        easy.reset();
        let mut pool = self
            .shared
            .handle_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if pool.len() < self.shared.reserve_connections {
            pool.push(easy);
        }
    }

    /// The executor is gone; only now does the submission stop counting
    /// towards shutdown.
    fn finish_executor(&mut self) {
        metrics::REQUESTS_ACTIVE.decrement();
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Monotonic loop time in milliseconds.
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// The poller is unrecoverable; deliver an error to everything armed
    /// or pending so shutdown can still drain the active count.
    fn abort_all(&mut self) {
        let tokens: Vec<usize> = self.in_flight.keys().copied().collect();
        for token in tokens {
            let Some(InFlight {
                handle,
                mut executor,
            }) = self.in_flight.remove(&token)
            else {
                continue;
            };
            self.remove_timesup(&mut executor);
            if let Ok(mut easy) = self.multi.remove2(handle) {
                easy.get_mut().harvest();
            }
            self.complete_aborted(executor);
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::swap(&mut *pending, &mut scratch);
        }
        for mut executor in scratch.drain(..) {
            executor.easy.take();
            self.complete_aborted(executor);
        }
        self.scratch = scratch;
    }

    fn complete_aborted(&mut self, mut executor: Executor) {
        if !executor.delivered {
            executor.delivered = true;
            let mut response = std::mem::replace(&mut executor.response, Response::new());
            response.lift_status = LiftStatus::Error;
            if let Some(request) = executor.request.take() {
                deliver(request, response);
            }
        }
        self.finish_executor();
    }
}

/// Transfer ownership of the request and response to the consumer,
/// exactly once. Runs on the I/O thread; a panicking handler must not
/// take the loop down with it.
fn deliver(mut request: Box<Request>, response: Response) {
    if response.lift_status() == LiftStatus::TimesUp {
        metrics::REQUESTS_TIMESUP.increment();
    } else {
        metrics::REQUESTS_COMPLETED.increment();
    }

    if let Some(callback) = request.take_on_complete() {
        if catch_unwind(AssertUnwindSafe(move || callback(request, response))).is_err() {
            tracing::warn!("on-complete handler panicked");
        }
    }
}
