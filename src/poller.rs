//! Raw polling primitives for the I/O thread: epoll, the cross-thread
//! wakeup eventfd, and the two one-shot timers.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Tokens for the loop's own descriptors. Socket contexts encode
/// `generation << 32 | slot` and stay far below this range.
pub(crate) const TOKEN_WAKEUP: u64 = u64::MAX;
pub(crate) const TOKEN_TIMEOUT: u64 = u64::MAX - 1;
pub(crate) const TOKEN_TIMESUP: u64 = u64::MAX - 2;

const MAX_EVENTS: usize = 64;

/// One readiness event reported by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub(crate) token: u64,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
}

/// Wake the I/O thread from any thread by writing its eventfd.
pub(crate) fn notify(wakeup_fd: RawFd) {
    let value: u64 = 1;
    unsafe {
        libc::write(wakeup_fd, &value as *const u64 as *const libc::c_void, 8);
    }
}

/// Create the cross-thread wakeup eventfd. It is owned by the loop's
/// shared state, not the poller, so producers can still signal safely
/// while the I/O thread tears down.
pub(crate) fn create_wakeup_fd() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Closes on drop.
struct Fd(RawFd);

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// The OS event multiplexer plus the loop's timer descriptors. Lives on
/// the I/O thread; producers signal it through the externally owned
/// wakeup eventfd + [`notify`].
pub(crate) struct Poller {
    epoll: Fd,
    /// Registered but externally owned.
    wakeup: RawFd,
    timeout: Fd,
    timesup: Fd,
}

impl Poller {
    pub(crate) fn new(wakeup: RawFd) -> io::Result<Poller> {
        let epoll = Fd(cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?);
        let timeout = Fd(cvt(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        })?);
        let timesup = Fd(cvt(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        })?);

        let poller = Poller {
            epoll,
            wakeup,
            timeout,
            timesup,
        };
        poller.add_own(poller.wakeup, TOKEN_WAKEUP)?;
        poller.add_own(poller.timeout.0, TOKEN_TIMEOUT)?;
        poller.add_own(poller.timesup.0, TOKEN_TIMESUP)?;
        Ok(poller)
    }

    fn add_own(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        cvt(unsafe { libc::epoll_ctl(self.epoll.0, libc::EPOLL_CTL_ADD, fd, &mut event) })?;
        Ok(())
    }

    /// Start or update polling of a transport socket.
    pub(crate) fn watch(
        &self,
        socket: RawFd,
        token: u64,
        readable: bool,
        writable: bool,
        known: bool,
    ) -> io::Result<()> {
        let mut events = 0u32;
        if readable {
            events |= libc::EPOLLIN as u32;
        }
        if writable {
            events |= libc::EPOLLOUT as u32;
        }
        let mut event = libc::epoll_event { events, u64: token };

        let op = if known {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll.0, op, socket, &mut event) };
        if ret == 0 {
            return Ok(());
        }

        // The transport can hand us a socket it re-used internally; fall
        // back to the other op before giving up.
        let err = io::Error::last_os_error();
        let fallback = match err.raw_os_error() {
            Some(libc::EEXIST) => libc::EPOLL_CTL_MOD,
            Some(libc::ENOENT) => libc::EPOLL_CTL_ADD,
            _ => return Err(err),
        };
        cvt(unsafe { libc::epoll_ctl(self.epoll.0, fallback, socket, &mut event) })?;
        Ok(())
    }

    /// Stop polling a socket. The descriptor may already be closed by the
    /// transport, so failures are ignored.
    pub(crate) fn unwatch(&self, socket: RawFd) {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        unsafe {
            libc::epoll_ctl(self.epoll.0, libc::EPOLL_CTL_DEL, socket, &mut event);
        }
    }

    pub(crate) fn arm_timeout(&self, after: Duration) {
        arm(self.timeout.0, after);
    }

    pub(crate) fn disarm_timeout(&self) {
        disarm(self.timeout.0);
    }

    pub(crate) fn arm_timesup(&self, after: Duration) {
        arm(self.timesup.0, after);
    }

    pub(crate) fn disarm_timesup(&self) {
        disarm(self.timesup.0);
    }

    /// Drain an eventfd/timerfd after its readiness event.
    pub(crate) fn drain(&self, token: u64) {
        let fd = match token {
            TOKEN_WAKEUP => self.wakeup,
            TOKEN_TIMEOUT => self.timeout.0,
            TOKEN_TIMESUP => self.timesup.0,
            _ => return,
        };
        let mut value = 0u64;
        loop {
            let n = unsafe { libc::read(fd, &mut value as *mut u64 as *mut libc::c_void, 8) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Block until at least one event is ready and collect the batch.
    pub(crate) fn wait(&self, events: &mut Vec<PollEvent>) -> io::Result<()> {
        events.clear();
        let mut raw: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        loop {
            let n = unsafe { libc::epoll_wait(self.epoll.0, raw.as_mut_ptr(), MAX_EVENTS as i32, -1) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            for event in raw.iter().take(n as usize) {
                let bits = event.events;
                events.push(PollEvent {
                    token: event.u64,
                    readable: bits & (libc::EPOLLIN | libc::EPOLLHUP) as u32 != 0,
                    writable: bits & libc::EPOLLOUT as u32 != 0,
                    error: bits & libc::EPOLLERR as u32 != 0,
                });
            }
            return Ok(());
        }
    }
}

fn arm(fd: RawFd, after: Duration) {
    let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
    spec.it_value.tv_sec = after.as_secs() as libc::time_t;
    spec.it_value.tv_nsec = after.subsec_nanos() as libc::c_long;
    if after.is_zero() {
        // A fully zero value would disarm; fire on the next tick instead.
        spec.it_value.tv_nsec = 1;
    }
    unsafe {
        libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut());
    }
}

fn disarm(fd: RawFd) {
    let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut());
    }
}

/// Per-socket poll contexts drawn from a free list to avoid allocation
/// churn. A generation counter in the token guards against readiness
/// events harvested in the same batch as the context's release.
pub(crate) struct ContextSlab {
    slots: Vec<ContextSlot>,
    free: Vec<u32>,
}

struct ContextSlot {
    socket: RawFd,
    generation: u32,
    active: bool,
}

impl ContextSlab {
    pub(crate) fn new() -> ContextSlab {
        ContextSlab {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Bind a context to a socket and return its poll token.
    pub(crate) fn acquire(&mut self, socket: RawFd) -> u64 {
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.socket = socket;
                slot.active = true;
                index
            }
            None => {
                self.slots.push(ContextSlot {
                    socket,
                    generation: 0,
                    active: true,
                });
                (self.slots.len() - 1) as u32
            }
        };
        encode(index, self.slots[index as usize].generation)
    }

    /// Release a context back to the free list, invalidating its token.
    pub(crate) fn release(&mut self, token: u64) {
        let index = decode_index(token);
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        if !slot.active || slot.generation != decode_generation(token) {
            return;
        }
        slot.active = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }

    /// The socket behind a token, unless the context was already recycled.
    pub(crate) fn socket(&self, token: u64) -> Option<RawFd> {
        let slot = self.slots.get(decode_index(token) as usize)?;
        if slot.active && slot.generation == decode_generation(token) {
            Some(slot.socket)
        } else {
            None
        }
    }
}

fn encode(index: u32, generation: u32) -> u64 {
    (generation as u64) << 32 | index as u64
}

fn decode_index(token: u64) -> u32 {
    token as u32
}

fn decode_generation(token: u64) -> u32 {
    (token >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_recycles_through_free_list() {
        let mut slab = ContextSlab::new();
        let a = slab.acquire(10);
        let b = slab.acquire(11);
        assert_eq!(slab.socket(a), Some(10));
        assert_eq!(slab.socket(b), Some(11));

        slab.release(a);
        assert_eq!(slab.socket(a), None);

        // Same slot, new generation: the stale token stays dead.
        let c = slab.acquire(12);
        assert_eq!(decode_index(c), decode_index(a));
        assert_ne!(c, a);
        assert_eq!(slab.socket(a), None);
        assert_eq!(slab.socket(c), Some(12));
    }

    #[test]
    fn double_release_is_inert() {
        let mut slab = ContextSlab::new();
        let a = slab.acquire(9);
        slab.release(a);
        slab.release(a);
        let b = slab.acquire(7);
        let c = slab.acquire(8);
        assert_eq!(slab.socket(b), Some(7));
        assert_eq!(slab.socket(c), Some(8));
    }

    #[test]
    fn wakeup_unblocks_wait() {
        use std::os::fd::AsRawFd;

        let wakeup = create_wakeup_fd().unwrap();
        let poller = Poller::new(wakeup.as_raw_fd()).unwrap();
        notify(wakeup.as_raw_fd());

        let mut events = Vec::new();
        poller.wait(&mut events).unwrap();
        assert!(events.iter().any(|e| e.token == TOKEN_WAKEUP));
        poller.drain(TOKEN_WAKEUP);
    }

    #[test]
    fn timer_fires_after_arming() {
        use std::os::fd::AsRawFd;

        let wakeup = create_wakeup_fd().unwrap();
        let poller = Poller::new(wakeup.as_raw_fd()).unwrap();
        poller.arm_timesup(Duration::from_millis(5));

        let mut events = Vec::new();
        poller.wait(&mut events).unwrap();
        assert!(events.iter().any(|e| e.token == TOKEN_TIMESUP));
    }
}
