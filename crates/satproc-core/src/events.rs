//! Single-threaded reactor: scheduled events plus file-descriptor
//! multiplexing.
//!
//! `EventLoop<S>` is generic over the application context `S`; every
//! callback receives `&mut EventLoop<S>` and `&mut S`, so handlers can
//! schedule timers and register descriptors without shared-state plumbing.
//! All callbacks run mutually exclusively on the loop's thread.
//!
//! One iteration of [`EventLoop::run`]:
//!
//! 1. Build the poll set from the current fd registrations.
//! 2. Peek the timer queue for the earliest deadline.
//! 3. Ask the [`EventTimer`] to block up to that instant; the readiness
//!    function runs `poll(2)`.
//! 4. Drain due timers, earliest first. Timers scheduled by fired
//!    callbacks join the queue for the next iteration.
//! 5. Dispatch fd events, rotating the starting slot and starting fd each
//!    iteration so no descriptor can starve the others.
//!
//! Removal from inside a callback is safe: the callback is detached from
//! the registration for the duration of the call and revalidated against a
//! generation counter before being stored back.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use log::warn;

use crate::queue::{TimerId, TimerQueue};
use crate::time::{EventTimer, RealTimer};

/// Return value of a scheduled-event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedResult {
    /// Reschedule one period later.
    Keep,
    /// Destroy the event.
    Remove,
}

/// Return value of an fd callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdResult {
    Keep,
    /// Clear this slot once the callback returns.
    Remove,
}

/// Readiness category of an fd registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdSlot {
    Read,
    Write,
    Error,
}

impl FdSlot {
    pub const ALL: [FdSlot; 3] = [FdSlot::Read, FdSlot::Write, FdSlot::Error];

    fn index(self) -> usize {
        match self {
            FdSlot::Read => 0,
            FdSlot::Write => 1,
            FdSlot::Error => 2,
        }
    }

    fn from_index(i: usize) -> FdSlot {
        Self::ALL[i]
    }
}

/// Sentinel fd passed to cleanup callbacks; the real descriptor may already
/// be closed by the time the cleanup runs.
pub const CLEANUP_FD: RawFd = -1;

pub type SchedCallback<S> = Box<dyn FnMut(&mut EventLoop<S>, &mut S) -> SchedResult>;
pub type FdCallback<S> = Box<dyn FnMut(&mut EventLoop<S>, &mut S, RawFd, FdSlot) -> FdResult>;
pub type FdCleanup<S> = Box<dyn FnOnce(&mut S, RawFd, FdSlot)>;

struct FdHandler<S> {
    /// `None` while the callback is detached for an in-flight call.
    cb: Option<FdCallback<S>>,
    cleanup: Option<FdCleanup<S>>,
    generation: u64,
}

struct FdRegistration<S> {
    slots: [Option<FdHandler<S>>; 3],
}

impl<S> Default for FdRegistration<S> {
    fn default() -> Self {
        FdRegistration {
            slots: [None, None, None],
        }
    }
}

impl<S> FdRegistration<S> {
    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

pub struct EventLoop<S> {
    timers: TimerQueue<SchedCallback<S>>,
    fds: HashMap<RawFd, FdRegistration<S>>,
    timer: Box<dyn EventTimer>,
    keep_going: bool,
    debug_paused: bool,
    start_slot: usize,
    fd_rotation: usize,
    fd_generation: u64,
}

impl<S> Default for EventLoop<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> EventLoop<S> {
    /// Create an event loop running against the real monotonic clock.
    pub fn new() -> Self {
        EventLoop {
            timers: TimerQueue::new(),
            fds: HashMap::new(),
            timer: Box::new(RealTimer::new()),
            keep_going: true,
            debug_paused: false,
            start_slot: 0,
            fd_rotation: 0,
            fd_generation: 0,
        }
    }

    /// Replace the clock. Pending timers keep their absolute fire times, so
    /// installing a variant with a different epoch only makes sense before
    /// any events are scheduled.
    pub fn set_timer(&mut self, timer: Box<dyn EventTimer>) {
        self.timer = timer;
    }

    pub fn timer(&self) -> &dyn EventTimer {
        &*self.timer
    }

    pub fn timer_mut(&mut self) -> &mut dyn EventTimer {
        &mut *self.timer
    }

    /// Current monotonic instant of the installed clock.
    pub fn monotonic(&self) -> Duration {
        self.timer.monotonic()
    }

    /// Current wall-clock time of the installed clock.
    pub fn wall_clock(&self) -> std::time::SystemTime {
        self.timer.wall_clock()
    }

    /// While set, the clock treats blocked intervals as debugger pauses.
    pub fn set_debug_paused(&mut self, paused: bool) {
        self.debug_paused = paused;
    }

    // ------------------------------------------------------------------
    // Scheduled events
    // ------------------------------------------------------------------

    /// Schedule `cb` to run after `delay`. If the callback returns
    /// [`SchedResult::Keep`] it repeats with `delay` as the period.
    pub fn add_timer(&mut self, delay: Duration, cb: SchedCallback<S>) -> TimerId {
        self.add_periodic(delay, delay, cb)
    }

    /// Schedule with a separate initial delay and repeat period.
    pub fn add_periodic(
        &mut self,
        initial: Duration,
        period: Duration,
        cb: SchedCallback<S>,
    ) -> TimerId {
        let now = self.timer.monotonic();
        self.timers.insert(now, now + initial, period, cb)
    }

    /// Destroy a scheduled event. Returns false for a stale handle, or for
    /// an event currently detached for firing.
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        self.timers.remove(id)
    }

    /// Restart the full `delay` from now.
    pub fn update_timer(&mut self, id: TimerId, delay: Duration) {
        let now = self.timer.monotonic();
        if let Some(entry) = self.timers.get_mut(id) {
            entry.scheduled_at = now;
            entry.period = delay;
        }
        self.timers.change_next_awake(id, now + delay);
    }

    /// Reschedule for `delay` past the original schedule point, crediting
    /// time already waited. A deadline in the past fires immediately.
    pub fn update_timer_partial_credit(&mut self, id: TimerId, delay: Duration) {
        let now = self.timer.monotonic();
        let Some(entry) = self.timers.get_mut(id) else {
            return;
        };
        entry.period = delay;
        let next = (entry.scheduled_at + delay).max(now);
        self.timers.change_next_awake(id, next);
    }

    /// Time until the event fires, saturating at zero. `None` for a stale
    /// handle.
    pub fn timer_remaining(&self, id: TimerId) -> Option<Duration> {
        let now = self.timer.monotonic();
        self.timers.get(id).map(|e| e.next_awake.saturating_sub(now))
    }

    // ------------------------------------------------------------------
    // Fd registrations
    // ------------------------------------------------------------------

    /// Register `cb` for `(fd, slot)`. Only one callback per slot; an
    /// existing one is overwritten with a warning after its cleanup runs.
    pub fn add_fd(&mut self, ctx: &mut S, fd: RawFd, slot: FdSlot, cb: FdCallback<S>) {
        self.add_fd_with_cleanup(ctx, fd, slot, cb, None);
    }

    pub fn add_fd_with_cleanup(
        &mut self,
        ctx: &mut S,
        fd: RawFd,
        slot: FdSlot,
        cb: FdCallback<S>,
        cleanup: Option<FdCleanup<S>>,
    ) {
        self.fd_generation += 1;
        let handler = FdHandler {
            cb: Some(cb),
            cleanup,
            generation: self.fd_generation,
        };
        let reg = self.fds.entry(fd).or_default();
        if let Some(old) = reg.slots[slot.index()].replace(handler) {
            warn!("only one callback per fd and slot; overwriting {slot:?} on fd {fd}");
            if let Some(cleanup) = old.cleanup {
                cleanup(ctx, CLEANUP_FD, slot);
            }
        }
    }

    /// Clear `(fd, slot)`, running its cleanup exactly once. The
    /// registration is destroyed when its last slot is cleared.
    pub fn remove_fd(&mut self, ctx: &mut S, fd: RawFd, slot: FdSlot) {
        self.clear_slot(ctx, fd, slot);
    }

    /// Clear every slot of `fd`.
    pub fn remove_fd_all(&mut self, ctx: &mut S, fd: RawFd) {
        for slot in FdSlot::ALL {
            self.clear_slot(ctx, fd, slot);
        }
    }

    /// True when `(fd, slot)` currently has a callback.
    pub fn has_fd(&self, fd: RawFd, slot: FdSlot) -> bool {
        self.fds
            .get(&fd)
            .is_some_and(|r| r.slots[slot.index()].is_some())
    }

    fn clear_slot(&mut self, ctx: &mut S, fd: RawFd, slot: FdSlot) {
        let Some(reg) = self.fds.get_mut(&fd) else {
            return;
        };
        let Some(handler) = reg.slots[slot.index()].take() else {
            return;
        };
        let empty = reg.is_empty();
        if empty {
            self.fds.remove(&fd);
        }
        if let Some(cleanup) = handler.cleanup {
            cleanup(ctx, CLEANUP_FD, slot);
        }
    }

    /// Tear down all registrations and timers, running fd cleanups.
    pub fn shutdown(&mut self, ctx: &mut S) {
        let fds: Vec<RawFd> = self.fds.keys().copied().collect();
        for fd in fds {
            self.remove_fd_all(ctx, fd);
        }
        self.timers = TimerQueue::new();
    }

    // ------------------------------------------------------------------
    // The loop
    // ------------------------------------------------------------------

    /// Stop the loop at the top of the next iteration.
    pub fn exit(&mut self) {
        self.keep_going = false;
    }

    /// Run until [`EventLoop::exit`] is called. Returns an error only for
    /// unrecoverable multiplexer failures.
    pub fn run(&mut self, ctx: &mut S) -> io::Result<()> {
        self.keep_going = true;

        while self.keep_going {
            let mut pollfds = self.build_pollfds();
            let next_awake = self.timers.peek_next_awake();
            let debug_paused = self.debug_paused;

            let res = self.timer.block(next_awake, debug_paused, &mut |timeout| {
                poll_fds(&mut pollfds, timeout)
            });

            self.drain_due_timers(ctx);

            match res {
                Ok(n) if n > 0 => self.dispatch_fds(ctx, &pollfds),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("unrecoverable event loop error: {e}");
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn build_pollfds(&self) -> Vec<libc::pollfd> {
        let mut pollfds = Vec::with_capacity(self.fds.len());
        for (&fd, reg) in &self.fds {
            let mut events: libc::c_short = 0;
            if reg.slots[FdSlot::Read.index()].is_some() {
                events |= libc::POLLIN;
            }
            if reg.slots[FdSlot::Write.index()].is_some() {
                events |= libc::POLLOUT;
            }
            if reg.slots[FdSlot::Error.index()].is_some() {
                events |= libc::POLLPRI;
            }
            pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
        pollfds
    }

    /// Pop and fire every timer due at the drain snapshot. Events inserted
    /// after the snapshot stay queued for the next iteration.
    fn drain_due_timers(&mut self, ctx: &mut S) {
        let now = self.timer.monotonic();
        let watermark = self.timers.seq_watermark();

        while let Some(id) = self.timers.pop_due(now, watermark) {
            let Some(mut cb) = self.timers.take_cb(id) else {
                self.timers.remove(id);
                continue;
            };

            let res = cb(self, ctx);

            // The callback may have removed its own entry; a detached entry
            // with a matching handle is the only thing we may requeue.
            if self.timers.is_detached(id) {
                match res {
                    SchedResult::Keep => self.timers.reinsert_periodic(id, cb, now),
                    SchedResult::Remove => {
                        self.timers.remove(id);
                    }
                }
            }
        }
    }

    fn dispatch_fds(&mut self, ctx: &mut S, pollfds: &[libc::pollfd]) {
        let mut ready: [Vec<RawFd>; 3] = Default::default();
        let mut invalid = Vec::new();

        for pfd in pollfds {
            let r = pfd.revents;
            if r == 0 {
                continue;
            }
            if r & libc::POLLNVAL != 0 {
                invalid.push(pfd.fd);
                continue;
            }
            if r & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                ready[FdSlot::Read.index()].push(pfd.fd);
            }
            if r & libc::POLLOUT != 0 {
                ready[FdSlot::Write.index()].push(pfd.fd);
            }
            if r & (libc::POLLPRI | libc::POLLERR) != 0 {
                ready[FdSlot::Error.index()].push(pfd.fd);
            }
        }

        // A stale descriptor must not take the loop down; evict it instead.
        for fd in invalid {
            warn!("fd {fd} is no longer valid; evicting its registrations");
            self.remove_fd_all(ctx, fd);
        }

        for list in &mut ready {
            list.sort_unstable();
        }

        for s in 0..3 {
            let slot = FdSlot::from_index((self.start_slot + s) % 3);
            let list = &ready[slot.index()];
            if list.is_empty() {
                continue;
            }
            let offset = self.fd_rotation % list.len();
            let fds: Vec<RawFd> = list[offset..]
                .iter()
                .chain(list[..offset].iter())
                .copied()
                .collect();
            for fd in fds {
                self.dispatch_one(ctx, fd, slot);
            }
        }

        self.start_slot = (self.start_slot + 1) % 3;
        self.fd_rotation = self.fd_rotation.wrapping_add(1);
    }

    fn dispatch_one(&mut self, ctx: &mut S, fd: RawFd, slot: FdSlot) {
        let i = slot.index();
        let Some((generation, cb)) = self.fds.get_mut(&fd).and_then(|reg| {
            reg.slots[i]
                .as_mut()
                .map(|h| (h.generation, h.cb.take()))
        }) else {
            return;
        };
        let Some(mut cb) = cb else {
            return;
        };

        let res = cb(self, ctx, fd, slot);

        let still_current = self
            .fds
            .get(&fd)
            .and_then(|reg| reg.slots[i].as_ref())
            .is_some_and(|h| h.generation == generation && h.cb.is_none());
        if !still_current {
            // Removed or replaced from inside the callback.
            return;
        }

        match res {
            FdResult::Keep => {
                if let Some(handler) = self.fds.get_mut(&fd).and_then(|r| r.slots[i].as_mut()) {
                    handler.cb = Some(cb);
                }
            }
            FdResult::Remove => {
                drop(cb);
                self.clear_slot(ctx, fd, slot);
            }
        }
    }
}

fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        // Round up so sub-millisecond deadlines do not spin.
        Some(d) => d.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int,
    };

    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::VirtualTimer;
    use std::cell::RefCell;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::rc::Rc;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn virt_loop() -> EventLoop<()> {
        let mut evt = EventLoop::new();
        evt.set_timer(Box::new(VirtualTimer::new(Duration::ZERO)));
        evt
    }

    #[test]
    fn periodic_timer_advances_virtual_clock_without_drift() {
        let mut evt = virt_loop();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&fired);
        evt.add_timer(
            Duration::from_secs(1),
            Box::new(move |evt, _| {
                log.borrow_mut().push(evt.monotonic());
                if log.borrow().len() == 10 {
                    evt.exit();
                    SchedResult::Remove
                } else {
                    SchedResult::Keep
                }
            }),
        );

        evt.run(&mut ()).unwrap();

        let fired = fired.borrow();
        assert_eq!(fired.len(), 10);
        for (i, t) in fired.iter().enumerate() {
            assert_eq!(*t, Duration::from_secs(i as u64 + 1));
        }
        assert_eq!(evt.monotonic(), Duration::from_secs(10));
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut evt = virt_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..5u32 {
            let order = Rc::clone(&order);
            evt.add_timer(
                ms(20),
                Box::new(move |evt, _| {
                    order.borrow_mut().push(tag);
                    if tag == 4 {
                        evt.exit();
                    }
                    SchedResult::Remove
                }),
            );
        }

        evt.run(&mut ()).unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn timer_scheduled_by_callback_waits_for_next_iteration() {
        let mut evt = virt_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        evt.add_timer(
            ms(10),
            Box::new(move |evt, _| {
                log.borrow_mut().push("first");
                let log = Rc::clone(&log);
                evt.add_timer(
                    Duration::ZERO,
                    Box::new(move |evt, _| {
                        log.borrow_mut().push("second");
                        evt.exit();
                        SchedResult::Remove
                    }),
                );
                SchedResult::Remove
            }),
        );

        evt.run(&mut ()).unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn callback_can_remove_itself() {
        let mut evt = virt_loop();
        let fired = Rc::new(RefCell::new(0u32));
        let own_id: Rc<RefCell<Option<TimerId>>> = Rc::new(RefCell::new(None));

        let fired2 = Rc::clone(&fired);
        let id_cell = Rc::clone(&own_id);
        let id = evt.add_timer(
            ms(5),
            Box::new(move |evt, _| {
                *fired2.borrow_mut() += 1;
                let id = id_cell.borrow().unwrap();
                evt.remove_timer(id);
                // Keep after self-removal must not resurrect the event.
                SchedResult::Keep
            }),
        );
        *own_id.borrow_mut() = Some(id);

        evt.add_timer(
            ms(30),
            Box::new(|evt, _| {
                evt.exit();
                SchedResult::Remove
            }),
        );

        evt.run(&mut ()).unwrap();
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn update_timer_restarts_full_delay() {
        let mut evt = virt_loop();
        let fired_at = Rc::new(RefCell::new(None));

        let log = Rc::clone(&fired_at);
        let id = evt.add_timer(
            ms(100),
            Box::new(move |evt, _| {
                *log.borrow_mut() = Some(evt.monotonic());
                evt.exit();
                SchedResult::Remove
            }),
        );

        evt.timer_mut().advance(ms(60));
        evt.update_timer(id, ms(100));
        evt.run(&mut ()).unwrap();
        assert_eq!(*fired_at.borrow(), Some(ms(160)));
    }

    #[test]
    fn update_timer_partial_credit_fires_immediately_when_past() {
        let mut evt = virt_loop();
        let fired_at = Rc::new(RefCell::new(None));

        let log = Rc::clone(&fired_at);
        let id = evt.add_timer(
            ms(100),
            Box::new(move |evt, _| {
                *log.borrow_mut() = Some(evt.monotonic());
                evt.exit();
                SchedResult::Remove
            }),
        );

        evt.timer_mut().advance(ms(60));
        // Credit the 60ms already waited against a 40ms deadline.
        evt.update_timer_partial_credit(id, ms(40));
        evt.run(&mut ()).unwrap();
        assert_eq!(*fired_at.borrow(), Some(ms(60)));
    }

    #[test]
    fn fd_read_event_dispatches() {
        let mut evt = EventLoop::new();
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_nonblocking(true).unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(b"ping", rx.local_addr().unwrap()).unwrap();

        let got = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&got);
        let sock = rx.try_clone().unwrap();
        evt.add_fd(
            &mut (),
            rx.as_raw_fd(),
            FdSlot::Read,
            Box::new(move |evt, _, _, _| {
                let mut buf = [0u8; 16];
                let (n, _) = sock.recv_from(&mut buf).unwrap();
                log.borrow_mut().extend_from_slice(&buf[..n]);
                evt.exit();
                FdResult::Remove
            }),
        );

        evt.add_timer(
            Duration::from_secs(5),
            Box::new(|evt, _| {
                evt.exit();
                SchedResult::Remove
            }),
        );

        evt.run(&mut ()).unwrap();
        assert_eq!(&*got.borrow(), b"ping");
        assert!(!evt.has_fd(rx.as_raw_fd(), FdSlot::Read));
    }

    #[test]
    fn cleanup_runs_exactly_once_with_sentinel_fd() {
        let mut evt: EventLoop<()> = EventLoop::new();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        let cleaned = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&cleaned);
        evt.add_fd_with_cleanup(
            &mut (),
            fd,
            FdSlot::Read,
            Box::new(|_, _, _, _| FdResult::Keep),
            Some(Box::new(move |_, fd, _| log.borrow_mut().push(fd))),
        );

        evt.remove_fd(&mut (), fd, FdSlot::Read);
        evt.remove_fd(&mut (), fd, FdSlot::Read);
        assert_eq!(&*cleaned.borrow(), &[CLEANUP_FD]);
    }

    #[test]
    fn overwriting_a_slot_runs_the_prior_cleanup() {
        let mut evt: EventLoop<()> = EventLoop::new();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        let cleaned = Rc::new(RefCell::new(0u32));

        let log = Rc::clone(&cleaned);
        evt.add_fd_with_cleanup(
            &mut (),
            fd,
            FdSlot::Read,
            Box::new(|_, _, _, _| FdResult::Keep),
            Some(Box::new(move |_, _, _| *log.borrow_mut() += 1)),
        );
        evt.add_fd(&mut (), fd, FdSlot::Read, Box::new(|_, _, _, _| FdResult::Keep));
        assert_eq!(*cleaned.borrow(), 1);

        evt.remove_fd(&mut (), fd, FdSlot::Read);
        assert_eq!(*cleaned.borrow(), 1, "second handler had no cleanup");
    }

    #[test]
    fn registration_destroyed_when_all_slots_clear() {
        let mut evt: EventLoop<()> = EventLoop::new();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();

        evt.add_fd(&mut (), fd, FdSlot::Read, Box::new(|_, _, _, _| FdResult::Keep));
        evt.add_fd(&mut (), fd, FdSlot::Write, Box::new(|_, _, _, _| FdResult::Keep));

        evt.remove_fd(&mut (), fd, FdSlot::Read);
        assert!(evt.has_fd(fd, FdSlot::Write));
        evt.remove_fd(&mut (), fd, FdSlot::Write);
        assert!(!evt.has_fd(fd, FdSlot::Write));
        assert!(evt.fds.is_empty());
    }

    #[test]
    fn timer_remaining_saturates_at_zero() {
        let mut evt = virt_loop();
        let id = evt.add_timer(ms(50), Box::new(|_, _| SchedResult::Remove));
        assert_eq!(evt.timer_remaining(id), Some(ms(50)));
        evt.timer_mut().advance(ms(80));
        assert_eq!(evt.timer_remaining(id), Some(Duration::ZERO));
        evt.remove_timer(id);
        assert_eq!(evt.timer_remaining(id), None);
    }
}
