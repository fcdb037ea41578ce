//! Clock abstraction behind the event loop.
//!
//! Every wait the event loop performs goes through an [`EventTimer`]. The
//! timer decides how much real time (if any) to spend inside the
//! caller-supplied readiness function, which lets the same application code
//! run against the real monotonic clock, a debugger-friendly offset clock, a
//! local virtual clock, or the inter-process shared virtual clock in
//! [`crate::gtimer`].
//!
//! Monotonic instants are plain [`Duration`]s measured from an unspecified
//! fixed reference. Only [`EventTimer::wall_clock`] deals in calendar time.

use std::io;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

/// Readiness function supplied by the event loop.
///
/// Receives the timeout the timer selected (`None` means wait indefinitely)
/// and returns the number of ready descriptors, exactly like the underlying
/// multiplexed wait.
pub type WaitFn<'a> = &'a mut dyn FnMut(Option<Duration>) -> io::Result<usize>;

/// Pause state of a virtual clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    /// Time advances whenever the event loop blocks.
    Active,
    /// Time is frozen; blocking waits in real time.
    Paused,
    /// Time-thief mode: this process blocks in real time without advancing
    /// the shared clock. Only meaningful on the shared virtual timer.
    Stolen,
}

/// Abstract clock plus blocking-wait primitive.
///
/// `block` must clamp a deadline already in the past to "no wait" and treat
/// a `None` deadline as "wait indefinitely". `pause_while_blocking` is set
/// by the event loop while a debugger holds the process; clocks that model
/// a pausable view of time account the blocked interval accordingly.
pub trait EventTimer {
    /// Current monotonic instant. Never runs backward.
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time.
    fn wall_clock(&self) -> SystemTime;

    /// Wait until at most `next_awake`, delegating the actual waiting to
    /// `wait`. Returns whatever the readiness function returns.
    fn block(
        &mut self,
        next_awake: Option<Duration>,
        pause_while_blocking: bool,
        wait: WaitFn<'_>,
    ) -> io::Result<usize>;

    /// Set a virtual clock to an absolute instant. No-op on real clocks.
    fn set_time(&mut self, _t: Duration) {}

    /// Advance a virtual clock by `delta`. No-op on real clocks.
    fn advance(&mut self, _delta: Duration) {}

    /// Pause state of a virtual clock. Real clocks are always active.
    fn pause_state(&self) -> PauseState {
        PauseState::Active
    }

    /// Change the pause state of a virtual clock. No-op on real clocks.
    fn set_pause(&mut self, _state: PauseState) {}
}

/// Anchor shared by every real-clock instance in the process, so swapping
/// timer variants never shifts the monotonic epoch under scheduled events.
fn monotonic_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

fn real_monotonic() -> Duration {
    monotonic_anchor().elapsed()
}

/// Compute the wait for a deadline against `now`, clamping the past to zero.
fn wait_for_deadline(next_awake: Option<Duration>, now: Duration) -> Option<Duration> {
    next_awake.map(|next| next.saturating_sub(now))
}

/// OS monotonic clock.
#[derive(Debug, Default)]
pub struct RealTimer;

impl RealTimer {
    pub fn new() -> Self {
        // Pin the anchor early so the first monotonic read is cheap.
        let _ = monotonic_anchor();
        RealTimer
    }
}

impl EventTimer for RealTimer {
    fn monotonic(&self) -> Duration {
        real_monotonic()
    }

    fn wall_clock(&self) -> SystemTime {
        SystemTime::now()
    }

    fn block(
        &mut self,
        next_awake: Option<Duration>,
        _pause_while_blocking: bool,
        wait: WaitFn<'_>,
    ) -> io::Result<usize> {
        wait(wait_for_deadline(next_awake, self.monotonic()))
    }
}

/// Real clock with an accumulating debug offset.
///
/// While `pause_while_blocking` is set every interval spent inside the
/// readiness function is added to the offset, so a debugger can hold the
/// process without the program's apparent clock advancing.
#[derive(Debug, Default)]
pub struct DebugOffsetTimer {
    offset: Duration,
}

impl DebugOffsetTimer {
    pub fn new() -> Self {
        let _ = monotonic_anchor();
        DebugOffsetTimer {
            offset: Duration::ZERO,
        }
    }

    /// Accumulated offset subtracted from reported times.
    pub fn offset(&self) -> Duration {
        self.offset
    }
}

impl EventTimer for DebugOffsetTimer {
    fn monotonic(&self) -> Duration {
        real_monotonic().saturating_sub(self.offset)
    }

    fn wall_clock(&self) -> SystemTime {
        SystemTime::now() - self.offset
    }

    fn block(
        &mut self,
        next_awake: Option<Duration>,
        pause_while_blocking: bool,
        wait: WaitFn<'_>,
    ) -> io::Result<usize> {
        let start = real_monotonic();
        let res = wait(wait_for_deadline(next_awake, self.monotonic()));

        if pause_while_blocking {
            self.offset += real_monotonic().saturating_sub(start);
        }

        res
    }
}

/// Local virtual clock.
///
/// When active, blocking jumps the clock straight to the deadline and gives
/// the readiness function a zero timeout so descriptor traffic is still
/// serviced. When paused, the deadline is passed through unchanged and the
/// process waits in real time.
#[derive(Debug)]
pub struct VirtualTimer {
    time: Duration,
    paused: PauseState,
}

impl VirtualTimer {
    pub fn new(initial: Duration) -> Self {
        VirtualTimer {
            time: initial,
            paused: PauseState::Active,
        }
    }
}

impl EventTimer for VirtualTimer {
    fn monotonic(&self) -> Duration {
        self.time
    }

    fn wall_clock(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + self.time
    }

    fn block(
        &mut self,
        next_awake: Option<Duration>,
        pause_while_blocking: bool,
        wait: WaitFn<'_>,
    ) -> io::Result<usize> {
        let Some(next) = next_awake else {
            return wait(None);
        };

        if pause_while_blocking || self.paused != PauseState::Active {
            return wait(Some(next.saturating_sub(self.time)));
        }

        self.time = self.time.max(next);
        wait(Some(Duration::ZERO))
    }

    fn set_time(&mut self, t: Duration) {
        self.time = t;
    }

    fn advance(&mut self, delta: Duration) {
        self.time += delta;
    }

    fn pause_state(&self) -> PauseState {
        self.paused
    }

    fn set_pause(&mut self, state: PauseState) {
        // The thief flag only exists on the shared timer.
        if state != PauseState::Stolen {
            self.paused = state;
        }
    }
}
