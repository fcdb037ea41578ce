//! Inter-process shared virtual clock.
//!
//! Coordinates the virtual clocks of several processes through a file-backed
//! shared memory region, so multi-process simulations get a strict global
//! ordering on their timelines. The region holds:
//!
//! 1. The event-loop mutex semaphore: only the holder may take a step
//!    through its event loop or write the shared region (except a process
//!    marking itself active).
//! 2. The barrier semaphore: posted once per active process when the global
//!    time advances, releasing everyone to compete for the mutex.
//! 3. The current global time.
//! 4. Per-process slots `{next_time, active, holds_mutex, thief, pid}`.
//!
//! On releasing the mutex, the holder publishes its own next wake time,
//! scans the table for the smallest next time, writes it to the global
//! time, and marks that smallest process inactive; a process that never
//! comes back to mark itself active again is culled on the next round,
//! which is how crashed participants drop out. Everyone then races for the
//! mutex and only returns from `block` once its own next time is due.
//!
//! The first process to open the region initializes it; creation races are
//! settled with an advisory `flock`.
//!
//! A process holding the time-thief flag ([`PauseState::Stolen`]) skips the
//! barrier entirely: it blocks in real time without advancing the shared
//! clock, then re-acquires the mutex. Useful for keeping a debugger-driven
//! process from dragging the simulation forward.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::warn;

use crate::time::{EventTimer, PauseState, WaitFn};

const MAX_PROCS: usize = 128;

#[repr(C)]
struct SharedProcSlot {
    /// Next virtual instant this process needs to run, in nanoseconds.
    next_time: u64,
    active: i32,
    holds_mutex: i32,
    thief: i32,
    pid: libc::pid_t,
}

#[repr(C)]
struct SharedState {
    evt_mutex: libc::sem_t,
    barrier: libc::sem_t,
    /// Current global virtual time in nanoseconds.
    curr_time: u64,
    num_procs: i32,
    time_thief: libc::pid_t,
    procs: [SharedProcSlot; MAX_PROCS],
}

fn nanos(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

pub struct SharedVirtualTimer {
    time: Duration,
    paused: PauseState,
    state: *mut SharedState,
    my_index: usize,
    fd: RawFd,
    path: PathBuf,
}

impl SharedVirtualTimer {
    /// Join (or create) the shared region at `path`. A fresh region starts
    /// at `initial`; joining a live one adopts the current global time.
    pub fn open(path: impl AsRef<Path>, initial: Duration) -> io::Result<SharedVirtualTimer> {
        let path = path.as_ref().to_path_buf();
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad state file path"))?;

        unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o666);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            while libc::flock(fd, libc::LOCK_EX) == -1 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    libc::close(fd);
                    return Err(err);
                }
            }

            let mut finfo: libc::stat = mem::zeroed();
            if libc::fstat(fd, &mut finfo) == -1 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let size = mem::size_of::<SharedState>();
            let init = (finfo.st_size as usize) < size;
            if init && libc::ftruncate(fd, size as libc::off_t) == -1 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let map = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if map == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            let state = map.cast::<SharedState>();

            if init {
                if libc::sem_init(&raw mut (*state).evt_mutex, 1, 1) == -1
                    || libc::sem_init(&raw mut (*state).barrier, 1, 0) == -1
                {
                    let err = io::Error::last_os_error();
                    libc::munmap(map, size);
                    libc::close(fd);
                    return Err(err);
                }
                (*state).num_procs = 0;
                (*state).time_thief = 0;
                (*state).curr_time = nanos(initial);
            }

            while libc::sem_wait(&raw mut (*state).evt_mutex) == -1 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    libc::munmap(map, size);
                    libc::close(fd);
                    return Err(err);
                }
            }

            let my_index = (*state).num_procs as usize;
            if my_index >= MAX_PROCS {
                libc::sem_post(&raw mut (*state).evt_mutex);
                libc::munmap(map, size);
                libc::close(fd);
                return Err(io::Error::other("shared timer process table is full"));
            }
            (*state).num_procs += 1;

            let me = &mut (*state).procs[my_index];
            me.next_time = (*state).curr_time;
            me.active = 1;
            me.holds_mutex = 1;
            me.thief = 0;
            me.pid = libc::getpid();

            libc::flock(fd, libc::LOCK_UN);

            Ok(SharedVirtualTimer {
                time: Duration::from_nanos((*state).curr_time),
                paused: PauseState::Active,
                state,
                my_index,
                fd,
                path,
            })
        }
    }

    fn shared(&self) -> &mut SharedState {
        unsafe { &mut *self.state }
    }

    fn me(&self) -> &mut SharedProcSlot {
        &mut self.shared().procs[self.my_index]
    }

    fn sem_wait_retry(sem: *mut libc::sem_t) {
        while unsafe { libc::sem_wait(sem) } == -1 {}
    }

    /// Advance the global clock and release everyone waiting at the barrier.
    /// Must hold the event mutex.
    fn publish_and_release(&mut self, next_awake: Duration) {
        let state = self.shared();
        state.procs[self.my_index].next_time = nanos(next_awake);

        let mut smallest: Option<usize> = None;
        let mut proc_cnt = 0;
        for (i, slot) in state.procs[..state.num_procs as usize].iter().enumerate() {
            if slot.pid > 0 && slot.active != 0 {
                proc_cnt += 1;
                let better = match smallest {
                    None => true,
                    Some(s) => slot.next_time < state.procs[s].next_time,
                };
                if better {
                    smallest = Some(i);
                }
            }
        }

        if state.time_thief == 0 {
            let smallest = smallest.expect("at least this process is active");
            state.curr_time = state.procs[smallest].next_time;
            // Marking the chosen process inactive culls crashed peers: a
            // live process re-marks itself when it passes the barrier.
            state.procs[smallest].active = 0;
            for _ in 0..proc_cnt {
                unsafe { libc::sem_post(&raw mut state.barrier) };
            }
        }

        let me = &mut state.procs[self.my_index];
        me.thief = (state.time_thief != 0 && state.time_thief == me.pid) as i32;
        me.holds_mutex = 0;
        unsafe { libc::sem_post(&raw mut state.evt_mutex) };
    }

    #[cfg(test)]
    fn global_time(&self) -> Duration {
        Duration::from_nanos(self.shared().curr_time)
    }

    #[cfg(test)]
    fn thief_pid(&self) -> libc::pid_t {
        self.shared().time_thief
    }
}

impl EventTimer for SharedVirtualTimer {
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

        if pause_while_blocking || self.paused == PauseState::Paused {
            return wait(Some(next.saturating_sub(self.time)));
        }

        debug_assert!(self.me().holds_mutex != 0);
        self.publish_and_release(next);

        if self.me().thief != 0 {
            // Stealing time: block for real without moving the global clock,
            // then take the mutex back.
            let res = wait(Some(next.saturating_sub(self.time)));
            Self::sem_wait_retry(&raw mut self.shared().evt_mutex);
            let me = self.me();
            me.active = 1;
            me.holds_mutex = 1;
            return res;
        }

        loop {
            Self::sem_wait_retry(&raw mut self.shared().barrier);
            Self::sem_wait_retry(&raw mut self.shared().evt_mutex);

            self.time = Duration::from_nanos(self.shared().curr_time);
            if next > self.time {
                // Not our turn; hand the mutex back and wait again.
                unsafe { libc::sem_post(&raw mut self.shared().evt_mutex) };
                continue;
            }

            let me = self.me();
            me.active = 1;
            me.holds_mutex = 1;
            break;
        }

        // Our turn through the loop; service descriptors without waiting.
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
        // Thief hand-off is shared state; only the mutex holder may touch it.
        if self.me().holds_mutex == 0 {
            return;
        }

        let pid = self.me().pid;
        let shared = self.shared();
        match state {
            PauseState::Stolen => {
                if shared.time_thief != 0 {
                    return;
                }
                shared.time_thief = pid;
            }
            _ => {
                if shared.time_thief == pid {
                    shared.time_thief = 0;
                }
            }
        }

        self.paused = state;
    }
}

impl Drop for SharedVirtualTimer {
    fn drop(&mut self) {
        unsafe {
            let state = &mut *self.state;
            let idx = self.my_index;
            state.procs[idx].active = 0;

            let mut live = 0;
            let mut held = false;

            if state.procs[idx].holds_mutex != 0 {
                held = true;
                if state.time_thief != 0 && state.time_thief == state.procs[idx].pid {
                    state.time_thief = 0;
                }
                state.procs[idx].pid = 0;
                state.procs[idx].holds_mutex = 0;

                for slot in &state.procs[..state.num_procs as usize] {
                    if slot.pid > 0 && slot.active != 0 {
                        live += 1;
                    }
                }
                for _ in 0..live {
                    libc::sem_post(&raw mut state.barrier);
                }
                libc::sem_post(&raw mut state.evt_mutex);
            }
            state.procs[idx].pid = 0;

            let last_out = held && live == 0;
            if last_out {
                while libc::flock(self.fd, libc::LOCK_EX) == -1 {
                    if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                        break;
                    }
                }
                libc::sem_destroy(&raw mut state.evt_mutex);
                libc::sem_destroy(&raw mut state.barrier);
            }

            libc::munmap(self.state.cast(), mem::size_of::<SharedState>());
            if last_out {
                let c_path = CString::new(self.path.as_os_str().as_bytes());
                if let Ok(c_path) = c_path {
                    if libc::unlink(c_path.as_ptr()) == -1 {
                        warn!("failed to remove shared timer file {}", self.path.display());
                    }
                }
                libc::flock(self.fd, libc::LOCK_UN);
            }
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("vclk.shm")
    }

    #[test]
    fn single_participant_advances_to_its_own_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut timer = SharedVirtualTimer::open(state_path(&dir), Duration::ZERO).unwrap();

        let mut waits = Vec::new();
        timer
            .block(Some(Duration::from_secs(5)), false, &mut |t| {
                waits.push(t);
                Ok(0)
            })
            .unwrap();

        assert_eq!(timer.monotonic(), Duration::from_secs(5));
        assert_eq!(timer.global_time(), Duration::from_secs(5));
        // The readiness function must still run, with zero timeout.
        assert_eq!(waits, vec![Some(Duration::ZERO)]);
    }

    #[test]
    fn repeated_blocks_keep_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let mut timer =
            SharedVirtualTimer::open(state_path(&dir), Duration::from_secs(100)).unwrap();

        for step in 1..=10u64 {
            timer
                .block(Some(Duration::from_secs(100 + step)), false, &mut |_| Ok(0))
                .unwrap();
        }
        assert_eq!(timer.monotonic(), Duration::from_secs(110));
    }

    #[test]
    fn thief_blocks_in_real_time_without_advancing_global_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut timer = SharedVirtualTimer::open(state_path(&dir), Duration::ZERO).unwrap();

        timer.set_pause(PauseState::Stolen);
        assert_eq!(timer.thief_pid(), unsafe { libc::getpid() });

        let mut waits = Vec::new();
        timer
            .block(Some(Duration::from_millis(10)), false, &mut |t| {
                waits.push(t);
                Ok(0)
            })
            .unwrap();

        // Real wait of the full delta, no virtual advance.
        assert_eq!(waits, vec![Some(Duration::from_millis(10))]);
        assert_eq!(timer.monotonic(), Duration::ZERO);
        assert_eq!(timer.global_time(), Duration::ZERO);

        // A thief can block repeatedly; it re-acquires the mutex each time.
        timer
            .block(Some(Duration::from_millis(20)), false, &mut |_| Ok(0))
            .unwrap();
        assert_eq!(timer.global_time(), Duration::ZERO);

        timer.set_pause(PauseState::Active);
        assert_eq!(timer.thief_pid(), 0);
    }

    #[test]
    fn paused_shared_clock_passes_deadline_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut timer =
            SharedVirtualTimer::open(state_path(&dir), Duration::from_secs(3)).unwrap();
        timer.set_pause(PauseState::Paused);

        let mut waits = Vec::new();
        timer
            .block(Some(Duration::from_secs(4)), false, &mut |t| {
                waits.push(t);
                Ok(0)
            })
            .unwrap();
        assert_eq!(waits, vec![Some(Duration::from_secs(1))]);
        assert_eq!(timer.monotonic(), Duration::from_secs(3));
    }

    #[test]
    fn state_file_is_removed_by_the_last_participant() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_path(&dir);
        {
            let _timer = SharedVirtualTimer::open(&path, Duration::ZERO).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
