//! Process façade: initialization, identity files, signals, and the glue
//! between the event loop, the command engine, and the critical store.
//!
//! A `Process` owns the event loop and a [`ProcState`]. Callbacks receive
//! both (`&mut EventLoop<ProcState>, &mut ProcState`), which is how
//! handlers schedule timers, send commands, and touch critical state
//! without shared-ownership plumbing.
//!
//! Signals never run application logic in async-signal context: the
//! installed handler does a bounded write of the signal number to a
//! self-pipe, and the event loop dispatches registered per-signal
//! callbacks from its own thread when the pipe becomes readable.

use std::any::Any;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::mem;
use std::net::UdpSocket;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use crate::child::ChildTable;
use crate::cmd::{CommandState, QueuedWrite};
use crate::critical::{CriticalError, CriticalStore, DEFAULT_DIRECTORY};
use crate::events::{EventLoop, FdResult, FdSlot, SchedResult};
use crate::net;
use crate::proto::{self, LEGACY_STATUS_REQUEST, LEGACY_STATUS_RESPONSE};
use crate::time::{DebugOffsetTimer, EventTimer, PauseState, VirtualTimer};
use crate::xdr::XdrRegistry;

/// Directory for `<pid>.proc` / `<name>.pid` identity files.
pub const DEFAULT_PID_DIR: &str = "/var/run";

/// Start with the apparent clock paused when set to `STOPPED`.
pub const ENV_DEBUGGER: &str = "LIBPROC_DEBUGGER";
/// Initialize a virtual clock to this many Unix seconds.
pub const ENV_DEBUGGER_VCLK: &str = "LIBPROC_DEBUGGER_VCLK";

/// Construction options for [`Process::with_config`].
pub struct ProcessConfig {
    /// Service name; resolves the command port and names on-disk state.
    /// Anonymous processes bind an ephemeral port and keep no files.
    pub name: Option<String>,
    pub pid_dir: PathBuf,
    pub critical_dir: PathBuf,
    /// Disable to skip the critical-state store entirely.
    pub with_critical_state: bool,
    /// Override the command port instead of resolving it by name.
    pub port: Option<u16>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            name: None,
            pid_dir: PathBuf::from(DEFAULT_PID_DIR),
            critical_dir: PathBuf::from(DEFAULT_DIRECTORY),
            with_critical_state: true,
            port: None,
        }
    }
}

impl ProcessConfig {
    pub fn named(name: &str) -> Self {
        ProcessConfig {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Signal bridge
// ---------------------------------------------------------------------------

pub type SignalCallback =
    Box<dyn FnMut(&mut EventLoop<ProcState>, &mut ProcState, i32) -> SchedResult>;

struct SignalEntry {
    signum: i32,
    cb: Option<SignalCallback>,
    received: u64,
}

pub(crate) struct SignalState {
    read_fd: RawFd,
    write_fd: RawFd,
    partial: Vec<u8>,
    handlers: Vec<SignalEntry>,
}

/// Write end of the self-pipe, readable from async-signal context.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_trampoline(
    signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let bytes = signum.to_ne_bytes();
        // A bounded pipe write is the only async-signal-safe thing we do.
        unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
    }
}

impl SignalState {
    fn new() -> io::Result<SignalState> {
        let mut fds = [0 as libc::c_int; 2];
        unsafe {
            if libc::pipe(fds.as_mut_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) < 0 {
                    let err = io::Error::last_os_error();
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                    return Err(err);
                }
            }
        }

        // First process object in wins; others run without signal support.
        let claimed = SIGNAL_WRITE_FD
            .compare_exchange(-1, fds[1], Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !claimed {
            debug!("another process instance is already catching signals");
        }

        Ok(SignalState {
            read_fd: fds[0],
            write_fd: fds[1],
            partial: Vec::with_capacity(4),
            handlers: Vec::new(),
        })
    }

    fn owns_signals(&self) -> bool {
        SIGNAL_WRITE_FD.load(Ordering::SeqCst) == self.write_fd
    }
}

// ---------------------------------------------------------------------------
// Process state
// ---------------------------------------------------------------------------

/// Everything a running process owns besides the event loop itself.
pub struct ProcState {
    pub(crate) name: Option<String>,
    registry: Rc<XdrRegistry>,
    pub(crate) cmds: CommandState,
    critical: Option<CriticalStore>,
    pub(crate) cmd_socket: UdpSocket,
    pub(crate) tx_socket: UdpSocket,
    pub(crate) write_queue: VecDeque<QueuedWrite>,
    signals: SignalState,
    pub(crate) children: ChildTable,
    identity_files: Vec<PathBuf>,
    context: Option<Box<dyn Any>>,
}

impl ProcState {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The process-wide type registry. Mutate only before `run`.
    pub fn registry(&self) -> &XdrRegistry {
        &self.registry
    }

    pub(crate) fn registry_rc(&self) -> &Rc<XdrRegistry> {
        &self.registry
    }

    /// Local port of the command socket.
    pub fn udp_port(&self) -> u16 {
        self.cmd_socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// Stash arbitrary application context, retrievable from handlers.
    pub fn set_context<T: Any>(&mut self, ctx: T) {
        self.context = Some(Box::new(ctx));
    }

    pub fn context<T: Any>(&self) -> Option<&T> {
        self.context.as_deref().and_then(|c| c.downcast_ref())
    }

    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.context.as_deref_mut().and_then(|c| c.downcast_mut())
    }

    pub fn save_critical_state(&mut self, payload: &[u8]) -> Result<usize, CriticalError> {
        match self.critical.as_mut() {
            Some(store) => store.save(payload),
            None => Err(CriticalError::Dirty),
        }
    }

    pub fn read_critical_state(&mut self, out: &mut [u8]) -> Result<usize, CriticalError> {
        match self.critical.as_mut() {
            Some(store) => store.read(out),
            None => Err(CriticalError::Dirty),
        }
    }

    pub fn critical_store_mut(&mut self) -> Option<&mut CriticalStore> {
        self.critical.as_mut()
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Register a callback for `signum`. Multiple callbacks per signal are
    /// dispatched in registration order; one returning
    /// [`SchedResult::Remove`] is dropped.
    pub fn add_signal_handler(&mut self, signum: i32, cb: SignalCallback) -> io::Result<()> {
        if !self.signals.owns_signals() {
            return Err(io::Error::other(
                "a different process instance is already catching signals",
            ));
        }

        self.signals.handlers.push(SignalEntry {
            signum,
            cb: Some(cb),
            received: 0,
        });

        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = signal_trampoline as usize;
            libc::sigfillset(&mut sa.sa_mask);
            sa.sa_flags = libc::SA_SIGINFO;
            if libc::sigaction(signum, &sa, std::ptr::null_mut()) == -1 {
                self.signals.handlers.pop();
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }

    /// How many times `signum` has been delivered to registered callbacks.
    pub fn signal_received_count(&self, signum: i32) -> u64 {
        self.signals
            .handlers
            .iter()
            .filter(|h| h.signum == signum)
            .map(|h| h.received)
            .sum()
    }

    fn handle_signal_pipe(&mut self, evt: &mut EventLoop<ProcState>) -> FdResult {
        loop {
            let mut tmp = [0u8; 4];
            let want = 4 - self.signals.partial.len();
            let n = unsafe {
                libc::read(self.signals.read_fd, tmp.as_mut_ptr().cast(), want)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return FdResult::Keep;
                }
                warn!("signal pipe read failed, closing: {err}");
                return FdResult::Remove;
            }
            if n == 0 {
                warn!("signal pipe closed, removing event");
                return FdResult::Remove;
            }

            self.signals.partial.extend_from_slice(&tmp[..n as usize]);
            if self.signals.partial.len() < 4 {
                continue;
            }

            let signum = i32::from_ne_bytes(self.signals.partial[..4].try_into().unwrap());
            self.signals.partial.clear();
            self.dispatch_signal(evt, signum);
        }
    }

    fn dispatch_signal(&mut self, evt: &mut EventLoop<ProcState>, signum: i32) {
        let mut i = 0;
        while i < self.signals.handlers.len() {
            if self.signals.handlers[i].signum != signum {
                i += 1;
                continue;
            }
            self.signals.handlers[i].received += 1;
            let Some(mut cb) = self.signals.handlers[i].cb.take() else {
                i += 1;
                continue;
            };

            let res = cb(evt, self, signum);

            let still_here = i < self.signals.handlers.len()
                && self.signals.handlers[i].signum == signum
                && self.signals.handlers[i].cb.is_none();
            if still_here {
                match res {
                    SchedResult::Keep => {
                        self.signals.handlers[i].cb = Some(cb);
                        i += 1;
                    }
                    SchedResult::Remove => {
                        self.signals.handlers.remove(i);
                    }
                }
            } else {
                i += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The façade
// ---------------------------------------------------------------------------

pub struct Process {
    events: EventLoop<ProcState>,
    state: ProcState,
}

impl Process {
    /// Initialize a named process: resolve and bind the command port, write
    /// identity files, set up signals, builtin types and handlers, and load
    /// critical state.
    pub fn init(name: &str) -> io::Result<Process> {
        Self::with_config(ProcessConfig::named(name))
    }

    pub fn with_config(config: ProcessConfig) -> io::Result<Process> {
        let mut events: EventLoop<ProcState> = EventLoop::new();
        apply_debugger_env(&mut events);

        let cmd_socket = match (&config.name, config.port) {
            (_, Some(port)) => net::udp_socket(port)?,
            (Some(name), None) => net::named_socket(name)?,
            (None, None) => net::udp_socket(0)?,
        };
        let tx_socket = net::udp_socket(0)?;

        let registry = Rc::new(XdrRegistry::new());
        proto::register_builtin_types(&registry);

        let mut state = ProcState {
            name: config.name.clone(),
            registry,
            cmds: CommandState::new(),
            critical: None,
            cmd_socket,
            tx_socket,
            write_queue: VecDeque::new(),
            signals: SignalState::new()?,
            children: ChildTable::default(),
            identity_files: Vec::new(),
            context: None,
        };

        // The engine's heartbeat counters double as the data-request
        // populator for the heartbeat type.
        let beats = Rc::clone(&state.cmds.beats);
        state.registry.register_populator(
            proto::TYPE_HEARTBEAT,
            Box::new(move || {
                let mut b = beats.borrow_mut();
                b.heartbeats += 1;
                Ok(Box::new(b.clone()))
            }),
        );

        if let Some(name) = &config.name {
            write_identity_files(&config.pid_dir, name, &mut state.identity_files);
        }

        // Socket readiness drives the whole command engine.
        let cmd_fd = state.cmd_socket.as_raw_fd();
        events.add_fd(
            &mut state,
            cmd_fd,
            FdSlot::Read,
            Box::new(|evt, st, _, _| {
                st.handle_command_packet(evt);
                FdResult::Keep
            }),
        );
        let tx_fd = state.tx_socket.as_raw_fd();
        events.add_fd(
            &mut state,
            tx_fd,
            FdSlot::Read,
            Box::new(|evt, st, _, _| {
                st.handle_tx_packet(evt);
                FdResult::Keep
            }),
        );

        let sig_fd = state.signals.read_fd;
        events.add_fd(
            &mut state,
            sig_fd,
            FdSlot::Read,
            Box::new(|evt, st, _, _| st.handle_signal_pipe(evt)),
        );

        if let Err(e) = state.add_signal_handler(
            libc::SIGCHLD,
            Box::new(|evt, st, _| {
                st.reap_children(evt);
                SchedResult::Keep
            }),
        ) {
            debug!("child reaping disabled: {e}");
        }

        state.set_xdr_handler(
            proto::CMD_DATA_REQ,
            Box::new(|evt, st, cmd, src| st.handle_data_request(evt, cmd, src)),
        );
        state.set_legacy_handler(
            LEGACY_STATUS_REQUEST,
            Box::new(|evt, st, lc| {
                let src = lc.src;
                if let Err(e) = st.send_legacy_to(evt, LEGACY_STATUS_RESPONSE, &[0], src) {
                    warn!("failed to answer status poll: {e}");
                }
            }),
        );

        if config.with_critical_state {
            if let Some(name) = &config.name {
                state.critical = Some(CriticalStore::open(name, &config.critical_dir));
            }
        }

        info!(
            "process '{}' initialized on port {}",
            config.name.as_deref().unwrap_or("<anonymous>"),
            state.udp_port()
        );

        Ok(Process { events, state })
    }

    /// Enter the event loop until [`EventLoop::exit`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        self.events.run(&mut self.state)
    }

    pub fn events(&mut self) -> &mut EventLoop<ProcState> {
        &mut self.events
    }

    pub fn state(&mut self) -> &mut ProcState {
        &mut self.state
    }

    /// Split borrow for APIs that need the loop and the state together.
    pub fn parts(&mut self) -> (&mut EventLoop<ProcState>, &mut ProcState) {
        (&mut self.events, &mut self.state)
    }

    /// Convenience forward of [`ProcState::send_command`].
    #[allow(clippy::too_many_arguments)]
    pub fn send_command(
        &mut self,
        cmd: u32,
        param_type: u32,
        params: Option<&dyn Any>,
        dest: std::net::SocketAddrV4,
        cb: Option<(crate::cmd::ResponseCallback, crate::cmd::CallbackStyle)>,
        timeout: Duration,
    ) -> crate::xdr::XdrResult<u32> {
        let (events, state) = self.parts();
        state.send_command(events, cmd, param_type, params, dest, cb, timeout)
    }

    /// Tear down: run fd cleanups, drop timers, remove identity files.
    pub fn cleanup(mut self) {
        let (events, state) = (&mut self.events, &mut self.state);
        events.shutdown(state);
        if let Some(store) = state.critical.as_mut() {
            store.cleanup();
        }
        // The Drop impl handles identity files and the signal pipe.
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        for path in self.state.identity_files.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                debug!("failed to remove {}: {e}", path.display());
            }
        }

        let _ = SIGNAL_WRITE_FD.compare_exchange(
            self.state.signals.write_fd,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        unsafe {
            libc::close(self.state.signals.read_fd);
            libc::close(self.state.signals.write_fd);
        }
    }
}

/// Honor the debugger environment hooks.
fn apply_debugger_env(events: &mut EventLoop<ProcState>) {
    let stopped = std::env::var(ENV_DEBUGGER).is_ok_and(|v| v == "STOPPED");

    if let Ok(v) = std::env::var(ENV_DEBUGGER_VCLK) {
        match v.parse::<u64>() {
            Ok(secs) => {
                let mut timer = VirtualTimer::new(Duration::from_secs(secs));
                if stopped {
                    timer.set_pause(PauseState::Paused);
                }
                events.set_timer(Box::new(timer));
                return;
            }
            Err(_) => warn!("ignoring unparsable {ENV_DEBUGGER_VCLK}={v}"),
        }
    }

    if stopped {
        events.set_timer(Box::new(DebugOffsetTimer::new()));
        events.set_debug_paused(true);
    }
}

/// Write `<pid>.proc` and `<name>.pid`, reclaiming stale files left by a
/// previous instance of this service.
fn write_identity_files(pid_dir: &std::path::Path, name: &str, created: &mut Vec<PathBuf>) {
    let pid = std::process::id();

    let pid_file = pid_dir.join(format!("{name}.pid"));
    if let Ok(old) = fs::read_to_string(&pid_file) {
        if let Ok(old_pid) = old.trim().parse::<u32>() {
            if old_pid > 1 {
                let stale = pid_dir.join(format!("{old_pid}.proc"));
                if let Ok(old_name) = fs::read_to_string(&stale) {
                    if old_name.trim() == name {
                        let _ = fs::remove_file(&stale);
                    }
                }
            }
        }
    }

    let proc_file = pid_dir.join(format!("{pid}.proc"));
    match fs::write(&proc_file, name) {
        Ok(()) => created.push(proc_file),
        Err(e) => warn!("failed to write proc file {}: {e}", proc_file.display()),
    }
    match fs::write(&pid_file, pid.to_string()) {
        Ok(()) => created.push(pid_file),
        Err(e) => warn!("failed to write pid file {}: {e}", pid_file.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port_hint: &str, dir: &tempfile::TempDir) -> ProcessConfig {
        ProcessConfig {
            name: Some(port_hint.to_string()),
            pid_dir: dir.path().to_path_buf(),
            critical_dir: dir.path().join("critical"),
            with_critical_state: true,
            port: None,
        }
    }

    #[test]
    fn init_writes_identity_files_and_binds_named_port() {
        let dir = tempfile::tempdir().unwrap();
        // Numeric service names resolve straight to a port.
        let proc = Process::with_config(test_config("47201", &dir)).unwrap();
        assert_eq!(proc.state.udp_port(), 47201);

        let pid = std::process::id();
        assert_eq!(
            fs::read_to_string(dir.path().join(format!("{pid}.proc"))).unwrap(),
            "47201"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("47201.pid"))
                .unwrap()
                .trim()
                .parse::<u32>()
                .unwrap(),
            pid
        );

        drop(proc);
        assert!(!dir.path().join("47201.pid").exists());
        assert!(!dir.path().join(format!("{pid}.proc")).exists());
    }

    #[test]
    fn critical_state_round_trips_through_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut proc = Process::with_config(test_config("47202", &dir)).unwrap();
        proc.state().save_critical_state(&[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        proc.state().read_critical_state(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn anonymous_process_has_no_critical_store() {
        let mut proc = Process::with_config(ProcessConfig {
            with_critical_state: false,
            ..Default::default()
        })
        .unwrap();
        assert!(proc.state().name().is_none());
        assert!(proc.state().save_critical_state(&[1]).is_err());
        assert_ne!(proc.state().udp_port(), 0);
    }

    #[test]
    fn context_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut proc = Process::with_config(test_config("47203", &dir)).unwrap();
        proc.state().set_context(42usize);
        assert_eq!(proc.state().context::<usize>(), Some(&42));
        *proc.state().context_mut::<usize>().unwrap() = 7;
        assert_eq!(proc.state().context::<usize>(), Some(&7));
    }
}
