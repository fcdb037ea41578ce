//! Supervised child processes.
//!
//! A spawned child gets piped stdio; stdout/stderr can be streamed into
//! the event loop with buffered reader callbacks, and a death notice fires
//! after the child has been reaped *and* its pipes have drained, so no
//! output is lost. Reaping is driven by the SIGCHLD handler the process
//! façade installs at init.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

use log::warn;

use crate::events::{EventLoop, FdResult, FdSlot};
use crate::process::ProcState;

/// Stable handle for a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildId(u64);

/// Reported to the death callback once the child is reaped and flushed.
pub struct ChildExit {
    pub pid: u32,
    pub status: Option<ExitStatus>,
}

pub type ChildDeathCallback = Box<dyn FnMut(&mut EventLoop<ProcState>, &mut ProcState, ChildExit)>;

/// Stream data callback; an empty slice signals end-of-stream.
pub type ChildStreamCallback =
    Box<dyn FnMut(&mut EventLoop<ProcState>, &mut ProcState, ChildId, &[u8])>;

#[derive(Debug, PartialEq, Eq)]
enum ChildRunState {
    Running,
    FlushPipes,
}

#[derive(Debug, Clone, Copy)]
enum ChildStream {
    Stdout,
    Stderr,
}

struct ChildEntry {
    id: ChildId,
    child: Child,
    state: ChildRunState,
    status: Option<ExitStatus>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdout_reader: bool,
    stderr_reader: bool,
    death_cb: Option<ChildDeathCallback>,
}

#[derive(Default)]
pub struct ChildTable {
    next_id: u64,
    entries: Vec<ChildEntry>,
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) < 0 {
            warn!("failed to set child pipe non-blocking");
        }
    }
}

impl ProcState {
    /// Spawn `argv` with piped stdio under event-loop supervision.
    pub fn spawn_child(&mut self, argv: &[&str]) -> io::Result<ChildId> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(out) = &stdout {
            set_nonblocking(out.as_raw_fd());
        }
        if let Some(err) = &stderr {
            set_nonblocking(err.as_raw_fd());
        }

        self.children.next_id += 1;
        let id = ChildId(self.children.next_id);
        self.children.entries.push(ChildEntry {
            id,
            child,
            state: ChildRunState::Running,
            status: None,
            stdin,
            stdout,
            stderr,
            stdout_reader: false,
            stderr_reader: false,
            death_cb: None,
        });
        Ok(id)
    }

    /// Register the callback fired once the child is reaped and flushed.
    pub fn child_death_notice(&mut self, id: ChildId, cb: ChildDeathCallback) -> bool {
        match self.child_entry_mut(id) {
            Some(entry) => {
                entry.death_cb = Some(cb);
                true
            }
            None => false,
        }
    }

    /// Stream the child's stdout into `cb` as it becomes readable.
    pub fn child_stdout_reader(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        id: ChildId,
        cb: ChildStreamCallback,
    ) -> bool {
        self.child_stream_reader(evt, id, ChildStream::Stdout, cb)
    }

    /// Stream the child's stderr into `cb` as it becomes readable.
    pub fn child_stderr_reader(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        id: ChildId,
        cb: ChildStreamCallback,
    ) -> bool {
        self.child_stream_reader(evt, id, ChildStream::Stderr, cb)
    }

    /// Close the child's stdin so it sees end-of-input.
    pub fn close_child_stdin(&mut self, id: ChildId) {
        if let Some(entry) = self.child_entry_mut(id) {
            entry.stdin = None;
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.entries.len()
    }

    fn child_entry_mut(&mut self, id: ChildId) -> Option<&mut ChildEntry> {
        self.children.entries.iter_mut().find(|e| e.id == id)
    }

    fn child_stream_reader(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        id: ChildId,
        which: ChildStream,
        mut cb: ChildStreamCallback,
    ) -> bool {
        let Some(entry) = self.child_entry_mut(id) else {
            return false;
        };
        let fd = match which {
            ChildStream::Stdout => {
                entry.stdout_reader = true;
                entry.stdout.as_ref().map(|s| s.as_raw_fd())
            }
            ChildStream::Stderr => {
                entry.stderr_reader = true;
                entry.stderr.as_ref().map(|s| s.as_raw_fd())
            }
        };
        let Some(fd) = fd else {
            return false;
        };

        evt.add_fd(
            self,
            fd,
            FdSlot::Read,
            Box::new(move |evt, st, fd, _slot| {
                let mut buf = [0u8; 4096];
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                if n > 0 {
                    cb(evt, st, id, &buf[..n as usize]);
                    return FdResult::Keep;
                }
                if n < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return FdResult::Keep;
                    }
                    warn!("child stream read failed: {err}");
                }
                // End of stream: tell the reader, drop our pipe end, and
                // see whether the death notice can fire.
                cb(evt, st, id, &[]);
                st.child_stream_closed(evt, id, which);
                FdResult::Remove
            }),
        );
        true
    }

    fn child_stream_closed(&mut self, evt: &mut EventLoop<ProcState>, id: ChildId, which: ChildStream) {
        if let Some(entry) = self.child_entry_mut(id) {
            match which {
                ChildStream::Stdout => entry.stdout = None,
                ChildStream::Stderr => entry.stderr = None,
            }
        }
        self.finish_flushed_children(evt);
    }

    /// SIGCHLD driven: collect exit statuses, then finish any child whose
    /// pipes are drained.
    pub(crate) fn reap_children(&mut self, evt: &mut EventLoop<ProcState>) {
        for entry in &mut self.children.entries {
            if entry.state != ChildRunState::Running {
                continue;
            }
            match entry.child.try_wait() {
                Ok(Some(status)) => {
                    entry.status = Some(status);
                    entry.state = ChildRunState::FlushPipes;
                    // Pipes nobody reads are dropped now; registered
                    // readers drain to EOF first.
                    if !entry.stdout_reader {
                        entry.stdout = None;
                    }
                    if !entry.stderr_reader {
                        entry.stderr = None;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("wait on child {} failed: {e}", entry.child.id()),
            }
        }
        self.finish_flushed_children(evt);
    }

    fn finish_flushed_children(&mut self, evt: &mut EventLoop<ProcState>) {
        loop {
            let idx = self.children.entries.iter().position(|e| {
                e.state == ChildRunState::FlushPipes && e.stdout.is_none() && e.stderr.is_none()
            });
            let Some(idx) = idx else {
                break;
            };

            let mut entry = self.children.entries.remove(idx);
            let exit = ChildExit {
                pid: entry.child.id(),
                status: entry.status,
            };
            if let Some(mut cb) = entry.death_cb.take() {
                cb(evt, self, exit);
            }
        }
    }
}
