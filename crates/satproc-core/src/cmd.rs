//! Command dispatch and response correlation.
//!
//! Two wire formats share the command socket:
//!
//! - **Legacy**: first byte is a command number in 1..=255, the rest is an
//!   opaque payload. Routed through a 256-slot handler table.
//! - **XDR**: the leading u32 has byte0 == 0 (command numbers start at
//!   256). If it equals the reserved response tag the datagram resolves a
//!   pending request; otherwise it decodes as a [`Command`] and dispatches
//!   through the registered handler table.
//!
//! Every sent command that wants a reply registers a pending-response
//! record keyed `(ipcref, peer address)` with a timeout timer. Exactly one
//! of response, timeout, or cancellation resolves it, and the record is
//! freed on that first transition.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::events::{EventLoop, FdResult, SchedResult};
use crate::net;
use crate::process::ProcState;
use crate::proto::{
    self, Command, DataRequest, Heartbeat, MAX_PACKET_SIZE, OpaqueStruct, OpaqueStructList,
    PopulatorError, RESULT_ALLOCATION_ERROR, RESULT_INCORRECT_PARAMETER_TYPE, RESULT_SUCCESS,
    RESULT_UNSUPPORTED, Response, TYPE_DATA_REQUEST, TYPE_OPAQUE_STRUCT_LIST,
    TYPE_POPULATOR_ERROR, TYPE_VOID, Void,
};
use crate::queue::TimerId;
use crate::xdr::XdrResult;

/// A received legacy datagram.
pub struct LegacyCommand<'a> {
    pub cmd: u8,
    pub data: &'a [u8],
    pub src: SocketAddrV4,
}

pub type LegacyHandler =
    Box<dyn FnMut(&mut EventLoop<ProcState>, &mut ProcState, LegacyCommand<'_>)>;

pub type XdrHandler =
    Box<dyn FnMut(&mut EventLoop<ProcState>, &mut ProcState, &Command, SocketAddrV4)>;

pub type MulticastHandler =
    Box<dyn FnMut(&mut EventLoop<ProcState>, &mut ProcState, u8, &[u8], SocketAddrV4)>;

/// How a response callback wants its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStyle {
    /// The raw response datagram bytes.
    Raw,
    /// A pre-decoded [`Response`].
    Decoded,
}

/// Resolution of an outstanding command.
pub enum CommandOutcome<'a> {
    /// No response arrived before the timeout.
    TimedOut,
    /// The command was cancelled locally.
    Cancelled,
    Raw(&'a [u8]),
    Decoded(&'a Response),
}

pub type ResponseCallback =
    Box<dyn FnMut(&mut EventLoop<ProcState>, &mut ProcState, CommandOutcome<'_>)>;

struct PendingResponse {
    ipcref: u32,
    peer: SocketAddrV4,
    cb: ResponseCallback,
    style: CallbackStyle,
    timeout: Option<TimerId>,
}

struct LegacyEntry {
    handler: LegacyHandler,
    protected: bool,
}

struct McastHandlerEntry {
    /// `None` is the wildcard: deliver every command number.
    filter: Option<u8>,
    cb: Option<MulticastHandler>,
}

struct McastGroupState {
    group: Ipv4Addr,
    port: u16,
    socket: UdpSocket,
    handlers: Vec<McastHandlerEntry>,
}

// ---------------------------------------------------------------------------
// Catalogs
// ---------------------------------------------------------------------------

/// Name/summary metadata for an XDR command, used for lookup by name and
/// usage output. Entries with `command == 0` are data-request shortcuts:
/// they expand into a data request for `datareq_types`.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: u32,
    pub param_type: u32,
    pub name: &'static str,
    pub summary: &'static str,
    pub datareq_types: &'static [u32],
}

#[derive(Default)]
pub struct CommandCatalog {
    by_number: HashMap<u32, CommandSpec>,
    shortcuts: Vec<CommandSpec>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-loaded with the built-in protocol commands.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(CommandSpec {
            command: proto::CMD_STATUS,
            param_type: 0,
            name: "proc-status",
            summary: "Reports the general health status of the process",
            datareq_types: &[],
        });
        catalog.register(CommandSpec {
            command: proto::CMD_DATA_REQ,
            param_type: TYPE_DATA_REQUEST,
            name: "proc-data-req",
            summary: "Requests a specific set of telemetry items from the process",
            datareq_types: &[],
        });
        catalog.register(CommandSpec {
            command: 0,
            param_type: TYPE_DATA_REQUEST,
            name: "proc-heartbeat",
            summary: "Returns process aliveness status information",
            datareq_types: &[proto::TYPE_HEARTBEAT],
        });
        catalog
    }

    pub fn register(&mut self, spec: CommandSpec) {
        if spec.command != 0 {
            self.by_number.insert(spec.command, spec);
        } else if !spec.datareq_types.is_empty() {
            self.shortcuts.push(spec);
        }
    }

    pub fn by_number(&self, command: u32) -> Option<&CommandSpec> {
        self.by_number.get(&command)
    }

    pub fn by_name(&self, name: &str) -> Option<&CommandSpec> {
        self.by_number
            .values()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .or_else(|| {
                self.shortcuts
                    .iter()
                    .find(|s| s.name.eq_ignore_ascii_case(name))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.by_number.values().chain(self.shortcuts.iter())
    }
}

#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub id: u32,
    pub name: &'static str,
    pub description: &'static str,
}

/// Render table for wire-level result codes.
#[derive(Default)]
pub struct ErrorCatalog {
    by_id: HashMap<u32, ErrorInfo>,
}

impl ErrorCatalog {
    pub fn with_builtins() -> Self {
        let mut catalog = ErrorCatalog::default();
        for info in [
            ErrorInfo {
                id: RESULT_SUCCESS,
                name: "SUCCESS",
                description: "No error - success",
            },
            ErrorInfo {
                id: RESULT_INCORRECT_PARAMETER_TYPE,
                name: "INCORRECT_PARAMETER_TYPE",
                description: "Type of command parameter didn't match the expected type",
            },
            ErrorInfo {
                id: RESULT_UNSUPPORTED,
                name: "UNSUPPORTED",
                description: "The target process does not support the command sent",
            },
            ErrorInfo {
                id: RESULT_ALLOCATION_ERROR,
                name: "ALLOCATION_ERR",
                description: "Failed to allocate heap memory",
            },
        ] {
            catalog.register(info);
        }
        catalog
    }

    pub fn register(&mut self, info: ErrorInfo) {
        self.by_id.insert(info.id, info);
    }

    /// Human-readable message for a result code; empty when unknown.
    pub fn message(&self, id: u32) -> &str {
        match self.by_id.get(&id) {
            Some(info) if !info.description.is_empty() => info.description,
            Some(info) => info.name,
            None => "",
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorInfo> {
        self.by_id.values()
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

pub struct CommandState {
    legacy: Vec<Option<LegacyEntry>>,
    xdr_handlers: HashMap<u32, XdrHandler>,
    pub catalog: CommandCatalog,
    pub errors: ErrorCatalog,
    pending: Vec<PendingResponse>,
    next_ipcref: u32,
    /// Shared with the heartbeat populator.
    pub(crate) beats: Rc<std::cell::RefCell<Heartbeat>>,
    mcast: Vec<McastGroupState>,
}

impl CommandState {
    pub(crate) fn new() -> CommandState {
        CommandState {
            legacy: (0..256).map(|_| None).collect(),
            xdr_handlers: HashMap::new(),
            catalog: CommandCatalog::with_builtins(),
            errors: ErrorCatalog::with_builtins(),
            pending: Vec::new(),
            next_ipcref: 1,
            beats: Rc::new(std::cell::RefCell::new(Heartbeat::default())),
            mcast: Vec::new(),
        }
    }

    fn take_pending(&mut self, ipcref: u32, peer: SocketAddrV4) -> Option<PendingResponse> {
        let idx = self
            .pending
            .iter()
            .position(|p| p.ipcref == ipcref && p.peer == peer)?;
        Some(self.pending.swap_remove(idx))
    }

    /// Number of unresolved sent commands.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn recv_v4(sock: &UdpSocket) -> Option<(Vec<u8>, SocketAddrV4)> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    match sock.recv_from(&mut buf) {
        Ok((n, SocketAddr::V4(src))) => {
            buf.truncate(n);
            Some((buf, src))
        }
        Ok((_, src)) => {
            debug!("ignoring non-IPv4 datagram from {src}");
            None
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
        Err(e) => {
            warn!("socket read failed: {e}");
            None
        }
    }
}

/// Deferred datagram parked on a write slot after `EAGAIN`.
pub(crate) struct QueuedWrite {
    pub fd: RawFd,
    pub data: Vec<u8>,
    pub dest: SocketAddrV4,
}

// ---------------------------------------------------------------------------
// Engine entry points (on the process state)
// ---------------------------------------------------------------------------

impl ProcState {
    /// Readable callback of the command socket.
    pub(crate) fn handle_command_packet(&mut self, evt: &mut EventLoop<ProcState>) {
        let Some((buf, src)) = recv_v4(&self.cmd_socket) else {
            return;
        };
        if buf.is_empty() {
            return;
        }

        // Command 0 was never assigned; a zero first byte marks the XDR
        // format.
        if buf[0] != 0 {
            self.dispatch_legacy(evt, &buf, src);
        } else {
            self.dispatch_xdr(evt, &buf, src);
        }
    }

    /// Readable callback of the secondary transmit socket; responses to
    /// secondary sends are logged, never dispatched.
    pub(crate) fn handle_tx_packet(&mut self, _evt: &mut EventLoop<ProcState>) {
        if let Some((buf, src)) = recv_v4(&self.tx_socket) {
            if !buf.is_empty() {
                info!("received TX response {:#04x} from {src}", buf[0]);
            }
        }
    }

    fn dispatch_legacy(&mut self, evt: &mut EventLoop<ProcState>, buf: &[u8], src: SocketAddrV4) {
        let cmd = buf[0];
        self.cmds.beats.borrow_mut().commands += 1;
        debug!("received legacy command {cmd:#04x} from {src}");

        let Some(mut entry) = self.cmds.legacy[cmd as usize].take() else {
            info!("received unregistered legacy command {cmd:#04x}");
            return;
        };

        if entry.protected {
            warn!("protected commands are not supported");
            self.cmds.legacy[cmd as usize] = Some(entry);
            self.send_error_raw(0, RESULT_UNSUPPORTED, src);
            return;
        }

        (entry.handler)(
            evt,
            self,
            LegacyCommand {
                cmd,
                data: &buf[1..],
                src,
            },
        );

        // Only restore if the handler did not re-register the slot.
        if self.cmds.legacy[cmd as usize].is_none() {
            self.cmds.legacy[cmd as usize] = Some(entry);
        }
    }

    fn dispatch_xdr(&mut self, evt: &mut EventLoop<ProcState>, buf: &[u8], src: SocketAddrV4) {
        let Ok((cmd_num, _)) = crate::xdr::decode_u32(buf) else {
            warn!("runt XDR datagram of {} bytes from {src}", buf.len());
            return;
        };

        if cmd_num == proto::CMD_RESPONSE {
            self.cmds.beats.borrow_mut().responses += 1;
            self.handle_xdr_response(evt, buf, src);
            return;
        }

        self.cmds.beats.borrow_mut().commands += 1;
        let command = match self.registry().decode_as(proto::TYPE_COMMAND, buf) {
            Ok((value, _)) => {
                let Ok(command) = value.downcast::<Command>() else {
                    return;
                };
                *command
            }
            Err(e) => {
                warn!("failed to decode XDR command of length {}: {e}", buf.len());
                self.send_error_raw(0, RESULT_INCORRECT_PARAMETER_TYPE, src);
                return;
            }
        };

        match self.cmds.xdr_handlers.remove(&command.cmd) {
            Some(mut handler) => {
                handler(evt, self, &command, src);
                self.cmds.xdr_handlers.entry(command.cmd).or_insert(handler);
            }
            None => {
                self.respond_error(&command, RESULT_UNSUPPORTED, src);
            }
        }
    }

    fn handle_xdr_response(&mut self, evt: &mut EventLoop<ProcState>, buf: &[u8], src: SocketAddrV4) {
        let Ok((hdr, _)) = proto::decode_response_header(buf) else {
            return;
        };
        if hdr.cmd != proto::CMD_RESPONSE {
            return;
        }

        // Exact (ipcref, peer) match only; anything else is discarded.
        let Some(entry) = self.cmds.take_pending(hdr.ipcref, src) else {
            debug!("discarding unmatched response ipcref {} from {src}", hdr.ipcref);
            return;
        };
        if let Some(tid) = entry.timeout {
            evt.remove_timer(tid);
        }

        let mut cb = entry.cb;
        match entry.style {
            CallbackStyle::Raw => cb(evt, self, CommandOutcome::Raw(buf)),
            CallbackStyle::Decoded => {
                match self.registry().decode_as(proto::TYPE_RESPONSE, buf) {
                    Ok((value, _)) => {
                        let Ok(resp) = value.downcast::<Response>() else {
                            return;
                        };
                        cb(evt, self, CommandOutcome::Decoded(&resp));
                    }
                    Err(e) => warn!("failed to decode response from {src}: {e}"),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    /// Install the handler for a legacy command number (1..=255).
    pub fn set_legacy_handler(&mut self, cmd: u8, handler: LegacyHandler) {
        if cmd == 0 {
            warn!("legacy command 0 is reserved for the XDR format");
            return;
        }
        self.cmds.legacy[cmd as usize] = Some(LegacyEntry {
            handler,
            protected: false,
        });
    }

    /// Mark a legacy command protected; protected commands answer
    /// `UNSUPPORTED` until a protection mechanism exists again.
    pub fn protect_legacy_command(&mut self, cmd: u8) {
        if let Some(entry) = self.cmds.legacy[cmd as usize].as_mut() {
            entry.protected = true;
        }
    }

    /// Install the handler for an XDR command number.
    pub fn set_xdr_handler(&mut self, cmd: u32, handler: XdrHandler) {
        self.cmds.xdr_handlers.insert(cmd, handler);
    }

    // ------------------------------------------------------------------
    // Send paths
    // ------------------------------------------------------------------

    /// Send an XDR command. When `cb` is given, a pending-response record
    /// is registered and a timer armed for `timeout`; the callback fires
    /// exactly once with a response, timeout, or cancellation.
    ///
    /// Returns the assigned ipcref.
    pub fn send_command(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        cmd: u32,
        param_type: u32,
        params: Option<&dyn Any>,
        dest: SocketAddrV4,
        cb: Option<(ResponseCallback, CallbackStyle)>,
        timeout: Duration,
    ) -> XdrResult<u32> {
        let ipcref = self.cmds.next_ipcref;
        self.cmds.next_ipcref = self.cmds.next_ipcref.wrapping_add(1);

        let buf = proto::encode_command(self.registry(), cmd, ipcref, param_type, params)?;
        if let Err(e) = self.cmd_socket.send_to(&buf, dest) {
            warn!("failed to send command {cmd} to {dest}: {e}");
        }

        if let Some((cb, style)) = cb {
            self.cmds.pending.push(PendingResponse {
                ipcref,
                peer: dest,
                cb,
                style,
                timeout: None,
            });

            if !timeout.is_zero() {
                let peer = dest;
                let tid = evt.add_timer(
                    timeout,
                    Box::new(move |evt, st: &mut ProcState| {
                        if let Some(entry) = st.cmds.take_pending(ipcref, peer) {
                            let mut cb = entry.cb;
                            cb(evt, st, CommandOutcome::TimedOut);
                        }
                        SchedResult::Remove
                    }),
                );
                if let Some(p) = self
                    .cmds
                    .pending
                    .iter_mut()
                    .find(|p| p.ipcref == ipcref && p.peer == dest)
                {
                    p.timeout = Some(tid);
                }
            }
        }

        Ok(ipcref)
    }

    /// Locally resolve an outstanding command without disturbing the peer.
    pub fn cancel_command(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        ipcref: u32,
        peer: SocketAddrV4,
    ) -> bool {
        let Some(entry) = self.cmds.take_pending(ipcref, peer) else {
            return false;
        };
        if let Some(tid) = entry.timeout {
            evt.remove_timer(tid);
        }
        let mut cb = entry.cb;
        cb(evt, self, CommandOutcome::Cancelled);
        true
    }

    /// Reply to `cmd` with a success result and a typed payload.
    pub fn respond(
        &mut self,
        cmd: &Command,
        data_type: u32,
        data: Option<&dyn Any>,
        dest: SocketAddrV4,
    ) {
        match proto::encode_response(self.registry(), cmd.ipcref, RESULT_SUCCESS, data_type, data) {
            Ok(buf) => {
                if let Err(e) = self.cmd_socket.send_to(&buf, dest) {
                    warn!("failed to send response to {dest}: {e}");
                }
            }
            Err(e) => {
                warn!("failed to encode response payload: {e}");
                self.respond_error(cmd, RESULT_ALLOCATION_ERROR, dest);
            }
        }
    }

    /// Reply to `cmd` with an error result code and a void payload.
    pub fn respond_error(&mut self, cmd: &Command, result: u32, dest: SocketAddrV4) {
        self.send_error_raw(cmd.ipcref, result, dest);
    }

    fn send_error_raw(&mut self, ipcref: u32, result: u32, dest: SocketAddrV4) {
        match proto::encode_response(self.registry(), ipcref, result, TYPE_VOID, Some(&Void)) {
            Ok(buf) => {
                if let Err(e) = self.cmd_socket.send_to(&buf, dest) {
                    warn!("failed to send error response to {dest}: {e}");
                }
            }
            Err(e) => warn!("failed to encode error response: {e}"),
        }
    }

    /// Send a legacy command to a named service on localhost.
    pub fn send_legacy(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        cmd: u8,
        data: &[u8],
        dest_service: &str,
    ) -> io::Result<()> {
        let port = net::service_port(dest_service).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no port known for service '{dest_service}'"),
            )
        })?;
        self.send_legacy_to(evt, cmd, data, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    /// Send a legacy command to an explicit destination.
    pub fn send_legacy_to(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        cmd: u8,
        data: &[u8],
        dest: SocketAddrV4,
    ) -> io::Result<()> {
        self.legacy_sendto(evt, false, cmd, data, dest)
    }

    /// Legacy send over the secondary socket, keeping any reply away from
    /// the command port.
    pub fn send_legacy_secondary(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        cmd: u8,
        data: &[u8],
        dest: SocketAddrV4,
    ) -> io::Result<()> {
        self.legacy_sendto(evt, true, cmd, data, dest)
    }

    fn legacy_sendto(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        secondary: bool,
        cmd: u8,
        data: &[u8],
        dest: SocketAddrV4,
    ) -> io::Result<()> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(cmd);
        buf.extend_from_slice(data);

        let sock = if secondary { &self.tx_socket } else { &self.cmd_socket };
        let fd = sock.as_raw_fd();
        match sock.send_to(&buf, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.queue_write(evt, fd, buf, dest);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Park a datagram until the socket becomes writable.
    fn queue_write(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        fd: RawFd,
        data: Vec<u8>,
        dest: SocketAddrV4,
    ) {
        let pending_for_fd = self.write_queue.iter().any(|w| w.fd == fd);
        self.write_queue.push_back(QueuedWrite { fd, data, dest });

        if !pending_for_fd {
            evt.add_fd(
                self,
                fd,
                crate::events::FdSlot::Write,
                Box::new(move |_evt, st, fd, _slot| st.flush_queued_writes(fd)),
            );
        }
    }

    fn flush_queued_writes(&mut self, fd: RawFd) -> FdResult {
        let Some(idx) = self.write_queue.iter().position(|w| w.fd == fd) else {
            return FdResult::Remove;
        };
        let Some(entry) = self.write_queue.remove(idx) else {
            return FdResult::Remove;
        };

        let sock = if fd == self.tx_socket.as_raw_fd() {
            &self.tx_socket
        } else {
            &self.cmd_socket
        };
        match sock.send_to(&entry.data, entry.dest) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.write_queue.push_front(entry);
                return FdResult::Keep;
            }
            Err(e) => warn!("deferred write to {} failed: {e}", entry.dest),
            Ok(_) => {}
        }

        if self.write_queue.iter().any(|w| w.fd == fd) {
            FdResult::Keep
        } else {
            FdResult::Remove
        }
    }

    /// Deliver a legacy command to this process's own handler table without
    /// touching the network.
    pub fn loopback_legacy(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        cmd: u8,
        data: &[u8],
    ) -> io::Result<()> {
        if cmd == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "command 0 is reserved"));
        }
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(cmd);
        buf.extend_from_slice(data);
        self.dispatch_legacy(
            evt,
            &buf,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Multicast
    // ------------------------------------------------------------------

    /// Send a legacy command to this process's service multicast group.
    /// No response tracking.
    pub fn send_multicast(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        cmd: u8,
        data: &[u8],
    ) -> io::Result<()> {
        let Some(name) = self.name().map(str::to_string) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "anonymous processes have no multicast group",
            ));
        };
        let Some((group, port)) = net::service_multicast(&name) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no multicast group for service '{name}'"),
            ));
        };
        self.send_legacy_to(evt, cmd, data, SocketAddrV4::new(group, port))
    }

    /// Register a handler for multicast packets of a named service, with a
    /// specific legacy command byte or wildcard (`None`). Group membership
    /// is joined on the first handler.
    pub fn add_multicast_handler(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        service: &str,
        filter: Option<u8>,
        cb: MulticastHandler,
    ) -> io::Result<()> {
        let Some((group, port)) = net::service_multicast(service) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no multicast group for service '{service}'"),
            ));
        };

        let existing = self
            .cmds
            .mcast
            .iter_mut()
            .position(|g| g.group == group && g.port == port);
        let gi = match existing {
            Some(gi) => gi,
            None => {
                let socket = net::multicast_socket(group, port)?;
                let fd = socket.as_raw_fd();
                self.cmds.mcast.push(McastGroupState {
                    group,
                    port,
                    socket,
                    handlers: Vec::new(),
                });
                evt.add_fd(
                    self,
                    fd,
                    crate::events::FdSlot::Read,
                    Box::new(move |evt, st, fd, _slot| {
                        st.handle_multicast_packet(evt, fd);
                        FdResult::Keep
                    }),
                );
                self.cmds.mcast.len() - 1
            }
        };

        self.cmds.mcast[gi].handlers.push(McastHandlerEntry {
            filter,
            cb: Some(cb),
        });
        Ok(())
    }

    /// Drop the handlers matching `filter`; the group is left and its
    /// socket closed when the last handler goes.
    pub fn remove_multicast_handler(
        &mut self,
        evt: &mut EventLoop<ProcState>,
        service: &str,
        filter: Option<u8>,
    ) {
        let Some((group, port)) = net::service_multicast(service) else {
            return;
        };
        let Some(gi) = self
            .cmds
            .mcast
            .iter()
            .position(|g| g.group == group && g.port == port)
        else {
            return;
        };

        self.cmds.mcast[gi].handlers.retain(|h| h.filter != filter);
        if !self.cmds.mcast[gi].handlers.is_empty() {
            return;
        }

        let state = self.cmds.mcast.swap_remove(gi);
        evt.remove_fd(self, state.socket.as_raw_fd(), crate::events::FdSlot::Read);
        if let Err(e) = state.socket.leave_multicast_v4(&state.group, &Ipv4Addr::UNSPECIFIED) {
            warn!("failed to leave multicast group {}: {e}", state.group);
        }
    }

    /// Number of handlers attached to a service's multicast group.
    pub fn multicast_handler_count(&self, service: &str) -> usize {
        let Some((group, port)) = net::service_multicast(service) else {
            return 0;
        };
        self.cmds
            .mcast
            .iter()
            .find(|g| g.group == group && g.port == port)
            .map_or(0, |g| g.handlers.len())
    }

    fn handle_multicast_packet(&mut self, evt: &mut EventLoop<ProcState>, fd: RawFd) {
        let find = |st: &ProcState| {
            st.cmds
                .mcast
                .iter()
                .position(|g| g.socket.as_raw_fd() == fd)
        };
        let Some(gi) = find(self) else {
            return;
        };
        let Some((buf, src)) = recv_v4(&self.cmds.mcast[gi].socket) else {
            return;
        };
        if buf.is_empty() {
            return;
        }

        let cmd = buf[0];
        debug!("multicast received command {cmd:#04x}");

        let count = self.cmds.mcast[gi].handlers.len();
        for i in 0..count {
            // A handler may have torn down the group; revalidate.
            let Some(gi) = find(self) else {
                return;
            };
            let group = &mut self.cmds.mcast[gi];
            let Some(entry) = group.handlers.get_mut(i) else {
                return;
            };
            if !(entry.filter.is_none() || entry.filter == Some(cmd)) {
                continue;
            }
            let Some(mut cb) = entry.cb.take() else {
                continue;
            };

            cb(evt, self, cmd, &buf[1..], src);

            if let Some(gi) = find(self) {
                if let Some(entry) = self.cmds.mcast[gi].handlers.get_mut(i) {
                    if entry.cb.is_none() {
                        entry.cb = Some(cb);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Data requests
    // ------------------------------------------------------------------

    /// Handler of the reserved data-request command: gather the requested
    /// types through their populators.
    pub(crate) fn handle_data_request(
        &mut self,
        _evt: &mut EventLoop<ProcState>,
        cmd: &Command,
        src: SocketAddrV4,
    ) {
        if cmd.parameters.type_id != TYPE_DATA_REQUEST {
            self.respond_error(cmd, RESULT_INCORRECT_PARAMETER_TYPE, src);
            return;
        }
        let Some(req) = cmd.parameters.downcast_ref::<DataRequest>() else {
            self.respond_error(cmd, RESULT_INCORRECT_PARAMETER_TYPE, src);
            return;
        };

        let types = req.types.clone();
        if types.is_empty() || types.len() > 1024 {
            self.respond(cmd, TYPE_VOID, Some(&Void), src);
            return;
        }

        let registry = Rc::clone(self.registry_rc());

        if types.len() == 1 {
            let type_id = types[0];
            match registry.populate(type_id) {
                Some(Ok(value)) => self.respond(cmd, type_id, Some(&*value), src),
                Some(Err(code)) => self.respond_error(cmd, code, src),
                // No populator; an empty array response mirrors the
                // multi-type path.
                None => self.respond(
                    cmd,
                    TYPE_OPAQUE_STRUCT_LIST,
                    Some(&OpaqueStructList::default()),
                    src,
                ),
            }
            return;
        }

        let mut entries = Vec::new();
        for type_id in types {
            match registry.populate(type_id) {
                None => continue,
                Some(Ok(value)) => match registry.encode_tagged(type_id, &*value) {
                    Ok(data) => entries.push(OpaqueStruct { data }),
                    Err(e) => warn!("failed to encode populated type {type_id:#010x}: {e}"),
                },
                Some(Err(code)) => {
                    let err = PopulatorError {
                        type_id,
                        error: code,
                    };
                    if let Ok(data) = registry.encode_tagged(TYPE_POPULATOR_ERROR, &err) {
                        entries.push(OpaqueStruct { data });
                    }
                }
            }
        }

        self.respond(cmd, TYPE_OPAQUE_STRUCT_LIST, Some(&OpaqueStructList { entries }), src);
    }

    /// Aliveness counters maintained by the engine.
    pub fn heartbeat(&self) -> Heartbeat {
        self.cmds.beats.borrow().clone()
    }

    /// Number of sent commands still awaiting a response or timeout.
    pub fn pending_commands(&self) -> usize {
        self.cmds.pending_count()
    }

    /// Register an application error code for rendering.
    pub fn register_error(&mut self, info: ErrorInfo) {
        self.cmds.errors.register(info);
    }

    /// Register command metadata for name lookup and usage output.
    pub fn register_command_spec(&mut self, spec: CommandSpec) {
        self.cmds.catalog.register(spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_finds_builtins_by_name_and_number() {
        let catalog = CommandCatalog::with_builtins();
        assert_eq!(
            catalog.by_name("PROC-STATUS").unwrap().command,
            proto::CMD_STATUS
        );
        assert_eq!(
            catalog.by_number(proto::CMD_DATA_REQ).unwrap().name,
            "proc-data-req"
        );
        let hb = catalog.by_name("proc-heartbeat").unwrap();
        assert_eq!(hb.command, 0);
        assert_eq!(hb.datareq_types, &[proto::TYPE_HEARTBEAT]);
    }

    #[test]
    fn error_catalog_renders_builtin_messages() {
        let errors = ErrorCatalog::with_builtins();
        assert_eq!(
            errors.message(RESULT_UNSUPPORTED),
            "The target process does not support the command sent"
        );
        assert_eq!(errors.message(0xDEAD), "");
    }

    #[test]
    fn custom_errors_can_be_registered() {
        let mut errors = ErrorCatalog::with_builtins();
        errors.register(ErrorInfo {
            id: 40_000_000,
            name: "WHEEL_SATURATED",
            description: "Reaction wheel momentum limit reached",
        });
        assert_eq!(
            errors.message(40_000_000),
            "Reaction wheel momentum limit reached"
        );
    }
}
