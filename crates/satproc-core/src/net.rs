//! UDP sockets and the service name directory.
//!
//! All IPC between processes is UDP. Service names resolve through
//! `/etc/services` first and fall back to the built-in flight service table,
//! then to a plain numeric port, so test programs can use ad-hoc ports
//! without editing system files.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd};
use std::time::{Duration, Instant};

use log::{debug, warn};

pub struct ServiceEntry {
    pub name: &'static str,
    pub port: u16,
    pub multicast_ip: &'static str,
    pub multicast_port: u16,
}

/// Built-in service directory used when `/etc/services` has no entry.
pub const SERVICES: &[ServiceEntry] = &[
    ServiceEntry { name: "beacon", port: 50000, multicast_ip: "234.192.101.1", multicast_port: 51000 },
    ServiceEntry { name: "sys_manager", port: 50001, multicast_ip: "234.192.101.2", multicast_port: 51001 },
    ServiceEntry { name: "watchdog", port: 50002, multicast_ip: "234.192.101.3", multicast_port: 51002 },
    ServiceEntry { name: "satcomm", port: 50003, multicast_ip: "234.192.101.4", multicast_port: 51003 },
    ServiceEntry { name: "filemgr", port: 50004, multicast_ip: "234.192.101.5", multicast_port: 51004 },
    ServiceEntry { name: "telemetry", port: 50005, multicast_ip: "234.192.101.6", multicast_port: 51005 },
    ServiceEntry { name: "datalogger", port: 50006, multicast_ip: "234.192.101.7", multicast_port: 51006 },
    ServiceEntry { name: "ethcomm", port: 50007, multicast_ip: "234.192.101.8", multicast_port: 51007 },
    ServiceEntry { name: "comm_server", port: 50008, multicast_ip: "234.192.101.9", multicast_port: 51008 },
    ServiceEntry { name: "clksync", port: 50009, multicast_ip: "234.192.101.10", multicast_port: 51009 },
    ServiceEntry { name: "payload", port: 50010, multicast_ip: "234.192.101.11", multicast_port: 51010 },
    ServiceEntry { name: "adcs", port: 50011, multicast_ip: "234.192.101.12", multicast_port: 51011 },
    ServiceEntry { name: "pscam", port: 50012, multicast_ip: "234.192.101.13", multicast_port: 51012 },
    ServiceEntry { name: "camera", port: 50012, multicast_ip: "234.192.101.13", multicast_port: 51012 },
    ServiceEntry { name: "gps", port: 50013, multicast_ip: "234.192.101.14", multicast_port: 51013 },
    ServiceEntry { name: "log_cleaner", port: 50014, multicast_ip: "234.192.101.15", multicast_port: 51014 },
    ServiceEntry { name: "test1", port: 2003, multicast_ip: "224.0.0.1", multicast_port: 52003 },
    ServiceEntry { name: "test2", port: 2004, multicast_ip: "234.192.101.16", multicast_port: 52004 },
];

fn table_entry(service: &str) -> Option<&'static ServiceEntry> {
    SERVICES.iter().find(|e| e.name == service)
}

fn etc_services_port(service: &str) -> Option<u16> {
    let name = CString::new(service).ok()?;
    let proto = c"udp";
    let entry = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if entry.is_null() {
        return None;
    }
    Some(u16::from_be(unsafe { (*entry).s_port } as u16))
}

/// Resolve a service name to its UDP command port.
///
/// Order: `/etc/services`, the built-in table, then a literal port number.
pub fn service_port(service: &str) -> Option<u16> {
    if let Some(port) = etc_services_port(service) {
        return Some(port);
    }
    if let Some(entry) = table_entry(service) {
        return Some(entry.port);
    }
    match service.parse::<u16>() {
        Ok(port) if port > 0 => Some(port),
        _ => {
            warn!("service '{service}' lookup failed");
            None
        }
    }
}

/// Multicast `(group, port)` for a named service.
pub fn service_multicast(service: &str) -> Option<(Ipv4Addr, u16)> {
    let entry = table_entry(service)?;
    let group: Ipv4Addr = entry.multicast_ip.parse().ok()?;
    Some((group, entry.multicast_port))
}

/// Reverse lookup of a command port, for diagnostics.
pub fn service_name_for_port(port: u16) -> Option<String> {
    let proto = c"udp";
    let entry = unsafe { libc::getservbyport(u16::to_be(port) as libc::c_int, proto.as_ptr()) };
    if !entry.is_null() {
        let name = unsafe { std::ffi::CStr::from_ptr((*entry).s_name) };
        return Some(name.to_string_lossy().into_owned());
    }
    table_entry_by_port(port).map(|e| e.name.to_string())
}

fn table_entry_by_port(port: u16) -> Option<&'static ServiceEntry> {
    SERVICES.iter().find(|e| e.port == port)
}

/// Resolve a host name or dotted quad to an IPv4 address.
pub fn resolve_host(host: &str) -> io::Result<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let addrs = (host, 0u16).to_socket_addrs()?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no IPv4 address for {host}"),
    ))
}

/// Open a non-blocking UDP socket bound to `port` (0 for ephemeral) with
/// `SO_REUSEADDR` set, so a restarted service can rebind immediately.
pub fn udp_socket(port: u16) -> io::Result<UdpSocket> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let close_on_err = |fd: libc::c_int| -> io::Error {
            let err = io::Error::last_os_error();
            libc::close(fd);
            err
        };

        if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) < 0 {
            return Err(close_on_err(fd));
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const one).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return Err(close_on_err(fd));
        }

        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        if libc::bind(
            fd,
            (&raw const addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return Err(close_on_err(fd));
        }

        Ok(UdpSocket::from_raw_fd(fd))
    }
}

/// Open a socket bound to the multicast `port` and join `group` on all
/// interfaces.
pub fn multicast_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let sock = udp_socket(port)?;
    sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(sock)
}

/// Bind the command socket for a named service.
pub fn named_socket(service: &str) -> io::Result<UdpSocket> {
    let port = service_port(service).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no port known for service '{service}'"),
        )
    })?;
    debug!("binding command socket for {service} on port {port}");
    udp_socket(port)
}

/// Blocking helper for command-line utilities: open an ephemeral socket,
/// transmit one datagram and wait up to `timeout` for a single response.
///
/// Must not be called from inside an event-loop handler; handlers get
/// responses through the command engine's callbacks.
pub fn send_and_await_response(
    dest_host: Option<&str>,
    dest_service: &str,
    payload: &[u8],
    timeout: Duration,
) -> io::Result<Vec<u8>> {
    let sock = udp_socket(0)?;
    let ip = match dest_host {
        Some(host) => resolve_host(host)?,
        None => Ipv4Addr::LOCALHOST,
    };
    let port = service_port(dest_service).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no port known for service '{dest_service}'"),
        )
    })?;
    let dest = SocketAddrV4::new(ip, port);
    sock.send_to(payload, dest)?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no response within {} ms", timeout.as_millis()),
            ));
        }

        let mut pfd = libc::pollfd {
            fd: sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = remaining.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            continue;
        }

        let mut buf = vec![0u8; crate::proto::MAX_PACKET_SIZE];
        match sock.recv_from(&mut buf) {
            Ok((n, _)) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}
