//! Socket termination through NETLINK_SOCK_DIAG
//!
//! BPF programs cannot write kernel socket state, so the kretprobe hands
//! blocked sockets to userspace as kill orders. This module turns a kill
//! order into a `SOCK_DESTROY` request: the kernel looks the socket up in the
//! established hash and calls `tcp_abort()`, which resets the peer and
//! closes the socket before the application has read anything from it.
//!
//! Requires CAP_NET_ADMIN and a kernel built with CONFIG_INET_DIAG_DESTROY.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::filter::{CloseError, ConnectionIdentity, EstablishedConnection, SnapshotError};

/// Longest wait for the kernel's ack before a destroy counts as failed
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// nlmsg_type for destroying a socket
const SOCK_DESTROY: u16 = 21;

const NLMSG_HDR_LEN: usize = 16;
const INET_DIAG_REQ_V2_LEN: usize = 56;
const INET_DIAG_NOCOOKIE: u32 = !0;
const ALL_TCP_STATES: u32 = !0;

/// Build a SOCK_DESTROY request for an IPv4 TCP socket.
///
/// `idiag_src`/`idiag_sport` name the local end, `idiag_dst`/`idiag_dport`
/// the remote end, the same orientation `ss` dumps use.
pub fn destroy_request(identity: &ConnectionIdentity, seq: u32) -> Vec<u8> {
    let total = NLMSG_HDR_LEN + INET_DIAG_REQ_V2_LEN;
    let mut msg = Vec::with_capacity(total);

    // struct nlmsghdr
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&SOCK_DESTROY.to_ne_bytes());
    msg.extend_from_slice(&((libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16).to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid: kernel

    // struct inet_diag_req_v2
    msg.push(libc::AF_INET as u8);
    msg.push(libc::IPPROTO_TCP as u8);
    msg.push(0); // idiag_ext
    msg.push(0); // pad
    msg.extend_from_slice(&ALL_TCP_STATES.to_ne_bytes());

    // struct inet_diag_sockid
    msg.extend_from_slice(&identity.local.port().to_be_bytes());
    msg.extend_from_slice(&identity.remote.port().to_be_bytes());
    let mut src = [0u8; 16];
    src[..4].copy_from_slice(&identity.local.ip().octets());
    msg.extend_from_slice(&src);
    let mut dst = [0u8; 16];
    dst[..4].copy_from_slice(&identity.remote.ip().octets());
    msg.extend_from_slice(&dst);
    msg.extend_from_slice(&0u32.to_ne_bytes()); // idiag_if: any
    msg.extend_from_slice(&INET_DIAG_NOCOOKIE.to_ne_bytes());
    msg.extend_from_slice(&INET_DIAG_NOCOOKIE.to_ne_bytes());

    msg
}

/// Interpret the kernel's NLMSG_ERROR acknowledgement.
pub fn parse_ack(buf: &[u8]) -> Result<(), CloseError> {
    if buf.len() < NLMSG_HDR_LEN + 4 {
        return Err(CloseError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short netlink ack",
        )));
    }

    let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
    if msg_type != libc::NLMSG_ERROR as u16 {
        return Err(CloseError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected netlink message type {}", msg_type),
        )));
    }

    let errno = -i32::from_ne_bytes([buf[16], buf[17], buf[18], buf[19]]);
    match errno {
        0 => Ok(()),
        libc::ENOENT => Err(CloseError::NotFound),
        libc::EPERM | libc::EACCES => Err(CloseError::NotPermitted("missing CAP_NET_ADMIN".to_string())),
        libc::EOPNOTSUPP => Err(CloseError::NotPermitted(
            "kernel built without CONFIG_INET_DIAG_DESTROY".to_string(),
        )),
        errno => Err(CloseError::Io(io::Error::from_raw_os_error(errno))),
    }
}

/// Owns a NETLINK_SOCK_DIAG socket and destroys TCP sockets by 4-tuple.
pub struct SocketDestroyer {
    fd: OwnedFd,
    seq: u32,
}

impl SocketDestroyer {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_SOCK_DIAG,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let timeout = libc::timeval {
            tv_sec: ACK_TIMEOUT.as_secs() as libc::time_t,
            tv_usec: ACK_TIMEOUT.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd, seq: 0 })
    }

    /// Reset and close the socket identified by `identity`.
    pub fn destroy(&mut self, identity: &ConnectionIdentity) -> Result<(), CloseError> {
        self.seq = self.seq.wrapping_add(1);
        let request = destroy_request(identity, self.seq);

        let mut kernel: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        kernel.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                request.as_ptr() as *const libc::c_void,
                request.len(),
                0,
                &kernel as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut ack = [0u8; 512];
        let received = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                ack.as_mut_ptr() as *mut libc::c_void,
                ack.len(),
                0,
            )
        };
        if received < 0 {
            return Err(io::Error::last_os_error().into());
        }

        parse_ack(&ack[..received as usize])
    }
}

/// An established socket named by a kernel kill order
pub struct DoomedSocket<'a> {
    identity: ConnectionIdentity,
    destroyer: &'a mut SocketDestroyer,
}

impl<'a> DoomedSocket<'a> {
    pub fn new(identity: ConnectionIdentity, destroyer: &'a mut SocketDestroyer) -> Self {
        Self {
            identity,
            destroyer,
        }
    }
}

impl EstablishedConnection for DoomedSocket<'_> {
    fn snapshot(&self) -> Result<ConnectionIdentity, SnapshotError> {
        Ok(self.identity)
    }

    fn force_close(&mut self) -> Result<(), CloseError> {
        self.destroyer.destroy(&self.identity)
    }
}
