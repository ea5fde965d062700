//! Minimal rtnetlink client for veth, address, and route configuration
//!
//! Covers exactly the four operations sandbox networking needs: create a
//! veth pair with the peer placed in another namespace, bring a link up,
//! add an IPv4 address, and add a default route. Every request uses
//! NLM_F_ACK and is confirmed synchronously, so a kernel-side failure maps
//! to an errno before setup continues.

use std::ffi::CString;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::SandboxError;

// Message types
const NLMSG_ERROR: u16 = 2;
const RTM_NEWLINK: u16 = 16;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;

// Header flags
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

// Link attributes
const IFLA_IFNAME: u16 = 3;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

// Address attributes
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

// Route attributes and rtmsg field values
const RTA_GATEWAY: u16 = 5;
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

const IFF_UP: u32 = 0x1;

const NLMSG_HDRLEN: usize = 16;
const RTATTR_HDRLEN: usize = 4;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// struct nlmsghdr
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    len: u32,
    msg_type: u16,
    flags: u16,
    seq: u32,
    pid: u32,
}

/// struct ifinfomsg
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IfInfoMsg {
    pub family: u8,
    pad: u8,
    pub if_type: u16,
    pub index: i32,
    pub flags: u32,
    pub change: u32,
}

/// struct ifaddrmsg
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IfAddrMsg {
    pub family: u8,
    pub prefixlen: u8,
    pub flags: u8,
    pub scope: u8,
    pub index: u32,
}

/// struct rtmsg
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RtMsg {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub rtype: u8,
    pub flags: u32,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // repr(C) plain-data structs only
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// Incrementally built netlink request. The nlmsghdr is reserved up front
/// and backfilled when the message is finished.
struct MessageBuilder {
    buf: Vec<u8>,
    msg_type: u16,
    flags: u16,
}

impl MessageBuilder {
    fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            buf: vec![0u8; NLMSG_HDRLEN],
            msg_type,
            flags,
        }
    }

    fn header<T: Copy>(&mut self, header: &T) {
        self.buf.extend_from_slice(as_bytes(header));
    }

    fn attr(&mut self, kind: u16, payload: &[u8]) {
        let len = RTATTR_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
    }

    fn attr_str(&mut self, kind: u16, value: &str) {
        let mut payload = value.as_bytes().to_vec();
        payload.push(0);
        self.attr(kind, &payload);
    }

    fn attr_u32(&mut self, kind: u16, value: u32) {
        self.attr(kind, &value.to_ne_bytes());
    }

    /// Open a nested attribute; returns the offset to pass to `end_nested`.
    fn begin_nested(&mut self, kind: u16) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        offset
    }

    fn end_nested(&mut self, offset: usize) {
        let len = (self.buf.len() - offset) as u16;
        self.buf[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
        // nested payloads are already 4-aligned because every inner
        // attribute pads itself
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let hdr = NlMsgHdr {
            len: self.buf.len() as u32,
            msg_type: self.msg_type,
            flags: self.flags,
            seq,
            pid: 0,
        };
        self.buf[..NLMSG_HDRLEN].copy_from_slice(as_bytes(&hdr));
        self.buf
    }
}

/// A connected NETLINK_ROUTE socket
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkSocket {
    pub fn open_route() -> Result<Self, SandboxError> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(SandboxError::Netlink(format!(
                "failed to open NETLINK_ROUTE socket: {}",
                std::io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_nl).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(SandboxError::Netlink(format!(
                "failed to bind netlink socket: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self { fd, seq: 0 })
    }

    /// Create a veth pair: `name` in the current network namespace, its peer
    /// `peer_name` placed into the network namespace of `peer_ns_pid`.
    pub fn create_veth(
        &mut self,
        name: &str,
        peer_name: &str,
        peer_ns_pid: i32,
    ) -> Result<(), SandboxError> {
        let mut msg = MessageBuilder::new(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        msg.header(&IfInfoMsg::default());
        msg.attr_str(IFLA_IFNAME, name);

        let linkinfo = msg.begin_nested(IFLA_LINKINFO);
        msg.attr(IFLA_INFO_KIND, b"veth");
        let data = msg.begin_nested(IFLA_INFO_DATA);
        let peer = msg.begin_nested(VETH_INFO_PEER);
        msg.header(&IfInfoMsg::default());
        msg.attr_str(IFLA_IFNAME, peer_name);
        msg.attr_u32(IFLA_NET_NS_PID, peer_ns_pid as u32);
        msg.end_nested(peer);
        msg.end_nested(data);
        msg.end_nested(linkinfo);

        self.request(msg)
    }

    /// Bring the named link up
    pub fn link_up(&mut self, name: &str) -> Result<(), SandboxError> {
        let index = ifindex(name)?;
        let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        msg.header(&IfInfoMsg {
            index: index as i32,
            flags: IFF_UP,
            change: IFF_UP,
            ..Default::default()
        });
        self.request(msg)
    }

    /// Assign an IPv4 address with the given prefix length to a link
    pub fn add_address(
        &mut self,
        index: u32,
        addr: Ipv4Addr,
        prefixlen: u8,
    ) -> Result<(), SandboxError> {
        let mut msg = MessageBuilder::new(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        msg.header(&IfAddrMsg {
            family: libc::AF_INET as u8,
            prefixlen,
            flags: 0,
            scope: RT_SCOPE_UNIVERSE,
            index,
        });
        msg.attr(IFA_LOCAL, &addr.octets());
        msg.attr(IFA_ADDRESS, &addr.octets());
        self.request(msg)
    }

    /// Install a default IPv4 route via `gateway` in the main table
    pub fn add_default_route(&mut self, gateway: Ipv4Addr) -> Result<(), SandboxError> {
        let mut msg = MessageBuilder::new(RTM_NEWROUTE, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE);
        msg.header(&RtMsg {
            family: libc::AF_INET as u8,
            table: RT_TABLE_MAIN,
            protocol: RTPROT_BOOT,
            scope: RT_SCOPE_UNIVERSE,
            rtype: RTN_UNICAST,
            ..Default::default()
        });
        msg.attr(RTA_GATEWAY, &gateway.octets());
        self.request(msg)
    }

    fn request(&mut self, msg: MessageBuilder) -> Result<(), SandboxError> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let packet = msg.finish(seq);

        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                packet.as_ptr().cast(),
                packet.len(),
                0,
            )
        };
        if sent < 0 || sent as usize != packet.len() {
            return Err(SandboxError::Netlink(format!(
                "netlink send failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        self.await_ack(seq)
    }

    fn await_ack(&mut self, seq: u32) -> Result<(), SandboxError> {
        let mut buf = [0u8; 8192];
        loop {
            let n = unsafe {
                libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0)
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(SandboxError::Netlink(format!("netlink recv failed: {err}")));
            }

            let mut offset = 0usize;
            let n = n as usize;
            while offset + NLMSG_HDRLEN <= n {
                let hdr = parse_nlmsghdr(&buf[offset..]);
                let msg_len = hdr.len as usize;
                if msg_len < NLMSG_HDRLEN || offset + msg_len > n {
                    return Err(SandboxError::Netlink(
                        "truncated netlink response".to_string(),
                    ));
                }
                if hdr.seq == seq && hdr.msg_type == NLMSG_ERROR {
                    let body = &buf[offset + NLMSG_HDRLEN..offset + msg_len];
                    if body.len() < 4 {
                        return Err(SandboxError::Netlink(
                            "short NLMSG_ERROR payload".to_string(),
                        ));
                    }
                    let errno = i32::from_ne_bytes(body[..4].try_into().expect("4-byte slice"));
                    if errno == 0 {
                        return Ok(());
                    }
                    let err = std::io::Error::from_raw_os_error(-errno);
                    return Err(SandboxError::Netlink(format!(
                        "kernel rejected request: {err}"
                    )));
                }
                offset += align4(msg_len);
            }
        }
    }
}

fn parse_nlmsghdr(buf: &[u8]) -> NlMsgHdr {
    NlMsgHdr {
        len: u32::from_ne_bytes(buf[0..4].try_into().expect("4-byte slice")),
        msg_type: u16::from_ne_bytes(buf[4..6].try_into().expect("2-byte slice")),
        flags: u16::from_ne_bytes(buf[6..8].try_into().expect("2-byte slice")),
        seq: u32::from_ne_bytes(buf[8..12].try_into().expect("4-byte slice")),
        pid: u32::from_ne_bytes(buf[12..16].try_into().expect("4-byte slice")),
    }
}

/// Resolve an interface name to its index in the caller's network namespace
pub fn ifindex(name: &str) -> Result<u32, SandboxError> {
    let cname = CString::new(name)
        .map_err(|_| SandboxError::Netlink("interface name contains NUL".to_string()))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(SandboxError::Netlink(format!(
            "no such interface '{name}': {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(index)
}

/// Raw fd accessor used when handing the socket to fd-hygiene bookkeeping
impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
