//! Length-prefixed framing over an AF_UNIX stream socket
//!
//! A frame is `u32 length | payload`. File descriptors ride in the
//! `SCM_RIGHTS` ancillary data of the same sendmsg(2) that carries the first
//! byte of the frame. The receiver performs exactly one recvmsg(2) (which is
//! where any fds arrive), then collects the remainder of the frame with
//! blocking reads. Short writes loop on the sending side.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Upper bound on a frame payload; a longer declared length is a protocol
/// violation, not an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const FRAME_HEADER_LEN: usize = 4;
const RECV_BUF_LEN: usize = 64 * 1024;
const CMSG_BUF_LEN: usize = 64;

/// Control-message buffer with the alignment recvmsg(2) requires
#[repr(align(8))]
struct CmsgBuf([u8; CMSG_BUF_LEN]);

/// One received frame: the payload plus any descriptors that accompanied it
#[derive(Debug)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// Message-framed bidirectional socket, one half of a socketpair.
///
/// This is the only place SCM_RIGHTS passing happens; both the parent handle
/// and the spawner loop speak through it.
#[derive(Debug)]
pub struct FrameSocket {
    fd: OwnedFd,
}

impl FrameSocket {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Send one frame, attaching `fds` to the first byte.
    pub fn send_frame(&self, payload: &[u8], fds: &[RawFd]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload exceeds protocol limit",
            ));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        let mut sent = 0usize;
        while sent < frame.len() {
            let n = if sent == 0 {
                self.sendmsg_with_fds(&frame, fds)?
            } else {
                self.send_plain(&frame[sent..])?
            };
            sent += n;
        }
        Ok(())
    }

    /// Receive one frame. Returns `None` on a clean end-of-stream at a frame
    /// boundary. EOF inside a frame surfaces as `UnexpectedEof`, which the
    /// caller treats as a protocol error.
    pub fn recv_frame(&self) -> io::Result<Option<Frame>> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let (mut have, fds) = self.recvmsg_with_fds(&mut buf)?;
        if have == 0 {
            if !fds.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "descriptors received without frame data",
                ));
            }
            return Ok(None);
        }

        while have < FRAME_HEADER_LEN {
            have += self.recv_more(&mut buf[have..FRAME_HEADER_LEN])?;
        }
        let declared =
            u32::from_le_bytes(buf[..FRAME_HEADER_LEN].try_into().expect("4-byte slice")) as usize;
        if declared > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("declared frame length {declared} exceeds protocol limit"),
            ));
        }

        let total = FRAME_HEADER_LEN + declared;
        if have > total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bytes received past the end of the frame",
            ));
        }
        if buf.len() < total {
            buf.resize(total, 0);
        }
        while have < total {
            have += self.recv_more(&mut buf[have..total])?;
        }

        Ok(Some(Frame {
            payload: buf[FRAME_HEADER_LEN..total].to_vec(),
            fds,
        }))
    }

    fn sendmsg_with_fds(&self, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        let iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        let mut cmsg_buf = CmsgBuf([0u8; CMSG_BUF_LEN]);

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
        msg.msg_iovlen = 1;

        if !fds.is_empty() {
            let payload_len = mem::size_of_val(fds) as libc::c_uint;
            let space = unsafe { libc::CMSG_SPACE(payload_len) } as usize;
            assert!(space <= CMSG_BUF_LEN, "fd count exceeds control buffer");

            msg.msg_control = cmsg_buf.0.as_mut_ptr().cast();
            msg.msg_controllen = space;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len) as _;
                ptr::copy_nonoverlapping(
                    fds.as_ptr(),
                    libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                    fds.len(),
                );
            }
        }

        loop {
            let n = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn send_plain(&self, data: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    data.as_ptr().cast(),
                    data.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// The single recvmsg of the frame; any fds arrive here.
    fn recvmsg_with_fds(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut cmsg_buf = CmsgBuf([0u8; CMSG_BUF_LEN]);

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.0.as_mut_ptr().cast();
        msg.msg_controllen = CMSG_BUF_LEN;

        let n = loop {
            let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut fds = Vec::new();
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let count = data_len / mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for i in 0..count {
                        fds.push(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            // fds may have been dropped by the kernel; the frame is unusable
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ancillary data truncated",
            ));
        }

        Ok((n, fds))
    }

    fn recv_more(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of stream inside a frame",
                ));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Consume received fds as exactly three stdio descriptors, in the wire
/// order stdin, stdout, stderr.
pub fn expect_stdio_fds(mut fds: Vec<OwnedFd>) -> Result<(OwnedFd, OwnedFd, OwnedFd), usize> {
    if fds.len() != 3 {
        return Err(fds.len());
    }
    let stderr = fds.pop().expect("len checked");
    let stdout = fds.pop().expect("len checked");
    let stdin = fds.pop().expect("len checked");
    Ok((stdin, stdout, stderr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
    use std::io::{Read, Seek, Write};

    fn pair() -> (FrameSocket, FrameSocket) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        (FrameSocket::new(a), FrameSocket::new(b))
    }

    #[test]
    fn test_frame_roundtrip_without_fds() {
        let (a, b) = pair();
        a.send_frame(b"hello frame", &[]).unwrap();
        let frame = b.recv_frame().unwrap().unwrap();
        assert_eq!(frame.payload, b"hello frame");
        assert!(frame.fds.is_empty());
    }

    #[test]
    fn test_empty_payload_frame() {
        let (a, b) = pair();
        a.send_frame(&[], &[]).unwrap();
        let frame = b.recv_frame().unwrap().unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_frames_arrive_in_order() {
        // The protocol is strictly request/response, so each frame is read
        // before the peer writes the next one.
        let (a, b) = pair();
        a.send_frame(b"first", &[]).unwrap();
        assert_eq!(b.recv_frame().unwrap().unwrap().payload, b"first");
        a.send_frame(b"second", &[]).unwrap();
        assert_eq!(b.recv_frame().unwrap().unwrap().payload, b"second");
    }

    #[test]
    fn test_pipelined_frames_are_a_protocol_violation() {
        let (a, b) = pair();
        a.send_frame(b"first", &[]).unwrap();
        a.send_frame(b"second", &[]).unwrap();
        // Both frames sit in the socket buffer, so the single recvmsg sees
        // bytes past the end of the first frame.
        let err = b.recv_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_clean_eof_returns_none() {
        let (a, b) = pair();
        drop(a);
        assert!(b.recv_frame().unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_is_unexpected_eof() {
        let (a, b) = pair();
        // A 100-byte frame announced but only the header delivered
        let header = 100u32.to_le_bytes();
        assert_eq!(a.send_plain(&header).unwrap(), 4);
        drop(a);
        let err = b.recv_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversize_declared_length_rejected() {
        let (a, b) = pair();
        let header = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        a.send_plain(&header).unwrap();
        let err = b.recv_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_frame_larger_than_recv_buffer() {
        let (a, b) = pair();
        let payload = vec![0xabu8; RECV_BUF_LEN + 1000];
        let sender = {
            let payload = payload.clone();
            std::thread::spawn(move || a.send_frame(&payload, &[]).unwrap())
        };
        let frame = b.recv_frame().unwrap().unwrap();
        sender.join().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_fds_pass_with_first_byte() {
        let (a, b) = pair();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"through the socket").unwrap();
        file.rewind().unwrap();
        let fd = OwnedFd::from(file);

        a.send_frame(b"with-fd", &[fd.as_raw_fd(), fd.as_raw_fd(), fd.as_raw_fd()])
            .unwrap();
        drop(fd);

        let frame = b.recv_frame().unwrap().unwrap();
        assert_eq!(frame.payload, b"with-fd");
        let (stdin, stdout, stderr) = expect_stdio_fds(frame.fds).unwrap();
        drop(stdout);
        drop(stderr);

        let mut passed = std::fs::File::from(stdin);
        let mut content = String::new();
        passed.read_to_string(&mut content).unwrap();
        assert_eq!(content, "through the socket");
    }

    #[test]
    fn test_expect_stdio_fds_rejects_wrong_count() {
        let (a, b) = pair();
        let file = tempfile::tempfile().unwrap();
        let fd = OwnedFd::from(file);
        a.send_frame(b"short", &[fd.as_raw_fd()]).unwrap();
        drop(fd);

        let frame = b.recv_frame().unwrap().unwrap();
        assert_eq!(expect_stdio_fds(frame.fds).unwrap_err(), 1);
    }
}
