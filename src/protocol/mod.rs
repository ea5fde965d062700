//! Control-plane protocol between parent and spawner
//!
//! One frame is a `u32` little-endian length followed by that many payload
//! bytes. The parent sends SPAWN frames carrying a [`SpawnRequest`]; the
//! spawner answers each with exactly one SPAWN_REPLY carrying a
//! [`SpawnReply`], with the child's three stdio descriptors attached as
//! `SCM_RIGHTS` ancillary data on success. The protocol is strictly
//! request/response on a single socket, never pipelined.

pub mod args;
pub mod frame;

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use args::ArgValue;
pub use frame::{FrameSocket, MAX_FRAME_LEN};

/// Reply status: the spawn succeeded and three fds accompany the frame.
pub const STATUS_OK: u8 = 0;
/// Reply status: clone(2) failed inside the spawner; pid is 0, no fds.
pub const STATUS_FORK_FAILED: u8 = 1;

/// Interface names are limited to IFNAMSIZ - 1 bytes by the kernel.
const MAX_IFNAME_LEN: usize = 15;

// SandboxConfig wire flags
const FLAG_CHROOT: u8 = 1 << 0;
const FLAG_NETWORK: u8 = 1 << 1;
const FLAG_DROP_CAPABILITIES: u8 = 1 << 2;
const FLAG_SKIP_SECCOMP: u8 = 1 << 3;
const FLAG_ENABLE_COREDUMPS: u8 = 1 << 4;

/// Error decoding a frame payload or an argument blob
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload truncated at byte {0}")]
    Truncated(usize),

    #[error("string field is not valid UTF-8")]
    BadUtf8,

    #[error("unknown argument tag {0:#04x}")]
    BadTag(u8),

    #[error("unknown reply status {0}")]
    BadStatus(u8),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// One veth pair connecting the child's network namespace to the host.
///
/// The kernel side keeps `kernel_ipv4`; the child side gets `child_ipv4` and
/// a default route via `child_ipv4_gateway`. Addresses are peer addresses on
/// a /24 (or /30) subnet. Reaching beyond the gateway additionally requires
/// NAT configured on the host, which is a deployment concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host-side interface name
    pub kernel_veth_name: String,
    /// Child-side interface name
    pub child_veth_name: String,
    /// Address assigned to the host-side interface
    pub kernel_ipv4: Ipv4Addr,
    /// Address assigned to the child-side interface
    pub child_ipv4: Ipv4Addr,
    /// Default gateway installed inside the child
    pub child_ipv4_gateway: Ipv4Addr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            kernel_veth_name: "veth-kernel".to_string(),
            child_veth_name: "veth-child".to_string(),
            kernel_ipv4: Ipv4Addr::new(192, 168, 123, 1),
            child_ipv4: Ipv4Addr::new(192, 168, 123, 2),
            child_ipv4_gateway: Ipv4Addr::new(192, 168, 123, 1),
        }
    }
}

impl NetworkConfig {
    /// Validate interface names against kernel constraints
    pub fn validate(&self) -> std::result::Result<(), String> {
        for name in [&self.kernel_veth_name, &self.child_veth_name] {
            if name.is_empty() {
                return Err("veth interface name cannot be empty".to_string());
            }
            if name.len() > MAX_IFNAME_LEN {
                return Err(format!("veth interface name '{name}' exceeds 15 bytes"));
            }
            if name.bytes().any(|b| b == 0 || b == b'/' || b == b' ') {
                return Err(format!("veth interface name '{name}' contains invalid bytes"));
            }
        }
        Ok(())
    }
}

/// Sandbox settings for one spawned child.
///
/// `chroot_dir`, when set, must be an absolute path on a filesystem distinct
/// from `/`; that precondition is the caller's to uphold and is not verified
/// here. `network: None` still gives the child an unshared, empty network
/// namespace with only loopback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Root directory the child is confined to with chroot(2)
    pub chroot_dir: Option<PathBuf>,
    /// Veth networking for the child; None means loopback only
    pub network: Option<NetworkConfig>,
    /// Empty all capability sets and set no_new_privs
    pub drop_capabilities: bool,
    /// Leave the seccomp filter uninstalled (testing escape hatch)
    pub skip_sandbox_seccomp: bool,
    /// Keep RLIMIT_CORE at its inherited value instead of zero
    pub enable_coredumps: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            chroot_dir: None,
            network: None,
            drop_capabilities: true,
            skip_sandbox_seccomp: false,
            enable_coredumps: false,
        }
    }
}

/// A spawn request as sent by the parent.
///
/// `args` are opaque serialized [`ArgValue`] blobs: the spawner forwards them
/// to the child without inspecting them.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub process_name: String,
    pub sandbox_config: SandboxConfig,
    pub args: Vec<Vec<u8>>,
}

impl SpawnRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        put_string(&mut buf, &self.process_name);

        let cfg = &self.sandbox_config;
        let mut flags = 0u8;
        if cfg.chroot_dir.is_some() {
            flags |= FLAG_CHROOT;
        }
        if cfg.network.is_some() {
            flags |= FLAG_NETWORK;
        }
        if cfg.drop_capabilities {
            flags |= FLAG_DROP_CAPABILITIES;
        }
        if cfg.skip_sandbox_seccomp {
            flags |= FLAG_SKIP_SECCOMP;
        }
        if cfg.enable_coredumps {
            flags |= FLAG_ENABLE_COREDUMPS;
        }
        buf.push(flags);

        if let Some(dir) = &cfg.chroot_dir {
            put_bytes(&mut buf, dir.to_string_lossy().as_bytes());
        }
        if let Some(net) = &cfg.network {
            put_string(&mut buf, &net.kernel_veth_name);
            put_string(&mut buf, &net.child_veth_name);
            buf.extend_from_slice(&net.kernel_ipv4.octets());
            buf.extend_from_slice(&net.child_ipv4.octets());
            buf.extend_from_slice(&net.child_ipv4_gateway.octets());
        }

        buf.extend_from_slice(&(self.args.len() as u32).to_le_bytes());
        for arg in &self.args {
            put_bytes(&mut buf, arg);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let process_name = r.string()?;
        let flags = r.u8()?;

        let chroot_dir = if flags & FLAG_CHROOT != 0 {
            Some(PathBuf::from(r.string()?))
        } else {
            None
        };
        let network = if flags & FLAG_NETWORK != 0 {
            Some(NetworkConfig {
                kernel_veth_name: r.string()?,
                child_veth_name: r.string()?,
                kernel_ipv4: Ipv4Addr::from(r.octets()?),
                child_ipv4: Ipv4Addr::from(r.octets()?),
                child_ipv4_gateway: Ipv4Addr::from(r.octets()?),
            })
        } else {
            None
        };

        let count = r.u32()? as usize;
        let mut args = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            args.push(r.bytes()?.to_vec());
        }
        r.finish()?;

        Ok(Self {
            process_name,
            sandbox_config: SandboxConfig {
                chroot_dir,
                network,
                drop_capabilities: flags & FLAG_DROP_CAPABILITIES != 0,
                skip_sandbox_seccomp: flags & FLAG_SKIP_SECCOMP != 0,
                enable_coredumps: flags & FLAG_ENABLE_COREDUMPS != 0,
            },
            args,
        })
    }
}

/// A spawn reply as sent by the spawner. Three fds travel out-of-band on a
/// success reply, in the fixed order stdin, stdout, stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnReply {
    pub status: u8,
    pub pid: i32,
}

impl SpawnReply {
    pub fn ok(pid: i32) -> Self {
        Self {
            status: STATUS_OK,
            pid,
        }
    }

    pub fn fork_failed() -> Self {
        Self {
            status: STATUS_FORK_FAILED,
            pid: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.push(self.status);
        buf.extend_from_slice(&self.pid.to_le_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let status = r.u8()?;
        if status > STATUS_FORK_FAILED {
            return Err(DecodeError::BadStatus(status));
        }
        let pid = r.i32()?;
        r.finish()?;
        Ok(Self { status, pid })
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Cursor over a received payload with bounds-checked little-endian reads
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> std::result::Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> std::result::Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub(crate) fn i32(&mut self) -> std::result::Result<i32, DecodeError> {
        let raw = self.take(4)?;
        Ok(i32::from_le_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub(crate) fn i64(&mut self) -> std::result::Result<i64, DecodeError> {
        let raw = self.take(8)?;
        Ok(i64::from_le_bytes(raw.try_into().expect("8-byte slice")))
    }

    pub(crate) fn f64(&mut self) -> std::result::Result<f64, DecodeError> {
        let raw = self.take(8)?;
        Ok(f64::from_le_bytes(raw.try_into().expect("8-byte slice")))
    }

    pub(crate) fn octets(&mut self) -> std::result::Result<[u8; 4], DecodeError> {
        let raw = self.take(4)?;
        Ok(raw.try_into().expect("4-byte slice"))
    }

    pub(crate) fn bytes(&mut self) -> std::result::Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> std::result::Result<String, DecodeError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::BadUtf8)
    }

    pub(crate) fn finish(&self) -> std::result::Result<(), DecodeError> {
        let rest = self.buf.len() - self.pos;
        if rest != 0 {
            return Err(DecodeError::TrailingBytes(rest));
        }
        Ok(())
    }
}
