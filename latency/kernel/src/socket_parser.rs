//! Socket structure parsing
//!
//! Extracts the connection 4-tuple from the `struct sock` passed as the first
//! argument of every hooked function.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use latency_probe_common::{constants::AF_INET, types::ConnectionKey};

/// Leading fields of the kernel's `struct sock_common`.
///
/// `struct sock` starts with `__sk_common`, and this prefix has kept the same
/// layout since the address/port pairs were introduced.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct SockCommon {
    skc_daddr: u32,
    skc_rcv_saddr: u32,
    skc_hash: u32,
    /// Network byte order
    skc_dport: u16,
    /// Host byte order
    skc_num: u16,
    skc_family: u16,
    skc_state: u8,
    _reuse: u8,
}

/// Opaque `struct sock`, only its address is used directly
#[repr(C)]
pub struct Sock {
    _opaque: [u8; 0],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    MissingArgument,
    NullSocket,
    ReadFailed,
    UnsupportedFamily,
}

/// First argument of tcp_sendmsg, tcp_recvmsg and tcp_cleanup_rbuf
#[inline(always)]
pub fn sock_from_context(ctx: &ProbeContext) -> Result<*const Sock, ParseError> {
    let sock: *const Sock = ctx.arg(0).ok_or(ParseError::MissingArgument)?;
    if sock.is_null() {
        return Err(ParseError::NullSocket);
    }
    Ok(sock)
}

/// Opaque socket identity used as a map key
#[inline(always)]
pub fn sock_id(sock: *const Sock) -> u64 {
    sock as u64
}

/// Read the IPv4 4-tuple of `sock`
#[inline(always)]
pub fn read_connection_key(sock: *const Sock) -> Result<ConnectionKey, ParseError> {
    let common: SockCommon = unsafe {
        bpf_probe_read_kernel(sock as *const SockCommon).map_err(|_| ParseError::ReadFailed)?
    };

    if common.skc_family != AF_INET {
        return Err(ParseError::UnsupportedFamily);
    }

    Ok(ConnectionKey::new(
        common.skc_rcv_saddr,
        common.skc_num.to_be(),
        common.skc_daddr,
        common.skc_dport,
    ))
}
