//! Kprobe handlers for TCP round-trip tracking
//!
//! Handlers never report failure to the traced function: every error path
//! increments a counter and returns 0.

use aya_ebpf::{macros::kprobe, programs::ProbeContext};
use latency_probe_common::{
    constants::*,
    tracker::{on_cleanup, on_receive, on_transmit, ReceiveOutcome, TransmitOutcome},
    types::*,
};

use crate::{
    helpers::*,
    maps::{KernelInflight, SOCKETS},
    socket_parser::*,
};

/// Attached to: tcp_sendmsg
///
/// Opens a measurement for the socket unless one is already pending.
#[kprobe]
pub fn tcp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_sendmsg(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            bump(COUNTER_INVALID_SOCKETS);
            0
        }
    }
}

fn try_tcp_sendmsg(ctx: &ProbeContext) -> Result<u32, ParseError> {
    bump(COUNTER_SEND_OBSERVED);

    let config = load_config();
    let pid = current_pid();
    if !in_scope(&config, pid) {
        bump(COUNTER_FILTERED_OUT);
        return Ok(0);
    }

    let sock = sock_from_context(ctx)?;
    let key = read_connection_key(sock)?;
    let id = sock_id(sock);
    let now = now_ns();

    remember_socket(id, key);

    let outcome = on_transmit(&mut KernelInflight, id, key, now, config.stale_threshold_ns);
    match outcome {
        TransmitOutcome::Started | TransmitOutcome::Rekeyed => {}
        TransmitOutcome::AlreadyPending => return Ok(0),
        TransmitOutcome::ReplacedStale => bump(COUNTER_STALE_DISCARDS),
        TransmitOutcome::Dropped => {
            bump(COUNTER_MAP_UPDATE_FAILURES);
            return Ok(0);
        }
    }

    if config.flags & FLAG_EMIT_SEND != 0 {
        emit(ctx, &config, key, now, 0, pid, EVENT_KIND_SEND);
    }

    Ok(0)
}

/// Attached to: tcp_recvmsg
///
/// Closes the pending measurement and emits the round-trip latency. The
/// 4-tuple comes from the in-flight entry, the socket is not parsed again.
#[kprobe]
pub fn tcp_recvmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_recvmsg(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            bump(COUNTER_INVALID_SOCKETS);
            0
        }
    }
}

fn try_tcp_recvmsg(ctx: &ProbeContext) -> Result<u32, ParseError> {
    bump(COUNTER_RECV_OBSERVED);

    let config = load_config();
    let pid = current_pid();
    if !in_scope(&config, pid) {
        bump(COUNTER_FILTERED_OUT);
        return Ok(0);
    }

    let id = sock_id(sock_from_context(ctx)?);
    let now = now_ns();

    match on_receive(&mut KernelInflight, id, now, config.stale_threshold_ns) {
        ReceiveOutcome::Matched { key, latency_ns } => {
            mark_delivered(id, key, now);
            emit(ctx, &config, key, now, latency_ns, pid, EVENT_KIND_RECV);
        }
        ReceiveOutcome::Unmatched => {
            bump(COUNTER_UNMATCHED_RECEIVES);
            if let Some(record) = SOCKETS.get_ptr_mut(&id) {
                unsafe { (*record).delivered_ns = now };
            }
        }
        ReceiveOutcome::Stale | ReceiveOutcome::ClockSkew => bump(COUNTER_STALE_DISCARDS),
    }

    Ok(0)
}

/// Attached to: tcp_cleanup_rbuf
///
/// Secondary phase marker: time from delivery (tcp_recvmsg) to the receive
/// buffer being drained by the application.
#[kprobe]
pub fn tcp_cleanup_rbuf(ctx: ProbeContext) -> u32 {
    match try_tcp_cleanup_rbuf(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            bump(COUNTER_INVALID_SOCKETS);
            0
        }
    }
}

fn try_tcp_cleanup_rbuf(ctx: &ProbeContext) -> Result<u32, ParseError> {
    bump(COUNTER_CLEANUP_OBSERVED);

    let config = load_config();
    let pid = current_pid();
    if !in_scope(&config, pid) {
        bump(COUNTER_FILTERED_OUT);
        return Ok(0);
    }

    let id = sock_id(sock_from_context(ctx)?);
    let record = match SOCKETS.get_ptr_mut(&id) {
        Some(record) => record,
        None => return Ok(0),
    };

    let now = now_ns();
    let (key, latency_ns) = unsafe {
        let record = &mut *record;
        match on_cleanup(record, now) {
            Some(latency_ns) => (record.key, latency_ns),
            None => return Ok(0),
        }
    };

    emit(ctx, &config, key, now, latency_ns, pid, EVENT_KIND_CLEANUP);

    Ok(0)
}

/// Record the socket's connection identity unless it is already known
#[inline(always)]
fn remember_socket(id: u64, key: ConnectionKey) {
    if let Some(record) = SOCKETS.get_ptr_mut(&id) {
        if unsafe { (*record).key } == key {
            return;
        }
    }
    let record = SocketRecord {
        delivered_ns: 0,
        key,
    };
    if SOCKETS.insert(&id, &record, 0).is_err() {
        bump(COUNTER_MAP_UPDATE_FAILURES);
    }
}

#[inline(always)]
fn mark_delivered(id: u64, key: ConnectionKey, now: u64) {
    if let Some(record) = SOCKETS.get_ptr_mut(&id) {
        unsafe { (*record).delivered_ns = now };
        return;
    }
    let record = SocketRecord {
        delivered_ns: now,
        key,
    };
    if SOCKETS.insert(&id, &record, 0).is_err() {
        bump(COUNTER_MAP_UPDATE_FAILURES);
    }
}
