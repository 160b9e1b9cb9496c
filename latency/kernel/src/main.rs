//! eBPF Latency Probe - Kernel Space Program
//!
//! Times TCP round trips inside the kernel by attaching kprobes to
//! tcp_sendmsg, tcp_recvmsg and tcp_cleanup_rbuf.
//!
//! ## Architecture
//!
//! ```text
//! tcp_sendmsg()      -> open a measurement in INFLIGHT (if none pending)
//!                       |
//!                       v
//! tcp_recvmsg()      -> close it, emit a recv event to EVENTS,
//!                       stamp the delivery time in SOCKETS
//!                       |
//!                       v
//! tcp_cleanup_rbuf() -> emit a cleanup event with the delivery-to-drain time
//!                       |
//!                       v
//! Userspace          -> per-CPU readers, aggregation, report
//! ```
//!
//! Every hook does a bounded number of map operations and never fails the
//! traced kernel function; problems are recorded in COUNTERS.
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none -Z build-std=core
//! ```

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod socket_parser;

pub use handlers::{tcp_cleanup_rbuf, tcp_recvmsg, tcp_sendmsg};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
