//! UDP transport.
//!
//! One socket bound to the configured receive port with a read timeout, one
//! unbound socket reused for every send, and a worker thread on each side:
//! the send thread drains the outbound queue, the receive thread fills the
//! inbound queue. The link is lossy by design — a failed send is logged and
//! the datagram dropped.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};

use crate::state::ServerState;
use crate::wire::MESSAGE_LENGTH;

/// Receive timeout; bounds how long shutdown waits on the receive thread.
const RECV_TIMEOUT_MS: u64 = 300;

/// Sleep of the send thread when the outbound queue is empty.
const SEND_IDLE_SLEEP_MS: u64 = 50;

pub struct UdpTransport {
    recv_addr: SocketAddr,
    send_thread: JoinHandle<()>,
    recv_thread: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind the sockets and spawn the send and receive threads.
    pub fn start(state: Arc<ServerState>) -> io::Result<Self> {
        let bind_address = state.config.network.bind_address.clone();
        let recv_socket =
            UdpSocket::bind((bind_address.as_str(), state.config.network.recv_port))?;
        recv_socket.set_read_timeout(Some(Duration::from_millis(RECV_TIMEOUT_MS)))?;
        let recv_addr = recv_socket.local_addr()?;

        let send_socket = UdpSocket::bind((bind_address.as_str(), 0))?;
        info!("transport listening on {recv_addr}");

        let send_thread = thread::Builder::new().name("udp-send".into()).spawn({
            let state = Arc::clone(&state);
            move || send_loop(state, send_socket)
        })?;
        let recv_thread = thread::Builder::new().name("udp-recv".into()).spawn({
            let state = Arc::clone(&state);
            move || recv_loop(state, recv_socket)
        })?;

        Ok(Self {
            recv_addr,
            send_thread,
            recv_thread,
        })
    }

    /// Address the receive socket actually bound (the configured port may
    /// be 0 for an ephemeral one).
    pub fn recv_addr(&self) -> SocketAddr {
        self.recv_addr
    }

    pub fn join(self) {
        let _ = self.send_thread.join();
        let _ = self.recv_thread.join();
    }
}

fn send_loop(state: Arc<ServerState>, socket: UdpSocket) {
    while state.is_running() {
        match state.outbound.dequeue() {
            Some(pkt) => match socket.send_to(&pkt.payload, pkt.addr) {
                Ok(_) => state.metrics.inc_packets_sent(),
                Err(err) => {
                    state.metrics.inc_send_errors();
                    warn!("sendto {} failed: {err}", pkt.addr);
                }
            },
            None => thread::sleep(Duration::from_millis(SEND_IDLE_SLEEP_MS)),
        }
    }
    debug!("send thread stopped");
}

fn recv_loop(state: Arc<ServerState>, socket: UdpSocket) {
    let mut buf = [0u8; MESSAGE_LENGTH];
    while state.is_running() {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                if let Err(err) = state
                    .inbound
                    .enqueue(peer, Bytes::copy_from_slice(&buf[..len]))
                {
                    warn!("inbound queue rejected datagram from {peer}: {err}");
                }
            }
            // A timeout just re-checks the shutdown flag.
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) => warn!("recvfrom failed: {err}"),
        }
    }
    debug!("receive thread stopped");
}
