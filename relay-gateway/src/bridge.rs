// Relay Gateway - UDP bridge for the Beacon Relay core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! UDP edge of the gateway
//!
//! Three threads move frames between the socket and the relay core:
//!
//! - **receiver**: socket -> inbound [`PacketChannel`]
//! - **pump**: inbound channel -> [`WorkRecord`] -> buffer queue
//! - **sender**: outbound [`PacketChannel`] -> socket
//!
//! Every datagram carries a two-byte big-endian beacon id followed by the
//! payload. Datagrams from the upstream peer are downlink traffic for the
//! named beacon; anything else comes from a beacon. A beacon frame with an
//! empty payload is a heartbeat and goes to the maintenance queue.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use beacon_relay::{
    BufferSet, NodeAddress, PacketChannel, Relay, RelayConfig, RelayError, ShutdownFlag,
    TransportRecord, WorkRecord,
};
use parking_lot::Mutex;
use thiserror::Error;

/// Queue for beacon-to-server traffic
pub const UPLINK: &str = "uplink";
/// Queue for server-to-beacon traffic
pub const DOWNLINK: &str = "downlink";
/// Queue for beacon heartbeats
pub const MAINTENANCE: &str = "maintenance";

const FRAME_HEADER: usize = 2;
const MAX_DATAGRAM: usize = 65_536;

/// Gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Relay core error
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Socket setup failed
    #[error("Socket error on {addr}: {source}")]
    Socket {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A bridge thread could not be spawned
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Split a datagram into beacon id and payload
pub fn parse_frame(bytes: &[u8]) -> Option<(u16, &[u8])> {
    if bytes.len() < FRAME_HEADER {
        return None;
    }
    let id = u16::from_be_bytes([bytes[0], bytes[1]]);
    Some((id, &bytes[FRAME_HEADER..]))
}

/// Build a datagram for beacon `id`
pub fn encode_frame(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Where handler output goes
struct Routes {
    peer: SocketAddr,
    beacons: Mutex<HashMap<u16, SocketAddr>>,
    outbound: Arc<PacketChannel>,
    shutdown: ShutdownFlag,
    poll: Duration,
}

impl Routes {
    fn send(&self, to: SocketAddr, frame: &[u8]) {
        if let Err(e) =
            self.outbound
                .enqueue_polling(to.ip(), to.port(), frame, self.poll, &self.shutdown)
        {
            log::warn!("dropping outbound frame to {}: {}", to, e);
        }
    }

    fn uplink(&self, record: WorkRecord) {
        if let NodeAddress::Beacon(id) = record.address() {
            self.send(self.peer, &encode_frame(id, record.payload()));
        }
    }

    fn downlink(&self, record: WorkRecord) {
        let NodeAddress::Beacon(id) = record.address() else {
            return;
        };
        let target = self.beacons.lock().get(&id).copied();
        match target {
            Some(addr) => self.send(addr, &encode_frame(id, record.payload())),
            None => log::warn!("no route to beacon {:04x}, dropping downlink frame", id),
        }
    }

    fn heartbeat(&self, record: WorkRecord) {
        if let NodeAddress::Beacon(id) = record.address() {
            log::debug!("heartbeat from beacon {:04x}", id);
            let target = self.beacons.lock().get(&id).copied();
            if let Some(addr) = target {
                self.send(addr, &encode_frame(id, &[]));
            }
        }
    }
}

/// A running UDP gateway
pub struct Gateway {
    relay: Arc<Relay>,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Bind `bind`, start the relay core and the bridge threads
    pub fn start(
        config: RelayConfig,
        bind: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self, GatewayError> {
        let poll = config.channel.poll_interval();
        let builder = Relay::builder(config);

        let routes = Arc::new(Routes {
            peer,
            beacons: Mutex::new(HashMap::new()),
            outbound: builder.outbound(),
            shutdown: builder.shutdown_flag(),
            poll,
        });

        let relay = {
            let up = Arc::clone(&routes);
            let down = Arc::clone(&routes);
            let maint = Arc::clone(&routes);
            builder
                .handler(UPLINK, move |r: WorkRecord, _: &BufferSet| up.uplink(r))
                .handler(DOWNLINK, move |r: WorkRecord, _: &BufferSet| down.downlink(r))
                .handler(MAINTENANCE, move |r: WorkRecord, _: &BufferSet| maint.heartbeat(r))
                .start()?
        };
        let relay = Arc::new(relay);

        let socket = UdpSocket::bind(bind).map_err(|source| GatewayError::Socket {
            addr: bind,
            source,
        })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| GatewayError::Socket { addr: bind, source })?;
        socket
            .set_read_timeout(Some(poll.max(Duration::from_millis(1))))
            .map_err(|source| GatewayError::Socket { addr: bind, source })?;
        let send_socket = socket
            .try_clone()
            .map_err(|source| GatewayError::Socket { addr: bind, source })?;

        let mut gateway = Self {
            relay: Arc::clone(&relay),
            local_addr,
            threads: Vec::with_capacity(3),
        };

        let inbound = relay.inbound();
        let flag = relay.shutdown_flag();
        gateway.spawn("receiver", move || receive_loop(socket, inbound, flag, poll))?;

        let pump_relay = Arc::clone(&relay);
        let pump_routes = Arc::clone(&routes);
        gateway.spawn("pump", move || pump_loop(pump_relay, pump_routes, poll))?;

        let outbound = relay.outbound();
        let flag = relay.shutdown_flag();
        gateway.spawn("sender", move || send_loop(send_socket, outbound, flag, poll))?;

        log::info!("gateway listening on {}, upstream peer {}", local_addr, peer);
        Ok(gateway)
    }

    fn spawn<F>(&mut self, name: &'static str, body: F) -> Result<(), GatewayError>
    where
        F: FnOnce() + Send + 'static,
    {
        match std::thread::Builder::new()
            .name(format!("gateway-{}", name))
            .spawn(body)
        {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(source) => {
                self.stop();
                Err(GatewayError::Spawn { name, source })
            }
        }
    }

    /// Address the gateway socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The relay core
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Flag that stops every gateway thread
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.relay.shutdown_flag()
    }

    /// Stop the bridge threads, then the relay core
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.relay.shutdown_flag().request();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("gateway thread terminated abnormally");
            }
        }
        self.relay.shutdown();

        let unsent = self.relay.outbound().len();
        if unsent > 0 {
            log::warn!("{} outbound frames not sent at shutdown", unsent);
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}

fn receive_loop(
    socket: UdpSocket,
    inbound: Arc<PacketChannel>,
    shutdown: ShutdownFlag,
    poll: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while shutdown.is_running() {
        match socket.recv_from(&mut buf) {
            Ok((n, src)) => {
                if let Err(e) =
                    inbound.enqueue_polling(src.ip(), src.port(), &buf[..n], poll, &shutdown)
                {
                    log::warn!("dropping datagram from {}: {}", src, e);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => log::warn!("receive failed: {}", e),
        }
    }
}

fn pump_loop(relay: Arc<Relay>, routes: Arc<Routes>, poll: Duration) {
    let inbound = relay.inbound();
    let shutdown = relay.shutdown_flag();
    while let Some(frame) = inbound.dequeue_polling(poll, &shutdown) {
        route(&relay, &routes, frame);
    }
}

fn route(relay: &Relay, routes: &Routes, frame: TransportRecord) {
    let src = SocketAddr::new(frame.address, frame.port);
    let Some((id, payload)) = parse_frame(&frame.content) else {
        log::warn!("runt frame ({} bytes) from {}", frame.len(), src);
        return;
    };

    let queue = if src == routes.peer {
        DOWNLINK
    } else {
        routes.beacons.lock().insert(id, src);
        if payload.is_empty() {
            MAINTENANCE
        } else {
            UPLINK
        }
    };

    let mut record = match relay.acquire_record(NodeAddress::Beacon(id)) {
        Ok(record) => record,
        Err(e) => {
            log::warn!("dropping frame from {}: {}", src, e);
            return;
        }
    };
    if let Err(e) = record.set_payload(payload) {
        log::warn!("dropping frame from {}: {}", src, e);
        return;
    }
    if let Err(refused) = relay.enqueue_by_name(queue, record) {
        log::warn!("queue '{}' refused frame from {}: {}", queue, src, refused.reason);
    }
}

fn send_loop(
    socket: UdpSocket,
    outbound: Arc<PacketChannel>,
    shutdown: ShutdownFlag,
    poll: Duration,
) {
    while let Some(frame) = outbound.dequeue_polling(poll, &shutdown) {
        let to = SocketAddr::new(frame.address, frame.port);
        if let Err(e) = socket.send_to(&frame.content, to) {
            log::warn!("send to {} failed: {}", to, e);
        }
    }
}
