//! Low-latency UDP transport
//!
//! The transport owns the socket and the [`PeerTable`]. It splits every
//! received datagram into frames, answers handshakes and keepalives on its
//! own, and queues everything else, tagged with the sender's peer id, for the
//! application to [`pop`](Transport::pop).

use crate::peers::{PeerError, PeerTable};
use log::{debug, error, info, warn};
use shared::frame::{split_burst, FrameError, WireFrame};
use shared::{opcode, HandshakeReply, IdAllocator, PeerId, HANDSHAKE_MAGIC};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Largest datagram read in one go; peers only send control-sized bursts
const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("peer {0} is not alive")]
    DeadPeer(PeerId),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub struct Transport {
    socket: UdpSocket,
    peers: PeerTable,
    inbox: VecDeque<WireFrame>,
    outbox: VecDeque<(SocketAddr, WireFrame)>,
    buffer: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl Transport {
    pub async fn bind(addr: &str, max_peers: usize, timeout: Duration) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!("listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            peers: PeerTable::new(max_peers, timeout),
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            buffer: Box::new([0u8; RECV_BUFFER_SIZE]),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Waits at most `wait` for traffic, then drains the socket and sweeps
    /// silent peers
    pub async fn update(&mut self, wait: Duration, ids: &mut IdAllocator) -> Result<(), TransportError> {
        let received = tokio::time::timeout(wait, self.socket.recv_from(&mut self.buffer[..])).await;
        match received {
            Ok(Ok((len, from))) => {
                self.receive(len, from, ids);
                self.drain_socket(ids);
            }
            Ok(Err(e)) => error!("error receiving datagram: {}", e),
            Err(_) => {}
        }

        self.peers.sweep(Instant::now());
        self.flush().await;
        Ok(())
    }

    /// Reads whatever is already waiting without blocking
    fn drain_socket(&mut self, ids: &mut IdAllocator) {
        loop {
            match self.socket.try_recv_from(&mut self.buffer[..]) {
                Ok((len, from)) => self.receive(len, from, ids),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("error receiving datagram: {}", e);
                    break;
                }
            }
        }
    }

    fn receive(&mut self, len: usize, from: SocketAddr, ids: &mut IdAllocator) {
        let bytes = self.buffer[..len].to_vec();
        self.process_burst(from, &bytes, Instant::now(), ids);
    }

    /// Handles every complete frame of one datagram
    ///
    /// Returns the number of frames queued for the application. Processing
    /// stops at the first malformed frame; the rest of the burst is dropped.
    pub fn process_burst(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
        ids: &mut IdAllocator,
    ) -> usize {
        let mut queued = 0;
        let mut burst = split_burst(bytes);

        while let Some(next) = burst.next() {
            let mut frame = match next {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        "malformed frame from {} at byte {} ({}), dropping rest of burst",
                        from,
                        burst.consumed(),
                        e
                    );
                    break;
                }
            };

            match frame.opcode() {
                opcode::INIT => self.handle_init(from, &frame, now, ids),
                opcode::PING => self.handle_ping(from, now),
                opcode::PONG => {
                    if self.peers.touch(from, now).is_none() {
                        warn!("pong from unknown peer {} (dropped)", from);
                    }
                }
                op => match self.peers.touch(from, now) {
                    Some(id) => {
                        frame.set_sender(id);
                        self.inbox.push_back(frame);
                        queued += 1;
                    }
                    None => warn!("opcode {} from unknown peer {} (dropped)", op, from),
                },
            }
        }

        queued
    }

    fn handle_init(&mut self, from: SocketAddr, frame: &WireFrame, now: Instant, ids: &mut IdAllocator) {
        if !frame.payload().starts_with(HANDSHAKE_MAGIC) {
            warn!("bad handshake magic from {} (dropped)", from);
            return;
        }

        let peer_id = match self.peers.handshake(from, now, ids) {
            Ok(id) => id,
            Err(PeerError::Full { max_peers }) => {
                warn!("refusing {}: all {} peer slots in use", from, max_peers);
                return;
            }
            Err(e) => {
                error!("handshake from {} failed: {}", from, e);
                return;
            }
        };

        let reply = HandshakeReply {
            peer_id,
            timeout_ms: self.peers.timeout().as_millis().min(u32::MAX as u128) as u32,
        };
        match reply.encode() {
            Ok(frame) => self.outbox.push_back((from, frame)),
            Err(e) => error!("cannot encode handshake reply: {}", e),
        }
    }

    fn handle_ping(&mut self, from: SocketAddr, now: Instant) {
        let id = match self.peers.touch(from, now) {
            Some(id) => id,
            None => {
                warn!("ping from unknown peer {} (dropped)", from);
                return;
            }
        };

        let mut pong = WireFrame::new(opcode::PONG);
        match pong.append_u32(id) {
            Ok(()) => self.outbox.push_back((from, pong)),
            Err(e) => error!("cannot encode pong: {}", e),
        }
    }

    /// Sends transport-generated replies
    async fn flush(&mut self) {
        while let Some((addr, frame)) = self.outbox.pop_front() {
            if let Err(e) = self.socket.send_to(frame.as_bytes(), addr).await {
                error!("failed to send to {}: {}", addr, e);
            }
        }
    }

    /// Sends `frame` to a live peer
    pub async fn send_to(&self, id: PeerId, frame: &WireFrame) -> Result<(), TransportError> {
        let addr = self.peers.addr_of(id).ok_or(TransportError::DeadPeer(id))?;
        let sent = self.socket.send_to(frame.as_bytes(), addr).await?;
        debug!("sent {} bytes (opcode {}) to peer {}", sent, frame.opcode(), id);
        Ok(())
    }

    /// Next application frame, oldest first
    pub fn pop(&mut self) -> Option<WireFrame> {
        self.inbox.pop_front()
    }

    /// Peers evicted or killed since the previous call
    pub fn lost_connections(&mut self) -> Vec<PeerId> {
        self.peers.drain_lost()
    }

    pub fn kill(&mut self, id: PeerId) -> bool {
        self.peers.kill(id)
    }

    pub fn is_alive(&self, id: PeerId) -> bool {
        self.peers.is_alive(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::handshake_request;

    fn client_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn transport() -> Transport {
        Transport::bind("127.0.0.1:0", 4, Duration::from_secs(5))
            .await
            .unwrap()
    }

    fn burst(frames: &[WireFrame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.as_bytes().to_vec()).collect()
    }

    fn connect(transport: &mut Transport, ids: &mut IdAllocator) -> PeerId {
        let hello = handshake_request().unwrap();
        transport.process_burst(client_addr(), hello.as_bytes(), Instant::now(), ids);
        transport.peers().id_by_addr(client_addr()).unwrap()
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let err = Transport::bind("not an address", 4, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_handshake_is_handled_internally() {
        let mut transport = transport().await;
        let mut ids = IdAllocator::new();

        let id = connect(&mut transport, &mut ids);
        assert!(transport.is_alive(id));
        assert!(transport.pop().is_none());
        assert_eq!(transport.outbox.len(), 1);

        let (addr, reply) = &transport.outbox[0];
        assert_eq!(*addr, client_addr());
        assert_eq!(reply.opcode(), opcode::INIT);
        let reply = HandshakeReply::decode(reply.payload()).unwrap().unwrap();
        assert_eq!(reply.peer_id, id);
        assert_eq!(reply.timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_bad_magic_is_dropped() {
        let mut transport = transport().await;
        let mut ids = IdAllocator::new();

        let bogus = WireFrame::from_payload(opcode::INIT, b"hello").unwrap();
        transport.process_burst(client_addr(), bogus.as_bytes(), Instant::now(), &mut ids);

        assert!(transport.peers().is_empty());
        assert!(transport.outbox.is_empty());
    }

    #[tokio::test]
    async fn test_burst_is_demultiplexed() {
        let mut transport = transport().await;
        let mut ids = IdAllocator::new();
        let id = connect(&mut transport, &mut ids);

        let frames = [
            WireFrame::from_payload(opcode::CLIENT_READY, &[]).unwrap(),
            WireFrame::new(opcode::PING),
            WireFrame::from_payload(opcode::CONTROL_FRAME, &[7; 15]).unwrap(),
        ];
        let queued = transport.process_burst(client_addr(), &burst(&frames), Instant::now(), &mut ids);

        assert_eq!(queued, 2);
        let first = transport.pop().unwrap();
        assert_eq!(first.opcode(), opcode::CLIENT_READY);
        assert_eq!(first.sender(), Some(id));
        let second = transport.pop().unwrap();
        assert_eq!(second.opcode(), opcode::CONTROL_FRAME);
        assert_eq!(second.payload(), &[7; 15]);
        assert!(transport.pop().is_none());

        // handshake reply + pong
        let pong = &transport.outbox[1].1;
        assert_eq!(pong.opcode(), opcode::PONG);
        assert_eq!(pong.reader().read_u32().unwrap(), id);
    }

    #[tokio::test]
    async fn test_truncated_tail_is_dropped() {
        let mut transport = transport().await;
        let mut ids = IdAllocator::new();
        connect(&mut transport, &mut ids);

        let mut bytes = burst(&[
            WireFrame::from_payload(opcode::CLIENT_READY, &[]).unwrap(),
            WireFrame::from_payload(opcode::CONTROL_FRAME, &[1; 15]).unwrap(),
        ]);
        bytes.truncate(bytes.len() - 4);

        let queued = transport.process_burst(client_addr(), &bytes, Instant::now(), &mut ids);
        assert_eq!(queued, 1);
        assert_eq!(transport.pop().unwrap().opcode(), opcode::CLIENT_READY);
        assert!(transport.pop().is_none());
    }

    #[tokio::test]
    async fn test_unknown_sender_is_dropped() {
        let mut transport = transport().await;
        let mut ids = IdAllocator::new();

        let frame = WireFrame::from_payload(opcode::CONTROL_FRAME, &[0; 15]).unwrap();
        let queued = transport.process_burst(client_addr(), frame.as_bytes(), Instant::now(), &mut ids);

        assert_eq!(queued, 0);
        assert!(transport.pop().is_none());
    }

    #[tokio::test]
    async fn test_send_to_dead_peer() {
        let transport = transport().await;
        let frame = WireFrame::new(opcode::SNAPSHOT);
        let result = transport.send_to(42, &frame).await;
        assert!(matches!(result, Err(TransportError::DeadPeer(42))));
    }

    #[tokio::test]
    async fn test_update_times_out_and_sweeps() {
        let mut transport = Transport::bind("127.0.0.1:0", 4, Duration::from_millis(10))
            .await
            .unwrap();
        let mut ids = IdAllocator::new();
        let id = connect(&mut transport, &mut ids);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio_test::assert_ok!(transport.update(Duration::from_millis(5), &mut ids).await);

        assert!(!transport.is_alive(id));
        assert_eq!(transport.lost_connections(), vec![id]);
        assert!(transport.lost_connections().is_empty());
    }
}
