//! One-shot TCP side channel for large static payloads
//!
//! A peer asking for static data gets a short-lived listener on a port drawn
//! from a [`PortPool`]. The sender waits a bounded time for the peer to
//! connect, streams every length-prefixed blob and closes. A peer that stops
//! reading for as long is cut off. The sender never retries: a peer that
//! missed the download asks again over the low-latency channel.

use log::{debug, info, warn};
use shared::{encode_blob, PeerId, BLOB_PREFIX_SIZE};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Bytes written per update
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum BulkError {
    #[error("no free port in {first}..{end}")]
    NoFreePort { first: u16, end: u32 },

    #[error("peer {peer} never connected to port {port}")]
    ClientNoShow { peer: PeerId, port: u16 },

    #[error("peer {peer} stopped reading from port {port}")]
    Stalled { peer: PeerId, port: u16 },

    #[error("bulk stream to peer {peer} failed: {source}")]
    Stream { peer: PeerId, source: io::Error },

    #[error("cannot listen on port {port}: {source}")]
    Listen { port: u16, source: io::Error },
}

/// Contiguous range of ports handed out lowest first
#[derive(Debug, Clone)]
pub struct PortPool {
    first: u16,
    busy: Vec<bool>,
}

impl PortPool {
    pub fn new(first: u16, len: u16) -> Self {
        let len = len.min(u16::MAX - first);
        Self {
            first,
            busy: vec![false; len as usize],
        }
    }

    pub fn acquire(&mut self) -> Option<u16> {
        let i = self.busy.iter().position(|busy| !busy)?;
        self.busy[i] = true;
        Some(self.first + i as u16)
    }

    pub fn release(&mut self, port: u16) {
        if let Some(busy) = self.slot(port) {
            *busy = false;
        }
    }

    pub fn in_use(&self) -> usize {
        self.busy.iter().filter(|busy| **busy).count()
    }

    fn slot(&mut self, port: u16) -> Option<&mut bool> {
        let i = port.checked_sub(self.first)? as usize;
        self.busy.get_mut(i)
    }

    fn end(&self) -> u32 {
        self.first as u32 + self.busy.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkState {
    AwaitingClient,
    Streaming,
    Done,
}

pub struct BulkSender {
    peer: PeerId,
    /// Port taken from the pool
    lease: u16,
    /// Port actually bound
    port: u16,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    data: Vec<u8>,
    written: usize,
    /// Allowed wait for the connection, then between two writes
    timeout: Duration,
    deadline: Instant,
    state: BulkState,
}

impl BulkSender {
    /// Opens a listener for `peer` on the lowest free port of `pool`
    ///
    /// Ports found taken by another process are skipped for this call only.
    pub async fn open(
        pool: &mut PortPool,
        host: &str,
        peer: PeerId,
        payloads: &[Vec<u8>],
        timeout: Duration,
    ) -> Result<Self, BulkError> {
        let mut taken = Vec::new();
        let bound = loop {
            let port = match pool.acquire() {
                Some(port) => port,
                None => {
                    break Err(BulkError::NoFreePort {
                        first: pool.first,
                        end: pool.end(),
                    })
                }
            };

            match TcpListener::bind((host, port)).await {
                Ok(listener) => break Ok((port, listener)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    warn!("bulk port {} already in use, trying next", port);
                    taken.push(port);
                }
                Err(source) => {
                    pool.release(port);
                    break Err(BulkError::Listen { port, source });
                }
            }
        };
        for port in taken {
            pool.release(port);
        }
        let (lease, listener) = bound?;

        let port = listener
            .local_addr()
            .map_err(|source| BulkError::Listen { port: lease, source })?
            .port();

        let mut data = Vec::new();
        for payload in payloads {
            data.extend_from_slice(&encode_blob(payload));
        }

        info!(
            "bulk channel for peer {} listening on port {} ({} bytes)",
            peer,
            port,
            data.len()
        );

        Ok(Self {
            peer,
            lease,
            port,
            listener: Some(listener),
            stream: None,
            data,
            written: 0,
            timeout,
            deadline: Instant::now() + timeout,
            state: BulkState::AwaitingClient,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bytes the peer will receive, length prefixes included
    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// Makes progress for at most `wait`
    pub async fn update(&mut self, wait: Duration) -> Result<BulkState, BulkError> {
        match self.state {
            BulkState::AwaitingClient => self.accept(wait).await?,
            BulkState::Streaming => self.stream_chunk(wait).await?,
            BulkState::Done => {}
        }
        Ok(self.state)
    }

    async fn accept(&mut self, wait: Duration) -> Result<(), BulkError> {
        let now = Instant::now();
        let no_show = BulkError::ClientNoShow {
            peer: self.peer,
            port: self.port,
        };
        if now >= self.deadline {
            return Err(no_show);
        }

        let listener = match &self.listener {
            Some(listener) => listener,
            None => return Err(no_show),
        };

        let wait = wait.min(self.deadline - now);
        let accepted = tokio::time::timeout(wait, listener.accept()).await;
        match accepted {
            Ok(Ok((stream, addr))) => {
                debug!("peer {} connected to bulk port {} from {}", self.peer, self.port, addr);
                self.listener = None;
                self.stream = Some(stream);
                self.deadline = Instant::now() + self.timeout;
                self.state = BulkState::Streaming;
                Ok(())
            }
            Ok(Err(source)) => Err(BulkError::Stream {
                peer: self.peer,
                source,
            }),
            Err(_) => Ok(()),
        }
    }

    async fn stream_chunk(&mut self, wait: Duration) -> Result<(), BulkError> {
        let peer = self.peer;
        let now = Instant::now();
        if now >= self.deadline {
            return Err(BulkError::Stalled { peer, port: self.port });
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };

        let end = (self.written + CHUNK_SIZE).min(self.data.len());
        if self.written < end {
            let wait = wait.min(self.deadline - now);
            let written = tokio::time::timeout(wait, stream.write(&self.data[self.written..end])).await;
            match written {
                Ok(Ok(0)) => {
                    let source = io::Error::from(io::ErrorKind::WriteZero);
                    return Err(BulkError::Stream { peer, source });
                }
                Ok(Ok(n)) => {
                    self.written += n;
                    self.deadline = Instant::now() + self.timeout;
                }
                Ok(Err(source)) => return Err(BulkError::Stream { peer, source }),
                Err(_) => return Ok(()),
            }
        }

        if self.written >= self.data.len() {
            if let Err(source) = stream.shutdown().await {
                return Err(BulkError::Stream { peer, source });
            }
            info!("bulk transfer to peer {} complete ({} bytes)", peer, self.written);
            self.stream = None;
            self.state = BulkState::Done;
        }
        Ok(())
    }

    /// Drops the connection and gives the port back to `pool`
    pub fn close(self, pool: &mut PortPool) {
        debug!("closing bulk port {} for peer {}", self.port, self.peer);
        pool.release(self.lease);
    }
}

/// Client side: downloads every blob until the server closes the stream
pub async fn download(addr: SocketAddr) -> io::Result<Vec<Vec<u8>>> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut blobs = Vec::new();

    loop {
        let mut prefix = [0u8; BLOB_PREFIX_SIZE];
        match stream.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        let mut blob = vec![0u8; u32::from_le_bytes(prefix) as usize];
        stream.read_exact(&mut blob).await?;
        blobs.push(blob);
    }

    Ok(blobs)
}
