//! Listening, connecting and accepting, plus raw byte transfer over the resulting channels.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::directory::PeerTable;
use crate::{MPIError, Result};

/// First bytes a client writes on a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Hello {
    rank: u64,
    size: u64,
}

/// Sockets owned by one rank: an optional listener and at most one channel per peer.
#[derive(Debug)]
pub struct Transport {
    rank: usize,
    size: usize,
    listener: Option<TcpListener>,
    channels: Vec<Option<TcpStream>>,
}

impl Transport {
    pub fn new(rank: usize, size: usize) -> Result<Self> {
        let mut channels = Vec::new();
        channels
            .try_reserve_exact(size)
            .map_err(|_| MPIError::AllocationError {
                rank,
                what: "channel table",
            })?;
        channels.resize_with(size, || None);
        Ok(Self {
            rank,
            size,
            listener: None,
            channels,
        })
    }

    /// Bind to an OS-assigned port on every interface and return that port.
    pub fn listen(&mut self) -> Result<u16> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .map_err(|e| self.socket_error("bind", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| self.socket_error("getsockname", e))?
            .port();
        debug!("Rank {} listening on port {}", self.rank, port);
        self.listener = Some(listener);
        Ok(port)
    }

    /// Open a channel to `peer`, which must already be listening at its published port.
    pub fn connect(&mut self, peer: usize, peers: &PeerTable) -> Result<()> {
        let record = peers.get(peer).ok_or(MPIError::InvalidRank(peer))?;
        let port = record.port.ok_or_else(|| {
            self.socket_error(
                "connect",
                std::io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("rank {} published no port", peer),
                ),
            )
        })?;

        let mut stream = TcpStream::connect((record.hostname.as_str(), port))
            .map_err(|e| self.socket_error("connect", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| self.socket_error("connect", e))?;
        let hello = Hello {
            rank: self.rank as u64,
            size: self.size as u64,
        };
        bincode::serialize_into(&mut stream, &hello).map_err(|e| MPIError::TransportWriteError {
            rank: self.rank,
            peer,
            source: bincode_to_io(e),
        })?;

        debug!(
            "Rank {} connected to rank {} at {}:{}",
            self.rank, peer, record.hostname, port
        );
        self.channels[peer] = Some(stream);
        Ok(())
    }

    /// Block for one inbound connection and file it under the rank it belongs to.
    ///
    /// The client's claimed rank must be one of `expected` with no channel yet, and the
    /// connection must come from the host that rank published.
    pub fn accept_one(&mut self, expected: &[usize], peers: &PeerTable, local_host: &str) -> Result<usize> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            self.socket_error("accept", std::io::Error::new(ErrorKind::NotConnected, "not listening"))
        })?;
        let (mut stream, addr) = listener.accept().map_err(|e| self.socket_error("accept", e))?;
        let unknown = |reason: String| MPIError::UnknownPeerConnection {
            rank: self.rank,
            host: addr.ip().to_string(),
            reason,
        };

        let hello: Hello = bincode::deserialize_from(&mut stream)
            .map_err(|e| unknown(format!("no handshake: {}", e)))?;
        if hello.size != self.size as u64 {
            return Err(unknown(format!(
                "peer belongs to a run of {} processes, not {}",
                hello.size, self.size
            )));
        }
        let peer = hello.rank as usize;
        if !expected.contains(&peer) || self.has_channel(peer) {
            return Err(unknown(format!("rank {} is not an expected client", peer)));
        }
        let record = peers.get(peer).ok_or(MPIError::InvalidRank(peer))?;
        if !host_matches(addr.ip(), &record.hostname, local_host) {
            return Err(unknown(format!(
                "address does not belong to {}, the host of rank {}",
                short_name(&record.hostname),
                peer
            )));
        }

        stream
            .set_nodelay(true)
            .map_err(|e| self.socket_error("accept", e))?;
        debug!("Rank {} accepted rank {} from {}", self.rank, peer, addr);
        self.channels[peer] = Some(stream);
        Ok(peer)
    }

    pub fn has_channel(&self, peer: usize) -> bool {
        matches!(self.channels.get(peer), Some(Some(_)))
    }

    /// Write the whole buffer to `peer`.
    pub fn send_bytes(&self, peer: usize, bytes: &[u8]) -> Result<()> {
        let rank = self.rank;
        let mut stream = self.channel(peer)?;
        stream
            .write_all(bytes)
            .map_err(|source| MPIError::TransportWriteError { rank, peer, source })
    }

    /// Fill `buf` from `peer`, reading as many times as it takes.
    ///
    /// A read of zero bytes before the buffer is full means the peer closed the channel.
    pub fn recv_bytes(&self, peer: usize, buf: &mut [u8]) -> Result<()> {
        let rank = self.rank;
        let mut stream = self.channel(peer)?;
        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(MPIError::TransportReadError {
                        rank,
                        peer,
                        source: std::io::Error::new(
                            ErrorKind::UnexpectedEof,
                            format!("rank {} closed the connection", peer),
                        ),
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(MPIError::TransportReadError { rank, peer, source }),
            }
        }
        Ok(())
    }

    /// Close every channel and the listener.
    pub fn close(&mut self) {
        for (peer, slot) in self.channels.iter_mut().enumerate() {
            if let Some(stream) = slot.take() {
                if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
                    if e.kind() != ErrorKind::NotConnected {
                        warn!("Rank {} could not shut down channel to rank {}: {}", self.rank, peer, e);
                    }
                }
            }
        }
        self.listener = None;
    }

    fn channel(&self, peer: usize) -> Result<&TcpStream> {
        if peer >= self.size {
            return Err(MPIError::InvalidRank(peer));
        }
        self.channels[peer].as_ref().ok_or(MPIError::NoChannel {
            rank: self.rank,
            peer,
        })
    }

    fn socket_error(&self, op: &'static str, source: std::io::Error) -> MPIError {
        MPIError::SocketError {
            rank: self.rank,
            op,
            source,
        }
    }
}

fn bincode_to_io(e: bincode::Error) -> std::io::Error {
    match *e {
        bincode::ErrorKind::Io(io) => io,
        other => std::io::Error::new(ErrorKind::InvalidData, other.to_string()),
    }
}

/// Hostname without its domain suffix: `c45.localdomain` becomes `c45`.
pub(crate) fn short_name(host: &str) -> &str {
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    host.split('.').next().unwrap_or(host)
}

/// Whether a connection from `peer_ip` can come from `host`.
fn host_matches(peer_ip: IpAddr, host: &str, local_host: &str) -> bool {
    let short = short_name(host);
    if peer_ip.is_loopback()
        && (short.eq_ignore_ascii_case("localhost") || short.eq_ignore_ascii_case(short_name(local_host)))
    {
        return true;
    }
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).any(|ip| same_ip(ip, peer_ip)),
        Err(e) => {
            debug!("Could not resolve {}: {}", host, e);
            false
        }
    }
}

fn same_ip(a: IpAddr, b: IpAddr) -> bool {
    let canonical = |ip: IpAddr| match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    canonical(a) == canonical(b)
}
