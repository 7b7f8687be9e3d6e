//! Error type shared by every operation of the runtime.

use std::fmt;
use thiserror::Error;

use crate::config::USAGE;

#[derive(Error, Debug)]
pub enum MPIError {
    #[error("{reason}\n{} arguments provided to init:\n{}\n{}", .args.len(), ArgList(.args), USAGE)]
    ArgumentError { args: Vec<String>, reason: String },
    #[error("Rank {rank} could not allocate {what}")]
    AllocationError { rank: usize, what: &'static str },
    #[error("Rank {rank} could not read full rendezvous file: found {found} of {expected} records after {attempts} attempts")]
    PeerDiscoveryTimeout {
        rank: usize,
        found: usize,
        expected: usize,
        attempts: u32,
    },
    #[error("Rank {rank} could not match a new connection from {host}: {reason}")]
    UnknownPeerConnection {
        rank: usize,
        host: String,
        reason: String,
    },
    #[error("Rank {rank} could not write to rank {peer}: {source}")]
    TransportWriteError {
        rank: usize,
        peer: usize,
        source: std::io::Error,
    },
    #[error("Rank {rank} could not read from rank {peer}: {source}")]
    TransportReadError {
        rank: usize,
        peer: usize,
        source: std::io::Error,
    },
    #[error("Rank {rank} received unexpected bytes {received:?} from rank {peer} during barrier")]
    ProtocolDesyncError {
        rank: usize,
        peer: usize,
        received: Vec<u8>,
    },
    #[error("Invalid rank: {0}")]
    InvalidRank(usize),
    #[error("Rank {rank} has no channel to rank {peer}")]
    NoChannel { rank: usize, peer: usize },
    #[error("Invalid gather layout: {0}")]
    InvalidGatherLayout(String),
    #[error("Rank {rank} rendezvous file error on {path}: {source}")]
    RendezvousError {
        rank: usize,
        path: String,
        source: std::io::Error,
    },
    #[error("Rank {rank} socket error during {op}: {source}")]
    SocketError {
        rank: usize,
        op: &'static str,
        source: std::io::Error,
    },
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
}

pub type Result<T> = std::result::Result<T, MPIError>;

impl MPIError {
    pub(crate) fn argument(args: &[String], reason: impl Into<String>) -> Self {
        MPIError::ArgumentError {
            args: args.to_vec(),
            reason: reason.into(),
        }
    }
}

/// One argument per line, as the launcher received them.
struct ArgList<'a>(&'a [String]);

impl fmt::Display for ArgList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arg in self.0 {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{}", arg)?;
        }
        Ok(())
    }
}
