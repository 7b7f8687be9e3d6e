//! A minimal MPI (Message Passing Interface) runtime over plain TCP sockets.
//!
//! This library provides MPI-like functionality for a fixed set of cooperating processes, possibly on
//! different hosts, without relying on an existing message-passing library. Processes find each other
//! through a rendezvous file on a shared filesystem and then talk over direct socket connections.
//!
//! # Features
//!
//! - **Peer Discovery**: Each process appends its address to a shared file and polls until all are present
//! - **Point-to-Point Communication**: Blocking send and receive of byte or double buffers
//! - **Collective Operations**: Gather with per-rank counts and displacements into the coordinator
//! - **Synchronization**: Barrier operations for process synchronization
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use socket_mpi::World;
//!
//! // Launched as `program <rank> <size> <rendezvous file>`
//! let world = World::init_from_args(std::env::args()).unwrap();
//!
//! println!("Process {} of {}", world.rank(), world.size());
//!
//! // Every rank contributes one double to the coordinator
//! let mine = [world.rank() as f64];
//! let counts = vec![1; world.size()];
//! let displs: Vec<usize> = (0..world.size()).collect();
//! let mut all = vec![0.0; world.size()];
//! let recv = (world.rank() == 0).then_some(&mut all[..]);
//! world.gatherv(&mine, recv, &counts, &displs, 0).unwrap();
//!
//! world.finalize().unwrap();
//! ```
//!
//! # Architecture
//!
//! Ranks that must accept connections bind an ephemeral port first, then every rank appends a
//! `rank\thostname\tport` line to the rendezvous file and waits until it holds one line per rank.
//! Channels are then opened along a [`Topology`]: by default every rank talks to the coordinator
//! (rank 0), and every odd rank above 1 also talks to the even rank just below it. Messages carry no
//! header; the receiver asks for exactly as many elements as the sender wrote, and ordering on a
//! channel follows call order.
//!
//! # Error Handling
//!
//! All operations return a `Result` type with detailed error variants through [`MPIError`].
//! Transport failures are not retried; a broken channel stays broken.

mod config;
mod datatype;
mod directory;
mod error;
mod topology;
mod transport;

use std::path::PathBuf;

use log::{debug, info, warn};

pub use config::{BarrierPolicy, Config, LaunchArgs, USAGE};
pub use datatype::{byte_len, Datatype, Element};
pub use directory::{Directory, PeerRecord, PeerTable, NO_PORT};
pub use error::{MPIError, Result};
pub use topology::{Topology, COORDINATOR};
pub use transport::Transport;

/// Bytes exchanged with the coordinator in both barrier phases.
const BARRIER_SENTINEL: &[u8] = b"Z\0";

/// One process's view of the run: its identity, its channels and the rendezvous file.
///
/// `World` is created by [`World::init`] and consumed by [`World::finalize`]. All calls block
/// until their network operation completes. Calls on two ranks must be issued in matching order;
/// a mismatch stalls both ranks rather than producing an error.
///
/// # Examples
///
/// Basic point-to-point communication:
/// ```rust,no_run
/// use socket_mpi::{Config, LaunchArgs, World};
///
/// let args = LaunchArgs::parse(std::env::args()).unwrap();
/// let world = World::init(&args, Config::default()).unwrap();
///
/// if world.rank() == 0 {
///     world.send(&[1.0f64, 2.0, 3.0], 1, 0).unwrap();
/// } else if world.rank() == 1 {
///     let mut data = [0.0f64; 3];
///     world.recv(&mut data, 0, 0).unwrap();
///     println!("Received: {:?}", data);
/// }
///
/// world.finalize().unwrap();
/// ```
pub struct World {
    rank: usize,
    size: usize,
    topology: Topology,
    transport: Transport,
    directory: Directory,
    peers: PeerTable,
    config: Config,
}

impl World {
    /// Initialize from the process command line and `SOCKET_MPI_*` environment variables.
    ///
    /// The arguments must be `[program, rank, size, rendezvous file]`; anything else fails with
    /// [`MPIError::ArgumentError`] before any socket is opened.
    pub fn init_from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = LaunchArgs::parse(args)?;
        let config = Config::from_env()?;
        Self::init(&args, config)
    }

    /// Initialize the MPI environment with the default paired topology.
    ///
    /// This function listens (if this rank accepts connections), announces itself in the rendezvous
    /// file, waits for every other rank to do the same, opens its channels and finally runs one
    /// barrier. It returns only once every rank's channels are live.
    ///
    /// # Arguments
    ///
    /// * `args` - This process's rank, the process count and the rendezvous file path
    /// * `config` - Discovery budget, grace delays and other knobs
    ///
    /// # Returns
    ///
    /// * `Ok(World)` - A new World instance if initialization succeeds
    /// * `Err(MPIError)` - If discovery times out, a connection fails or an unknown peer connects
    pub fn init(args: &LaunchArgs, config: Config) -> Result<Self> {
        let topology = Topology::paired(args.size).map_err(|e| match e {
            MPIError::AllocationError { what, .. } => MPIError::AllocationError {
                rank: args.rank,
                what,
            },
            e => e,
        })?;
        Self::init_with_topology(args, topology, config)
    }

    /// Initialize with an explicit channel layout.
    pub fn init_with_topology(args: &LaunchArgs, topology: Topology, config: Config) -> Result<Self> {
        let LaunchArgs {
            rank,
            size,
            ref rendezvous_path,
        } = *args;
        let as_args = || {
            vec![
                "init".to_string(),
                rank.to_string(),
                size.to_string(),
                rendezvous_path.clone(),
            ]
        };
        if size == 0 {
            return Err(MPIError::argument(&as_args(), "number of tasks must be positive"));
        }
        if rank >= size {
            return Err(MPIError::argument(&as_args(), "task rank must be below the number of tasks"));
        }
        if rendezvous_path.trim().is_empty() {
            return Err(MPIError::argument(&as_args(), "rendezvous file name must not be empty"));
        }
        if topology.size() != size {
            return Err(MPIError::InvalidTopology(format!(
                "topology covers {} ranks, run has {}",
                topology.size(),
                size
            )));
        }

        debug!("Rank {} initializing MPI with {} processes", rank, size);

        let mut transport = Transport::new(rank, size)?;
        let port = if topology.listens(rank) {
            Some(transport.listen()?)
        } else {
            None
        };

        let hostname = config.local_hostname();
        let directory = Directory::new(PathBuf::from(rendezvous_path), rank);
        directory.announce(&hostname, port)?;
        let peers = directory.resolve_all(
            size,
            config.discovery_budget(size),
            config.discovery_interval,
        )?;

        for &server in topology.outbound(rank) {
            transport.connect(server, &peers)?;
        }
        let expected = topology.inbound(rank);
        for _ in 0..expected.len() {
            transport.accept_one(expected, &peers, &hostname)?;
        }

        let world = World {
            rank,
            size,
            topology,
            transport,
            directory,
            peers,
            config,
        };
        world.barrier()?;

        info!("Rank {} of {} initialized on {}", rank, size, hostname);
        Ok(world)
    }

    /// Get the rank (unique identifier) of the current process.
    ///
    /// The rank is a number between 0 and `size()-1`. Rank 0 is the coordinator.
    #[doc(alias = "comm_rank")]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Get the total number of processes in the World.
    #[doc(alias = "comm_size")]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The channel layout this rank was initialized with.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Addresses every rank published during discovery.
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Send a buffer to a specific rank.
    ///
    /// Writes `buf.len()` elements of `T` and returns once the bytes have been handed to the
    /// socket. The receiver must ask for the same element type and count.
    ///
    /// # Arguments
    ///
    /// * `buf` - The elements to send
    /// * `dest` - The rank of the destination process
    /// * `tag` - Accepted for MPI call-shape compatibility; not transmitted
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the send succeeds
    /// * `Err(MPIError)` - If there is no channel to `dest` or the write fails
    pub fn send<T: Element>(&self, buf: &[T], dest: usize, tag: i32) -> Result<()> {
        debug!(
            "Rank {} sending {} x {:?} to rank {} with tag {}",
            self.rank,
            buf.len(),
            T::DATATYPE,
            dest,
            tag
        );
        self.transport.send_bytes(dest, datatype::as_bytes(buf))
    }

    /// Synchronous send. Identical to [`World::send`] in this runtime.
    pub fn ssend<T: Element>(&self, buf: &[T], dest: usize, tag: i32) -> Result<()> {
        self.send(buf, dest, tag)
    }

    /// Receive exactly `buf.len()` elements from a specific rank.
    ///
    /// Blocks until the buffer is full. A peer that closes its end first yields
    /// [`MPIError::TransportReadError`].
    ///
    /// # Arguments
    ///
    /// * `buf` - Destination for the received elements
    /// * `source` - The rank of the sending process
    /// * `tag` - Accepted for MPI call-shape compatibility; not matched
    pub fn recv<T: Element>(&self, buf: &mut [T], source: usize, tag: i32) -> Result<()> {
        debug!(
            "Rank {} receiving {} x {:?} from rank {} with tag {}",
            self.rank,
            buf.len(),
            T::DATATYPE,
            source,
            tag
        );
        self.transport.recv_bytes(source, datatype::as_bytes_mut(buf))
    }

    /// Barrier synchronization - blocks until all processes reach this point.
    ///
    /// Every rank sends a sentinel to the coordinator; once the coordinator has one from each rank
    /// it sends the sentinel back to all of them.
    pub fn barrier(&self) -> Result<()> {
        debug!("Rank {} entering barrier", self.rank);

        if self.rank == COORDINATOR {
            for rank in (0..self.size).filter(|&r| r != COORDINATOR) {
                debug!("Root waiting for rank {}", rank);
                self.wait_for_sentinel(rank)?;
            }
            for rank in (0..self.size).filter(|&r| r != COORDINATOR) {
                self.transport.send_bytes(rank, BARRIER_SENTINEL)?;
            }
        } else {
            self.transport.send_bytes(COORDINATOR, BARRIER_SENTINEL)?;
            self.wait_for_sentinel(COORDINATOR)?;
        }

        debug!("Rank {} exiting barrier", self.rank);
        Ok(())
    }

    fn wait_for_sentinel(&self, peer: usize) -> Result<()> {
        let mut received = [0u8; BARRIER_SENTINEL.len()];
        loop {
            self.transport.recv_bytes(peer, &mut received)?;
            if received == BARRIER_SENTINEL {
                return Ok(());
            }
            match self.config.barrier_policy {
                BarrierPolicy::Strict => {
                    return Err(MPIError::ProtocolDesyncError {
                        rank: self.rank,
                        peer,
                        received: received.to_vec(),
                    })
                }
                BarrierPolicy::Tolerant => {
                    warn!(
                        "Rank {} discarding {:?} from rank {} while waiting for barrier",
                        self.rank, received, peer
                    );
                }
            }
        }
    }

    /// Gather buffers of varying length from every rank into the root.
    ///
    /// The root copies its own contribution and then receives from each other rank whose count is
    /// non-zero, in rank order, placing rank `i`'s elements at `recv[displs[i]..displs[i] + recvcounts[i]]`.
    /// Every other rank sends its whole `send` buffer to the root, or nothing if it is empty.
    ///
    /// # Arguments
    ///
    /// * `send` - This rank's contribution
    /// * `recv` - Destination buffer; required on the root, ignored elsewhere
    /// * `recvcounts` - Elements expected from each rank (root only)
    /// * `displs` - Element offset of each rank's contribution in `recv` (root only)
    /// * `root` - The rank of the gathering process
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use socket_mpi::World;
    ///
    /// let world = World::init_from_args(std::env::args()).unwrap();
    ///
    /// // Rank i contributes i bytes
    /// let mine = vec![world.rank() as u8; world.rank()];
    /// let counts: Vec<usize> = (0..world.size()).collect();
    /// let displs: Vec<usize> = counts.iter().scan(0, |at, c| { let d = *at; *at += c; Some(d) }).collect();
    /// let mut all = vec![0u8; counts.iter().sum()];
    ///
    /// let recv = (world.rank() == 0).then_some(&mut all[..]);
    /// world.gatherv(&mine, recv, &counts, &displs, 0).unwrap();
    ///
    /// world.finalize().unwrap();
    /// ```
    pub fn gatherv<T: Element>(
        &self,
        send: &[T],
        recv: Option<&mut [T]>,
        recvcounts: &[usize],
        displs: &[usize],
        root: usize,
    ) -> Result<()> {
        if root >= self.size {
            return Err(MPIError::InvalidRank(root));
        }

        debug!("Rank {} entering gatherv", self.rank);

        if self.rank == root {
            let recv = recv.ok_or_else(|| {
                MPIError::InvalidGatherLayout("root must provide a receive buffer".into())
            })?;
            self.check_gather_layout(send.len(), recv.len(), recvcounts, displs, root)?;

            for rank in 0..self.size {
                let count = recvcounts[rank];
                if count == 0 {
                    continue;
                }
                let region = &mut recv[displs[rank]..displs[rank] + count];
                if rank == root {
                    region.copy_from_slice(send);
                } else {
                    debug!("Root receiving {} elements from rank {}", count, rank);
                    self.recv(region, rank, 0)?;
                }
            }
        } else if !send.is_empty() {
            debug!("Rank {} sending to root", self.rank);
            self.send(send, root, 0)?;
        }

        debug!("Rank {} completed gatherv", self.rank);
        Ok(())
    }

    fn check_gather_layout(
        &self,
        send_len: usize,
        recv_len: usize,
        recvcounts: &[usize],
        displs: &[usize],
        root: usize,
    ) -> Result<()> {
        if recvcounts.len() != self.size || displs.len() != self.size {
            return Err(MPIError::InvalidGatherLayout(format!(
                "need {} counts and displacements, got {} and {}",
                self.size,
                recvcounts.len(),
                displs.len()
            )));
        }
        if recvcounts[root] != 0 && recvcounts[root] != send_len {
            return Err(MPIError::InvalidGatherLayout(format!(
                "root expects {} of its own elements but sends {}",
                recvcounts[root], send_len
            )));
        }

        let mut regions = Vec::new();
        regions
            .try_reserve_exact(self.size)
            .map_err(|_| MPIError::AllocationError {
                rank: self.rank,
                what: "gather layout",
            })?;
        for (rank, (&count, &displ)) in recvcounts.iter().zip(displs).enumerate() {
            if count == 0 {
                continue;
            }
            let end = displ.checked_add(count).filter(|&end| end <= recv_len).ok_or_else(|| {
                MPIError::InvalidGatherLayout(format!(
                    "rank {} region {}..{} exceeds receive buffer of {}",
                    rank,
                    displ,
                    displ.saturating_add(count),
                    recv_len
                ))
            })?;
            regions.push((displ, end, rank));
        }
        regions.sort_unstable();
        for pair in regions.windows(2) {
            let ((_, end, a), (start, _, b)) = (pair[0], pair[1]);
            if start < end {
                return Err(MPIError::InvalidGatherLayout(format!(
                    "regions of ranks {} and {} overlap",
                    a, b
                )));
            }
        }
        Ok(())
    }

    /// Tear down the run.
    ///
    /// Runs one barrier, closes every channel and the listening socket, and on the coordinator
    /// removes the rendezvous file after a grace delay. Cleanup happens even if the barrier
    /// fails; the barrier's error is returned afterwards.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use socket_mpi::World;
    ///
    /// let world = World::init_from_args(std::env::args()).unwrap();
    /// // ... use the world for communication ...
    /// world.finalize().unwrap(); // Clean up resources
    /// ```
    pub fn finalize(mut self) -> Result<()> {
        debug!("Rank {} finalizing", self.rank);

        let barrier = self.barrier();
        if let Err(e) = &barrier {
            warn!("Rank {} continuing cleanup after failed barrier: {}", self.rank, e);
        }

        self.transport.close();

        if self.rank == COORDINATOR {
            std::thread::sleep(self.config.finalize_grace);
            if let Err(e) = self.directory.remove() {
                warn!("Rank {} could not remove rendezvous file: {}", self.rank, e);
            }
        }

        info!("Process {} finished", self.rank);
        barrier
    }
}
