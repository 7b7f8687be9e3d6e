//! Which rank pairs get a channel, and in which direction the connection is opened.

use crate::{MPIError, Result};

/// The coordinator of every topology built here.
pub const COORDINATOR: usize = 0;

/// Channel layout for one run, computed once at init.
///
/// For each rank, `outbound` lists the ranks it connects to and `inbound` the ranks it
/// accepts from. A rank listens, and publishes a real port, only if its inbound set is
/// non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    outbound: Vec<Vec<usize>>,
    inbound: Vec<Vec<usize>>,
}

impl Topology {
    /// Every rank talks to the coordinator, and every odd rank above 1 also talks to
    /// the even rank just below it.
    pub fn paired(size: usize) -> Result<Self> {
        let links = (1..size).flat_map(|r| {
            let partner = (r % 2 == 1 && r != 1).then(|| (r, r - 1));
            std::iter::once((r, COORDINATOR)).chain(partner)
        });
        Self::build(size, links)
    }

    /// Only coordinator links.
    pub fn star(size: usize) -> Result<Self> {
        Self::build(size, (1..size).map(|r| (r, COORDINATOR)))
    }

    /// Arbitrary `(client, server)` links. Every non-coordinator rank must be linked to
    /// the coordinator since barrier and gather run through it.
    pub fn from_links(size: usize, links: &[(usize, usize)]) -> Result<Self> {
        if size == 0 {
            return Err(MPIError::InvalidTopology("size must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for &(client, server) in links {
            if client >= size || server >= size {
                return Err(MPIError::InvalidTopology(format!(
                    "link {}->{} is outside a run of {}",
                    client, server, size
                )));
            }
            if client == server {
                return Err(MPIError::InvalidTopology(format!("rank {} linked to itself", client)));
            }
            if !seen.insert((client.min(server), client.max(server))) {
                return Err(MPIError::InvalidTopology(format!(
                    "ranks {} and {} linked twice",
                    client, server
                )));
            }
        }
        let topology = Self::build(size, links.iter().copied())?;
        if let Some(r) = (1..size).find(|&r| !topology.linked(r, COORDINATOR)) {
            return Err(MPIError::InvalidTopology(format!(
                "rank {} has no channel to the coordinator",
                r
            )));
        }
        Ok(topology)
    }

    fn build(size: usize, links: impl Iterator<Item = (usize, usize)>) -> Result<Self> {
        let mut outbound = peer_lists(size)?;
        let mut inbound = peer_lists(size)?;
        for (client, server) in links {
            outbound[client].push(server);
            inbound[server].push(client);
        }
        Ok(Topology { outbound, inbound })
    }

    pub fn size(&self) -> usize {
        self.outbound.len()
    }

    pub fn outbound(&self, rank: usize) -> &[usize] {
        &self.outbound[rank]
    }

    pub fn inbound(&self, rank: usize) -> &[usize] {
        &self.inbound[rank]
    }

    pub fn listens(&self, rank: usize) -> bool {
        !self.inbound[rank].is_empty()
    }

    pub fn linked(&self, a: usize, b: usize) -> bool {
        self.outbound[a].contains(&b) || self.inbound[a].contains(&b)
    }
}

fn peer_lists(size: usize) -> Result<Vec<Vec<usize>>> {
    let mut lists = Vec::new();
    lists
        .try_reserve_exact(size)
        .map_err(|_| MPIError::AllocationError {
            rank: COORDINATOR,
            what: "topology",
        })?;
    lists.resize_with(size, Vec::new);
    Ok(lists)
}
