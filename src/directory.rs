//! Peer discovery through a rendezvous file on a shared filesystem.
//!
//! Every process appends one `rank\thostname\tport` line, then polls the file until a
//! record exists for every rank. Each poll rereads the file from the start: appends from
//! different hosts can land in any order, so a partial earlier scan says nothing about
//! which lines precede the end of the file now.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use crate::{MPIError, Result};

/// Port value written by ranks that do not listen.
pub const NO_PORT: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub rank: usize,
    pub hostname: String,
    /// `None` for ranks that published the sentinel port.
    pub port: Option<u16>,
}

impl PeerRecord {
    fn to_line(&self) -> String {
        let port = self.port.map(i32::from).unwrap_or(NO_PORT);
        format!("{}\t{}\t{}\n", self.rank, self.hostname, port)
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let rank = fields.next()?.trim().parse().ok()?;
        let hostname = fields.next()?.trim();
        let port: i32 = fields.next()?.trim().parse().ok()?;
        if fields.next().is_some() || hostname.is_empty() {
            return None;
        }
        let port = match port {
            NO_PORT => None,
            p => Some(u16::try_from(p).ok()?),
        };
        Some(PeerRecord {
            rank,
            hostname: hostname.to_string(),
            port,
        })
    }
}

/// Records for every rank of a run, indexed by rank.
#[derive(Debug, Clone)]
pub struct PeerTable {
    records: Vec<PeerRecord>,
}

impl PeerTable {
    pub fn get(&self, rank: usize) -> Option<&PeerRecord> {
        self.records.get(rank)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.iter()
    }
}

/// Handle on the rendezvous file as seen from one rank.
#[derive(Debug, Clone)]
pub struct Directory {
    path: PathBuf,
    rank: usize,
}

impl Directory {
    pub fn new(path: impl Into<PathBuf>, rank: usize) -> Self {
        Self {
            path: path.into(),
            rank,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append this rank's record. The line goes out in a single append so concurrent
    /// writers never interleave within a line.
    pub fn announce(&self, hostname: &str, port: Option<u16>) -> Result<()> {
        let record = PeerRecord {
            rank: self.rank,
            hostname: hostname.to_string(),
            port,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.file_error(e))?;
        file.write_all(record.to_line().as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| self.file_error(e))?;
        debug!(
            "Rank {} announced {}:{:?} in {}",
            self.rank,
            hostname,
            port,
            self.path.display()
        );
        Ok(())
    }

    /// Poll until every rank in `0..expected` has a record, rescanning the whole file
    /// each attempt and sleeping `interval` between attempts.
    pub fn resolve_all(&self, expected: usize, attempts: u32, interval: Duration) -> Result<PeerTable> {
        let mut found = 0;
        for attempt in 1..=attempts {
            let content = match std::fs::read_to_string(&self.path) {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
                Err(e) => return Err(self.file_error(e)),
            };
            let slots = parse_records(&content, expected, self.rank)?;
            found = slots.iter().filter(|r| r.is_some()).count();
            if found == expected {
                debug!("Rank {} resolved {} peers on attempt {}", self.rank, expected, attempt);
                let records = slots.into_iter().flatten().collect();
                return Ok(PeerTable { records });
            }
            debug!(
                "Rank {} sees {}/{} records (attempt {}/{})",
                self.rank, found, expected, attempt, attempts
            );
            if attempt < attempts {
                std::thread::sleep(interval);
            }
        }
        Err(MPIError::PeerDiscoveryTimeout {
            rank: self.rank,
            found,
            expected,
            attempts,
        })
    }

    /// Delete the rendezvous file. A file that is already gone is not an error.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(self.file_error(e)),
            _ => Ok(()),
        }
    }

    fn file_error(&self, source: std::io::Error) -> MPIError {
        MPIError::RendezvousError {
            rank: self.rank,
            path: self.path.display().to_string(),
            source,
        }
    }
}

/// Parse every complete line into a slot per rank. A later line for the same rank
/// replaces an earlier one.
fn parse_records(content: &str, expected: usize, rank: usize) -> Result<Vec<Option<PeerRecord>>> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(expected)
        .map_err(|_| MPIError::AllocationError {
            rank,
            what: "peer table",
        })?;
    slots.resize_with(expected, || None);
    // Anything after the last newline may still be mid-append.
    let complete = match content.rfind('\n') {
        Some(end) => &content[..end],
        None => "",
    };
    for line in complete.lines().filter(|l| !l.trim().is_empty()) {
        match PeerRecord::parse_line(line) {
            Some(record) if record.rank < expected => {
                let rank = record.rank;
                slots[rank] = Some(record);
            }
            Some(record) => warn!("Ignoring rendezvous record for out-of-range rank {}", record.rank),
            None => warn!("Ignoring malformed rendezvous line {:?}", line),
        }
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_out_of_order_records_and_sentinel_ports() {
        let slots = parse_records("1\tnode-b\t-1\n0\tnode-a.cluster\t40001\n", 2, 0).unwrap();
        assert_eq!(slots[0].as_ref().unwrap().hostname, "node-a.cluster");
        assert_eq!(slots[0].as_ref().unwrap().port, Some(40001));
        assert_eq!(slots[1].as_ref().unwrap().port, None);
    }

    #[test]
    fn skips_partial_malformed_and_out_of_range_lines() {
        let content = "0\ta\t1000\nnot a record\n7\tz\t1\n1\tb\t20";
        let slots = parse_records(content, 2, 0).unwrap();
        assert!(slots[0].is_some());
        assert!(slots[1].is_none());
    }

    #[test]
    fn later_record_for_a_rank_wins() {
        let slots = parse_records("0\told\t1\n0\tnew\t2\n", 1, 0).unwrap();
        assert_eq!(slots[0].as_ref().unwrap().hostname, "new");
    }

    #[test]
    fn record_line_round_trips() {
        let record = PeerRecord {
            rank: 3,
            hostname: "c45".into(),
            port: None,
        };
        assert_eq!(record.to_line(), "3\tc45\t-1\n");
        assert_eq!(PeerRecord::parse_line(record.to_line().trim_end()), Some(record));
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("socket-mpi-dir-{}-{}", std::process::id(), name))
    }

    #[test]
    fn rescans_from_start_and_sees_lines_appended_later() {
        let path = scratch("rescan");
        let _ = std::fs::remove_file(&path);
        let zero = Directory::new(&path, 0);
        zero.announce("localhost", Some(5000)).unwrap();

        let late = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            Directory::new(&late, 1).announce("localhost", None).unwrap();
        });
        let table = zero.resolve_all(2, 50, Duration::from_millis(10)).unwrap();
        writer.join().unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).unwrap().port, None);
        zero.remove().unwrap();
        assert!(!path.exists());
        zero.remove().unwrap();
    }

    #[test]
    fn completes_a_line_that_was_mid_append_on_an_earlier_scan() {
        let path = scratch("partial");
        std::fs::write(&path, "0\tlocalhost\t5000\n1\tlocalhost").unwrap();
        let zero = Directory::new(&path, 0);

        let late = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let mut file = OpenOptions::new().append(true).open(&late).unwrap();
            file.write_all(b"\t-1\n").unwrap();
        });
        let table = zero.resolve_all(2, 50, Duration::from_millis(10)).unwrap();
        writer.join().unwrap();

        assert_eq!(table.get(1).unwrap().hostname, "localhost");
        assert_eq!(table.get(1).unwrap().port, None);
        zero.remove().unwrap();
    }

    #[test]
    fn sees_a_record_written_ahead_of_lines_already_scanned() {
        let path = scratch("rewrite");
        std::fs::write(&path, "0\tlocalhost\t5000\n2\tlocalhost\t-1\n").unwrap();
        let zero = Directory::new(&path, 0);

        let late = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            std::fs::write(
                &late,
                "1\tnode-b\t-1\n0\tlocalhost\t5000\n2\tlocalhost\t-1\n",
            )
            .unwrap();
        });
        let table = zero.resolve_all(3, 50, Duration::from_millis(10)).unwrap();
        writer.join().unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.get(1).unwrap().hostname, "node-b");
        zero.remove().unwrap();
    }

    #[test]
    fn times_out_when_a_rank_never_announces() {
        let path = scratch("timeout");
        let _ = std::fs::remove_file(&path);
        let zero = Directory::new(&path, 0);
        zero.announce("localhost", Some(5000)).unwrap();

        let err = zero.resolve_all(3, 3, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(
            err,
            MPIError::PeerDiscoveryTimeout { found: 1, expected: 3, attempts: 3, .. }
        ));
        zero.remove().unwrap();
    }
}
