//! Point-to-point round-trip latency between pairs of ranks.
//!
//! Even rank `r` pings rank `r + 1` with messages from 32 bytes doubling up to
//! `SOCKET_MPI_RTT_MAX_BYTES` (2 MiB by default). Each size gets one warm-up exchange and
//! `TRIALS` timed ones. The coordinator gathers the mean and standard deviation from every
//! pair and prints one row per message size.
//!
//! Run as `rtt <rank> <size> <rendezvous file>` with an even process count.

use std::process::ExitCode;
use std::time::Instant;

use log::error;
use socket_mpi::{World, COORDINATOR};

const TRIALS: usize = 10;
const MIN_MESSAGE_BYTES: usize = 32;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;
const TAG_RTT: i32 = 1;

fn message_sizes(max: usize) -> Vec<usize> {
    std::iter::successors(Some(MIN_MESSAGE_BYTES), |&s| s.checked_mul(2))
        .take_while(|&s| s <= max)
        .collect()
}

/// Population mean and standard deviation.
fn mean_and_stdev(samples: &[f64]) -> (f64, f64) {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Counts and displacements for gathering `per_pair` doubles from every even rank.
fn results_layout(size: usize, per_pair: usize) -> (Vec<usize>, Vec<usize>) {
    let counts = (0..size)
        .map(|r| if r % 2 == 0 { per_pair } else { 0 })
        .collect();
    let displs = (0..size).map(|r| (r / 2) * per_pair).collect();
    (counts, displs)
}

fn max_message_bytes() -> usize {
    std::env::var("SOCKET_MPI_RTT_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES)
}

fn run(world: &World) -> socket_mpi::Result<()> {
    let sizes = message_sizes(max_message_bytes());
    let largest = sizes.last().copied().unwrap_or(0);
    let outgoing = vec![b'x'; largest];
    let mut incoming = vec![0u8; largest];
    let mut results = vec![0.0f64; 2 * sizes.len()];

    for (i, &bytes) in sizes.iter().enumerate() {
        let mut times = [0.0f64; TRIALS];
        for trial in 0..=TRIALS {
            if world.rank() % 2 == 0 {
                let partner = world.rank() + 1;
                let start = Instant::now();
                world.ssend(&outgoing[..bytes], partner, TAG_RTT)?;
                world.recv(&mut incoming[..bytes], partner, TAG_RTT)?;
                // Trial 0 only warms up the channel.
                if trial > 0 {
                    times[trial - 1] = start.elapsed().as_secs_f64();
                }
            } else {
                let partner = world.rank() - 1;
                world.recv(&mut incoming[..bytes], partner, TAG_RTT)?;
                world.send(&incoming[..bytes], partner, TAG_RTT)?;
            }
        }
        if world.rank() % 2 == 0 {
            let (mean, stdev) = mean_and_stdev(&times);
            results[2 * i] = mean;
            results[2 * i + 1] = stdev;
        }
    }

    let (counts, displs) = results_layout(world.size(), results.len());
    let contribution: &[f64] = if world.rank() % 2 == 0 { &results } else { &[] };
    let mut gathered = vec![0.0f64; counts.iter().sum()];
    let recv = (world.rank() == COORDINATOR).then_some(&mut gathered[..]);
    world.gatherv(contribution, recv, &counts, &displs, COORDINATOR)?;

    if world.rank() == COORDINATOR {
        let pairs = world.size() / 2;
        let mut header = String::from("Msg Size (Bytes)");
        for pair in 0..pairs {
            header.push_str(&format!("\tPair {} RTT Mean Time (s)\tPair {} RTT StDev (s)", pair, pair));
        }
        println!("{}", header);
        for (i, bytes) in sizes.iter().enumerate() {
            let mut row = bytes.to_string();
            for pair in 0..pairs {
                let at = displs[pair * 2] + 2 * i;
                row.push_str(&format!("\t{:.6}\t{:.6}", gathered[at], gathered[at + 1]));
            }
            println!("{}", row);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let world = match World::init_from_args(std::env::args()) {
        Ok(world) => world,
        Err(e) => {
            println!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if world.size() % 2 != 0 {
        if world.rank() == COORDINATOR {
            println!("Cannot run with {} tasks - must have an even number!", world.size());
        }
        if let Err(e) = world.finalize() {
            error!("{}", e);
        }
        return ExitCode::FAILURE;
    }

    // A failed exchange leaves the peers mid-protocol, so skip the finalize barrier and
    // let the dropped sockets tell them.
    if let Err(e) = run(&world) {
        error!("{}", e);
        return ExitCode::FAILURE;
    }
    match world.finalize() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
