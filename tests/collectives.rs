mod common;

use std::time::{Duration, Instant};

use common::{init_logging, rendezvous_path, run_world, run_world_with, spawn_ranks, test_config};
use socket_mpi::{BarrierPolicy, Config, MPIError};

#[test]
fn no_rank_leaves_barrier_before_every_rank_entered() {
    let stamps = run_world(4, "barrier", |world| {
        std::thread::sleep(Duration::from_millis(40 * world.rank() as u64));
        let called = Instant::now();
        world.barrier().unwrap();
        (called, Instant::now())
    });
    let last_call = stamps.iter().map(|s| s.0).max().unwrap();
    let first_return = stamps.iter().map(|s| s.1).min().unwrap();
    assert!(last_call <= first_return);
}

#[test]
fn gather_of_one_double_per_rank() {
    let gathered = run_world(4, "gather-doubles", |world| {
        let mine = [1.5 * (world.rank() + 1) as f64];
        let counts = [1, 1, 1, 1];
        let displs = [0, 1, 2, 3];
        let mut all = [0.0f64; 4];
        let recv = (world.rank() == 0).then_some(&mut all[..]);
        world.gatherv(&mine, recv, &counts, &displs, 0).unwrap();
        all
    });

    let bytes: Vec<u8> = gathered[0].iter().flat_map(|v| v.to_ne_bytes()).collect();
    let expected: Vec<u8> = [1.5f64, 3.0, 4.5, 6.0]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    assert_eq!(bytes.len(), 32);
    assert_eq!(bytes, expected);
    // Only the root's buffer is written.
    assert_eq!(gathered[1], [0.0; 4]);
}

#[test]
fn gather_with_uneven_counts_and_a_silent_rank() {
    let gathered = run_world(4, "gather-bytes", |world| {
        let counts = [3, 0, 5, 2];
        let displs = [0, 3, 3, 8];
        let mine = vec![world.rank() as u8 + 10; counts[world.rank()]];
        let mut all = vec![0u8; 10];
        let recv = (world.rank() == 0).then_some(&mut all[..]);
        world.gatherv(&mine, recv, &counts, &displs, 0).unwrap();
        all
    });
    assert_eq!(gathered[0], vec![10, 10, 10, 12, 12, 12, 12, 12, 13, 13]);
}

#[test]
fn gather_rejects_bad_layouts_on_the_root() {
    let outcomes = run_world(2, "gather-layout", |world| {
        if world.rank() != 0 {
            // Contributes nothing, so nothing is left in the channel.
            world.gatherv::<u8>(&[], None, &[], &[], 0).unwrap();
            return Vec::new();
        }
        let mut buf = [0u8; 4];
        vec![
            world.gatherv(&[1u8, 2], None, &[2, 2], &[0, 2], 0),
            world.gatherv(&[1u8, 2], Some(&mut buf[..]), &[2], &[0], 0),
            world.gatherv(&[1u8, 2], Some(&mut buf[..]), &[3, 0], &[0, 0], 0),
            world.gatherv(&[1u8, 2], Some(&mut buf[..]), &[2, 2], &[0, 3], 0),
            world.gatherv(&[1u8, 2], Some(&mut buf[..]), &[2, 2], &[0, 1], 0),
            world.gatherv(&[1u8, 2], Some(&mut buf[..]), &[2, 0], &[0, 0], 9),
        ]
    });
    let root = &outcomes[0];
    assert_eq!(root.len(), 6);
    for outcome in &root[..5] {
        assert!(matches!(outcome, Err(MPIError::InvalidGatherLayout(_))));
    }
    assert!(matches!(root[5], Err(MPIError::InvalidRank(9))));
}

#[test]
fn strict_barrier_reports_stray_bytes() {
    init_logging();
    let path = rendezvous_path("desync-strict");
    let handles = spawn_ranks(2, &path, test_config(), |rank, world| {
        let world = world.unwrap();
        if rank == 1 {
            world.send(b"XY", 0, 0).unwrap();
        }
        // Dropping the world on error closes its channels, which fails the peer.
        world.barrier()
    });
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    match &outcomes[0] {
        Err(MPIError::ProtocolDesyncError { rank: 0, peer: 1, received }) => {
            assert_eq!(received, b"XY")
        }
        other => panic!("unexpected coordinator outcome: {:?}", other),
    }
    assert!(matches!(outcomes[1], Err(MPIError::TransportReadError { rank: 1, peer: 0, .. })));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn tolerant_barrier_discards_stray_bytes() {
    let config = Config {
        barrier_policy: BarrierPolicy::Tolerant,
        ..test_config()
    };
    let outcomes = run_world_with(3, "desync-tolerant", config, |world| {
        if world.rank() == 2 {
            world.send(b"junk", 0, 0).unwrap();
        }
        world.barrier().is_ok()
    });
    assert_eq!(outcomes, vec![true, true, true]);
}
