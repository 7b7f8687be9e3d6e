mod common;

use common::run_world;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn byte_payloads_arrive_whole_and_in_order() {
    // One byte, about one socket buffer, and many socket buffers.
    for len in [1, 64 * 1024, 4 * 1024 * 1024] {
        let echoed = run_world(2, "roundtrip", move |world| {
            let mut buf = vec![0u8; len];
            if world.rank() == 0 {
                world.send(&pattern(len), 1, 7).unwrap();
                world.recv(&mut buf, 1, 7).unwrap();
            } else {
                world.recv(&mut buf, 0, 7).unwrap();
                world.ssend(&buf, 0, 7).unwrap();
            }
            buf
        });
        assert_eq!(echoed[0], pattern(len));
        assert_eq!(echoed[1], pattern(len));
    }
}

#[test]
fn doubles_keep_their_bits() {
    let values = [0.0, -1.25, f64::MAX, f64::MIN_POSITIVE, std::f64::consts::PI];
    let received = run_world(2, "doubles", move |world| {
        let mut buf = [0.0f64; 5];
        if world.rank() == 1 {
            world.send(&values, 0, 0).unwrap();
        } else {
            world.recv(&mut buf, 1, 0).unwrap();
        }
        buf
    });
    assert_eq!(received[0], values);
}

#[test]
fn back_to_back_messages_keep_call_order() {
    let got = run_world(2, "ordering", |world| {
        let mut seen = Vec::new();
        if world.rank() == 0 {
            for i in 0..50u8 {
                world.send(&[i, i.wrapping_mul(3)], 1, 0).unwrap();
            }
        } else {
            for _ in 0..50 {
                let mut pair = [0u8; 2];
                world.recv(&mut pair, 0, 0).unwrap();
                seen.push(pair);
            }
        }
        seen
    });
    let expected: Vec<[u8; 2]> = (0..50u8).map(|i| [i, i.wrapping_mul(3)]).collect();
    assert_eq!(got[1], expected);
}

#[test]
fn partners_exchange_over_their_own_channel() {
    // In the paired layout rank 3 reaches rank 2 directly.
    let got = run_world(4, "partners", |world| {
        let mut buf = [0.0f64; 1];
        match world.rank() {
            3 => world.send(&[33.0f64], 2, 0).unwrap(),
            2 => world.recv(&mut buf, 3, 0).unwrap(),
            _ => {}
        }
        buf[0]
    });
    assert_eq!(got[2], 33.0);
}
