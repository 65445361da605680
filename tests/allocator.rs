use sandbox_debug_bridge::allocate;
use std::net::{Ipv4Addr, TcpListener, TcpStream};

/// Holds `len` consecutive loopback ports and checks the one after them is free.
///
/// Returns the first held port and the listeners keeping them busy.
fn occupy_run(len: u16) -> (u16, Vec<TcpListener>) {
    loop {
        let first = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let start = first.local_addr().unwrap().port();
        if start > 65000 {
            continue;
        }
        let mut held = vec![first];
        for offset in 1..len {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, start + offset)) {
                Ok(listener) => held.push(listener),
                Err(_) => break,
            }
        }
        if held.len() == usize::from(len)
            && TcpListener::bind((Ipv4Addr::LOCALHOST, start + len)).is_ok()
        {
            return (start, held);
        }
    }
}

#[test]
fn skips_occupied_ports() {
    let (start, _held) = occupy_run(3);
    let allocation = allocate(start, 0).unwrap();
    assert_eq!(allocation.identity(), 3);
    assert_eq!(allocation.port(), start + 3);
    assert_eq!(allocation.listener().local_addr().unwrap().port(), start + 3);
}

#[test]
fn scan_starts_at_min_identity() {
    let (start, _held) = occupy_run(2);
    let base = start - 3;
    let allocation = allocate(base, 3).unwrap();
    assert_eq!(allocation.identity(), 5);
    assert_eq!(allocation.port(), base + 5);
}

#[test]
fn first_candidate_is_taken_when_free() {
    let (start, held) = occupy_run(1);
    drop(held);
    let allocation = allocate(start, 0).unwrap();
    assert_eq!(allocation.identity(), 0);
    assert_eq!(allocation.port(), start);
}

#[test]
fn listener_accepts_connections() {
    let (start, _held) = occupy_run(1);
    let allocation = allocate(start, 0).unwrap();
    let port = allocation.port();
    let (identity, listener) = allocation.into_parts();
    assert_eq!(identity, 1);

    let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    let (_server_side, peer) = listener.accept().unwrap();
    assert!(peer.ip().is_loopback());
}

#[test]
fn live_allocations_never_share_an_identity() {
    let (start, _held) = occupy_run(1);
    let first = allocate(start, 0).unwrap();
    let second = allocate(start, 0).unwrap();
    assert!(first.identity() >= 1);
    assert!(second.identity() > first.identity());
    assert_ne!(first.port(), second.port());
}
