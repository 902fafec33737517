use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::Duration,
};

use braid::{LinkKind, Mux};

fn mux_pair() -> (Mux, Mux) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let join = thread::spawn(move || listener.accept().unwrap().0);
    let a = TcpStream::connect(addr).unwrap();
    let b = join.join().unwrap();
    (Mux::new(a, LinkKind::Tcp, None), Mux::new(b, LinkKind::Tcp, None))
}

#[test]
fn hello_world_roundtrip() {
    let (m1, m2) = mux_pair();

    let peer = thread::spawn(move || {
        let s = m2.accept().unwrap();
        let mut buf = [0u8; 5];
        (&s).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        (&s).write_all(b"world").unwrap();

        // The opener closes once it has our reply; drain to EOF.
        let mut rest = [0u8; 16];
        assert_eq!((&s).read(&mut rest).unwrap(), 0);
        s.close();
        assert_eq!((&s).read(&mut rest).unwrap(), 0);
        m2
    });

    let s = m1.open().unwrap();
    (&s).write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    (&s).read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"world");
    s.close();

    let mut rest = [0u8; 16];
    assert_eq!((&s).read(&mut rest).unwrap(), 0, "closed stream must read EOF");

    let m2 = peer.join().unwrap();
    drop((m1, m2));
}

#[test]
fn streams_multiplex_independently() {
    let (m1, m2) = mux_pair();

    let peer = thread::spawn(move || {
        // Echo each accepted stream's bytes back at it.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = m2.accept().unwrap();
            handles.push(thread::spawn(move || {
                let mut buf = [0u8; 32];
                let n = (&s).read(&mut buf).unwrap();
                (&s).write_all(&buf[..n]).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        m2
    });

    let streams: Vec<_> = (0..4).map(|_| m1.open().unwrap()).collect();
    let mut ids = Vec::new();
    for (i, s) in streams.iter().enumerate() {
        ids.push(s.id());
        let msg = format!("stream-{i}");
        (&*s).write_all(msg.as_bytes()).unwrap();
    }
    // Ids are unique within the mux.
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);

    for (i, s) in streams.iter().enumerate() {
        let expect = format!("stream-{i}");
        let mut buf = vec![0u8; expect.len()];
        (&*s).read_exact(&mut buf).unwrap();
        assert_eq!(buf, expect.into_bytes(), "stream {i} echoed foreign bytes");
    }

    let m2 = peer.join().unwrap();
    drop((m1, m2));
}

#[test]
fn close_is_idempotent_and_write_fails_after() {
    let (m1, m2) = mux_pair();

    let peer = thread::spawn(move || {
        let s = m2.accept().unwrap();
        // Wait for the peer's close to land, then drain to EOF.
        let mut buf = [0u8; 8];
        assert_eq!((&s).read(&mut buf).unwrap(), 0);
        (m2, s)
    });

    let s = m1.open().unwrap();
    s.close();
    s.close();
    s.close();
    let err = (&s).write(b"x").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

    let (m2, peer_stream) = peer.join().unwrap();

    // The peer saw exactly one close; its write side is dead too.
    thread::sleep(Duration::from_millis(50));
    let err = (&peer_stream).write(b"x").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    drop((m1, m2));
}

#[test]
fn stream_reports_carrier_addresses() {
    let (m1, m2) = mux_pair();
    let peer = thread::spawn(move || {
        let s = m2.accept().unwrap();
        let _ = s.local_addr().unwrap();
        m2
    });
    let s = m1.open().unwrap();
    assert_eq!(s.local_addr().unwrap(), m1.addr().unwrap());
    assert!(s.remote_addr().unwrap().port() > 0);
    let m2 = peer.join().unwrap();
    drop((m1, m2));
}
