use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use braid::{LinkKind, MAX_SEGMENT_SIZE, Mux};

/// Both windows start at thirty segments and, with no reader draining the
/// peer side, never grow past it.
const INITIAL_CREDIT: usize = 30 * MAX_SEGMENT_SIZE;

fn mux_pair() -> (Mux, Mux) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let join = thread::spawn(move || listener.accept().unwrap().0);
    let a = TcpStream::connect(addr).unwrap();
    let b = join.join().unwrap();
    (Mux::new(a, LinkKind::Tcp, None), Mux::new(b, LinkKind::Tcp, None))
}

#[test]
fn writer_blocks_at_window_and_times_out() {
    let (m1, m2) = mux_pair();

    let opener = thread::spawn(move || (m1.open().unwrap(), m1));
    let peer_stream = m2.accept().unwrap();
    let (s, m1) = opener.join().unwrap();

    s.set_write_deadline(Some(Instant::now() + Duration::from_millis(200)));

    // Segment-sized writes spend exactly one credit unit each.
    let chunk = vec![0xabu8; MAX_SEGMENT_SIZE];
    let mut written = 0usize;
    let started = Instant::now();
    let err = loop {
        match (&s).write(&chunk) {
            Ok(n) => written += n,
            Err(e) => break e,
        }
    };

    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    // The sender consumes at least the initial advertisement; with nobody
    // draining, the window can only grow by the low-fill gain before the
    // size estimate pins it, so the credit tops out at 1.5625x.
    assert!(written >= INITIAL_CREDIT, "stopped early: {written}");
    let cap = (INITIAL_CREDIT as f64 * 1.5625) as usize;
    assert!(written <= cap, "wrote past the advertised window: {written} > {cap}");
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(150), "returned before the deadline: {waited:?}");
    assert!(waited < Duration::from_secs(5), "deadline had no effect: {waited:?}");

    drop((peer_stream, m1, m2));
}

#[test]
fn read_deadline_fires_on_idle_stream() {
    let (m1, m2) = mux_pair();

    let opener = thread::spawn(move || (m1.open().unwrap(), m1));
    let s = m2.accept().unwrap();
    let (quiet, m1) = opener.join().unwrap();

    s.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 64];
    let err = (&s)
        .read(&mut buf)
        .map(|n| panic!("read returned {n} bytes from an idle stream"))
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    drop((quiet, m1, m2));
}

#[test]
fn blocked_writer_resumes_when_peer_reads() {
    let (m1, m2) = mux_pair();

    let opener = thread::spawn(move || (m1.open().unwrap(), m1));
    let peer = m2.accept().unwrap();
    let (s, m1) = opener.join().unwrap();

    const TOTAL: usize = INITIAL_CREDIT + 64 * 1024;
    let writer = thread::spawn(move || {
        let payload = vec![0x5au8; TOTAL];
        (&s).write_all(&payload).unwrap();
        s.close();
        s
    });

    // Give the writer time to hit the window before draining.
    thread::sleep(Duration::from_millis(200));
    let mut buf = [0u8; 8192];
    let mut total = 0usize;
    loop {
        let n = (&peer).read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        assert!(buf[..n].iter().all(|&b| b == 0x5a));
        total += n;
    }
    assert_eq!(total, TOTAL);

    let s = writer.join().unwrap();
    drop((s, m1, m2));
}
