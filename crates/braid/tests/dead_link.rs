use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use braid::{LinkKind, Mux};

/// Connects two carriers through a relay that can go silent: once the flag
/// flips, bytes are read and discarded in both directions, so the sockets
/// stay up but nothing gets through. That is what a dead intermediate hop
/// looks like to the mux.
fn silencable_pair() -> (TcpStream, TcpStream, Arc<AtomicBool>) {
    let silenced = Arc::new(AtomicBool::new(false));

    let make_leg = || {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let join = thread::spawn(move || listener.accept().unwrap().0);
        let outer = TcpStream::connect(addr).unwrap();
        (outer, join.join().unwrap())
    };
    let (a_outer, a_inner) = make_leg();
    let (b_outer, b_inner) = make_leg();

    for (src, dst) in [
        (a_inner.try_clone().unwrap(), b_inner.try_clone().unwrap()),
        (b_inner, a_inner),
    ] {
        let silenced = silenced.clone();
        thread::spawn(move || {
            let mut src = src;
            let mut dst = dst;
            let mut buf = [0u8; 4096];
            loop {
                let Ok(n) = src.read(&mut buf) else { break };
                if n == 0 {
                    break;
                }
                if !silenced.load(Ordering::Relaxed) && dst.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        });
    }

    (a_outer, b_outer, silenced)
}

#[test]
fn missed_pings_close_the_mux() {
    let (a, b, silenced) = silencable_pair();
    // Tolerate a single missed probe so the test stays in seconds.
    let ma = Mux::new(a, LinkKind::Tcp, Some(1));
    let mb = Mux::new(b, LinkKind::Tcp, None);

    let opener = thread::spawn(move || {
        let s = ma.open().unwrap();
        (ma, s)
    });
    let peer = mb.accept().unwrap();
    let (ma, s) = opener.join().unwrap();

    // Probes flow, the link is considered healthy.
    thread::sleep(Duration::from_secs(1));
    assert!(!ma.is_closed());

    silenced.store(true, Ordering::Relaxed);

    // Threshold 1 and a 5s probe interval: the third unanswered tick trips
    // the check. Allow generous slack.
    let deadline = Instant::now() + Duration::from_secs(40);
    while !ma.is_closed() {
        assert!(Instant::now() < deadline, "mux never noticed the dead link");
        thread::sleep(Duration::from_millis(250));
    }

    // Every stream operation now reports the closed mux.
    let mut buf = [0u8; 16];
    let err = (&s).read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    let err = (&s).write(b"x").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    assert!(ma.open().is_err());

    drop((s, peer, ma, mb));
}
