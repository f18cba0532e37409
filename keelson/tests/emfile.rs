//! Descriptor exhaustion: with the fd limit reached, an incoming connection
//! is drained through the reserved descriptor instead of spinning the
//! accept loop, and accepting resumes once descriptors free up.
//!
//! Lives in its own binary because it lowers RLIMIT_NOFILE process-wide.

use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keelson::{EventLoopThread, InetAddr, Socket, TcpServer};

fn set_nofile_limit(soft: u64) -> libc::rlimit {
    let mut old = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe {
        assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut old), 0);
        let new = libc::rlimit {
            rlim_cur: soft,
            rlim_max: old.rlim_max,
        };
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &new), 0);
    }
    old
}

fn restore_nofile_limit(old: libc::rlimit) {
    unsafe {
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &old), 0);
    }
}

#[test]
fn accept_survives_emfile() {
    keelson::dev_tracing::init_tracing();

    let mut accept_thread = EventLoopThread::new("emfile", None);
    let lp = accept_thread.start_loop();

    let server = TcpServer::new(&lp, &InetAddr::loopback(0, false), "emfile", false).unwrap();
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_bytes();
        conn.send_bytes(msg);
    }));
    let addr = server.listen_addr().unwrap();
    {
        let server = server.clone();
        lp.run_in_loop(move || server.start());
    }
    thread::sleep(Duration::from_millis(50));

    // Sanity: echo works before exhaustion.
    {
        let mut s = TcpStream::connect(addr.socket_addr()).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        s.write_all(b"ok?").unwrap();
        let mut reply = [0u8; 3];
        s.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ok?");
    }
    thread::sleep(Duration::from_millis(100));

    // The victim's socket must exist before descriptors run out; connect(2)
    // itself needs no new fd.
    let victim = Socket::new_nonblocking(false).unwrap();

    let old_limit = set_nofile_limit(64);
    let mut hoard = Vec::new();
    loop {
        match File::open("/dev/null") {
            Ok(f) => hoard.push(f),
            Err(_) => break,
        }
    }

    match victim.connect(&addr) {
        Ok(()) => {}
        Err(e) => assert_eq!(e.raw_os_error(), Some(libc::EINPROGRESS)),
    }

    // The accept path hits EMFILE, drains through the reserve, and goes back
    // to sleep. A spinning loop would rack up iterations by the million.
    thread::sleep(Duration::from_millis(100));
    let before = lp.iteration();
    thread::sleep(Duration::from_millis(300));
    let delta = lp.iteration() - before;
    assert!(delta < 200, "accept loop is spinning: {delta} iterations");

    drop(victim);
    drop(hoard);
    restore_nofile_limit(old_limit);

    // Descriptors are back; the next connect is admitted and served.
    let mut s = TcpStream::connect(addr.socket_addr()).unwrap();
    s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    s.write_all(b"again").unwrap();
    let mut reply = [0u8; 5];
    s.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"again");
}
