//! Discard server: swallows everything and reports throughput once a second.
//!
//! Usage: `discard_server [port]` (default: 7001)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keelson::{dev_tracing, EventLoop, InetAddr, TcpServer};

fn main() -> keelson::Result<()> {
    dev_tracing::init_tracing();

    let port: u16 = std::env::args()
        .nth(1)
        .map_or(7001, |a| a.parse().expect("bad port"));

    let received = Arc::new(AtomicU64::new(0));

    let lp = EventLoop::new();
    let server = TcpServer::new(&lp, &InetAddr::any(port, false), "discard", false)?;
    {
        let received = received.clone();
        server.set_message_callback(Arc::new(move |_conn, buf, _when| {
            received.fetch_add(buf.readable_bytes() as u64, Ordering::Relaxed);
            buf.retrieve_all();
        }));
    }

    lp.run_every(Duration::from_secs(1), move || {
        let n = received.swap(0, Ordering::Relaxed);
        if n > 0 {
            println!("discard: {:.3} MiB/s", n as f64 / (1024.0 * 1024.0));
        }
    });

    println!("discard server listening on {}", server.ip_port());
    server.start();
    lp.run();
    Ok(())
}
