//! Echo server: writes every received byte back to the peer.
//!
//! Usage: `echo_server [port] [threads]` (defaults: 7000, 2)

use std::sync::Arc;

use keelson::{dev_tracing, EventLoop, InetAddr, TcpServer};

fn main() -> keelson::Result<()> {
    dev_tracing::init_tracing();

    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().map_or(7000, |a| a.parse().expect("bad port"));
    let threads: usize = args.next().map_or(2, |a| a.parse().expect("bad thread count"));

    let addr = InetAddr::any(port, false);
    let lp = EventLoop::new();
    let server = TcpServer::new(&lp, &addr, "echo", false)?;
    server.set_thread_num(threads);

    server.set_connection_callback(Arc::new(|conn| {
        println!(
            "echo: {} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "up" } else { "down" }
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf, when| {
        let msg = buf.retrieve_all_as_bytes();
        println!("echo: {} bytes received at {}", msg.len(), when);
        conn.send_bytes(msg);
    }));

    println!("echo server listening on {}", server.ip_port());
    server.start();
    lp.run();
    Ok(())
}
