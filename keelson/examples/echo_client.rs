//! Echo client: sends a line to the server once connected, prints the reply,
//! and reconnects with backoff if the server goes away.
//!
//! Usage: `echo_client [addr]` (default: 127.0.0.1:7000)

use std::sync::Arc;

use keelson::{dev_tracing, EventLoop, InetAddr, TcpClient};

fn main() {
    dev_tracing::init_tracing();

    let addr: InetAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string())
        .parse()
        .expect("bad address");

    let lp = EventLoop::new();
    let client = TcpClient::new(&lp, addr, "echo-client");
    client.enable_retry();

    client.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            println!("connected to {}", conn.peer_addr());
            conn.send(b"hello from keelson\n");
        } else {
            println!("disconnected from {}", conn.peer_addr());
        }
    }));
    client.set_message_callback(Arc::new(|_conn, buf, _when| {
        print!("{}", buf.retrieve_all_as_string());
    }));

    client.connect();
    lp.run();
}
