//! Chargen-style flood server: streams a rolling character pattern as fast
//! as the peer can take it, driven entirely by write-complete callbacks.
//! Prints a note when the output buffer crosses the high-water mark.
//!
//! Usage: `chargen_server [port]` (default: 7002)

use std::sync::Arc;

use keelson::{dev_tracing, EventLoop, InetAddr, TcpConnection, TcpServer};

const LINE_LEN: usize = 72;
const CHARS: &[u8] = b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

fn pattern() -> Vec<u8> {
    let mut out = Vec::new();
    for shift in 0..CHARS.len() {
        for i in 0..LINE_LEN {
            out.push(CHARS[(shift + i) % CHARS.len()]);
        }
        out.push(b'\n');
    }
    out
}

fn pump(conn: &Arc<TcpConnection>, payload: &Arc<Vec<u8>>) {
    if conn.connected() {
        conn.send(payload);
    }
}

fn main() -> keelson::Result<()> {
    dev_tracing::init_tracing();

    let port: u16 = std::env::args()
        .nth(1)
        .map_or(7002, |a| a.parse().expect("bad port"));

    let payload = Arc::new(pattern());

    let lp = EventLoop::new();
    let server = TcpServer::new(&lp, &InetAddr::any(port, false), "chargen", false)?;

    {
        let payload = payload.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                conn.set_tcp_no_delay(true);
                let marker = conn.name().to_string();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, len| {
                        println!("chargen: {marker} buffered {len} bytes, peer is slow");
                    }),
                    1024 * 1024,
                );
                pump(conn, &payload);
            }
        }));
    }
    {
        let payload = payload.clone();
        server.set_write_complete_callback(Arc::new(move |conn| {
            pump(conn, &payload);
        }));
    }
    server.set_message_callback(Arc::new(|_conn, buf, _when| buf.retrieve_all()));

    println!("chargen server listening on {}", server.ip_port());
    server.start();
    lp.run();
    Ok(())
}
