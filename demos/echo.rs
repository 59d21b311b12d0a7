extern crate micro_thread;
extern crate env_logger;

use std::net::SocketAddr;
use std::str::FromStr;
use micro_thread::tcp::TcpListener;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5555";
const IO_TIMEOUT_MS: u64 = 30_000;

fn listen_addr() -> SocketAddr {
    FromStr::from_str(DEFAULT_LISTEN_ADDR).unwrap()
}

fn main() {
    env_logger::init();

    micro_thread::start(|| {
        let addr = listen_addr();
        let listener = TcpListener::bind(addr).unwrap();

        println!("starting tcp echo server on {:?}", addr);

        loop {
            let (mut conn, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };

            micro_thread::spawn(move || {
                println!("accepted connection from {:?}", peer);
                let mut buf = [0u8; 1024 * 16];
                loop {
                    let size = match conn.read(&mut buf, IO_TIMEOUT_MS) {
                        Ok(0) => break,
                        Ok(size) => size,
                        Err(_) => break,
                    };

                    let mut written = 0;
                    while written < size {
                        match conn.write(&buf[written..size], IO_TIMEOUT_MS) {
                            Ok(n) => written += n,
                            Err(_) => return,
                        }
                    }
                }
            });
        }
    });
}
