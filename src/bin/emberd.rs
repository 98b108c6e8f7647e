/*!
 * Emberd Server Entry Point
 *
 * Initializes logging, builds the command executor, binds the reactor and
 * runs it until shutdown.
 */

use anyhow::Result;
use emberd::{Config, Executor, Server};
use std::net::ToSocketAddrs;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    // Respects the RUST_LOG environment variable,
    // e.g. RUST_LOG=debug emberd
    env_logger::init();

    // Optional listen address as the first argument.
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| emberd::DEFAULT_ADDR.to_string());
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve {}", addr))?;

    let config = Config {
        addr,
        ..Config::default()
    };
    let dbnum = config.dbnum;

    let mut server = Server::bind(config, Box::new(Executor::new(dbnum)))?;
    println!("emberd running on {}", server.local_addr()?);

    server.run()
}
