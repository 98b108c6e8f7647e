/*!
 * Server Configuration
 */

use std::net::SocketAddr;

/// Tunable server limits. Zero disables a limit where noted.
pub struct Config {
    /// Address the listener binds to.
    pub addr: SocketAddr,
    /// Cap on simultaneous connections; 0 = unlimited.
    pub maxclients: usize,
    /// Seconds a client may stay idle before it is closed; 0 = disabled.
    pub maxidletime: u64,
    /// Hard cap on the per-client query buffer; exceeding it closes the
    /// client.
    pub max_querybuf_len: usize,
    /// Number of selectable databases.
    pub dbnum: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            addr: crate::DEFAULT_ADDR.parse().expect("default addr parses"),
            maxclients: 0,
            maxidletime: 0,
            max_querybuf_len: 1024 * 1024 * 1024,
            dbnum: 16,
        }
    }
}
