/*!
 * Network Layer and Event Loop
 *
 * Single-threaded reactor: one mio poll drives the listening socket and
 * every client connection. Readable events feed the protocol parser, which
 * dispatches complete requests in-loop; writable events drain the client
 * output queue under a per-event byte cap so no single connection can
 * monopolize the thread. A periodic sweep closes idle clients.
 */

use crate::client::{unix_time, Client};
use crate::command::CommandDispatch;
use crate::config::Config;
use crate::protocol::process_input_buffer;
use anyhow::Result;
use hashbrown::HashMap;
use log::{debug, error, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Size of the read buffer for incoming data.
pub const IOBUF_LEN: usize = 16 * 1024;

/// Byte cap per writable event, unless the flush policy lifts it.
pub const MAX_WRITE_PER_EVENT: usize = 64 * 1024;

const LISTENER: Token = Token(0);

/// Bind the listening socket with SO_REUSEADDR and hand it to mio.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// The server reactor and the state it owns: the poll instance, the
/// listener, and the live client registry.
pub struct Server {
    config: Config,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    clients: HashMap<usize, Client>,
    next_token: usize,
    dispatch: Box<dyn CommandDispatch>,
    /// When this returns true the per-event write cap is ignored and the
    /// drainer delivers as much as the socket accepts.
    flush_policy: Box<dyn Fn() -> bool + Send>,
    /// Client set during parsing, for diagnostics.
    current_client: Option<usize>,
    /// Connections accepted since startup.
    pub stat_numconnections: u64,
    last_sweep: Instant,
}

impl Server {
    /// Bind the listener and register it with a fresh poll.
    pub fn bind(config: Config, dispatch: Box<dyn CommandDispatch>) -> Result<Server> {
        let poll = Poll::new()?;
        let mut listener = bind_listener(config.addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Server {
            config,
            poll,
            events: Events::with_capacity(1024),
            listener,
            clients: HashMap::new(),
            next_token: 1,
            dispatch,
            flush_policy: Box::new(|| false),
            current_client: None,
            stat_numconnections: 0,
            last_sweep: Instant::now(),
        })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Inject the predicate that decides when the write cap is lifted
    /// (e.g. while the server is over its memory limit).
    pub fn set_flush_policy(&mut self, f: impl Fn() -> bool + Send + 'static) {
        self.flush_policy = Box::new(f);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Longest reply list and biggest query buffer across live clients.
    pub fn clients_max_buffers(&self) -> (usize, usize) {
        let mut longest_output_list = 0;
        let mut biggest_input_buffer = 0;
        for c in self.clients.values() {
            longest_output_list = longest_output_list.max(c.out.reply_len());
            biggest_input_buffer = biggest_input_buffer.max(c.querybuf_len());
        }
        (longest_output_list, biggest_input_buffer)
    }

    /// Info string of every live client, one per line.
    pub fn all_clients_info(&self) -> String {
        let now = unix_time();
        let mut o = String::new();
        for c in self.clients.values() {
            o.push_str(&c.info_string(now));
            o.push('\n');
        }
        o
    }

    /// Run the reactor until an error tears it down.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.tick(Some(Duration::from_millis(200)))?;
        }
    }

    /// One poll cycle: handle ready events, then sweep idle clients at most
    /// once a second.
    pub fn tick(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.poll.poll(&mut self.events, timeout)?;
        let registry = self.poll.registry();
        let now = unix_time();

        for ev in self.events.iter() {
            match ev.token() {
                LISTENER => accept_clients(
                    &mut self.listener,
                    registry,
                    &mut self.clients,
                    &mut self.next_token,
                    &self.config,
                    &mut self.current_client,
                    &mut self.stat_numconnections,
                ),
                Token(t) => {
                    let mut alive = self.clients.contains_key(&t);
                    if alive && ev.is_readable() {
                        alive = read_query(
                            t,
                            registry,
                            &mut self.clients,
                            &mut *self.dispatch,
                            &self.config,
                            &mut self.current_client,
                            now,
                        );
                    }
                    if alive && ev.is_writable() {
                        let unbounded = (self.flush_policy)();
                        send_reply(
                            t,
                            registry,
                            &mut self.clients,
                            &mut self.current_client,
                            unbounded,
                            now,
                        );
                    }
                }
            }
        }

        if self.config.maxidletime > 0 && self.last_sweep.elapsed() >= Duration::from_secs(1) {
            close_timedout_clients(
                registry,
                &mut self.clients,
                &mut self.current_client,
                self.config.maxidletime,
                now,
            );
            self.last_sweep = Instant::now();
        }
        Ok(())
    }
}

/// Accept pending connections. Each new client is registered for readable
/// events; once the client cap is exceeded a terse error is pushed straight
/// through the kernel and the client is freed.
fn accept_clients(
    listener: &mut TcpListener,
    registry: &Registry,
    clients: &mut HashMap<usize, Client>,
    next_token: &mut usize,
    config: &Config,
    current_client: &mut Option<usize>,
    stat_numconnections: &mut u64,
) {
    loop {
        match listener.accept() {
            Ok((mut sock, peer)) => {
                sock.set_nodelay(true).ok();

                let token = *next_token;
                *next_token += 1;

                if let Err(e) = registry.register(&mut sock, Token(token), Interest::READABLE) {
                    warn!("Error allocating resources for the client: {}", e);
                    continue; // socket dropped, connection closed
                }
                clients.insert(token, Client::new(Token(token), sock, peer));

                if config.maxclients > 0 && clients.len() > config.maxclients {
                    // Best-effort error message, write errors are ignored.
                    let c = clients.get_mut(&token).expect("client just inserted");
                    if let Some(conn) = c.conn.as_mut() {
                        let _ = conn.write(b"-ERR max number of clients reached\r\n");
                    }
                    free_client(registry, clients, current_client, token);
                    continue;
                }

                *stat_numconnections += 1;
                debug!("Accepted {}", peer);
            }
            Err(ref e) if would_block(e) => break,
            Err(e) => {
                error!("Accepting client connection: {}", e);
                break;
            }
        }
    }
}

/// Readable event: drain the socket into the query buffer, then run the
/// parser driver. Returns false when the client was freed.
fn read_query(
    token: usize,
    registry: &Registry,
    clients: &mut HashMap<usize, Client>,
    dispatch: &mut dyn CommandDispatch,
    config: &Config,
    current_client: &mut Option<usize>,
    now: u64,
) -> bool {
    let mut close = false;
    {
        let Some(c) = clients.get_mut(&token) else {
            return false;
        };
        *current_client = Some(token);

        let mut buf = [0u8; IOBUF_LEN];
        loop {
            let n = match c.conn.as_mut().expect("live client has a socket").read(&mut buf) {
                Ok(0) => {
                    debug!("Client closed connection");
                    close = true;
                    break;
                }
                Ok(n) => n,
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    debug!("Reading from client: {}", e);
                    close = true;
                    break;
                }
            };
            c.feed(&buf[..n]);
            c.lastinteraction = now;
        }

        if !close && c.querybuf_len() > config.max_querybuf_len {
            warn!(
                "Closing client that reached max query buffer length: {}",
                c.info_string(now)
            );
            close = true;
        }

        if !close {
            process_input_buffer(c, registry, dispatch);
        }
    }
    *current_client = None;

    if close {
        free_client(registry, clients, current_client, token);
        return false;
    }
    true
}

/// Writable event: drain the output queue into the socket. When everything
/// is out, writable interest is dropped and a close-after-reply client is
/// freed; when bytes remain, writable interest is re-armed for the next
/// cycle. Returns false when the client was freed.
fn send_reply(
    token: usize,
    registry: &Registry,
    clients: &mut HashMap<usize, Client>,
    current_client: &mut Option<usize>,
    unbounded: bool,
    now: u64,
) -> bool {
    let cap = if unbounded {
        usize::MAX
    } else {
        MAX_WRITE_PER_EVENT
    };

    let mut close = false;
    {
        let Some(c) = clients.get_mut(&token) else {
            return false;
        };
        let Some(mut conn) = c.conn.take() else {
            return true;
        };

        match c.out.write_to(&mut conn, cap) {
            Ok(n) => {
                if n > 0 {
                    c.lastinteraction = now;
                }
                if c.out.is_empty() {
                    let _ = registry.reregister(&mut conn, c.token, Interest::READABLE);
                    c.write_event = false;
                    // Close once the entire reply has been delivered.
                    if c.close_after_reply {
                        close = true;
                    }
                } else {
                    // Re-arm so the remainder gets another writable event.
                    let _ = registry.reregister(
                        &mut conn,
                        c.token,
                        Interest::READABLE | Interest::WRITABLE,
                    );
                }
                c.conn = Some(conn);
            }
            Err(e) => {
                debug!("Error writing to client: {}", e);
                close = true; // socket dropped here
            }
        }
    }

    if close {
        free_client(registry, clients, current_client, token);
        return false;
    }
    true
}

/// Tear a client down: detach it from the diagnostics pointer, release its
/// buffers, deregister its socket and close it, and drop it from the
/// client registry.
pub(crate) fn free_client(
    registry: &Registry,
    clients: &mut HashMap<usize, Client>,
    current_client: &mut Option<usize>,
    token: usize,
) {
    if *current_client == Some(token) {
        *current_client = None;
    }
    if let Some(mut c) = clients.remove(&token) {
        // Release the query buffer before anything that could re-enter
        // parsing on this client.
        c.querybuf.clear();
        if let Some(mut conn) = c.conn.take() {
            let _ = registry.deregister(&mut conn);
        }
        // Reply list, argv and the socket are released on drop.
    }
}

/// Close every client idle for longer than `maxidletime` seconds.
fn close_timedout_clients(
    registry: &Registry,
    clients: &mut HashMap<usize, Client>,
    current_client: &mut Option<usize>,
    maxidletime: u64,
    now: u64,
) {
    let victims: Vec<usize> = clients
        .iter()
        .filter(|(_, c)| now.saturating_sub(c.lastinteraction) > maxidletime)
        .map(|(t, _)| *t)
        .collect();
    for token in victims {
        debug!("Closing idle client");
        free_client(registry, clients, current_client, token);
    }
}

/// Non-blocking I/O conditions that should be retried later rather than
/// treated as errors.
#[inline]
fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
