/*!
 * Client State and Reply Buffering
 *
 * Per-connection state: the socket, the query buffer with the parser cursor,
 * the parsed argument vector, and the two-tier output queue that replies are
 * staged into. Commands append replies through the `add_reply_*` family;
 * the event loop drains the queue on writable events.
 */

use crate::command::CommandSpec;
use crate::reply::{Payload, Reply};
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the fixed per-client output staging buffer.
pub const OUTPUT_BUF_SIZE: usize = 16 * 1024;

/// Coalescing limit: bytes are appended to the tail reply object as long as
/// the combined payload stays under this size.
pub const REPLY_CHUNK_BYTES: usize = 16 * 1024;

/// Wall clock in whole seconds, used for idle-time tracking.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parser mode for the request currently being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    Unknown,
    Inline,
    MultiBulk,
}

/// Two-tier outbound reply state.
///
/// Small replies are memcpy'd into a fixed staging buffer; once that is full,
/// or whenever ordering demands it, replies go to an ordered list of payload
/// objects. The buffer is always drained before the list, and nothing is
/// placed into the buffer while the list is non-empty, so bytes leave in
/// exactly the order they were appended.
pub struct OutputQueue {
    buf: Box<[u8; OUTPUT_BUF_SIZE]>,
    bufpos: usize,
    reply: VecDeque<Payload>,
    reply_bytes: usize,
    sentlen: usize,
}

impl Default for OutputQueue {
    fn default() -> Self {
        OutputQueue::new()
    }
}

impl OutputQueue {
    pub fn new() -> OutputQueue {
        OutputQueue {
            buf: Box::new([0u8; OUTPUT_BUF_SIZE]),
            bufpos: 0,
            reply: VecDeque::new(),
            reply_bytes: 0,
            sentlen: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bufpos == 0 && self.reply.is_empty()
    }

    #[inline]
    pub fn bufpos(&self) -> usize {
        self.bufpos
    }

    #[inline]
    pub fn sentlen(&self) -> usize {
        self.sentlen
    }

    /// Number of objects in the reply list.
    #[inline]
    pub fn reply_len(&self) -> usize {
        self.reply.len()
    }

    /// Allocation-size sum of the reply list entries.
    #[inline]
    pub fn reply_bytes(&self) -> usize {
        self.reply_bytes
    }

    /// Bytes queued and not yet written.
    pub fn pending_bytes(&self) -> usize {
        let list: usize = self.reply.iter().map(|p| p.len()).sum();
        if self.bufpos > 0 {
            (self.bufpos - self.sentlen) + list
        } else {
            list - self.sentlen
        }
    }

    /// Try to place bytes in the fixed buffer. Fails when the reply list is
    /// non-empty (ordering) or when the bytes don't fit.
    pub fn try_buffer(&mut self, s: &[u8]) -> bool {
        if !self.reply.is_empty() {
            return false;
        }
        if s.len() > OUTPUT_BUF_SIZE - self.bufpos {
            return false;
        }
        self.buf[self.bufpos..self.bufpos + s.len()].copy_from_slice(s);
        self.bufpos += s.len();
        true
    }

    /// Append to the tail object when the combined size fits the chunk limit.
    /// A shared tail is first replaced by a private copy, so payloads queued
    /// on other clients are never touched.
    fn try_coalesce(&mut self, s: &[u8]) -> bool {
        let Some(tail) = self.reply.back_mut() else {
            return false;
        };
        if tail.len() + s.len() > REPLY_CHUNK_BYTES {
            return false;
        }
        self.reply_bytes -= tail.alloc_size();
        tail.append(s);
        self.reply_bytes += tail.alloc_size();
        true
    }

    /// Queue a payload object on the reply list, coalescing into the tail
    /// when possible.
    pub fn push_payload(&mut self, p: Payload) {
        if self.try_coalesce(p.as_slice()) {
            return;
        }
        self.reply_bytes += p.alloc_size();
        self.reply.push_back(p);
    }

    /// Queue a byte slice on the reply list.
    pub fn push_bytes(&mut self, s: &[u8]) {
        if self.try_coalesce(s) {
            return;
        }
        let p = Payload::Owned(BytesMut::from(s));
        self.reply_bytes += p.alloc_size();
        self.reply.push_back(p);
    }

    /// Queue an owned buffer on the reply list, taking ownership without
    /// copying when it becomes a new list entry.
    pub fn push_buf(&mut self, s: BytesMut) {
        if self.try_coalesce(&s) {
            return;
        }
        let p = Payload::Owned(s);
        self.reply_bytes += p.alloc_size();
        self.reply.push_back(p);
    }

    /// Drain queued output into `dst`: fixed buffer first, then the reply
    /// list, stopping once more than `cap` bytes went out in this call.
    ///
    /// `WouldBlock` stops the drain and is not an error; the partial cursor
    /// (`sentlen`) is kept so the next call resumes mid-object. Real I/O
    /// errors are returned to the caller.
    pub fn write_to(&mut self, dst: &mut impl Write, cap: usize) -> io::Result<usize> {
        let mut totwritten = 0usize;

        while self.bufpos > 0 || !self.reply.is_empty() {
            if self.bufpos > 0 {
                let n = match dst.write(&self.buf[self.sentlen..self.bufpos]) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(ref e) if would_block(e) => break,
                    Err(e) => return Err(e),
                };
                self.sentlen += n;
                totwritten += n;

                // Buffer fully sent, continue with the reply list.
                if self.sentlen == self.bufpos {
                    self.bufpos = 0;
                    self.sentlen = 0;
                }
            } else {
                let o = self.reply.front().expect("reply list non-empty");
                let objlen = o.len();
                let objmem = o.alloc_size();

                if objlen == 0 {
                    self.reply.pop_front();
                    continue;
                }

                let n = match dst.write(&o.as_slice()[self.sentlen..]) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(ref e) if would_block(e) => break,
                    Err(e) => return Err(e),
                };
                self.sentlen += n;
                totwritten += n;

                // Head object fully sent, move to the next one.
                if self.sentlen == objlen {
                    self.reply.pop_front();
                    self.sentlen = 0;
                    self.reply_bytes -= objmem;
                }
            }

            // Cap how much a single event may write, so one client on a fast
            // link cannot monopolize the thread.
            if totwritten > cap {
                break;
            }
        }

        if self.is_empty() {
            self.sentlen = 0;
        }
        Ok(totwritten)
    }
}

#[inline]
fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Per-connection client state.
pub struct Client {
    pub(crate) token: Token,
    /// Socket; `None` once the client is detached from the reactor.
    pub(crate) conn: Option<TcpStream>,
    pub(crate) peer: Option<SocketAddr>,
    /// Unparsed request bytes.
    pub(crate) querybuf: BytesMut,
    pub(crate) reqtype: ReqType,
    /// Remaining arguments of the multi-bulk request being read.
    pub(crate) multibulklen: usize,
    /// Length of the bulk currently being read; `None` = header not seen yet.
    pub(crate) bulklen: Option<usize>,
    /// Parsed argument vector of the current request.
    pub(crate) argv: Vec<Payload>,
    /// Outbound reply state.
    pub out: OutputQueue,
    pub(crate) close_after_reply: bool,
    pub(crate) blocked: bool,
    /// Writable interest currently installed with the reactor.
    pub(crate) write_event: bool,
    pub(crate) lastinteraction: u64,
    /// Selected database index.
    pub(crate) db: usize,
    pub(crate) cmd: Option<&'static CommandSpec>,
    pub(crate) lastcmd: Option<&'static CommandSpec>,
}

impl Client {
    pub fn new(token: Token, conn: TcpStream, peer: SocketAddr) -> Client {
        Client {
            token,
            conn: Some(conn),
            peer: Some(peer),
            querybuf: BytesMut::new(),
            reqtype: ReqType::Unknown,
            multibulklen: 0,
            bulklen: None,
            argv: Vec::new(),
            out: OutputQueue::new(),
            close_after_reply: false,
            blocked: false,
            write_event: false,
            lastinteraction: unix_time(),
            db: 0,
            cmd: None,
            lastcmd: None,
        }
    }

    /// Detached client with no socket. Commands are executed against it the
    /// normal way and replies queue up without any event registration; used
    /// to run commands outside the reactor and as a test fixture.
    pub fn fake() -> Client {
        Client {
            token: Token(0),
            conn: None,
            peer: None,
            querybuf: BytesMut::new(),
            reqtype: ReqType::Unknown,
            multibulklen: 0,
            bulklen: None,
            argv: Vec::new(),
            out: OutputQueue::new(),
            close_after_reply: false,
            blocked: false,
            write_event: false,
            lastinteraction: unix_time(),
            db: 0,
            cmd: None,
            lastcmd: None,
        }
    }

    /// Append freshly read bytes to the query buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.querybuf.extend_from_slice(bytes);
    }

    #[inline]
    pub fn querybuf_len(&self) -> usize {
        self.querybuf.len()
    }

    #[inline]
    pub fn argv(&self) -> &[Payload] {
        &self.argv
    }

    #[inline]
    pub fn reqtype(&self) -> ReqType {
        self.reqtype
    }

    #[inline]
    pub fn close_after_reply(&self) -> bool {
        self.close_after_reply
    }

    /// Latch the connection for teardown once all pending replies are sent.
    pub fn set_close_after_reply(&mut self) {
        self.close_after_reply = true;
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Mark the client as waiting on a blocking operation; the input driver
    /// stops feeding commands until it is cleared.
    pub fn set_blocked(&mut self, on: bool) {
        self.blocked = on;
    }

    #[inline]
    pub fn db_index(&self) -> usize {
        self.db
    }

    /// Prepare the client to process the next command: release the argument
    /// vector and clear the parser cursor. The query buffer is preserved so
    /// pipelined requests behind the current one still get parsed.
    pub fn reset(&mut self) {
        self.argv.clear();
        self.cmd = None;
        self.reqtype = ReqType::Unknown;
        self.multibulklen = 0;
        self.bulklen = None;
    }

    /// Install writable interest if this is the first pending byte since the
    /// queue was last empty. Returns false when the append must be dropped
    /// (reactor registration failed).
    fn install_write_event(&mut self, registry: &Registry) -> bool {
        if self.out.is_empty() {
            if let Some(conn) = self.conn.as_mut() {
                if registry
                    .reregister(conn, self.token, Interest::READABLE | Interest::WRITABLE)
                    .is_err()
                {
                    return false;
                }
                self.write_event = true;
            }
            // Detached clients have no event to install; replies still queue.
        }
        true
    }

    /// Queue a reply object. Raw payloads go to the fixed buffer when they
    /// fit, otherwise to the reply list; integers are decoded to a transient
    /// raw form first.
    pub fn add_reply(&mut self, registry: &Registry, obj: Reply) {
        if self.close_after_reply {
            return;
        }
        if !self.install_write_event(registry) {
            return;
        }
        match obj {
            Reply::Raw(p) => {
                if !self.out.try_buffer(p.as_slice()) {
                    self.out.push_payload(p);
                }
            }
            Reply::Int(n) => {
                let p = Payload::Owned(BytesMut::from(n.to_string().as_bytes()));
                if !self.out.try_buffer(p.as_slice()) {
                    self.out.push_payload(p);
                }
            }
        }
    }

    /// Queue raw bytes.
    pub fn add_reply_bytes(&mut self, registry: &Registry, s: &[u8]) {
        if self.close_after_reply {
            return;
        }
        if !self.install_write_event(registry) {
            return;
        }
        if !self.out.try_buffer(s) {
            self.out.push_bytes(s);
        }
    }

    /// Queue an owned buffer, taking ownership of it.
    pub fn add_reply_buf(&mut self, registry: &Registry, s: BytesMut) {
        if self.close_after_reply {
            return;
        }
        if !self.install_write_event(registry) {
            return;
        }
        if !self.out.try_buffer(&s) {
            self.out.push_buf(s);
        }
    }

    /// Queue an integer reply line (`:<n>\r\n`), sharing the preallocated
    /// zero/one replies.
    pub fn add_reply_long_long(&mut self, registry: &Registry, n: i64) {
        use crate::reply::shared;
        if n == 0 {
            self.add_reply(registry, shared::czero());
        } else if n == 1 {
            self.add_reply(registry, shared::cone());
        } else {
            let line = format!(":{}\r\n", n);
            self.add_reply_bytes(registry, line.as_bytes());
        }
    }

    /// Queue a bulk reply for an object: `$<len>\r\n<payload>\r\n`.
    pub fn add_reply_bulk(&mut self, registry: &Registry, obj: Reply) {
        use crate::reply::shared;
        let header = format!("${}\r\n", obj.decoded_len());
        self.add_reply_bytes(registry, header.as_bytes());
        self.add_reply(registry, Reply::Raw(obj.decoded()));
        self.add_reply(registry, shared::crlf());
    }

    /// Queue a byte slice as a bulk reply.
    pub fn add_reply_bulk_buffer(&mut self, registry: &Registry, s: &[u8]) {
        use crate::reply::shared;
        let header = format!("${}\r\n", s.len());
        self.add_reply_bytes(registry, header.as_bytes());
        self.add_reply_bytes(registry, s);
        self.add_reply(registry, shared::crlf());
    }

    /// Queue an optional byte slice as a bulk reply; `None` becomes the
    /// shared null bulk.
    pub fn add_reply_bulk_opt(&mut self, registry: &Registry, s: Option<&[u8]>) {
        use crate::reply::shared;
        match s {
            Some(s) => self.add_reply_bulk_buffer(registry, s),
            None => self.add_reply(registry, shared::null_bulk()),
        }
    }

    /// Queue an error reply: `-ERR <msg>\r\n`.
    pub fn add_reply_error(&mut self, registry: &Registry, msg: &str) {
        let line = format!("-ERR {}\r\n", msg);
        self.add_reply_bytes(registry, line.as_bytes());
    }

    /// Queue a status reply: `+<msg>\r\n`.
    pub fn add_reply_status(&mut self, registry: &Registry, msg: &str) {
        let line = format!("+{}\r\n", msg);
        self.add_reply_bytes(registry, line.as_bytes());
    }

    /// One-line human-readable snapshot of the client state.
    pub fn info_string(&self, now: u64) -> String {
        let addr = self
            .peer
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?:0".to_string());

        let mut flags = String::new();
        if self.close_after_reply {
            flags.push('c');
        }
        if self.blocked {
            flags.push('b');
        }
        if flags.is_empty() {
            flags.push('N');
        }

        let mut events = String::new();
        if self.conn.is_some() {
            events.push('r');
        }
        if self.write_event {
            events.push('w');
        }

        format!(
            "addr={} id={} idle={} flags={} db={} qbuf={} obl={} oll={} events={} cmd={}",
            addr,
            self.token.0,
            now.saturating_sub(self.lastinteraction),
            flags,
            self.db,
            self.querybuf.len(),
            self.out.bufpos(),
            self.out.reply_len(),
            events,
            self.lastcmd.map(|c| c.name).unwrap_or("NULL"),
        )
    }
}
