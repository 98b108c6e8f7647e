/*!
 * Command Dispatch
 *
 * The seam between the networking core and command execution. The core hands
 * a client whose argv holds one complete request to a `CommandDispatch`; the
 * dispatcher queues replies through the client's reply writer and reports
 * whether the request was consumed or deferred.
 */

use crate::client::Client;
use crate::reply::{shared, Reply};
use crate::storage::{Dict, Value};
use bytes::BytesMut;
use mio::Registry;

/// What the dispatcher did with the parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The argv was consumed; the driver resets the client.
    Done,
    /// The command took ownership of the continuation (e.g. it blocked the
    /// client); parser state is left untouched.
    Deferred,
}

/// Command execution entry point called by the input driver once a full
/// request has been parsed into the client argv. `Send` so a bound server
/// can be handed to the thread that runs its reactor.
pub trait CommandDispatch: Send {
    fn dispatch(&mut self, c: &mut Client, registry: &Registry) -> CommandOutcome;
}

/// Static command descriptor. Negative arity means "at least that many".
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: i32,
}

static COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec { name: "ping", arity: 1 },
    CommandSpec { name: "echo", arity: 2 },
    CommandSpec { name: "get", arity: 2 },
    CommandSpec { name: "set", arity: 3 },
    CommandSpec { name: "del", arity: -2 },
    CommandSpec { name: "exists", arity: 2 },
    CommandSpec { name: "incr", arity: 2 },
    CommandSpec { name: "type", arity: 2 },
    CommandSpec { name: "mget", arity: -2 },
    CommandSpec { name: "mset", arity: -3 },
    CommandSpec { name: "rename", arity: 3 },
    CommandSpec { name: "select", arity: 2 },
    CommandSpec { name: "quit", arity: 1 },
];

pub fn lookup_command(name: &str) -> Option<&'static CommandSpec> {
    COMMAND_TABLE.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

fn parse_i64(s: &[u8]) -> Option<i64> {
    std::str::from_utf8(s).ok()?.parse::<i64>().ok()
}

/// Built-in command executor over a set of selectable databases.
pub struct Executor {
    dbs: Vec<Dict>,
    /// Commands executed since startup.
    pub stat_numcommands: u64,
}

impl Executor {
    pub fn new(dbnum: usize) -> Executor {
        Executor {
            dbs: (0..dbnum.max(1)).map(|_| Dict::default()).collect(),
            stat_numcommands: 0,
        }
    }

    /// Direct access to a database, mainly for tests and tooling.
    pub fn db(&self, idx: usize) -> &Dict {
        &self.dbs[idx]
    }

    fn exec(&mut self, spec: &'static CommandSpec, c: &mut Client, registry: &Registry) {
        match spec.name {
            "ping" => c.add_reply(registry, shared::pong()),
            "echo" => {
                // The bulk body shares the argv payload instead of copying.
                let msg = c.argv[1].clone();
                c.add_reply_bulk(registry, Reply::Raw(msg));
            }
            "get" => {
                let reply = match self.dbs[c.db].get(c.argv[1].as_slice()) {
                    Some(Value::Str(v)) => Some(Reply::from_slice(v)),
                    Some(Value::Int(i)) => Some(Reply::Int(*i)),
                    None => None,
                };
                match reply {
                    Some(r) => c.add_reply_bulk(registry, r),
                    None => c.add_reply(registry, shared::null_bulk()),
                }
            }
            "set" => {
                let k = c.argv[1].as_slice().to_vec();
                let v = c.argv[2].as_slice().to_vec();
                self.dbs[c.db].set(k, Value::Str(v));
                c.add_reply(registry, shared::ok());
            }
            "del" => {
                let mut removed = 0i64;
                for j in 1..c.argv.len() {
                    if self.dbs[c.db].del(c.argv[j].as_slice()) {
                        removed += 1;
                    }
                }
                c.add_reply_long_long(registry, removed);
            }
            "exists" => {
                let n = self.dbs[c.db].exists(c.argv[1].as_slice()) as i64;
                c.add_reply_long_long(registry, n);
            }
            "incr" => match self.dbs[c.db].incr(c.argv[1].as_slice()) {
                Some(n) => c.add_reply_long_long(registry, n),
                None => {
                    c.add_reply_error(registry, "value is not an integer or out of range")
                }
            },
            "type" => {
                let t = match self.dbs[c.db].get(c.argv[1].as_slice()) {
                    Some(_) => "string",
                    None => "none",
                };
                c.add_reply_status(registry, t);
            }
            "mget" => {
                let mut header = BytesMut::new();
                header.extend_from_slice(format!("*{}\r\n", c.argv.len() - 1).as_bytes());
                c.add_reply_buf(registry, header);
                for j in 1..c.argv.len() {
                    let reply = match self.dbs[c.db].get(c.argv[j].as_slice()) {
                        Some(Value::Str(v)) => Some(Reply::from_slice(v)),
                        Some(Value::Int(i)) => Some(Reply::Int(*i)),
                        None => None,
                    };
                    match reply {
                        Some(r) => c.add_reply_bulk(registry, r),
                        None => c.add_reply(registry, shared::null_bulk()),
                    }
                }
            }
            "mset" => {
                if (c.argv.len() - 1) % 2 != 0 {
                    c.add_reply_error(registry, "wrong number of arguments for MSET");
                    return;
                }
                for pair in (1..c.argv.len()).step_by(2) {
                    let k = c.argv[pair].as_slice().to_vec();
                    let v = c.argv[pair + 1].as_slice().to_vec();
                    self.dbs[c.db].set(k, Value::Str(v));
                }
                c.add_reply(registry, shared::ok());
            }
            "rename" => {
                let from = c.argv[1].as_slice().to_vec();
                let to = c.argv[2].as_slice().to_vec();
                if self.dbs[c.db].rename(from, to) {
                    c.add_reply(registry, shared::ok());
                } else {
                    c.add_reply_error(registry, "no such key");
                }
            }
            "select" => match parse_i64(c.argv[1].as_slice()) {
                Some(idx) if idx >= 0 && (idx as usize) < self.dbs.len() => {
                    c.db = idx as usize;
                    c.add_reply(registry, shared::ok());
                }
                _ => c.add_reply_error(registry, "invalid DB index"),
            },
            "quit" => {
                c.add_reply(registry, shared::ok());
                c.close_after_reply = true;
            }
            _ => unreachable!("command table entry without an implementation"),
        }
    }
}

impl CommandDispatch for Executor {
    fn dispatch(&mut self, c: &mut Client, registry: &Registry) -> CommandOutcome {
        let name = String::from_utf8_lossy(c.argv[0].as_slice()).to_ascii_lowercase();

        let Some(spec) = lookup_command(&name) else {
            c.add_reply_error(registry, &format!("unknown command '{}'", name));
            return CommandOutcome::Done;
        };

        let argc = c.argv.len() as i32;
        if (spec.arity > 0 && spec.arity != argc) || argc < -spec.arity {
            c.add_reply_error(
                registry,
                &format!("wrong number of arguments for '{}' command", spec.name),
            );
            return CommandOutcome::Done;
        }

        c.cmd = Some(spec);
        c.lastcmd = Some(spec);
        self.stat_numcommands += 1;
        self.exec(spec, c, registry);
        CommandOutcome::Done
    }
}
