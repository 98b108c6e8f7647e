use emberd::{process_input_buffer, Client, Executor};
use mio::Poll;

/// Run one or more requests through the parser and executor, returning the
/// bytes that would hit the wire.
fn exec(ex: &mut Executor, c: &mut Client, input: &[u8]) -> Vec<u8> {
    let poll = Poll::new().unwrap();
    c.feed(input);
    process_input_buffer(c, poll.registry(), ex);
    let mut wire = Vec::new();
    c.out.write_to(&mut wire, usize::MAX).unwrap();
    wire
}

fn bulk(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for p in parts {
        out.extend_from_slice(format!("${}\r\n{}\r\n", p.len(), p).as_bytes());
    }
    out
}

#[test]
fn ping() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(exec(&mut ex, &mut c, b"PING\r\n"), b"+PONG\r\n");
}

#[test]
fn echo_round_trips_the_argument() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["ECHO", "hello"])),
        b"$5\r\nhello\r\n"
    );
}

#[test]
fn set_get_del_cycle() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["SET", "a", "1"])), b"+OK\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["GET", "a"])), b"$1\r\n1\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["DEL", "a"])), b":1\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["GET", "a"])), b"$-1\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["DEL", "a"])), b":0\r\n");
}

#[test]
fn del_counts_multiple_keys() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    exec(&mut ex, &mut c, &bulk(&["MSET", "a", "1", "b", "2"]));
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["DEL", "a", "b", "missing"])),
        b":2\r\n"
    );
}

#[test]
fn exists_and_type() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    exec(&mut ex, &mut c, &bulk(&["SET", "x", "41"]));
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["EXISTS", "x"])), b":1\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["EXISTS", "nope"])), b":0\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["TYPE", "x"])), b"+string\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["TYPE", "nope"])), b"+none\r\n");
}

#[test]
fn incr_counts_and_rejects_garbage() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["INCR", "n"])), b":1\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["INCR", "n"])), b":2\r\n");

    exec(&mut ex, &mut c, &bulk(&["SET", "s", "41"]));
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["INCR", "s"])), b":42\r\n");
    // The incremented value reads back in its decimal form.
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["GET", "s"])), b"$2\r\n42\r\n");

    exec(&mut ex, &mut c, &bulk(&["SET", "junk", "abc"]));
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["INCR", "junk"])),
        b"-ERR value is not an integer or out of range\r\n"
    );
}

#[test]
fn incr_created_keys_decode_as_bulk() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    exec(&mut ex, &mut c, &bulk(&["INCR", "n"]));
    // Stored integer-encoded; GET decodes it on demand.
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["GET", "n"])), b"$1\r\n1\r\n");
}

#[test]
fn mget_mixes_hits_and_misses() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    exec(&mut ex, &mut c, &bulk(&["MSET", "a", "1", "b", "two"]));
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["MGET", "a", "nope", "b"])),
        b"*3\r\n$1\r\n1\r\n$-1\r\n$3\r\ntwo\r\n".to_vec()
    );
}

#[test]
fn mset_requires_pairs() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["MSET", "a", "1", "b"])),
        b"-ERR wrong number of arguments for MSET\r\n"
    );
}

#[test]
fn rename_moves_values() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    exec(&mut ex, &mut c, &bulk(&["SET", "x", "42"]));
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["RENAME", "x", "y"])),
        b"+OK\r\n"
    );
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["GET", "y"])), b"$2\r\n42\r\n");
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["RENAME", "missing", "z"])),
        b"-ERR no such key\r\n"
    );
}

#[test]
fn select_switches_databases() {
    let mut ex = Executor::new(2);
    let mut c = Client::fake();
    exec(&mut ex, &mut c, &bulk(&["SET", "k", "zero"]));
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["SELECT", "1"])), b"+OK\r\n");
    assert_eq!(c.db_index(), 1);
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["GET", "k"])), b"$-1\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["SELECT", "0"])), b"+OK\r\n");
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["GET", "k"])),
        b"$4\r\nzero\r\n"
    );
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["SELECT", "9"])),
        b"-ERR invalid DB index\r\n"
    );
}

#[test]
fn quit_latches_the_connection() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(exec(&mut ex, &mut c, b"QUIT\r\n"), b"+OK\r\n");
    assert!(c.close_after_reply());
    // Anything pipelined after QUIT is ignored.
    assert_eq!(exec(&mut ex, &mut c, b"PING\r\n"), b"");
}

#[test]
fn unknown_command_and_bad_arity() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["NOSUCH", "x"])),
        b"-ERR unknown command 'nosuch'\r\n"
    );
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["GET"])),
        b"-ERR wrong number of arguments for 'get' command\r\n"
    );
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["SET", "only-key"])),
        b"-ERR wrong number of arguments for 'set' command\r\n"
    );
}

#[test]
fn commands_are_case_insensitive() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["set", "a", "1"])), b"+OK\r\n");
    assert_eq!(exec(&mut ex, &mut c, &bulk(&["gEt", "a"])), b"$1\r\n1\r\n");
    assert_eq!(ex.stat_numcommands, 2);
}

#[test]
fn inline_and_multibulk_hit_the_same_dispatch() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    assert_eq!(
        exec(&mut ex, &mut c, b"SET greeting hello\r\n"),
        b"+OK\r\n"
    );
    assert_eq!(
        exec(&mut ex, &mut c, &bulk(&["GET", "greeting"])),
        b"$5\r\nhello\r\n"
    );
    assert_eq!(ex.db(0).len(), 1);
}

#[test]
fn binary_safe_values() {
    let mut ex = Executor::new(1);
    let mut c = Client::fake();
    let mut req = b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n$4\r\n\x00\x01\r\x02\r\n".to_vec();
    assert_eq!(exec(&mut ex, &mut c, &req), b"+OK\r\n");
    req = b"*2\r\n$3\r\nGET\r\n$3\r\nbin\r\n".to_vec();
    assert_eq!(exec(&mut ex, &mut c, &req), b"$4\r\n\x00\x01\r\x02\r\n");
}
