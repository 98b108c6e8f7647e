/*!
 * Request Protocol
 *
 * Incremental parsers for the two RESP request forms. Both sub-parsers are
 * restartable at arbitrary byte boundaries: a partial request leaves its
 * residue in the client query buffer and the cursor state on the client, and
 * the next invocation resumes where the previous one stopped.
 *
 * Inline form: `<tok1> <tok2> ... <tokN>\r\n`, chosen when the first byte of
 * a request is not `*`. Multi-bulk form:
 * `*<N>\r\n$<L1>\r\n<bytes1>\r\n...`, with bounds on both the argument count
 * and the individual bulk lengths.
 */

use crate::client::{Client, ReqType};
use crate::command::{CommandDispatch, CommandOutcome};
use crate::reply::Payload;
use bytes::Buf;
use log::{debug, log_enabled, Level};
use mio::Registry;
use thiserror::Error;

/// Limit on an inline request line, and on the length of a multi-bulk or
/// bulk header still waiting for its newline.
pub const INLINE_MAX_SIZE: usize = 64 * 1024;

/// Maximum number of arguments in a multi-bulk request.
pub const MULTIBULK_MAX_LEN: i64 = 1024 * 1024;

/// Maximum size of a single bulk argument.
pub const BULK_MAX_BYTES: i64 = 512 * 1024 * 1024;

/// Malformed request taxonomy. The rendered message is the wire diagnostic
/// sent back to the client before the connection is latched for close.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Protocol error: too big inline request")]
    InlineTooLarge,
    #[error("Protocol error: too big mbulk count string")]
    MultibulkHeaderTooLarge,
    #[error("Protocol error: too big bulk count string")]
    BulkHeaderTooLarge,
    #[error("Protocol error: invalid multibulk length")]
    InvalidMultibulkLength,
    #[error("Protocol error: invalid bulk length")]
    InvalidBulkLength,
    #[error("Protocol error: expected '$', got '{0}'")]
    ExpectedBulkHeader(char),
}

/// Result of one sub-parser invocation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParseOutcome {
    /// One full request is in `argv`.
    Complete,
    /// More bytes are needed; residue stays in the query buffer.
    Incomplete,
    /// The stream is malformed beyond recovery.
    Error(ProtocolError),
}

fn find_crlf(s: &[u8]) -> Option<usize> {
    s.windows(2).position(|w| w == b"\r\n")
}

/// Strict decimal parse of a header integer.
fn parse_decimal(s: &[u8]) -> Option<i64> {
    std::str::from_utf8(s).ok()?.parse::<i64>().ok()
}

/// Parse one inline request: everything up to the first `\r\n`, split on
/// single spaces, empty tokens discarded.
pub(crate) fn parse_inline(c: &mut Client) -> ParseOutcome {
    let Some(newline) = find_crlf(&c.querybuf) else {
        if c.querybuf.len() > INLINE_MAX_SIZE {
            return ParseOutcome::Error(ProtocolError::InlineTooLarge);
        }
        return ParseOutcome::Incomplete;
    };

    let argv: Vec<Payload> = c.querybuf[..newline]
        .split(|&b| b == b' ')
        .filter(|tok| !tok.is_empty())
        .map(Payload::from_slice)
        .collect();
    c.argv = argv;

    // Leave data after the first line in the buffer.
    c.querybuf.advance(newline + 2);
    ParseOutcome::Complete
}

/// Parse a multi-bulk request, resuming from the cursor state left by a
/// previous partial invocation. The consumed prefix is trimmed from the
/// query buffer on every exit path, which is what makes re-entry sound.
pub(crate) fn parse_multibulk(c: &mut Client) -> ParseOutcome {
    let mut pos = 0usize;

    if c.multibulklen == 0 {
        // Reading the argument-count header. The client must have been
        // reset after the previous request.
        debug_assert!(c.argv.is_empty());
        debug_assert_eq!(c.querybuf[0], b'*');

        let Some(cr) = c.querybuf.iter().position(|&b| b == b'\r') else {
            if c.querybuf.len() > INLINE_MAX_SIZE {
                return ParseOutcome::Error(ProtocolError::MultibulkHeaderTooLarge);
            }
            return ParseOutcome::Incomplete;
        };
        // The \n must be in the buffer as well.
        if cr + 1 >= c.querybuf.len() {
            return ParseOutcome::Incomplete;
        }

        let ll = match parse_decimal(&c.querybuf[1..cr]) {
            Some(ll) if ll <= MULTIBULK_MAX_LEN => ll,
            _ => return ParseOutcome::Error(ProtocolError::InvalidMultibulkLength),
        };

        pos = cr + 2;
        if ll <= 0 {
            // Empty command: consume the header and yield an empty argv.
            c.querybuf.advance(pos);
            return ParseOutcome::Complete;
        }

        c.multibulklen = ll as usize;
        c.argv = Vec::with_capacity(c.multibulklen);
    }

    while c.multibulklen > 0 {
        if c.bulklen.is_none() {
            // Reading a `$<len>\r\n` bulk header.
            let Some(cr_off) = c.querybuf[pos..].iter().position(|&b| b == b'\r') else {
                if c.querybuf.len() > INLINE_MAX_SIZE {
                    c.querybuf.advance(pos);
                    return ParseOutcome::Error(ProtocolError::BulkHeaderTooLarge);
                }
                break;
            };
            let cr = pos + cr_off;
            if cr + 1 >= c.querybuf.len() {
                break;
            }

            if c.querybuf[pos] != b'$' {
                let got = c.querybuf[pos] as char;
                c.querybuf.advance(pos);
                return ParseOutcome::Error(ProtocolError::ExpectedBulkHeader(got));
            }

            let ll = match parse_decimal(&c.querybuf[pos + 1..cr]) {
                Some(ll) if (0..=BULK_MAX_BYTES).contains(&ll) => ll,
                _ => {
                    c.querybuf.advance(pos);
                    return ParseOutcome::Error(ProtocolError::InvalidBulkLength);
                }
            };

            pos = cr + 2;
            c.bulklen = Some(ll as usize);
        } else {
            // Reading the bulk body plus its trailing \r\n.
            let bulklen = c.bulklen.unwrap();
            if c.querybuf.len() - pos < bulklen + 2 {
                break;
            }
            c.argv
                .push(Payload::from_slice(&c.querybuf[pos..pos + bulklen]));
            pos += bulklen + 2;
            c.bulklen = None;
            c.multibulklen -= 1;
        }
    }

    // Trim the consumed prefix.
    c.querybuf.advance(pos);

    if c.multibulklen == 0 {
        ParseOutcome::Complete
    } else {
        ParseOutcome::Incomplete
    }
}

/// Consume as many complete requests from the query buffer as possible,
/// dispatching each one. Stops on partial input, on protocol errors (after
/// queueing the diagnostic and latching close-after-reply), when the client
/// is blocked in a deferred command, or when the connection is closing.
pub fn process_input_buffer(
    c: &mut Client,
    registry: &Registry,
    dispatch: &mut dyn CommandDispatch,
) {
    while !c.querybuf.is_empty() {
        // A blocked client keeps its residue until the deferred command
        // releases it; a closing client must not grow its reply further.
        if c.blocked || c.close_after_reply {
            return;
        }

        if c.reqtype == ReqType::Unknown {
            if c.querybuf[0] == b'*' {
                c.reqtype = ReqType::MultiBulk;
            } else {
                c.reqtype = ReqType::Inline;
            }
        }

        let outcome = match c.reqtype {
            ReqType::Inline => parse_inline(c),
            ReqType::MultiBulk => parse_multibulk(c),
            ReqType::Unknown => unreachable!("request type determined above"),
        };

        match outcome {
            ParseOutcome::Complete => {}
            ParseOutcome::Incomplete => break,
            ParseOutcome::Error(err) => {
                if log_enabled!(Level::Debug) {
                    debug!(
                        "Protocol error from client: {}",
                        c.info_string(crate::client::unix_time())
                    );
                }
                c.add_reply_error(registry, &err.to_string());
                c.close_after_reply = true;
                break;
            }
        }

        if c.argv.is_empty() {
            // Empty multi-bulk or an all-blank inline line.
            c.reset();
        } else if dispatch.dispatch(c, registry) == CommandOutcome::Done {
            c.reset();
        } else {
            // The command took ownership of the continuation.
            break;
        }
    }
}
