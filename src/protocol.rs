// Protocol module - line command parser
// One request is one line, already stripped of its trailing newline. The
// verb is matched exactly (senders uppercase it); the key may be quoted
// with " or ' to carry spaces; the value is the verbatim remainder with
// one symmetric quote pair stripped. Escapes are not interpreted.

use bytes::Bytes;

use crate::{KvError, Result};

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put { key: Bytes, value: Bytes },
    Get { key: Bytes },
    Delete { key: Bytes },
    Exists { key: Bytes },
    Size,
    Ping,
    Flush,
    Stats,
}

const ERR_FORMAT: &str = "Invalid command format";
const ERR_UNKNOWN: &str = "Unknown command";

/// Parse one request line into a [`Command`].
pub fn parse_command(line: &[u8]) -> Result<Command> {
    let (verb, rest) = match next_token(line) {
        Some(split) => split,
        None => return Err(KvError::Protocol(ERR_FORMAT)),
    };

    if verb == b"PUT" {
        let (key, rest) = parse_key(rest)?;
        let value = parse_value(rest);
        return Ok(Command::Put { key, value });
    }
    if verb == b"GET" {
        return Ok(Command::Get {
            key: parse_key(rest)?.0,
        });
    }
    if verb == b"DELETE" {
        return Ok(Command::Delete {
            key: parse_key(rest)?.0,
        });
    }
    if verb == b"EXISTS" {
        return Ok(Command::Exists {
            key: parse_key(rest)?.0,
        });
    }
    if verb == b"SIZE" {
        return Ok(Command::Size);
    }
    if verb == b"PING" {
        return Ok(Command::Ping);
    }
    if verb == b"FLUSH" {
        return Ok(Command::Flush);
    }
    if verb == b"STATS" {
        return Ok(Command::Stats);
    }
    Err(KvError::Protocol(ERR_UNKNOWN))
}

fn skip_whitespace(input: &[u8]) -> &[u8] {
    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len());
    &input[start..]
}

// Next whitespace-delimited token and the remainder after it.
fn next_token(input: &[u8]) -> Option<(&[u8], &[u8])> {
    let input = skip_whitespace(input);
    if input.is_empty() {
        return None;
    }
    let end = input
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(input.len());
    Some((&input[..end], &input[end..]))
}

// Key token: quoted keys run to the matching close quote; without one the
// key consumes the rest of the line. Keys must be non-empty.
fn parse_key(input: &[u8]) -> Result<(Bytes, &[u8])> {
    let input = skip_whitespace(input);

    let (key, rest): (&[u8], &[u8]) = match input.first() {
        Some(&quote) if quote == b'"' || quote == b'\'' => {
            let body = &input[1..];
            match body.iter().position(|&b| b == quote) {
                Some(end) => (&body[..end], &body[end + 1..]),
                None => (body, &[]),
            }
        }
        Some(_) => {
            let end = input
                .iter()
                .position(|b| b.is_ascii_whitespace())
                .unwrap_or(input.len());
            (&input[..end], &input[end..])
        }
        None => return Err(KvError::Protocol(ERR_FORMAT)),
    };

    if key.is_empty() {
        return Err(KvError::Protocol(ERR_FORMAT));
    }
    Ok((Bytes::copy_from_slice(key), rest))
}

// Value: the remainder after leading whitespace, verbatim. A leading and
// trailing quote of the same kind are stripped as a pair.
fn parse_value(input: &[u8]) -> Bytes {
    let input = skip_whitespace(input);
    if input.len() >= 2 {
        let first = input[0];
        if (first == b'"' || first == b'\'') && input[input.len() - 1] == first {
            return Bytes::copy_from_slice(&input[1..input.len() - 1]);
        }
    }
    Bytes::copy_from_slice(input)
}
