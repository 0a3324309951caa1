//! Typed Commands
//!
//! A decoded frame is turned into a [`Command`] before anything touches
//! storage. The set of commands is closed: every name the server accepts
//! appears once in [`COMMAND_TABLE`] together with its arity, and maps to
//! exactly one variant. Adding a command means adding a variant, which the
//! compiler then forces every `match` to handle.

use crate::protocol::RespValue;
use crate::storage::StoreError;
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Request-level failures. Each becomes an error reply; none of them
/// closes the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    Arity(&'static str),

    /// An argument could not be coerced to the type the command needs.
    #[error("ERR {reason} for '{command}' command")]
    Type {
        command: &'static str,
        reason: &'static str,
    },

    /// The frame is not a non-empty array naming a command.
    #[error("ERR invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("{0}")]
    Execution(#[from] StoreError),
}

/// Number of arguments a command takes, not counting its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Range(usize, usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(expected) => n == expected,
            Arity::AtLeast(min) => n >= min,
            Arity::Range(min, max) => (min..=max).contains(&n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ping,
    Echo,
    Get,
    Set,
    Del,
    Exists,
    Incr,
    Decr,
    IncrBy,
    DecrBy,
    Append,
    Strlen,
    MGet,
    MSet,
    DbSize,
    FlushDb,
}

/// One row of the command table.
#[derive(Debug)]
pub struct CommandSpec {
    /// Lowercase name, matched case-insensitively
    pub name: &'static str,
    pub kind: CommandKind,
    pub arity: Arity,
}

/// Every command the server understands.
pub const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec { name: "ping", kind: CommandKind::Ping, arity: Arity::Range(0, 1) },
    CommandSpec { name: "echo", kind: CommandKind::Echo, arity: Arity::Exact(1) },
    CommandSpec { name: "get", kind: CommandKind::Get, arity: Arity::Exact(1) },
    CommandSpec { name: "set", kind: CommandKind::Set, arity: Arity::AtLeast(2) },
    CommandSpec { name: "del", kind: CommandKind::Del, arity: Arity::AtLeast(1) },
    CommandSpec { name: "exists", kind: CommandKind::Exists, arity: Arity::AtLeast(1) },
    CommandSpec { name: "incr", kind: CommandKind::Incr, arity: Arity::Exact(1) },
    CommandSpec { name: "decr", kind: CommandKind::Decr, arity: Arity::Exact(1) },
    CommandSpec { name: "incrby", kind: CommandKind::IncrBy, arity: Arity::Exact(2) },
    CommandSpec { name: "decrby", kind: CommandKind::DecrBy, arity: Arity::Exact(2) },
    CommandSpec { name: "append", kind: CommandKind::Append, arity: Arity::Exact(2) },
    CommandSpec { name: "strlen", kind: CommandKind::Strlen, arity: Arity::Exact(1) },
    CommandSpec { name: "mget", kind: CommandKind::MGet, arity: Arity::AtLeast(1) },
    CommandSpec { name: "mset", kind: CommandKind::MSet, arity: Arity::AtLeast(2) },
    CommandSpec { name: "dbsize", kind: CommandKind::DbSize, arity: Arity::Exact(0) },
    CommandSpec { name: "flushdb", kind: CommandKind::FlushDb, arity: Arity::Exact(0) },
    CommandSpec { name: "flushall", kind: CommandKind::FlushDb, arity: Arity::Exact(0) },
];

/// Finds a command by name, ignoring ASCII case.
pub fn lookup(name: &[u8]) -> Option<&'static CommandSpec> {
    COMMAND_TABLE
        .iter()
        .find(|spec| spec.name.as_bytes().eq_ignore_ascii_case(name))
}

/// SET's NX / XX switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// NX: only set if the key does not exist
    IfAbsent,
    /// XX: only set if the key already exists
    IfPresent,
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Get {
        key: Bytes,
    },
    Set {
        key: Bytes,
        value: Bytes,
        expire: Option<Duration>,
        condition: SetCondition,
    },
    Del {
        keys: Vec<Bytes>,
    },
    Exists {
        keys: Vec<Bytes>,
    },
    /// INCR, DECR, INCRBY and DECRBY
    IncrBy {
        key: Bytes,
        delta: i64,
    },
    Append {
        key: Bytes,
        value: Bytes,
    },
    Strlen {
        key: Bytes,
    },
    MGet {
        keys: Vec<Bytes>,
    },
    MSet {
        pairs: Vec<(Bytes, Bytes)>,
    },
    DbSize,
    FlushDb,
}

impl Command {
    /// Validates a decoded frame and builds the matching command.
    ///
    /// The frame must be a non-null array whose first element names the
    /// command.
    pub fn from_frame(frame: RespValue) -> Result<Command, CommandError> {
        let items = match frame {
            RespValue::Array(items) => items,
            RespValue::NullArray => return Err(CommandError::InvalidRequest("null array")),
            _ => return Err(CommandError::InvalidRequest("expected an array")),
        };

        let mut items = items.into_iter();
        let name = match items.next() {
            Some(RespValue::BulkString(name)) => name,
            Some(RespValue::SimpleString(name)) => Bytes::from(name),
            Some(_) => {
                return Err(CommandError::InvalidRequest(
                    "command name must be a bulk string",
                ))
            }
            None => return Err(CommandError::InvalidRequest("empty command")),
        };

        let spec = lookup(&name).ok_or_else(|| {
            CommandError::UnknownCommand(String::from_utf8_lossy(&name).into_owned())
        })?;

        let args: Vec<RespValue> = items.collect();
        if !spec.arity.accepts(args.len()) {
            return Err(CommandError::Arity(spec.name));
        }

        Args::new(spec.name, args).build(spec.kind)
    }
}

/// Remaining arguments of one request, consumed front to back.
struct Args {
    command: &'static str,
    items: std::vec::IntoIter<RespValue>,
}

impl Args {
    fn new(command: &'static str, items: Vec<RespValue>) -> Self {
        Self {
            command,
            items: items.into_iter(),
        }
    }

    fn type_error(&self, reason: &'static str) -> CommandError {
        CommandError::Type {
            command: self.command,
            reason,
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    /// Next argument as raw bytes. Null is rejected.
    fn bytes(&mut self) -> Result<Bytes, CommandError> {
        match self.items.next() {
            Some(RespValue::BulkString(b)) => Ok(b),
            Some(RespValue::SimpleString(s)) => Ok(Bytes::from(s)),
            Some(RespValue::Integer(n)) => Ok(Bytes::from(n.to_string())),
            Some(RespValue::Null) => Err(self.type_error("null argument")),
            Some(_) => Err(self.type_error("argument must be a bulk string")),
            None => Err(CommandError::Arity(self.command)),
        }
    }

    fn integer(&mut self) -> Result<i64, CommandError> {
        let raw = match self.items.next() {
            Some(RespValue::Integer(n)) => return Ok(n),
            Some(RespValue::BulkString(b)) => b,
            Some(_) => return Err(self.type_error("value is not an integer or out of range")),
            None => return Err(CommandError::Arity(self.command)),
        };

        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.type_error("value is not an integer or out of range"))
    }

    /// Every remaining argument as raw bytes.
    fn rest(&mut self) -> Result<Vec<Bytes>, CommandError> {
        let mut out = Vec::with_capacity(self.len());
        while self.len() > 0 {
            out.push(self.bytes()?);
        }
        Ok(out)
    }

    fn build(mut self, kind: CommandKind) -> Result<Command, CommandError> {
        let command = match kind {
            CommandKind::Ping => Command::Ping(match self.len() {
                0 => None,
                _ => Some(self.bytes()?),
            }),
            CommandKind::Echo => Command::Echo(self.bytes()?),
            CommandKind::Get => Command::Get { key: self.bytes()? },
            CommandKind::Set => self.set()?,
            CommandKind::Del => Command::Del { keys: self.rest()? },
            CommandKind::Exists => Command::Exists { keys: self.rest()? },
            CommandKind::Incr => Command::IncrBy {
                key: self.bytes()?,
                delta: 1,
            },
            CommandKind::Decr => Command::IncrBy {
                key: self.bytes()?,
                delta: -1,
            },
            CommandKind::IncrBy => Command::IncrBy {
                key: self.bytes()?,
                delta: self.integer()?,
            },
            CommandKind::DecrBy => {
                let key = self.bytes()?;
                let delta = self
                    .integer()?
                    .checked_neg()
                    .ok_or_else(|| self.type_error("decrement would overflow"))?;
                Command::IncrBy { key, delta }
            }
            CommandKind::Append => Command::Append {
                key: self.bytes()?,
                value: self.bytes()?,
            },
            CommandKind::Strlen => Command::Strlen { key: self.bytes()? },
            CommandKind::MGet => Command::MGet { keys: self.rest()? },
            CommandKind::MSet => {
                if self.len() % 2 != 0 {
                    return Err(CommandError::Arity(self.command));
                }
                let mut pairs = Vec::with_capacity(self.len() / 2);
                while self.len() > 0 {
                    pairs.push((self.bytes()?, self.bytes()?));
                }
                Command::MSet { pairs }
            }
            CommandKind::DbSize => Command::DbSize,
            CommandKind::FlushDb => Command::FlushDb,
        };
        Ok(command)
    }

    /// SET key value [EX seconds | PX milliseconds] [NX | XX]
    fn set(&mut self) -> Result<Command, CommandError> {
        let key = self.bytes()?;
        let value = self.bytes()?;
        let mut expire = None;
        let mut condition = SetCondition::Always;

        while self.len() > 0 {
            let option = self.bytes()?;
            let option = option.to_ascii_uppercase();

            match option.as_slice() {
                b"EX" | b"PX" if expire.is_none() => {
                    if self.len() == 0 {
                        return Err(self.type_error("syntax error"));
                    }
                    let amount = self.integer()?;
                    if amount <= 0 {
                        return Err(self.type_error("invalid expire time"));
                    }
                    let ttl = if option == b"EX" {
                        Duration::from_secs(amount as u64)
                    } else {
                        Duration::from_millis(amount as u64)
                    };
                    // Must be representable as a deadline
                    if Instant::now().checked_add(ttl).is_none() {
                        return Err(self.type_error("invalid expire time"));
                    }
                    expire = Some(ttl);
                }
                b"NX" if condition == SetCondition::Always => condition = SetCondition::IfAbsent,
                b"XX" if condition == SetCondition::Always => condition = SetCondition::IfPresent,
                _ => return Err(self.type_error("syntax error")),
            }
        }

        Ok(Command::Set {
            key,
            value,
            expire,
            condition,
        })
    }
}
