//! Command Dispatcher
//!
//! Turns a decoded frame into a reply:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │                                                             │
//! │  ┌─────────────────┐   ┌──────────────┐   ┌─────────────┐  │
//! │  │ Command::       │──>│  execute()   │──>│   Reply     │  │
//! │  │   from_frame()  │   └──────┬───────┘   └─────────────┘  │
//! │  └─────────────────┘          │                            │
//! │                               ▼                            │
//! │                          dyn Store                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every failure, whether in validation or in storage, becomes an error
//! reply. Nothing here panics or closes connections.

use crate::commands::command::{Command, CommandError, SetCondition};
use crate::protocol::RespValue;
use crate::storage::Store;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Executes commands against a storage collaborator.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validates and executes one frame, returning the reply to send back.
    pub fn dispatch(&self, frame: RespValue) -> RespValue {
        match Command::from_frame(frame).and_then(|command| self.execute(command)) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "Command rejected");
                RespValue::error(e.to_string())
            }
        }
    }

    /// Executes an already validated command.
    pub fn execute(&self, command: Command) -> Result<RespValue, CommandError> {
        let store = self.store.as_ref();

        let reply = match command {
            Command::Ping(None) => RespValue::pong(),
            Command::Ping(Some(message)) | Command::Echo(message) => {
                RespValue::bulk_string(message)
            }

            Command::Get { key } => match store.get(&key) {
                Some(value) => RespValue::bulk_string(value),
                None => RespValue::null(),
            },

            Command::Set {
                key,
                value,
                expire,
                condition,
            } => {
                let skip = match condition {
                    SetCondition::Always => false,
                    SetCondition::IfAbsent => store.exists(&key),
                    SetCondition::IfPresent => !store.exists(&key),
                };
                if skip {
                    RespValue::null()
                } else {
                    store.set(key, value, expire)?;
                    RespValue::ok()
                }
            }

            Command::Del { keys } => {
                let deleted = keys.iter().filter(|key| store.delete(key)).count();
                RespValue::integer(deleted as i64)
            }

            Command::Exists { keys } => {
                let found = keys.iter().filter(|key| store.exists(key)).count();
                RespValue::integer(found as i64)
            }

            Command::IncrBy { key, delta } => RespValue::integer(store.incr_by(&key, delta)?),

            Command::Append { key, value } => {
                RespValue::integer(store.append(&key, &value)? as i64)
            }

            Command::Strlen { key } => {
                RespValue::integer(store.get(&key).map_or(0, |v| v.len()) as i64)
            }

            Command::MGet { keys } => RespValue::array(
                keys.iter()
                    .map(|key| match store.get(key) {
                        Some(value) => RespValue::bulk_string(value),
                        None => RespValue::null(),
                    })
                    .collect(),
            ),

            Command::MSet { pairs } => {
                // All or nothing: check room for every new key before writing
                let new_keys: HashSet<&Bytes> = pairs
                    .iter()
                    .map(|(key, _)| key)
                    .filter(|key| !store.exists(key))
                    .collect();
                store.ensure_capacity(new_keys.len())?;

                for (key, value) in pairs {
                    store.set(key, value, None)?;
                }
                RespValue::ok()
            }

            Command::DbSize => RespValue::integer(store.len() as i64),

            Command::FlushDb => {
                store.flush();
                RespValue::ok()
            }
        };

        Ok(reply)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("keys", &self.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn create_dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(MemoryStore::new()))
    }

    fn make_command(args: &[&str]) -> RespValue {
        RespValue::Array(
            args.iter()
                .map(|s| RespValue::bulk_string(Bytes::from(s.to_string())))
                .collect(),
        )
    }

    #[test]
    fn test_ping_and_echo() {
        let dispatcher = create_dispatcher();

        assert_eq!(dispatcher.dispatch(make_command(&["PING"])), RespValue::pong());
        assert_eq!(
            dispatcher.dispatch(make_command(&["PING", "hello"])),
            RespValue::bulk_string(Bytes::from("hello"))
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["ECHO", "hi"])),
            RespValue::bulk_string(Bytes::from("hi"))
        );
    }

    #[test]
    fn test_set_get() {
        let dispatcher = create_dispatcher();

        let response = dispatcher.dispatch(make_command(&["SET", "k", "v"]));
        assert_eq!(response, RespValue::ok());

        let response = dispatcher.dispatch(make_command(&["GET", "k"]));
        assert_eq!(response, RespValue::bulk_string(Bytes::from("v")));
    }

    #[test]
    fn test_get_missing_is_null_bulk_string() {
        let dispatcher = create_dispatcher();

        let response = dispatcher.dispatch(make_command(&["GET", "missing"]));
        assert_eq!(response, RespValue::null());
        assert_eq!(response.serialize(), b"$-1\r\n");
    }

    #[test]
    fn test_wrong_arity_is_an_error_reply() {
        let dispatcher = create_dispatcher();

        let response = dispatcher.dispatch(make_command(&["SET", "k"]));
        assert_eq!(
            response,
            RespValue::error("ERR wrong number of arguments for 'set' command")
        );
    }

    #[test]
    fn test_unknown_command() {
        let dispatcher = create_dispatcher();

        let response = dispatcher.dispatch(make_command(&["NOPE"]));
        assert_eq!(response, RespValue::error("ERR unknown command 'NOPE'"));
    }

    #[test]
    fn test_command_names_are_case_insensitive() {
        let dispatcher = create_dispatcher();

        dispatcher.dispatch(make_command(&["set", "k", "v"]));
        assert_eq!(
            dispatcher.dispatch(make_command(&["gEt", "k"])),
            RespValue::bulk_string(Bytes::from("v"))
        );
    }

    #[test]
    fn test_set_conditions() {
        let dispatcher = create_dispatcher();

        assert_eq!(
            dispatcher.dispatch(make_command(&["SET", "k", "v", "XX"])),
            RespValue::null()
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["SET", "k", "v", "NX"])),
            RespValue::ok()
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["SET", "k", "other", "NX"])),
            RespValue::null()
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["GET", "k"])),
            RespValue::bulk_string(Bytes::from("v"))
        );
    }

    #[test]
    fn test_set_with_expiry() {
        let dispatcher = create_dispatcher();

        dispatcher.dispatch(make_command(&["SET", "k", "v", "PX", "30"]));
        assert_eq!(
            dispatcher.dispatch(make_command(&["EXISTS", "k"])),
            RespValue::integer(1)
        );

        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(dispatcher.dispatch(make_command(&["GET", "k"])), RespValue::null());
    }

    #[test]
    fn test_del_and_exists_count_keys() {
        let dispatcher = create_dispatcher();

        dispatcher.dispatch(make_command(&["MSET", "k1", "v1", "k2", "v2"]));

        assert_eq!(
            dispatcher.dispatch(make_command(&["EXISTS", "k1", "k2", "k3"])),
            RespValue::integer(2)
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["DEL", "k1", "k2", "k3"])),
            RespValue::integer(2)
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["DBSIZE"])),
            RespValue::integer(0)
        );
    }

    #[test]
    fn test_mget() {
        let dispatcher = create_dispatcher();

        dispatcher.dispatch(make_command(&["SET", "a", "1"]));
        assert_eq!(
            dispatcher.dispatch(make_command(&["MGET", "a", "b"])),
            RespValue::array(vec![
                RespValue::bulk_string(Bytes::from("1")),
                RespValue::null(),
            ])
        );
    }

    #[test]
    fn test_counters() {
        let dispatcher = create_dispatcher();

        assert_eq!(dispatcher.dispatch(make_command(&["INCR", "n"])), RespValue::integer(1));
        assert_eq!(
            dispatcher.dispatch(make_command(&["INCRBY", "n", "10"])),
            RespValue::integer(11)
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["DECRBY", "n", "4"])),
            RespValue::integer(7)
        );
        assert_eq!(dispatcher.dispatch(make_command(&["DECR", "n"])), RespValue::integer(6));
    }

    #[test]
    fn test_execution_errors_are_replies() {
        let dispatcher = create_dispatcher();

        dispatcher.dispatch(make_command(&["SET", "text", "hello"]));
        assert_eq!(
            dispatcher.dispatch(make_command(&["INCR", "text"])),
            RespValue::error("ERR value is not an integer or out of range")
        );

        let bounded = Dispatcher::new(Arc::new(MemoryStore::with_max_keys(1)));
        assert_eq!(bounded.dispatch(make_command(&["SET", "a", "1"])), RespValue::ok());

        let response = bounded.dispatch(make_command(&["SET", "b", "2"]));
        assert!(response.is_error());
        assert!(matches!(&response, RespValue::Error(msg) if msg.starts_with("OOM")));
    }

    #[test]
    fn test_mset_over_key_limit_writes_nothing() {
        let dispatcher = Dispatcher::new(Arc::new(MemoryStore::with_max_keys(2)));
        assert_eq!(dispatcher.dispatch(make_command(&["SET", "a", "1"])), RespValue::ok());

        let response = dispatcher.dispatch(make_command(&["MSET", "a", "x", "b", "2", "c", "3"]));
        assert!(matches!(&response, RespValue::Error(msg) if msg.starts_with("OOM")));
        assert_eq!(dispatcher.dispatch(make_command(&["DBSIZE"])), RespValue::integer(1));
        assert_eq!(
            dispatcher.dispatch(make_command(&["GET", "a"])),
            RespValue::bulk_string(Bytes::from("1"))
        );

        // Overwrites and repeated keys need no extra room
        assert_eq!(
            dispatcher.dispatch(make_command(&["MSET", "a", "x", "b", "2", "b", "3"])),
            RespValue::ok()
        );
        assert_eq!(dispatcher.dispatch(make_command(&["DBSIZE"])), RespValue::integer(2));
    }

    #[test]
    fn test_huge_expire_time_is_an_error_reply() {
        let dispatcher = create_dispatcher();

        let response =
            dispatcher.dispatch(make_command(&["SET", "k", "v", "EX", "9223372036854775807"]));
        assert_eq!(
            response,
            RespValue::error("ERR invalid expire time for 'set' command")
        );
        assert_eq!(dispatcher.dispatch(make_command(&["EXISTS", "k"])), RespValue::integer(0));

        // The store refuses such deadlines on its own as well
        let store = MemoryStore::new();
        assert!(store
            .set(Bytes::from("k"), Bytes::from("v"), Some(Duration::MAX))
            .is_err());
    }

    #[test]
    fn test_expired_key_frees_its_slot() {
        let dispatcher = Dispatcher::new(Arc::new(MemoryStore::with_max_keys(1)));

        assert_eq!(
            dispatcher.dispatch(make_command(&["SET", "short", "v", "PX", "10"])),
            RespValue::ok()
        );
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(dispatcher.dispatch(make_command(&["SET", "next", "v"])), RespValue::ok());
    }

    #[test]
    fn test_append_and_strlen() {
        let dispatcher = create_dispatcher();

        assert_eq!(
            dispatcher.dispatch(make_command(&["APPEND", "k", "Hello"])),
            RespValue::integer(5)
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["APPEND", "k", " World"])),
            RespValue::integer(11)
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["STRLEN", "k"])),
            RespValue::integer(11)
        );
        assert_eq!(
            dispatcher.dispatch(make_command(&["STRLEN", "missing"])),
            RespValue::integer(0)
        );
    }

    #[test]
    fn test_flushdb() {
        let dispatcher = create_dispatcher();

        dispatcher.dispatch(make_command(&["MSET", "a", "1", "b", "2"]));
        assert_eq!(dispatcher.dispatch(make_command(&["FLUSHDB"])), RespValue::ok());
        assert_eq!(
            dispatcher.dispatch(make_command(&["DBSIZE"])),
            RespValue::integer(0)
        );
    }

    #[test]
    fn test_non_array_frame() {
        let dispatcher = create_dispatcher();

        let response = dispatcher.dispatch(RespValue::integer(42));
        assert_eq!(
            response,
            RespValue::error("ERR invalid request: expected an array")
        );
    }
}
