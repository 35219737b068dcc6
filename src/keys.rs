//! Command-to-key-position table.
//!
//! Key expansion ([`crate::template`]) must only ever rewrite the arguments
//! that the store treats as keys. Which positions those are depends on the
//! command, so the mapping lives here as data: one static table from command
//! name to a [`KeyRule`], consulted case-insensitively. Adding a command is a
//! table edit, not new control flow.
//!
//! Positions are 1-based over the argument list: position 1 is the first
//! argument after the command name. `key_indexes` never returns a position
//! outside `[1, args.len()]`.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::warn;

/// How key positions are derived from an argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyRule {
    /// The key is argument 1 (`GET key`, `HSET key field value`, ...).
    First,
    /// Every argument is a key (`MGET k1 k2 ...`, `DEL k1 k2 ...`).
    All,
    /// Keys at odd positions 1, 3, 5, ... with values interleaved
    /// (`MSET k1 v1 k2 v2`).
    Odd,
    /// Every argument except the trailing timeout (`BLPOP k1 k2 timeout`).
    AllButLast,
    /// Arguments 1 and 2 (`SMOVE source destination member`).
    FirstTwo,
    /// Every argument from position 2 onward (`BITOP op dest k1 k2 ...`).
    FromSecond,
    /// Argument 2 is a key count `n`; keys occupy positions 3 through
    /// `2 + n` (`EVAL script n k1 .. kn arg ...`).
    NumkeysAtTwo,
    /// The command takes no keys (`PING`, `AUTH`, `SELECT`, ...).
    None,
}

/// (rule, commands) groups; flattened into the lookup map on first use.
static RULES: &[(KeyRule, &[&str])] = &[
    (
        KeyRule::First,
        &[
            "GET", "SET", "SETEX", "PSETEX", "SETNX", "GETSET", "GETDEL", "GETEX", "GETRANGE",
            "SETRANGE", "STRLEN", "APPEND", "INCR", "DECR", "INCRBY", "DECRBY", "INCRBYFLOAT",
            "EXPIRE", "PEXPIRE", "EXPIREAT", "PEXPIREAT", "TTL", "PTTL", "PERSIST", "TYPE",
            "DUMP", "SETBIT", "GETBIT", "BITCOUNT", "BITPOS", "BITFIELD", "HGET", "HSET",
            "HSETNX", "HDEL", "HGETALL", "HKEYS", "HVALS", "HLEN", "HEXISTS", "HINCRBY",
            "HINCRBYFLOAT", "HMGET", "HMSET", "HSCAN", "LPUSH", "RPUSH", "LPUSHX", "RPUSHX",
            "LPOP", "RPOP", "LLEN", "LINDEX", "LRANGE", "LREM", "LSET", "LTRIM", "SADD",
            "SREM", "SMEMBERS", "SISMEMBER", "SCARD", "SPOP", "SRANDMEMBER", "SSCAN", "ZADD",
            "ZCARD", "ZCOUNT", "ZINCRBY", "ZRANGE", "ZREVRANGE", "ZRANGEBYSCORE", "ZRANK",
            "ZREM", "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE", "ZSCORE", "ZSCAN", "PFADD",
        ],
    ),
    (
        KeyRule::All,
        &[
            "MGET", "EXISTS", "DEL", "UNLINK", "TOUCH", "PFMERGE", "PFCOUNT", "SUNION",
            "SUNIONSTORE", "SINTER", "SINTERSTORE", "SDIFF", "SDIFFSTORE", "RENAME",
            "RENAMENX", "RPOPLPUSH",
        ],
    ),
    (KeyRule::Odd, &["MSET", "MSETNX"]),
    (KeyRule::AllButLast, &["BLPOP", "BRPOP", "BRPOPLPUSH"]),
    (KeyRule::FirstTwo, &["SMOVE"]),
    (KeyRule::FromSecond, &["BITOP"]),
    (
        KeyRule::NumkeysAtTwo,
        &["EVAL", "EVALSHA", "ZUNIONSTORE", "ZINTERSTORE"],
    ),
    (
        KeyRule::None,
        &[
            "PING", "ECHO", "AUTH", "SELECT", "QUIT", "MULTI", "EXEC", "DISCARD", "UNWATCH",
            "INFO", "DBSIZE", "TIME", "WAIT", "SCAN", "RANDOMKEY", "SCRIPT", "FLUSHDB",
            "FLUSHALL", "PUBLISH", "SUBSCRIBE", "UNSUBSCRIBE",
        ],
    ),
];

fn rule_table() -> &'static HashMap<&'static str, KeyRule> {
    static TABLE: OnceLock<HashMap<&'static str, KeyRule>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        for (rule, names) in RULES {
            for name in *names {
                table.insert(*name, *rule);
            }
        }
        table
    })
}

/// 1-based positions of the key arguments of `command`.
///
/// Unknown commands log a warning and yield no positions, so dispatch
/// proceeds without templating that command's arguments.
pub fn key_indexes(command: &str, args: &[String]) -> Vec<usize> {
    let upper = command.to_ascii_uppercase();
    let rule = match rule_table().get(upper.as_str()) {
        Some(rule) => *rule,
        None => {
            warn!(command, "no key-index rule for command, skipping key expansion");
            return Vec::new();
        }
    };

    let len = args.len();
    match rule {
        KeyRule::First => {
            if len >= 1 {
                vec![1]
            } else {
                Vec::new()
            }
        }
        KeyRule::All => (1..=len).collect(),
        KeyRule::Odd => (1..=len).step_by(2).collect(),
        KeyRule::AllButLast => {
            if len >= 2 {
                (1..len).collect()
            } else {
                Vec::new()
            }
        }
        KeyRule::FirstTwo => (1..=len.min(2)).collect(),
        KeyRule::FromSecond => {
            if len >= 2 {
                (2..=len).collect()
            } else {
                Vec::new()
            }
        }
        KeyRule::NumkeysAtTwo => {
            if len < 2 {
                return Vec::new();
            }
            let numkeys = args[1].parse::<usize>().unwrap_or(0);
            if numkeys < 1 {
                return Vec::new();
            }
            // Clamp to the arguments actually present.
            (3..=(2 + numkeys).min(len)).collect()
        }
        KeyRule::None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_key_commands() {
        assert_eq!(key_indexes("GET", &args(&["k"])), vec![1]);
        assert_eq!(key_indexes("set", &args(&["k", "v"])), vec![1]);
        assert_eq!(key_indexes("HGET", &args(&["k", "f"])), vec![1]);
        assert_eq!(key_indexes("ZADD", &args(&["k", "1", "m"])), vec![1]);
    }

    #[test]
    fn every_argument_is_a_key() {
        assert_eq!(key_indexes("MGET", &args(&["a", "b", "c"])), vec![1, 2, 3]);
        assert_eq!(key_indexes("del", &args(&["a", "b"])), vec![1, 2]);
        assert_eq!(key_indexes("EXISTS", &args(&[])), Vec::<usize>::new());
    }

    #[test]
    fn mset_keys_are_odd_positions() {
        assert_eq!(
            key_indexes("mset", &args(&["k1", "v1", "k2", "v2"])),
            vec![1, 3]
        );
        assert_eq!(key_indexes("MSETNX", &args(&["k1", "v1"])), vec![1]);
    }

    #[test]
    fn blocking_pops_exclude_the_timeout() {
        assert_eq!(key_indexes("BLPOP", &args(&["k1", "k2", "5"])), vec![1, 2]);
        assert_eq!(
            key_indexes("BRPOPLPUSH", &args(&["src", "dst", "0"])),
            vec![1, 2]
        );
        assert_eq!(key_indexes("BLPOP", &args(&["5"])), Vec::<usize>::new());
    }

    #[test]
    fn eval_numkeys_window() {
        assert_eq!(
            key_indexes("eval", &args(&["script", "2", "k1", "k2", "arg"])),
            vec![3, 4]
        );
        assert_eq!(
            key_indexes("EVALSHA", &args(&["sha", "0", "arg"])),
            Vec::<usize>::new()
        );
        // numkeys larger than the argument list clamps.
        assert_eq!(key_indexes("EVAL", &args(&["s", "5", "k1"])), vec![3]);
        assert_eq!(
            key_indexes("ZUNIONSTORE", &args(&["dest", "2", "a", "b"])),
            vec![3, 4]
        );
    }

    #[test]
    fn fixed_and_ranged_positions() {
        assert_eq!(key_indexes("SMOVE", &args(&["s", "d", "m"])), vec![1, 2]);
        assert_eq!(
            key_indexes("BITOP", &args(&["AND", "dest", "a", "b"])),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn keyless_and_unknown_commands() {
        assert_eq!(key_indexes("PING", &args(&[])), Vec::<usize>::new());
        assert_eq!(key_indexes("AUTH", &args(&["pw"])), Vec::<usize>::new());
        assert_eq!(
            key_indexes("NOSUCHCMD", &args(&["a", "b"])),
            Vec::<usize>::new()
        );
    }

    #[test]
    fn positions_stay_in_bounds() {
        for (cmd, argv) in [
            ("MGET", vec!["a", "b", "c"]),
            ("MSET", vec!["k", "v", "k2", "v2"]),
            ("EVAL", vec!["s", "9", "k"]),
            ("BITOP", vec!["XOR", "d", "a"]),
            ("BLPOP", vec!["k", "1"]),
        ] {
            let argv = args(&argv);
            for idx in key_indexes(cmd, &argv) {
                assert!(idx >= 1 && idx <= argv.len(), "{cmd}: {idx} out of range");
            }
        }
    }
}
