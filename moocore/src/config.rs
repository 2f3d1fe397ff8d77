//! The option table and the configuration file parser.
//!
//! Options live as typed fields on the `World`; this module provides the
//! keyed accessor table over them, with per-key validation, and the
//! line-oriented `key = value` file format with `#` comments.

use std::fs;
use std::path::Path;

use crate::auth::AuthSecret;
use crate::shared::{StartupError, EXIT_CONFIGERR, EXIT_NOSUCHWORLD};
use crate::util;
use crate::world::{World, WLD_REBINDPORT};

/// Where a get/set request originates. Some keys behave differently for
/// the configuration file and for a connected user.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AccessSrc {
    File,
    User,
}

/// Outcome of a set request.
#[derive(Debug, Eq, PartialEq)]
pub enum SetOutcome {
    Ok,
    /// No such key.
    NotFound,
    /// The key may not be written from this source.
    ReadOnly,
    /// The value failed validation; the message says why.
    Bad(String),
}

/// Outcome of a get request.
#[derive(Debug, Eq, PartialEq)]
pub enum GetOutcome {
    Value(String),
    NotFound,
    ReadOnly,
}

struct KeyDef {
    name: &'static str,
    hidden: bool,
    setter: fn(&mut World, &str, AccessSrc) -> SetOutcome,
    getter: fn(&World, AccessSrc) -> GetOutcome,
}

static KEY_DB: &[KeyDef] = &[
    KeyDef {
        name: "listenport",
        hidden: false,
        setter: set_listenport,
        getter: get_listenport,
    },
    KeyDef {
        name: "authstring",
        hidden: false,
        setter: set_authstring,
        getter: get_authstring,
    },
    KeyDef {
        name: "host",
        hidden: false,
        setter: set_dest_host,
        getter: get_dest_host,
    },
    KeyDef {
        name: "port",
        hidden: false,
        setter: set_dest_port,
        getter: get_dest_port,
    },
    KeyDef {
        name: "autoreconnect",
        hidden: false,
        setter: set_autoreconnect,
        getter: get_autoreconnect,
    },
    KeyDef {
        name: "commandstring",
        hidden: false,
        setter: set_commandstring,
        getter: get_commandstring,
    },
    KeyDef {
        name: "infostring",
        hidden: false,
        setter: set_infostring,
        getter: get_infostring,
    },
    KeyDef {
        name: "logging_enabled",
        hidden: false,
        setter: set_logging_enabled,
        getter: get_logging_enabled,
    },
    KeyDef {
        name: "context_on_connect",
        hidden: false,
        setter: set_context_on_connect,
        getter: get_context_on_connect,
    },
    KeyDef {
        name: "max_buffered_size",
        hidden: false,
        setter: set_max_buffered_size,
        getter: get_max_buffered_size,
    },
    KeyDef {
        name: "max_history_size",
        hidden: false,
        setter: set_max_history_size,
        getter: get_max_history_size,
    },
    KeyDef {
        name: "strict_commands",
        hidden: false,
        setter: set_strict_commands,
        getter: get_strict_commands,
    },
];

/// Names of all non-hidden keys, in table order.
pub fn key_list() -> Vec<&'static str> {
    KEY_DB
        .iter()
        .filter(|k| !k.hidden)
        .map(|k| k.name)
        .collect()
}

/// Set a key on behalf of the user.
pub fn set_key(wld: &mut World, key: &str, value: &str) -> SetOutcome {
    set_key_internal(wld, key, value, AccessSrc::User)
}

/// Get a key on behalf of the user.
pub fn get_key(wld: &World, key: &str) -> GetOutcome {
    get_key_internal(wld, key, AccessSrc::User)
}

fn set_key_internal(wld: &mut World, key: &str, value: &str, src: AccessSrc) -> SetOutcome {
    for def in KEY_DB {
        if def.name == key {
            if def.hidden {
                return SetOutcome::NotFound;
            }
            return (def.setter)(wld, value, src);
        }
    }

    SetOutcome::NotFound
}

fn get_key_internal(wld: &World, key: &str, src: AccessSrc) -> GetOutcome {
    for def in KEY_DB {
        if def.name == key {
            if def.hidden {
                return GetOutcome::NotFound;
            }
            return (def.getter)(wld, src);
        }
    }

    GetOutcome::NotFound
}

/// Apply a configuration file's contents. Problems are reported with the
/// file name and line number.
pub fn load_config_str(wld: &mut World, contents: &str, path: &str) -> Result<(), StartupError> {
    for (idx, raw) in contents.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let sep = match line.find('=') {
            Some(sep) => sep,
            None => {
                return Err(StartupError::new(
                    EXIT_CONFIGERR,
                    format!("{}: line {}, parse error: `{}'", path, lineno, line),
                ))
            }
        };

        let key = line[..sep].trim();
        let value = util::remove_enclosing_quotes(line[sep + 1..].trim());

        match set_key_internal(wld, key, value, AccessSrc::File) {
            SetOutcome::Ok => {}
            SetOutcome::NotFound => {
                return Err(StartupError::new(
                    EXIT_CONFIGERR,
                    format!("{}: line {}: unknown key `{}'", path, lineno, key),
                ))
            }
            SetOutcome::ReadOnly => {
                return Err(StartupError::new(
                    EXIT_CONFIGERR,
                    format!(
                        "{}: line {}: setting key `{}' not allowed.",
                        path, lineno, key
                    ),
                ))
            }
            SetOutcome::Bad(msg) => {
                return Err(StartupError::new(
                    EXIT_CONFIGERR,
                    format!("{}: line {}: setting key `{}': {}", path, lineno, key, msg),
                ))
            }
        }
    }

    Ok(())
}

/// Load the world's configuration file from disk.
pub fn load_config_file(wld: &mut World, path: &Path) -> Result<(), StartupError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        StartupError::new(
            EXIT_NOSUCHWORLD,
            format!(
                "Error opening `{}': {}\nNo such world `{}'",
                path.display(),
                err,
                wld.name
            ),
        )
    })?;

    load_config_str(wld, &contents, &path.display().to_string())
}

/* Typed helpers. */

fn parse_long(src: &str) -> Result<i64, String> {
    const BAD: &str = "Integers must be simple decimal or hexadecimal numbers.";

    let (negative, digits) = match src.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, src.strip_prefix('+').unwrap_or(src)),
    };

    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse::<i64>()
    }
    .map_err(|_| BAD.to_owned())?;

    Ok(if negative { -value } else { value })
}

fn parse_ranged(src: &str, low: i64, high: i64, name: &str) -> Result<i64, String> {
    let value = parse_long(src)?;

    if value >= low && value <= high {
        return Ok(value);
    }

    if low == 0 && high == i64::MAX {
        Err(format!("{} must be a positive number.", name))
    } else {
        Err(format!(
            "{} must be between {} and {} inclusive.",
            name, low, high
        ))
    }
}

fn parse_bool(src: &str) -> Result<bool, String> {
    util::true_or_false(src)
        .ok_or_else(|| "Booleans must be true/yes/on/1 or false/no/off/0.".to_owned())
}

fn parse_size(src: &str, name: &str) -> Result<usize, String> {
    parse_ranged(src, 0, i64::MAX, name).map(|v| v as usize)
}

/* Setters and getters, one pair per key. */

fn set_listenport(wld: &mut World, value: &str, src: AccessSrc) -> SetOutcome {
    let port = match parse_ranged(value, 1, 65535, "Port numbers") {
        Ok(v) => v as u16,
        Err(msg) => return SetOutcome::Bad(msg),
    };

    match src {
        AccessSrc::File => wld.listenport = Some(port),
        AccessSrc::User => {
            // The actual rebind happens at the end of the loop pass.
            wld.requested_listenport = Some(port);
            wld.flags |= WLD_REBINDPORT;
        }
    }

    SetOutcome::Ok
}

fn get_listenport(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(
        wld.listenport
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-1".to_owned()),
    )
}

fn set_authstring(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    if value.is_empty() {
        return SetOutcome::Bad("The authstring may not be empty.".to_owned());
    }

    wld.auth = AuthSecret::from_config(value);
    SetOutcome::Ok
}

fn get_authstring(_wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::ReadOnly
}

fn set_dest_host(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    wld.dest_host = Some(value.to_owned());
    SetOutcome::Ok
}

fn get_dest_host(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(wld.dest_host.clone().unwrap_or_default())
}

fn set_dest_port(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    match parse_ranged(value, 1, 65535, "Port numbers") {
        Ok(v) => {
            wld.dest_port = Some(v as u16);
            SetOutcome::Ok
        }
        Err(msg) => SetOutcome::Bad(msg),
    }
}

fn get_dest_port(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(
        wld.dest_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-1".to_owned()),
    )
}

fn set_autoreconnect(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    match parse_bool(value) {
        Ok(v) => {
            wld.autoreconnect = v;
            SetOutcome::Ok
        }
        Err(msg) => SetOutcome::Bad(msg),
    }
}

fn get_autoreconnect(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(bool_str(wld.autoreconnect))
}

fn set_commandstring(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    wld.commandstring = value.to_owned();
    SetOutcome::Ok
}

fn get_commandstring(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(wld.commandstring.clone())
}

fn set_infostring(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    wld.infostring = value.to_owned();
    SetOutcome::Ok
}

fn get_infostring(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(wld.infostring.clone())
}

fn set_logging_enabled(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    match parse_bool(value) {
        Ok(v) => {
            wld.logging_enabled = v;
            wld.reinit_mudlog();
            SetOutcome::Ok
        }
        Err(msg) => SetOutcome::Bad(msg),
    }
}

fn get_logging_enabled(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(bool_str(wld.logging_enabled))
}

fn set_context_on_connect(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    match parse_size(value, "Context on connect") {
        Ok(v) => {
            wld.context_on_connect = v;
            SetOutcome::Ok
        }
        Err(msg) => SetOutcome::Bad(msg),
    }
}

fn get_context_on_connect(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(wld.context_on_connect.to_string())
}

fn set_max_buffered_size(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    match parse_size(value, "Max buffered size") {
        Ok(v) => {
            wld.max_buffered_size = v;
            SetOutcome::Ok
        }
        Err(msg) => SetOutcome::Bad(msg),
    }
}

fn get_max_buffered_size(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(wld.max_buffered_size.to_string())
}

fn set_max_history_size(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    match parse_size(value, "Max history size") {
        Ok(v) => {
            wld.max_history_size = v;
            SetOutcome::Ok
        }
        Err(msg) => SetOutcome::Bad(msg),
    }
}

fn get_max_history_size(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(wld.max_history_size.to_string())
}

fn set_strict_commands(wld: &mut World, value: &str, _src: AccessSrc) -> SetOutcome {
    match parse_bool(value) {
        Ok(v) => {
            wld.strict_commands = v;
            SetOutcome::Ok
        }
        Err(msg) => SetOutcome::Bad(msg),
    }
}

fn get_strict_commands(wld: &World, _src: AccessSrc) -> GetOutcome {
    GetOutcome::Value(bool_str(wld.strict_commands))
}

fn bool_str(value: bool) -> String {
    if value { "true" } else { "false" }.to_owned()
}
