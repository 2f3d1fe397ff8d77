//! The in-band command language: lines from the client that start with
//! the configured command prefix are dispatched here.

use crate::config::{self, GetOutcome, SetOutcome};
use crate::line::Line;
use crate::mcp;
use crate::recall;
use crate::util;
use crate::world::{World, WLD_CLIENTQUIT, WLD_SERVERQUIT, WLD_SERVERRESOLVE, WLD_SHUTDOWN};

const VERSIONSTR: &str = env!("CARGO_PKG_VERSION");

type CmdFunc = fn(&mut World, &str, &str);

static COMMAND_DB: &[(&str, CmdFunc)] = &[
    ("help", command_help),
    ("quit", command_quit),
    ("shutdown", command_shutdown),
    ("connect", command_connect),
    ("disconnect", command_disconnect),
    ("listopts", command_listopts),
    ("getopt", command_getopt),
    ("setopt", command_setopt),
    ("recall", command_recall),
    ("mcpreset", command_mcpreset),
    ("version", command_version),
    ("date", command_date),
    ("uptime", command_uptime),
    ("world", command_world),
];

static HELP_TEXT: &[&str] = &[
    "Commands:",
    "  help                       Show this help message.",
    "  quit                       Disconnect from mooproxy.",
    "  shutdown                   Shut down the mooproxy.",
    "  connect [<host> [<port>]]  Connect to the server. If the arguments are",
    "                               given, use those instead of the set options.",
    "  disconnect                 Disconnect from the server.",
    "  listopts                   List the available option names.",
    "  getopt <option>            Query the value of one option.",
    "  setopt <option> <value>    Set the value of one option.",
    "  recall [<count>]           Recall lines; see the recall query language.",
    "  mcpreset                   Send an MCP reset to the server.",
    "  version                    Show the mooproxy version.",
    "  date                       Show the current time and date.",
    "  uptime                     Show mooproxy's starting time and uptime.",
    "  world                      Print the name of the current world.",
];

/// Try to interpret a client line as a command. Returns true if the line
/// was consumed (a recognized command ran, or strict mode rejected it);
/// false means the caller should treat the line as regular traffic.
pub fn do_command(wld: &mut World, line: &Line) -> bool {
    let text = String::from_utf8_lossy(&line.text).into_owned();
    let commandstring = wld.commandstring.clone();

    let rest = match text.strip_prefix(&commandstring) {
        Some(rest) => rest,
        None => return false,
    };

    // Separate the command word from its arguments.
    let cmd_end = rest
        .find(char::is_whitespace)
        .unwrap_or_else(|| rest.len());
    let cmd = &rest[..cmd_end];

    let mut tail = rest[cmd_end..].chars();
    tail.next();
    let args = tail.as_str().trim_end_matches(|c| c == '\r' || c == '\n');

    match COMMAND_DB.iter().find(|(name, _)| *name == cmd) {
        Some((_, func)) => {
            func(wld, cmd, args);
            true
        }
        None => {
            if wld.strict_commands {
                wld.msg_client(&format!("Invalid command: `{}'.", cmd));
                true
            } else {
                false
            }
        }
    }
}

/// Commands that take no arguments refuse non-whitespace trailing text.
fn refuse_arguments(wld: &mut World, cmd: &str, args: &str) -> bool {
    if args.chars().any(|c| !c.is_whitespace()) {
        wld.msg_client(&format!("The command `{}' does not take arguments.", cmd));
        return true;
    }

    false
}

fn command_help(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    for line in HELP_TEXT {
        wld.msg_client(line);
    }
}

fn command_quit(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    wld.msg_client("Closing connection.");
    wld.flags |= WLD_CLIENTQUIT;
}

fn command_shutdown(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    wld.checkpoint_client("Shutting down.");
    wld.flags |= WLD_SHUTDOWN;
}

fn command_connect(wld: &mut World, _cmd: &str, args: &str) {
    if wld.server.is_connected() {
        wld.msg_client("Already connected.");
        return;
    }
    if wld.server.is_connecting() {
        wld.msg_client("Already connecting.");
        return;
    }

    // A second connect while resolving supersedes the first attempt.
    wld.cancel_resolve();

    let mut args = args;
    let host_override = util::get_one_word(&mut args).map(str::to_owned);
    let port_word = util::get_one_word(&mut args).map(str::to_owned);

    // Overrides are for this attempt only; the saved options stay as
    // they are.
    let host = match host_override.or_else(|| wld.dest_host.clone()) {
        Some(host) => host,
        None => {
            wld.msg_client("No hostname to connect to.");
            return;
        }
    };

    let port = match port_word {
        Some(word) => match word.parse::<u16>() {
            Ok(port) if port > 0 => Some(port),
            _ => {
                wld.msg_client(&format!("Invalid port `{}'.", word));
                return;
            }
        },
        None => wld.dest_port,
    };
    let port = match port {
        Some(port) => port,
        None => {
            wld.msg_client("No port number to connect to.");
            return;
        }
    };

    wld.server.host = Some(host);
    wld.server.port = Some(port);
    wld.server.reconnect_enabled = true;
    wld.flags |= WLD_SERVERRESOLVE;
}

fn command_disconnect(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    if wld.server.is_connected() {
        wld.checkpoint_client("Disconnected.");
    } else {
        wld.msg_client("Not connected, so cannot disconnect.");
    }

    // A user disconnect also stops any reconnect cycle.
    wld.server.reconnect_enabled = false;
    wld.flags |= WLD_SERVERQUIT;
}

fn command_listopts(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    wld.msg_client("Options:");

    let mut line = String::from("   ");
    for key in config::key_list() {
        if line.len() + key.len() > 65 {
            wld.msg_client(&line);
            line = String::from("   ");
        }
        line.push_str(key);
        line.push_str(", ");
    }

    // The final ", " becomes ".".
    line.truncate(line.len() - 2);
    line.push('.');
    wld.msg_client(&line);
}

fn command_getopt(wld: &mut World, _cmd: &str, args: &str) {
    let key = args.trim();

    if key.is_empty() {
        wld.msg_client("Use: getopt <option>");
        return;
    }

    let reply = match config::get_key(wld, key) {
        GetOutcome::Value(value) => format!("The option `{}' is `{}'.", key, value),
        GetOutcome::NotFound => format!("No such option, `{}'.", key),
        GetOutcome::ReadOnly => format!("The option `{}' cannot be read.", key),
    };
    wld.msg_client(&reply);
}

fn command_setopt(wld: &mut World, _cmd: &str, args: &str) {
    let args = args.trim();

    let sep = match args.find(char::is_whitespace) {
        Some(sep) => sep,
        None => {
            wld.msg_client("Use: setopt <option> <value>");
            return;
        }
    };
    let key = &args[..sep];
    let value = util::remove_enclosing_quotes(args[sep..].trim_start());

    let reply = match config::set_key(wld, key, value) {
        SetOutcome::Ok => {
            // Report the value as the option now reads back, falling
            // back to what was submitted for write-only keys.
            let shown = match config::get_key(wld, key) {
                GetOutcome::Value(value) => value,
                _ => value.to_owned(),
            };
            format!("The option `{}' is now `{}'.", key, shown)
        }
        SetOutcome::NotFound => format!("No such option, `{}'.", key),
        SetOutcome::ReadOnly => format!("The option `{}' cannot be written.", key),
        SetOutcome::Bad(msg) => msg,
    };
    wld.msg_client(&reply);
}

fn command_recall(wld: &mut World, _cmd: &str, args: &str) {
    let now = util::current_time();
    let trimmed = args.trim();

    if trimmed.is_empty() {
        wld.msg_client(&format!(
            "{} lines in history, using {} bytes.",
            wld.history.count(),
            wld.history.length()
        ));
        return;
    }

    // A bare positive count replays the newest lines directly.
    if let Ok(count) = trimmed.parse::<usize>() {
        if count > 0 {
            wld.msg_client(&format!("Recall start ({} lines).", count));
            let mut recalled = wld.recall_history(count);
            wld.client.toqueue.merge(&mut recalled);
            wld.msg_client("Recall end.");
            return;
        }
    }

    recall::recall_command(wld, args, now);
}

fn command_mcpreset(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    mcp::send_reset(wld);
}

fn command_version(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    wld.msg_client(&format!("Mooproxy version {}.", VERSIONSTR));
}

fn command_date(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    wld.msg_client(&format!(
        "The current date is {}.",
        util::time_string(util::current_time(), "%c")
    ));
}

fn command_uptime(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    let started = wld.started_at;
    let up = util::current_time() - started;
    wld.msg_client(&format!(
        "Started {}. Uptime is {} days, {:02}:{:02}:{:02}.",
        util::time_string(started, "%c"),
        up / 86400,
        up % 86400 / 3600,
        up % 3600 / 60,
        up % 60
    ));
}

fn command_world(wld: &mut World, cmd: &str, args: &str) {
    if refuse_arguments(wld, cmd, args) {
        return;
    }

    let name = wld.name.clone();
    wld.msg_client(&format!("The world is `{}'.", name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn world() -> World {
        World::new("dreamland".to_owned(), std::env::temp_dir(), &logging::discard())
    }

    fn client_line(text: &str) -> Line {
        Line::new(text.as_bytes().to_vec())
    }

    fn drain_messages(wld: &mut World) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = wld.client.toqueue.pop() {
            out.push(String::from_utf8_lossy(&line.text).into_owned());
        }
        out
    }

    #[test]
    fn test_non_command_passes_through() {
        let mut wld = world();
        assert!(!do_command(&mut wld, &client_line("look\n")));
        assert!(drain_messages(&mut wld).is_empty());
    }

    #[test]
    fn test_unknown_command_strict() {
        let mut wld = world();
        wld.strict_commands = true;

        assert!(do_command(&mut wld, &client_line("/unknown\n")));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("Invalid command: `unknown'."));
    }

    #[test]
    fn test_unknown_command_lenient() {
        let mut wld = world();
        wld.strict_commands = false;

        assert!(!do_command(&mut wld, &client_line("/unknown\n")));
        assert!(drain_messages(&mut wld).is_empty());
    }

    #[test]
    fn test_custom_commandstring() {
        let mut wld = world();
        wld.commandstring = "##".to_owned();

        assert!(do_command(&mut wld, &client_line("##world\n")));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("The world is `dreamland'."));

        // The default prefix no longer works.
        wld.strict_commands = false;
        assert!(!do_command(&mut wld, &client_line("/world\n")));
    }

    #[test]
    fn test_refuse_arguments() {
        let mut wld = world();

        assert!(do_command(&mut wld, &client_line("/quit now\n")));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("The command `quit' does not take arguments."));
        assert_eq!(wld.flags & WLD_CLIENTQUIT, 0);

        assert!(do_command(&mut wld, &client_line("/quit   \n")));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("Closing connection."));
        assert!(wld.flags & WLD_CLIENTQUIT != 0);
    }

    #[test]
    fn test_shutdown_sets_flag() {
        let mut wld = world();

        assert!(do_command(&mut wld, &client_line("/shutdown\n")));
        assert!(wld.flags & WLD_SHUTDOWN != 0);
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("Shutting down."));
    }

    #[test]
    fn test_getopt_setopt() {
        let mut wld = world();

        do_command(&mut wld, &client_line("/setopt port 7777\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("The option `port' is now `7777'."));

        do_command(&mut wld, &client_line("/getopt port\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("The option `port' is `7777'."));

        do_command(&mut wld, &client_line("/getopt nonsense\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("No such option, `nonsense'."));

        do_command(&mut wld, &client_line("/getopt authstring\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("The option `authstring' cannot be read."));
    }

    #[test]
    fn test_setopt_strips_quotes() {
        let mut wld = world();

        do_command(&mut wld, &client_line("/setopt infostring \"-> \"\n"));
        drain_messages(&mut wld);
        assert_eq!(wld.infostring, "-> ");
    }

    #[test]
    fn test_setopt_bad_value_reports_and_keeps() {
        let mut wld = world();
        wld.dest_port = Some(1234);

        do_command(&mut wld, &client_line("/setopt port mushroom\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("Integers must be"));
        assert_eq!(wld.dest_port, Some(1234));
    }

    #[test]
    fn test_listopts_wraps() {
        let mut wld = world();

        do_command(&mut wld, &client_line("/listopts\n"));
        let out = drain_messages(&mut wld);

        assert!(out[0].contains("Options:"));
        assert!(out.len() >= 3);
        // Lines stay inside the wrap width (plus infostring dressing).
        for line in &out[1..] {
            let body = line
                .trim_start_matches(&wld.infostring)
                .trim_end_matches("\u{1b}[0m\n");
            assert!(body.len() <= 68, "too wide: {:?}", body);
        }
        assert!(out.last().unwrap().contains("."));
    }

    #[test]
    fn test_recall_empty_reports_size() {
        let mut wld = world();

        do_command(&mut wld, &client_line("/recall\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("lines in history, using"));
    }

    #[test]
    fn test_recall_bare_count() {
        let mut wld = world();
        for i in 0..5 {
            wld.history
                .append(Line::new(format!("h{}\n", i).into_bytes()));
        }

        do_command(&mut wld, &client_line("/recall 2\n"));
        let out = drain_messages(&mut wld);

        assert!(out[0].contains("Recall start (2 lines)."));
        assert!(out[1].contains("h3"));
        assert!(out[2].contains("h4"));
        assert!(out[3].contains("Recall end."));
    }

    #[test]
    fn test_connect_requires_host() {
        let mut wld = world();

        do_command(&mut wld, &client_line("/connect\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("No hostname to connect to."));
    }

    #[test]
    fn test_connect_rejects_bad_port() {
        let mut wld = world();

        do_command(&mut wld, &client_line("/connect mud.example.test eighty\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("Invalid port `eighty'."));
    }

    #[test]
    fn test_disconnect_when_not_connected() {
        let mut wld = world();

        do_command(&mut wld, &client_line("/disconnect\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("Not connected, so cannot disconnect."));
        assert!(wld.flags & WLD_SERVERQUIT != 0);
    }

    #[test]
    fn test_version_and_world() {
        let mut wld = world();

        do_command(&mut wld, &client_line("/version\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("Mooproxy version"));

        do_command(&mut wld, &client_line("/uptime\n"));
        let out = drain_messages(&mut wld);
        assert!(out[0].contains("Uptime is"));
    }
}
