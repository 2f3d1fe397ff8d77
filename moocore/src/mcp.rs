//! MCP (Mud Client Protocol) handling.
//!
//! MCP lines are out-of-band traffic identified by a `#$#` prefix. The
//! proxy forwards them untouched in both directions, but watches the
//! handshake to learn the session's authentication key so it can later
//! inject the keyed reset exchange (`dns-nl-icecrew-mcpreset`), which
//! persuades the server to restart MCP negotiation for a fresh client.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::line::{Line, LINE_MCP};
use crate::logging::debug;
use crate::world::World;

pub const MCP_RESET_PACKAGE: &str = "dns-nl-icecrew-mcpreset";

/// Returns true if the line is an MCP command.
#[inline]
pub fn is_mcp(line: &[u8]) -> bool {
    line.starts_with(b"#$#")
}

#[derive(Debug, Eq, PartialEq)]
pub enum McpType {
    Normal,
    Multi,
    MultiEnd,
}

/// A factored MCP message.
#[derive(Debug)]
pub struct McpMsg {
    pub mtype: McpType,
    pub name: String,
    pub key: String,
    pub keyvals: Vec<(String, String)>,
}

/// Parse an MCP line (which must start with `#$#`). Returns `None` if
/// the line is not well-formed MCP.
pub fn parse(raw: &[u8]) -> Option<McpMsg> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(|c| c == '\r' || c == '\n');
    let rest = text.strip_prefix("#$#")?;
    let bytes = rest.as_bytes();
    let mut pos = 0;

    // The message name runs up to the first space; a name without any
    // trailing content is not a valid message.
    while pos < bytes.len() && bytes[pos] != b' ' {
        pos += 1;
    }
    if pos == bytes.len() {
        return None;
    }
    let name = rest[..pos].to_ascii_lowercase();
    pos += 1;

    // The keyless "mcp" handshake carries no key; everything else does.
    let key = if name != "mcp" {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        let key_start = pos;
        while pos < bytes.len() && bytes[pos] != b' ' {
            pos += 1;
        }
        let key = rest[key_start..pos].to_owned();
        if pos < bytes.len() {
            pos += 1;
        }
        key
    } else {
        String::new()
    };

    // Multiline end: `#$#: key`.
    if name == ":" {
        return Some(McpMsg {
            mtype: McpType::MultiEnd,
            name,
            key,
            keyvals: Vec::new(),
        });
    }

    // Multiline continuation: `#$#* key name: value-rest-of-line`.
    if name == "*" {
        let mut kv_end = pos;
        while kv_end < bytes.len() && bytes[kv_end] != b' ' {
            kv_end += 1;
        }
        if kv_end == bytes.len() {
            return None;
        }
        let kv_key = &rest[pos..kv_end];
        if !kv_key.ends_with(':') {
            return None;
        }
        let value = rest[kv_end + 1..].to_owned();

        return Some(McpMsg {
            mtype: McpType::Multi,
            name,
            key,
            keyvals: vec![(
                kv_key[..kv_key.len() - 1].to_ascii_lowercase(),
                value,
            )],
        });
    }

    // A normal message: read key: value pairs to the end of the line.
    let mut keyvals = Vec::new();
    loop {
        match get_keyval(rest, &mut pos) {
            Ok(Some(kv)) => keyvals.push(kv),
            Ok(None) => break,
            Err(()) => return None,
        }
    }

    Some(McpMsg {
        mtype: McpType::Normal,
        name,
        key,
        keyvals,
    })
}

/// Read one `key: value` pair starting at `*pos`. `Ok(None)` signals a
/// clean end of line, `Err` a parse error.
fn get_keyval(s: &str, pos: &mut usize) -> Result<Option<(String, String)>, ()> {
    let bytes = s.as_bytes();

    while *pos < bytes.len() && bytes[*pos] == b' ' {
        *pos += 1;
    }
    if *pos == bytes.len() {
        return Ok(None);
    }

    // The key, which must end with ':'.
    let key_start = *pos;
    while *pos < bytes.len() && bytes[*pos] != b' ' {
        *pos += 1;
    }
    if *pos == bytes.len() {
        return Err(());
    }
    let key = &s[key_start..*pos];
    if key.len() < 2 || !key.ends_with(':') {
        return Err(());
    }
    *pos += 1;

    while *pos < bytes.len() && bytes[*pos] == b' ' {
        *pos += 1;
    }
    if *pos == bytes.len() {
        return Err(());
    }

    // Unquoted value: up to the next space.
    if bytes[*pos] != b'"' {
        let val_start = *pos;
        while *pos < bytes.len() && bytes[*pos] != b' ' {
            *pos += 1;
        }
        let value = s[val_start..*pos].to_owned();
        if *pos < bytes.len() {
            *pos += 1;
        }
        return Ok(Some((
            key[..key.len() - 1].to_ascii_lowercase(),
            value,
        )));
    }

    // Quoted value with backslash escaping. The raw escaped content is
    // preserved, as the message is forwarded verbatim anyway.
    *pos += 1;
    let val_start = *pos;
    let mut escaped = false;
    loop {
        if *pos == bytes.len() {
            return Err(());
        }
        match bytes[*pos] {
            b'\\' => escaped = !escaped,
            b'"' if !escaped => break,
            _ => escaped = false,
        }
        *pos += 1;
    }
    let value = s[val_start..*pos].to_owned();
    *pos += 1;

    Ok(Some((
        key[..key.len() - 1].to_ascii_lowercase(),
        value,
    )))
}

/// Handle an MCP line from the client: forward it to the server, and
/// watch the handshake for the authentication key and for the moment to
/// advertise the proxy's reset package.
pub fn handle_client(wld: &mut World, mut line: Line) {
    let parsed = parse(&line.text);
    line.flags = LINE_MCP;
    wld.server.toqueue.append(line);

    let msg = match parsed {
        Some(msg) if msg.mtype == McpType::Normal => msg,
        _ => return,
    };

    if !wld.mcp_negotiated && msg.name == "mcp" {
        for (key, value) in &msg.keyvals {
            if key == "authentication-key" {
                debug!(wld.log, "captured MCP authentication key");
                wld.mcp_key = Some(value.clone());
            }
        }
    }

    if !wld.mcp_negotiated && msg.name == "mcp-negotiate-can" {
        debug!(wld.log, "MCP negotiation seen, advertising reset package");
        wld.mcp_negotiated = true;

        let key = wld.mcp_key.clone().unwrap_or_default();
        wld.server.toqueue.append(mcp_line(format!(
            "#$#mcp-negotiate-can {} package: {} min-version: 1.0 max-version: 1.0\n",
            key, MCP_RESET_PACKAGE
        )));
    }
}

/// Handle an MCP line from the server: remember the startup announcement
/// for replay to later clients, then pass the line through unaltered.
pub fn handle_server(wld: &mut World, mut line: Line) {
    if let Some(msg) = parse(&line.text) {
        if msg.mtype == McpType::Normal && msg.name == "mcp" {
            wld.mcp_initmsg = Some(line.text.clone());
        }
    }

    line.flags = LINE_MCP;
    wld.client.toqueue.append(line);
}

/// Send the MCP reset exchange to the server. If no negotiation has
/// happened yet, a synthetic one with a proxy-chosen key is injected
/// first.
pub fn send_reset(wld: &mut World) {
    if !wld.mcp_negotiated {
        wld.msg_client("No MCP session, negotiating now.");

        let key = generate_key();
        wld.server.toqueue.append(mcp_line(format!(
            "#$#mcp authentication-key: {} version: 1.0 to: 2.1\n",
            key
        )));
        wld.server.toqueue.append(mcp_line(format!(
            "#$#mcp-negotiate-can {} package: {} min-version: 1.0 max-version: 1.0\n",
            key, MCP_RESET_PACKAGE
        )));
        wld.server.toqueue.append(mcp_line(format!(
            "#$#mcp-negotiate-end {}\n",
            key
        )));

        wld.mcp_key = Some(key);
    }

    wld.msg_client("Sending MCP reset.");
    let key = wld.mcp_key.take().unwrap_or_default();
    wld.server.toqueue.append(mcp_line(format!(
        "#$#{}-reset {}\n",
        MCP_RESET_PACKAGE, key
    )));

    wld.mcp_negotiated = false;
}

fn mcp_line(text: String) -> Line {
    let mut line = Line::new(text.into_bytes());
    line.flags = LINE_MCP;
    line
}

/// A fresh session key for proxy-initiated negotiation.
fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_mcp() {
        assert!(is_mcp(b"#$#mcp version: 2.1\n"));
        assert!(!is_mcp(b"say #$#\n"));
        assert!(!is_mcp(b""));
    }

    #[test]
    fn test_parse_normal() {
        let msg = parse(b"#$#mcp-negotiate-can mehkey package: x min-version: 1.0 max-version: 1.0\r\n")
            .unwrap();

        assert_eq!(msg.mtype, McpType::Normal);
        assert_eq!(msg.name, "mcp-negotiate-can");
        assert_eq!(msg.key, "mehkey");
        assert_eq!(
            msg.keyvals,
            vec![
                ("package".to_owned(), "x".to_owned()),
                ("min-version".to_owned(), "1.0".to_owned()),
                ("max-version".to_owned(), "1.0".to_owned()),
            ]
        );
    }

    #[test]
    fn test_parse_keyless_handshake() {
        let msg = parse(b"#$#mcp authentication-key: s3cret version: 1.0 to: 2.1\n").unwrap();

        assert_eq!(msg.mtype, McpType::Normal);
        assert_eq!(msg.name, "mcp");
        assert_eq!(msg.key, "");
        assert_eq!(msg.keyvals[0], ("authentication-key".to_owned(), "s3cret".to_owned()));
    }

    #[test]
    fn test_parse_quoted_value() {
        let msg = parse(b"#$#pkg-msg key text: \"hello \\\"world\\\" x\" n: 1\n").unwrap();

        assert_eq!(
            msg.keyvals[0],
            ("text".to_owned(), "hello \\\"world\\\" x".to_owned())
        );
        assert_eq!(msg.keyvals[1], ("n".to_owned(), "1".to_owned()));
    }

    #[test]
    fn test_parse_multiline() {
        let msg = parse(b"#$#* tag37 text: anything at all here\n").unwrap();

        assert_eq!(msg.mtype, McpType::Multi);
        assert_eq!(msg.key, "tag37");
        assert_eq!(
            msg.keyvals,
            vec![("text".to_owned(), "anything at all here".to_owned())]
        );
    }

    #[test]
    fn test_parse_multiline_end() {
        let msg = parse(b"#$#: tag37\n").unwrap();

        assert_eq!(msg.mtype, McpType::MultiEnd);
        assert_eq!(msg.key, "tag37");
        assert!(msg.keyvals.is_empty());
    }

    #[test]
    fn test_parse_rejects_bare_name() {
        // A name with nothing after it is not a complete message.
        assert!(parse(b"#$#mcp\n").is_none());
    }

    #[test]
    fn test_parse_rejects_unterminated_quote() {
        assert!(parse(b"#$#pkg key text: \"unterminated\n").is_none());
    }

    #[test]
    fn test_generate_key() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(a.len(), 12);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    use crate::logging;
    use crate::world::World;

    fn world() -> World {
        World::new("w".to_owned(), std::env::temp_dir(), &logging::discard())
    }

    fn drain(queue: &mut crate::line::LineQueue) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = queue.pop() {
            out.push(String::from_utf8_lossy(&line.text).into_owned());
        }
        out
    }

    #[test]
    fn test_handshake_key_capture_and_advert() {
        let mut wld = world();

        handle_client(
            &mut wld,
            Line::new(b"#$#mcp authentication-key: k1 version: 1.0 to: 2.1\n".to_vec()),
        );
        assert_eq!(wld.mcp_key.as_deref(), Some("k1"));
        // The handshake line itself was forwarded.
        assert_eq!(wld.server.toqueue.count(), 1);
        assert!(!wld.mcp_negotiated);

        handle_client(
            &mut wld,
            Line::new(
                b"#$#mcp-negotiate-can k1 package: foo min-version: 1.0 max-version: 1.0\n"
                    .to_vec(),
            ),
        );
        assert!(wld.mcp_negotiated);

        let sent = drain(&mut wld.server.toqueue);
        assert_eq!(sent.len(), 3);
        // The injected advertisement carries our package under the
        // captured key.
        assert!(sent[2].starts_with("#$#mcp-negotiate-can k1"));
        assert!(sent[2].contains(MCP_RESET_PACKAGE));
    }

    #[test]
    fn test_send_reset_negotiates_when_needed() {
        let mut wld = world();

        send_reset(&mut wld);

        let sent = drain(&mut wld.server.toqueue);
        assert_eq!(sent.len(), 4);
        assert!(sent[0].starts_with("#$#mcp authentication-key: "));
        assert!(sent[1].contains(MCP_RESET_PACKAGE));
        assert!(sent[2].starts_with("#$#mcp-negotiate-end "));
        assert!(sent[3].starts_with(&format!("#$#{}-reset ", MCP_RESET_PACKAGE)));

        // The session state was reset for the next negotiation.
        assert!(!wld.mcp_negotiated);
        assert!(wld.mcp_key.is_none());

        let notices = drain(&mut wld.client.toqueue);
        assert!(notices[0].contains("No MCP session, negotiating now."));
        assert!(notices[1].contains("Sending MCP reset."));
    }

    #[test]
    fn test_server_announcement_is_kept_and_forwarded() {
        let mut wld = world();

        let raw = b"#$#mcp version: 2.1 to: 2.1\n".to_vec();
        handle_server(&mut wld, Line::new(raw.clone()));

        assert_eq!(wld.mcp_initmsg.as_ref(), Some(&raw));
        let passed = drain(&mut wld.client.toqueue);
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].as_bytes(), raw.as_slice());
    }
}
