//! Small string and wall-clock helpers used throughout the crate.

use chrono::{Datelike, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Current wall-clock time as seconds since the epoch.
#[inline]
pub fn current_time() -> i64 {
    Local::now().timestamp()
}

/// Day ordinal (days since the common era, in local time) of the given
/// instant. Used to group log lines by the day they were created.
pub fn day_of(t: i64) -> i64 {
    match Local.timestamp_opt(t, 0) {
        LocalResult::Single(dt) => i64::from(dt.date_naive().num_days_from_ce()),
        _ => 0,
    }
}

/// Day ordinal of the current instant.
#[inline]
pub fn current_day() -> i64 {
    day_of(current_time())
}

/// The local date corresponding to a day ordinal from [`day_of`].
pub fn date_of_day(day: i64) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(day as i32)
}

/// Format the given instant in local time. For the format, see chrono's
/// strftime documentation (same specifiers as strftime(3)).
pub fn time_string(t: i64, fmt: &str) -> String {
    match Local.timestamp_opt(t, 0) {
        LocalResult::Single(dt) => dt.format(fmt).to_string(),
        _ => String::new(),
    }
}

/// Resolve a local naive date/time back to an instant. Ambiguous local
/// times (DST fold) resolve to the earlier instant; nonexistent local
/// times (DST gap) fall back to reading the naive value as UTC.
pub fn local_to_instant(ndt: NaiveDateTime) -> i64 {
    match Local.from_local_datetime(&ndt) {
        LocalResult::Single(dt) => dt.timestamp(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp(),
        LocalResult::None => Utc.from_utc_datetime(&ndt).timestamp(),
    }
}

/// If the string starts and ends with the same quote character, remove
/// both. Returns the possibly-shortened string.
pub fn remove_enclosing_quotes(s: &str) -> &str {
    let b = s.as_bytes();

    if b.len() >= 2 {
        let (first, last) = (b[0], b[b.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &s[1..s.len() - 1];
        }
    }

    s
}

/// Determine if a string says true or false (case insensitive).
/// `true`/`yes`/`on`/`1` and `false`/`no`/`off`/`0` are recognized.
pub fn true_or_false(s: &str) -> Option<bool> {
    const TRUE_WORDS: [&str; 4] = ["true", "yes", "on", "1"];
    const FALSE_WORDS: [&str; 4] = ["false", "no", "off", "0"];

    if TRUE_WORDS.iter().any(|w| s.eq_ignore_ascii_case(w)) {
        return Some(true);
    }
    if FALSE_WORDS.iter().any(|w| s.eq_ignore_ascii_case(w)) {
        return Some(false);
    }

    None
}

/// Split the first whitespace-separated word off the front of `args`,
/// advancing `args` past it. Returns `None` when nothing is left.
pub fn get_one_word<'a>(args: &mut &'a str) -> Option<&'a str> {
    let s = args.trim_start();

    if s.is_empty() {
        *args = s;
        return None;
    }

    match s.find(char::is_whitespace) {
        Some(i) => {
            let (word, rest) = s.split_at(i);
            *args = rest;
            Some(word)
        }
        None => {
            *args = &s[s.len()..];
            Some(s)
        }
    }
}

/// Strip ANSI escape sequences and control bytes from a byte string.
///
/// CSI sequences (`ESC [` up to and including the next alphabetic byte)
/// and lone `ESC x` pairs are removed entirely; any other byte below
/// 0x20 is dropped. High (non-ASCII) bytes pass through. The result
/// carries no newline; callers append one where needed.
pub fn strip_ansi(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    // 0: plain text, 1: seen ESC, 2: inside CSI until an alpha byte
    let mut escape = 0u8;

    for &byte in src {
        match escape {
            0 => {
                if byte == 0x1B {
                    escape = 1;
                } else if byte >= b' ' {
                    out.push(byte);
                }
            }
            1 => {
                escape = if byte == b'[' { 2 } else { 0 };
            }
            _ => {
                if byte.is_ascii_alphabetic() {
                    escape = 0;
                }
            }
        }
    }

    out
}

/// Remove ASCII BEL bytes. Recalled lines are replayed without ringing
/// the client's bell again.
pub fn strip_bell(src: &[u8]) -> Vec<u8> {
    src.iter().copied().filter(|&b| b != 0x07).collect()
}
