//! The recall query language and history scan.
//!
//! A recall argument is a sequence of whitespace-separated tokens under
//! the keywords `from`, `to` and `search`. Timespec tokens update a
//! running instant (`when`); the search keyword consumes the rest of the
//! argument verbatim. The search pattern treats `.*` as a variable-length
//! wildcard joining literal fragments and any other character (including
//! `.`) as a single-character wildcard, realized as an ordered substring
//! search over the fragments.

use std::mem;

use chrono::{Datelike, Duration, Local, LocalResult, NaiveDate, TimeZone};

use crate::line::{Line, LineQueue, LINE_MESSAGE};
use crate::util;
use crate::world::World;

const KW_FROM: usize = 0;
const KW_TO: usize = 1;
const KW_SEARCH: usize = 2;

static KEYWORDS: [&str; 3] = ["from", "to", "search"];

static WEEKDAYS: [&str; 14] = [
    "sun", "sunday", "mon", "monday", "tue", "tuesday", "wed", "wednesday", "thu", "thursday",
    "fri", "friday", "sat", "saturday",
];

struct Params<'a> {
    /// The argument string we're parsing.
    argstr: &'a str,
    /// Wall clock at the moment the command was issued.
    now: i64,
    /// Error message from the parse functions.
    error: Option<String>,

    /// The word under examination, and its location in argstr.
    word: String,
    word_start: usize,
    word_end: usize,

    /// Which keywords we've seen so far.
    keywords_seen: u32,

    /// The instant manipulated by the timespec parsers.
    when: i64,

    /// The actual recall options.
    from: i64,
    to: i64,
    lines: i64,
    search_str: Option<String>,

    /// Statistics about the recalled lines.
    lines_inperiod: usize,
    lines_matched: usize,
}

impl<'a> Params<'a> {
    /// Scan for the next whitespace-separated word.
    fn next_word(&mut self) {
        let bytes = self.argstr.as_bytes();
        let mut pos = self.word_end;

        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        self.word_start = pos;

        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        self.word_end = pos;

        self.word = self.argstr[self.word_start..self.word_end].to_owned();
    }
}

/// Execute a recall query against the world's history and emit the
/// header, matches and footer to the client. `now` is the instant the
/// command was issued.
pub fn recall_command(wld: &mut World, argstr: &str, now: i64) {
    let mut params = Params {
        argstr,
        now,
        error: None,
        word: String::new(),
        word_start: 0,
        word_end: 0,
        keywords_seen: 0,
        when: now,
        // Default recall: from the oldest line to now.
        from: wld.history.head_time().unwrap_or(now),
        to: now,
        lines: 0,
        search_str: None,
        lines_inperiod: 0,
        lines_matched: 0,
    };

    if parse_arguments(wld, &mut params) {
        return;
    }

    if params.from > params.to {
        mem::swap(&mut params.from, &mut params.to);
    }

    if params.lines == 0 {
        wld.msg_client(&format!(
            "Recalling from {} to {}.",
            util::time_string(params.from, "%a %Y/%m/%d %T"),
            util::time_string(params.to, "%a %Y/%m/%d %T")
        ));
    } else {
        wld.msg_client(&format!(
            "Recalling {} lines {} {}.",
            params.lines.abs(),
            if params.lines > 0 { "after" } else { "before" },
            if params.from == now {
                "now".to_owned()
            } else {
                util::time_string(params.from, "%a %Y/%m/%d %T")
            }
        ));
    }

    search_and_recall(wld, &mut params);

    wld.msg_client(&format!(
        "Recall end ({} / {} / {}).",
        wld.history.count(),
        params.lines_inperiod,
        params.lines_matched
    ));
}

/// Loop over all argument words, dispatching on keywords. Returns true
/// on error (already reported to the client).
fn parse_arguments(wld: &mut World, params: &mut Params) -> bool {
    params.next_word();

    while !params.word.is_empty() {
        let idx = match keyword_index(&params.word) {
            Some(idx) => idx,
            None => {
                wld.msg_client(&format!("Unrecognized keyword `{}'.", params.word));
                return true;
            }
        };

        if params.keywords_seen & (1 << idx) != 0 {
            wld.msg_client(&format!(
                "Keyword `{}' may appear only once.",
                KEYWORDS[idx]
            ));
            return true;
        }
        params.keywords_seen |= 1 << idx;

        let failed = match idx {
            KW_FROM => parse_keyword_from(params),
            KW_TO => parse_keyword_to(params),
            KW_SEARCH => parse_keyword_search(params),
            _ => false,
        };

        if failed {
            let msg = params.error.take().unwrap_or_default();
            wld.msg_client(&msg);
            return true;
        }
    }

    false
}

fn keyword_index(word: &str) -> Option<usize> {
    KEYWORDS.iter().position(|k| word.eq_ignore_ascii_case(k))
}

/// Parse the options to the `from` keyword.
fn parse_keyword_from(params: &mut Params) -> bool {
    // From may not come after to.
    if params.keywords_seen & (1 << KW_TO) != 0 {
        params.error = Some(
            "The `from' keyword may not appear after the `to' keyword.".to_owned(),
        );
        return true;
    }

    params.next_word();
    // Relative times under `from` are relative to now, not to the
    // oldest line.
    params.when = params.now;

    if params.word.is_empty() {
        params.error = Some("Missing timespec after `from' keyword.".to_owned());
        return true;
    }

    let mut first = true;
    loop {
        if parse_when(params, false) {
            // If the first option fails, it's an invalid timespec. A
            // later unparseable word is left for the outer loop.
            if first && params.error.is_none() {
                params.error = Some(format!("Invalid timespec: {}.", params.word));
            }
            return params.error.is_some();
        }

        params.from = params.when;
        first = false;
    }
}

/// Parse the options to the `to` keyword.
fn parse_keyword_to(params: &mut Params) -> bool {
    // If from was given, relative times are relative to it.
    params.when = if params.keywords_seen & (1 << KW_FROM) != 0 {
        params.from
    } else {
        params.now
    };

    params.next_word();

    if params.word.is_empty() {
        params.error = Some("Missing timespec after `to' keyword.".to_owned());
        return true;
    }

    let mut first = true;
    loop {
        // The `lines' modifier is only allowed as the first option.
        if parse_when(params, first) {
            if first && params.error.is_none() {
                params.error = Some(format!("Invalid timespec: {}.", params.word));
            }
            return params.error.is_some();
        }

        // Once lines is set, no further timespecs are accepted.
        if params.lines != 0 {
            return false;
        }

        params.to = params.when;
        first = false;
    }
}

/// Parse the options to the `search` keyword: the rest of the argument
/// string, verbatim.
fn parse_keyword_search(params: &mut Params) -> bool {
    params.next_word();

    if params.word.is_empty() {
        params.error = Some("Missing search string after `search' keyword.".to_owned());
        return true;
    }

    params.search_str = Some(params.argstr[params.word_start..].to_owned());

    while !params.word.is_empty() {
        params.next_word();
    }

    false
}

/// Parse one timespec. Returns true on error; on success, `when` or
/// `lines` has been updated.
fn parse_when(params: &mut Params, lines_allowed: bool) -> bool {
    if params.word.starts_with('-') || params.word.starts_with('+') {
        parse_when_relative(params, lines_allowed)
    } else {
        parse_when_absolute(params)
    }
}

/// `{+|-}N <unit>`, where the sign, number and unit may be split over
/// several words.
fn parse_when_relative(params: &mut Params, lines_allowed: bool) -> bool {
    let mut s = params.word.clone();

    let dir: i64 = match s.chars().next() {
        Some('+') => 1,
        Some('-') => -1,
        _ => return true,
    };
    s.remove(0);

    if s.is_empty() {
        params.next_word();
        s = params.word.clone();
    }

    let digits = s.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        params.error = Some(format!("Invalid relative timespec: {}.", params.word));
        return true;
    }

    let n: i64 = match s[..digits].parse() {
        Ok(n) => n,
        Err(_) => 0,
    };
    if n == 0 {
        params.error = Some(format!("Number should be non-zero: {}.", params.word));
        return true;
    }

    s = s[digits..].to_owned();
    if s.is_empty() {
        params.next_word();
        s = params.word.clone();
    }
    if s.is_empty() {
        params.error = Some("Missing modifier to relative timespec.".to_owned());
        return true;
    }

    let unit = s.to_ascii_lowercase();
    if is_prefix(&unit, "seconds") || is_prefix(&unit, "secs") {
        params.when += dir * n;
    } else if is_prefix(&unit, "minutes") || is_prefix(&unit, "mins") {
        params.when += dir * n * 60;
    } else if is_prefix(&unit, "hours") || is_prefix(&unit, "hrs") {
        params.when += dir * n * 60 * 60;
    } else if is_prefix(&unit, "days") {
        params.when += dir * n * 60 * 60 * 24;
    } else if is_prefix(&unit, "lines") {
        params.lines = dir * n;
    } else {
        params.error = Some(format!("Invalid modifier to relative timespec: {}.", s));
        return true;
    }

    if params.lines != 0 && !lines_allowed {
        params.error = Some(
            "The `lines' modifier may only be used alone with the `to' keyword.".to_owned(),
        );
        return true;
    }

    params.next_word();
    false
}

/// Abbreviated unit names match by prefix: `sec`, `s`, `hr` all work.
fn is_prefix(word: &str, unit: &str) -> bool {
    !word.is_empty() && unit.starts_with(word)
}

fn parse_when_absolute(params: &mut Params) -> bool {
    let word = params.word.to_ascii_lowercase();

    if word == "now" {
        params.when = params.now;
        params.next_word();
        return false;
    }

    if word == "today" {
        params.when = start_of_day(local_date(params.now));
        params.next_word();
        return false;
    }

    if word == "yesterday" {
        let date = local_date(params.now);
        params.when = start_of_day(date.pred_opt().unwrap_or(date));
        params.next_word();
        return false;
    }

    let seek = match word.as_str() {
        "next" => 1,
        "last" => -1,
        _ => 0,
    };

    if seek != 0 {
        params.next_word();
        let day = params.word.to_ascii_lowercase();

        for (idx, name) in WEEKDAYS.iter().enumerate() {
            if day != *name {
                continue;
            }

            let target = (idx / 2) as i64;
            let date = local_date(params.when);
            let wday = i64::from(date.weekday().num_days_from_sunday());

            let delta = if seek == 1 {
                (target - wday + 6).rem_euclid(7) + 1
            } else {
                -((wday - target + 6).rem_euclid(7) + 1)
            };

            let date = date
                .checked_add_signed(Duration::days(delta))
                .unwrap_or(date);
            params.when = start_of_day(date);
            params.next_word();
            return false;
        }

        params.error = Some(format!(
            "Expecting a week day after `{}'.",
            if seek == -1 { "last" } else { "next" }
        ));
        return true;
    }

    if !parse_when_absdate(params) {
        return false;
    }
    if !parse_when_abstime(params) {
        return false;
    }

    true
}

/// `MM/DD` or `YY/MM/DD`. The time is set to 00:00:00.
fn parse_when_absdate(params: &mut Params) -> bool {
    let parts: Vec<&str> = params.word.split('/').collect();

    if parts.len() < 2 || parts.len() > 3 {
        return true;
    }
    if parts
        .iter()
        .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return true;
    }

    let numbers: Vec<i64> = parts.iter().map(|p| p.parse().unwrap_or(-1)).collect();
    if numbers.iter().any(|&n| n < 0) {
        return true;
    }

    let base = local_date(params.when);
    let (year, month, day) = if numbers.len() == 2 {
        (i64::from(base.year()), numbers[0], numbers[1])
    } else {
        // Two-digit years map to 1970..2069.
        (1900 + (numbers[0] + 30) % 100 + 70, numbers[1], numbers[2])
    };

    if range_check(params, month, 1, 12, "Months") {
        return true;
    }
    if range_check(params, day, 1, 31, "Days") {
        return true;
    }

    // Days past the end of the month carry over, like mktime().
    let date = match NaiveDate::from_ymd_opt(year as i32, month as u32, 1) {
        Some(first) => first
            .checked_add_signed(Duration::days(day - 1))
            .unwrap_or(first),
        None => return true,
    };

    params.when = start_of_day(date);
    params.next_word();
    false
}

/// `HH:MM` or `HH:MM:SS`, on the day `when` currently points at.
fn parse_when_abstime(params: &mut Params) -> bool {
    let parts: Vec<&str> = params.word.split(':').collect();

    if parts.len() < 2 || parts.len() > 3 {
        return true;
    }
    if parts
        .iter()
        .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return true;
    }

    let numbers: Vec<i64> = parts.iter().map(|p| p.parse().unwrap_or(-1)).collect();
    if numbers.iter().any(|&n| n < 0) {
        return true;
    }

    let (hour, minute) = (numbers[0], numbers[1]);
    let second = if numbers.len() == 3 { numbers[2] } else { 0 };

    if range_check(params, hour, 0, 23, "Hours") {
        return true;
    }
    if range_check(params, minute, 0, 59, "Minutes") {
        return true;
    }
    if range_check(params, second, 0, 59, "Seconds") {
        return true;
    }

    let date = local_date(params.when);
    let ndt = date
        .and_hms_opt(hour as u32, minute as u32, second as u32)
        .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).unwrap());
    params.when = util::local_to_instant(ndt);
    params.next_word();
    false
}

/// Check `low <= value <= high`, setting the error message on failure.
fn range_check(params: &mut Params, value: i64, low: i64, high: i64, name: &str) -> bool {
    if value >= low && value <= high {
        return false;
    }

    params.error = Some(format!(
        "{} should be in the range {} to {}.",
        name, low, high
    ));
    true
}

fn local_date(when: i64) -> NaiveDate {
    match Local.timestamp_opt(when, 0) {
        LocalResult::Single(dt) => dt.date_naive(),
        _ => NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
    }
}

fn start_of_day(date: NaiveDate) -> i64 {
    util::local_to_instant(date.and_hms_opt(0, 0, 0).unwrap())
}

/// Search the history for lines matching the criteria and queue copies
/// of the matches for the client.
fn search_and_recall(wld: &mut World, params: &mut Params) {
    let fragments = params.search_str.as_deref().map(prepare_search);
    let mut recalled = LineQueue::new();

    if params.lines == 0 {
        // Every line with from <= time <= to.
        for line in wld.history.iter() {
            if line.time < params.from || line.time > params.to {
                continue;
            }
            match_one_line(&mut recalled, params, line, &fragments);
        }
    } else if params.lines > 0 {
        // The first `lines` lines at or after from.
        let mut count = 0;
        for line in wld.history.iter() {
            if line.time < params.from {
                continue;
            }
            count += 1;
            if count > params.lines {
                break;
            }
            match_one_line(&mut recalled, params, line, &fragments);
        }
    } else {
        // The last |lines| lines at or before from.
        let eligible: Vec<&Line> = wld
            .history
            .iter()
            .filter(|l| l.time <= params.from)
            .collect();
        let wanted = (-params.lines) as usize;
        let start = eligible.len().saturating_sub(wanted);
        for line in &eligible[start..] {
            match_one_line(&mut recalled, params, line, &fragments);
        }
    }

    wld.client.toqueue.merge(&mut recalled);
}

/// A line matching the time criteria is checked against the search
/// string; on a match, an ANSI-stripped copy stamped with the original
/// creation time is queued.
fn match_one_line(
    out: &mut LineQueue,
    params: &mut Params,
    line: &Line,
    fragments: &Option<Vec<Vec<u8>>>,
) {
    params.lines_inperiod += 1;

    let stripped = util::strip_ansi(&line.text);

    if let Some(frags) = fragments {
        if !match_fragments(&stripped, frags) {
            return;
        }
    }

    let mut text = stripped;
    text.push(b'\n');
    let mut recalled = Line::with_time(text, line.time);
    recalled.flags = LINE_MESSAGE;
    out.append(recalled);

    params.lines_matched += 1;
}

/// Lowercase the pattern and split it on `.*` into literal fragments.
fn prepare_search(pattern: &str) -> Vec<Vec<u8>> {
    let bytes = pattern.as_bytes();
    let mut fragments = vec![Vec::new()];
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'.' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            fragments.push(Vec::new());
            i += 2;
        } else {
            fragments
                .last_mut()
                .unwrap()
                .push(bytes[i].to_ascii_lowercase());
            i += 1;
        }
    }

    fragments
}

/// Ordered substring search: each fragment must occur after the previous
/// one, with `.` in a fragment matching any single byte.
fn match_fragments(line: &[u8], fragments: &[Vec<u8>]) -> bool {
    let mut pos = 0;

    for fragment in fragments {
        if fragment.is_empty() {
            continue;
        }
        match find_wild(line, pos, fragment) {
            Some(end) => pos = end,
            None => return false,
        }
    }

    true
}

/// Find the first occurrence of `fragment` at or after `from`,
/// returning the position just past the match.
fn find_wild(line: &[u8], from: usize, fragment: &[u8]) -> Option<usize> {
    if fragment.len() > line.len() || from > line.len() - fragment.len() {
        return None;
    }

    for start in from..=(line.len() - fragment.len()) {
        let hit = fragment
            .iter()
            .enumerate()
            .all(|(j, &f)| f == b'.' || line[start + j].to_ascii_lowercase() == f);
        if hit {
            return Some(start + fragment.len());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::LINE_REGULAR;
    use crate::logging;

    fn world_with_history(times: &[i64]) -> World {
        let mut wld = World::new("test".to_owned(), std::env::temp_dir(), &logging::discard());
        for &t in times {
            let mut line = Line::with_time(format!("line at {}\n", t).into_bytes(), t);
            line.flags = LINE_REGULAR;
            wld.history.append(line);
        }
        wld
    }

    /// Drain the client toqueue into (text, flags) pairs.
    fn drain_output(wld: &mut World) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = wld.client.toqueue.pop() {
            out.push(String::from_utf8_lossy(&line.text).into_owned());
        }
        out
    }

    #[test]
    fn test_relative_from_and_to() {
        let mut wld = world_with_history(&[10, 20, 30, 40, 50]);

        // from = 55 - 30 = 25; to is relative to from: 25 + 10 = 35.
        recall_command(&mut wld, "from -30 secs to +10 secs", 55);
        let out = drain_output(&mut wld);

        let matches: Vec<&String> = out.iter().filter(|l| l.starts_with("line at")).collect();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].contains("30"));
        assert!(out.last().unwrap().contains("Recall end (5 / 1 / 1)."));
    }

    #[test]
    fn test_window_selection_in_order() {
        let mut wld = world_with_history(&[10, 20, 30, 40, 50]);

        // Absolute window [25, 45] picks 30 and 40, in order.
        recall_command(&mut wld, "from -30 secs to +20 secs", 55);
        let out = drain_output(&mut wld);

        let matches: Vec<&String> = out.iter().filter(|l| l.starts_with("line at")).collect();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].contains("30"));
        assert!(matches[1].contains("40"));
    }

    #[test]
    fn test_lines_negative_selects_newest_at_or_before_from() {
        let mut wld = world_with_history(&[10, 20, 30, 40, 50]);

        // Default from is the oldest line; -1 lines picks exactly it.
        recall_command(&mut wld, "to -1 lines", 55);
        let out = drain_output(&mut wld);

        let matches: Vec<&String> = out.iter().filter(|l| l.starts_with("line at")).collect();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].contains("10"));
    }

    #[test]
    fn test_lines_positive_after_from() {
        let mut wld = world_with_history(&[10, 20, 30, 40, 50]);

        recall_command(&mut wld, "from -30 secs to +2 lines", 55);
        let out = drain_output(&mut wld);

        let matches: Vec<&String> = out.iter().filter(|l| l.starts_with("line at")).collect();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].contains("30"));
        assert!(matches[1].contains("40"));
    }

    #[test]
    fn test_from_to_swap() {
        let mut wld = world_with_history(&[10, 20, 30, 40, 50]);

        // from 5 seconds ago (50) back to 35 seconds ago (20): swapped
        // into [20, 50].
        recall_command(&mut wld, "from -5 secs to -30 secs", 55);
        let out = drain_output(&mut wld);

        let matches: Vec<&String> = out.iter().filter(|l| l.starts_with("line at")).collect();
        assert_eq!(matches.len(), 4);
    }

    #[test]
    fn test_keyword_rules() {
        let mut wld = world_with_history(&[10]);

        recall_command(&mut wld, "to now from now", 55);
        let out = drain_output(&mut wld);
        assert!(out[0].contains("may not appear after"));

        recall_command(&mut wld, "from now from now", 55);
        let out = drain_output(&mut wld);
        assert!(out[0].contains("Unrecognized keyword") || out[0].contains("only once"));

        recall_command(&mut wld, "bogus", 55);
        let out = drain_output(&mut wld);
        assert!(out[0].contains("Unrecognized keyword `bogus'"));
    }

    #[test]
    fn test_lines_must_be_first_under_to() {
        let mut wld = world_with_history(&[10]);

        recall_command(&mut wld, "from now to -5 secs -1 lines", 55);
        let out = drain_output(&mut wld);
        assert!(out[0].contains("`lines' modifier"));
    }

    #[test]
    fn test_missing_timespec() {
        let mut wld = world_with_history(&[10]);

        recall_command(&mut wld, "from", 55);
        let out = drain_output(&mut wld);
        assert!(out[0].contains("Missing timespec after `from'"));
    }

    #[test]
    fn test_range_errors() {
        let mut wld = world_with_history(&[10]);

        recall_command(&mut wld, "from 13/01", 55);
        let out = drain_output(&mut wld);
        assert!(out[0].contains("Months should be in the range 1 to 12."));

        recall_command(&mut wld, "from 25:00", 55);
        let out = drain_output(&mut wld);
        assert!(out[0].contains("Hours should be in the range 0 to 23."));
    }

    #[test]
    fn test_search_matching() {
        let mut wld = World::new("test".to_owned(), std::env::temp_dir(), &logging::discard());
        for (t, text) in &[
            (10, "The Wizard arrives.\n"),
            (20, "A \x1B[1mdragon\x1B[0m roars.\n"),
            (30, "the wizard departs.\n"),
        ] {
            let line = Line::with_time(text.as_bytes().to_vec(), *t);
            wld.history.append(line);
        }

        recall_command(&mut wld, "search wizard", 55);
        let out = drain_output(&mut wld);
        let matches: Vec<&String> = out.iter().filter(|l| l.contains("izard")).collect();
        assert_eq!(matches.len(), 2);

        // `.*` joins fragments in order; ANSI is stripped before match.
        recall_command(&mut wld, "search a .*roars", 55);
        let out = drain_output(&mut wld);
        assert!(out.iter().any(|l| l.contains("dragon roars")));
        assert!(out.last().unwrap().contains("/ 1)."));
    }

    #[test]
    fn test_search_single_char_wildcard() {
        let mut wld = World::new("test".to_owned(), std::env::temp_dir(), &logging::discard());
        wld.history
            .append(Line::with_time(b"dragon\n".to_vec(), 10));
        wld.history
            .append(Line::with_time(b"dragen\n".to_vec(), 20));
        wld.history
            .append(Line::with_time(b"dargon\n".to_vec(), 30));

        recall_command(&mut wld, "search drag.n", 55);
        let out = drain_output(&mut wld);
        let matched: Vec<&String> = out.iter().filter(|l| l.starts_with("d")).collect();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_prepare_search() {
        assert_eq!(prepare_search("abc"), vec![b"abc".to_vec()]);
        assert_eq!(
            prepare_search("A.*B"),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        // A lone dot stays a single-character wildcard.
        assert_eq!(prepare_search("a.b"), vec![b"a.b".to_vec()]);
        // `..*` keeps the first dot literal (wildcard) and splits.
        assert_eq!(
            prepare_search("a..*b"),
            vec![b"a.".to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn test_match_fragments() {
        let frags = prepare_search("foo.*baz");
        assert!(match_fragments(b"foo bar baz", &frags));
        assert!(!match_fragments(b"baz bar foo", &frags));
        assert!(match_fragments(b"FOO BAZ", &frags));
        assert!(!match_fragments(b"", &frags));
    }

    #[test]
    fn test_absolute_time_parsing() {
        let mut wld = world_with_history(&[10]);

        // These exercise the parser paths; exact instants depend on the
        // local timezone, so only check the parse is accepted.
        for query in &["from today", "from yesterday", "from last mon", "from next friday"] {
            recall_command(&mut wld, query, util::current_time());
            let out = drain_output(&mut wld);
            assert!(
                out[0].contains("Recalling from"),
                "query {:?} gave {:?}",
                query,
                out[0]
            );
        }
    }
}
