//! The per-day MUD text log.
//!
//! Loggable lines are queued during the loop pass and flushed at its
//! end. Each line is ANSI-stripped and appended, newline-terminated, to
//! an append-only file named for the world and the line's creation date;
//! a line created before midnight lands in the old day's file even if it
//! is flushed after. Write errors are reported to the client, debounced
//! so a broken disk does not flood the session.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use crate::line::{Line, LineQueue};
use crate::logging::{debug, o, Logger};
use crate::util;

/// Identical write errors are reported to the client at most once per
/// this many seconds.
const LOG_ERROR_INTERVAL: i64 = 30;

/// Ceiling on unwritten log data before the oldest lines are dropped.
const LOG_QUEUE_MAX: usize = 4 * 1024 * 1024;

/// Write the buffer out once it grows past this.
const LOG_BUFFER_FULL: usize = 65_536;

pub struct MudLog {
    logs_dir: PathBuf,
    world_name: String,
    /// Lines waiting to enter the write pipeline.
    queue: LineQueue,
    /// Lines being written out.
    current: LineQueue,
    /// The output byte buffer.
    buffer: Vec<u8>,
    file: Option<File>,
    current_day: i64,
    current_name: Option<String>,
    pub dropped_loggable: u64,
    last_error: Option<String>,
    last_error_time: i64,
    needs_link_update: bool,
    log: Logger,
}

impl MudLog {
    pub fn new(logs_dir: PathBuf, world_name: String, log: &Logger) -> MudLog {
        MudLog {
            logs_dir,
            log: log.new(o!("world" => world_name.clone())),
            world_name,
            queue: LineQueue::new(),
            current: LineQueue::new(),
            buffer: Vec::new(),
            file: None,
            current_day: -1,
            current_name: None,
            dropped_loggable: 0,
            last_error: None,
            last_error_time: 0,
            needs_link_update: false,
        }
    }

    /// Queue a line for logging.
    pub fn enqueue(&mut self, line: Line) {
        self.queue.append(line);
    }

    /// True if any log data has not reached the file yet.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty() || !self.current.is_empty() || !self.buffer.is_empty()
    }

    /// Close the current file; the next flushed line reopens one for its
    /// own date. Used by the day hook and by toggling `logging_enabled`.
    pub fn close(&mut self) {
        if self.file.is_some() {
            let _ = self.write_buffer();
            debug!(self.log, "log file closed"; "day" => self.current_day);
        }

        self.file = None;
        self.current_day = -1;
    }

    /// Move pending lines through the strip filter into the file.
    /// Returns a message for the client when a fresh write error needs
    /// reporting.
    pub fn flush(&mut self, enabled: bool, now: i64) -> Option<String> {
        if !enabled {
            let stale = self.queue.count() + self.current.count();
            if stale > 0 {
                self.dropped_loggable += stale as u64;
                self.queue.clear();
                self.current.clear();
            }
            self.buffer.clear();
            return None;
        }

        self.current.merge(&mut self.queue);

        let mut error: Option<io::Error> = None;

        loop {
            let next_day = match self.current.iter().next() {
                Some(line) => line.day,
                None => break,
            };

            // Rollover: finish the old file before opening the one this
            // line belongs to.
            if self.file.is_none() || next_day != self.current_day {
                match self.write_buffer() {
                    Ok(()) if self.buffer.is_empty() => {}
                    Ok(()) => break,
                    Err(err) => {
                        error = Some(err);
                        break;
                    }
                }
                if let Err(err) = self.open_day(next_day) {
                    self.current.pop();
                    self.dropped_loggable += 1;
                    error = Some(err);
                    break;
                }
            }

            let line = self.current.pop().unwrap();
            let mut text = util::strip_ansi(&line.text);
            text.push(b'\n');
            self.buffer.extend_from_slice(&text);

            if self.buffer.len() >= LOG_BUFFER_FULL {
                if let Err(err) = self.write_buffer() {
                    error = Some(err);
                    break;
                }
            }
        }

        if error.is_none() && !self.buffer.is_empty() {
            if let Err(err) = self.write_buffer() {
                error = Some(err);
            }
        }

        // Keep unwritten log data bounded even when the disk is sick.
        while self.current.length() > LOG_QUEUE_MAX {
            self.current.pop();
            self.dropped_loggable += 1;
        }

        match error {
            Some(err) => self.report_error(&err, now),
            None => None,
        }
    }

    /// True when the log file changed since the last link refresh.
    pub fn take_link_update(&mut self) -> bool {
        std::mem::replace(&mut self.needs_link_update, false)
    }

    /// Point the `<world>.log` convenience symlink at the current file.
    pub fn update_link(&self) {
        let target = match &self.current_name {
            Some(name) => name,
            None => return,
        };
        let link = self.logs_dir.join(format!("{}.log", self.world_name));

        let _ = fs::remove_file(&link);
        let _ = std::os::unix::fs::symlink(target, &link);
    }

    fn open_day(&mut self, day: i64) -> io::Result<()> {
        self.close();

        let date = util::date_of_day(day)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let name = format!("{} - {}.log", self.world_name, date.format("%Y-%m-%d"));
        let path = self.logs_dir.join(&name);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;

        debug!(self.log, "log file opened"; "file" => %path.display());

        self.file = Some(file);
        self.current_day = day;
        self.current_name = Some(name);
        self.needs_link_update = true;

        Ok(())
    }

    fn write_buffer(&mut self) -> io::Result<()> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };

        while !self.buffer.is_empty() {
            match file.write(&self.buffer) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.buffer.drain(..n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    fn report_error(&mut self, err: &io::Error, now: i64) -> Option<String> {
        let msg = format!("Could not write to logfile: {}.", err);

        let repeat = self.last_error.as_deref() == Some(msg.as_str());
        if repeat && now - self.last_error_time < LOG_ERROR_INTERVAL {
            return None;
        }

        self.last_error = Some(msg.clone());
        self.last_error_time = now;
        Some(msg)
    }
}
