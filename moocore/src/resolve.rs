//! Asynchronous name resolution.
//!
//! The blocking `getaddrinfo` call runs on a short-lived worker thread.
//! The worker formats its outcome as a single tagged message — `'a'`,
//! newline, then newline-terminated numeric addresses on success; `'b'`,
//! newline, then a diagnostic on error — and writes it into a
//! non-blocking pipe, tolerating EAGAIN, then exits. The owning side
//! registers the read end with the poll and consumes the message to EOF.

use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::thread;
use std::time::Duration;

use mio::unix::pipe;

use crate::logging::{debug, o, Logger};

pub const RESOLVE_SUCCESS: u8 = b'a';
pub const RESOLVE_ERROR: u8 = b'b';

/// What the resolver worker came back with.
#[derive(Debug, Eq, PartialEq)]
pub enum ResolveOutcome {
    /// Numeric addresses, in resolver order.
    Addresses(Vec<String>),
    /// Human-readable failure, ready to show to the client.
    Failed(String),
}

/// An in-flight resolution: the pipe read end plus the worker handle.
/// At most one of these exists per world at any time.
pub struct ResolverTask {
    receiver: pipe::Receiver,
    worker: Option<thread::JoinHandle<()>>,
    collected: Vec<u8>,
    log: Logger,
}

impl ResolverTask {
    /// Start resolving `host`. The returned task's receiver must be
    /// registered with the poll for readability.
    pub fn spawn(host: String, log: &Logger) -> io::Result<ResolverTask> {
        let (mut sender, receiver) = pipe::new()?;
        let task_log = log.new(o!("host" => host.clone()));

        let worker = thread::Builder::new()
            .name("resolver".to_owned())
            .spawn(move || {
                let message = resolve_blocking(&host);
                deliver(&mut sender, &message);
            })?;

        debug!(task_log, "resolver started");

        Ok(ResolverTask {
            receiver,
            worker: Some(worker),
            collected: Vec::new(),
            log: task_log,
        })
    }

    /// The pipe read end, for poll registration.
    pub fn receiver_mut(&mut self) -> &mut pipe::Receiver {
        &mut self.receiver
    }

    /// Drain whatever the worker has written so far. Returns the parsed
    /// outcome once the worker has closed its end, `None` while the
    /// message is still incomplete.
    pub fn poll_message(&mut self) -> Option<ResolveOutcome> {
        let mut chunk = [0u8; 1024];

        loop {
            match self.receiver.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.collected.extend_from_slice(&chunk[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) => {
                    debug!(self.log, "resolver pipe error"; "error" => %err);
                    self.worker.take();
                    return Some(ResolveOutcome::Failed(format!(
                        "Resolver pipe error: {}.",
                        err
                    )));
                }
            }
        }

        // The worker closed its end; it has exited or is about to.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let outcome = parse_message(&self.collected);
        debug!(self.log, "resolver finished"; "outcome" => ?outcome);
        Some(outcome)
    }

    /// Abandon the resolution. The worker's next write fails with EPIPE
    /// and it exits on its own.
    pub fn cancel(mut self) {
        debug!(self.log, "resolver cancelled");
        self.worker.take();
    }
}

/// Parse a complete tagged resolver message.
fn parse_message(message: &[u8]) -> ResolveOutcome {
    let text = String::from_utf8_lossy(message);
    let payload = match text.splitn(2, '\n').nth(1) {
        Some(rest) => rest,
        None => return ResolveOutcome::Failed("Resolver went wacko.".to_owned()),
    };

    match message.first() {
        Some(&RESOLVE_SUCCESS) => {
            let addresses = payload
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_owned)
                .collect();
            ResolveOutcome::Addresses(addresses)
        }
        Some(&RESOLVE_ERROR) => ResolveOutcome::Failed(payload.trim_end().to_owned()),
        _ => ResolveOutcome::Failed("Resolver went wacko.".to_owned()),
    }
}

/// The worker body: do the lookup and format the tagged message.
fn resolve_blocking(host: &str) -> Vec<u8> {
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => {
            let mut message = vec![RESOLVE_SUCCESS, b'\n'];
            for addr in addrs {
                message.extend_from_slice(addr.ip().to_string().as_bytes());
                message.push(b'\n');
            }
            message
        }
        Err(err) => format!(
            "{}\nResolving failed: {}",
            RESOLVE_ERROR as char, err
        )
        .into_bytes(),
    }
}

/// Write the whole message into the non-blocking pipe. The pipe can fill
/// if the address list is large; sleeping through EAGAIN instead of
/// giving up keeps the contract that the full message always arrives.
fn deliver(sender: &mut pipe::Sender, message: &[u8]) {
    let mut offset = 0;

    while offset < message.len() {
        match sender.write(&message[offset..]) {
            Ok(0) => return,
            Ok(n) => offset += n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            // The read end is gone: the resolution was cancelled.
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    #[test]
    fn test_parse_success_message() {
        let outcome = parse_message(b"a\n127.0.0.1\n::1\n");
        assert_eq!(
            outcome,
            ResolveOutcome::Addresses(vec!["127.0.0.1".to_owned(), "::1".to_owned()])
        );
    }

    #[test]
    fn test_parse_error_message() {
        let outcome = parse_message(b"b\nResolving failed: no such host\n");
        assert_eq!(
            outcome,
            ResolveOutcome::Failed("Resolving failed: no such host".to_owned())
        );
    }

    #[test]
    fn test_parse_garbage_message() {
        assert_eq!(
            parse_message(b"zzz"),
            ResolveOutcome::Failed("Resolver went wacko.".to_owned())
        );
    }

    #[test]
    fn test_resolve_numeric_address() {
        let message = resolve_blocking("127.0.0.1");
        assert_eq!(message[0], RESOLVE_SUCCESS);
        assert_eq!(
            parse_message(&message),
            ResolveOutcome::Addresses(vec!["127.0.0.1".to_owned()])
        );
    }

    #[test]
    fn test_spawn_and_collect() {
        let log = logging::discard();
        let mut task = ResolverTask::spawn("127.0.0.1".to_owned(), &log).unwrap();

        // The worker is quick for a numeric address; poll until the
        // message lands.
        let outcome = loop {
            if let Some(outcome) = task.poll_message() {
                break outcome;
            }
            thread::sleep(Duration::from_millis(5));
        };

        assert_eq!(
            outcome,
            ResolveOutcome::Addresses(vec!["127.0.0.1".to_owned()])
        );
    }
}
