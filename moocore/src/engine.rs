//! The main event loop: a single-threaded poll over the listen sockets,
//! authentication slots, the two links, and the resolver pipe, with a
//! timeout tuned to the next full-second boundary for the timer.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::logging::{debug, error, o, Logger};
use crate::util;
use crate::world::{
    World, WLD_CLIENTQUIT, WLD_LOGLINKUPDATE, WLD_REBINDPORT, WLD_RECONNECT, WLD_SERVERCONNECT,
    WLD_SERVERQUIT, WLD_SERVERRESOLVE, WLD_SHUTDOWN,
};

/* The token map. Listeners take 0..16; auth slots 32 and up. */
const TOK_LISTEN_BASE: usize = 0;
const TOK_CLIENT: usize = 16;
const TOK_SERVER: usize = 17;
const TOK_RESOLVER: usize = 18;
const TOK_CONNECTING: usize = 19;
const TOK_AUTH_BASE: usize = 32;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Ask the running engine to shut down at its next pass. Async-signal
/// safe; called from the SIGTERM/SIGINT handlers.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub struct Engine {
    poll: Poll,
    events: Events,
    last_tick: i64,
    log: Logger,
}

impl Engine {
    pub fn new(log: &Logger) -> io::Result<Engine> {
        Ok(Engine {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            last_tick: 0,
            log: log.new(o!()),
        })
    }

    /// Run passes until the world shuts down.
    pub fn run(&mut self, wld: &mut World) {
        debug!(self.log, "entering main loop");

        loop {
            self.turn(wld, next_second_timeout());

            if wld.flags & WLD_SHUTDOWN != 0 {
                self.shutdown(wld);
                return;
            }
        }
    }

    /// One loop pass: wait for readiness, dispatch events, tick the
    /// timer, process flag-driven transitions, route queues, flush, and
    /// trim.
    pub fn turn(&mut self, wld: &mut World, timeout: Duration) {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            wld.flags |= WLD_SHUTDOWN;
        }

        self.arm(wld);

        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() != io::ErrorKind::Interrupted {
                error!(self.log, "poll failed"; "error" => %err);
            }
            self.events.clear();
        }

        for event in self.events.iter() {
            let Token(token) = event.token();

            match token {
                t if t >= TOK_AUTH_BASE => wld.handle_auth_event(t - TOK_AUTH_BASE),
                TOK_CLIENT => {
                    if event.is_readable() {
                        wld.handle_client_event();
                    }
                    // Writability just unblocks the flush below.
                }
                TOK_SERVER => {
                    if event.is_readable() {
                        wld.handle_server_event();
                    }
                }
                TOK_RESOLVER => wld.handle_resolver_event(),
                TOK_CONNECTING => wld.check_connect(),
                t if t < TOK_CLIENT => wld.handle_listen_event(t - TOK_LISTEN_BASE),
                _ => {}
            }
        }

        // One timer tick per wall-clock second.
        let now = util::current_time();
        if now != self.last_tick {
            self.last_tick = now;
            wld.timer_tick(now);
        }

        // Flag-driven connection transitions.
        if wld.flags & WLD_SERVERQUIT != 0 {
            wld.flags &= !WLD_SERVERQUIT;
            wld.disconnect_server();
        }
        if wld.flags & WLD_RECONNECT != 0 {
            wld.flags &= !WLD_RECONNECT;
            wld.do_reconnect();
        }
        if wld.flags & WLD_SERVERRESOLVE != 0 {
            wld.flags &= !WLD_SERVERRESOLVE;
            wld.start_resolve();
        }
        if wld.flags & WLD_SERVERCONNECT != 0 {
            wld.flags &= !WLD_SERVERCONNECT;
            wld.start_connect();
        }

        // Classify whatever the handlers left in the RX queues.
        wld.handle_server_queue();
        wld.handle_client_queue();

        // Route, log, and flush.
        wld.route_server_toqueue();
        wld.route_client_toqueue();
        wld.flush_mudlog();
        wld.flush_server_txbuf();
        wld.flush_client_txbuf();
        wld.notify_not_connected();

        wld.trim_dynamic_queues();

        if wld.flags & WLD_CLIENTQUIT != 0 {
            wld.flags &= !WLD_CLIENTQUIT;
            wld.disconnect_client(true);
        }
        if wld.flags & WLD_REBINDPORT != 0 {
            wld.flags &= !WLD_REBINDPORT;
            wld.rebind_port();
        }
        if wld.flags & WLD_LOGLINKUPDATE != 0 {
            wld.flags &= !WLD_LOGLINKUPDATE;
            wld.mudlog.update_link();
        }
    }

    /// Final drain: get queued output and log data out before exit.
    fn shutdown(&mut self, wld: &mut World) {
        debug!(self.log, "shutting down");

        wld.route_client_toqueue();
        wld.flush_client_txbuf();

        for _ in 0..100 {
            wld.flush_mudlog();
            if !wld.mudlog.has_pending() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        wld.disconnect_client(true);
        wld.disconnect_server();
    }

    /// (Re)register every live descriptor with its token and the
    /// interest the current state calls for.
    fn arm(&mut self, wld: &mut World) {
        let registry = self.poll.registry();

        for (i, listener) in wld.listeners.iter_mut().enumerate().take(TOK_CLIENT) {
            ensure(
                registry,
                listener,
                Token(TOK_LISTEN_BASE + i),
                Interest::READABLE,
                &self.log,
            );
        }

        for (i, slot) in wld.auth_conns.iter_mut().enumerate() {
            if let Some(conn) = slot {
                ensure(
                    registry,
                    &mut conn.stream,
                    Token(TOK_AUTH_BASE + i),
                    Interest::READABLE,
                    &self.log,
                );
            }
        }

        if let Some(stream) = wld.client.stream.as_mut() {
            let interest = if wld.client.write_blocked {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            ensure(registry, stream, Token(TOK_CLIENT), interest, &self.log);
        }

        if let Some(stream) = wld.server.stream.as_mut() {
            let interest = if wld.server.write_blocked {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            ensure(registry, stream, Token(TOK_SERVER), interest, &self.log);
        }

        if let Some(stream) = wld.server.connecting.as_mut() {
            ensure(
                registry,
                stream,
                Token(TOK_CONNECTING),
                Interest::WRITABLE,
                &self.log,
            );
        }

        if let Some(task) = wld.server.resolver.as_mut() {
            ensure(
                registry,
                task.receiver_mut(),
                Token(TOK_RESOLVER),
                Interest::READABLE,
                &self.log,
            );
        }
    }
}

/// Register a source, or refresh its registration if it already has one.
fn ensure<S: Source + ?Sized>(
    registry: &Registry,
    source: &mut S,
    token: Token,
    interest: Interest,
    log: &Logger,
) {
    if registry.reregister(source, token, interest).is_err() {
        if let Err(err) = registry.register(source, token, interest) {
            debug!(log, "source registration failed"; "error" => %err);
        }
    }
}

/// Timeout to the next full-second boundary, floored so a pass never
/// busy-spins.
fn next_second_timeout() -> Duration {
    let millis = u64::from(chrono::Local::now().timestamp_subsec_millis());
    Duration::from_millis((1000 - millis % 1000).max(50))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSecret;
    use crate::logging;
    use crate::net::listener::bind_port;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    fn turn_n(engine: &mut Engine, wld: &mut World, n: usize) {
        for _ in 0..n {
            engine.turn(wld, Duration::from_millis(10));
        }
    }

    /// Keep turning the engine until the peer has produced `needle` (or
    /// give up after a bounded number of passes).
    fn read_until(
        peer: &mut StdTcpStream,
        needle: &str,
        engine: &mut Engine,
        wld: &mut World,
    ) -> String {
        let mut collected = String::new();
        let mut buf = [0u8; 4096];

        for _ in 0..200 {
            engine.turn(wld, Duration::from_millis(10));
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(_) => {}
            }
            if collected.contains(needle) {
                break;
            }
        }

        collected
    }

    fn test_world(logs_dir: std::path::PathBuf) -> World {
        let mut wld = World::new("testworld".to_owned(), logs_dir, &logging::discard());
        wld.auth = AuthSecret::from_config("pw");
        wld.logging_enabled = false;
        wld.context_on_connect = 0;
        wld
    }

    #[test]
    fn test_connect_auth_and_echo() {
        let dir = tempfile::tempdir().unwrap();
        let mut wld = test_world(dir.path().to_path_buf());

        // Listen for the client on an ephemeral port.
        let bind = bind_port(0).unwrap();
        wld.listeners = bind.listeners;
        let addr = wld.listeners[0].local_addr().unwrap();

        // A stand-in MUD server.
        let mud_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        wld.dest_host = Some("127.0.0.1".to_owned());
        wld.dest_port = Some(mud_listener.local_addr().unwrap().port());
        wld.connect_blocking().unwrap();

        let (mut mud, _) = mud_listener.accept().unwrap();
        mud.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

        let mut engine = Engine::new(&logging::discard()).unwrap();

        // Client connects and authenticates.
        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        turn_n(&mut engine, &mut wld, 3);
        client.write_all(b"pw\n").unwrap();

        let greeting = read_until(&mut client, "lines waiting.", &mut engine, &mut wld);
        assert!(greeting.contains("Welcome, please authenticate."));
        assert!(greeting.contains("Authentication succesful."));
        assert!(greeting.contains("lines waiting."));
        assert!(wld.client.is_connected());

        // Server output reaches the client verbatim.
        mud.write_all(b"Hello\n").unwrap();
        let out = read_until(&mut client, "Hello\n", &mut engine, &mut wld);
        assert!(out.contains("Hello\n"));

        // Client input reaches the server verbatim.
        client.write_all(b"say hi\n").unwrap();
        turn_n(&mut engine, &mut wld, 10);
        let mut buf = [0u8; 64];
        let n = mud.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"say hi\n");
    }

    #[test]
    fn test_failed_auth_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut wld = test_world(dir.path().to_path_buf());

        let bind = bind_port(0).unwrap();
        wld.listeners = bind.listeners;
        let addr = wld.listeners[0].local_addr().unwrap();

        let mut engine = Engine::new(&logging::discard()).unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        turn_n(&mut engine, &mut wld, 3);
        client.write_all(b"wrong password\n").unwrap();

        let out = read_until(
            &mut client,
            "Authentication failed, goodbye.",
            &mut engine,
            &mut wld,
        );
        assert!(out.contains("Authentication failed, goodbye."));
        assert!(!wld.client.is_connected());
        assert_eq!(wld.client.login_failures, 1);
    }

    #[test]
    fn test_quit_command_disconnects_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut wld = test_world(dir.path().to_path_buf());

        let bind = bind_port(0).unwrap();
        wld.listeners = bind.listeners;
        let addr = wld.listeners[0].local_addr().unwrap();

        let mut engine = Engine::new(&logging::discard()).unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        turn_n(&mut engine, &mut wld, 3);
        client.write_all(b"pw\n").unwrap();
        read_until(&mut client, "lines waiting.", &mut engine, &mut wld);

        client.write_all(b"/quit\n").unwrap();
        let out = read_until(&mut client, "Closing connection.", &mut engine, &mut wld);
        assert!(out.contains("Closing connection."));

        turn_n(&mut engine, &mut wld, 5);
        assert!(!wld.client.is_connected());
    }
}
