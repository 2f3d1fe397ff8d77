//! The World: all configuration and state for a single proxied world,
//! and the operations the event loop drives it with.

use std::io::{self, Write};
use std::mem;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};

use crate::auth::{
    AuthConn, AuthRead, AuthSecret, TokenBucket, NET_AUTHFAIL, NET_AUTHGOOD, NET_CONNTAKEOVER,
    NET_MAXAUTHCONN,
};
use crate::command;
use crate::line::{
    Line, LineQueue, LINE_CHECKPOINT, LINE_DONTBUF, LINE_DONTLOG, LINE_MCP, LINE_MESSAGE,
    LINE_NOHIST, LINE_RECALLED,
};
use crate::logging::{debug, info, o, Logger};
use crate::mcp;
use crate::mudlog::MudLog;
use crate::net::framer::{Ingest, LineFramer};
use crate::net::listener;
use crate::net::sendbuf::{Flush, SendBuffer};
use crate::resolve::{ResolveOutcome, ResolverTask};
use crate::shared::{NetError, StartupError, EXIT_CONNECT, EXIT_NOHOST, EXIT_RESOLV};
use crate::timer::TimerState;
use crate::util;

/* World flags. */
pub const WLD_ACTIVATED: u32 = 0x0001;
pub const WLD_NOTCONNECTED: u32 = 0x0002;
pub const WLD_CLIENTQUIT: u32 = 0x0004;
pub const WLD_SERVERQUIT: u32 = 0x0008;
pub const WLD_RECONNECT: u32 = 0x0010;
pub const WLD_SERVERRESOLVE: u32 = 0x0020;
pub const WLD_SERVERCONNECT: u32 = 0x0040;
pub const WLD_LOGLINKUPDATE: u32 = 0x0080;
pub const WLD_REBINDPORT: u32 = 0x0100;
pub const WLD_SHUTDOWN: u32 = 0x0200;

pub const DEFAULT_CMDSTRING: &str = "/";
pub const DEFAULT_INFOSTRING: &str = "% ";

/// Appended to proxy-originated messages: ANSI reset plus newline.
const MESSAGE_TERMINATOR: &str = "\x1B[0m\n";

/* Reconnect backoff: linear with caps. */
const RECONNECT_DELAY_MIN: i64 = 5;
const RECONNECT_DELAY_STEP: i64 = 5;
const RECONNECT_DELAY_MAX: i64 = 180;
/// One backoff step is forgiven per this many seconds of stable
/// connection.
const RECONNECT_DECAY_SECS: i64 = 60;

/// "Not connected to server" is repeated at most once per this many
/// seconds.
const NOTCONN_INTERVAL: i64 = 60;

const AUTH_BUCKET_SIZE: u32 = 5;
const AUTH_BUCKET_REFILL_SECS: i64 = 2;

/// Notice written to an authentication slot evicted by a newer one.
const NET_AUTHKICKED: &str = "Too many authentication attempts, goodbye.";

const DEFAULT_CONTEXT_LINES: usize = 100;
const DEFAULT_MAX_BUFFERED: usize = 4 * 1024 * 1024;
const DEFAULT_MAX_HISTORY: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServerStatus {
    Disconnected,
    Resolving,
    Connecting,
    Connected,
    ReconnectWait,
}

/// Everything about the link to the remote MUD server.
pub struct ServerLink {
    pub status: ServerStatus,
    pub stream: Option<TcpStream>,
    /// A non-blocking connect in flight, waiting for writability.
    pub connecting: Option<TcpStream>,
    pub resolver: Option<ResolverTask>,

    /// Host and port of the current attempt/session. Seeded from the
    /// configured destination, possibly overridden per-connect.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// The numeric address we are connected (or connecting) to.
    pub address: Option<String>,
    /// Remaining resolved candidates.
    pub addresslist: Vec<String>,

    pub rxbuffer: LineFramer,
    pub txbuffer: SendBuffer,
    pub rxqueue: LineQueue,
    pub toqueue: LineQueue,
    pub txqueue: LineQueue,
    pub write_blocked: bool,

    pub reconnect_enabled: bool,
    pub reconnect_delay: i64,
    pub reconnect_at: i64,
    pub connected_at: i64,
    last_decay: i64,
}

impl ServerLink {
    fn new() -> ServerLink {
        ServerLink {
            status: ServerStatus::Disconnected,
            stream: None,
            connecting: None,
            resolver: None,
            host: None,
            port: None,
            address: None,
            addresslist: Vec::new(),
            rxbuffer: LineFramer::new(),
            txbuffer: SendBuffer::new(),
            rxqueue: LineQueue::new(),
            toqueue: LineQueue::new(),
            txqueue: LineQueue::new(),
            write_blocked: false,
            reconnect_enabled: true,
            reconnect_delay: 0,
            reconnect_at: 0,
            connected_at: 0,
            last_decay: 0,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.status == ServerStatus::Connected
    }

    #[inline]
    pub fn is_connecting(&self) -> bool {
        self.status == ServerStatus::Connecting
    }
}

/// Everything about the local client link.
pub struct ClientLink {
    pub stream: Option<TcpStream>,
    pub rxbuffer: LineFramer,
    pub txbuffer: SendBuffer,
    pub rxqueue: LineQueue,
    pub toqueue: LineQueue,
    pub txqueue: LineQueue,
    pub write_blocked: bool,

    pub address: Option<String>,
    pub prev_address: Option<String>,
    pub connected_since: i64,
    pub last_connected: i64,

    pub login_failures: u64,
    pub last_failaddr: Option<String>,
    pub last_failtime: i64,
    pub last_notconnmsg: i64,
}

impl ClientLink {
    fn new() -> ClientLink {
        ClientLink {
            stream: None,
            rxbuffer: LineFramer::new(),
            txbuffer: SendBuffer::new(),
            rxqueue: LineQueue::new(),
            toqueue: LineQueue::new(),
            txqueue: LineQueue::new(),
            write_blocked: false,
            address: None,
            prev_address: None,
            connected_since: 0,
            last_connected: 0,
            login_failures: 0,
            last_failaddr: None,
            last_failtime: 0,
            last_notconnmsg: 0,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

pub struct World {
    /* Essentials. */
    pub name: String,
    pub configfile: Option<PathBuf>,
    pub flags: u32,

    /* Listening. */
    pub listeners: Vec<TcpListener>,
    pub listenport: Option<u16>,
    pub requested_listenport: Option<u16>,

    /* Authentication. */
    pub auth: AuthSecret,
    pub auth_bucket: TokenBucket,
    auth_last_refill: i64,
    pub auth_conns: Vec<Option<AuthConn>>,
    /// Occupied slots in intake order; the front is the eviction victim.
    pub auth_live: IndexSet<usize>,

    /* The two links. */
    pub server: ServerLink,
    pub client: ClientLink,

    /* The dynamic text queues. */
    pub buffered: LineQueue,
    pub inactive: LineQueue,
    pub history: LineQueue,
    pub dropped_buffered: u64,
    pub dropped_inactive: u64,

    /* Timer and logging. */
    pub timer: TimerState,
    pub mudlog: MudLog,

    /* MCP. */
    pub mcp_negotiated: bool,
    pub mcp_key: Option<String>,
    pub mcp_initmsg: Option<Vec<u8>>,

    /* Options. */
    pub dest_host: Option<String>,
    pub dest_port: Option<u16>,
    pub commandstring: String,
    pub infostring: String,
    pub logging_enabled: bool,
    pub context_on_connect: usize,
    pub max_buffered_size: usize,
    pub max_history_size: usize,
    pub strict_commands: bool,
    pub autoreconnect: bool,

    pub started_at: i64,
    pub log: Logger,
}

impl World {
    /// Create a world with default option values. `logs_dir` is where
    /// the per-day MUD logs land.
    pub fn new(name: String, logs_dir: PathBuf, log: &Logger) -> World {
        let log = log.new(o!("world" => name.clone()));
        let mudlog = MudLog::new(logs_dir, name.clone(), &log);

        World {
            name,
            configfile: None,
            flags: 0,
            listeners: Vec::new(),
            listenport: None,
            requested_listenport: None,
            auth: AuthSecret::empty(),
            auth_bucket: TokenBucket::new(AUTH_BUCKET_SIZE),
            auth_last_refill: 0,
            auth_conns: (0..NET_MAXAUTHCONN).map(|_| None).collect(),
            auth_live: IndexSet::new(),
            server: ServerLink::new(),
            client: ClientLink::new(),
            buffered: LineQueue::new(),
            inactive: LineQueue::new(),
            history: LineQueue::new(),
            dropped_buffered: 0,
            dropped_inactive: 0,
            timer: TimerState::new(),
            mudlog,
            mcp_negotiated: false,
            mcp_key: None,
            mcp_initmsg: None,
            dest_host: None,
            dest_port: None,
            commandstring: DEFAULT_CMDSTRING.to_owned(),
            infostring: DEFAULT_INFOSTRING.to_owned(),
            logging_enabled: true,
            context_on_connect: DEFAULT_CONTEXT_LINES,
            max_buffered_size: DEFAULT_MAX_BUFFERED,
            max_history_size: DEFAULT_MAX_HISTORY,
            strict_commands: true,
            autoreconnect: false,
            started_at: util::current_time(),
            log,
        }
    }

    /* ----- Messages to the client. ----- */

    fn make_message(&self, text: &str, flags: u32) -> Line {
        let mut body =
            String::with_capacity(self.infostring.len() + text.len() + MESSAGE_TERMINATOR.len());
        body.push_str(&self.infostring);
        body.push_str(text);
        body.push_str(MESSAGE_TERMINATOR);

        let mut line = Line::new(body.into_bytes());
        line.flags = flags;
        line
    }

    /// Queue an informational message for the client, prefixed with the
    /// infostring. Not logged, not historized.
    pub fn msg_client(&mut self, text: &str) {
        let line = self.make_message(text, LINE_MESSAGE);
        self.client.toqueue.append(line);
    }

    /// Like [`msg_client`], but as a checkpoint: the line is buffered,
    /// logged and historized like server output, so it survives client
    /// reconnects.
    pub fn checkpoint_client(&mut self, text: &str) {
        let line = self.make_message(text, LINE_CHECKPOINT);
        self.client.toqueue.append(line);
    }

    /* ----- Listen and authentication intake. ----- */

    /// Accept everything pending on listen socket `idx` into
    /// authentication slots.
    pub fn handle_listen_event(&mut self, idx: usize) {
        if idx >= self.listeners.len() {
            return;
        }

        loop {
            match self.listeners[idx].accept() {
                Ok((stream, addr)) => self.intake_auth_conn(stream, addr),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn intake_auth_conn(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let slot = match self.auth_conns.iter().position(|c| c.is_none()) {
            Some(slot) => slot,
            None => {
                // All slots busy: the oldest one makes way.
                let victim = match self.auth_live.first() {
                    Some(&slot) => slot,
                    None => return,
                };
                self.drop_auth_conn(victim, Some(NET_AUTHKICKED));
                victim
            }
        };

        let _ = stream.write(format!("{}\n", crate::auth::NET_AUTHSTRING).as_bytes());

        debug!(self.log, "authentication connection"; "address" => %addr, "slot" => slot);
        self.auth_conns[slot] = Some(AuthConn::new(stream, addr.to_string()));
        self.auth_live.insert(slot);
    }

    /// Read pending bytes on an authentication slot and advance its
    /// state machine.
    pub fn handle_auth_event(&mut self, slot: usize) {
        if slot >= self.auth_conns.len() {
            return;
        }

        let outcome = match self.auth_conns[slot].as_mut() {
            Some(conn) => conn.buf.read_from(&mut conn.stream),
            None => return,
        };

        match outcome {
            Ok(AuthRead::Wait) => {}
            Ok(AuthRead::Closed) | Err(_) => self.drop_auth_conn(slot, None),
            Ok(AuthRead::Overflow) => self.drop_auth_conn(slot, Some(NET_AUTHFAIL)),
            Ok(AuthRead::Complete) => self.verify_authentication(slot),
        }
    }

    fn drop_auth_conn(&mut self, slot: usize, notice: Option<&str>) {
        if let Some(mut conn) = self.auth_conns[slot].take() {
            if let Some(text) = notice {
                let _ = conn.stream.write(format!("{}\n", text).as_bytes());
            }
        }
        self.auth_live.shift_remove(&slot);
    }

    /// Check the collected candidate against the secret. On success the
    /// slot's socket becomes the client connection.
    fn verify_authentication(&mut self, slot: usize) {
        let mut conn = match self.auth_conns[slot].take() {
            Some(conn) => conn,
            None => return,
        };
        self.auth_live.shift_remove(&slot);

        // The token bucket throttles brute-force attempts. A refused
        // attempt is not counted as a login failure.
        if !self.auth_bucket.take() {
            debug!(self.log, "authentication refused, token bucket empty";
                   "address" => &conn.address);
            let _ = conn.stream.write(format!("{}\n", NET_AUTHFAIL).as_bytes());
            return;
        }

        let candidate = String::from_utf8_lossy(conn.buf.candidate()).into_owned();
        if !self.auth.matches(&candidate) {
            info!(self.log, "failed authentication attempt"; "address" => &conn.address);
            let _ = conn.stream.write(format!("{}\n", NET_AUTHFAIL).as_bytes());
            self.client.login_failures += 1;
            self.client.last_failaddr = Some(conn.address);
            self.client.last_failtime = util::current_time();
            return;
        }

        self.promote_auth_conn(conn);
    }

    /// The slot authenticated: take over from any current client and
    /// greet the new one.
    fn promote_auth_conn(&mut self, conn: AuthConn) {
        let now = util::current_time();

        if let Some(mut old) = self.client.stream.take() {
            let notice = self.make_message(NET_CONNTAKEOVER, LINE_MESSAGE);
            self.client.txqueue.append(notice);
            let client = &mut self.client;
            let _ = client.txbuffer.flush(&mut client.txqueue, &mut old);
            info!(self.log, "connection taken over"; "new" => &conn.address);
        }

        self.client.txqueue.clear();
        self.client.txbuffer.clear();
        self.client.rxbuffer.reset();
        self.client.write_blocked = false;
        self.client.prev_address = self.client.address.take();
        self.client.stream = Some(conn.stream);
        self.client.address = Some(conn.address);
        self.client.connected_since = now;
        self.client.last_connected = now;
        self.flags |= WLD_ACTIVATED;

        info!(self.log, "client authenticated";
              "address" => self.client.address.as_deref().unwrap_or(""));

        self.msg_client(NET_AUTHGOOD);

        if self.client.login_failures > 0 {
            let text = format!(
                "{} failed login attempts since your last connect (last from {} at {}).",
                self.client.login_failures,
                self.client.last_failaddr.as_deref().unwrap_or("unknown"),
                util::time_string(self.client.last_failtime, "%a %Y/%m/%d %T")
            );
            self.msg_client(&text);
            self.client.login_failures = 0;
            self.client.last_failaddr = None;
        }

        // Replay the server's MCP announcement so the client can start
        // its own handshake.
        if let Some(init) = self.mcp_initmsg.clone() {
            let mut line = Line::new(init);
            line.flags = LINE_MCP;
            self.client.toqueue.append(line);
        }

        self.recall_and_pass();
    }

    /* ----- Client socket. ----- */

    pub fn handle_client_event(&mut self) {
        let result = {
            let client = &mut self.client;
            let stream = match client.stream.as_mut() {
                Some(stream) => stream,
                None => return,
            };
            client.rxbuffer.ingest(stream, &mut client.rxqueue)
        };

        match result {
            Ok(Ingest::Drained(_)) => self.handle_client_queue(),
            Ok(Ingest::Eof(_)) => {
                self.client.rxbuffer.flush_residual(&mut self.client.rxqueue);
                self.handle_client_queue();
                info!(self.log, "client disconnected");
                self.disconnect_client(false);
            }
            Err(err) => {
                debug!(self.log, "client read error"; "error" => ?err);
                self.disconnect_client(false);
            }
        }
    }

    /// Classify and dispatch everything in the client RX queue.
    pub fn handle_client_queue(&mut self) {
        let mut activity = false;

        while let Some(line) = self.client.rxqueue.pop() {
            activity = true;

            if command::do_command(self, &line) {
                continue;
            }
            if mcp::is_mcp(&line.text) {
                mcp::handle_client(self, line);
                continue;
            }
            self.server.toqueue.append(line);
        }

        // Activity proves the client is alive and reading: its
        // possibly-new lines are confirmed seen.
        if activity {
            self.inactive_to_history();
        }
    }

    /// Disconnect the client, flushing what we can. `clean` marks a
    /// user-requested quit, which also confirms the possibly-new lines.
    pub fn disconnect_client(&mut self, clean: bool) {
        if let Some(mut stream) = self.client.stream.take() {
            let client = &mut self.client;
            let _ = client.txbuffer.flush(&mut client.txqueue, &mut stream);
        }

        self.client.txqueue.clear();
        self.client.txbuffer.clear();
        self.client.rxbuffer.reset();
        self.client.rxqueue.clear();
        self.client.write_blocked = false;
        if let Some(addr) = self.client.address.take() {
            self.client.prev_address = Some(addr);
        }
        self.client.last_connected = util::current_time();

        if clean {
            self.inactive_to_history();
        }
    }

    pub fn flush_client_txbuf(&mut self) {
        if self.client.stream.is_none() {
            // Whatever is left was duplicated into the inactive queue
            // and will be replayed on the next connect.
            self.client.txqueue.clear();
            return;
        }

        let result = {
            let client = &mut self.client;
            let stream = client
                .stream
                .as_mut()
                .expect("client stream present when connected");
            client.txbuffer.flush(&mut client.txqueue, stream)
        };

        match result {
            Ok(Flush::Done) => self.client.write_blocked = false,
            Ok(Flush::Blocked) => self.client.write_blocked = true,
            Err(err) => {
                debug!(self.log, "client write error"; "error" => ?err);
                self.disconnect_client(false);
            }
        }
    }

    /* ----- Server socket. ----- */

    pub fn handle_server_event(&mut self) {
        let result = {
            let server = &mut self.server;
            let stream = match server.stream.as_mut() {
                Some(stream) => stream,
                None => return,
            };
            server.rxbuffer.ingest(stream, &mut server.rxqueue)
        };

        match result {
            Ok(Ingest::Drained(_)) => self.handle_server_queue(),
            Ok(Ingest::Eof(_)) => self.server_lost("connection closed"),
            Err(NetError::Wait) => {}
            Err(NetError::Fatal(kind)) => {
                let reason = io::Error::from(kind).to_string();
                self.server_lost(&reason);
            }
        }
    }

    /// Classify everything in the server RX queue: MCP or regular.
    pub fn handle_server_queue(&mut self) {
        while let Some(line) = self.server.rxqueue.pop() {
            if mcp::is_mcp(&line.text) {
                mcp::handle_server(self, line);
            } else {
                self.client.toqueue.append(line);
            }
        }
    }

    /// The server connection dropped: salvage the residue, tell the
    /// client (buffered, so it survives reconnects), maybe schedule a
    /// reconnect.
    pub fn server_lost(&mut self, reason: &str) {
        info!(self.log, "connection to server lost"; "reason" => reason);

        self.server.stream = None;
        self.server.connecting = None;
        self.server.txbuffer.clear();
        self.server.write_blocked = false;
        self.server
            .rxbuffer
            .flush_residual(&mut self.server.rxqueue);
        self.handle_server_queue();
        self.server.status = ServerStatus::Disconnected;

        let text = format!("Connection to server lost ({}).", reason);
        self.checkpoint_client(&text);

        if self.autoreconnect && self.server.reconnect_enabled {
            self.schedule_reconnect();
        }
    }

    pub fn flush_server_txbuf(&mut self) {
        if self.server.status != ServerStatus::Connected {
            if !self.server.txqueue.is_empty() {
                self.server.txqueue.clear();
                self.flags |= WLD_NOTCONNECTED;
            }
            return;
        }

        let result = {
            let server = &mut self.server;
            let stream = server
                .stream
                .as_mut()
                .expect("server stream present when connected");
            server.txbuffer.flush(&mut server.txqueue, stream)
        };

        match result {
            Ok(Flush::Done) => self.server.write_blocked = false,
            Ok(Flush::Blocked) => self.server.write_blocked = true,
            Err(NetError::Wait) => {}
            Err(NetError::Fatal(kind)) => {
                let reason = io::Error::from(kind).to_string();
                self.server_lost(&reason);
            }
        }
    }

    /// Emit the debounced "not connected" notice if one is due.
    pub fn notify_not_connected(&mut self) {
        if self.flags & WLD_NOTCONNECTED == 0 {
            return;
        }
        self.flags &= !WLD_NOTCONNECTED;

        let now = util::current_time();
        if now - self.client.last_notconnmsg >= NOTCONN_INTERVAL {
            self.client.last_notconnmsg = now;
            self.msg_client("Not connected to server.");
        }
    }

    /* ----- Resolve and connect. ----- */

    /// Kick off asynchronous resolution of the server host.
    pub fn start_resolve(&mut self) {
        let host = match self.server.host.clone() {
            Some(host) => host,
            None => {
                self.msg_client("No hostname to connect to.");
                return;
            }
        };

        let text = format!("Resolving host `{}'...", host);
        self.msg_client(&text);

        match ResolverTask::spawn(host, &self.log) {
            Ok(task) => {
                self.server.resolver = Some(task);
                self.server.status = ServerStatus::Resolving;
            }
            Err(err) => {
                let text = format!("Could not start resolver: {}.", err);
                self.msg_client(&text);
                self.server.status = ServerStatus::Disconnected;
            }
        }
    }

    /// Abandon an in-flight resolution, if any.
    pub fn cancel_resolve(&mut self) {
        if let Some(task) = self.server.resolver.take() {
            task.cancel();
        }
        if self.server.status == ServerStatus::Resolving {
            self.server.status = ServerStatus::Disconnected;
        }
    }

    /// The resolver pipe is readable; consume the tagged message when it
    /// is complete.
    pub fn handle_resolver_event(&mut self) {
        let outcome = match self.server.resolver.as_mut() {
            Some(task) => task.poll_message(),
            None => return,
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => return,
        };

        self.server.resolver = None;
        self.server.status = ServerStatus::Disconnected;

        match outcome {
            ResolveOutcome::Addresses(list) if !list.is_empty() => {
                debug!(self.log, "host resolved"; "addresses" => list.len());
                self.server.addresslist = list;
                self.flags |= WLD_SERVERCONNECT;
            }
            ResolveOutcome::Addresses(_) => {
                self.msg_client("Resolving failed: no usable addresses.");
                self.connect_attempt_failed();
            }
            ResolveOutcome::Failed(text) => {
                self.msg_client(&text);
                self.connect_attempt_failed();
            }
        }
    }

    /// Issue a non-blocking connect to the next candidate address.
    pub fn start_connect(&mut self) {
        let port = match self.server.port {
            Some(port) => port,
            None => {
                self.msg_client("No port number to connect to.");
                self.server.status = ServerStatus::Disconnected;
                return;
            }
        };

        while !self.server.addresslist.is_empty() {
            let ip_str = self.server.addresslist.remove(0);
            let ip: IpAddr = match ip_str.parse() {
                Ok(ip) => ip,
                Err(_) => continue,
            };

            let text = format!("Connecting to {}, port {}...", ip_str, port);
            self.msg_client(&text);

            match TcpStream::connect(SocketAddr::new(ip, port)) {
                Ok(stream) => {
                    self.server.connecting = Some(stream);
                    self.server.address = Some(ip_str);
                    self.server.status = ServerStatus::Connecting;
                    return;
                }
                Err(err) => {
                    let text = format!("Could not connect: {}.", err);
                    self.msg_client(&text);
                }
            }
        }

        self.msg_client("Could not connect to server.");
        self.connect_attempt_failed();
    }

    /// The connecting socket became writable: either we're connected or
    /// this address failed and the next one is tried.
    pub fn check_connect(&mut self) {
        let stream = match self.server.connecting.take() {
            Some(stream) => stream,
            None => return,
        };

        match stream.take_error() {
            Ok(None) => self.server_connected(stream),
            Ok(Some(err)) | Err(err) => {
                let text = format!("Could not connect: {}.", err);
                self.msg_client(&text);

                if self.server.addresslist.is_empty() {
                    self.msg_client("Could not connect to server.");
                    self.connect_attempt_failed();
                } else {
                    self.server.status = ServerStatus::Disconnected;
                    self.flags |= WLD_SERVERCONNECT;
                }
            }
        }
    }

    fn server_connected(&mut self, stream: TcpStream) {
        let now = util::current_time();

        self.server.stream = Some(stream);
        self.server.status = ServerStatus::Connected;
        self.server.rxbuffer.reset();
        self.server.txbuffer.clear();
        self.server.write_blocked = false;
        self.server.connected_at = now;
        self.server.last_decay = now;

        // A fresh session means a fresh MCP handshake.
        self.mcp_negotiated = false;
        self.mcp_key = None;
        self.mcp_initmsg = None;

        // Reopen the log for this session.
        self.mudlog.close();

        info!(self.log, "connected to server";
              "address" => self.server.address.as_deref().unwrap_or(""));

        let text = format!("Connected to world {}.", self.name);
        self.checkpoint_client(&text);
    }

    fn connect_attempt_failed(&mut self) {
        self.server.status = ServerStatus::Disconnected;

        if self.autoreconnect && self.server.reconnect_enabled {
            self.server.reconnect_delay = (self.server.reconnect_delay + RECONNECT_DELAY_STEP)
                .min(RECONNECT_DELAY_MAX);
            self.schedule_reconnect();
        }
    }

    /// Schedule the next reconnect attempt.
    pub fn schedule_reconnect(&mut self) {
        let delay = self.server.reconnect_delay.max(RECONNECT_DELAY_MIN);
        self.server.reconnect_delay = delay;
        self.server.status = ServerStatus::ReconnectWait;
        self.server.reconnect_at = util::current_time() + delay;

        let text = format!("Reconnecting in {} seconds.", delay);
        self.msg_client(&text);
    }

    /// A scheduled reconnect came due.
    pub fn do_reconnect(&mut self) {
        if self.server.status != ServerStatus::ReconnectWait {
            return;
        }
        self.start_resolve();
    }

    /// Tear down the server link on user request. Cancels a resolve or
    /// connect in progress too.
    pub fn disconnect_server(&mut self) {
        self.cancel_resolve();
        self.server.connecting = None;

        if let Some(mut stream) = self.server.stream.take() {
            let server = &mut self.server;
            let _ = server.txbuffer.flush(&mut server.txqueue, &mut stream);
        }

        self.server.txqueue.clear();
        self.server.toqueue.clear();
        self.server.txbuffer.clear();
        self.server.rxbuffer.reset();
        self.server.write_blocked = false;
        self.server.status = ServerStatus::Disconnected;
    }

    /// Resolve and connect synchronously. Used once at startup, where
    /// failure is a clean exit with the right code.
    pub fn connect_blocking(&mut self) -> Result<(), StartupError> {
        let host = self
            .dest_host
            .clone()
            .ok_or_else(|| StartupError::new(EXIT_NOHOST, "No hostname to connect to."))?;
        let port = self
            .dest_port
            .ok_or_else(|| StartupError::new(EXIT_NOHOST, "No port number to connect to."))?;

        self.server.host = Some(host.clone());
        self.server.port = Some(port);

        let addrs: Vec<SocketAddr> = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|err| {
                StartupError::new(
                    EXIT_RESOLV,
                    format!("Could not resolve `{}': {}", host, err),
                )
            })?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match std::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        last_error = Some(err);
                        continue;
                    }
                    self.server.address = Some(addr.ip().to_string());
                    self.server_connected(TcpStream::from_std(stream));
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(StartupError::new(
            EXIT_CONNECT,
            match last_error {
                Some(err) => format!("Could not connect to `{}' port {}: {}", host, port, err),
                None => format!("Could not connect to `{}' port {}.", host, port),
            },
        ))
    }

    /* ----- Queue routing and trimming. ----- */

    /// Route the client-bound to-queue: log-worthy lines are duplicated
    /// to the MUD log; with a client attached, history-worthy lines are
    /// duplicated into the possibly-new queue and the original goes out;
    /// without one, lines are buffered (or destroyed if unbufferable).
    pub fn route_client_toqueue(&mut self) {
        while let Some(mut line) = self.client.toqueue.pop() {
            if self.logging_enabled && line.flags & LINE_DONTLOG == 0 {
                self.mudlog.enqueue(line.dup());
            }
            line.flags |= LINE_DONTLOG;

            if self.client.is_connected() {
                if line.flags & LINE_NOHIST == 0 {
                    self.inactive.append(line.dup());
                }
                line.flags |= LINE_NOHIST;
                self.client.txqueue.append(line);
            } else if line.flags & LINE_DONTBUF == 0 {
                self.buffered.append(line);
            }
        }
    }

    /// Merge the server to-queue into its TX queue, preserving order.
    pub fn route_server_toqueue(&mut self) {
        let mut toqueue = mem::take(&mut self.server.toqueue);
        self.server.txqueue.merge(&mut toqueue);
        self.server.toqueue = toqueue;
    }

    /// Possibly-new lines are confirmed seen.
    pub fn inactive_to_history(&mut self) {
        let mut inactive = mem::take(&mut self.inactive);
        self.history.merge(&mut inactive);
        self.inactive = inactive;
    }

    /// Replay context and buffered lines to a newly attached client.
    pub fn recall_and_pass(&mut self) {
        if self.context_on_connect > 0 && !self.history.is_empty() {
            let mut context = self.recall_history(self.context_on_connect);
            let text = format!("{} lines of context history follow.", context.count());
            self.msg_client(&text);
            self.client.toqueue.merge(&mut context);
            self.msg_client("End of context history.");
        }

        if !self.inactive.is_empty() {
            let text = format!("{} possibly new lines follow.", self.inactive.count());
            self.msg_client(&text);

            let mut replay = LineQueue::new();
            for line in self.inactive.iter() {
                let mut copy = Line::with_time(util::strip_bell(&line.text), line.time);
                copy.flags = LINE_RECALLED;
                replay.append(copy);
            }
            self.client.toqueue.merge(&mut replay);
            self.msg_client("End of possibly new lines.");
            self.inactive_to_history();
        }

        let text = format!("{} lines waiting.", self.buffered.count());
        self.msg_client(&text);
        self.pass_buffered();
    }

    /// Recall (at most) `count` lines from history: copies with BELLs
    /// stripped, flagged as recalled.
    pub fn recall_history(&self, count: usize) -> LineQueue {
        let mut out = LineQueue::new();
        let skip = self.history.count().saturating_sub(count);

        for line in self.history.iter().skip(skip) {
            let mut copy = Line::with_time(util::strip_bell(&line.text), line.time);
            copy.flags = LINE_RECALLED;
            out.append(copy);
        }

        out
    }

    /// Pass all buffered lines towards the client.
    pub fn pass_buffered(&mut self) {
        let mut buffered = mem::take(&mut self.buffered);
        self.client.toqueue.merge(&mut buffered);
        self.buffered = buffered;
    }

    /// Bound the dynamic queues, dropping the oldest lines. Runs every
    /// loop pass so memory stays bounded across bursts.
    pub fn trim_dynamic_queues(&mut self) {
        while self.buffered.length() > self.max_buffered_size {
            self.buffered.pop();
            self.dropped_buffered += 1;
        }
        while self.inactive.length() > self.max_history_size {
            self.inactive.pop();
            self.dropped_inactive += 1;
        }
        while self.history.length() > self.max_history_size {
            self.history.pop();
        }
    }

    /* ----- Timer hooks. ----- */

    pub fn timer_tick(&mut self, t: i64) {
        let ticks = self.timer.tick(t);

        if ticks.second {
            self.tick_second(t);
        }
        if ticks.day {
            self.tick_day(t);
        }
        if ticks.year {
            self.tick_year(t);
        }
    }

    fn tick_second(&mut self, t: i64) {
        if t - self.auth_last_refill >= AUTH_BUCKET_REFILL_SECS {
            self.auth_bucket.refill();
            self.auth_last_refill = t;
        }

        if self.server.status == ServerStatus::Connected
            && t - self.server.last_decay >= RECONNECT_DECAY_SECS
        {
            self.server.reconnect_delay =
                (self.server.reconnect_delay - RECONNECT_DELAY_STEP).max(0);
            self.server.last_decay = t;
        }

        if self.server.status == ServerStatus::ReconnectWait && t >= self.server.reconnect_at {
            self.flags |= WLD_RECONNECT;
        }
    }

    fn tick_day(&mut self, t: i64) {
        self.mudlog.close();
        self.checkpoint_client(&util::time_string(t, "Day changed to %A %d %b %Y."));
    }

    fn tick_year(&mut self, t: i64) {
        self.msg_client(&util::time_string(t, "Happy %Y!"));
    }

    /* ----- Odds and ends. ----- */

    /// Flush the MUD log, surfacing a (debounced) write error.
    pub fn flush_mudlog(&mut self) {
        let enabled = self.logging_enabled;
        if let Some(text) = self.mudlog.flush(enabled, util::current_time()) {
            self.msg_client(&text);
        }

        if self.mudlog.take_link_update() {
            self.flags |= WLD_LOGLINKUPDATE;
        }
    }

    /// Force the log closed; the next loggable line reopens it under
    /// the current settings.
    pub fn reinit_mudlog(&mut self) {
        self.mudlog.close();
    }

    /// Try to bind the requested listen port; keep the old listeners on
    /// failure.
    pub fn rebind_port(&mut self) {
        let port = match self.requested_listenport.take() {
            Some(port) => port,
            None => return,
        };

        match listener::bind_port(port) {
            Ok(result) => {
                for text in result.af_msg.clone() {
                    self.msg_client(&text);
                }
                let conclusion = result.conclusion.clone();
                self.listeners = result.listeners;
                self.listenport = Some(port);
                self.msg_client(&conclusion);
                info!(self.log, "listen port rebound"; "port" => port);
            }
            Err(err) => {
                for piece in err.message.split('\n') {
                    self.msg_client(piece);
                }
                let old = self
                    .listenport
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-1".to_owned());
                let text = format!("The listen port stays at {}.", old);
                self.msg_client(&text);
            }
        }
    }
}
