//! TCP chat relay behind `start_server`, `close_server`, `send` and
//! `start_client`.
//!
//! Frames are text lines terminated by CRLF (a bare LF is accepted on input).
//! The server runs on background threads of the shell process and broadcasts
//! every line it receives to all connected clients.

use crate::builtin::BuiltinCommand;
use crate::command::{ExitCode, Stdin};
use crate::env::Environment;
use anyhow::{Context, Result, anyhow, bail};
use argh::FromArgs;
use nix::errno::Errno;
use nix::unistd::{Pid, getpid, write};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound of a message built by `send`, CRLF included.
pub const MAX_USER_MSG: usize = 128;
/// Longest frame a client may send before it is cut.
pub const MAX_FRAME: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECTED_QUERY: &str = "\\connected";

struct Client {
    id: usize,
    stream: TcpStream,
}

#[derive(Default)]
struct Clients {
    list: Mutex<Vec<Client>>,
}

impl Clients {
    fn lock(&self) -> MutexGuard<'_, Vec<Client>> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(&self, frame: &str) {
        for client in self.lock().iter_mut() {
            if let Err(e) = client.stream.write_all(frame.as_bytes()) {
                warn!(client = client.id, error = %e, "relay broadcast failed");
            }
        }
    }

    fn reply(&self, id: usize, frame: &str) {
        if let Some(client) = self.lock().iter_mut().find(|c| c.id == id) {
            let _ = client.stream.write_all(frame.as_bytes());
        }
    }

    fn remove(&self, id: usize) {
        self.lock().retain(|c| c.id != id);
    }

    fn disconnect_all(&self) {
        for client in self.lock().drain(..) {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }
}

struct Server {
    addr: SocketAddr,
    /// Process that owns the server threads; forked children only see a copy.
    owner: Pid,
    stop: Arc<AtomicBool>,
    clients: Arc<Clients>,
    acceptor: JoinHandle<()>,
}

/// The relay server of a shell session, if one is running.
#[derive(Default)]
pub struct Relay {
    server: Option<Server>,
}

impl Relay {
    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// Address the running server listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    /// Binds `host:port` and starts serving on background threads.
    pub fn start(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        if self.server.is_some() {
            bail!("Server already running");
        }
        let listener = TcpListener::bind((host, port)).context("Address already in use")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let clients = Arc::new(Clients::default());
        let acceptor = {
            let stop = Arc::clone(&stop);
            let clients = Arc::clone(&clients);
            thread::Builder::new()
                .name("relay-accept".into())
                .spawn(move || accept_loop(listener, stop, clients))?
        };
        info!(%addr, "relay server started");
        self.server = Some(Server {
            addr,
            owner: getpid(),
            stop,
            clients,
            acceptor,
        });
        Ok(addr)
    }

    /// Stops accepting, disconnects every client and waits for the server threads.
    pub fn stop(&mut self) -> Result<()> {
        if self.server.as_ref().is_some_and(|s| s.owner != getpid()) {
            bail!("Server belongs to the interactive shell");
        }
        let server = self.server.take().ok_or_else(|| anyhow!("No server running"))?;
        server.stop.store(true, Ordering::SeqCst);
        server
            .acceptor
            .join()
            .map_err(|_| anyhow!("relay acceptor panicked"))?;
        server.clients.disconnect_all();
        info!(addr = %server.addr, "relay server stopped");
        Ok(())
    }
}

fn accept_loop(listener: TcpListener, stop: Arc<AtomicBool>, clients: Arc<Clients>) {
    let next_id = AtomicUsize::new(1);
    let mut readers = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                match register_client(id, stream, &stop, &clients) {
                    Ok(handle) => {
                        debug!(client = id, %peer, "relay client connected");
                        readers.push(handle);
                    }
                    Err(e) => warn!(%peer, error = %e, "Failed to add client"),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!(error = %e, "relay accept failed");
                break;
            }
        }
    }
    clients.disconnect_all();
    for reader in readers {
        let _ = reader.join();
    }
}

fn register_client(
    id: usize,
    stream: TcpStream,
    stop: &Arc<AtomicBool>,
    clients: &Arc<Clients>,
) -> io::Result<JoinHandle<()>> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let writer = stream.try_clone()?;
    clients.lock().push(Client { id, stream: writer });

    let stop = Arc::clone(stop);
    let clients = Arc::clone(clients);
    thread::Builder::new()
        .name(format!("relay-client-{id}"))
        .spawn(move || serve_client(id, stream, stop, clients))
}

fn serve_client(id: usize, stream: TcpStream, stop: Arc<AtomicBool>, clients: Arc<Clients>) {
    let mut reader = BufReader::new(stream);
    let mut frame = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        match reader.read_until(b'\n', &mut frame) {
            Ok(0) => break,
            Ok(_) => {
                handle_frame(id, &frame, &clients);
                frame.clear();
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // Partial frames stay buffered until the terminator arrives.
                if frame.len() > MAX_FRAME {
                    clients.reply(id, "Warning: message too long and may be truncated.\r\n");
                    frame.truncate(MAX_FRAME);
                    handle_frame(id, &frame, &clients);
                    frame.clear();
                }
            }
            Err(_) => break,
        }
    }
    clients.remove(id);
    debug!(client = id, "relay client disconnected");
}

fn handle_frame(id: usize, frame: &[u8], clients: &Clients) {
    let text = String::from_utf8_lossy(frame);
    let text = text.trim_end_matches(['\r', '\n']);
    if text.starts_with(CONNECTED_QUERY) {
        let connected = clients.lock().len();
        clients.reply(id, &format!("Client {id}: {connected} clients connected\r\n"));
        return;
    }
    let line = format!("client {id}: {text}");
    if let Err(e) = echo_line(io::stdout(), &line) {
        debug!(error = %e, "relay echo failed");
    }
    clients.broadcast(&format!("{line}\r\n"));
}

/// Writes `line` and a newline straight to `out` with write(2).
///
/// Relay threads never take the `Stdout` lock: the shell forks while they
/// run, and a child forked while the lock is held would block on its first
/// write.
fn echo_line(out: impl AsFd, line: &str) -> nix::Result<()> {
    let bytes = format!("{line}\n");
    let mut rest = bytes.as_bytes();
    while !rest.is_empty() {
        match write(out.as_fd(), rest) {
            Ok(n) => rest = &rest[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Joins `words` into one CRLF-terminated frame no longer than [`MAX_USER_MSG`].
pub fn build_message(words: &[String]) -> Result<String> {
    if words.is_empty() {
        bail!("No message provided");
    }
    let mut msg = words.join(" ");
    if msg.len() + 2 >= MAX_USER_MSG {
        bail!("Message too long");
    }
    msg.push_str("\r\n");
    Ok(msg)
}

fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| anyhow!("Invalid hostname or IP: {host}"))?;
    TcpStream::connect(addr).with_context(|| format!("connect to {addr}"))
}

/// Delivers one message to a relay server and disconnects.
pub fn send_message(port: u16, host: &str, words: &[String]) -> Result<()> {
    let frame = build_message(words)?;
    let mut stream = connect(host, port)?;
    stream
        .write_all(frame.as_bytes())
        .context("Failed to send message")?;
    stream.shutdown(Shutdown::Both).ok();
    Ok(())
}

/// Interactive session: lines from `input` go to the server, lines from the
/// server are printed to `output`. Ends on input EOF or server disconnect.
pub fn connect_interactive(
    port: u16,
    host: &str,
    input: &mut dyn BufRead,
    output: Arc<Mutex<dyn Write + Send>>,
) -> Result<()> {
    let mut stream = connect(host, port)?;
    let closed = Arc::new(AtomicBool::new(false));
    let receiver = {
        let reader = stream.try_clone()?;
        let closed = Arc::clone(&closed);
        let output = Arc::clone(&output);
        thread::Builder::new()
            .name("relay-receive".into())
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut frame = Vec::new();
                loop {
                    frame.clear();
                    match reader.read_until(b'\n', &mut frame) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let text = String::from_utf8_lossy(&frame);
                            let mut out = output.lock().unwrap_or_else(PoisonError::into_inner);
                            let _ = writeln!(out, "{}", text.trim_end_matches(['\r', '\n']));
                            let _ = out.flush();
                        }
                    }
                }
                if !closed.swap(true, Ordering::SeqCst) {
                    let mut out = output.lock().unwrap_or_else(PoisonError::into_inner);
                    let _ = writeln!(out, "\nServer disconnected");
                    let _ = out.flush();
                }
            })?
    };

    let mut line = String::new();
    while !closed.load(Ordering::SeqCst) {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim_end_matches(['\r', '\n']);
        if let Err(e) = stream.write_all(format!("{text}\r\n").as_bytes()) {
            debug!(error = %e, "relay client send failed");
            break;
        }
    }
    closed.store(true, Ordering::SeqCst);
    stream.shutdown(Shutdown::Both).ok();
    receiver
        .join()
        .map_err(|_| anyhow!("relay receiver panicked"))?;
    Ok(())
}

fn check_port(port: u16) -> Result<u16> {
    if port == 0 {
        bail!("Invalid port number");
    }
    Ok(port)
}

#[derive(FromArgs)]
/// start the chat relay server on a port.
pub struct StartServer {
    #[argh(positional)]
    /// port to listen on.
    pub port: u16,
}

impl BuiltinCommand for StartServer {
    fn name() -> &'static str {
        "start_server"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        _stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        env.relay.start("0.0.0.0", check_port(self.port)?)?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// stop the chat relay server.
pub struct CloseServer {}

impl BuiltinCommand for CloseServer {
    fn name() -> &'static str {
        "close_server"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        env.relay.stop()?;
        writeln!(stdout, "Server stopped")?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// send one message to a chat relay server.
pub struct SendMessage {
    #[argh(positional)]
    /// server port.
    pub port: u16,

    #[argh(positional)]
    /// server host name or address.
    pub host: String,

    #[argh(positional, greedy)]
    /// words of the message.
    pub message: Vec<String>,
}

impl BuiltinCommand for SendMessage {
    fn name() -> &'static str {
        "send"
    }

    fn execute(
        self,
        _stdin: &mut dyn Stdin,
        _stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        send_message(check_port(self.port)?, &self.host, &self.message)?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// chat with a relay server interactively until end of input.
pub struct StartClient {
    #[argh(positional)]
    /// server port.
    pub port: u16,

    #[argh(positional)]
    /// server host name or address.
    pub host: String,
}

impl BuiltinCommand for StartClient {
    fn name() -> &'static str {
        "start_client"
    }

    fn execute(
        self,
        stdin: &mut dyn Stdin,
        _stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let mut input = BufReader::new(stdin);
        let output: Arc<Mutex<dyn Write + Send>> = Arc::new(Mutex::new(io::stdout()));
        connect_interactive(check_port(self.port)?, &self.host, &mut input, output)?;
        Ok(0)
    }
}
