// The peer & RPC hub: a mesh transport with typed request/response
// messaging and a background listener. One `Hub` is the whole networking
// surface of a peer; every other component (chord adapter, chunk, net
// table) is handed an `Arc<Hub>` rather than reaching for a process-wide
// singleton (see Design Notes: global singletons become explicit context
// objects).

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::discovery::DiscoveryFile;
use crate::{Envelope, PeerId};
use submerge_base::{Error, Result};

#[cfg(test)]
use test_log::test;

pub type HandlerFn = Box<dyn Fn(&Envelope) -> Envelope + Send + Sync>;

/// Bind address, port search range, and request timeout for a `Hub`.
/// Separated from `submerge-admin`'s process-wide `Config` so this crate
/// doesn't depend on the ambient-config crate; `submerge-admin` produces
/// one of these when wiring a process together.
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub bind_host: String,
    pub port_range: std::ops::Range<u16>,
    pub request_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig { bind_host: "127.0.0.1".to_string(), port_range: 1024..65535, request_timeout: Duration::from_secs(5) }
    }
}

struct Connection {
    stream: Mutex<TcpStream>,
}

pub struct Hub {
    own_address: PeerId,
    listener: TcpListener,
    known: Mutex<BTreeSet<PeerId>>,
    connections: Mutex<BTreeMap<PeerId, Arc<Connection>>>,
    handlers: RwLock<BTreeMap<String, HandlerFn>>,
    terminate: Arc<AtomicBool>,
    initialized: AtomicBool,
    config: HubConfig,
    discovery: Mutex<DiscoveryFile>,
}

fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(bytes)
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

impl Hub {
    /// Binds the listener on a random port in `config.port_range`, but does
    /// not yet start accepting connections or talking to the discovery
    /// file: that happens in `init`.
    pub fn bind(config: HubConfig, discovery_path: impl Into<std::path::PathBuf>) -> Result<Arc<Hub>> {
        let mut last_err = None;
        for _ in 0..64 {
            let port = fastrand_port(&config.port_range);
            match TcpListener::bind((config.bind_host.as_str(), port)) {
                Ok(listener) => {
                    let own_address = PeerId(listener.local_addr()?);
                    return Ok(Arc::new(Hub {
                        own_address,
                        listener,
                        known: Mutex::new(BTreeSet::new()),
                        connections: Mutex::new(BTreeMap::new()),
                        handlers: RwLock::new(BTreeMap::new()),
                        terminate: Arc::new(AtomicBool::new(false)),
                        initialized: AtomicBool::new(false),
                        config,
                        discovery: Mutex::new(DiscoveryFile::new(discovery_path)),
                    }));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::from(last_err.unwrap()))
    }

    pub fn own_address(&self) -> PeerId {
        self.own_address
    }

    /// Must be called before `init`.
    pub fn register_handler(&self, kind: impl Into<String>, handler: HandlerFn) {
        if self.initialized.load(Ordering::SeqCst) {
            submerge_base::fatal("register_handler called after init");
        }
        self.handlers.write().unwrap().insert(kind.into(), handler);
    }

    /// Starts the listener thread, reads the discovery file, connects to
    /// and announces self to every peer already on the network, and prunes
    /// any that turn out unreachable.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        self.spawn_listener();

        let mut discovery = self.discovery.lock().unwrap();
        discovery.lock()?;
        let known = discovery.get_peers()?;
        drop(discovery);

        let mut unreachable = Vec::new();
        for peer in known {
            if peer == self.own_address {
                continue;
            }
            match self.request(peer, "discovery", &self.own_address) {
                Ok(env) if env.is_ack() => {}
                _ => unreachable.push(peer),
            }
        }
        let mut discovery = self.discovery.lock().unwrap();
        for peer in &unreachable {
            discovery.remove(*peer)?;
        }
        discovery.announce(self.own_address)?;
        discovery.unlock();
        Ok(())
    }

    fn spawn_listener(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        self.listener.set_nonblocking(true).expect("set_nonblocking");
        thread::spawn(move || {
            while !hub.terminate.load(Ordering::SeqCst) {
                match hub.listener.accept() {
                    Ok((stream, _addr)) => {
                        let hub = Arc::clone(&hub);
                        thread::spawn(move || hub.serve_connection(stream));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        warn!("listener accept error: {e}");
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        });
    }

    fn serve_connection(self: Arc<Self>, mut stream: TcpStream) {
        stream.set_nonblocking(false).ok();
        loop {
            let bytes = match read_frame(&mut stream) {
                Ok(b) => b,
                Err(_) => return, // peer disconnected
            };
            let envelope: Envelope = match rmp_serde::from_slice(&bytes) {
                Ok(e) => e,
                Err(e) => {
                    warn!("discarding malformed envelope: {e}");
                    continue;
                }
            };
            trace!("{} received request {}", self.own_address, envelope.kind);
            let response = self.dispatch(&envelope);
            let Ok(out) = rmp_serde::to_vec(&response) else { return };
            if write_frame(&mut stream, &out).is_err() {
                return;
            }
        }
    }

    fn dispatch(&self, envelope: &Envelope) -> Envelope {
        if envelope.kind == "discovery" {
            return self.handle_discovery(envelope);
        }
        let handlers = self.handlers.read().unwrap();
        match handlers.get(&envelope.kind) {
            Some(handler) => handler(envelope),
            None => submerge_base::fatal(format!("no handler registered for message type {}", envelope.kind)),
        }
    }

    fn handle_discovery(&self, envelope: &Envelope) -> Envelope {
        let peer: PeerId = match envelope.payload() {
            Ok(p) => p,
            Err(_) => return Envelope::invalid(self.own_address, "bad discovery payload"),
        };
        self.note_peer(peer);
        Envelope::ack(self.own_address)
    }

    fn note_peer(&self, peer: PeerId) {
        if peer == self.own_address {
            return;
        }
        self.known.lock().unwrap().insert(peer);
    }

    fn get_or_connect(&self, peer: PeerId) -> Result<Arc<Connection>> {
        {
            let connections = self.connections.lock().unwrap();
            if let Some(c) = connections.get(&peer) {
                return Ok(Arc::clone(c));
            }
        }
        let stream = TcpStream::connect(peer.0).map_err(|_| Error::peer_unreachable(peer.to_string()))?;
        stream.set_read_timeout(Some(self.config.request_timeout)).ok();
        let conn = Arc::new(Connection { stream: Mutex::new(stream) });
        self.known.lock().unwrap().insert(peer);
        let mut connections = self.connections.lock().unwrap();
        // Double-checked locking: someone may have connected while we dialed.
        let conn = connections.entry(peer).or_insert(conn);
        Ok(Arc::clone(conn))
    }

    /// Synchronous request/response, blocking with the configured timeout.
    /// Connects to `peer` if not already connected.
    pub fn request<T: serde::Serialize>(&self, peer: PeerId, kind: &str, payload: &T) -> Result<Envelope> {
        let conn = self.get_or_connect(peer)?;
        let envelope = Envelope::new(kind, self.own_address, payload)?;
        let bytes = rmp_serde::to_vec(&envelope)?;
        let result = (|| {
            let mut stream = conn.stream.lock().unwrap();
            write_frame(&mut stream, &bytes).map_err(|_| Error::peer_unreachable(peer.to_string()))?;
            let response_bytes = read_frame(&mut stream).map_err(|e| {
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                    Error::timeout()
                } else {
                    Error::peer_unreachable(peer.to_string())
                }
            })?;
            Ok(rmp_serde::from_slice(&response_bytes)?)
        })();
        if matches!(result, Err(Error::PeerUnreachable { .. })) {
            self.connections.lock().unwrap().remove(&peer);
        }
        result
    }

    /// Same as `request`, but documents that the caller treats `Timeout` as
    /// an expected, retryable outcome rather than an unusual failure.
    pub fn try_request<T: serde::Serialize>(&self, peer: PeerId, kind: &str, payload: &T) -> Result<Envelope> {
        self.request(peer, kind, payload)
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.known.lock().unwrap().iter().cloned().collect()
    }

    /// Drops a peer from both the connection pool and the known-peers set,
    /// e.g. after it turns out unreachable mid-broadcast.
    pub fn forget_peer(&self, peer: PeerId) {
        self.connections.lock().unwrap().remove(&peer);
        self.known.lock().unwrap().remove(&peer);
    }

    pub fn broadcast<T: serde::Serialize>(&self, kind: &str, payload: &T) -> BTreeMap<PeerId, Envelope> {
        let mut out = BTreeMap::new();
        for peer in self.known_peers() {
            match self.request(peer, kind, payload) {
                Ok(env) => {
                    out.insert(peer, env);
                }
                Err(e) => {
                    debug!("broadcast to {peer} failed, dropping from known peers: {e}");
                    self.forget_peer(peer);
                }
            }
        }
        out
    }

    pub fn undisputable_broadcast<T: serde::Serialize>(&self, kind: &str, payload: &T) -> bool {
        let known = self.known_peers();
        let responses = self.broadcast(kind, payload);
        known.len() == responses.len() && responses.values().all(|e| e.is_ack())
    }

    pub fn kill(&self) -> Result<()> {
        if self.terminate.swap(true, Ordering::SeqCst) {
            warn!("double termination");
            return Ok(());
        }
        self.connections.lock().unwrap().clear();
        self.known.lock().unwrap().clear();
        let mut discovery = self.discovery.lock().unwrap();
        discovery.lock()?;
        discovery.leave(self.own_address)?;
        discovery.unlock();
        Ok(())
    }
}

fn fastrand_port(range: &std::ops::Range<u16>) -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(range.start..range.end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn hub_at(dir: &std::path::Path) -> Arc<Hub> {
        Hub::bind(HubConfig::default(), dir.join("discovery.txt")).unwrap()
    }

    #[test]
    fn test_request_reply_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let a = hub_at(dir.path());
        let b = hub_at(dir.path());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        b.register_handler(
            "Ping",
            Box::new(move |env| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Envelope::new("Pong", env.sender, &()).unwrap()
            }),
        );
        a.init().unwrap();
        b.init().unwrap();
        let resp = a.request(b.own_address(), "Ping", &()).unwrap();
        assert_eq!(resp.kind, "Pong");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        a.kill().unwrap();
        b.kill().unwrap();
    }

    #[test]
    fn test_unreachable_peer_is_an_error_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let a = hub_at(dir.path());
        a.init().unwrap();
        let bogus = PeerId("127.0.0.1:1".parse().unwrap());
        assert!(a.request(bogus, "Ping", &()).is_err());
        a.kill().unwrap();
    }
}
