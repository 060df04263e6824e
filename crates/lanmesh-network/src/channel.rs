//! TLS Channels
//!
//! Duplex TLS connections over TCP in two roles. [`TlsDialer`] initiates a
//! socket and verifies the peer certificate against the pinned
//! `<name>:<port>` common name; [`TlsListener`] accepts sockets and serves
//! its own self-signed certificate, minted when `listen` learns the bound
//! port. Both ends exchange [`Frame`]s inside the TLS stream and answer
//! heartbeat requests; keep-alive channels additionally run the prober from
//! [`crate::heartbeat`].
//!
//! Channel state is observable only through events. A dialer tags every
//! event with its configured tag (the peer user name) so one receiver can
//! watch a whole neighbor set.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

use lanmesh_crypto::cert::pinned_common_name;
use lanmesh_crypto::keys::RsaKeyMaterial;
use lanmesh_crypto::self_signed_cert_der;

use crate::error::{NetError, NetResult};
use crate::framing::{read_frame, write_frame, Base64Framed, Frame};
use crate::heartbeat::{spawn_prober, LivenessEvent};
use crate::verifier::PinnedCertVerifier;

fn install_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Events observable on a dialer-side channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// TCP connect completed
    SocketConnected,
    /// TLS handshake completed
    TlsConnected,
    /// Application bytes arrived
    Data(Vec<u8>),
    /// The underlying socket closed
    SocketClosed,
    /// The TLS session ended
    TlsClosed,
    /// Transport-level error
    SocketError(String),
    /// TLS-level error (handshake, record processing)
    TlsError(String),
    /// Heartbeat deadline missed (soft disconnect)
    Disconnected,
    /// Heartbeat resumed after a soft disconnect
    Reconnected,
}

/// Dialer events are tagged with the dialer's configured tag
pub type TaggedEventTx = mpsc::UnboundedSender<(String, ChannelEvent)>;

/// Configuration for a dialer-side channel
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Tag attached to every emitted event, usually the peer user name
    pub tag: String,
    /// Session-name half of the pinned common name
    pub expected_name: String,
    /// Run the heartbeat prober on this channel
    pub keep_alive: bool,
}

struct DialerShared {
    config: DialerConfig,
    events: TaggedEventTx,
    out: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DialerShared {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send((self.config.tag.clone(), event));
    }
}

/// Dialer-side TLS channel with pinned certificate verification
#[derive(Clone)]
pub struct TlsDialer {
    shared: Arc<DialerShared>,
}

impl TlsDialer {
    pub fn new(config: DialerConfig, events: TaggedEventTx) -> Self {
        Self {
            shared: Arc::new(DialerShared {
                config,
                events,
                out: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connect and complete the TLS handshake. Resolves once the handshake
    /// is done; the channel is ready to send immediately after.
    pub async fn connect(&self, host: IpAddr, port: u16) -> NetResult<()> {
        install_crypto_provider();
        let shared = &self.shared;

        let tcp = match TcpStream::connect((host, port)).await {
            Ok(tcp) => tcp,
            Err(e) => {
                shared.emit(ChannelEvent::SocketError(e.to_string()));
                return Err(NetError::ConnectionFailed(e.to_string()));
            }
        };
        tcp.set_nodelay(true).ok();
        shared.emit(ChannelEvent::SocketConnected);

        let verifier = Arc::new(PinnedCertVerifier::new(&shared.config.expected_name, port));
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let framed = Base64Framed::new(tcp);
        let stream = match connector.connect(ServerName::IpAddress(host.into()), framed).await {
            Ok(stream) => stream,
            Err(e) => {
                shared.emit(ChannelEvent::TlsError(e.to_string()));
                shared.emit(ChannelEvent::SocketClosed);
                return Err(NetError::TlsHandshake(e.to_string()));
            }
        };
        debug!(
            peer = %host,
            port,
            tag = %shared.config.tag,
            "dialer TLS channel established"
        );
        shared.emit(ChannelEvent::TlsConnected);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (hb_tx, hb_rx) = mpsc::unbounded_channel();
        *shared.out.lock().unwrap() = Some(out_tx.clone());

        let (read_half, write_half) = tokio::io::split(stream);
        let mut tasks = vec![
            tokio::spawn(write_loop(write_half, out_rx)),
            tokio::spawn(dialer_read_loop(read_half, shared.clone(), out_tx.clone(), hb_tx)),
        ];
        if shared.config.keep_alive {
            let prober_shared = shared.clone();
            tasks.push(spawn_prober(out_tx, hb_rx, move |event| {
                prober_shared.emit(match event {
                    LivenessEvent::Disconnected => ChannelEvent::Disconnected,
                    LivenessEvent::Reconnected => ChannelEvent::Reconnected,
                });
            }));
        }
        shared.tasks.lock().unwrap().extend(tasks);
        Ok(())
    }

    /// Enqueue application bytes; ordering is preserved per channel
    pub fn send(&self, bytes: Vec<u8>) -> NetResult<()> {
        let guard = self.shared.out.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Frame::Data(bytes))
                .map_err(|_| NetError::NotConnected),
            None => Err(NetError::NotConnected),
        }
    }

    /// Tear down the TLS session and the socket. Idempotent.
    pub async fn destroy(&self) {
        self.shared.out.lock().unwrap().take();
        let tasks: Vec<_> = self.shared.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Reset internal sockets so another `connect` can follow
    pub async fn rebuild(&self) {
        self.destroy().await;
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            trace!("channel write failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn dialer_read_loop<R>(
    mut reader: R,
    shared: Arc<DialerShared>,
    out_tx: mpsc::UnboundedSender<Frame>,
    hb_tx: mpsc::UnboundedSender<Vec<u8>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Data(bytes))) => shared.emit(ChannelEvent::Data(bytes)),
            Ok(Some(Frame::HeartbeatRequest(payload))) => {
                let _ = out_tx.send(Frame::HeartbeatResponse(payload));
            }
            Ok(Some(Frame::HeartbeatResponse(payload))) => {
                let _ = hb_tx.send(payload);
            }
            Ok(None) => {
                shared.emit(ChannelEvent::TlsClosed);
                shared.emit(ChannelEvent::SocketClosed);
                break;
            }
            Err(e) => {
                shared.emit(ChannelEvent::SocketError(e.to_string()));
                shared.emit(ChannelEvent::TlsClosed);
                shared.emit(ChannelEvent::SocketClosed);
                break;
            }
        }
    }
    shared.out.lock().unwrap().take();
}

/// Events observable on a listener, tagged with the accepted connection
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A TCP connection arrived
    Accepted {
        conn: u64,
        peer: SocketAddr,
        local: SocketAddr,
    },
    /// The TLS handshake on an accepted connection completed
    TlsConnected { conn: u64, peer: SocketAddr },
    /// Application bytes arrived on an accepted connection
    Data {
        conn: u64,
        peer: SocketAddr,
        local: SocketAddr,
        bytes: Vec<u8>,
    },
    /// An accepted connection ended
    Closed { conn: u64, peer: SocketAddr },
    /// Accept or handshake error
    Error {
        peer: Option<SocketAddr>,
        error: String,
    },
    /// Heartbeat deadline missed for an accepted connection
    PeerDisconnected { conn: u64, peer: SocketAddr },
    /// Heartbeat resumed for an accepted connection
    PeerReconnected { conn: u64, peer: SocketAddr },
}

struct ListenerShared {
    name: String,
    keep_alive: bool,
    events: mpsc::UnboundedSender<ListenerEvent>,
    conns: Mutex<HashMap<u64, mpsc::UnboundedSender<Frame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_conn: AtomicU64,
}

impl ListenerShared {
    fn emit(&self, event: ListenerEvent) {
        let _ = self.events.send(event);
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Listener-side TLS endpoint serving a self-signed certificate
#[derive(Clone)]
pub struct TlsListener {
    shared: Arc<ListenerShared>,
}

impl TlsListener {
    /// Create a listener for `name`; the certificate common name becomes
    /// `<name>:<port>` once `listen` runs. Returns the event receiver for
    /// this listener generation.
    pub fn new(name: &str, keep_alive: bool) -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::new(ListenerShared {
                    name: name.to_string(),
                    keep_alive,
                    events,
                    conns: Mutex::new(HashMap::new()),
                    tasks: Mutex::new(Vec::new()),
                    next_conn: AtomicU64::new(0),
                }),
            },
            rx,
        )
    }

    /// Bind the port and start accepting TLS connections
    pub async fn listen(&self, port: u16, key: &RsaKeyMaterial) -> NetResult<()> {
        install_crypto_provider();
        let shared = self.shared.clone();

        let cert = self_signed_cert_der(key, &pinned_common_name(&shared.name, port))?;
        let certs = vec![CertificateDer::from(cert)];
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.pkcs8_der().to_vec()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key_der)
            .map_err(|e| NetError::TlsConfig(e.to_string()))?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let tcp = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NetError::Bind(e.to_string()))?;
        debug!(name = %shared.name, port, "TLS listener up");

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match tcp.accept().await {
                    Ok((stream, peer)) => {
                        let conn_shared = accept_shared.clone();
                        let conn_acceptor = acceptor.clone();
                        let task = tokio::spawn(async move {
                            handle_conn(conn_shared, conn_acceptor, stream, peer).await;
                        });
                        accept_shared.track(task);
                    }
                    Err(e) => {
                        accept_shared.emit(ListenerEvent::Error {
                            peer: None,
                            error: e.to_string(),
                        });
                    }
                }
            }
        });
        shared.tasks.lock().unwrap().push(accept_task);
        Ok(())
    }

    /// Send application bytes on an accepted connection
    pub fn send_to(&self, conn: u64, bytes: Vec<u8>) -> NetResult<()> {
        let conns = self.shared.conns.lock().unwrap();
        match conns.get(&conn) {
            Some(tx) => tx
                .send(Frame::Data(bytes))
                .map_err(|_| NetError::NotConnected),
            None => Err(NetError::NotConnected),
        }
    }

    /// Stop accepting, close every connection. Idempotent.
    pub async fn destroy(&self) {
        self.shared.conns.lock().unwrap().clear();
        let tasks: Vec<_> = self.shared.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn handle_conn(
    shared: Arc<ListenerShared>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let conn = shared.next_conn.fetch_add(1, Ordering::SeqCst);
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            shared.emit(ListenerEvent::Error {
                peer: Some(peer),
                error: e.to_string(),
            });
            return;
        }
    };
    stream.set_nodelay(true).ok();
    shared.emit(ListenerEvent::Accepted { conn, peer, local });

    let framed = Base64Framed::new(stream);
    let tls = match acceptor.accept(framed).await {
        Ok(tls) => tls,
        Err(e) => {
            warn!(%peer, "TLS accept failed: {e}");
            shared.emit(ListenerEvent::Error {
                peer: Some(peer),
                error: e.to_string(),
            });
            return;
        }
    };
    shared.emit(ListenerEvent::TlsConnected { conn, peer });

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (hb_tx, hb_rx) = mpsc::unbounded_channel();
    shared.conns.lock().unwrap().insert(conn, out_tx.clone());

    let (mut read_half, write_half) = tokio::io::split(tls);
    shared.track(tokio::spawn(write_loop(write_half, out_rx)));
    if shared.keep_alive {
        let prober_shared = shared.clone();
        shared.track(spawn_prober(out_tx.clone(), hb_rx, move |event| {
            prober_shared.emit(match event {
                LivenessEvent::Disconnected => ListenerEvent::PeerDisconnected { conn, peer },
                LivenessEvent::Reconnected => ListenerEvent::PeerReconnected { conn, peer },
            });
        }));
    }

    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(Frame::Data(bytes))) => shared.emit(ListenerEvent::Data {
                conn,
                peer,
                local,
                bytes,
            }),
            Ok(Some(Frame::HeartbeatRequest(payload))) => {
                let _ = out_tx.send(Frame::HeartbeatResponse(payload));
            }
            Ok(Some(Frame::HeartbeatResponse(payload))) => {
                let _ = hb_tx.send(payload);
            }
            Ok(None) => break,
            Err(e) => {
                trace!(%peer, "listener connection read failed: {e}");
                break;
            }
        }
    }
    shared.conns.lock().unwrap().remove(&conn);
    shared.emit(ListenerEvent::Closed { conn, peer });
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanmesh_crypto::generate_rsa_key;

    async fn listener_on_free_port(
        name: &str,
        key: &RsaKeyMaterial,
    ) -> (TlsListener, mpsc::UnboundedReceiver<ListenerEvent>, u16) {
        let port = crate::port::open_port(None).await.unwrap();
        let (listener, rx) = TlsListener::new(name, false);
        listener.listen(port, key).await.unwrap();
        (listener, rx, port)
    }

    #[tokio::test]
    async fn test_handshake_and_data_both_ways() {
        let key = generate_rsa_key().await.unwrap();
        let (listener, mut listener_rx, port) = listener_on_free_port("blorp-glork", &key).await;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let dialer = TlsDialer::new(
            DialerConfig {
                tag: "host".into(),
                expected_name: "blorp-glork".into(),
                keep_alive: false,
            },
            event_tx,
        );
        dialer.connect("127.0.0.1".parse().unwrap(), port).await.unwrap();

        dialer.send(b"ping".to_vec()).unwrap();

        // listener sees accept, handshake, then the data
        let conn = loop {
            match listener_rx.recv().await.unwrap() {
                ListenerEvent::Data { conn, bytes, .. } => {
                    assert_eq!(bytes, b"ping");
                    break conn;
                }
                _ => continue,
            }
        };

        listener.send_to(conn, b"pong".to_vec()).unwrap();
        loop {
            let (tag, event) = event_rx.recv().await.unwrap();
            assert_eq!(tag, "host");
            match event {
                ChannelEvent::Data(bytes) => {
                    assert_eq!(bytes, b"pong");
                    break;
                }
                _ => continue,
            }
        }

        dialer.destroy().await;
        listener.destroy().await;
    }

    #[tokio::test]
    async fn test_wrong_session_name_fails_handshake() {
        let key = generate_rsa_key().await.unwrap();
        let (listener, _listener_rx, port) = listener_on_free_port("blorp-glork", &key).await;

        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let dialer = TlsDialer::new(
            DialerConfig {
                tag: "host".into(),
                expected_name: "other-session".into(),
                keep_alive: false,
            },
            event_tx,
        );
        let result = dialer.connect("127.0.0.1".parse().unwrap(), port).await;
        assert!(matches!(result, Err(NetError::TlsHandshake(_))));

        listener.destroy().await;
    }

    #[tokio::test]
    async fn test_cert_for_other_port_fails_handshake() {
        install_crypto_provider();
        let key = generate_rsa_key().await.unwrap();
        // certificate names a port that can never be the one being served
        let cert = self_signed_cert_der(&key, &pinned_common_name("blorp-glork", 1)).unwrap();
        let certs = vec![CertificateDer::from(cert)];
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.pkcs8_der().to_vec()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key_der)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let tcp = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let other_port = tcp.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = tcp.accept().await {
                let _ = acceptor.accept(Base64Framed::new(stream)).await;
            }
        });

        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let dialer = TlsDialer::new(
            DialerConfig {
                tag: "host".into(),
                expected_name: "blorp-glork".into(),
                keep_alive: false,
            },
            event_tx,
        );
        let result = dialer.connect("127.0.0.1".parse().unwrap(), other_port).await;
        assert!(matches!(result, Err(NetError::TlsHandshake(_))));
    }
}
