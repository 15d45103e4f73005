//! ## Trellis client
//!
//! A client attaches to one relay over mutually authenticated TLS and from
//! then on addresses every other client in the overlay by its 64-bit
//! handle. Payloads are end-to-end encrypted: the first message to a new
//! peer fetches its certificate through the overlay, wraps a fresh 32-byte
//! pair key under it and upgrades the pair to AES-CFB. The relays only ever
//! see ciphertext and routing metadata.
//!
//! ```no_run
//! use trellis_sdk::{Client, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), trellis_sdk::Error> {
//!     let client = Client::connect(ClientOptions::new(
//!         "127.0.0.1",
//!         4433,
//!         "client.crt",
//!         "client.key",
//!         "ca.crt",
//!     ))
//!     .await?;
//!
//!     let mut events = client.subscribe();
//!     client.send(b"hello", 0x1122334455667788).await?;
//!     println!("{:?}", events.recv().await);
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod crypto;

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rsa::RsaPrivateKey;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot,
    },
};

use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, RootCertStore,
        pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject},
    },
};

use codec::{Frame, Opcode};

use crate::chain::{Block, Chain};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    SessionTimeout,
    IntegrityFailure,
    ConnectionClosed,
    BadCertificate,
    CryptoFailed,
    Io(std::io::Error),
    Codec(codec::Error),
    Tls(tokio_rustls::rustls::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(value: tokio_rustls::rustls::Error) -> Self {
        Self::Tls(value)
    }
}

/// Connection options for one client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay host to attach to.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Path to the client certificate, PEM.
    pub cert: String,
    /// Path to the client private key, PEM.
    pub key: String,
    /// Path to the cluster certificate authority, PEM.
    pub ca: String,
    /// Read chunk size in bytes.
    pub buffer: usize,
    /// Wrap every pair's messages in the integrity chain.
    pub validate_chain: bool,
}

impl ClientOptions {
    pub fn new(host: &str, port: u16, cert: &str, key: &str, ca: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            cert: cert.to_string(),
            key: key.to_string(),
            ca: ca.to_string(),
            buffer: 4096,
            validate_chain: false,
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Decrypted application bytes from a peer.
    Message { from: u64, data: Vec<u8> },
    /// A block from this peer failed verification and was dropped.
    IntegrityFailure { from: u64 },
}

/// Everything known about one remote peer: its certificate once fetched,
/// the pair key once negotiated and the chain when validation is on.
#[derive(Default)]
struct Pair {
    cert: Option<Vec<u8>>,
    key: Option<[u8; crypto::KEY_SIZE]>,
    chain: Option<Chain>,
}

struct State {
    cert_der: Vec<u8>,
    private_key: RsaPrivateKey,
    validate: bool,
    pairs: Mutex<AHashMap<u64, Pair>>,
    subscribers: Mutex<Vec<UnboundedSender<Event>>>,
}

impl State {
    fn deliver(&self, event: Event) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// A peer wants to talk to us: remember its certificate and answer with
    /// our own so it can finish its key setup.
    fn on_cert_request(&self, frame: &Frame, writer: &UnboundedSender<Bytes>, handle: u64) {
        self.pairs.lock().entry(frame.from).or_default().cert = Some(frame.content.clone());

        let mut resp = Frame::new(Opcode::GetClientCertResp);
        resp.from = handle;
        resp.to = frame.from;
        resp.content = self.cert_der.clone();
        let _ = writer.send(resp.to_bytes());
    }

    fn on_cert(&self, frame: &Frame) {
        self.pairs.lock().entry(frame.from).or_default().cert = Some(frame.content.clone());
    }

    fn on_key(&self, frame: &Frame) {
        match crypto::unwrap_key(&frame.content, &self.private_key) {
            Ok(key) => {
                let mut pairs = self.pairs.lock();
                let pair = pairs.entry(frame.from).or_default();
                pair.key = Some(key);
                if self.validate && pair.chain.is_none() {
                    pair.chain = Some(Chain::new());
                }

                log::info!("pair session established: peer={}", frame.from);
            }
            Err(e) => log::warn!("pair key rejected: peer={}, err={e}", frame.from),
        }
    }

    fn on_data(&self, frame: &Frame) {
        let key = self.pairs.lock().get(&frame.from).and_then(|pair| pair.key);
        let Some(key) = key else {
            log::warn!("data without pair key dropped: peer={}", frame.from);
            return;
        };

        let plaintext = match crypto::open(&frame.content, &key) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::warn!("data decryption failed: peer={}, err={e}", frame.from);
                return;
            }
        };

        let data = if self.validate {
            let block = match Block::decode(&plaintext) {
                Ok(block) => block,
                Err(e) => {
                    log::warn!("block decode failed: peer={}, err={e}", frame.from);
                    return;
                }
            };

            let verified = {
                let mut pairs = self.pairs.lock();
                let Some(chain) = pairs
                    .get_mut(&frame.from)
                    .and_then(|pair| pair.chain.as_mut())
                else {
                    log::warn!("block without chain dropped: peer={}", frame.from);
                    return;
                };

                chain.verify_append(block).map(|block| block.data.clone())
            };

            match verified {
                Ok(data) => data,
                Err(_) => {
                    log::warn!("chain verification failed: peer={}", frame.from);
                    self.deliver(Event::IntegrityFailure { from: frame.from });
                    return;
                }
            }
        } else {
            plaintext
        };

        self.deliver(Event::Message {
            from: frame.from,
            data,
        });
    }
}

/// A registered client session with one relay.
pub struct Client {
    handle: u64,
    relay: u64,
    writer: UnboundedSender<Bytes>,
    state: Arc<State>,
}

impl Client {
    /// Attach to the relay, register and wait for the assigned handle.
    pub async fn connect(options: ClientOptions) -> Result<Self, Error> {
        let cert_der = crypto::load_certificate(&options.cert)?;
        let private_key = crypto::load_private_key(&options.key)?;

        let certs = CertificateDer::pem_file_iter(&options.cert)
            .map_err(|_| Error::BadCertificate)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| Error::BadCertificate)?;
        let key = PrivateKeyDer::from_pem_file(&options.key).map_err(|_| Error::BadCertificate)?;

        let mut roots = RootCertStore::empty();
        for root in CertificateDer::pem_file_iter(&options.ca).map_err(|_| Error::BadCertificate)? {
            roots.add(root.map_err(|_| Error::BadCertificate)?)?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(Arc::new(roots))
            .with_client_auth_cert(certs, key)?;
        let connector = TlsConnector::from(Arc::new(config));

        let socket = TcpStream::connect((options.host.as_str(), options.port)).await?;
        socket.set_nodelay(true)?;

        let name =
            ServerName::try_from(options.host.clone()).map_err(|_| Error::InvalidInput)?;
        let stream = connector.connect(name, socket).await?;

        let state = Arc::new(State {
            cert_der,
            private_key,
            validate: options.validate_chain,
            pairs: Mutex::new(AHashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        });

        let (writer, outbound) = unbounded_channel();
        let (ready, registered) = oneshot::channel();

        tokio::spawn(io_task(
            stream,
            state.clone(),
            writer.clone(),
            outbound,
            ready,
            options.buffer.max(codec::HEADER_SIZE),
        ));

        let (relay, handle) = registered.await.map_err(|_| Error::ConnectionClosed)?;
        log::info!("registered: relay={relay}, handle={handle}");

        Ok(Self {
            handle,
            relay,
            writer,
            state,
        })
    }

    /// The handle this relay assigned to us; other clients reach us by it.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// The id of the relay we are attached to.
    pub fn relay(&self) -> u64 {
        self.relay
    }

    /// Deliver `bytes` to the client with handle `dest`, encrypted under
    /// the pair key shared only with it.
    ///
    /// The first call to a new destination performs setup: the peer's
    /// certificate is fetched through the overlay (polled for up to 30
    /// seconds), a fresh pair key is wrapped under it and announced, and
    /// only then does the payload go out. Later calls reuse the cached
    /// state and return quickly.
    pub async fn send(&self, bytes: &[u8], dest: u64) -> Result<(), Error> {
        let cert = self.pair_cert(dest);
        let cert = match cert {
            Some(cert) => cert,
            None => {
                let mut request = Frame::new(Opcode::GetClientCert);
                request.from = self.handle;
                request.to = dest;
                request.content = self.state.cert_der.clone();
                self.write(&request)?;

                let mut attempts = 0;
                loop {
                    if let Some(cert) = self.pair_cert(dest) {
                        break cert;
                    }

                    if attempts >= 30 {
                        return Err(Error::SessionTimeout);
                    }

                    attempts += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        let key = self.state.pairs.lock().get(&dest).and_then(|pair| pair.key);
        let key = match key {
            Some(key) => key,
            None => {
                let key = crypto::generate_key();
                {
                    let mut pairs = self.state.pairs.lock();
                    let pair = pairs.entry(dest).or_default();
                    pair.key = Some(key);
                    if self.state.validate && pair.chain.is_none() {
                        pair.chain = Some(Chain::new());
                    }
                }

                let mut announce = Frame::new(Opcode::AesKey);
                announce.from = self.handle;
                announce.to = dest;
                announce.content = crypto::wrap_key(&key, &cert)?;
                self.write(&announce)?;
                key
            }
        };

        let plaintext = if self.state.validate {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();

            let mut pairs = self.state.pairs.lock();
            let chain = pairs
                .entry(dest)
                .or_default()
                .chain
                .get_or_insert_with(Chain::new);
            chain.append(bytes, timestamp).encode_to_vec()
        } else {
            bytes.to_vec()
        };

        let mut frame = Frame::new(Opcode::Data);
        frame.from = self.handle;
        frame.to = dest;
        frame.content = crypto::seal(&plaintext, &key);
        self.write(&frame)
    }

    /// Receive decrypted messages and integrity verdicts.
    ///
    /// Every subscriber gets its own copy of every event; a dropped
    /// receiver unsubscribes itself.
    pub fn subscribe(&self) -> UnboundedReceiver<Event> {
        let (sender, receiver) = unbounded_channel();
        self.state.subscribers.lock().push(sender);
        receiver
    }

    /// Probe the relay; it answers with a pong that shows up in the logs.
    pub fn ping(&self) -> Result<(), Error> {
        let mut frame = Frame::new(Opcode::Ping);
        frame.from = self.handle;
        self.write(&frame)
    }

    fn pair_cert(&self, dest: u64) -> Option<Vec<u8>> {
        self.state
            .pairs
            .lock()
            .get(&dest)
            .and_then(|pair| pair.cert.clone())
    }

    fn write(&self, frame: &Frame) -> Result<(), Error> {
        self.writer
            .send(frame.to_bytes())
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// The session task: registration handshake, then reading frames off the
/// relay session while flushing whatever `send` queued.
async fn io_task<S>(
    mut stream: S,
    state: Arc<State>,
    writer: UnboundedSender<Bytes>,
    mut outbound: UnboundedReceiver<Bytes>,
    ready: oneshot::Sender<(u64, u64)>,
    chunk_size: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ready = Some(ready);
    let mut relay = 0u64;
    let mut handle = 0u64;

    let mut pending = BytesMut::new();
    let mut chunk = vec![0u8; chunk_size];

    'session: loop {
        tokio::select! {
            result = stream.read(&mut chunk) => {
                let size = match result {
                    Ok(0) | Err(_) => break 'session,
                    Ok(size) => size,
                };

                pending.extend_from_slice(&chunk[..size]);

                while pending.len() >= codec::HEADER_SIZE {
                    let size = match Frame::message_size(&pending) {
                        Ok(size) => size,
                        Err(_) => break 'session,
                    };

                    if pending.len() < size {
                        break;
                    }

                    let bytes = pending.split_to(size);
                    let frame = match Frame::decode(&bytes) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("frame dropped: err={e}");
                            continue;
                        }
                    };

                    match frame.opcode {
                        Opcode::PeerId => {
                            relay = frame.from;
                            let _ = writer.send(Frame::new(Opcode::RegisterClient).to_bytes());
                        }
                        Opcode::RegisterClientResp => {
                            handle = frame.to;
                            if let Some(ready) = ready.take() {
                                let _ = ready.send((relay, handle));
                            }
                        }
                        Opcode::GetClientCert => state.on_cert_request(&frame, &writer, handle),
                        Opcode::GetClientCertResp => state.on_cert(&frame),
                        Opcode::AesKey => state.on_key(&frame),
                        Opcode::Data => state.on_data(&frame),
                        Opcode::ClientNonExistent => {
                            log::warn!("relay knows no client: handle={}", frame.from);
                        }
                        Opcode::Pong => {
                            log::trace!("pong: relay={}", frame.from);
                        }
                        opcode => {
                            log::trace!("unhandled frame dropped: opcode={opcode:?}");
                        }
                    }
                }
            }
            Some(bytes) = outbound.recv() => {
                if stream.write_all(&bytes).await.is_err() {
                    break 'session;
                }
            }
        }
    }

    log::info!("relay session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    use rsa::{Oaep, RsaPublicKey};
    use sha2::Sha512;

    fn state(validate: bool) -> (Arc<State>, RsaPublicKey) {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = RsaPublicKey::from(&private_key);

        let state = Arc::new(State {
            cert_der: b"self certificate".to_vec(),
            private_key,
            validate,
            pairs: Mutex::new(AHashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        });

        (state, public)
    }

    fn subscribe(state: &State) -> UnboundedReceiver<Event> {
        let (sender, receiver) = unbounded_channel();
        state.subscribers.lock().push(sender);
        receiver
    }

    fn key_frame(from: u64, public: &RsaPublicKey, key: &[u8; crypto::KEY_SIZE]) -> Frame {
        let mut frame = Frame::new(Opcode::AesKey);
        frame.from = from;
        frame.content = public
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha512>(), &key[..])
            .unwrap();
        frame
    }

    fn data_frame(from: u64, key: &[u8; crypto::KEY_SIZE], plaintext: &[u8]) -> Frame {
        let mut frame = Frame::new(Opcode::Data);
        frame.from = from;
        frame.content = crypto::seal(plaintext, key);
        frame
    }

    #[test]
    fn cert_request_is_stored_and_answered() {
        let (state, _) = state(false);
        let (writer, mut written) = unbounded_channel();

        let mut request = Frame::new(Opcode::GetClientCert);
        request.from = 7;
        request.content = b"peer certificate".to_vec();
        state.on_cert_request(&request, &writer, 42);

        assert_eq!(
            state.pairs.lock().get(&7).unwrap().cert.as_deref(),
            Some(&b"peer certificate"[..])
        );

        let resp = Frame::decode(&written.try_recv().unwrap()).unwrap();
        assert_eq!(resp.opcode, Opcode::GetClientCertResp);
        assert_eq!(resp.from, 42);
        assert_eq!(resp.to, 7);
        assert_eq!(resp.content, b"self certificate");
    }

    #[test]
    fn pair_key_unwraps_and_unlocks_the_data_path() {
        let (state, public) = state(false);
        let mut events = subscribe(&state);

        let key = crypto::generate_key();
        state.on_key(&key_frame(7, &public, &key));
        assert_eq!(state.pairs.lock().get(&7).unwrap().key, Some(key));

        state.on_data(&data_frame(7, &key, b"hello"));
        assert_eq!(
            events.try_recv().unwrap(),
            Event::Message {
                from: 7,
                data: b"hello".to_vec()
            }
        );
    }

    #[test]
    fn data_without_a_pair_key_is_dropped() {
        let (state, _) = state(false);
        let mut events = subscribe(&state);

        state.on_data(&data_frame(7, &crypto::generate_key(), b"hello"));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn chained_messages_verify_and_tampering_is_reported() {
        let (state, public) = state(true);
        let mut events = subscribe(&state);

        let key = crypto::generate_key();
        state.on_key(&key_frame(7, &public, &key));

        let mut sender_chain = Chain::new();
        for data in [&b"a"[..], b"b", b"c"] {
            let block = sender_chain.append(data, 1700000000).encode_to_vec();
            state.on_data(&data_frame(7, &key, &block));

            assert_eq!(
                events.try_recv().unwrap(),
                Event::Message {
                    from: 7,
                    data: data.to_vec()
                }
            );
        }

        let chain_len = |state: &State| {
            state
                .pairs
                .lock()
                .get(&7)
                .and_then(|pair| pair.chain.as_ref().map(Chain::len))
                .unwrap()
        };
        assert_eq!(chain_len(&state), 4);

        // A block tampered in flight fails verification, is reported and
        // does not advance the chain.
        let mut block = sender_chain.append(b"d", 1700000100).clone();
        block.data[0] ^= 1;
        state.on_data(&data_frame(7, &key, &block.encode_to_vec()));

        assert_eq!(events.try_recv().unwrap(), Event::IntegrityFailure { from: 7 });
        assert_eq!(chain_len(&state), 4);
    }

    /// A client wired to a bare channel instead of a relay session, so the
    /// frames `send` produces can be inspected directly.
    fn client(state: Arc<State>) -> (Arc<Client>, UnboundedReceiver<Bytes>) {
        let (writer, written) = unbounded_channel();

        let client = Arc::new(Client {
            handle: 42,
            relay: 0,
            writer,
            state,
        });

        (client, written)
    }

    /// Self-signed certificate over the given RSA key, DER.
    fn self_signed_cert(key: &RsaPrivateKey) -> Vec<u8> {
        use rsa::pkcs8::EncodePrivateKey;

        let der = key.to_pkcs8_der().unwrap();
        let key_pair = rcgen::KeyPair::try_from(der.as_bytes()).unwrap();

        rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap()
            .der()
            .as_ref()
            .to_vec()
    }

    fn recv_frame(written: &mut UnboundedReceiver<Bytes>) -> Frame {
        Frame::decode(&written.try_recv().expect("frame queued")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn send_bootstraps_the_pair_then_reuses_it() {
        let (state, _) = state(false);
        let (client, mut written) = client(state.clone());

        let peer_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let peer_cert = self_signed_cert(&peer_key);

        let sender = client.clone();
        let task = tokio::spawn(async move { sender.send(b"hello", 7).await });

        // The first frame out asks the peer for its certificate, carrying
        // our own.
        let request = Frame::decode(&written.recv().await.unwrap()).unwrap();
        assert_eq!(request.opcode, Opcode::GetClientCert);
        assert_eq!(request.from, 42);
        assert_eq!(request.to, 7);
        assert_eq!(request.content, b"self certificate");

        // Answer it the way the overlay would; the poll picks it up.
        let mut resp = Frame::new(Opcode::GetClientCertResp);
        resp.from = 7;
        resp.content = peer_cert;
        state.on_cert(&resp);

        task.await.unwrap().unwrap();

        // Then the pair key, wrapped so only the peer can unwrap it.
        let announce = recv_frame(&mut written);
        assert_eq!(announce.opcode, Opcode::AesKey);
        assert_eq!(announce.from, 42);
        assert_eq!(announce.to, 7);
        let key = crypto::unwrap_key(&announce.content, &peer_key).unwrap();

        // And finally the payload under that key.
        let data = recv_frame(&mut written);
        assert_eq!(data.opcode, Opcode::Data);
        assert_eq!(data.from, 42);
        assert_eq!(data.to, 7);
        assert_eq!(crypto::open(&data.content, &key).unwrap(), b"hello");

        // A second send reuses the cached pair and goes straight to data.
        client.send(b"again", 7).await.unwrap();

        let data = recv_frame(&mut written);
        assert_eq!(data.opcode, Opcode::Data);
        assert_eq!(crypto::open(&data.content, &key).unwrap(), b"again");
        assert!(written.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn send_times_out_when_no_certificate_arrives() {
        let (state, _) = state(false);
        let (client, mut written) = client(state);

        let err = client.send(b"hello", 9).await.unwrap_err();
        assert!(matches!(err, Error::SessionTimeout));

        // Only the unanswered certificate request made it out.
        let request = recv_frame(&mut written);
        assert_eq!(request.opcode, Opcode::GetClientCert);
        assert!(written.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_wraps_chained_payloads() {
        let (state, _) = state(true);
        let (client, mut written) = client(state.clone());

        let peer_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();

        // Certificate already cached, so send runs straight through setup.
        let mut resp = Frame::new(Opcode::GetClientCertResp);
        resp.from = 7;
        resp.content = self_signed_cert(&peer_key);
        state.on_cert(&resp);

        client.send(b"hello", 7).await.unwrap();

        let announce = recv_frame(&mut written);
        assert_eq!(announce.opcode, Opcode::AesKey);
        let key = crypto::unwrap_key(&announce.content, &peer_key).unwrap();

        let data = recv_frame(&mut written);
        let block = Block::decode(&crypto::open(&data.content, &key).unwrap()).unwrap();
        assert_eq!(block.id, 1);
        assert_eq!(block.data, b"hello");

        // A receiver seeded with the same genesis accepts the block.
        let mut mirror = Chain::new();
        assert!(mirror.verify_append(block).is_ok());
    }
}
