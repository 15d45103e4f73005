use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::{Bytes, BytesMut};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc::unbounded_channel,
};

use tokio_rustls::{TlsConnector, rustls::pki_types::ServerName};

use codec::Frame;

use crate::{
    config::Config,
    relay::{Origin, Relay},
};

/// Bind the listener, start the accept loop and schedule the peer dials.
///
/// Returns once the relay is listening; the session tasks keep running in
/// the background. A listen or TLS setup failure is fatal, a failed peer
/// dial is only logged.
pub async fn run(config: Arc<Config>, relay: Arc<Relay>) -> Result<()> {
    let identity = crate::tls::Identity::new(&config.cert, &config.key, &config.ca)?;
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let acceptor = identity.acceptor.clone();
    {
        let relay = relay.clone();
        let config = config.clone();

        tokio::spawn(async move {
            while let Ok((socket, address)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let relay = relay.clone();
                let config = config.clone();

                tokio::spawn(async move {
                    // Any received frame should be forwarded as soon as
                    // possible, so the Nagle algorithm is disabled.
                    if let Err(e) = socket.set_nodelay(true) {
                        log::error!("set nodelay failed: addr={address}, err={e}");
                    }

                    let stream = match acceptor.accept(socket).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            log::warn!("tls accept failed: addr={address}, err={e}");
                            return;
                        }
                    };

                    log::info!("session accepted: addr={address}, interface={local_addr}");
                    session(relay, stream, address, config.buffer).await;
                });
            }

            log::error!("listener closed: interface={local_addr}");
        });
    }

    {
        let relay = relay.clone();
        let connector = identity.connector.clone();
        let config = config.clone();

        tokio::spawn(async move {
            // Give the other relays a moment to bind before dialing out.
            tokio::time::sleep(Duration::from_millis(config.timeout)).await;

            for peer in &config.peers {
                if peer.is_empty() {
                    continue;
                }

                tokio::spawn(dial(
                    connector.clone(),
                    peer.clone(),
                    relay.clone(),
                    config.buffer,
                ));
            }
        });
    }

    log::info!(
        "relay listening: id={}, interface={}, peers={}",
        relay.id(),
        local_addr,
        config.peers.len()
    );

    Ok(())
}

/// Dial one peer relay and run a session over the connection.
async fn dial(connector: TlsConnector, address: String, relay: Arc<Relay>, buffer: usize) {
    let socket = match TcpStream::connect(&address).await {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("peer dial failed: addr={address}, err={e}");
            return;
        }
    };

    if let Err(e) = socket.set_nodelay(true) {
        log::error!("set nodelay failed: addr={address}, err={e}");
    }

    let peer_addr = match socket.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::warn!("peer addr failed: addr={address}, err={e}");
            return;
        }
    };

    let host = address.rsplit_once(':').map(|(host, _)| host).unwrap_or(&address);
    let name = match ServerName::try_from(host.to_string()) {
        Ok(name) => name,
        Err(e) => {
            log::warn!("invalid peer name: addr={address}, err={e}");
            return;
        }
    };

    let stream = match connector.connect(name, socket).await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("tls connect failed: addr={address}, err={e}");
            return;
        }
    };

    log::info!("peer session open: addr={address}");
    session(relay, stream, peer_addr, buffer).await;
}

/// One session task: announce ourselves, then alternate between reading
/// frames off the socket and flushing frames other tasks queued for it.
///
/// The reader accumulates `buffer`-sized chunks and only hands complete
/// frames to dispatch, so a frame may span any number of reads. On any read
/// or write error the task cleans its directory entry up and exits.
async fn session<S>(relay: Arc<Relay>, mut stream: S, address: SocketAddr, buffer: usize)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sender, mut outbound) = unbounded_channel::<Bytes>();
    let mut origin = Origin::Unknown;

    if stream.write_all(&relay.hello().to_bytes()).await.is_err() {
        return;
    }

    let mut pending = BytesMut::new();
    let mut chunk = vec![0u8; buffer.max(codec::HEADER_SIZE)];

    'session: loop {
        tokio::select! {
            result = stream.read(&mut chunk) => {
                let size = match result {
                    Ok(0) | Err(_) => break 'session,
                    Ok(size) => size,
                };

                pending.extend_from_slice(&chunk[..size]);
                log::trace!("session read: size={size}, addr={address}");

                while pending.len() >= codec::HEADER_SIZE {
                    let size = match Frame::message_size(&pending) {
                        Ok(size) => size,
                        Err(_) => break 'session,
                    };

                    if pending.len() < size {
                        break;
                    }

                    let bytes = pending.split_to(size);
                    match Frame::decode(&bytes) {
                        Ok(frame) => relay.dispatch(&mut origin, &sender, frame),
                        Err(e) => {
                            log::warn!("frame dropped: addr={address}, err={e}");
                        }
                    }
                }
            }
            Some(bytes) = outbound.recv() => {
                if stream.write_all(&bytes).await.is_err() {
                    break 'session;
                }

                log::trace!("session write: size={}, addr={address}", bytes.len());
            }
        }
    }

    relay.disconnect(&origin, &sender);
    log::info!("session closed: addr={address}");
}
