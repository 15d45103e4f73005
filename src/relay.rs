use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use codec::{Frame, Opcode};
use service::{bits, registry::Registry, routing};

/// Outbound handle of one session task.
pub type FrameSender = UnboundedSender<Bytes>;

/// What a session has identified itself as.
///
/// Every session starts out unknown; the first `PeerId` frame tags it as a
/// peer, a `RegisterClient` frame tags it as a client. The tag decides the
/// cleanup path when the session closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Unknown,
    Peer(u64),
    Client(u64),
}

/// One relay's forwarding state: its identity, the id width of the overlay
/// and the three shared directories.
///
/// Dispatch is synchronous; all writes go through the unbounded per-session
/// senders, so no lock is ever held across a suspension point.
pub struct Relay {
    id: u64,
    width: u32,
    registry: Registry<FrameSender>,
}

impl Relay {
    pub fn new(id: u64, nodes: usize) -> Self {
        assert!(nodes >= 2, "an overlay needs at least two relays");

        Self {
            id,
            width: bits::id_width(nodes),
            registry: Registry::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The identification frame sent first on every new session.
    pub fn hello(&self) -> Frame {
        let mut frame = Frame::new(Opcode::PeerId);
        frame.from = self.id;
        frame.from_node = self.id;
        frame
    }

    /// Handle one decoded frame from the session tagged `origin`.
    pub fn dispatch(&self, origin: &mut Origin, sender: &FrameSender, frame: Frame) {
        match frame.opcode {
            Opcode::PeerId => {
                log::info!("peer connected: id={}, relay={}", frame.from, self.id);
                self.registry.insert_peer(frame.from, sender.clone());
                *origin = Origin::Peer(frame.from);
            }
            Opcode::RegisterClient => {
                let handle = self.registry.register_client(sender.clone());
                *origin = Origin::Client(handle);
                log::info!("client registered: handle={}, relay={}", handle, self.id);

                let mut resp = Frame::new(Opcode::RegisterClientResp);
                resp.to = handle;
                resp.from_node = self.id;
                self.send(sender, &resp);

                let mut location = Frame::new(Opcode::ClientLocation);
                location.from = self.id;
                location.to = handle;
                location.already_been = vec![self.id];
                self.flood(&location);
            }
            Opcode::ClientLocation => {
                if !self.registry.learn_location(frame.to, frame.from) {
                    log::trace!(
                        "duplicate location dropped: handle={}, relay={}",
                        frame.to,
                        self.id
                    );
                    return;
                }

                let mut frame = frame;
                frame.already_been.push(self.id);
                self.flood(&frame);
            }
            Opcode::Data
            | Opcode::GetClientCert
            | Opcode::GetClientCertResp
            | Opcode::AesKey => self.forward(frame),
            Opcode::Ping => {
                let mut pong = Frame::new(Opcode::Pong);
                pong.from = self.id;
                self.send(sender, &pong);
            }
            Opcode::Pong => {
                log::trace!("pong received: from={}, relay={}", frame.from, self.id);
            }
            Opcode::RegisterClientResp | Opcode::ClientNonExistent => {
                log::warn!(
                    "unexpected {:?} dropped: relay={}",
                    frame.opcode,
                    self.id
                );
            }
        }
    }

    /// Remove the session from its directory when its task exits. The
    /// predicate makes sure a stale task does not evict a reconnect that
    /// reused the same id.
    pub fn disconnect(&self, origin: &Origin, sender: &FrameSender) {
        match origin {
            Origin::Peer(id) => {
                if self.registry.remove_peer_if(*id, |s| s.same_channel(sender)) {
                    log::info!("peer disconnected: id={}, relay={}", id, self.id);
                }
            }
            Origin::Client(handle) => {
                if self
                    .registry
                    .remove_client_if(*handle, |s| s.same_channel(sender))
                {
                    log::info!("client disconnected: handle={}, relay={}", handle, self.id);
                }
            }
            Origin::Unknown => {}
        }
    }

    /// Deliver a frame to its destination client, locally or through the
    /// overlay.
    ///
    /// The relay never looks inside `content`; it only rewrites the routing
    /// fields. A frame whose destination has not been gossiped yet is
    /// dropped; the sending client, if local, is told the handle is not
    /// known so interactive callers see more than silence.
    fn forward(&self, mut frame: Frame) {
        if let Some(client) = self.registry.client(frame.to) {
            self.send(&client, &frame);
            return;
        }

        let Some(node) = self.registry.location(frame.to) else {
            log::warn!(
                "destination unknown: handle={}, relay={}",
                frame.to,
                self.id
            );

            if let Some(sender) = self.registry.client(frame.from) {
                let mut missing = Frame::new(Opcode::ClientNonExistent);
                missing.from = frame.to;
                missing.to = frame.from;
                missing.from_node = self.id;
                self.send(&sender, &missing);
            }
            return;
        };

        if node == self.id {
            log::warn!(
                "destination client gone: handle={}, relay={}",
                frame.to,
                self.id
            );
            return;
        }

        let register = if frame.intermediate < 0 {
            node
        } else {
            frame.intermediate as u64
        };

        let hop = routing::next_hop(self.id, register, self.width);
        if hop.next == self.id {
            log::warn!(
                "routing failed to advance: handle={}, register={}, relay={}",
                frame.to,
                register,
                self.id
            );
            return;
        }

        frame.intermediate = hop.register as i64;
        frame.from_node = self.id;
        frame.to_node = hop.next;

        match self.registry.peer(hop.next) {
            Some(peer) => self.send(&peer, &frame),
            None => log::warn!(
                "no session for next hop: next={}, relay={}",
                hop.next,
                self.id
            ),
        }
    }

    /// Send to every peer not yet visited by this gossip frame.
    fn flood(&self, frame: &Frame) {
        let bytes = frame.to_bytes();

        for (id, peer) in self.registry.peers_except(&frame.already_been) {
            if peer.send(bytes.clone()).is_err() {
                log::warn!("gossip to closed peer dropped: peer={}, relay={}", id, self.id);
            }
        }
    }

    fn send(&self, sender: &FrameSender, frame: &Frame) {
        if sender.send(frame.to_bytes()).is_err() {
            log::warn!("write to closed session dropped: relay={}", self.id);
        }
    }
}
