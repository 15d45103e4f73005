//! The per-hop routing step.
//!
//! A frame crossing the overlay carries a shift register holding the not yet
//! consumed bits of its destination relay id. Each relay shifts its own id
//! left by one, injects the register's top bit and forwards to the resulting
//! id; after at most `width` productive hops the shifted id has turned into
//! the destination.

use crate::bits;

/// Result of advancing a frame by one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    /// The relay id to forward to.
    pub next: u64,
    /// The register value the frame must carry onward.
    pub register: u64,
}

/// Compute the next hop from `current` with the given shift register.
///
/// The register starts out as the destination relay id and must be threaded
/// through unchanged between the hops of one frame. A candidate equal to
/// `current` is not a hop; the step then retries with the already shifted
/// register, which consumes one destination bit without moving.
///
/// # Test
///
/// ```
/// use trellis_service::routing::next_hop;
///
/// // Four relays, sending from 0 toward 3.
/// let hop = next_hop(0, 3, 2);
/// assert_eq!((hop.next, hop.register), (1, 2));
///
/// let hop = next_hop(hop.next, hop.register, 2);
/// assert_eq!((hop.next, hop.register), (3, 0));
/// ```
pub fn next_hop(current: u64, register: u64, width: u32) -> Hop {
    let all = bits::masks(width).all;
    let mut register = register & all;

    loop {
        let mut candidate = (current << 1) & all;
        candidate |= (register >> (width - 1)) & 1;
        register = (register << 1) & all;

        if candidate != current {
            return Hop {
                next: candidate,
                register,
            };
        }

        // A zero register can no longer change the candidate; only a frame
        // with a forged register ends up here and the caller drops it.
        if register == 0 {
            return Hop {
                next: candidate,
                register,
            };
        }
    }
}

/// Walk the full path from `source` to `destination`, returning every hop in
/// order. The walk mirrors what the relays do hop by hop.
pub fn path(source: u64, destination: u64, width: u32) -> Vec<u64> {
    let mut hops = Vec::new();
    let mut current = source;
    let mut register = destination;

    while current != destination {
        let hop = next_hop(current, register, width);
        if hop.next == current {
            break;
        }

        hops.push(hop.next);
        current = hop.next;
        register = hop.register;
    }

    hops
}
