//! Worker and remote-reference identifiers.
//!
//! Every process in a cluster carries a strictly positive [`WorkerId`];
//! id 1 is the controller, ids 2 and up are workers. Results of remote
//! calls are addressed by [`Rrid`] triples minted by the caller.

use serde::{Deserialize, Serialize};

/// Integer identity of a process in the cluster.
///
/// Strictly positive once assigned. `0` is never a valid peer and is used
/// by the runtime to mean "local" in `waiting_for` bookkeeping.
pub type WorkerId = u32;

/// The worker id of the controller process.
///
/// The controller is the only process allowed to add or remove workers and
/// the destination of fatal-error escalations.
pub const CONTROLLER_ID: WorkerId = 1;

/// Encoded width of an [`Rrid`] on the wire (little-endian fields).
pub const RRID_WIRE_LEN: usize = 16;

/// Remote reference identifier.
///
/// A triple uniquely naming one remote value cluster-wide: `whence` is the
/// worker that minted the reference, `id` a per-worker monotonic counter,
/// and `tag` disambiguates multiple references owned by one call site.
///
/// [`Rrid::NULL`] (all zeroes) means "no reference expected"; message
/// headers carry it in slots that want no reply.
///
/// # Examples
///
/// ```
/// use procmesh_core::Rrid;
///
/// let r = Rrid::new(2, 7, 0);
/// assert!(!r.is_null());
/// assert_eq!(Rrid::from_wire(&r.to_wire()), r);
/// assert!(Rrid::NULL.is_null());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rrid {
    /// Worker id that minted this reference.
    pub whence: WorkerId,
    /// Per-worker monotonic counter.
    pub id: u64,
    /// Call-site disambiguator.
    pub tag: u32,
}

impl Rrid {
    /// The null reference: "no reference expected".
    pub const NULL: Rrid = Rrid {
        whence: 0,
        id: 0,
        tag: 0,
    };

    /// Create a new reference identifier.
    pub const fn new(whence: WorkerId, id: u64, tag: u32) -> Self {
        Self { whence, id, tag }
    }

    /// Whether this is the null reference.
    pub const fn is_null(&self) -> bool {
        self.whence == 0 && self.id == 0 && self.tag == 0
    }

    /// Encode into the fixed-width wire form (little-endian).
    pub fn to_wire(&self) -> [u8; RRID_WIRE_LEN] {
        let mut buf = [0u8; RRID_WIRE_LEN];
        buf[0..4].copy_from_slice(&self.whence.to_le_bytes());
        buf[4..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.tag.to_le_bytes());
        buf
    }

    /// Decode from the fixed-width wire form.
    pub fn from_wire(buf: &[u8; RRID_WIRE_LEN]) -> Self {
        Self {
            whence: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            id: u64::from_le_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            tag: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

impl std::fmt::Display for Rrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.whence, self.id, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_rrid() {
        assert!(Rrid::NULL.is_null());
        assert!(Rrid::default().is_null());
        assert!(!Rrid::new(1, 0, 0).is_null());
        assert!(!Rrid::new(0, 1, 0).is_null());
        assert!(!Rrid::new(0, 0, 1).is_null());
    }

    #[test]
    fn test_wire_roundtrip() {
        let r = Rrid::new(0xDEAD, 0x1122334455667788, 42);
        let decoded = Rrid::from_wire(&r.to_wire());
        assert_eq!(r, decoded);
    }

    #[test]
    fn test_wire_layout_is_little_endian() {
        let r = Rrid::new(1, 2, 3);
        let wire = r.to_wire();
        assert_eq!(wire[0], 1);
        assert_eq!(wire[4], 2);
        assert_eq!(wire[12], 3);
        assert!(wire[1..4].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_display() {
        assert_eq!(Rrid::new(2, 9, 1).to_string(), "(2,9,1)");
        assert_eq!(Rrid::NULL.to_string(), "(0,0,0)");
    }

    #[test]
    fn test_serde_roundtrip() {
        let r = Rrid::new(3, 14, 15);
        let json = serde_json::to_string(&r).expect("serialize");
        let decoded: Rrid = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(r, decoded);
    }
}
