//! Router ping reply codec
//!
//! Format (all fields in the sender's byte order, detected from the magic):
//! [4 bytes] magic
//! [2 bytes] version (1 or 2)
//! [2 bytes] reserved
//! [4 bytes] pid of the replying process
//! [4 bytes] nnis, count of the entries that follow
//! [N x 8 bytes]  version 1: interface NID
//! [N x 12 bytes] version 2: interface NID + status

use crate::nid::{LndType, NetId, Nid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ping reply magic in the sender's byte order
pub const PING_MAGIC: u32 = 0x7069_6e67;
/// Entries carry NIDs only
pub const PING_VERSION_1: u16 = 1;
/// Entries carry NIDs and interface status
pub const PING_VERSION_2: u16 = 2;
/// Most interface entries a router reports
pub const MAX_RTR_NIS: usize = 16;
/// magic + version + reserved + pid + nnis
pub const HEADER_LEN: usize = 16;
/// magic + version + reserved
const MIN_LEN: usize = 8;

/// Interface status codes
pub const NI_STATUS_INVALID: u32 = 0x0000_0000;
pub const NI_STATUS_UP: u32 = 0x0000_0001;
pub const NI_STATUS_DOWN: u32 = 0x0000_0002;

/// Receive buffer size that fits a full version 2 reply
pub const PING_BUFFER_LEN: usize = HEADER_LEN + MAX_RTR_NIS * entry_len(PING_VERSION_2);

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("Ping reply truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("Bad ping magic: {0:#010x}")]
    BadMagic(u32),
    #[error("Unsupported ping version: {0}")]
    UnsupportedVersion(u16),
    #[error("Wildcard NID in interface status")]
    WildcardNid,
    #[error("Unexpected interface status {status:#010x} for {nid}")]
    UnexpectedStatus { nid: Nid, status: u32 },
}

/// Byte order used when writing a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Native,
    Swapped,
}

/// Decoded interface status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NiState {
    Up,
    Down,
    Invalid,
}

impl NiState {
    pub fn code(&self) -> u32 {
        match self {
            NiState::Up => NI_STATUS_UP,
            NiState::Down => NI_STATUS_DOWN,
            NiState::Invalid => NI_STATUS_INVALID,
        }
    }
}

impl std::fmt::Display for NiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NiState::Up => write!(f, "up"),
            NiState::Down => write!(f, "down"),
            NiState::Invalid => write!(f, "invalid"),
        }
    }
}

/// One reported interface; `status` is kept raw so garbage stays visible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiStatus {
    pub nid: Nid,
    pub status: u32,
}

impl NiStatus {
    pub fn new(nid: Nid, state: NiState) -> Self {
        Self {
            nid,
            status: state.code(),
        }
    }

    /// `None` for a status code outside the protocol
    pub fn state(&self) -> Option<NiState> {
        match self.status {
            NI_STATUS_UP => Some(NiState::Up),
            NI_STATUS_DOWN => Some(NiState::Down),
            NI_STATUS_INVALID => Some(NiState::Invalid),
            _ => None,
        }
    }
}

/// Validated ping reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    pub version: u16,
    pub pid: u32,
    /// Entry count as declared by the sender
    pub nnis: u32,
    /// Entries actually decoded (at most the caller's expected count)
    pub entries: Vec<NiStatus>,
}

impl PingInfo {
    pub fn new(version: u16, pid: u32, entries: Vec<NiStatus>) -> Self {
        Self {
            version,
            pid,
            nnis: entries.len() as u32,
            entries,
        }
    }

    /// Whether entries carry interface status
    pub fn has_ni_status(&self) -> bool {
        self.version >= PING_VERSION_2
    }

    /// Encode in the requested byte order
    pub fn to_bytes(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.entries.len() * entry_len(self.version));
        let w32 = |out: &mut Vec<u8>, v: u32| match order {
            ByteOrder::Native => out.extend_from_slice(&v.to_ne_bytes()),
            ByteOrder::Swapped => out.extend_from_slice(&v.swap_bytes().to_ne_bytes()),
        };
        let w16 = |out: &mut Vec<u8>, v: u16| match order {
            ByteOrder::Native => out.extend_from_slice(&v.to_ne_bytes()),
            ByteOrder::Swapped => out.extend_from_slice(&v.swap_bytes().to_ne_bytes()),
        };
        let w64 = |out: &mut Vec<u8>, v: u64| match order {
            ByteOrder::Native => out.extend_from_slice(&v.to_ne_bytes()),
            ByteOrder::Swapped => out.extend_from_slice(&v.swap_bytes().to_ne_bytes()),
        };

        w32(&mut out, PING_MAGIC);
        w16(&mut out, self.version);
        w16(&mut out, 0);
        w32(&mut out, self.pid);
        w32(&mut out, self.entries.len() as u32);
        for entry in &self.entries {
            w64(&mut out, entry.nid.0);
            if self.version >= PING_VERSION_2 {
                w32(&mut out, entry.status);
            }
        }
        out
    }
}

const fn entry_len(version: u16) -> usize {
    if version >= PING_VERSION_2 {
        12
    } else {
        8
    }
}

/// Field reader applying the detected byte order
struct Reader<'a> {
    buf: &'a [u8],
    swap: bool,
}

impl Reader<'_> {
    fn u16_at(&self, off: usize) -> u16 {
        let v = u16::from_ne_bytes([self.buf[off], self.buf[off + 1]]);
        if self.swap {
            v.swap_bytes()
        } else {
            v
        }
    }

    fn u32_at(&self, off: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[off..off + 4]);
        let v = u32::from_ne_bytes(raw);
        if self.swap {
            v.swap_bytes()
        } else {
            v
        }
    }

    fn u64_at(&self, off: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[off..off + 8]);
        let v = u64::from_ne_bytes(raw);
        if self.swap {
            v.swap_bytes()
        } else {
            v
        }
    }
}

/// Validate and decode a ping reply
///
/// Only the first `observed_len` bytes of `buf` are looked at, and at most
/// `expected` entries are decoded.
pub fn parse(buf: &[u8], observed_len: usize, expected: usize) -> Result<PingInfo, ProtocolError> {
    let buf = &buf[..observed_len.min(buf.len())];
    let len = buf.len();

    if len < MIN_LEN {
        return Err(ProtocolError::Truncated { need: MIN_LEN, got: len });
    }

    let magic = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let swap = if magic == PING_MAGIC {
        false
    } else if magic == PING_MAGIC.swap_bytes() {
        true
    } else {
        return Err(ProtocolError::BadMagic(magic));
    };
    let reader = Reader { buf, swap };

    let version = reader.u16_at(4);
    if version != PING_VERSION_1 && version != PING_VERSION_2 {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    if len < HEADER_LEN {
        return Err(ProtocolError::Truncated { need: HEADER_LEN, got: len });
    }
    let pid = reader.u32_at(8);
    let nnis = reader.u32_at(12);

    let count = (nnis as usize).min(expected);
    let stride = entry_len(version);
    let need = HEADER_LEN + count * stride;
    if len < need {
        return Err(ProtocolError::Truncated { need, got: len });
    }

    let entries = (0..count)
        .map(|i| {
            let off = HEADER_LEN + i * stride;
            let nid = Nid(reader.u64_at(off));
            let status = if version >= PING_VERSION_2 {
                reader.u32_at(off + 8)
            } else {
                NI_STATUS_INVALID
            };
            NiStatus { nid, status }
        })
        .collect();

    Ok(PingInfo {
        version,
        pid,
        nnis,
        entries,
    })
}

/// Count a router's interfaces that are down, as far as reaching `net` goes
///
/// An interface reporting up on `net` itself means a live path exists and the
/// answer is 0. Portals interfaces only count, once, when all of them are down.
pub fn count_down_interfaces(info: &PingInfo, net: NetId) -> Result<usize, ProtocolError> {
    let mut down = 0;
    let mut ptl_up = false;
    let mut ptl_down = false;

    for entry in &info.entries {
        if entry.nid.is_any() {
            return Err(ProtocolError::WildcardNid);
        }
        let lnd = entry.nid.net().lnd();
        if lnd == LndType::Loopback {
            continue;
        }

        match entry.state() {
            Some(NiState::Up) => {
                if entry.nid.net() == net {
                    return Ok(0);
                }
                if lnd == LndType::Ptl {
                    ptl_up = true;
                }
            }
            Some(NiState::Down) => {
                if lnd == LndType::Ptl {
                    ptl_down = true;
                } else {
                    down += 1;
                }
            }
            _ => {
                return Err(ProtocolError::UnexpectedStatus {
                    nid: entry.nid,
                    status: entry.status,
                })
            }
        }
    }

    if ptl_down && !ptl_up {
        down += 1;
    }
    Ok(down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn nid(s: &str) -> Nid {
        s.parse().unwrap()
    }

    fn sample(version: u16) -> PingInfo {
        let status = |n: &str, s: NiState| {
            if version >= PING_VERSION_2 {
                NiStatus::new(nid(n), s)
            } else {
                NiStatus::new(nid(n), NiState::Invalid)
            }
        };
        PingInfo::new(
            version,
            4242,
            vec![
                status("0@lo", NiState::Up),
                status("10.0.0.1@tcp", NiState::Up),
                status("192.168.0.1@o2ib1", NiState::Down),
            ],
        )
    }

    #[test]
    fn test_roundtrip_both_versions_and_orders() {
        for version in [PING_VERSION_1, PING_VERSION_2] {
            for order in [ByteOrder::Native, ByteOrder::Swapped] {
                let info = sample(version);
                let bytes = info.to_bytes(order);
                let parsed = parse(&bytes, bytes.len(), MAX_RTR_NIS).unwrap();
                assert_eq!(parsed, info, "version {} order {:?}", version, order);
            }
        }
    }

    #[test]
    fn test_parse_shorter_than_magic() {
        let bytes = sample(PING_VERSION_2).to_bytes(ByteOrder::Native);
        match parse(&bytes, 7, MAX_RTR_NIS) {
            Err(ProtocolError::Truncated { need, got }) => {
                assert_eq!(need, 8);
                assert_eq!(got, 7);
            }
            other => panic!("Expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_shorter_than_header() {
        let bytes = sample(PING_VERSION_2).to_bytes(ByteOrder::Swapped);
        assert_eq!(
            parse(&bytes, 12, MAX_RTR_NIS),
            Err(ProtocolError::Truncated { need: HEADER_LEN, got: 12 })
        );
    }

    #[test]
    fn test_parse_nnis_exceeds_buffer() {
        let bytes = sample(PING_VERSION_2).to_bytes(ByteOrder::Native);
        let cut = bytes.len() - 1;
        assert!(matches!(
            parse(&bytes, cut, MAX_RTR_NIS),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_parse_caps_entries_at_expected() {
        let bytes = sample(PING_VERSION_2).to_bytes(ByteOrder::Native);
        // Space for only two entries still parses when only two are wanted
        let parsed = parse(&bytes, HEADER_LEN + 2 * 12, 2).unwrap();
        assert_eq!(parsed.nnis, 3);
        assert_eq!(parsed.entries.len(), 2);
    }

    #[test]
    fn test_parse_bad_magic() {
        let mut bytes = sample(PING_VERSION_1).to_bytes(ByteOrder::Native);
        bytes[0] ^= 0xff;
        assert!(matches!(
            parse(&bytes, bytes.len(), MAX_RTR_NIS),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn test_parse_bad_version() {
        let mut info = sample(PING_VERSION_2);
        info.version = 3;
        let bytes = info.to_bytes(ByteOrder::Swapped);
        assert_eq!(
            parse(&bytes, bytes.len(), MAX_RTR_NIS),
            Err(ProtocolError::UnsupportedVersion(3))
        );
    }

    #[test]
    fn test_parse_ignores_bytes_past_observed_len() {
        let mut bytes = sample(PING_VERSION_2).to_bytes(ByteOrder::Native);
        let len = bytes.len();
        bytes.extend_from_slice(&[0xaa; 32]);
        let parsed = parse(&bytes, len, MAX_RTR_NIS).unwrap();
        assert_eq!(parsed.entries.len(), 3);
    }

    #[test]
    fn test_count_down_up_on_target_net() {
        let info = sample(PING_VERSION_2);
        // tcp is up, so the o2ib1 failure does not matter for tcp
        assert_eq!(count_down_interfaces(&info, nid("1.1.1.1@tcp").net()), Ok(0));
        // for another network the down o2ib1 interface counts
        assert_eq!(count_down_interfaces(&info, "gni2".parse::<NetId>().unwrap()), Ok(1));
    }

    #[test]
    fn test_count_down_ptl_collective() {
        let target: NetId = "tcp9".parse().unwrap();
        let partly = PingInfo::new(
            PING_VERSION_2,
            1,
            vec![
                NiStatus::new(nid("1@ptl"), NiState::Down),
                NiStatus::new(nid("2@ptl1"), NiState::Up),
            ],
        );
        assert_eq!(count_down_interfaces(&partly, target), Ok(0));

        let all = PingInfo::new(
            PING_VERSION_2,
            1,
            vec![
                NiStatus::new(nid("1@ptl"), NiState::Down),
                NiStatus::new(nid("2@ptl1"), NiState::Down),
                NiStatus::new(nid("10.1.1.1@tcp"), NiState::Down),
            ],
        );
        assert_eq!(count_down_interfaces(&all, target), Ok(2));
    }

    #[test]
    fn test_count_down_malformed_entries() {
        let target: NetId = "tcp".parse().unwrap();
        let wildcard = PingInfo::new(PING_VERSION_2, 1, vec![NiStatus::new(Nid::ANY, NiState::Up)]);
        assert_eq!(count_down_interfaces(&wildcard, target), Err(ProtocolError::WildcardNid));

        let garbage = PingInfo::new(
            PING_VERSION_2,
            1,
            vec![NiStatus {
                nid: nid("10.0.0.5@tcp1"),
                status: 7,
            }],
        );
        assert!(matches!(
            count_down_interfaces(&garbage, target),
            Err(ProtocolError::UnexpectedStatus { status: 7, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256), expected in 0usize..32) {
            let _ = parse(&bytes, bytes.len(), expected);
        }

        #[test]
        fn prop_parse_with_valid_header_never_panics(tail in proptest::collection::vec(any::<u8>(), 0..200), nnis in any::<u32>()) {
            let mut bytes = PingInfo::new(PING_VERSION_2, 7, vec![]).to_bytes(ByteOrder::Native);
            bytes[12..16].copy_from_slice(&nnis.to_ne_bytes());
            bytes.extend_from_slice(&tail);
            if let Ok(info) = parse(&bytes, bytes.len(), MAX_RTR_NIS) {
                prop_assert!(info.entries.len() <= MAX_RTR_NIS);
            }
        }
    }
}
