//! Link-layer addressing.
//!
//! - [`MacAddr`]: 6-byte Ethernet hardware address
//! - [`DlsapAddr`]: 8-byte data-link service access point address
//!   (hardware address followed by the 16-bit subscription key)
//! - [`MacAddr::generate`]: locally-administered address for a new instance

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Length of a hardware address in bytes
pub const MAC_ADDR_LEN: usize = 6;

/// Length of a DLSAP address in bytes (hardware address + subscription key)
pub const DLSAP_ADDR_LEN: usize = MAC_ADDR_LEN + 2;

/// Leading octets of every generated address. 0x0a has the U/L bit set.
const GENERATED_PREFIX: [u8; 3] = [0x0a, 0x00, 0x20];

/// Ethernet hardware address. Serialized in its textual form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; MAC_ADDR_LEN]);

impl MacAddr {
    /// All-ones broadcast address
    pub const BROADCAST: Self = Self([0xff; MAC_ADDR_LEN]);

    /// All-zero address
    pub const ZERO: Self = Self([0; MAC_ADDR_LEN]);

    /// Create an address from raw octets
    pub const fn new(octets: [u8; MAC_ADDR_LEN]) -> Self {
        Self(octets)
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; MAC_ADDR_LEN] {
        self.0
    }

    /// Read an address from the first 6 bytes of `buf`
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let octets: [u8; MAC_ADDR_LEN] = buf.get(..MAC_ADDR_LEN)?.try_into().ok()?;
        Some(Self(octets))
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group address: low-order bit of the first octet is set.
    /// Broadcast is a group address too.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Derive an address from a time-of-day value and a tick count.
    ///
    /// The first three octets are fixed; the last three mix the two inputs.
    /// Instances created in the same second and tick get the same address.
    pub fn from_time_and_ticks(time_secs: u32, ticks: u32) -> Self {
        let mut octets = [0u8; MAC_ADDR_LEN];
        octets[..3].copy_from_slice(&GENERATED_PREFIX);
        octets[3] = ((time_secs >> 16).wrapping_add(ticks) & 0xff) as u8;
        octets[4] = ((time_secs >> 8).wrapping_add(ticks) & 0xff) as u8;
        octets[5] = (time_secs.wrapping_add(ticks) & 0xff) as u8;
        // locally administered, individual (unicast)
        octets[0] = (octets[0] | 0x02) & !0x01;
        Self(octets)
    }

    /// Generate an address for a new instance from the wall clock and a
    /// monotonic tick counter.
    pub fn generate() -> Self {
        let time_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self::from_time_and_ticks(time_secs, monotonic_ticks())
    }
}

/// Milliseconds since the first call in this process, plus one per call so
/// back-to-back calls never return the same value.
fn monotonic_ticks() -> u32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    static CALLS: AtomicU32 = AtomicU32::new(0);

    let epoch = EPOCH.get_or_init(Instant::now);
    let millis = epoch.elapsed().as_millis() as u32;
    millis.wrapping_add(CALLS.fetch_add(1, Ordering::Relaxed))
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error parsing a textual hardware address
#[derive(Debug, thiserror::Error)]
#[error("Invalid hardware address: {0:?} (expected six hex octets like aa:bb:cc:dd:ee:ff)")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; MAC_ADDR_LEN];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.is_empty() || part.len() > 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseMacError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(addr: MacAddr) -> Self {
        addr.to_string()
    }
}

/// Data-link service access point address: hardware address + subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DlsapAddr {
    pub mac: MacAddr,
    pub sap: u16,
}

impl DlsapAddr {
    pub fn new(mac: MacAddr, sap: u16) -> Self {
        Self { mac, sap }
    }

    /// Encode as 6 address bytes followed by the key in network byte order
    pub fn encode(&self) -> [u8; DLSAP_ADDR_LEN] {
        let mut buf = [0u8; DLSAP_ADDR_LEN];
        buf[..MAC_ADDR_LEN].copy_from_slice(&self.mac.0);
        buf[MAC_ADDR_LEN..].copy_from_slice(&self.sap.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mac = MacAddr::from_slice(buf)?;
        let sap = buf.get(MAC_ADDR_LEN..DLSAP_ADDR_LEN)?;
        Some(Self {
            mac,
            sap: u16::from_be_bytes([sap[0], sap[1]]),
        })
    }
}

impl fmt::Display for DlsapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/0x{:04x}", self.mac, self.sap)
    }
}
