use core::fmt;
use core::str::FromStr;

use crate::error::RnError;

/// Device identifier as seen on the fabric.
pub type DeviceId = u16;

/// Stream endpoint instance on a device.
pub type SepInst = u16;

/// Instance of the management/control stream endpoint on every device.
pub const SEP_INST_MGMT_CTRL: SepInst = 0;
/// First instance used for data stream endpoints.
pub const SEP_INST_DATA_BASE: SepInst = 1;

/// Physical or virtual stream endpoint address.
///
/// Used as a lookup key only, never transmitted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SepAddr {
    pub device: DeviceId,
    pub instance: SepInst,
}

impl SepAddr {
    pub const fn new(device: DeviceId, instance: SepInst) -> Self {
        Self { device, instance }
    }

    /// True for the management/control endpoint of a device.
    pub fn is_mgmt(self) -> bool {
        self.instance == SEP_INST_MGMT_CTRL
    }
}

impl fmt::Display for SepAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.device, self.instance)
    }
}

impl From<(DeviceId, SepInst)> for SepAddr {
    fn from((device, instance): (DeviceId, SepInst)) -> Self {
        Self::new(device, instance)
    }
}

/// 16-bit endpoint ID carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SepId(u16);

impl SepId {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for SepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SepId({})", self.0)
    }
}

impl fmt::Display for SepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block identifier of the form `<device>/<name>#<count>`, e.g. `0/Radio#0`.
///
/// Ordering is lexicographic on the canonical string, so sorted block lists
/// are stable for a fixed topology.
#[derive(Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct BlockId {
    device: usize,
    name: String,
    count: usize,
}

impl BlockId {
    pub fn new(device: usize, name: impl Into<String>, count: usize) -> Self {
        Self {
            device,
            name: name.into(),
            count,
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Check `hint` against this ID.
    ///
    /// Accepted forms: `""` (everything), `Name`, `Name#N`, `D/Name`,
    /// `D/Name#N`. Matching is exact per given component.
    pub fn match_hint(&self, hint: &str) -> bool {
        let hint = hint.trim();
        if hint.is_empty() {
            return true;
        }
        let (device, rest) = match hint.split_once('/') {
            Some((d, rest)) => match d.parse::<usize>() {
                Ok(d) => (Some(d), rest),
                Err(_) => return false,
            },
            None => (None, hint),
        };
        let (name, count) = match rest.split_once('#') {
            Some((n, c)) => match c.parse::<usize>() {
                Ok(c) => (n, Some(c)),
                Err(_) => return false,
            },
            None => (rest, None),
        };
        device.is_none_or(|d| d == self.device)
            && (name.is_empty() || name == self.name)
            && count.is_none_or(|c| c == self.count)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.device, self.name, self.count)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self)
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders like the canonical `device/name#count` strings, without building
/// them.
impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        let (mut a_dev, mut a_cnt) = ([0u8; 20], [0u8; 20]);
        let (mut b_dev, mut b_cnt) = ([0u8; 20], [0u8; 20]);
        let a = decimal(self.device, &mut a_dev)
            .iter()
            .chain(b"/")
            .chain(self.name.as_bytes())
            .chain(b"#")
            .chain(decimal(self.count, &mut a_cnt));
        let b = decimal(other.device, &mut b_dev)
            .iter()
            .chain(b"/")
            .chain(other.name.as_bytes())
            .chain(b"#")
            .chain(decimal(other.count, &mut b_cnt));
        a.cmp(b)
    }
}

/// ASCII digits of `n`, written to the tail of `buf`.
fn decimal(mut n: usize, buf: &mut [u8; 20]) -> &[u8] {
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[start..]
}

impl FromStr for BlockId {
    type Err = RnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RnError::value(format!("malformed block ID `{s}'"));
        let (device, rest) = s.split_once('/').ok_or_else(malformed)?;
        let (name, count) = rest.split_once('#').ok_or_else(malformed)?;
        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(malformed());
        }
        Ok(Self {
            device: device.parse().map_err(|_| malformed())?,
            name: name.to_string(),
            count: count.parse().map_err(|_| malformed())?,
        })
    }
}

impl TryFrom<String> for BlockId {
    type Error = RnError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BlockId> for String {
    fn from(id: BlockId) -> Self {
        id.to_string()
    }
}
