//! Connection/instance identifiers.
//!
//! A CVID is a positive, non-zero 31-bit id that names one instance on a
//! Tether network for the lifetime of its session:
//!
//! ```text
//!  31 30                          8 7     3 2   0
//! [ 0 |        random base         | flavor | iid ]
//! ```
//!
//! The low three bits carry the [`InstanceType`], the next five bits the
//! instance flavor, and the rest is random. Zero means "not applicable" and
//! never names an instance.

use std::fmt;

use rand::Rng;

use crate::error::{ProtocolError, Result};

/// A connection/instance id.
pub type Cvid = u32;

/// Bits holding the instance type.
pub const IID_SPACE: u32 = 3;

/// Bits holding the instance flavor.
pub const FID_SPACE: u32 = 5;

/// Largest encodable flavor.
pub const MAX_FLAVOR: u8 = (1 << FID_SPACE) - 1;

const IID_MASK: u32 = (1 << IID_SPACE) - 1;
const FID_MASK: u32 = (1 << FID_SPACE) - 1;
const POSITIVE_MASK: u32 = 0x7FFF_FFFF;

/// The role an instance plays on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstanceType {
    /// The hub every other instance connects to.
    Server = 1,
    /// An operator UI.
    Viewer = 2,
    /// A managed endpoint.
    Agent = 3,
}

impl InstanceType {
    /// Wire value of the instance type.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a wire value.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(InstanceType::Server),
            2 => Ok(InstanceType::Viewer),
            3 => Ok(InstanceType::Agent),
            other => Err(ProtocolError::UnknownInstance(other)),
        }
    }

    /// Whether instances of this type must log in during the handshake.
    pub fn requires_login(self) -> bool {
        self == InstanceType::Viewer
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceType::Server => "server",
            InstanceType::Viewer => "viewer",
            InstanceType::Agent => "agent",
        };
        f.write_str(name)
    }
}

/// Generate a fresh random CVID for an instance.
///
/// Flavors above [`MAX_FLAVOR`] are truncated to their low five bits.
pub fn generate(instance: InstanceType, flavor: u8) -> Cvid {
    let mut rng = rand::thread_rng();
    loop {
        let base: u32 = rng.gen();
        let cvid = compose(base, instance, flavor);
        if cvid != 0 {
            return cvid;
        }
    }
}

fn compose(base: u32, instance: InstanceType, flavor: u8) -> Cvid {
    let with_flavor = (base << FID_SPACE) | (u32::from(flavor) & FID_MASK);
    let with_instance = (with_flavor << IID_SPACE) | instance.as_u32();
    with_instance & POSITIVE_MASK
}

/// Instance type encoded in a CVID.
pub fn extract_instance(cvid: Cvid) -> Result<InstanceType> {
    InstanceType::from_u32(cvid & IID_MASK)
}

/// Instance flavor encoded in a CVID.
pub fn extract_flavor(cvid: Cvid) -> u8 {
    ((cvid >> IID_SPACE) & FID_MASK) as u8
}

/// Check that a CVID is non-zero, positive and names a known instance type.
pub fn validate(cvid: Cvid) -> Result<Cvid> {
    if cvid == 0 || cvid > POSITIVE_MASK || extract_instance(cvid).is_err() {
        return Err(ProtocolError::InvalidCvid(cvid));
    }
    Ok(cvid)
}
