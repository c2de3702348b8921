//! Device identity.
//!
//! A MAC-style identifier that names the device to the bootstrap service and
//! on signaling topics. It is fixed for the lifetime of the process.

use std::fmt;
use std::str::FromStr;

/// Locally administered prefix used for generated identities.
pub const GENERATED_PREFIX: [u8; 3] = [0x00, 0x16, 0x3E];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity([u8; 6]);

#[derive(Debug, thiserror::Error)]
#[error("invalid device identity {0:?}: expected six hex octets separated by ':', '_' or '-'")]
pub struct InvalidIdentity(pub String);

impl DeviceIdentity {
    pub fn from_octets(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Random identity under [`GENERATED_PREFIX`].
    pub fn generate() -> Self {
        let tail: [u8; 3] = rand::random();
        Self([
            GENERATED_PREFIX[0],
            GENERATED_PREFIX[1],
            GENERATED_PREFIX[2],
            tail[0],
            tail[1],
            tail[2],
        ])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// `00:16:3e:ac:b5:38`, used in the `device-id` HTTP header.
    pub fn colon_form(&self) -> String {
        self.joined(":")
    }

    /// `00_16_3e_ac_b5_38`, used in topic names.
    pub fn underscore_form(&self) -> String {
        self.joined("_")
    }

    fn joined(&self, sep: &str) -> String {
        self.0
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(sep)
    }
}

impl FromStr for DeviceIdentity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '_', '-']).collect();
        if parts.len() != 6 {
            return Err(InvalidIdentity(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(InvalidIdentity(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| InvalidIdentity(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.colon_form())
    }
}
