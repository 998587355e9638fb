//! The wire protocol shared by hosts, viewers and the relay.
//!
//! Every message is a textual JSON envelope with an integer `packet` tag.
//! Tags are grouped by prefix: `0x0_` relay control (only ever originated by
//! the relay), `0x1_` terminal output, `0x2_` input events, `0x3_` file
//! synchronization. [`packet`] defines the typed model, [`codec`] the
//! encoding; capability declarations and transport close codes live here.

pub mod codec;
pub mod packet;

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The maximum size of a single encoded packet. Generous for terminal
/// repaints and file transfers while keeping a lid on abuse.
pub const MAX_PACKET_SIZE: usize = 16 * 1024;

/// Close codes signalled on the websocket transport.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Duplicate exclusive role, or abuse.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// The session's client-id space is exhausted.
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

/// A role a client declares at connect time.
///
/// Declarations are immutable for the lifetime of the socket and govern both
/// what a client may send and what is delivered to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The single program exposing a terminal. Exclusive per session.
    TerminalHost,
    /// Watches terminal output and produces input events.
    TerminalView,
    /// Holds the authoritative copy of the session's files.
    FileHost,
    /// Edits files held elsewhere.
    FileEdit,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::TerminalHost,
        Capability::TerminalView,
        Capability::FileHost,
        Capability::FileEdit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::TerminalHost => "terminal:host",
            Capability::TerminalView => "terminal:view",
            Capability::FileHost => "file:host",
            Capability::FileEdit => "file:edit",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Capability::TerminalHost => 1 << 0,
            Capability::TerminalView => 1 << 1,
            Capability::FileHost => 1 << 2,
            Capability::FileEdit => 1 << 3,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown capability `{0}`")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, UnknownCapability> {
        Capability::ALL
            .into_iter()
            .find(|cap| cap.as_str() == s)
            .ok_or_else(|| UnknownCapability(s.to_owned()))
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(D::Error::custom)
    }
}

/// Why a capability declaration was rejected at admission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityListError {
    #[error("expected at least one capability")]
    Empty,

    #[error(transparent)]
    Unknown(#[from] UnknownCapability),
}

/// An immutable set of declared capabilities, packed as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    /// Parse a comma-separated declaration such as `terminal:view,file:edit`.
    /// Empty lists and unknown tags are rejected.
    pub fn parse_list(list: &str) -> Result<Self, CapabilityListError> {
        if list.is_empty() {
            return Err(CapabilityListError::Empty);
        }
        let mut set = CapabilitySet::EMPTY;
        for tag in list.split(',') {
            set.insert(tag.parse()?);
        }
        Ok(set)
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn union(self, other: CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .into_iter()
            .filter(move |cap| self.contains(*cap))
    }

    pub fn to_vec(self) -> Vec<Capability> {
        self.iter().collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::EMPTY;
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cap in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(cap.as_str())?;
        }
        Ok(())
    }
}
