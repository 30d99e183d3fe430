use std::fmt;

use serde::{Deserialize, Serialize};

mod gate;
mod mark;

pub use gate::VerdictGate;
pub use mark::{DEFAULT_MARKS, MarkTable};

/// Disposition requested for a packet.
///
/// Every action except the reroutes is an accept at the NFQUEUE level; the
/// kernel rules act on the mark that goes with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Allow this packet; the connection is evaluated again on the next one.
    Accept,
    /// Reject this packet.
    Block,
    /// Discard silently.
    Drop,
    PermanentAccept,
    PermanentBlock,
    PermanentDrop,
    RerouteToNameserver,
    RerouteToTunnel,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::Accept,
        Action::Block,
        Action::Drop,
        Action::PermanentAccept,
        Action::PermanentBlock,
        Action::PermanentDrop,
        Action::RerouteToNameserver,
        Action::RerouteToTunnel,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Action::Accept => "Accept",
            Action::Block => "Block",
            Action::Drop => "Drop",
            Action::PermanentAccept => "AcceptAlways",
            Action::PermanentBlock => "BlockAlways",
            Action::PermanentDrop => "DropAlways",
            Action::RerouteToNameserver => "RerouteNS",
            Action::RerouteToTunnel => "RerouteSPN",
        }
    }

    /// Action to use for ICMP and ICMPv6 packets.
    ///
    /// Rejection notices for a blocked connection carry that connection's
    /// mark and would be rejected themselves, so blocks become drops.
    pub const fn for_icmp(self) -> Action {
        match self {
            Action::Block => Action::Drop,
            Action::PermanentBlock => Action::PermanentDrop,
            other => other,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
