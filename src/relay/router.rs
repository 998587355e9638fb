//! Packet routing.
//!
//! Given a decoded packet and what its sender declared at admission, decide
//! whether the packet is acceptable from that sender and who receives it.
//! Violations are dropped silently; the relay never tells a peer why, so a
//! misbehaving client cannot probe the session's topology. The match over
//! packet kinds is exhaustive on purpose: adding a kind forces a routing
//! decision here.

use std::fmt;

use crate::protocol::packet::Packet;
use crate::protocol::{Capability, CapabilitySet};

use super::session::{ClientId, ConnState};

/// The `id` value that addresses every other file client.
pub const BROADCAST_ID: ClientId = 0;

/// What to do with one inbound packet.
#[derive(Debug)]
pub enum RouteOutcome {
    /// A liveness reply; refreshes the sender's alive flag, never forwarded.
    MarkAlive,
    /// Forward `packet` to each recipient.
    Deliver {
        recipients: Vec<ClientId>,
        packet: Packet,
    },
    /// Discard without telling anyone.
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Only the relay itself may originate this kind.
    ServerOnly,
    /// The envelope tag is outside the known set.
    UnknownKind,
    /// The sender's declared capabilities do not allow this kind.
    MissingCapability,
    /// Nobody eligible to receive it: no host, no other file clients, or a
    /// directed id that is absent, not file-capable, or the sender itself.
    TargetUnavailable,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::ServerOnly => "server-only packet",
            DropReason::UnknownKind => "unknown packet kind",
            DropReason::MissingCapability => "sender lacks capability",
            DropReason::TargetUnavailable => "target unavailable",
        })
    }
}

/// Route one packet from `sender`, holding that sender's declared
/// capabilities. Pure over the membership state; the caller performs the
/// sends under the same lock.
pub(crate) fn route(
    state: &ConnState,
    sender: ClientId,
    capabilities: CapabilitySet,
    packet: Packet,
) -> RouteOutcome {
    match packet {
        Packet::ConnectionPing => RouteOutcome::MarkAlive,

        Packet::ConnectionUpdate(_) | Packet::ConnectionAbuse(_) => {
            RouteOutcome::Drop(DropReason::ServerOnly)
        }

        Packet::Unknown { .. } => RouteOutcome::Drop(DropReason::UnknownKind),

        Packet::TerminalContents(_) | Packet::TerminalInfo(_) => {
            if !capabilities.contains(Capability::TerminalHost) {
                return RouteOutcome::Drop(DropReason::MissingCapability);
            }
            let recipients: Vec<ClientId> = state.terminal_viewers.iter().copied().collect();
            if recipients.is_empty() {
                RouteOutcome::Drop(DropReason::TargetUnavailable)
            } else {
                RouteOutcome::Deliver { recipients, packet }
            }
        }

        Packet::TerminalPaste(_) | Packet::TerminalKey(_) | Packet::TerminalMouse(_) => {
            if !capabilities.contains(Capability::TerminalView) {
                return RouteOutcome::Drop(DropReason::MissingCapability);
            }
            match state.terminal_host {
                Some(host) => RouteOutcome::Deliver {
                    recipients: vec![host],
                    packet,
                },
                None => RouteOutcome::Drop(DropReason::TargetUnavailable),
            }
        }

        Packet::FileListing(_)
        | Packet::FileRequest(_)
        | Packet::FileAction(_)
        | Packet::FileConsume(_) => route_file(state, sender, capabilities, packet),
    }
}

fn route_file(
    state: &ConnState,
    sender: ClientId,
    capabilities: CapabilitySet,
    mut packet: Packet,
) -> RouteOutcome {
    // Listings describe the authoritative file set, so only a file host may
    // publish one; everything else flows both ways between hosts and editors.
    let allowed = if matches!(packet, Packet::FileListing(_)) {
        capabilities.contains(Capability::FileHost)
    } else {
        capabilities.contains(Capability::FileHost) || capabilities.contains(Capability::FileEdit)
    };
    if !allowed {
        return RouteOutcome::Drop(DropReason::MissingCapability);
    }

    let target = file_packet_id(&packet);
    stamp_sender_identity(&mut packet, sender);

    if target == BROADCAST_ID {
        let recipients: Vec<ClientId> = state
            .file_clients
            .iter()
            .copied()
            .filter(|&id| id != sender)
            .collect();
        if recipients.is_empty() {
            RouteOutcome::Drop(DropReason::TargetUnavailable)
        } else {
            RouteOutcome::Deliver { recipients, packet }
        }
    } else {
        if target == sender
            || !state.file_clients.contains(&target)
            || !state.clients.contains_key(&target)
        {
            return RouteOutcome::Drop(DropReason::TargetUnavailable);
        }
        RouteOutcome::Deliver {
            recipients: vec![target],
            packet,
        }
    }
}

/// Overwrite the self-reported `id` on a file packet with the sender's
/// relay-assigned id. Recipients can then trust the origin field, whatever
/// the sender claimed.
pub(crate) fn stamp_sender_identity(packet: &mut Packet, sender: ClientId) {
    match packet {
        Packet::FileListing(p) => p.id = sender,
        Packet::FileRequest(p) => p.id = sender,
        Packet::FileAction(p) => p.id = sender,
        Packet::FileConsume(p) => p.id = sender,
        _ => {}
    }
}

fn file_packet_id(packet: &Packet) -> ClientId {
    match packet {
        Packet::FileListing(p) => p.id,
        Packet::FileRequest(p) => p.id,
        Packet::FileAction(p) => p.id,
        Packet::FileConsume(p) => p.id,
        _ => BROADCAST_ID,
    }
}
