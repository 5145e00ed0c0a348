//! Seams to the four external systems a provisioning run talks to.
//!
//! Each system is a trait so the orchestrator can be driven by test doubles;
//! the submodules hold the production implementations.

pub mod calendar;
#[cfg(test)]
pub(crate) mod fake;
#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod opnsense;
pub mod smtp;
pub mod snapshot_xml;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::assignment::Assignment;
use crate::error::LabError;
use crate::restore::{self, RestoreReport};
use crate::snapshot::{Machine, Snapshot, SnapshotSelector};

// ── inventory ───────────────────────────────────────────────────────

#[async_trait]
pub trait InventoryGateway: Send + Sync {
    /// Every machine visible to the hypervisor, with its snapshot forest.
    async fn list_machines(&self) -> Result<Vec<Machine>, LabError>;

    async fn revert(&self, machine: &str, snapshot: &Snapshot) -> Result<(), LabError>;

    /// Start the machine if it is not already running.
    async fn power_on(&self, machine: &str) -> Result<(), LabError>;

    async fn set_user_password(
        &self,
        machine: &str,
        user: &str,
        password: &str,
    ) -> Result<(), LabError>;

    async fn close(&self) -> Result<(), LabError>;

    /// Restore every assigned machine, then rotate the password of each
    /// restored machine's user.
    async fn restore_and_rotate(
        &self,
        inventory: &[Machine],
        assignments: &[Assignment],
        selector: &SnapshotSelector,
        password_length: usize,
    ) -> RestoreReport {
        restore::restore_and_rotate(self, inventory, assignments, selector, password_length).await
    }
}

// ── calendar ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attendee {
    pub email: String,
    pub organizer: bool,
}

/// A calendar entry as returned by the calendar, before activity filtering.
///
/// All-day entries carry neither `start` nor `end`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Booking {
    pub summary: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub attendees: Vec<Attendee>,
}

#[async_trait]
pub trait CalendarGateway: Send + Sync {
    /// Bookings overlapping `[start, end]`, expanded to single occurrences.
    async fn list_bookings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, LabError>;
}

// ── VPN ─────────────────────────────────────────────────────────────

/// One peer slot on the VPN gateway.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub public_key: String,
    pub tunnel_address: String,
    /// Server attachment, passed back unchanged on update.
    pub servers: String,
}

#[async_trait]
pub trait VpnGateway: Send + Sync {
    async fn find_peer_by_tunnel_address(
        &self,
        address: &str,
    ) -> Result<Option<PeerRecord>, LabError>;

    /// Overwrite the peer identified by `peer.id` with the given fields.
    async fn update_peer(&self, peer: &PeerRecord) -> Result<(), LabError>;

    async fn create_peer(
        &self,
        name: &str,
        public_key: &str,
        tunnel_address: &str,
        keepalive: u32,
    ) -> Result<(), LabError>;
}

/// Strip a `/prefix` suffix so `10.0.0.2/32` and `10.0.0.2` compare equal.
pub fn host_address(address: &str) -> &str {
    let address = address.trim();
    address.split_once('/').map_or(address, |(host, _)| host)
}

/// True if `candidate` (possibly a comma separated list) names `address`.
pub fn tunnel_address_matches(candidate: &str, address: &str) -> bool {
    let wanted = host_address(address);
    candidate.split(',').any(|part| host_address(part) == wanted)
}

// ── notification ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), LabError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_address_strips_prefix() {
        assert_eq!(host_address("10.0.0.2/32"), "10.0.0.2");
        assert_eq!(host_address("10.0.0.2"), "10.0.0.2");
        assert_eq!(host_address(" 10.0.0.2/24 "), "10.0.0.2");
    }

    #[test]
    fn tunnel_address_matching() {
        assert!(tunnel_address_matches("10.0.0.2/32", "10.0.0.2"));
        assert!(tunnel_address_matches("10.0.0.2", "10.0.0.2/32"));
        assert!(tunnel_address_matches("fd00::2/128,10.0.0.2/32", "10.0.0.2/32"));
        assert!(!tunnel_address_matches("10.0.0.20/32", "10.0.0.2/32"));
        assert!(!tunnel_address_matches("", "10.0.0.2"));
    }
}
