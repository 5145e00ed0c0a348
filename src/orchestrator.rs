//! One provisioning pass: inventory → bookings → assignments →
//! restore/rotate → VPN → notify.
//!
//! Progress is tracked as a [`Phase`] advanced only through the pure
//! [`transition`] function; the orchestrator performs the gateway calls and
//! feeds their results back in as [`Event`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::assignment::{self, Assignment};
use crate::config::Config;
use crate::error::LabError;
use crate::events::{self, ActiveBooking};
use crate::gateway::{CalendarGateway, InventoryGateway, NotificationGateway};
use crate::notify::{self, AccessDetails};
use crate::restore::RestoreReport;
use crate::snapshot::{self, Machine, SnapshotSelector};
use crate::wireguard::{Registration, WireGuardService};

// ── Phases ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    FetchInventory,
    FetchBookings,
    SelectAssignments,
    RestoreAndRotate,
    /// Everything that was attempted succeeded, or there was nothing to do.
    Done,
    /// Some machines failed to restore; the rest were fully provisioned.
    PartialFailure { restored: usize, failed: usize },
    /// The run stopped before any machine was touched.
    Fatal { reason: String },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Done | Phase::PartialFailure { .. } | Phase::Fatal { .. }
        )
    }
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    InventoryFetched { machines: usize },
    InventoryFailed(String),
    BookingsFetched { active: usize },
    BookingsFailed(String),
    AssignmentsSelected { count: usize },
    RestoreFinished { restored: usize, failed: usize },
}

/// Pure transition table. Events that do not apply to `phase` leave it
/// unchanged.
pub fn transition(phase: &Phase, event: &Event) -> Phase {
    match (phase, event) {
        (Phase::FetchInventory, Event::InventoryFetched { .. }) => Phase::FetchBookings,
        (Phase::FetchInventory, Event::InventoryFailed(reason)) => Phase::Fatal {
            reason: reason.clone(),
        },

        (Phase::FetchBookings, Event::BookingsFetched { active: 0 }) => Phase::Done,
        (Phase::FetchBookings, Event::BookingsFetched { .. }) => Phase::SelectAssignments,
        (Phase::FetchBookings, Event::BookingsFailed(reason)) => Phase::Fatal {
            reason: reason.clone(),
        },

        (Phase::SelectAssignments, Event::AssignmentsSelected { count: 0 }) => Phase::Fatal {
            reason: "no machines available".into(),
        },
        (Phase::SelectAssignments, Event::AssignmentsSelected { .. }) => Phase::RestoreAndRotate,

        (Phase::RestoreAndRotate, Event::RestoreFinished { failed: 0, .. }) => Phase::Done,
        (Phase::RestoreAndRotate, Event::RestoreFinished { restored, failed }) => {
            Phase::PartialFailure {
                restored: *restored,
                failed: *failed,
            }
        }

        (phase, event) => {
            tracing::warn!(?phase, ?event, "event does not apply to current phase");
            phase.clone()
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

/// The parts of the configuration a run consults.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub user_machines: BTreeMap<String, Vec<String>>,
    pub selector: SnapshotSelector,
    pub password_length: usize,
    pub test_recipient: String,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_machines: config.inventory.user_machines.clone(),
            selector: SnapshotSelector::from_config(config.snapshot_name()),
            password_length: config.password.length,
            test_recipient: config.email.test_recipient.clone(),
        }
    }
}

pub struct Orchestrator {
    inventory: Arc<dyn InventoryGateway>,
    calendar: Arc<dyn CalendarGateway>,
    notifier: Option<Arc<dyn NotificationGateway>>,
    wireguard: WireGuardService,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(
        inventory: Arc<dyn InventoryGateway>,
        calendar: Arc<dyn CalendarGateway>,
        notifier: Option<Arc<dyn NotificationGateway>>,
        wireguard: WireGuardService,
        settings: RunSettings,
    ) -> Self {
        Self {
            inventory,
            calendar,
            notifier,
            wireguard,
            settings,
        }
    }

    /// Run one pass as of `now`.
    ///
    /// Returns `Done` or `PartialFailure`; a fatal phase is returned as the
    /// error that caused it. The inventory gateway is closed before returning.
    pub async fn run(&mut self, now: DateTime<Utc>) -> Result<Phase, LabError> {
        let mut phase = Phase::FetchInventory;
        tracing::info!("fetching machine inventory");

        let machines = match self.inventory.list_machines().await {
            Ok(machines) => machines,
            Err(e) => {
                advance(&mut phase, Event::InventoryFailed(e.to_string()));
                self.close_inventory().await;
                return Err(e);
            }
        };
        advance(
            &mut phase,
            Event::InventoryFetched {
                machines: machines.len(),
            },
        );
        log_inventory(&machines);

        let result = self.run_with_inventory(&mut phase, &machines, now).await;
        self.close_inventory().await;
        result
    }

    async fn run_with_inventory(
        &mut self,
        phase: &mut Phase,
        machines: &[Machine],
        now: DateTime<Utc>,
    ) -> Result<Phase, LabError> {
        let (start, end) = events::query_window(now);
        tracing::info!(%start, %end, "fetching bookings");
        let bookings = match self.calendar.list_bookings(start, end).await {
            Ok(bookings) => bookings,
            Err(e) => {
                advance(phase, Event::BookingsFailed(e.to_string()));
                return Err(e);
            }
        };

        let active = events::filter_active(&bookings, now);
        for booking in &active {
            tracing::info!(summary = %booking.summary, email = %booking.email, "active booking");
        }
        advance(
            phase,
            Event::BookingsFetched {
                active: active.len(),
            },
        );
        if *phase == Phase::Done {
            tracing::info!("no active bookings");
            return Ok(Phase::Done);
        }

        let assignments = assignment::select(machines, &self.settings.user_machines, active.len());
        advance(
            phase,
            Event::AssignmentsSelected {
                count: assignments.len(),
            },
        );
        if assignments.is_empty() {
            return Err(LabError::NoMachinesAvailable {
                bookings: active.len(),
            });
        }

        tracing::info!(
            bookings = active.len(),
            machines = assignments.len(),
            snapshot = %self.settings.selector,
            "starting restore"
        );
        let report = self
            .inventory
            .restore_and_rotate(
                machines,
                &assignments,
                &self.settings.selector,
                self.settings.password_length,
            )
            .await;

        self.provision_users(&assignments, &active, &report).await;

        let (restored, failed) = (report.restored(), report.failed());
        advance(phase, Event::RestoreFinished { restored, failed });
        match phase {
            Phase::PartialFailure { .. } => {
                for outcome in report.outcomes.iter().filter(|o| !o.succeeded()) {
                    tracing::error!(
                        machine = %outcome.machine,
                        error = outcome.error.as_deref().unwrap_or_default(),
                        "restore failed"
                    );
                }
                tracing::error!(restored, failed, "restore partially failed");
            }
            _ => tracing::info!(
                restored,
                passwords = report.passwords.len(),
                "restore completed"
            ),
        }
        Ok(phase.clone())
    }

    /// VPN and notification steps for each user whose password was rotated.
    ///
    /// The n-th user-bearing assignment pairs with the n-th active booking and
    /// the n-th tunnel address.
    async fn provision_users(
        &mut self,
        assignments: &[Assignment],
        active: &[ActiveBooking],
        report: &RestoreReport,
    ) {
        let users = assignments.iter().filter(|a| a.has_user()).enumerate();
        for (slot, assignment) in users {
            let user = assignment.user.as_str();
            let machine = assignment.machine.as_str();
            let Some(password) = report.passwords.get(user) else {
                tracing::debug!(user, machine, "no rotated password, skipping user");
                continue;
            };

            let profile = if self.wireguard.is_enabled() {
                self.provision_vpn(user, slot).await
            } else {
                None
            };

            let Some(notifier) = &self.notifier else {
                continue;
            };
            let contact = active.get(slot).map(|b| b.email.as_str()).unwrap_or_default();
            if contact.is_empty() {
                tracing::warn!(user, machine, "no contact address for booking, not notifying");
                continue;
            }

            let message = notify::compose(
                &AccessDetails {
                    contact,
                    machine,
                    user,
                    password,
                    profile: profile.as_deref(),
                },
                &self.settings.test_recipient,
            );
            match notifier.send(&message).await {
                Ok(()) => tracing::info!(
                    user,
                    machine,
                    to = %message.to,
                    vpn_profile = message.attachment.is_some(),
                    "access details sent"
                ),
                Err(e) => tracing::error!(user, to = %message.to, error = %e, "failed to send access details"),
            }
        }
    }

    /// Rotate, register and render the user's VPN key. Returns the profile
    /// to attach, if one could be rendered.
    async fn provision_vpn(&mut self, user: &str, slot: usize) -> Option<String> {
        let public_key = match self.wireguard.rotate_user_key(user) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(user, error = %e, "failed to rotate VPN key");
                return None;
            }
        };

        match self.wireguard.register_peer(user, slot).await {
            Ok(Registration::Updated { peer_id }) => {
                tracing::info!(user, peer = %peer_id, public_key = %public_key, "peer registered");
            }
            Ok(Registration::Skipped) => {
                tracing::debug!(user, "peer registration skipped");
            }
            Err(e) if e.is_verification() => {
                tracing::error!(user, verification = true, error = %e, "peer verification failed");
            }
            Err(e) => {
                tracing::error!(user, error = %e, "failed to register peer");
            }
        }

        match self.wireguard.render_client_config(user, slot) {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::error!(user, error = %e, "failed to render VPN profile");
                None
            }
        }
    }

    async fn close_inventory(&self) {
        if let Err(e) = self.inventory.close().await {
            tracing::error!(error = %e, "failed to close inventory connection");
        }
    }
}

fn advance(phase: &mut Phase, event: Event) {
    let next = transition(phase, &event);
    tracing::info!(from = ?phase, to = ?next, "phase transition");
    *phase = next;
}

fn log_inventory(machines: &[Machine]) {
    tracing::info!(machines = machines.len(), "inventory fetched");
    for m in machines {
        tracing::info!(machine = %m.name, snapshots = m.snapshot_count(), "machine found");
        for (depth, s) in snapshot::walk(&m.snapshots) {
            tracing::debug!(
                machine = %m.name,
                snapshot = %s.name,
                depth,
                state = %s.state,
                created = %s.created.format("%Y-%m-%d %H:%M:%S"),
                "snapshot"
            );
        }
    }
}
