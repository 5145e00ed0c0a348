//! Snapshot restore and password rotation over any [`InventoryGateway`].
//!
//! Runs in two passes: every assigned machine is reverted and powered on
//! first, then each machine that came back gets its user's password rotated.
//! A failure on one machine never stops work on the others.

use std::collections::BTreeMap;

use crate::assignment::Assignment;
use crate::credentials;
use crate::error::LabError;
use crate::gateway::InventoryGateway;
use crate::snapshot::{Machine, SnapshotSelector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub machine: String,
    /// Name of the snapshot reverted to, if one was resolved.
    pub snapshot: Option<String>,
    pub error: Option<String>,
}

impl RestoreOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
pub struct RestoreReport {
    /// One entry per assignment, in assignment order.
    pub outcomes: Vec<RestoreOutcome>,
    /// user → newly set password, only for restored machines.
    pub passwords: BTreeMap<String, String>,
    /// user → rotation failure message.
    pub rotation_errors: BTreeMap<String, String>,
}

impl RestoreReport {
    pub fn restored(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.restored()
    }
}

impl std::fmt::Debug for RestoreReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreReport")
            .field("outcomes", &self.outcomes)
            .field("rotated_users", &self.passwords.keys().collect::<Vec<_>>())
            .field("rotation_errors", &self.rotation_errors)
            .finish()
    }
}

pub async fn restore_and_rotate<G: InventoryGateway + ?Sized>(
    gateway: &G,
    inventory: &[Machine],
    assignments: &[Assignment],
    selector: &SnapshotSelector,
    password_length: usize,
) -> RestoreReport {
    let mut report = RestoreReport::default();

    for assignment in assignments {
        let machine = assignment.machine.as_str();
        let outcome = match restore_machine(gateway, inventory, machine, selector).await {
            Ok(snapshot) => {
                tracing::info!(machine, snapshot = %snapshot, "machine restored");
                RestoreOutcome {
                    machine: machine.to_string(),
                    snapshot: Some(snapshot),
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(machine, error = %e, "machine restore failed");
                RestoreOutcome {
                    machine: machine.to_string(),
                    snapshot: None,
                    error: Some(e.to_string()),
                }
            }
        };
        report.outcomes.push(outcome);
    }

    for (assignment, outcome) in assignments.iter().zip(&report.outcomes) {
        if !assignment.has_user() || !outcome.succeeded() {
            continue;
        }
        let user = assignment.user.as_str();
        let machine = assignment.machine.as_str();
        match rotate_password(gateway, machine, user, password_length).await {
            Ok(password) => {
                tracing::info!(machine, user, "password rotated");
                report.passwords.insert(user.to_string(), password);
            }
            Err(e) => {
                tracing::error!(machine, user, error = %e, "password rotation failed");
                report.rotation_errors.insert(user.to_string(), e.to_string());
            }
        }
    }

    report
}

async fn restore_machine<G: InventoryGateway + ?Sized>(
    gateway: &G,
    inventory: &[Machine],
    machine: &str,
    selector: &SnapshotSelector,
) -> Result<String, LabError> {
    let entry = inventory
        .iter()
        .find(|m| m.name == machine)
        .ok_or_else(|| LabError::Inventory {
            message: format!("machine {machine} is not in the inventory"),
            hint: "refresh the inventory before restoring".into(),
        })?;

    let snapshot = selector.select(&entry.snapshots).ok_or_else(|| match selector {
        SnapshotSelector::Named(name) => LabError::SnapshotNotFound {
            machine: machine.to_string(),
            snapshot: name.clone(),
        },
        SnapshotSelector::Latest => LabError::NoSnapshots {
            machine: machine.to_string(),
        },
    })?;

    tracing::debug!(machine, snapshot = %snapshot.name, "reverting");
    gateway.revert(machine, snapshot).await?;
    gateway
        .power_on(machine)
        .await
        .map_err(|e| LabError::Inventory {
            message: format!("reverted {machine} but failed to power it on: {e}"),
            hint: "check the hypervisor for the machine's state".into(),
        })?;

    Ok(snapshot.name.clone())
}

async fn rotate_password<G: InventoryGateway + ?Sized>(
    gateway: &G,
    machine: &str,
    user: &str,
    length: usize,
) -> Result<String, LabError> {
    let password = credentials::generate_password(length)?;
    gateway.set_user_password(machine, user, &password).await?;
    Ok(password)
}
