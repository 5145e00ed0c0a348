use std::collections::{BTreeMap, HashSet};

use crate::snapshot::Machine;

/// A machine picked for this run and the user who receives its credentials.
///
/// An empty `user` means the machine is only restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub user: String,
    pub machine: String,
}

impl Assignment {
    pub fn new(user: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            machine: machine.into(),
        }
    }

    pub fn has_user(&self) -> bool {
        !self.user.is_empty()
    }
}

/// Pick up to `bookings` machines for this run.
///
/// Users are walked in key order. A user's first machine that exists in the
/// inventory is assigned to that user, further ones are assigned with no user.
/// When the configured machines run out, unclaimed inventory machines fill the
/// remaining slots in inventory order.
pub fn select(
    inventory: &[Machine],
    user_machines: &BTreeMap<String, Vec<String>>,
    bookings: usize,
) -> Vec<Assignment> {
    let known: HashSet<&str> = inventory.iter().map(|m| m.name.as_str()).collect();
    let mut selected: Vec<Assignment> = Vec::new();

    'users: for (user, machines) in user_machines {
        let mut claimed = false;
        for machine in machines {
            if !known.contains(machine.as_str()) {
                tracing::warn!(user, machine, "configured machine not found in inventory");
                continue;
            }
            if selected.len() >= bookings {
                break 'users;
            }
            let owner = if claimed { String::new() } else { user.clone() };
            claimed = true;
            selected.push(Assignment::new(owner, machine.clone()));
        }
    }

    if selected.len() < bookings {
        let taken: HashSet<String> = selected.iter().map(|a| a.machine.clone()).collect();
        for machine in inventory {
            if selected.len() >= bookings {
                break;
            }
            if !taken.contains(&machine.name) {
                tracing::debug!(machine = %machine.name, "adding unclaimed machine");
                selected.push(Assignment::new("", machine.name.clone()));
            }
        }
    }

    if selected.len() < bookings {
        tracing::warn!(
            bookings,
            available = selected.len(),
            "not enough machines for active bookings, restoring all available"
        );
    }

    selected
}
