//! In-memory gateway doubles driven by closures.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    Booking, CalendarGateway, InventoryGateway, NotificationGateway, OutgoingMessage, PeerRecord,
    VpnGateway, tunnel_address_matches,
};
use crate::error::LabError;
use crate::snapshot::{Machine, Snapshot};

type Hook = Box<dyn Fn(&str) -> Result<(), LabError> + Send + Sync>;

// ── inventory ───────────────────────────────────────────────────────

pub struct FakeInventory {
    pub on_list: Box<dyn Fn() -> Result<Vec<Machine>, LabError> + Send + Sync>,
    pub on_revert: Box<dyn Fn(&str, &Snapshot) -> Result<(), LabError> + Send + Sync>,
    pub on_power_on: Hook,
    pub on_set_password: Box<dyn Fn(&str, &str) -> Result<(), LabError> + Send + Sync>,
    calls: Mutex<Vec<String>>,
    reverts: Mutex<Vec<(String, String)>>,
    powered: Mutex<Vec<String>>,
    passwords: Mutex<Vec<(String, String, String)>>,
    closed: AtomicUsize,
}

impl FakeInventory {
    pub fn new(machines: Vec<Machine>) -> Self {
        Self {
            on_list: Box::new(move || Ok(machines.clone())),
            on_revert: Box::new(|_, _| Ok(())),
            on_power_on: Box::new(|_| Ok(())),
            on_set_password: Box::new(|_, _| Ok(())),
            calls: Mutex::new(Vec::new()),
            reverts: Mutex::new(Vec::new()),
            powered: Mutex::new(Vec::new()),
            passwords: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reverts(&self) -> Vec<(String, String)> {
        self.reverts.lock().unwrap().clone()
    }

    pub fn powered_on(&self) -> Vec<String> {
        self.powered.lock().unwrap().clone()
    }

    /// (machine, user) pairs that had a password set.
    pub fn password_calls(&self) -> Vec<(String, String)> {
        self.passwords
            .lock()
            .unwrap()
            .iter()
            .map(|(m, u, _)| (m.clone(), u.clone()))
            .collect()
    }

    pub fn password_for(&self, user: &str) -> Option<String> {
        self.passwords
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, u, _)| u == user)
            .map(|(_, _, p)| p.clone())
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl InventoryGateway for FakeInventory {
    async fn list_machines(&self) -> Result<Vec<Machine>, LabError> {
        self.log("list".into());
        (self.on_list)()
    }

    async fn revert(&self, machine: &str, snapshot: &Snapshot) -> Result<(), LabError> {
        self.log(format!("revert {machine} {}", snapshot.name));
        (self.on_revert)(machine, snapshot)?;
        self.reverts
            .lock()
            .unwrap()
            .push((machine.to_string(), snapshot.name.clone()));
        Ok(())
    }

    async fn power_on(&self, machine: &str) -> Result<(), LabError> {
        self.log(format!("power_on {machine}"));
        (self.on_power_on)(machine)?;
        self.powered.lock().unwrap().push(machine.to_string());
        Ok(())
    }

    async fn set_user_password(
        &self,
        machine: &str,
        user: &str,
        password: &str,
    ) -> Result<(), LabError> {
        self.log(format!("password {machine} {user}"));
        (self.on_set_password)(machine, user)?;
        self.passwords.lock().unwrap().push((
            machine.to_string(),
            user.to_string(),
            password.to_string(),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<(), LabError> {
        self.log("close".into());
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── calendar ────────────────────────────────────────────────────────

pub struct FakeCalendar {
    pub on_list: Box<dyn Fn() -> Result<Vec<Booking>, LabError> + Send + Sync>,
    windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl FakeCalendar {
    pub fn new(bookings: Vec<Booking>) -> Self {
        Self {
            on_list: Box::new(move || Ok(bookings.clone())),
            windows: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &'static str) -> Self {
        Self {
            on_list: Box::new(move || {
                Err(LabError::Calendar {
                    message: message.into(),
                })
            }),
            windows: Mutex::new(Vec::new()),
        }
    }

    pub fn windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl CalendarGateway for FakeCalendar {
    async fn list_bookings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, LabError> {
        self.windows.lock().unwrap().push((start, end));
        (self.on_list)()
    }
}

// ── VPN ─────────────────────────────────────────────────────────────

/// Holds peers in memory. `on_update` decides what gets stored for an
/// update: `Ok(Some(record))` stores it, `Ok(None)` deletes the peer.
pub struct FakeVpn {
    pub peers: Mutex<Vec<PeerRecord>>,
    pub on_search: Hook,
    pub on_update: Box<dyn Fn(&PeerRecord) -> Result<Option<PeerRecord>, LabError> + Send + Sync>,
    updates: Mutex<Vec<PeerRecord>>,
    searches: AtomicUsize,
    creates: AtomicUsize,
}

impl FakeVpn {
    pub fn new(peers: Vec<PeerRecord>) -> Self {
        Self {
            peers: Mutex::new(peers),
            on_search: Box::new(|_| Ok(())),
            on_update: Box::new(|p| Ok(Some(p.clone()))),
            updates: Mutex::new(Vec::new()),
            searches: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }

    pub fn updates(&self) -> Vec<PeerRecord> {
        self.updates.lock().unwrap().clone()
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

pub fn peer(id: &str, name: &str, key: &str, address: &str) -> PeerRecord {
    PeerRecord {
        id: id.into(),
        name: name.into(),
        public_key: key.into(),
        tunnel_address: address.into(),
        servers: "server-uuid-1".into(),
    }
}

#[async_trait]
impl VpnGateway for FakeVpn {
    async fn find_peer_by_tunnel_address(
        &self,
        address: &str,
    ) -> Result<Option<PeerRecord>, LabError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        (self.on_search)(address)?;
        Ok(self
            .peers
            .lock()
            .unwrap()
            .iter()
            .find(|p| tunnel_address_matches(&p.tunnel_address, address))
            .cloned())
    }

    async fn update_peer(&self, peer: &PeerRecord) -> Result<(), LabError> {
        self.updates.lock().unwrap().push(peer.clone());
        let stored = (self.on_update)(peer)?;
        let mut peers = self.peers.lock().unwrap();
        match stored {
            Some(record) => {
                if let Some(slot) = peers.iter_mut().find(|p| p.id == peer.id) {
                    *slot = record;
                }
            }
            None => peers.retain(|p| p.id != peer.id),
        }
        Ok(())
    }

    async fn create_peer(
        &self,
        name: &str,
        public_key: &str,
        tunnel_address: &str,
        _keepalive: u32,
    ) -> Result<(), LabError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut peers = self.peers.lock().unwrap();
        let id = format!("created-{}", peers.len());
        peers.push(PeerRecord {
            id,
            name: name.into(),
            public_key: public_key.into(),
            tunnel_address: tunnel_address.into(),
            servers: String::new(),
        });
        Ok(())
    }
}

// ── notification ────────────────────────────────────────────────────

pub struct FakeMailer {
    pub fail: bool,
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl FakeMailer {
    pub fn new() -> Self {
        Self {
            fail: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationGateway for FakeMailer {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), LabError> {
        if self.fail {
            return Err(LabError::Notification {
                message: format!("relay refused mail for {}", message.to),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
