//! Libvirt inventory: domains, their snapshot forests, and the guest agent.
//!
//! Every operation opens its own connection and closes it on return, so no
//! libvirt handle is held across an `.await`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;
use virt::error as virt_error;

use super::InventoryGateway;
use super::snapshot_xml::{self, FlatSnapshot};
use crate::config::InventoryConfig;
use crate::error::LabError;
use crate::snapshot::{Machine, Snapshot};

const AGENT_RETRY_INTERVAL_MS: u64 = 1000;
const AGENT_PING_TIMEOUT_SECS: i32 = 5;
const GUEST_PING: &str = r#"{"execute":"guest-ping"}"#;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

pub struct LibvirtInventory {
    uri: String,
    agent_timeout: Duration,
    closed: AtomicBool,
}

impl LibvirtInventory {
    pub fn new(config: &InventoryConfig) -> Self {
        Self {
            uri: config.libvirt_uri.clone(),
            agent_timeout: Duration::from_secs(config.agent_timeout_s),
            closed: AtomicBool::new(false),
        }
    }

    fn connect(&self) -> Result<ConnGuard, LabError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LabError::Inventory {
                message: "inventory session already closed".into(),
                hint: "open a new session for another run".into(),
            });
        }
        // Keep libvirt from printing its own copy of every error to stderr.
        virt_error::clear_error_callback();

        Connect::open(Some(&self.uri))
            .map(ConnGuard)
            .map_err(|e| LabError::Inventory {
                message: format!("failed to connect to libvirt: {e}"),
                hint: format!("ensure libvirtd is running and you have access to {}", self.uri),
            })
    }

    fn domain(&self, conn: &Connect, machine: &str) -> Result<Domain, LabError> {
        Domain::lookup_by_name(conn, machine).map_err(|e| LabError::Inventory {
            message: format!("machine {machine} not found: {e}"),
            hint: format!("check `virsh -c {} list --all`", self.uri),
        })
    }

    fn ping_agent(&self, machine: &str) -> Result<(), LabError> {
        let conn = self.connect()?;
        let dom = self.domain(&conn, machine)?;
        dom.qemu_agent_command(GUEST_PING, AGENT_PING_TIMEOUT_SECS, 0)
            .map(|_| ())
            .map_err(|e| libvirt_err(&format!("guest agent on {machine}"), e))
    }

    /// Poll the guest agent until it answers or `agent_timeout` passes.
    async fn wait_for_agent(&self, machine: &str) -> Result<(), LabError> {
        let deadline = tokio::time::Instant::now() + self.agent_timeout;

        loop {
            match self.ping_agent(machine) {
                Ok(()) => {
                    tracing::debug!(machine, "guest agent ready");
                    return Ok(());
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(AGENT_RETRY_INTERVAL_MS)).await;
                }
                Err(e) => {
                    return Err(LabError::Inventory {
                        message: format!(
                            "guest agent on {machine} did not respond within {}s: {e}",
                            self.agent_timeout.as_secs()
                        ),
                        hint: "install and enable qemu-guest-agent in the guest".into(),
                    });
                }
            }
        }
    }
}

fn libvirt_err(context: &str, e: virt_error::Error) -> LabError {
    LabError::Inventory {
        message: format!("{context}: {e}"),
        hint: String::new(),
    }
}

fn machine_snapshots(dom: &Domain) -> Result<Vec<Snapshot>, LabError> {
    let mut flat: Vec<FlatSnapshot> = Vec::new();
    for snap in dom
        .list_all_snapshots(0)
        .map_err(|e| libvirt_err("listing snapshots", e))?
    {
        let xml = snap
            .get_xml_desc(0)
            .map_err(|e| libvirt_err("reading snapshot XML", e))?;
        flat.push(snapshot_xml::parse_snapshot_xml(&xml)?);
    }
    Ok(snapshot_xml::build_forest(flat))
}

#[async_trait]
impl InventoryGateway for LibvirtInventory {
    async fn list_machines(&self) -> Result<Vec<Machine>, LabError> {
        let conn = self.connect()?;
        let domains = conn
            .list_all_domains(0)
            .map_err(|e| libvirt_err("listing domains", e))?;

        let mut machines = Vec::with_capacity(domains.len());
        for dom in &domains {
            let name = dom
                .get_name()
                .map_err(|e| libvirt_err("reading domain name", e))?;
            let mut machine = Machine::new(name);
            machine.snapshots = machine_snapshots(dom)?;
            machines.push(machine);
        }
        Ok(machines)
    }

    async fn revert(&self, machine: &str, snapshot: &Snapshot) -> Result<(), LabError> {
        let conn = self.connect()?;
        let dom = self.domain(&conn, machine)?;
        let snap = DomainSnapshot::lookup_by_name(&dom, &snapshot.id, 0)
            .map_err(|e| libvirt_err(&format!("snapshot {} on {machine}", snapshot.id), e))?;
        snap.revert(0)
            .map_err(|e| libvirt_err(&format!("reverting {machine} to {}", snapshot.name), e))?;
        tracing::info!(machine, snapshot = %snapshot.name, "reverted");
        Ok(())
    }

    async fn power_on(&self, machine: &str) -> Result<(), LabError> {
        let conn = self.connect()?;
        let dom = self.domain(&conn, machine)?;
        let active = dom
            .is_active()
            .map_err(|e| libvirt_err(&format!("state of {machine}"), e))?;
        if active {
            tracing::debug!(machine, "already running");
            return Ok(());
        }
        dom.create()
            .map_err(|e| libvirt_err(&format!("starting {machine}"), e))?;
        tracing::info!(machine, "powered on");
        Ok(())
    }

    async fn set_user_password(
        &self,
        machine: &str,
        user: &str,
        password: &str,
    ) -> Result<(), LabError> {
        self.wait_for_agent(machine).await?;
        let conn = self.connect()?;
        let dom = self.domain(&conn, machine)?;
        dom.set_user_password(user, password, 0)
            .map_err(|e| libvirt_err(&format!("setting password for {user} on {machine}"), e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), LabError> {
        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!(uri = %self.uri, "inventory session closed");
        Ok(())
    }
}
