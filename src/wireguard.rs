//! Per-run WireGuard key rotation, peer registration and client profiles.
//!
//! Private keys live only in the [`WireGuardService`] that generated them and
//! are dropped with it at the end of the run.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::WireGuardConfig;
use crate::credentials::{self, KeyPair};
use crate::error::LabError;
use crate::gateway::{PeerRecord, VpnGateway};

pub const PROFILE_CONTENT_TYPE: &str = "application/x-wireguard-profile";

pub fn profile_filename(user: &str) -> String {
    format!("{user}-wireguard.conf")
}

/// What `register_peer` did for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Auto-registration is off or no gateway client is configured.
    Skipped,
    Updated { peer_id: String },
}

pub struct WireGuardService {
    config: WireGuardConfig,
    vpn: Option<Arc<dyn VpnGateway>>,
    keys: HashMap<String, KeyPair>,
}

impl WireGuardService {
    pub fn new(config: WireGuardConfig, vpn: Option<Arc<dyn VpnGateway>>) -> Self {
        Self {
            config,
            vpn,
            keys: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn validate(&self) -> Result<(), LabError> {
        self.config.validate()
    }

    /// Issue a fresh keypair for `user`, replacing any earlier one, and
    /// return its public key.
    pub fn rotate_user_key(&mut self, user: &str) -> Result<String, LabError> {
        let pair = credentials::generate_keypair().map_err(|e| LabError::WireGuard {
            message: format!("failed to generate key pair for {user}: {e}"),
        })?;
        let public = pair.public_key.clone();
        self.keys.insert(user.to_string(), pair);
        Ok(public)
    }

    pub fn public_key(&self, user: &str) -> Result<String, LabError> {
        let pair = self.key_for(user)?;
        credentials::public_key_for(&pair.private_key)
    }

    fn key_for(&self, user: &str) -> Result<&KeyPair, LabError> {
        self.keys.get(user).ok_or_else(|| LabError::WireGuard {
            message: format!("no private key found for user {user}"),
        })
    }

    pub fn tunnel_address(&self, index: usize) -> Result<&str, LabError> {
        self.config
            .client_addresses
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| LabError::WireGuard {
                message: format!("invalid user index {index} for WireGuard client addresses"),
            })
    }

    /// Point the pre-provisioned peer slot for the `index`-th user at that
    /// user's current public key, then read it back to confirm the write.
    pub async fn register_peer(&self, user: &str, index: usize) -> Result<Registration, LabError> {
        if !self.config.auto_register_peers {
            return Ok(Registration::Skipped);
        }
        let Some(vpn) = &self.vpn else {
            tracing::warn!(user, "peer auto-registration enabled but no VPN gateway credentials");
            return Ok(Registration::Skipped);
        };

        let public_key = self.key_for(user)?.public_key.clone();
        let address = self.tunnel_address(index)?;

        let existing = vpn
            .find_peer_by_tunnel_address(address)
            .await
            .map_err(|e| gateway_err(format!("failed to search for peer at {address}"), e))?
            .ok_or_else(|| LabError::PeerNotFound {
                address: address.to_string(),
            })?;

        let name = if existing.name.is_empty() {
            user.to_string()
        } else {
            existing.name.clone()
        };
        let update = PeerRecord {
            id: existing.id.clone(),
            name,
            public_key: public_key.clone(),
            tunnel_address: existing.tunnel_address.clone(),
            servers: existing.servers.clone(),
        };
        tracing::debug!(user, address, peer = %update.id, "updating peer key");
        vpn.update_peer(&update)
            .await
            .map_err(|e| gateway_err(format!("failed to update peer {}", update.id), e))?;

        let stored = vpn
            .find_peer_by_tunnel_address(address)
            .await
            .map_err(|e| gateway_err(format!("failed to verify peer at {address}"), e))?
            .ok_or_else(|| LabError::PeerVerification {
                address: address.to_string(),
                reason: "peer disappeared after update".into(),
            })?;

        if stored.public_key != public_key {
            return Err(LabError::PeerVerification {
                address: address.to_string(),
                reason: format!(
                    "peer key mismatch: expected {public_key}, got {}",
                    stored.public_key
                ),
            });
        }

        Ok(Registration::Updated {
            peer_id: existing.id,
        })
    }

    /// Render the `wg-quick` profile for `user` at tunnel slot `index`.
    pub fn render_client_config(&self, user: &str, index: usize) -> Result<String, LabError> {
        if !self.config.enabled {
            return Err(LabError::WireGuard {
                message: "WireGuard is not enabled in configuration".into(),
            });
        }
        let address = self.tunnel_address(index)?;
        let pair = self.key_for(user)?;
        let c = &self.config;

        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", pair.private_key);
        let _ = writeln!(out, "Address = {address}");
        if c.mtu > 0 {
            let _ = writeln!(out, "MTU = {}", c.mtu);
        }
        let _ = writeln!(out, "\n[Peer]");
        let _ = writeln!(out, "PublicKey = {}", c.server_public_key);
        let _ = writeln!(out, "Endpoint = {}", c.server_endpoint);
        if !c.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", c.allowed_ips.join(", "));
        }
        if c.keepalive > 0 {
            let _ = writeln!(out, "PersistentKeepalive = {}", c.keepalive);
        }
        Ok(out)
    }
}

/// Gateway rejections keep their variant; anything else is a transport failure.
fn gateway_err(context: String, e: LabError) -> LabError {
    match e {
        rejected @ LabError::VpnRejected { .. } => rejected,
        other => LabError::VpnTransport {
            message: format!("{context}: {other}"),
        },
    }
}
