use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LabError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("inventory error: {message}")]
    #[diagnostic(help("{hint}"))]
    Inventory { message: String, hint: String },

    #[error("calendar error: {message}")]
    Calendar { message: String },

    #[error("snapshot '{snapshot}' not found for machine {machine}")]
    SnapshotNotFound { machine: String, snapshot: String },

    #[error("no snapshots found for machine {machine}")]
    NoSnapshots { machine: String },

    #[error("credential generation failed: {message}")]
    Credential { message: String },

    #[error("VPN gateway request failed: {message}")]
    VpnTransport { message: String },

    #[error("VPN gateway rejected {operation}: {message}")]
    VpnRejected { operation: String, message: String },

    #[error("no existing peer found for tunnel address {address}")]
    #[diagnostic(help("peer slots must be provisioned on the gateway before registration"))]
    PeerNotFound { address: String },

    #[error("peer verification failed for {address}: {reason}")]
    PeerVerification { address: String, reason: String },

    #[error("WireGuard error: {message}")]
    WireGuard { message: String },

    #[error("notification failed: {message}")]
    Notification { message: String },

    #[error("no machines available in inventory for {bookings} active booking(s)")]
    NoMachinesAvailable { bookings: usize },
}

impl LabError {
    /// Read-after-write mismatches are reported apart from plain request failures.
    pub fn is_verification(&self) -> bool {
        matches!(self, LabError::PeerVerification { .. })
    }
}
