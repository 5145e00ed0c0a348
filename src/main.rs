use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use labprov::cli::{Cli, Command};
use labprov::config::{self, Config, Secrets};
use labprov::error::LabError;
use labprov::gateway::calendar::GoogleCalendar;
use labprov::gateway::opnsense::OpnsenseClient;
use labprov::gateway::smtp::SmtpNotifier;
use labprov::gateway::{CalendarGateway, InventoryGateway, NotificationGateway, VpnGateway};
use labprov::orchestrator::{Orchestrator, Phase, RunSettings};
use labprov::snapshot::{self, SnapshotSelector};
use labprov::wireguard::WireGuardService;
use labprov::{logging, paths};

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let terminal_filter = if cli.verbose {
        EnvFilter::new("labprov=debug")
    } else {
        EnvFilter::from_default_env().add_directive("labprov=info".parse().expect("valid log directive"))
    };
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures labprov=debug, discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("labprov=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let config = config::load_config(&cli.config)?;
    let secrets: Secrets = cli.secrets.into();

    match cli.command {
        Command::Check => check(&cli.config, &config, &secrets),
        Command::Inventory => show_inventory(&config).await,
        Command::Run => {
            let now = chrono::Utc::now();
            if !cli.no_log_file {
                let path = cli.log_file.clone().unwrap_or_else(|| paths::run_log_path(now));
                match file_handle.set_file(&path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "logging to file"),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot open log file"),
                }
                if cli.log_file.is_none() {
                    logging::rotate_run_logs(&paths::logs_dir(), logging::KEEP_RUN_LOGS);
                }
            }

            let mut orchestrator = build_orchestrator(&config, &secrets).await?;
            match orchestrator.run(now).await? {
                Phase::PartialFailure { restored, failed } => {
                    eprintln!("{restored} machine(s) provisioned, {failed} failed to restore");
                    std::process::exit(2);
                }
                _ => Ok(()),
            }
        }
    }
}

// ── wiring ──────────────────────────────────────────────────────────

#[cfg(feature = "libvirt")]
fn inventory_gateway(config: &Config) -> Result<Arc<dyn InventoryGateway>, LabError> {
    Ok(Arc::new(labprov::gateway::libvirt::LibvirtInventory::new(
        &config.inventory,
    )))
}

#[cfg(not(feature = "libvirt"))]
fn inventory_gateway(_config: &Config) -> Result<Arc<dyn InventoryGateway>, LabError> {
    Err(LabError::Inventory {
        message: "this build has no libvirt support".into(),
        hint: "rebuild with `cargo build --features libvirt`".into(),
    })
}

async fn calendar_gateway(
    config: &Config,
    secrets: &Secrets,
) -> Result<Arc<dyn CalendarGateway>, LabError> {
    if config.calendar.calendar_id.is_empty() {
        return Err(LabError::Validation {
            message: "calendar.calendar_id is required to run".into(),
        });
    }
    let key_path = config
        .service_account_path(secrets)
        .ok_or_else(|| LabError::Validation {
            message: "calendar.service_account_path or SERVICE_ACCOUNT_PATH is required to run"
                .into(),
        })?;
    let calendar = GoogleCalendar::connect(&config.calendar.calendar_id, &key_path).await?;
    Ok(Arc::new(calendar))
}

fn vpn_gateway(config: &Config, secrets: &Secrets) -> Result<Option<Arc<dyn VpnGateway>>, LabError> {
    let wg = &config.wireguard;
    if !wg.enabled || !wg.auto_register_peers {
        return Ok(None);
    }
    let (Some(key), Some(secret)) = (&secrets.opnsense_api_key, &secrets.opnsense_api_secret)
    else {
        return Err(LabError::Validation {
            message: "OPNSENSE_API_KEY and OPNSENSE_API_SECRET must be set when \
                      wireguard.auto_register_peers is enabled"
                .into(),
        });
    };
    let client = OpnsenseClient::new(&wg.opnsense_url, key, secret, wg.opnsense_insecure)?;
    if wg.opnsense_insecure {
        tracing::warn!(url = %wg.opnsense_url, "TLS certificate checks disabled for the VPN gateway");
    }
    Ok(Some(Arc::new(client)))
}

fn notifier(
    config: &Config,
    secrets: &Secrets,
) -> Result<Option<Arc<dyn NotificationGateway>>, LabError> {
    if !config.email.is_configured() {
        tracing::info!("email not configured, users will not be notified");
        return Ok(None);
    }
    let password = secrets.smtp_password.as_deref().unwrap_or_default();
    let smtp = SmtpNotifier::new(&config.email, password)?;
    Ok(Some(Arc::new(smtp)))
}

async fn build_orchestrator(config: &Config, secrets: &Secrets) -> Result<Orchestrator, LabError> {
    let inventory = inventory_gateway(config)?;
    let calendar = calendar_gateway(config, secrets).await?;
    let wireguard = WireGuardService::new(config.wireguard.clone(), vpn_gateway(config, secrets)?);
    wireguard.validate()?;
    Ok(Orchestrator::new(
        inventory,
        calendar,
        notifier(config, secrets)?,
        wireguard,
        RunSettings::from_config(config),
    ))
}

// ── commands ────────────────────────────────────────────────────────

fn check(path: &Path, config: &Config, secrets: &Secrets) -> miette::Result<()> {
    WireGuardService::new(config.wireguard.clone(), None).validate()?;

    println!("Configuration OK: {}", path.display());
    println!("  libvirt:    {}", config.inventory.libvirt_uri);
    println!(
        "  snapshot:   {}",
        SnapshotSelector::from_config(config.snapshot_name())
    );
    println!("  users:      {}", config.inventory.user_machines.len());
    println!(
        "  wireguard:  {}",
        match (config.wireguard.enabled, config.wireguard.auto_register_peers) {
            (false, _) => "disabled".to_string(),
            (true, false) => format!("{} client slot(s)", config.wireguard.client_addresses.len()),
            (true, true) => format!(
                "{} client slot(s), peers registered at {}",
                config.wireguard.client_addresses.len(),
                config.wireguard.opnsense_url
            ),
        }
    );
    println!(
        "  email:      {}",
        if config.email.is_configured() {
            format!("{}:{}", config.email.smtp_host, config.email.smtp_port)
        } else {
            "disabled".into()
        }
    );
    if config.service_account_path(secrets).is_none() {
        println!("  warning:    no calendar service account key configured");
    }
    Ok(())
}

async fn show_inventory(config: &Config) -> miette::Result<()> {
    let inventory = inventory_gateway(config)?;
    let listed = inventory.list_machines().await;
    if let Err(e) = inventory.close().await {
        tracing::warn!(error = %e, "closing inventory failed");
    }
    let machines = listed?;

    let selector = SnapshotSelector::from_config(config.snapshot_name());
    for machine in &machines {
        println!("{} ({} snapshots)", machine.name, machine.snapshot_count());
        let latest = snapshot::find_latest(&machine.snapshots);
        let target = selector.select(&machine.snapshots);
        for (depth, s) in snapshot::walk(&machine.snapshots) {
            let mut marks = Vec::new();
            if latest.is_some_and(|l| std::ptr::eq(l, s)) {
                marks.push("latest");
            }
            if target.is_some_and(|t| std::ptr::eq(t, s)) {
                marks.push("target");
            }
            let marks = if marks.is_empty() {
                String::new()
            } else {
                format!("  [{}]", marks.join(", "))
            };
            println!(
                "{}- {}  {}{marks}",
                "  ".repeat(depth + 1),
                s.name,
                s.created.format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}
