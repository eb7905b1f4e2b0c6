// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-line surface: the daemon plus one-shot administration commands.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{JobId, MacAddress, NewDevice, TransportKind};
use spoolwerk_print::diagnostics::diagnose_subnet;
use spoolwerk_print::discovery::Subnet;

use crate::services::data_dir;
use crate::services::print_services::{PrintServices, load_config};

/// Spoolwerk: network print server.
#[derive(Parser, Debug)]
#[command(name = "spoolwerk", version, about, long_about = None)]
pub struct Cli {
    /// Data directory holding the database, spool and config.json.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Configuration file, instead of `<data-dir>/config.json`.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Print listings as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the print server until interrupted.
    Serve,
    /// Manage registered printers.
    Device {
        #[command(subcommand)]
        action: DeviceCommand,
    },
    /// List queued jobs.
    Jobs {
        /// Only jobs for this device.
        device: Option<String>,
    },
    /// Cancel one queued job.
    Cancel { job: i64 },
    /// Drop every job queued for a device.
    Clear { device: String },
    /// Show queue statistics.
    Stats,
    /// Check connectivity towards a subnet, e.g. 192.168.1.0/24.
    Diagnose { cidr: String },
    /// Try to re-locate a device whose address changed.
    Rediscover { device: String },
}

#[derive(Subcommand, Debug)]
pub enum DeviceCommand {
    /// Register a printer.
    Add(AddDevice),
    /// List registered printers.
    List,
    /// Remove a printer and its queue.
    Remove { alias: String },
    /// Record a printer's hardware address, or clear it when omitted.
    SetMac { alias: String, mac: Option<String> },
    /// Sweep a subnet, e.g. 192.168.1.0/24, and register the printers found.
    Discover { cidr: String },
}

#[derive(Args, Debug)]
pub struct AddDevice {
    pub alias: String,
    pub ip: IpAddr,
    #[arg(long)]
    pub port: Option<u16>,
    /// raw, lpd, ipp or vendor-share.
    #[arg(long, default_value = "raw")]
    pub transport: String,
    #[arg(long)]
    pub mac: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub location: Option<String>,
    /// Reached through a relay host at `ip`.
    #[arg(long)]
    pub shared: bool,
}

impl AddDevice {
    fn into_new_device(self) -> Result<NewDevice> {
        let transport: TransportKind = self.transport.parse()?;
        let mac = self.mac.as_deref().map(str::parse::<MacAddress>).transpose()?;
        Ok(NewDevice {
            alias: self.alias,
            ip: self.ip,
            port: self.port,
            transport,
            mac,
            model: self.model,
            location: self.location,
            shared: self.shared,
        })
    }
}

/// Execute a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    if let Command::Diagnose { cidr } = &cli.command {
        return diagnose(cidr).await;
    }

    let explicit = cli.data_dir.as_deref();
    let dir = data_dir::resolve(explicit);
    let config = load_config(cli.config.as_deref(), &dir)?;
    let dir = match (explicit, &config.storage.data_dir) {
        (None, Some(configured)) => configured.clone(),
        _ => dir,
    };
    let services = PrintServices::open(dir, config)?;
    let json = cli.json;

    match cli.command {
        Command::Serve => {
            services
                .serve(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for interrupt");
                    }
                })
                .await?;
        }
        Command::Device { action } => device(&services, action, json).await?,
        Command::Jobs { device } => {
            let jobs = services.jobs(device.as_deref()).await?;
            if json {
                return print_json(&jobs);
            }
            if jobs.is_empty() {
                println!("no queued jobs");
            }
            for job in jobs {
                println!(
                    "{:>6}  device {:<4} {:<24} {:<16} {:>10} B  {}",
                    job.id,
                    job.device_id,
                    job.file_name,
                    job.owner,
                    job.payload_len,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Cancel { job } => {
            if services.cancel_job(JobId(job)).await? {
                println!("job {job} cancelled");
            } else {
                return Err(SpoolwerkError::JobNotFound(job));
            }
        }
        Command::Clear { device } => {
            let removed = services.clear_queue(&device).await?;
            println!("{removed} job(s) removed from {device}");
        }
        Command::Stats => {
            let stats = services.stats().await?;
            if json {
                return print_json(&stats);
            }
            println!("queued jobs:     {}", stats.total_jobs);
            println!("active devices:  {}", stats.active_devices);
            println!("max concurrent:  {}", stats.max_concurrent);
        }
        Command::Rediscover { device } => {
            let relocation = services.rediscover(&device).await?;
            if json {
                return print_json(&relocation);
            }
            println!(
                "{} moved {} -> {} via {}{}",
                relocation.device.alias,
                relocation.previous_ip,
                relocation.device.ip,
                relocation.strategy,
                if relocation.verified { "" } else { " (unverified)" }
            );
        }
        Command::Diagnose { .. } => {}
    }
    Ok(())
}

async fn device(services: &PrintServices, action: DeviceCommand, json: bool) -> Result<()> {
    match action {
        DeviceCommand::Add(args) => {
            let device = services.add_device(args.into_new_device()?).await?;
            println!("registered {} (id {})", device.alias, device.id);
        }
        DeviceCommand::List => {
            let devices = services.devices().await?;
            if json {
                return print_json(&devices);
            }
            if devices.is_empty() {
                println!("no devices registered");
            }
            for d in devices {
                println!(
                    "{:>4}  {:<20} {:<15} {:<12} {:<17} {}",
                    d.id,
                    d.alias,
                    d.ip,
                    d.transport,
                    d.mac.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                    d.ipp_port.map(|p| format!("port {p}")).unwrap_or_default()
                );
            }
        }
        DeviceCommand::Remove { alias } => {
            services.remove_device(&alias).await?;
            println!("removed {alias}");
        }
        DeviceCommand::Discover { cidr } => {
            let subnet: Subnet = cidr.parse()?;
            let report = services.discover(&subnet).await?;
            if json {
                return print_json(&report);
            }
            println!("{} host(s) swept in {}", report.scanned, report.subnet);
            for d in &report.registered {
                println!(
                    "registered {} at {} ({}), port {}",
                    d.alias,
                    d.ip,
                    d.transport,
                    d.ipp_port.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
                );
            }
            for ip in &report.known {
                println!("already registered: {ip}");
            }
        }
        DeviceCommand::SetMac { alias, mac } => {
            let mac = mac.as_deref().map(str::parse::<MacAddress>).transpose()?;
            let device = services.set_mac(&alias, mac).await?;
            match device.mac {
                Some(mac) => println!("{} now identified by {mac}", device.alias),
                None => println!("{} has no hardware address", device.alias),
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn diagnose(cidr: &str) -> Result<()> {
    let subnet: Subnet = cidr.parse()?;
    let report = diagnose_subnet(&subnet).await;
    print!("{report}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn device_add_parses_options() {
        let cli = Cli::try_parse_from([
            "spoolwerk",
            "--data-dir",
            "/tmp/sw",
            "device",
            "add",
            "Lab",
            "192.168.1.40",
            "--transport",
            "lpd",
            "--mac",
            "00-1b-a9-33-44-55",
        ])
        .expect("parse");
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/sw")));
        let Command::Device {
            action: DeviceCommand::Add(args),
        } = cli.command
        else {
            panic!("expected device add");
        };
        let device = args.into_new_device().expect("device");
        assert_eq!(device.transport, TransportKind::Lpd);
        assert_eq!(
            device.mac.map(|m| m.to_string()).as_deref(),
            Some("00:1B:A9:33:44:55")
        );
        assert!(!device.shared);
    }

    #[test]
    fn bad_transport_is_a_config_error() {
        let cli = Cli::try_parse_from(["spoolwerk", "device", "add", "Lab", "10.0.0.5", "--transport", "fax"])
            .expect("parse");
        let Command::Device {
            action: DeviceCommand::Add(args),
        } = cli.command
        else {
            panic!("expected device add");
        };
        assert!(matches!(args.into_new_device(), Err(SpoolwerkError::Config(_))));
    }

    #[test]
    fn cancel_requires_numeric_job() {
        assert!(Cli::try_parse_from(["spoolwerk", "cancel", "abc"]).is_err());
        let cli = Cli::try_parse_from(["spoolwerk", "cancel", "12"]).expect("parse");
        assert!(matches!(cli.command, Command::Cancel { job: 12 }));
    }

    #[test]
    fn device_discover_takes_a_cidr() {
        let cli = Cli::try_parse_from(["spoolwerk", "device", "discover", "192.168.1.0/24"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Command::Device {
                action: DeviceCommand::Discover { ref cidr }
            } if cidr == "192.168.1.0/24"
        ));
    }

    #[tokio::test]
    async fn device_discover_rejects_bad_cidr() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cli = Cli::try_parse_from([
            "spoolwerk",
            "--data-dir",
            tmp.path().to_str().expect("utf-8 path"),
            "device",
            "discover",
            "192.168.1.0",
        ])
        .expect("parse");
        assert!(matches!(run(cli).await, Err(SpoolwerkError::Config(_))));
    }

    #[test]
    fn json_flag_is_global() {
        let cli = Cli::try_parse_from(["spoolwerk", "device", "list", "--json"]).expect("parse");
        assert!(cli.json);
    }

    #[tokio::test]
    async fn cancel_of_unknown_job_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cli = Cli::try_parse_from([
            "spoolwerk",
            "--data-dir",
            tmp.path().to_str().expect("utf-8 path"),
            "cancel",
            "99",
        ])
        .expect("parse");
        assert!(matches!(run(cli).await, Err(SpoolwerkError::JobNotFound(99))));
    }
}
