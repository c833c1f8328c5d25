use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::replica::{Replica, ReplicaTrail, TrailStatus};
use crate::snapshot::BtrfsSnapshotProvider;
use crate::streaming::channel::data_bus;
use crate::streaming::sender::{TransferRequest, WorkerConfig};
use crate::streaming::supervisor::Supervisor;
use crate::trail::{FileTrailStore, TrailStore};
use crate::transport::control::{forward_data, serve_acks, TcpConnector};

#[derive(Parser, Debug)]
#[command(name = "snapsend")]
#[command(version)]
#[command(about = "Send btrfs share snapshots to a replication receiver", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/snapsend/config.toml if present)
    #[arg(short, long, global = true, env = "SNAPSEND_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Trail store file
    #[arg(long, global = true, env = "SNAPSEND_TRAIL_FILE")]
    pub trail_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one snapshot of a share
    Send(SendArgs),

    /// List replication trails of a replica
    Trails {
        #[arg(long)]
        replica_id: u64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    #[arg(long)]
    pub replica_id: u64,

    /// Source pool
    #[arg(long)]
    pub pool: String,

    #[arg(long)]
    pub share: String,

    /// Receiving appliance host
    #[arg(long)]
    pub appliance: String,

    /// Pool on the receiving appliance
    #[arg(long)]
    pub dest_pool: String,

    /// Snapshot name
    #[arg(long)]
    pub snap: String,

    /// Address the receiver knows this sender by
    #[arg(long)]
    pub sender_ip: String,

    #[arg(long, default_value = "10002")]
    pub data_port: u16,

    #[arg(long, default_value = "10003")]
    pub meta_port: u16,

    /// Local port for receiver acks (default: meta port + 1)
    #[arg(long)]
    pub ack_port: Option<u16>,

    /// Send incrementally from this previously replicated snapshot
    #[arg(long, conflicts_with = "incremental")]
    pub prev_snap: Option<String>,

    /// Send incrementally from the last successful trail, if any
    #[arg(long)]
    pub incremental: bool,

    /// Override the mount point prefix
    #[arg(long)]
    pub mnt_pt: Option<String>,

    /// Override the diff tool binary
    #[arg(long)]
    pub diff_tool: Option<PathBuf>,
}

impl SendArgs {
    pub fn replica(&self) -> Replica {
        Replica {
            id: self.replica_id,
            pool: self.pool.clone(),
            share: self.share.clone(),
            appliance: self.appliance.clone(),
            dpool: self.dest_pool.clone(),
        }
    }

    pub fn ack_port(&self) -> Result<u16> {
        match self.ack_port {
            Some(port) => Ok(port),
            None => self
                .meta_port
                .checked_add(1)
                .context("--meta-port is the last port; pass --ack-port explicitly"),
        }
    }

    fn apply(&self, config: &mut Config) {
        if let Some(mnt_pt) = &self.mnt_pt {
            config.mnt_pt = mnt_pt.clone();
        }
        if let Some(diff_tool) = &self.diff_tool {
            config.diff_tool = diff_tool.clone();
        }
    }
}

impl Cli {
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(path) = &self.trail_file {
            config.trail_path = Some(path.clone());
        }
        if let Command::Send(args) = &self.command {
            args.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    /// Run the selected command; returns the process exit code.
    pub async fn run(self, config: Config) -> Result<i32> {
        match &self.command {
            Command::Send(args) => send(args, config).await,
            Command::Trails { replica_id } => trails(*replica_id, &config).await,
        }
    }
}

/// Pick the incremental base for a send.
pub async fn resolve_previous(
    store: &dyn TrailStore,
    args: &SendArgs,
) -> Result<Option<ReplicaTrail>> {
    if let Some(prev) = &args.prev_snap {
        let found = store
            .list(args.replica_id)
            .await?
            .into_iter()
            .rev()
            .find(|t| t.status == TrailStatus::Succeeded && &t.snap_name == prev);
        return match found {
            Some(trail) => Ok(Some(trail)),
            None => bail!(
                "No successful trail for snapshot {} of replica {}",
                prev,
                args.replica_id
            ),
        };
    }
    if args.incremental {
        return Ok(store.latest_succeeded(args.replica_id).await?);
    }
    Ok(None)
}

async fn send(args: &SendArgs, config: Config) -> Result<i32> {
    let store = Arc::new(FileTrailStore::open(config.trail_path()?)?);
    let previous = resolve_previous(&*store, args).await?;

    let ack_port = args.ack_port()?;
    let listener = TcpListener::bind(("0.0.0.0", ack_port))
        .await
        .with_context(|| format!("Failed to bind ack listener on port {}", ack_port))?;

    let data_addr = format!("{}:{}", args.appliance, args.data_port);
    let data_stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&data_addr))
        .await
        .with_context(|| format!("Timed out connecting to data port {}", data_addr))?
        .with_context(|| format!("Failed to connect to data port {}", data_addr))?;
    data_stream.set_nodelay(true)?;

    let (bus, bus_rx) = data_bus();
    let forwarder = tokio::spawn(async move {
        let mut stream = data_stream;
        forward_data(bus_rx, &mut stream).await
    });

    let supervisor = Supervisor::new(
        WorkerConfig::from(&config),
        Arc::new(TcpConnector::new(config.connect_timeout())),
        store,
        Arc::new(BtrfsSnapshotProvider::new(&config.btrfs, &config.mnt_pt)),
        Arc::new(bus),
    );
    let ack_server = tokio::spawn(serve_acks(listener, supervisor.router()));

    let request = TransferRequest {
        replica: args.replica(),
        snap_name: args.snap.clone(),
        sender_ip: args.sender_ip.clone(),
        data_port: args.data_port,
        meta_port: args.meta_port,
        previous,
    };
    let mut handle = supervisor.spawn_transfer(request).await?;

    let finished = tokio::select! {
        res = &mut handle => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(res) => res,
        None => {
            tracing::warn!("interrupted, stopping transfer");
            supervisor.shutdown();
            handle.await
        }
    };
    let outcome = joined.context("Transfer task panicked")?;

    // Last bus publisher goes with the supervisor; let the forwarder drain
    drop(supervisor);
    ack_server.abort();
    match forwarder.await {
        Ok(Ok(frames)) => tracing::debug!(frames, "data forwarder finished"),
        Ok(Err(e)) => tracing::error!("data forwarder failed: {:#}", e),
        Err(e) => tracing::error!("data forwarder task failed: {}", e),
    }

    match outcome {
        Ok(report) => {
            println!(
                "{} {} ({} KiB, {})",
                "sent".green().bold(),
                report.transfer_id,
                report.kb_sent,
                if report.incremental { "incremental" } else { "full" }
            );
            Ok(0)
        }
        Err(abort) => {
            eprintln!("{} {}", "failed:".red().bold(), abort);
            Ok(abort.exit_code())
        }
    }
}

async fn trails(replica_id: u64, config: &Config) -> Result<i32> {
    let store = FileTrailStore::open(config.trail_path()?)?;
    let trails = store.list(replica_id).await?;
    if trails.is_empty() {
        println!("No trails for replica {}", replica_id);
        return Ok(0);
    }

    for trail in trails {
        println!("{}", format_trail(&trail));
    }
    Ok(0)
}

fn format_trail(trail: &ReplicaTrail) -> String {
    let status = match trail.status {
        TrailStatus::Succeeded => trail.status.as_str().green(),
        TrailStatus::Failed => trail.status.as_str().red(),
        TrailStatus::Pending => trail.status.as_str().yellow(),
    };
    let mut line = format!(
        "{:>6}  {:<10} {:<30} {}",
        trail.id,
        status,
        trail.snap_name,
        trail.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(kb) = trail.kb_sent {
        line.push_str(&format!("  {} KiB", kb));
    }
    if let Some(err) = &trail.error {
        line.push_str(&format!("  {}", err.dimmed()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::TrailUpdate;
    use crate::trail::MemoryTrailStore;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn send_args(extra: &[&str]) -> SendArgs {
        let mut argv = vec![
            "snapsend",
            "send",
            "--replica-id",
            "7",
            "--pool",
            "pool0",
            "--share",
            "docs",
            "--appliance",
            "10.0.0.2",
            "--dest-pool",
            "backup",
            "--snap",
            "docs_3",
            "--sender-ip",
            "10.0.0.1",
        ];
        argv.extend_from_slice(extra);
        match parse(&argv).command {
            Command::Send(args) => args,
            other => panic!("Expected Send, got {:?}", other),
        }
    }

    #[test]
    fn test_send_defaults() {
        let args = send_args(&[]);
        assert_eq!(args.data_port, 10002);
        assert_eq!(args.meta_port, 10003);
        assert_eq!(args.ack_port().unwrap(), 10004);
        assert_eq!(args.replica().dpool, "backup");
    }

    #[test]
    fn test_ack_port_overflow() {
        let args = send_args(&["--meta-port", "65535"]);
        assert!(args.ack_port().is_err());
        let args = send_args(&["--meta-port", "65535", "--ack-port", "9000"]);
        assert_eq!(args.ack_port().unwrap(), 9000);
    }

    #[test]
    fn test_prev_snap_conflicts_with_incremental() {
        let res = Cli::try_parse_from([
            "snapsend",
            "send",
            "--replica-id",
            "1",
            "--pool",
            "p",
            "--share",
            "s",
            "--appliance",
            "a",
            "--dest-pool",
            "d",
            "--snap",
            "x",
            "--sender-ip",
            "i",
            "--prev-snap",
            "w",
            "--incremental",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let temp = tempfile::tempdir().unwrap();
        let config_path = temp.path().join("config.toml");
        std::fs::write(&config_path, "mnt_pt = \"/pools/\"\n").unwrap();

        let cli = parse(&[
            "snapsend",
            "--config",
            config_path.to_str().unwrap(),
            "--log-level",
            "debug",
            "trails",
            "--replica-id",
            "1",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.mnt_pt, "/pools/");
        assert_eq!(config.log_level, "debug");
    }

    #[tokio::test]
    async fn test_resolve_previous() {
        let store = MemoryTrailStore::new();
        let t1 = store.create_trail(7, "docs_1").await.unwrap();
        store
            .update_trail(t1.id, &TrailUpdate::succeeded(2048))
            .await
            .unwrap();
        let t2 = store.create_trail(7, "docs_2").await.unwrap();
        store
            .update_trail(t2.id, &TrailUpdate::failed("boom"))
            .await
            .unwrap();

        let full = resolve_previous(&store, &send_args(&[])).await.unwrap();
        assert!(full.is_none());

        let inc = resolve_previous(&store, &send_args(&["--incremental"]))
            .await
            .unwrap();
        assert_eq!(inc.unwrap().snap_name, "docs_1");

        let named = resolve_previous(&store, &send_args(&["--prev-snap", "docs_1"]))
            .await
            .unwrap();
        assert_eq!(named.unwrap().id, t1.id);

        // Failed trails are not a valid base
        assert!(resolve_previous(&store, &send_args(&["--prev-snap", "docs_2"]))
            .await
            .is_err());
    }

    #[test]
    fn test_format_trail() {
        colored::control::set_override(false);
        let trail = ReplicaTrail {
            id: 3,
            replica_id: 7,
            snap_name: "docs_1".to_string(),
            status: TrailStatus::Failed,
            kb_sent: None,
            error: Some("Error on Receiver: no space".to_string()),
            started_at: chrono::Utc::now(),
            ended_at: None,
        };
        let line = format_trail(&trail);
        assert!(line.contains("failed"));
        assert!(line.contains("docs_1"));
        assert!(line.contains("no space"));
    }
}
