//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use dms_core::harness::{install_app, ChannelListener, TestDevice};
use dms_core::{CallerInfo, DmsConfig, Want};
use dms_transport::LoopbackNetwork;

const LOCAL_DEVICE: &str = "local-device";
const REMOTE_DEVICE: &str = "remote-device";

/// DMS demo - start an ability on a simulated peer device
#[derive(Parser, Debug)]
#[command(name = "dms-demo")]
#[command(version, about = "DMS demo - start an ability on a simulated peer device")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug mode (session-level tracing)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path (falls back to $DMS_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an ability on the remote device
    Start(StartArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Bundle to start on the remote device
    #[arg(long, default_value = "com.example.notes")]
    pub bundle: String,

    /// Ability within the bundle
    #[arg(long, default_value = "MainAbility")]
    pub ability: String,

    /// Signature the local caller app is signed with
    #[arg(long, default_value = "DEVSIG01")]
    pub caller_signature: String,

    /// Signature the remote callee bundle is signed with
    #[arg(long, default_value = "DEVSIG01")]
    pub callee_signature: String,

    /// Uid of the local caller app
    #[arg(long, default_value_t = 10_001)]
    pub caller_uid: u32,

    /// Seconds to wait for the remote answer
    #[arg(long, default_value_t = 5)]
    pub wait_secs: u64,
}

impl Cli {
    pub async fn execute(self, config: DmsConfig) -> anyhow::Result<bool> {
        match self.command {
            Commands::Start(args) => args.execute(config).await,
            Commands::Config => {
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(true)
            }
        }
    }
}

impl StartArgs {
    async fn execute(self, config: DmsConfig) -> anyhow::Result<bool> {
        let network = LoopbackNetwork::new();
        let local = TestDevice::spawn(&network, LOCAL_DEVICE, config.clone())
            .context("failed to start local device")?;
        let remote = TestDevice::spawn(&network, REMOTE_DEVICE, config)
            .context("failed to start remote device")?;

        install_app(&local.registry, "com.example.launcher", self.caller_uid, &self.caller_signature);
        install_app(&remote.registry, &self.bundle, self.caller_uid + 1, &self.callee_signature);

        let (listener, mut rx) = ChannelListener::new();
        local.service.start_remote_ability(
            Want::new(REMOTE_DEVICE, &self.bundle, &self.ability),
            CallerInfo::new(self.caller_uid),
            listener,
        )?;

        let outcome = tokio::time::timeout(Duration::from_secs(self.wait_secs), rx.recv())
            .await
            .context("no answer from remote device")?
            .context("completion listener dropped")?;

        let succeeded = match &outcome {
            Ok(()) => {
                println!("started {}/{} on {REMOTE_DEVICE}", self.bundle, self.ability);
                true
            }
            Err(e) => {
                println!("remote start failed: {e} (code {})", e.code());
                false
            }
        };
        info!(stats = ?remote.service.stats(), "remote dispatch statistics");

        local.stop().await?;
        remote.stop().await?;
        Ok(succeeded)
    }
}
