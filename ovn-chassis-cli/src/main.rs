use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use tracing::level_filters::LevelFilter;
use ovn_chassis_lib::agent::ChassisAgent;
use ovn_chassis_lib::exec::SubprocessRunner;
use ovn_chassis_lib::status::{report_status, ChassisStatus};
use ovn_chassis_schemas::cli_models::{Opts, SubCommand};
use ovn_chassis_schemas::settings::ChassisConfig;


#[tokio::main(flavor = "current_thread")]
async fn main() {
    std::process::exit(match run_app().await {
        Ok(_) => 0,
        Err(err) => {
            tracing::error!("{:#}", err);
            1
        }
    });
}

fn log_level(s: &str) -> anyhow::Result<LevelFilter> {
    match s.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        _ => Err(anyhow!("Unknown Log LevelFilter {}", s)),
    }
}

/// Parses the CLI arguments, sets up logging and runs the requested command. A failed command
/// makes the process exit with 1 so the caller can mark the pass as failed and retry later.
pub async fn run_app() -> Result<(), anyhow::Error> {
    let opts: Opts = Opts::parse();
    let mut e = None;
    let level = match &opts.verbosity {
        None => LevelFilter::INFO,
        Some(x) => match log_level(x) {
            Ok(l) => l,
            Err(err) => {
                e = Some(err);
                LevelFilter::INFO
            }
        },
    };

    let stdout_log = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(stdout_log.with_filter(level))
        .init();
    if let Some(e) = e {
        tracing::warn!("{}", e);
    }

    let sub_command = opts.sub_command.name();
    parse_command(opts)
        .await
        .with_context(|| format!("running {sub_command}"))
}

/// This is the entrypoint for all commands
pub async fn parse_command(opts: Opts) -> anyhow::Result<()> {
    let config_path = opts.config.clone().unwrap_or_else(ChassisConfig::default_location);
    let config = ChassisConfig::load_from_file(&config_path)
        .await
        .with_context(|| format!("loading chassis config from {config_path:?}"))?;
    tracing::trace!("chassis config = {}", config);

    // status updates are only logged, whoever drives the agent reads them from the log
    let (status_send, mut status_recv) = mpsc::channel(32);
    let status_task = tokio::spawn(async move {
        while let Some(status) = status_recv.recv().await {
            if status == ChassisStatus::End {
                break;
            }
            tracing::info!("status: {status}");
        }
    });

    let mut agent = ChassisAgent::new(SubprocessRunner, config);
    if opts.sub_command.is_mutating() {
        agent = agent.with_status(status_send.clone());
    }
    let result = run_sub_command(&agent, &opts.sub_command).await;

    report_status(Some(&status_send), ChassisStatus::End).await;
    status_task.await.context("waiting for status task")?;
    result
}

async fn run_sub_command(
    agent: &ChassisAgent<SubprocessRunner>,
    sub_command: &SubCommand,
) -> anyhow::Result<()> {
    match sub_command {
        SubCommand::Reconcile => {
            let report = agent.reconcile().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SubCommand::Bridges => {
            let report = agent.configure_bridges().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SubCommand::Notrack => {
            let state = agent.configure_notrack_rules().await?;
            tracing::info!("notrack chain is {state}");
        }
        SubCommand::RemoveNotrack => {
            agent.remove_notrack_rules().await?;
        }
        SubCommand::InterfaceRequests(cmd) => {
            let raw = tokio::fs::read_to_string(&cmd.payload)
                .await
                .with_context(|| format!("reading interface requests from {:?}", cmd.payload))?;
            let digest = agent.apply_interface_requests(&raw).await?;
            // the requester compares this against the digest of what it sent
            println!("{digest}");
        }
        SubCommand::ChassisInfo => {
            let info = agent.chassis_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        SubCommand::Show => {
            let topology = agent.managed_topology().await?;
            let notrack = agent.notrack_state().await?;
            let show = serde_json::json!({
                "bridges": topology,
                "notrack": notrack,
            });
            println!("{}", serde_json::to_string_pretty(&show)?);
        }
    }
    Ok(())
}
