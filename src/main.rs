mod cli;
mod config;
mod demo;
mod device;
mod error;
mod initiator;
mod manifest;
mod scheduler;
mod signal;
mod store;
mod ui;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};
use config::RelayConfig;
use device::SimulatedDevice;
use initiator::{CancelOutcome, Initiator, JobRequest};
use manifest::{BurnState, DiscSettings, FileRef};
use scheduler::Executor;
use signal::{SecurityGateway, SignalRelay};
use store::{ConfiguredStore, RemoteStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = RelayConfig::load(cli.config.as_deref())?;
    if let Some(ms) = cli.poll_interval_ms {
        config.executor.poll_interval_ms = ms;
    }
    if let Some(max) = cli.max_retries {
        config.executor.max_retries = max;
    }

    match cli.command {
        Command::Demo => demo::run().await,
        Command::Executor { once } => run_executor(&config, once).await,
        Command::Submit {
            files,
            priority,
            label,
            targets,
            no_verify,
        } => {
            let request = JobRequest {
                files: files.into_iter().map(FileRef::new).collect(),
                priority: priority.into(),
                targets,
                disc_settings: DiscSettings {
                    label,
                    verify: !no_verify,
                    ..Default::default()
                },
            };
            let id = initiator(&config)?.submit(request).await?;
            println!("{id}");
            Ok(())
        }
        Command::Cancel { job_id } => {
            match initiator(&config)?.cancel_job(&job_id).await? {
                CancelOutcome::Cancelled => println!("job {job_id} cancelled"),
                CancelOutcome::Requested => {
                    println!("cancel requested; the executor stops {job_id} at its next burn slice")
                }
            }
            Ok(())
        }
        Command::Status { job_id } => {
            let initiator = initiator(&config)?;
            ui::print_status(&initiator.get_job_status(&job_id).await?);
            if let Some(record) = initiator.completion(&job_id).await? {
                println!(
                    "  finished: {} after {} retries ({} ms)",
                    record.outcome, record.retry_count, record.duration_ms
                );
            }
            Ok(())
        }
        Command::Pending => {
            ui::print_pending(&initiator(&config)?.list_pending().await?);
            Ok(())
        }
        Command::Audit { limit } => {
            ui::print_audit(&initiator(&config)?.get_audit_log(limit).await?);
            Ok(())
        }
        Command::Resubmit { job_id } => {
            initiator(&config)?.resubmit_job(&job_id).await?;
            println!("job {job_id} resubmitted");
            Ok(())
        }
        Command::Watch { job_id } => {
            let mut initiator = initiator(&config)?;
            let interval = Duration::from_millis(config.executor.poll_interval_ms.max(100));
            watch(&mut initiator, &job_id, interval).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "burnrelay=debug" } else { "burnrelay=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn initiator(config: &RelayConfig) -> Result<Initiator<ConfiguredStore>> {
    let gateway = SecurityGateway::new(config.security.clone())?;
    Ok(Initiator::new(
        config.open_store()?,
        config.initiator.agent_id.clone(),
        SignalRelay::new(config.signals.ring_capacity),
        gateway,
    ))
}

async fn run_executor(config: &RelayConfig, once: bool) -> Result<()> {
    let gateway = SecurityGateway::new(config.security.clone())?;
    let mut executor = Executor::new(
        config.open_store()?,
        SimulatedDevice::default(),
        gateway,
        config.executor_config(),
    );

    if once {
        let outcome = executor.tick().await;
        info!(?outcome, "single tick finished");
        return Ok(());
    }

    let handle = executor.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the active job");
            handle.stop();
        }
    });
    executor.run().await;
    Ok(())
}

/// Follow one job through the outbound signals until it settles.
async fn watch<S: RemoteStore>(initiator: &mut Initiator<S>, job_id: &str, interval: Duration) -> Result<()> {
    // Fails fast on an unknown id.
    initiator.manifest(job_id).await?;
    let watch = ui::JobWatch::start(job_id);
    loop {
        for envelope in initiator.recent_signals().await? {
            if let Some(state) = watch.signal(&envelope) {
                watch.finish(state);
                return Ok(());
            }
        }

        let state = initiator.get_job_status(job_id).await?.state;
        // A failed job is only settled once it is archived; otherwise it is retried.
        let settled = match state {
            BurnState::Failed => initiator.completion(job_id).await?.is_some(),
            s => s.is_settled(),
        };
        if settled {
            watch.finish(state);
            return Ok(());
        }
        sleep(interval).await;
    }
}
