//! Built-in walkthrough: an in-memory store, a simulated burner that fails
//! once, and a handful of jobs at different priorities.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::Style;
use tokio::time::sleep;

use crate::device::{DevicePhase, SimulatedDevice};
use crate::initiator::Initiator;
use crate::manifest::{FileRef, Priority, RetryConfig};
use crate::scheduler::{Executor, ExecutorConfig, TickOutcome};
use crate::signal::{SecurityGateway, SecurityPolicy, SignalPayload, SignalRelay};
use crate::store::MemoryStore;
use crate::ui;

pub async fn run() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let policy = SecurityPolicy::default();
    let mut initiator = Initiator::new(
        Arc::clone(&store),
        "initiator",
        SignalRelay::default(),
        SecurityGateway::new(policy.clone())?,
    );
    let config = ExecutorConfig {
        poll_interval: Duration::from_millis(50),
        phase_delay: Duration::from_millis(150),
        retry: RetryConfig {
            max_retries: 3,
            base_delay_ms: 200,
        },
        ..Default::default()
    };
    let mut executor = Executor::new(
        Arc::clone(&store),
        SimulatedDevice::failing(1, DevicePhase::Burn).with_step_delay(Duration::from_millis(50)),
        SecurityGateway::new(policy)?,
        config.clone(),
    );

    let bold = Style::new().bold();
    println!("{}", bold.apply_to("Submitting jobs"));
    let jobs = [
        ("holiday-photos.zip", Priority::Low),
        ("contracts-2026.pdf", Priority::Urgent),
        ("music-library.tar", Priority::Normal),
        ("scratch.iso", Priority::High),
    ];
    let mut ids = Vec::new();
    for (file, priority) in jobs {
        let id = initiator.submit_job(vec![FileRef::new(file)], priority).await?;
        println!("  {:<7} {file:<20} {id}", priority.to_string());
        ids.push(id);
    }

    // The scratch disc is dropped before the executor ever sees it.
    initiator.cancel_job(&ids[3]).await?;
    println!("  cancelled {}", ids[3]);

    println!("{}", bold.apply_to("Running executor"));
    loop {
        match executor.tick().await {
            TickOutcome::Processed { job_id, state } => {
                println!("  {job_id} -> {state}");
            }
            TickOutcome::Skipped(reason) => println!("  tick skipped: {reason}"),
            TickOutcome::Idle => {
                if initiator.list_pending().await?.is_empty() {
                    break;
                }
            }
        }
        for envelope in initiator.recent_signals().await? {
            if let SignalPayload::Status {
                job_id,
                state,
                progress,
                ..
            } = &envelope.payload
            {
                tracing::debug!(job_id = %job_id, state = %state, progress, "signal");
            }
        }
        sleep(config.poll_interval).await;
    }

    println!("{}", bold.apply_to("Final status"));
    for id in &ids {
        ui::print_status(&initiator.get_job_status(id).await?);
    }
    println!();
    ui::print_audit(&initiator.get_audit_log(15).await?);
    Ok(())
}
