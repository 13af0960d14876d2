//! Interface de terminal do burnrelay: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner do `watch` e `console` para estilizar
//! status, listas de pendentes e o histórico de auditoria.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::initiator::JobAuditEntry;
use crate::manifest::{BurnState, JobDescriptor, StatusSnapshot};
use crate::signal::{Envelope, SignalPayload};

fn state_style(state: BurnState) -> Style {
    match state {
        BurnState::Complete => Style::new().green().bold(),
        BurnState::Failed => Style::new().red().bold(),
        BurnState::Cancelled => Style::new().magenta(),
        s if s.is_active() => Style::new().cyan(),
        _ => Style::new().yellow(),
    }
}

/// Spinner que acompanha os sinais de um job no terminal.
pub struct JobWatch {
    pb: ProgressBar,
    job_id: String,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobWatch {
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        // Template fixo; se falhar, fica o estilo padrão do spinner.
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("watching {job_id}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            job_id: job_id.to_string(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza o spinner com um sinal recebido. Retorna o estado se o job assentou.
    pub fn signal(&self, envelope: &Envelope) -> Option<BurnState> {
        if envelope.payload.job_id() != Some(self.job_id.as_str()) {
            return None;
        }
        match &envelope.payload {
            SignalPayload::Status {
                state,
                progress,
                message,
                ..
            } => {
                let msg = message.as_deref().unwrap_or_default();
                self.pb.set_message(format!("{state} {progress:>3}% {msg}"));
                if *state == BurnState::Failed {
                    self.pb.println(format!("  {} {msg}", self.yellow.apply_to("↻")));
                }
                matches!(state, BurnState::Complete | BurnState::Cancelled).then_some(*state)
            }
            SignalPayload::Acknowledgement { of, .. } => {
                self.pb.println(format!("  {} executor acknowledged {of}", self.yellow.apply_to("•")));
                None
            }
            _ => None,
        }
    }

    /// Finaliza o spinner e exibe o resultado do job.
    pub fn finish(&self, state: BurnState) {
        self.pb.finish_and_clear();
        match state {
            BurnState::Complete => println!("  {} Job {} burned", self.green.apply_to("✓"), self.job_id),
            BurnState::Cancelled => println!("  {} Job {} cancelled", self.yellow.apply_to("■"), self.job_id),
            other => println!("  {} Job {} ended as {other}", self.red.apply_to("✗"), self.job_id),
        }
    }
}

pub fn print_status(snapshot: &StatusSnapshot) {
    let style = state_style(snapshot.state);
    println!("{}  {}", Style::new().bold().apply_to(&snapshot.job_id), style.apply_to(snapshot.state));
    println!("  progress: {}%", snapshot.progress);
    println!("  retries:  {}", snapshot.retry_count);
    if let Some(message) = &snapshot.message {
        println!("  message:  {message}");
    }
    println!("  updated:  {}", snapshot.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
}

pub fn print_pending(descriptors: &[JobDescriptor]) {
    if descriptors.is_empty() {
        println!("{}", Style::new().dim().apply_to("no pending jobs"));
        return;
    }
    for d in descriptors {
        let backoff = d
            .not_before
            .map(|t| format!("  (not before {})", t.format("%H:%M:%S")))
            .unwrap_or_default();
        println!(
            "{:<7} {}  {}  {} file(s), {} retries{backoff}",
            d.priority.to_string(),
            d.id,
            state_style(d.status).apply_to(d.status),
            d.files.len(),
            d.retry_count,
        );
    }
}

/// Imprime o histórico de auditoria, uma linha por entrada.
pub fn print_audit(entries: &[JobAuditEntry]) {
    let dim = Style::new().dim();
    println!("{}", Style::new().bold().apply_to("─── Audit Log ───"));
    for e in entries {
        let detail = e.entry.detail.as_deref().unwrap_or_default();
        println!(
            "{} {} {:<14} {} {}",
            dim.apply_to(e.entry.at.format("%Y-%m-%d %H:%M:%S")),
            e.job_id,
            e.entry.actor,
            e.entry.action,
            dim.apply_to(detail),
        );
    }
}
