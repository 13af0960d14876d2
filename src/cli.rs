//! Interface de linha de comando do burnrelay baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] para os dois lados do
//! relay (initiator: submit, cancel, status, pending, audit, resubmit, watch;
//! executor: executor) e flags globais (--config, --max-retries, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::manifest::Priority;

/// burnrelay: coordenação de jobs de gravação de disco através de um store remoto.
#[derive(Debug, Parser)]
#[command(name = "burnrelay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./burnrelay.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Intervalo de polling do executor, em milissegundos.
    #[arg(long, global = true)]
    pub poll_interval_ms: Option<u64>,

    /// Número máximo de retentativas em caso de falha.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Prioridade aceita pela CLI, mapeada para [`Priority`] internamente.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Urgent,
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Urgent => Priority::Urgent,
            PriorityArg::High => Priority::High,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::Low => Priority::Low,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submete um novo job de gravação.
    Submit {
        /// Arquivos a gravar.
        #[arg(required = true)]
        files: Vec<String>,

        #[arg(long, short, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,

        /// Rótulo do disco.
        #[arg(long)]
        label: Option<String>,

        /// Gravadores de destino (pode repetir).
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Pula a verificação após a gravação.
        #[arg(long, default_value_t = false)]
        no_verify: bool,
    },

    /// Cancela um job (direto se ainda pendente, senão pede ao executor).
    Cancel { job_id: String },

    /// Mostra o status atual de um job.
    Status { job_id: String },

    /// Lista os jobs pendentes na ordem em que o executor os considera.
    Pending,

    /// Mostra o histórico de auditoria de todos os jobs, mais recentes primeiro.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Reenvia um job falho ou cancelado com orçamento de retentativas zerado.
    Resubmit { job_id: String },

    /// Acompanha os sinais do executor até o job terminar.
    Watch { job_id: String },

    /// Roda o executor: faz polling do store e grava os jobs.
    Executor {
        /// Executa um único tick e sai.
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Executa a demonstração embutida com store em memória e gravador simulado.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_submit_subcommand() {
        let cli = Cli::parse_from([
            "burnrelay",
            "submit",
            "a.iso",
            "b.iso",
            "--priority",
            "urgent",
            "--label",
            "BACKUP",
            "--target",
            "drive-a",
        ]);
        match cli.command {
            Command::Submit {
                files,
                priority,
                label,
                targets,
                no_verify,
            } => {
                assert_eq!(files, vec!["a.iso", "b.iso"]);
                assert_eq!(Priority::from(priority), Priority::Urgent);
                assert_eq!(label.as_deref(), Some("BACKUP"));
                assert_eq!(targets, vec!["drive-a"]);
                assert!(!no_verify);
            }
            _ => panic!("expected Submit command"),
        }
    }

    #[test]
    fn submit_requires_files() {
        assert!(Cli::try_parse_from(["burnrelay", "submit"]).is_err());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "burnrelay",
            "--config",
            "relay.toml",
            "--max-retries",
            "5",
            "--poll-interval-ms",
            "250",
            "--verbose",
            "executor",
            "--once",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("relay.toml")));
        assert_eq!(cli.max_retries, Some(5));
        assert_eq!(cli.poll_interval_ms, Some(250));
        assert!(matches!(cli.command, Command::Executor { once: true }));
    }

    #[test]
    fn cli_parses_audit_default_limit() {
        let cli = Cli::parse_from(["burnrelay", "audit"]);
        assert!(matches!(cli.command, Command::Audit { limit: 20 }));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
