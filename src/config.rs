//! Configuração do burnrelay carregada a partir de `burnrelay.toml`.
//!
//! A struct [`RelayConfig`] contém todos os parâmetros configuráveis, agrupados
//! por seção (`[store]`, `[executor]`, `[initiator]`, `[security]`, `[signals]`).
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `BURNRELAY_STORE_TOKEN` e `BURNRELAY_AGENT_ID`
//! têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::manifest::RetryConfig;
use crate::scheduler::ExecutorConfig;
use crate::signal::SecurityPolicy;
use crate::store::{ConfiguredStore, FsStore, HttpStore, MemoryStore};

const DEFAULT_CONFIG_FILE: &str = "burnrelay.toml";

/// Configuração de nível superior carregada de `burnrelay.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub executor: ExecutorSection,

    #[serde(default)]
    pub initiator: InitiatorSection,

    #[serde(default)]
    pub security: SecurityPolicy,

    #[serde(default)]
    pub signals: SignalsSection,
}

/// Backend usado como meio de relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Http,
    #[default]
    Fs,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// URL base do store HTTP.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Namespace lógico dos objetos de job.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Diretório raiz do backend `fs` (pasta sincronizada).
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Token bearer do store HTTP.
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// Identidade com que o executor assina os sinais que emite.
    #[serde(default = "default_executor_id")]
    pub agent_id: String,

    /// Intervalo entre ticks de polling, em milissegundos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Espera entre fatias de gravação, em milissegundos.
    #[serde(default = "default_phase_delay_ms")]
    pub phase_delay_ms: u64,

    /// Número de fatias em que a gravação é dividida.
    #[serde(default = "default_burn_steps")]
    pub burn_steps: u32,

    /// Máximo de retentativas antes de arquivar um job como falho.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiatorSection {
    #[serde(default = "default_initiator_id")]
    pub agent_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalsSection {
    /// Quantos envelopes cada ring buffer guarda.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_namespace() -> String {
    "burnrelay".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("relay")
}

fn default_executor_id() -> String {
    "burn-executor".to_string()
}

fn default_initiator_id() -> String {
    "initiator".to_string()
}

// Valor padrão para o intervalo de polling: 5s.
fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_phase_delay_ms() -> u64 {
    1000
}

fn default_burn_steps() -> u32 {
    4
}

// Valor padrão para retentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_ring_capacity() -> usize {
    50
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            base_url: default_base_url(),
            namespace: default_namespace(),
            root: default_root(),
            token: String::new(),
        }
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            agent_id: default_executor_id(),
            poll_interval_ms: default_poll_interval_ms(),
            phase_delay_ms: default_phase_delay_ms(),
            burn_steps: default_burn_steps(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for InitiatorSection {
    fn default() -> Self {
        Self {
            agent_id: default_initiator_id(),
        }
    }
}

impl Default for SignalsSection {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
        }
    }
}

impl RelayConfig {
    /// Carrega a configuração de `path`, ou de `burnrelay.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read '{}'", path.display()))?;
            toml::from_str::<RelayConfig>(&contents)
                .with_context(|| format!("failed to parse '{}'", path.display()))?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
        if let Ok(token) = std::env::var("BURNRELAY_STORE_TOKEN")
            && !token.is_empty()
        {
            config.store.token = token;
        }
        if let Ok(id) = std::env::var("BURNRELAY_AGENT_ID")
            && !id.is_empty()
        {
            config.executor.agent_id = id;
        }

        Ok(config)
    }

    /// Parâmetros do executor derivados das seções `[executor]` e `[signals]`.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            agent_id: self.executor.agent_id.clone(),
            poll_interval: Duration::from_millis(self.executor.poll_interval_ms),
            phase_delay: Duration::from_millis(self.executor.phase_delay_ms),
            burn_steps: self.executor.burn_steps.max(1),
            retry: RetryConfig {
                max_retries: self.executor.max_retries,
                base_delay_ms: self.executor.base_delay_ms,
            },
            ring_capacity: self.signals.ring_capacity,
        }
    }

    /// Abre o backend de store configurado.
    pub fn open_store(&self) -> Result<ConfiguredStore> {
        let store = match self.store.backend {
            StoreBackend::Http => {
                let token = Some(self.store.token.clone());
                ConfiguredStore::Http(
                    HttpStore::new(&self.store.base_url, &self.store.namespace, token)
                        .context("failed to build HTTP store client")?,
                )
            }
            StoreBackend::Fs => ConfiguredStore::Fs(FsStore::new(&self.store.root)),
            StoreBackend::Memory => ConfiguredStore::Memory(MemoryStore::new()),
        };
        Ok(store)
    }
}
