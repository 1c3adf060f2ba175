//! Configuração do jobpilot carregada a partir de `jobpilot.toml`.
//!
//! Todo campo tem um default, então um arquivo ausente ou parcial é válido.
//! Variáveis de ambiente (inclusive de um `.env`) têm precedência sobre o
//! arquivo para credenciais, URL do banco e diretório de estado.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "jobpilot.toml";

/// Configuração de nível superior carregada de `jobpilot.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    /// Modelo usado na análise e na geração.
    #[serde(default = "default_model")]
    pub model: String,

    /// URL Postgres do work store. Sem ela, apenas `demo` funciona.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Diretório do marcador de PID, do heartbeat e do log do worker.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Tabela `[worker]`.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Tabela `[supervisor]`.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// `[worker]`: parâmetros do dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Intervalo em segundos entre ciclos de polling.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Máximo de itens reivindicados por ciclo.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Tentativas antes de marcar um item como `failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Itens processados em paralelo dentro de um lote.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Timeout em segundos de cada chamada ao colaborador.
    #[serde(default = "default_ai_timeout_secs")]
    pub ai_timeout_secs: u64,

    /// Idade a partir da qual uma reivindicação `processing` é abandonada.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,

    /// Modo em que o supervisor lança o worker (logs JSON).
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Rejeita abaixo desta nota mesmo quando o colaborador recomenda seguir.
    #[serde(default)]
    pub min_match_score: Option<u8>,

    /// Reaproveita a análise guardada de uma tentativa cuja geração falhou.
    #[serde(default = "default_true")]
    pub reuse_cached_analysis: bool,
}

/// `[supervisor]`: controle do processo e limites de saúde.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Espera após SIGTERM antes de escalar para SIGKILL.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Quanto `start` espera antes de confirmar que o worker continua de pé.
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,

    /// Intervalo em segundos entre verificações do `monitor`.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Reinícios automáticos permitidos dentro da janela.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Janela deslizante, em segundos, do limite de reinícios.
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// Uso de CPU acima do qual o worker é considerado não saudável.
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,

    /// Memória residente, em MB, acima da qual o worker é não saudável.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// Idade do último poll a partir da qual o heartbeat é considerado velho.
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,
}

// Valor padrão para o modelo.
fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

// Valor padrão para o diretório de estado: `.jobpilot` no diretório atual.
fn default_state_dir() -> PathBuf {
    PathBuf::from(".jobpilot")
}

fn default_true() -> bool {
    true
}

// Valor padrão para o intervalo de polling: 5 minutos.
fn default_poll_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    5
}

// Valor padrão para tentativas máximas: 3.
fn default_max_attempts() -> u32 {
    3
}

fn default_concurrency() -> usize {
    2
}

fn default_ai_timeout_secs() -> u64 {
    60
}

// Valor padrão para o TTL da reivindicação: 15 minutos.
fn default_claim_ttl_secs() -> u64 {
    900
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_startup_probe_ms() -> u64 {
    2000
}

fn default_monitor_interval_secs() -> u64 {
    60
}

// Valor padrão: 3 reinícios a cada 10 minutos.
fn default_max_restarts() -> u32 {
    3
}

fn default_restart_window_secs() -> u64 {
    600
}

fn default_max_cpu_percent() -> f64 {
    95.0
}

fn default_max_memory_mb() -> u64 {
    1024
}

fn default_heartbeat_stale_secs() -> u64 {
    900
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            database_url: None,
            state_dir: default_state_dir(),
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            concurrency: default_concurrency(),
            ai_timeout_secs: default_ai_timeout_secs(),
            claim_ttl_secs: default_claim_ttl_secs(),
            headless: true,
            min_match_score: None,
            reuse_cached_analysis: true,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            startup_probe_ms: default_startup_probe_ms(),
            monitor_interval_secs: default_monitor_interval_secs(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
            max_cpu_percent: default_max_cpu_percent(),
            max_memory_mb: default_max_memory_mb(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
        }
    }
}

impl AppConfig {
    /// Carrega de `path`, ou de `JOBPILOT_CONFIG` / `jobpilot.toml` quando
    /// nenhum caminho é dado. O arquivo padrão ausente resulta nos defaults;
    /// um arquivo explícito ausente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var_os("JOBPILOT_CONFIG") {
                Some(p) => (PathBuf::from(p), true),
                None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
            },
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_toml(&contents).with_context(|| format!("parsing {}", path.display()))?
        } else if explicit {
            anyhow::bail!("config file {} does not exist", path.display());
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Sobrepõe os valores não vazios do ambiente.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(key) = var("ANTHROPIC_API_KEY") {
            self.api_key = key;
        }
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(dir) = var("JOBPILOT_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker.batch_size == 0 {
            anyhow::bail!("worker.batch_size must be at least 1");
        }
        if self.worker.max_attempts == 0 {
            anyhow::bail!("worker.max_attempts must be at least 1");
        }
        if self.worker.min_match_score.is_some_and(|s| s > 100) {
            anyhow::bail!("worker.min_match_score must be between 0 and 100");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.model, "claude-sonnet-4-5");
        assert_eq!(config.state_dir, PathBuf::from(".jobpilot"));
        assert!(config.api_key.is_empty());
        assert!(config.database_url.is_none());

        assert_eq!(config.worker.poll_interval_secs, 300);
        assert_eq!(config.worker.batch_size, 5);
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.ai_timeout_secs, 60);
        assert!(config.worker.headless);
        assert!(config.worker.min_match_score.is_none());

        assert_eq!(config.supervisor.grace_period_secs, 10);
        assert_eq!(config.supervisor.max_restarts, 3);
        assert_eq!(config.supervisor.restart_window_secs, 600);
    }

    #[test]
    fn deserialize_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            api_key = "sk-test-123"

            [worker]
            batch_size = 10
            min_match_score = 60

            [supervisor]
            max_restarts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.api_key, "sk-test-123");
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.worker.min_match_score, Some(60));
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.supervisor.grace_period_secs, 10);
        assert_eq!(config.model, "claude-sonnet-4-5");
    }

    #[test]
    fn environment_wins_over_file() {
        let mut config = AppConfig::from_toml(
            r#"
            api_key = "from-file"
            database_url = "postgres://file/db"
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "from-env"),
            ("DATABASE_URL", ""),
            ("JOBPILOT_STATE_DIR", "/var/lib/jobpilot"),
        ]
        .into_iter()
        .collect();

        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.api_key, "from-env");
        // Valores vazios não sobrescrevem o arquivo.
        assert_eq!(config.database_url.as_deref(), Some("postgres://file/db"));
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/jobpilot"));
    }

    #[test]
    fn rejects_nonsense_limits() {
        let config = AppConfig::from_toml("[worker]\nbatch_size = 0\n").unwrap();
        assert!(config.validate().is_err());
        let config = AppConfig::from_toml("[worker]\nmin_match_score = 101\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn loads_an_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("jobpilot.toml");
        std::fs::write(&path, "model = \"claude-haiku-4-5\"\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.model, "claude-haiku-4-5");
    }
}
