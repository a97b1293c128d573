//! Configuração do genrelay carregada a partir de `genrelay.toml`.
//!
//! A struct [`RelayConfig`] agrupa os parâmetros de cada componente em seções
//! (`[provider]`, `[rate_limit]`, `[discount]`, `[poll]`, `[submit]`,
//! `[pricing.<capacidade>]`, `[lexicon]`). Valores ausentes no arquivo usam
//! defaults sensíveis. A variável de ambiente `GENRELAY_API_KEY` tem precedência
//! sobre a chave do arquivo.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::discount::DiscountCacheConfig;
use crate::error::RelayError;
use crate::poller::PollConfig;
use crate::pricing::{Capability, PriceTable, Pricing};
use crate::provider::StatusLexicon;
use crate::rate_limit::RateLimitConfig;
use crate::submitter::SubmitConfig;

/// Arquivo lido por [`RelayConfig::load`].
pub const CONFIG_FILE: &str = "genrelay.toml";

/// Variável de ambiente com a chave do provedor.
pub const API_KEY_ENV: &str = "GENRELAY_API_KEY";

/// Configuração de nível superior carregada de `genrelay.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub provider: ProviderSection,

    #[serde(default)]
    pub rate_limit: RateLimitSection,

    #[serde(default)]
    pub discount: DiscountSection,

    #[serde(default)]
    pub poll: PollSection,

    #[serde(default)]
    pub submit: SubmitSection,

    /// Preços que substituem a tabela padrão, por capacidade.
    #[serde(default)]
    pub pricing: HashMap<Capability, Pricing>,

    /// Vocabulário de status do provedor.
    #[serde(default)]
    pub lexicon: StatusLexicon,
}

/// Conexão com o provedor de geração.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    /// Chave da API do provedor.
    #[serde(default)]
    pub api_key: String,

    /// URL base da fila do provedor (ou de um proxy do backend).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout de cada requisição HTTP, em segundos.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// Valor padrão para a URL base: fila pública da fal.
fn default_base_url() -> String {
    "https://queue.fal.run".to_string()
}

// Valor padrão para o timeout de requisição: 30s.
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Janela deslizante de requisições por ator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub window_secs: u64,
    pub max_requests: usize,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests: 100,
        }
    }
}

/// Cache de descontos.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscountSection {
    pub ttl_secs: u64,
    /// TTL de consultas que falharam (mais curto que `ttl_secs`).
    pub error_ttl_secs: u64,
    pub max_entries: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    /// Intervalo da varredura de entradas expiradas.
    pub sweep_interval_secs: u64,
}

impl Default for DiscountSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            error_ttl_secs: 30,
            max_entries: 10_000,
            max_retries: 3,
            retry_base_ms: 500,
            sweep_interval_secs: 60,
        }
    }
}

/// Parâmetros do polling adaptativo. Tempos em milissegundos.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollSection {
    pub initial_delay_ms: u64,
    pub base_interval_ms: u64,
    pub queued_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    pub jitter_max_ms: u64,
    pub max_transport_errors: u32,
    pub artifact_retry_delay_ms: u64,
    pub artifact_retry_cap: u32,
    /// Orçamento total em segundos; sem valor, usa o padrão da capacidade.
    pub budget_secs: Option<u64>,
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 10_000,
            base_interval_ms: 4_000,
            queued_interval_ms: 5_000,
            backoff_base_ms: 2_000,
            backoff_multiplier: 1.5,
            backoff_max_ms: 30_000,
            jitter_max_ms: 2_000,
            max_transport_errors: 5,
            artifact_retry_delay_ms: 2_500,
            artifact_retry_cap: 5,
            budget_secs: None,
        }
    }
}

/// Submissão de jobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmitSection {
    pub timeout_secs: u64,
}

impl Default for SubmitSection {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl RateLimitSection {
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(self.window_secs),
            max_requests: self.max_requests,
        }
    }
}

impl DiscountSection {
    pub fn to_config(&self) -> DiscountCacheConfig {
        DiscountCacheConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            error_ttl: Duration::from_secs(self.error_ttl_secs),
            max_entries: self.max_entries,
            max_retries: self.max_retries,
            retry_base: Duration::from_millis(self.retry_base_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl PollSection {
    pub fn to_config(&self) -> PollConfig {
        PollConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            base_interval: Duration::from_millis(self.base_interval_ms),
            queued_interval: Duration::from_millis(self.queued_interval_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_multiplier: self.backoff_multiplier,
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            jitter_max: Duration::from_millis(self.jitter_max_ms),
            max_transport_errors: self.max_transport_errors,
            artifact_retry_delay: Duration::from_millis(self.artifact_retry_delay_ms),
            artifact_retry_cap: self.artifact_retry_cap,
            budget: self.budget_secs.map(Duration::from_secs),
        }
    }
}

impl SubmitSection {
    pub fn to_config(&self) -> SubmitConfig {
        SubmitConfig {
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl RelayConfig {
    /// Carrega a configuração de `genrelay.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, RelayError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho específico (flag `--config`).
    pub fn load_from(path: &Path) -> Result<Self, RelayError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<RelayConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        let config = config.with_api_key_override(std::env::var(API_KEY_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Substitui a chave do arquivo por `key`, se não estiver vazia.
    pub fn with_api_key_override(mut self, key: Option<String>) -> Self {
        if let Some(key) = key
            && !key.is_empty()
        {
            self.provider.api_key = key;
        }
        self
    }

    /// Rejeita combinações que travariam ou desativariam componentes.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.rate_limit.max_requests == 0 {
            return Err(RelayError::Config(
                "rate_limit.max_requests must be at least 1".into(),
            ));
        }
        if self.poll.backoff_multiplier < 1.0 {
            return Err(RelayError::Config(
                "poll.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.poll.base_interval_ms == 0 {
            return Err(RelayError::Config(
                "poll.base_interval_ms must be positive".into(),
            ));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(RelayError::Config("provider.base_url is empty".into()));
        }
        Ok(())
    }

    /// Tabela de preços padrão com as substituições de `[pricing]`.
    pub fn price_table(&self) -> PriceTable {
        PriceTable::with_overrides(&self.pricing)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = RelayConfig::default();
        assert!(config.provider.api_key.is_empty());
        assert_eq!(config.provider.base_url, "https://queue.fal.run");
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.poll.to_config().base_interval, Duration::from_secs(4));
        assert_eq!(config.submit.to_config().timeout, Duration::from_secs(30));
        assert!(config.pricing.is_empty());
    }

    #[test]
    fn section_defaults_match_components() {
        let config = RelayConfig::default();
        let poll = config.poll.to_config();
        let expected = PollConfig::default();
        assert_eq!(poll.initial_delay, expected.initial_delay);
        assert_eq!(poll.backoff_max, expected.backoff_max);
        assert_eq!(poll.artifact_retry_delay, expected.artifact_retry_delay);
        assert_eq!(poll.max_transport_errors, expected.max_transport_errors);

        let discount = config.discount.to_config();
        let expected = DiscountCacheConfig::default();
        assert_eq!(discount.ttl, expected.ttl);
        assert_eq!(discount.error_ttl, expected.error_ttl);
        assert_eq!(discount.retry_base, expected.retry_base);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            [provider]
            api_key = "fal-test-123"

            [poll]
            initial_delay_ms = 500
            budget_secs = 120

            [pricing.video]
            kind = "per_second"
            credits_per_second = "0.8"
            duration_param = "duration"
            default_seconds = "8"
            minimum = "4"

            [pricing.image]
            kind = "flat"
            credits = "2"

            [lexicon]
            success = ["DONE"]
        "#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.provider.api_key, "fal-test-123");
        assert_eq!(config.provider.base_url, "https://queue.fal.run");

        let poll = config.poll.to_config();
        assert_eq!(poll.initial_delay, Duration::from_millis(500));
        assert_eq!(poll.base_interval, Duration::from_secs(4));
        assert_eq!(poll.budget, Some(Duration::from_secs(120)));

        let prices = config.price_table();
        assert_eq!(prices.resolve(Capability::Image, &json!({})).unwrap(), dec!(2));
        assert_eq!(
            prices.resolve(Capability::Video, &json!({"duration": "10s"})).unwrap(),
            dec!(8)
        );
        assert_eq!(prices.resolve(Capability::Model3d, &json!({})).unwrap(), dec!(5));
        assert_eq!(config.lexicon.success, vec!["DONE".to_string()]);
    }

    #[test]
    fn env_key_overrides_file_key() {
        let config = RelayConfig::default();
        let config = config.with_api_key_override(Some("from-env".into()));
        assert_eq!(config.provider.api_key, "from-env");

        let config = config.with_api_key_override(Some(String::new()));
        assert_eq!(config.provider.api_key, "from-env");
        let config = config.with_api_key_override(None);
        assert_eq!(config.provider.api_key, "from-env");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rate_limit]\nmax_requests = 3\n\n[submit]\ntimeout_secs = 5").unwrap();

        let config = RelayConfig::load_from(file.path()).unwrap();
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.submit.to_config().timeout, Duration::from_secs(5));
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.rate_limit.max_requests, 100);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[poll]\nbackoff_multiplier = 0.5").unwrap();
        let err = RelayConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rate_limit\nmax_requests = 1").unwrap();
        let err = RelayConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, RelayError::Toml(_)));
    }
}
