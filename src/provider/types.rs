//! Tipos de dados trocados com provedores de geração.
//!
//! Os provedores não têm um esquema estável: o id do job pode vir como
//! `job_id`, `request_id` ou `id`, e o status como `status` ou `state`.
//! Estas structs normalizam as respostas em [`JobHandle`] e [`StatusReport`],
//! e o [`StatusLexicon`] traduz o vocabulário de cada provedor em [`ProviderStatus`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ProviderError;
use crate::pricing::Capability;

/// Pedido de geração enviado ao provedor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Capacidade cobrada por este pedido.
    pub capability: Capability,
    /// Caminho do modelo no provedor (ex.: "fal-ai/veo3").
    pub endpoint: String,
    /// Parâmetros repassados sem alteração ao provedor.
    pub params: Value,
}

/// Identificador do job devolvido pelo provedor, junto com o endpoint
/// necessário para consultar o status depois.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub endpoint: String,
    pub job_id: String,
}

// Campos onde os provedores colocam o id do job.
const JOB_ID_FIELDS: &[&str] = &["job_id", "request_id", "requestId", "id", "task_id"];

impl JobHandle {
    /// Extrai o id do job da resposta de submissão, aceitando um nível de `data`.
    pub fn from_submit_response(endpoint: &str, body: &Value) -> Result<Self, ProviderError> {
        check_envelope(body)?;
        let job_id = find_job_id(body)
            .or_else(|| body.get("data").and_then(find_job_id))
            .ok_or_else(|| ProviderError::Malformed("submit response has no job id".into()))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            job_id,
        })
    }
}

fn find_job_id(value: &Value) -> Option<String> {
    let map = value.as_object()?;
    JOB_ID_FIELDS.iter().find_map(|field| match map.get(*field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

// Respostas do proxy no formato `{ "success": false, "error": "..." }`.
fn check_envelope(body: &Value) -> Result<(), ProviderError> {
    if body.get("success") == Some(&Value::Bool(false)) {
        let message = error_message(body).unwrap_or_else(|| "upstream reported failure".into());
        return Err(ProviderError::Unavailable { status: 0, message });
    }
    Ok(())
}

fn error_message(body: &Value) -> Option<String> {
    ["error", "message", "detail"].iter().find_map(|field| {
        match body.get(*field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    })
}

// Campos de controle removidos antes de repassar o resultado ao decodificador.
const CONTROL_FIELDS: &[&str] = &[
    "status",
    "state",
    "error",
    "message",
    "detail",
    "logs",
    "queue_position",
    "success",
];

/// Resposta normalizada de uma consulta de status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Status bruto como o provedor o escreveu (ex.: "IN_QUEUE").
    pub status: String,
    /// O restante do corpo, quando houver algo além dos campos de controle.
    pub result: Option<Value>,
    /// Mensagem de erro do provedor, se houver.
    pub error: Option<String>,
}

impl StatusReport {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            result: None,
            error: None,
        }
    }

    pub fn queued() -> Self {
        Self::new("IN_QUEUE")
    }

    pub fn in_progress() -> Self {
        Self::new("IN_PROGRESS")
    }

    pub fn completed(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new("COMPLETED")
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new("FAILED")
        }
    }

    /// Normaliza o corpo JSON de uma consulta de status.
    pub fn from_value(body: &Value) -> Result<Self, ProviderError> {
        check_envelope(body)?;
        let map = body
            .as_object()
            .ok_or_else(|| ProviderError::Malformed("status response is not an object".into()))?;

        let status = ["status", "state"]
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .ok_or_else(|| ProviderError::Malformed("status response has no status".into()))?
            .to_string();

        let rest: Map<String, Value> = map
            .iter()
            .filter(|(k, _)| !CONTROL_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            status,
            result: if rest.is_empty() { None } else { Some(Value::Object(rest)) },
            error: error_message(body),
        })
    }
}

/// Classificação de um status bruto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
}

/// Vocabulário de status dos provedores, comparado sem diferenciar maiúsculas.
///
/// Qualquer status fora das três listas conta como "em andamento".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusLexicon {
    #[serde(default = "default_success")]
    pub success: Vec<String>,
    #[serde(default = "default_failure")]
    pub failure: Vec<String>,
    #[serde(default = "default_queued")]
    pub queued: Vec<String>,
}

fn default_success() -> Vec<String> {
    to_strings(&["COMPLETED", "OK", "SUCCESS", "SUCCEEDED"])
}

fn default_failure() -> Vec<String> {
    to_strings(&["FAILED", "ERROR", "CANCELLED", "CANCELED"])
}

fn default_queued() -> Vec<String> {
    to_strings(&["IN_QUEUE", "QUEUED", "PENDING", "STARTING"])
}

fn to_strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for StatusLexicon {
    fn default() -> Self {
        Self {
            success: default_success(),
            failure: default_failure(),
            queued: default_queued(),
        }
    }
}

impl StatusLexicon {
    pub fn classify(&self, raw: &str) -> ProviderStatus {
        let raw = raw.trim();
        let hit = |words: &[String]| words.iter().any(|w| w.eq_ignore_ascii_case(raw));
        if hit(self.success.as_slice()) {
            ProviderStatus::Succeeded
        } else if hit(self.failure.as_slice()) {
            ProviderStatus::Failed
        } else if hit(self.queued.as_slice()) {
            ProviderStatus::Queued
        } else {
            ProviderStatus::InProgress
        }
    }
}
