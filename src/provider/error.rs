//! Tipos de erro para a comunicação com provedores de geração.
//!
//! Define [`ProviderError`] com variantes para rejeição definitiva (4xx),
//! indisponibilidade transitória (5xx, 429, timeout), respostas que não são
//! JSON e falhas de rede. Usa `thiserror` para derivar `Display` e `Error`.

use thiserror::Error;

/// Erros que podem ocorrer ao falar com um provedor.
///
/// - [`Rejected`](ProviderError::Rejected): o provedor recusou o pedido (4xx); não adianta retentar
/// - [`Unavailable`](ProviderError::Unavailable): 5xx, 408 ou 429; retentável
/// - [`NonJson`](ProviderError::NonJson): página HTML de erro de CDN ou gateway
/// - [`Malformed`](ProviderError::Malformed): JSON válido mas sem os campos esperados
/// - [`Network`](ProviderError::Network): falha na camada de rede
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Pedido recusado pelo provedor (parâmetros inválidos, autenticação, política).
    #[error("request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Provedor indisponível no momento. `status` é 0 quando não houve resposta HTTP.
    #[error("provider unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// O corpo da resposta não é JSON.
    #[error("non-JSON response (content-type: {content_type})")]
    NonJson { content_type: String },

    /// O JSON não tem a forma esperada (sem id de job, sem status...).
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ProviderError {
    /// Indica se a falha é transitória.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Rejected { .. })
    }
}
