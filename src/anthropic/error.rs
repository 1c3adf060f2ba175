//! Tipo de erro do cliente da API Anthropic Messages.
//!
//! [`AnthropicError`] separa as falhas que o dispatcher retenta (rate limit,
//! timeout, 5xx, rede) das que apontam para uma requisição ou credencial
//! inválida.

use thiserror::Error;

/// Erros que podem ocorrer na comunicação com a API Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429. `retry_after_ms` vem do header `retry-after`.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Qualquer outro status não-2xx, com o corpo da resposta como mensagem.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// A requisição excedeu o timeout do cliente.
    #[error("request timed out")]
    Timeout,

    /// Resposta 2xx cujo corpo não é uma resposta da Messages API.
    #[error("invalid response body: {0}")]
    InvalidResponse(String),

    /// Falha de rede subjacente (DNS, conexão recusada, reset).
    #[error("network error: {0}")]
    NetworkError(reqwest::Error),
}

impl AnthropicError {
    /// Se uma tentativa posterior com a mesma requisição pode ter sucesso.
    pub fn is_transient(&self) -> bool {
        match self {
            AnthropicError::RateLimited { .. }
            | AnthropicError::Timeout
            | AnthropicError::NetworkError(_) => true,
            AnthropicError::ApiError { status, .. } => *status >= 500 || *status == 408,
            AnthropicError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for AnthropicError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnthropicError::Timeout
        } else if err.is_decode() {
            AnthropicError::InvalidResponse(err.to_string())
        } else {
            AnthropicError::NetworkError(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = AnthropicError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn api_error_display() {
        let err = AnthropicError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
    }

    #[test]
    fn transient_classification() {
        assert!(AnthropicError::Timeout.is_transient());
        assert!(AnthropicError::RateLimited { retry_after_ms: 1 }.is_transient());
        assert!(
            AnthropicError::ApiError {
                status: 529,
                message: "overloaded".into()
            }
            .is_transient()
        );
        assert!(
            !AnthropicError::ApiError {
                status: 400,
                message: "bad request".into()
            }
            .is_transient()
        );
        assert!(!AnthropicError::InvalidResponse("eof".into()).is_transient());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AnthropicError>();
    }
}
