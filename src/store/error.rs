//! Tipos de erro para os backends do store remoto.
//!
//! Define [`StoreError`] com variantes para indisponibilidade, respostas HTTP
//! inesperadas e falhas de rede ou disco. [`StoreError::is_transient`] separa
//! o que vale tentar de novo do que nunca vai dar certo.

use thiserror::Error;

/// Erros que podem ocorrer ao falar com o store remoto.
#[derive(Debug, Error)]
pub enum StoreError {
    /// O store não respondeu ou pediu para tentar mais tarde (HTTP 429/5xx).
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// Qualquer outra resposta HTTP fora da faixa 2xx.
    #[error("store returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Caminho de objeto absoluto ou com `..`.
    #[error("invalid object path '{0}'")]
    InvalidPath(String),

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    /// Falha de disco no backend de diretório compartilhado.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Verdadeiro quando repetir a mesma operação pode funcionar.
    ///
    /// Caminhos inválidos e respostas 4xx são permanentes.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Http(_) | StoreError::Io(_) => true,
            StoreError::Status { status, .. } => !(400..500).contains(status),
            StoreError::InvalidPath(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_display() {
        let err = StoreError::Unavailable("status 503".into());
        assert_eq!(err.to_string(), "store unreachable: status 503");
    }

    #[test]
    fn status_display() {
        let err = StoreError::Status {
            status: 403,
            message: "forbidden".into(),
        };
        assert_eq!(err.to_string(), "store returned status 403: forbidden");
    }

    #[test]
    fn bad_paths_and_client_errors_are_permanent() {
        assert!(StoreError::Unavailable("reset".into()).is_transient());
        assert!(!StoreError::InvalidPath("..".into()).is_transient());
        for (status, transient) in [(400, false), (403, false), (404, false), (501, true)] {
            let err = StoreError::Status {
                status,
                message: String::new(),
            };
            assert_eq!(err.is_transient(), transient, "status {status}");
        }
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StoreError>();
    }
}
