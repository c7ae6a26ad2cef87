//! Taksonomia błędów silnika detekcji.
//!
//! Błąd dostawcy klasyfikacji nie jest tu reprezentowany: ląduje w
//! `ApiDetectionResult::error` i daje wynik "nie wykryto" (fail-open).

/// Błąd pojedynczego skanu. Nie dotyka stanu współdzielonego
/// (OffenseRecord / SanctionRecord), bo ten jest zmieniany dopiero po `flagged=true`.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Obrazek nieosiągalny albo za duży.
    #[error("download failed: {0}")]
    Download(String),

    /// Nie da się zdekodować obrazka / policzyć hasha.
    #[error("perceptual hash computation failed: {0}")]
    HashComputation(String),

    /// Odczyt listy znanych hashy nie powiódł się.
    #[error("hash store error: {0}")]
    Store(#[source] anyhow::Error),

    /// Zadanie skanu spanikowało albo zostało przerwane.
    #[error("scan task aborted: {0}")]
    Aborted(String),
}

impl ScanError {
    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    pub fn hash(msg: impl Into<String>) -> Self {
        Self::HashComputation(msg.into())
    }

    /// Krótka etykieta do logów / metryk.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Download(_) => "download",
            Self::HashComputation(_) => "hash",
            Self::Store(_) => "store",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Błędy akcji moderatorskich na maszynie eskalacji.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("review item {0} not found")]
    ReviewNotFound(i64),

    #[error("review item {0} has no pending sanction attached")]
    SanctionMissing(i64),

    #[error("review item {0} is not a global ban review")]
    UnexpectedKind(i64),
}
