use shared::error::StockCodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    InvalidStockCode(#[from] StockCodeError),
    #[error("no stock selected; validate a stock code first")]
    NoStockSelected,
    #[error("an analysis for {0} is already running")]
    AnalysisInProgress(String),
    #[error("analysis source rejected request: {0}")]
    Source(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("backend origin must start with http:// or https://, got '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid backend origin '{origin}': {source}")]
    InvalidOrigin {
        origin: String,
        source: url::ParseError,
    },
}
