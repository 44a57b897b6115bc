use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StockCodeError {
    #[error("stock code is empty")]
    Empty,
    #[error("stock code '{0}' must be 4 to 6 digits")]
    InvalidFormat(String),
}
