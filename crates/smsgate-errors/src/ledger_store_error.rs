use crate::error::ApiError;
use std::error::Error as StdError;
use thiserror::Error;

/// Errors for the durable credit ledger store
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LedgerStoreError {
    #[error("account {0} was not found")]
    AccountNotFound(String),
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + 'static>),
}

impl From<LedgerStoreError> for ApiError {
    fn from(src: LedgerStoreError) -> Self {
        match src {
            LedgerStoreError::AccountNotFound(_) => ApiError::account_not_found(),
            _ => ApiError::internal_server_error().detail(src.to_string()),
        }
    }
}

impl From<LedgerStoreError> for warp::Rejection {
    fn from(src: LedgerStoreError) -> Self {
        ApiError::from(src).into()
    }
}

#[cfg(feature = "sqlx_errors")]
impl From<sqlx::Error> for LedgerStoreError {
    fn from(src: sqlx::Error) -> LedgerStoreError {
        match src {
            sqlx::Error::RowNotFound => {
                LedgerStoreError::AccountNotFound("unknown".to_owned())
            }
            other => LedgerStoreError::Other(Box::new(other)),
        }
    }
}
