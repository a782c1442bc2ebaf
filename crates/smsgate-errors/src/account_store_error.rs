use crate::error::ApiError;
use std::error::Error as StdError;
use thiserror::Error;

/// Errors for the AccountStore
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AccountStoreError {
    #[error("account {0} was not found")]
    AccountNotFound(String),
    #[error("account with username {0} already exists")]
    DuplicateUsername(String),
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + 'static>),
}

impl From<AccountStoreError> for ApiError {
    fn from(src: AccountStoreError) -> Self {
        match src {
            AccountStoreError::AccountNotFound(_) => ApiError::account_not_found(),
            AccountStoreError::DuplicateUsername(username) => {
                ApiError::conflict(format!("username {} already exists", username))
            }
            _ => ApiError::internal_server_error().detail(src.to_string()),
        }
    }
}

impl From<AccountStoreError> for warp::Rejection {
    fn from(src: AccountStoreError) -> Self {
        ApiError::from(src).into()
    }
}

#[cfg(feature = "sqlx_errors")]
impl From<sqlx::Error> for AccountStoreError {
    fn from(src: sqlx::Error) -> AccountStoreError {
        AccountStoreError::Other(Box::new(src))
    }
}
