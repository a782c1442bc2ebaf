use crate::error::ApiError;
use std::error::Error as StdError;
use thiserror::Error;
use uuid::Uuid;

/// Errors for the durable MessageStore
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MessageStoreError {
    #[error("message {0} was not found")]
    MessageNotFound(Uuid),
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + 'static>),
}

impl From<MessageStoreError> for ApiError {
    fn from(src: MessageStoreError) -> Self {
        match src {
            MessageStoreError::MessageNotFound(_) => ApiError::message_not_found(),
            _ => ApiError::internal_server_error().detail(src.to_string()),
        }
    }
}

impl From<MessageStoreError> for warp::Rejection {
    fn from(src: MessageStoreError) -> Self {
        ApiError::from(src).into()
    }
}

#[cfg(feature = "sqlx_errors")]
impl From<sqlx::Error> for MessageStoreError {
    fn from(src: sqlx::Error) -> MessageStoreError {
        MessageStoreError::Other(Box::new(src))
    }
}
