/// APIs should use the `ApiErrorType`s defined in `error_types` so that the
/// problem documents stay stable across the HTTP surface.
mod error_types;
pub use error_types::*;

use chrono::Utc;
use http::header::HeaderValue;
use serde::{ser::Serializer, Serialize};
use serde_json::{Map, Value};
use std::{
    error::Error as StdError,
    fmt::{self, Display},
};
use warp::{reject::Reject, reply::json, reply::Response, Rejection, Reply};

/// API error type prefix of problems.
const ERROR_TYPE_PREFIX: &str = "https://errors.smsgate.dev/http-api";

/// This struct represents the fields defined in [RFC7807](https://tools.ietf.org/html/rfc7807).
/// ApiError implements Reply so that it can be used for responses directly.
#[derive(Clone, Debug, Serialize)]
pub struct ApiError {
    /// `type` is a URI which represents an error type.
    #[serde(serialize_with = "serialize_type")]
    pub r#type: &'static ProblemType,
    /// `title` is a short, human-readable summary of the type. It SHOULD NOT
    /// change from occurrence to occurrence of the problem.
    pub title: &'static str,
    /// HTTP status of the problem.
    #[serde(serialize_with = "serialize_status_code")]
    pub status: http::StatusCode,
    /// `detail` explains the problem in human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Extension members are flatly injected into the response JSON.
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub extension_members: Option<Map<String, Value>>,
}

/// Distinguishes between RFC7807 pre-defined and gateway-specific error types
#[derive(Clone, Copy, Debug)]
pub enum ProblemType {
    /// Serialized as `about:blank`.
    Default,
    /// Gateway-specific type, serialized as
    /// `https://errors.smsgate.dev/http-api/<path>`.
    SmsGatewayApi(&'static str),
}

/// Error type used as a basis for creating Warp-compatible errors
#[derive(Clone, Copy, Debug)]
pub struct ApiErrorType {
    pub r#type: &'static ProblemType,
    pub title: &'static str,
    pub status: http::StatusCode,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_status_code<S>(status: &http::StatusCode, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u16(status.as_u16())
}

fn serialize_type<S>(r#type: &ProblemType, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match r#type {
        ProblemType::Default => s.serialize_str("about:blank"),
        ProblemType::SmsGatewayApi(custom_type) => {
            s.serialize_str(&format!("{}/{}", ERROR_TYPE_PREFIX, custom_type))
        }
    }
}

impl ApiError {
    pub fn from_api_error_type(problem_type: &ApiErrorType) -> Self {
        ApiError {
            r#type: problem_type.r#type,
            title: problem_type.title,
            status: problem_type.status,
            detail: None,
            extension_members: Some(ApiError::base_extension_members()),
        }
    }

    pub fn bad_request() -> Self {
        ApiError::from_api_error_type(&DEFAULT_BAD_REQUEST_TYPE)
    }

    pub fn internal_server_error() -> Self {
        ApiError::from_api_error_type(&DEFAULT_INTERNAL_SERVER_ERROR_TYPE)
    }

    pub fn unauthorized() -> Self {
        ApiError::from_api_error_type(&DEFAULT_UNAUTHORIZED_TYPE)
    }

    pub fn not_found() -> Self {
        ApiError::from_api_error_type(&DEFAULT_NOT_FOUND_TYPE)
    }

    pub fn method_not_allowed() -> Self {
        ApiError::from_api_error_type(&DEFAULT_METHOD_NOT_ALLOWED_TYPE)
    }

    /// Request validation failure (400, `invalid_input`).
    pub fn invalid_input<T>(detail: T) -> Self
    where
        T: Into<String>,
    {
        ApiError::from_api_error_type(&INVALID_INPUT_TYPE).detail(detail)
    }

    /// Replayed client request id within the idempotency window (409).
    pub fn duplicate_request() -> Self {
        ApiError::from_api_error_type(&DUPLICATE_REQUEST_TYPE)
            .detail("Request with this X-Request-ID was already accepted")
    }

    /// Reservation failed because the working balance cannot cover the cost
    /// (400, `insufficient_balance`).
    pub fn insufficient_balance() -> Self {
        ApiError::from_api_error_type(&INSUFFICIENT_BALANCE_TYPE)
            .detail("Insufficient balance to cover the message cost")
    }

    /// Operation conflicts with the resource's current state, e.g. cancelling
    /// a submission that is already terminal (400, `conflict`).
    pub fn conflict<T>(detail: T) -> Self
    where
        T: Into<String>,
    {
        ApiError::from_api_error_type(&CONFLICT_TYPE).detail(detail)
    }

    /// Sliding-window rate limit exceeded (429).
    pub fn rate_limited(limit: u32) -> Self {
        ApiError::from_api_error_type(&RATE_LIMITED_TYPE).detail(format!(
            "Rate limit exceeded. Maximum {} requests per minute.",
            limit
        ))
    }

    /// A downstream dependency is unavailable (503).
    pub fn unavailable<T>(detail: T) -> Self
    where
        T: Into<String>,
    {
        ApiError::from_api_error_type(&UNAVAILABLE_TYPE).detail(detail)
    }

    pub fn account_not_found() -> Self {
        ApiError::from_api_error_type(&ACCOUNT_NOT_FOUND_TYPE)
            .detail("Account was not found.".to_owned())
    }

    pub fn message_not_found() -> Self {
        ApiError::from_api_error_type(&MESSAGE_NOT_FOUND_TYPE)
            .detail("Message was not found.".to_owned())
    }

    /// Sets the [`detail`](./struct.ApiError.html#structfield.detail) field
    pub fn detail<T>(mut self, detail: T) -> Self
    where
        T: Into<String>,
    {
        self.detail = Some(detail.into());
        self
    }

    /// Sets the [`extension_members`](./struct.ApiError.html#structfield.extension_members) field
    pub fn extension_members(mut self, extension_members: Map<String, Value>) -> Self {
        self.extension_members = Some(extension_members);
        self
    }

    fn base_extension_members() -> Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("datetime".to_owned(), Value::from(Utc::now().to_rfc3339()));
        map
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("{:?}", self))
    }
}

impl Reply for ApiError {
    fn into_response(self) -> Response {
        let res = json(&self);
        let mut res = res.into_response();
        *res.status_mut() = self.status;
        res.headers_mut().insert(
            "Content-Type",
            HeaderValue::from_static("application/problem+json"),
        );
        res
    }
}

impl StdError for ApiError {}

impl Reject for ApiError {}

/// Receives rejections raised anywhere in the filter chain and renders them
/// in the RFC7807 format.
pub async fn default_rejection_handler(err: warp::Rejection) -> Result<impl Reply, Rejection> {
    if let Some(api_error) = err.find::<ApiError>() {
        Ok(api_error.clone().into_response())
    } else if let Some(body_error) = err.find::<warp::filters::body::BodyDeserializeError>() {
        Ok(ApiError::invalid_input(body_error.to_string()).into_response())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        Ok(ApiError::method_not_allowed().into_response())
    } else if err.is_not_found() {
        Ok(ApiError::not_found().into_response())
    } else {
        Err(err)
    }
}
