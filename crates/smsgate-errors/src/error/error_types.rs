use super::{ApiErrorType, ProblemType};
use http::StatusCode;

// Common HTTP errors

/// 400 Bad Request HTTP Status Code
pub const DEFAULT_BAD_REQUEST_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::Default,
    title: "Bad Request",
    status: StatusCode::BAD_REQUEST,
};

/// 500 Internal Server Error HTTP Status Code
pub const DEFAULT_INTERNAL_SERVER_ERROR_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::Default,
    title: "Internal Server Error",
    status: StatusCode::INTERNAL_SERVER_ERROR,
};

/// 401 Unauthorized HTTP Status Code
pub const DEFAULT_UNAUTHORIZED_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::Default,
    title: "Unauthorized",
    status: StatusCode::UNAUTHORIZED,
};

/// 404 Not Found HTTP Status Code
pub const DEFAULT_NOT_FOUND_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::Default,
    title: "Not Found",
    status: StatusCode::NOT_FOUND,
};

/// 405 Method Not Allowed HTTP Status Code
pub const DEFAULT_METHOD_NOT_ALLOWED_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::Default,
    title: "Method Not Allowed",
    status: StatusCode::METHOD_NOT_ALLOWED,
};

// Gateway-specific errors, one per caller-visible error kind

/// Request validation failure (400 Bad Request)
pub const INVALID_INPUT_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::SmsGatewayApi("sms/invalid-input"),
    title: "Invalid Input",
    status: StatusCode::BAD_REQUEST,
};

/// Replayed client request id (409 Conflict)
pub const DUPLICATE_REQUEST_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::SmsGatewayApi("sms/duplicate-request"),
    title: "Duplicate Request",
    status: StatusCode::CONFLICT,
};

/// Working balance cannot cover the cost (400 Bad Request)
pub const INSUFFICIENT_BALANCE_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::SmsGatewayApi("credits/insufficient-balance"),
    title: "Insufficient Balance",
    status: StatusCode::BAD_REQUEST,
};

/// Operation conflicts with the resource's terminal state (400 Bad Request)
pub const CONFLICT_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::SmsGatewayApi("sms/conflict"),
    title: "Conflict",
    status: StatusCode::BAD_REQUEST,
};

/// Sliding-window rate limit exceeded (429 Too Many Requests)
pub const RATE_LIMITED_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::SmsGatewayApi("rate-limited"),
    title: "Too Many Requests",
    status: StatusCode::TOO_MANY_REQUESTS,
};

/// Downstream dependency unavailable (503 Service Unavailable)
pub const UNAVAILABLE_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::SmsGatewayApi("unavailable"),
    title: "Service Unavailable",
    status: StatusCode::SERVICE_UNAVAILABLE,
};

// Resource specific errors

/// Account Not Found error type (404 Not Found)
pub const ACCOUNT_NOT_FOUND_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::SmsGatewayApi("accounts/account-not-found"),
    title: "Account Not Found",
    status: StatusCode::NOT_FOUND,
};

/// Message Not Found error type (404 Not Found)
pub const MESSAGE_NOT_FOUND_TYPE: ApiErrorType = ApiErrorType {
    r#type: &ProblemType::SmsGatewayApi("sms/message-not-found"),
    title: "Message Not Found",
    status: StatusCode::NOT_FOUND,
};
