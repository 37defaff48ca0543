use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::{DomainError, RepositoryError};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
    }

    /// 对外只返回通用信息，细节由调用方记录日志
    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "internal server error",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

fn from_domain(error: DomainError) -> ApiError {
    let message = error.to_string();
    match error {
        DomainError::InvalidArgument { .. } | DomainError::SelfFriendRequest => {
            ApiError::bad_request(message)
        }
        DomainError::DuplicateUser { .. }
        | DomainError::DuplicateEdge
        | DomainError::DuplicateMembership => {
            ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
        }
        DomainError::UserNotFound
        | DomainError::FriendRequestNotFound
        | DomainError::ConversationNotFound
        | DomainError::MessageNotFound => ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
        DomainError::NotConversationMember => {
            ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
        }
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        match error {
            ApplicationError::Domain(domain) => from_domain(domain),
            ApplicationError::Repository(RepositoryError::NotFound) => {
                ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "resource not found")
            }
            ApplicationError::Repository(RepositoryError::Conflict) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", "resource already exists")
            }
            ApplicationError::Authentication => ApiError::unauthorized("authentication failed"),
            ApplicationError::Authorization => {
                ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN", "operation not permitted")
            }
            other => {
                tracing::error!(error = %other, detail = ?other, "请求处理失败");
                ApiError::internal()
            }
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::bad_request(errors.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_http_status() {
        let cases = [
            (DomainError::UserNotFound, StatusCode::NOT_FOUND),
            (DomainError::FriendRequestNotFound, StatusCode::NOT_FOUND),
            (DomainError::DuplicateEdge, StatusCode::CONFLICT),
            (DomainError::duplicate_user("phone"), StatusCode::CONFLICT),
            (DomainError::DuplicateMembership, StatusCode::CONFLICT),
            (DomainError::SelfFriendRequest, StatusCode::BAD_REQUEST),
            (DomainError::NotConversationMember, StatusCode::FORBIDDEN),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(ApplicationError::from(error)).status(), status);
        }
    }

    #[test]
    fn infrastructure_failures_hide_details() {
        let err = ApiError::from(ApplicationError::from(RepositoryError::storage(
            "connection reset by peer",
        )));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body.message, "internal server error");
    }

    #[test]
    fn unauthenticated_is_401() {
        let err = ApiError::from(ApplicationError::Authentication);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.code(), "UNAUTHORIZED");
    }
}
