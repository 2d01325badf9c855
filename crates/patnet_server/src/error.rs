/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::http::StatusCode;

/// Every way a request can end other than a handler's own response.
#[derive(Debug, thiserror::Error)]
pub enum ForumError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} was not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("too much POST data")]
    PayloadTooLarge,

    #[error("{0}")]
    Query(String),

    #[error("{0}")]
    Internal(String),
}

impl ForumError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Query(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Faults the operator has to look at, as opposed to rejections.
    pub fn is_fault(&self) -> bool {
        self.status().is_server_error()
    }
}

impl From<anyhow::Error> for ForumError {
    fn from(err: anyhow::Error) -> Self {
        Self::Query(format!("{err:#}"))
    }
}

pub type ForumResult<T> = std::result::Result<T, ForumError>;
