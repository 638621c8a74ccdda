//! Crate-wide error taxonomy, reported by behavior rather than by type name.
//!
//! Mirrors the shape of the rate limiter's `Responder` wrapper: a thin enum
//! that carries a status code and a structured JSON body, so every RPC
//! handler can return `Result<Json<T>, Error>` directly.

use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use serde::Serialize;

#[derive(Debug)]
pub enum Error {
    /// Malformed request, missing required field, unknown group.
    InvalidArgument(String),
    /// Referenced entity absent.
    NotFound(String),
    /// Concurrent modification detected.
    Conflict(String),
    /// Durable append or projection write could not complete.
    WriteFailed(String),
    /// Daemon shutting down or a dependency is unhealthy.
    Unavailable(String),
    /// Caller or shutdown cancelled the in-flight call.
    Cancelled,
    /// Invariant violation.
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl Error {
    fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::WriteFailed(_) => "write_failed",
            Error::Unavailable(_) => "unavailable",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    fn status(&self) -> Status {
        match self {
            Error::InvalidArgument(_) => Status::BadRequest,
            Error::NotFound(_) => Status::NotFound,
            Error::Conflict(_) => Status::Conflict,
            Error::WriteFailed(_) => Status::InternalServerError,
            Error::Unavailable(_) => Status::ServiceUnavailable,
            Error::Cancelled => Status::new(499),
            Error::Internal(_) => Status::InternalServerError,
        }
    }

    fn message(&self) -> String {
        match self {
            Error::InvalidArgument(m)
            | Error::NotFound(m)
            | Error::Conflict(m)
            | Error::WriteFailed(m)
            | Error::Unavailable(m)
            | Error::Internal(m) => m.clone(),
            Error::Cancelled => "call cancelled".to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for Error {}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        // Errors from the projection store bubble up unwrapped except for
        // this annotation, per the propagation policy.
        Error::Internal(format!("sqlite: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        // Log writer errors are wrapped with context and surfaced directly.
        Error::WriteFailed(format!("log append failed: {e}"))
    }
}

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        if matches!(self, Error::Internal(_) | Error::WriteFailed(_)) {
            eprintln!("⚠️ {self}");
        }
        let body = ErrorBody {
            error: self.message(),
            code: self.code(),
        };
        let status = self.status();
        let mut res = Json(body).respond_to(req)?;
        res.set_status(status);
        Ok(res)
    }
}
