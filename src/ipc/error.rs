use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::calc::GradingError;
use crate::fees::FeeError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Handler failure carrying its stable wire code.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("{message}")]
    BadParams {
        message: String,
        details: Option<serde_json::Value>,
    },
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("sign in first")]
    Unauthenticated,
    #[error("email or password is incorrect")]
    InvalidCredentials,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("{message}")]
    Db {
        code: &'static str,
        message: String,
        table: Option<&'static str>,
    },
    #[error("{0}")]
    Io(String),
    #[error("unknown method: {0}")]
    NotImplemented(String),
}

impl IpcError {
    pub fn bad(message: impl Into<String>) -> Self {
        Self::BadParams {
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::BadParams {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::Db {
            code: "db_query_failed",
            message: e.to_string(),
            table: None,
        }
    }

    /// Settings rows that fail to load or save.
    pub fn settings(e: anyhow::Error) -> Self {
        Self::Db {
            code: "db_query_failed",
            message: format!("{e:#}"),
            table: Some("settings"),
        }
    }

    pub fn tx(e: rusqlite::Error) -> Self {
        Self::Db {
            code: "db_tx_failed",
            message: e.to_string(),
            table: None,
        }
    }

    /// Constraint violations on insert surface as `conflict`.
    pub fn insert(table: &'static str, e: rusqlite::Error) -> Self {
        if is_constraint_violation(&e) {
            return Self::Conflict(format!("conflicts with existing data in {}: {}", table, e));
        }
        Self::Db {
            code: "db_insert_failed",
            message: e.to_string(),
            table: Some(table),
        }
    }

    pub fn update(table: &'static str, e: rusqlite::Error) -> Self {
        if is_constraint_violation(&e) {
            return Self::Conflict(format!("update conflicts with existing data in {}: {}", table, e));
        }
        Self::Db {
            code: "db_update_failed",
            message: e.to_string(),
            table: Some(table),
        }
    }

    pub fn delete(table: &'static str, e: rusqlite::Error) -> Self {
        Self::Db {
            code: "db_delete_failed",
            message: e.to_string(),
            table: Some(table),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadParams { .. } => "bad_params",
            Self::NoWorkspace => "no_workspace",
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Db { code, .. } => *code,
            Self::Io(_) => "io_failed",
            Self::NotImplemented(_) => "not_implemented",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::BadParams { details, .. } => details.clone(),
            Self::Db {
                table: Some(table), ..
            } => Some(json!({ "table": table })),
            _ => None,
        }
    }

    pub fn response(&self, id: &str) -> serde_json::Value {
        err(id, self.code(), self.to_string(), self.details())
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl From<GradingError> for IpcError {
    fn from(e: GradingError) -> Self {
        Self::bad(e.to_string())
    }
}

impl From<FeeError> for IpcError {
    fn from(e: FeeError) -> Self {
        Self::bad(e.to_string())
    }
}

impl From<AuthError> for IpcError {
    fn from(e: AuthError) -> Self {
        Self::bad(e.to_string())
    }
}

/// Folds a handler outcome into the wire envelope.
pub fn respond(id: &str, outcome: Result<serde_json::Value, IpcError>) -> serde_json::Value {
    match outcome {
        Ok(result) => ok(id, result),
        Err(e) => {
            tracing::warn!(code = e.code(), error = %e, "request failed");
            e.response(id)
        }
    }
}
