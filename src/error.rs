use std::collections::BTreeMap;

use thiserror::Error;

/// Field name -> message, as shown next to form inputs.
pub type FieldErrors = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error {status}: {detail}")]
    Api {
        status: u16,
        detail: String,
        body: Option<serde_json::Value>,
    },

    #[error("Validation failed: {}", summarize(.0))]
    Validation(FieldErrors),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} is still being saved")]
    Busy(String),

    #[error("PDF error: {0}")]
    Pdf(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}

fn summarize(errors: &FieldErrors) -> String {
    errors
        .iter()
        .map(|(field, msg)| format!("{}: {}", field, msg))
        .collect::<Vec<_>>()
        .join(", ")
}

impl AppError {
    /// Builds an `Api` error from a non-2xx status and its raw body.
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
        let detail = parsed
            .as_ref()
            .and_then(extract_detail)
            .unwrap_or_else(|| fallback_detail(status, body));
        AppError::Api {
            status,
            detail,
            body: parsed,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AppError::NotAuthenticated) || self.status() == Some(401)
    }

    /// Field errors from a client-side validation failure or a 422 response.
    pub fn field_errors(&self) -> Option<FieldErrors> {
        match self {
            AppError::Validation(errors) => Some(errors.clone()),
            AppError::Api {
                status: 422,
                body: Some(body),
                ..
            } => {
                let errors = field_errors_from_body(body);
                (!errors.is_empty()).then_some(errors)
            }
            _ => None,
        }
    }

    /// Text for the toast shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Network(e) if e.is_timeout() => "The server took too long to respond".to_string(),
            AppError::Network(_) => "Could not reach the server".to_string(),
            AppError::Api { detail, .. } => detail.clone(),
            AppError::Validation(_) => "Please fix the highlighted fields".to_string(),
            AppError::NotAuthenticated => "Your session has expired, please log in again".to_string(),
            other => other.to_string(),
        }
    }
}

/// Best-effort extraction of a readable message from an error body.
pub fn extract_detail(body: &serde_json::Value) -> Option<String> {
    match body.get("detail") {
        Some(serde_json::Value::String(s)) => return Some(s.clone()),
        Some(serde_json::Value::Array(items)) => {
            let messages: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    let msg = item.get("msg")?.as_str()?;
                    match last_loc(item) {
                        Some(field) => Some(format!("{}: {}", field, msg)),
                        None => Some(msg.to_string()),
                    }
                })
                .collect();
            if !messages.is_empty() {
                return Some(messages.join("; "));
            }
        }
        Some(serde_json::Value::Object(obj)) => {
            if let Some(serde_json::Value::String(s)) = obj.get("message") {
                return Some(s.clone());
            }
        }
        _ => {}
    }

    ["message", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(|v| v.as_str()).map(str::to_string))
}

fn last_loc(item: &serde_json::Value) -> Option<String> {
    let loc = item.get("loc")?.as_array()?;
    match loc.last()? {
        serde_json::Value::String(s) if s != "body" => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Maps `{"detail": [{"loc": [..., field], "msg": ...}]}` onto form fields.
pub fn field_errors_from_body(body: &serde_json::Value) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if let Some(items) = body.get("detail").and_then(|d| d.as_array()) {
        for item in items {
            let (Some(field), Some(msg)) = (last_loc(item), item.get("msg").and_then(|m| m.as_str())) else {
                continue;
            };
            errors.entry(field).or_insert_with(|| msg.to_string());
        }
    }
    errors
}

fn fallback_detail(status: u16, body: &str) -> String {
    let text = body.trim();
    if text.is_empty() || text.starts_with('<') {
        format!("Request failed with status {}", status)
    } else {
        text.chars().take(200).collect()
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_string() {
        let err = AppError::from_response(400, r#"{"detail": "Drug name already exists"}"#);
        assert_eq!(err.user_message(), "Drug name already exists");
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn test_detail_validation_list() {
        let body = r#"{"detail": [
            {"loc": ["body", "name"], "msg": "field required", "type": "value_error.missing"},
            {"loc": ["body", "age"], "msg": "must be positive", "type": "value_error"}
        ]}"#;
        let err = AppError::from_response(422, body);
        assert_eq!(err.user_message(), "name: field required; age: must be positive");

        let fields = err.field_errors().unwrap();
        assert_eq!(fields.get("name").map(String::as_str), Some("field required"));
        assert_eq!(fields.get("age").map(String::as_str), Some("must be positive"));
    }

    #[test]
    fn test_message_and_fallbacks() {
        let err = AppError::from_response(500, r#"{"message": "boom"}"#);
        assert_eq!(err.user_message(), "boom");

        let err = AppError::from_response(502, "<html>Bad Gateway</html>");
        assert_eq!(err.user_message(), "Request failed with status 502");

        let err = AppError::from_response(503, "maintenance");
        assert_eq!(err.user_message(), "maintenance");
    }

    #[test]
    fn test_unauthorized() {
        assert!(AppError::from_response(401, "").is_unauthorized());
        assert!(AppError::NotAuthenticated.is_unauthorized());
        assert!(!AppError::from_response(403, "").is_unauthorized());
    }

    #[test]
    fn test_validation_display() {
        let mut errors = FieldErrors::new();
        errors.insert("name".into(), "required".into());
        let err = AppError::Validation(errors);
        assert_eq!(err.to_string(), "Validation failed: name: required");
        assert!(err.field_errors().is_some());
    }
}
