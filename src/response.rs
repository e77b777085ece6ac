//! Terminal stage of a trace: the final log event, the last audit record and
//! removal of the entry, plus the JSON body handed back to the client.

use std::{collections::HashMap, fmt, fs, panic::Location, path::Path};

use http::{header, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Level;

use crate::{
    audit::AuditRecord,
    event::TraceEvent,
    lifecycle::Tracer,
    store::{Checkpoint, ResponseId},
};

const UNKNOWN_MESSAGE: &str = "unknown message";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Language {
    #[default]
    En,
    Id,
}

impl Language {
    /// `"ID"` (any case) selects Indonesian, everything else English.
    pub fn from_tag(tag: &str) -> Self {
        if tag.trim().eq_ignore_ascii_case("id") {
            Language::Id
        } else {
            Language::En
        }
    }

    /// Reads the first language of an `Accept-Language` value, ignoring
    /// quality weights and region subtags.
    pub fn from_accept_language(value: &str) -> Self {
        let first = value.split(',').next().unwrap_or_default();
        let tag = first.split(';').next().unwrap_or_default();
        Self::from_tag(tag.split('-').next().unwrap_or_default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read message catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Response messages by language and response code.
#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    en: HashMap<String, String>,
    id: HashMap<String, String>,
}

impl MessageCatalog {
    /// Parses `{"EN": {"0": "Success", ...}, "ID": {...}}`. Tables under any
    /// key other than `EN` are treated as Indonesian.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let tables: HashMap<String, HashMap<String, String>> = serde_json::from_str(json)?;

        let mut catalog = MessageCatalog::default();
        for (language, table) in tables {
            let target = if language.eq_ignore_ascii_case("en") {
                &mut catalog.en
            } else {
                &mut catalog.id
            };
            target.extend(table);
        }
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn insert(
        &mut self,
        language: Language,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> &mut Self {
        self.table_mut(language).insert(code.into(), message.into());
        self
    }

    pub fn message(&self, language: Language, code: &str) -> &str {
        let table = match language {
            Language::En => &self.en,
            Language::Id => &self.id,
        };
        table.get(code).map_or(UNKNOWN_MESSAGE, String::as_str)
    }

    fn table_mut(&mut self, language: Language) -> &mut HashMap<String, String> {
        match language {
            Language::En => &mut self.en,
            Language::Id => &mut self.id,
        }
    }
}

/// Final application result of a traced request.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: StatusCode,
    pub code: String,
    /// Looked up in the [`MessageCatalog`] when not set.
    pub message: Option<String>,
    pub data: Value,
    pub error: Option<String>,
    pub language: Language,
    pub additional_tracer: Vec<String>,
}

impl Outcome {
    /// 200 with code `"0"`.
    pub fn success() -> Self {
        Outcome {
            status: StatusCode::OK,
            code: "0".to_string(),
            message: None,
            data: Value::Null,
            error: None,
            language: Language::En,
            additional_tracer: Vec::new(),
        }
    }

    /// 400 with code `"99"`.
    pub fn failure(error: impl fmt::Display) -> Self {
        Outcome {
            status: StatusCode::BAD_REQUEST,
            code: "99".to_string(),
            error: Some(error.to_string()),
            ..Self::success()
        }
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn data<T: Serialize + ?Sized>(mut self, data: &T) -> Self {
        self.data = serde_json::to_value(data).unwrap_or_else(|e| Value::String(e.to_string()));
        self
    }

    pub fn language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn additional_tracer(mut self, label: impl Into<String>) -> Self {
        self.additional_tracer.push(label.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Layout of the JSON body returned to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseShape {
    /// `{"code", "message", "response_id", "data"?}`
    #[default]
    Standard,
    /// `{"responseCode", "responseMessage", "referenceNo", "data"?}`
    Snap,
}

impl ResponseShape {
    fn render(self, id: ResponseId, code: &str, message: &str, data: &Value) -> Value {
        let (code_key, message_key, id_key) = match self {
            ResponseShape::Standard => ("code", "message", "response_id"),
            ResponseShape::Snap => ("responseCode", "responseMessage", "referenceNo"),
        };

        let mut body = Map::new();
        body.insert(code_key.to_string(), Value::from(code));
        body.insert(message_key.to_string(), Value::from(message));
        body.insert(id_key.to_string(), Value::from(id.as_u64()));
        if !data.is_null() {
            body.insert("data".to_string(), data.clone());
        }
        Value::Object(body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl FinalResponse {
    pub fn into_response(self) -> http::Response<String> {
        let mut response = http::Response::new(self.body.to_string());
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl Tracer {
    /// Logs the last stage of `id`, audits it when enabled, removes the trace
    /// and builds the client response.
    #[track_caller]
    pub fn finish(&self, id: ResponseId, outcome: Outcome, shape: ResponseShape) -> FinalResponse {
        let message = self.resolve_message(&outcome);
        self.close(id, &outcome, &message, "api.finalResponse", Location::caller());

        FinalResponse {
            status: outcome.status,
            body: shape.render(id, &outcome.code, &message, &outcome.data),
        }
    }

    /// [`Tracer::finish`] for work that sends no response, e.g. background jobs.
    #[track_caller]
    pub fn finish_void(&self, id: ResponseId, outcome: Outcome) {
        let message = self.resolve_message(&outcome);
        self.close(id, &outcome, &message, "finalResponse", Location::caller());
    }

    /// Replaces the outcome's code and logs the remap at the current step
    /// without taking a checkpoint.
    pub fn remap_code(&self, id: ResponseId, outcome: &mut Outcome, code: impl Into<String>) {
        let previous = std::mem::replace(&mut outcome.code, code.into());
        outcome.message = None;
        let message = self.resolve_message(outcome);
        let stage = self.inner.store.peek_stage(id).unwrap_or(Checkpoint::UNKNOWN);

        self.emit(
            TraceEvent::new(Level::DEBUG, id, "response code remapped")
                .field("step", stage.step)
                .field("duration", stage.duration_ms())
                .field("total-duration", stage.total_ms())
                .field(
                    "code-info",
                    format!("Remapping from {previous} to {}", outcome.code),
                )
                .field("code", outcome.code.as_str())
                .field("message", message),
        );
    }

    /// Replaces the outcome's error and logs the remap at the current step
    /// without taking a checkpoint.
    pub fn remap_error(&self, id: ResponseId, outcome: &mut Outcome, error: impl fmt::Display) {
        let error = error.to_string();
        let info = match &outcome.error {
            Some(previous) => format!("Remapping from {previous} to {error}"),
            None => format!("New Error {error}"),
        };
        outcome.error = Some(error);
        let stage = self.inner.store.peek_stage(id).unwrap_or(Checkpoint::UNKNOWN);

        self.emit(
            TraceEvent::new(Level::WARN, id, "response error remapped")
                .field("step", stage.step)
                .field("duration", stage.duration_ms())
                .field("total-duration", stage.total_ms())
                .field("error-info", info),
        );
    }

    fn resolve_message(&self, outcome: &Outcome) -> String {
        match &outcome.message {
            Some(message) if !message.is_empty() => message.clone(),
            _ => self
                .inner
                .catalog
                .message(outcome.language, &outcome.code)
                .to_string(),
        }
    }

    fn close(
        &self,
        id: ResponseId,
        outcome: &Outcome,
        message: &str,
        function_name: &'static str,
        location: &Location<'_>,
    ) {
        let store = &self.inner.store;
        let stage = store.next_stage(id).unwrap_or(Checkpoint::UNKNOWN);
        let correlation_id = store.correlation_id(id).unwrap_or_default();
        let trace = format!("{}:{}", location.file(), location.line());

        let (level, text) = match outcome.error {
            Some(_) => (Level::WARN, "request failed"),
            None => (Level::DEBUG, "request completed"),
        };
        let mut event = TraceEvent::new(level, id, text)
            .field("step", stage.step)
            .field("duration", stage.duration_ms())
            .field("total-duration", stage.total_ms())
            .field("additional-tracer", outcome.additional_tracer.join(" "))
            .field("http-code", outcome.status.as_u16())
            .field("code", outcome.code.as_str())
            .field("message", message)
            .field("data", outcome.data.clone())
            .field("function-name", function_name)
            .field("trace", trace);
        if let Some(error) = &outcome.error {
            event = event.field("error", error.as_str());
        }
        self.emit(event);

        if self.audit_enabled() {
            self.inner.audit.submit(
                AuditRecord::new(id, stage.step)
                    .request_id(correlation_id)
                    .code(outcome.code.as_str(), message)
                    .function_name(function_name)
                    .data(&outcome.data)
                    .duration(stage.duration_ms())
                    .location(location),
            );
        }

        store.finalize(id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn catalog_lookup_and_fallback() {
        let catalog = MessageCatalog::from_json(
            r#"{"EN": {"0": "Success", "99": "General error"}, "ID": {"0": "Sukses"}}"#,
        )
        .unwrap();

        assert_eq!(catalog.message(Language::En, "0"), "Success");
        assert_eq!(catalog.message(Language::Id, "0"), "Sukses");
        assert_eq!(catalog.message(Language::Id, "99"), UNKNOWN_MESSAGE);
        assert_eq!(catalog.message(Language::En, "42"), UNKNOWN_MESSAGE);
    }

    #[test]
    fn malformed_catalog_is_rejected() {
        assert!(matches!(
            MessageCatalog::from_json(r#"{"EN": ["x"]}"#),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn language_tags() {
        assert_eq!(Language::from_tag("id"), Language::Id);
        assert_eq!(Language::from_tag(" ID "), Language::Id);
        assert_eq!(Language::from_tag("fr"), Language::En);
    }

    #[test]
    fn accept_language_uses_first_entry() {
        assert_eq!(Language::from_accept_language("id-ID,en;q=0.8"), Language::Id);
        assert_eq!(Language::from_accept_language("ID"), Language::Id);
        assert_eq!(Language::from_accept_language("en-US, id;q=0.9"), Language::En);
        assert_eq!(Language::from_accept_language("*"), Language::En);
    }

    #[test]
    fn outcome_defaults() {
        let ok = Outcome::success();
        assert_eq!(ok.status, StatusCode::OK);
        assert_eq!(ok.code, "0");
        assert!(!ok.is_error());

        let failed = Outcome::failure("boom");
        assert_eq!(failed.status, StatusCode::BAD_REQUEST);
        assert_eq!(failed.code, "99");
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn shapes_render_expected_keys() {
        let id = ResponseId::from_raw(17);

        assert_eq!(
            ResponseShape::Standard.render(id, "0", "Success", &Value::Null),
            json!({"code": "0", "message": "Success", "response_id": 17})
        );
        assert_eq!(
            ResponseShape::Snap.render(id, "0", "Success", &json!([1])),
            json!({"responseCode": "0", "responseMessage": "Success", "referenceNo": 17, "data": [1]})
        );
    }

    #[test]
    fn final_response_into_http() {
        let response = FinalResponse {
            status: StatusCode::CREATED,
            body: json!({"code": "0"}),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.body(), r#"{"code":"0"}"#);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }
}
