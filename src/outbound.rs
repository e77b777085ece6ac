//! Tracing of outbound HTTP calls made while a trace is open.

use std::panic::Location;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::Level;

use crate::{
    audit::AuditRecord,
    event::TraceEvent,
    lifecycle::{headers_json, Tracer},
    store::{Checkpoint, ResponseId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub query: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    /// Free-form labels logged with the call.
    pub additional_tracer: Vec<String>,
}

impl OutboundRequest {
    pub fn new(method: http::Method, url: impl Into<String>) -> Self {
        OutboundRequest {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            query: Vec::new(),
            basic_auth: None,
            additional_tracer: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    pub fn additional_tracer(mut self, label: impl Into<String>) -> Self {
        self.additional_tracer.push(label.into());
        self
    }

    fn query_json(&self) -> serde_json::Value {
        self.query
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
            .collect::<serde_json::Map<_, _>>()
            .into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl OutboundResponse {
    /// Anything but 200 is an error.
    pub fn must_ok(self) -> Result<Self, OutboundError> {
        if self.status == 200 {
            Ok(self)
        } else {
            Err(OutboundError::UnexpectedStatus {
                status: self.status,
                body: self.body,
            })
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, OutboundError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("outbound request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("http must be 200, got {status}, response body {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Sends an outbound request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, TransportError>;
}

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use super::*;

    /// [`Transport`] backed by a shared [`reqwest::Client`].
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            ReqwestTransport { client }
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(
            &self,
            request: &OutboundRequest,
        ) -> Result<OutboundResponse, TransportError> {
            let mut builder = self
                .client
                .request(request.method.clone(), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some((username, password)) = &request.basic_auth {
                builder = builder.basic_auth(username, Some(password));
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder
                .send()
                .await
                .map_err(|e| TransportError::new(e.to_string()))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::new(e.to_string()))?;

            Ok(OutboundResponse {
                status,
                body,
                headers,
            })
        }
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_transport::ReqwestTransport;

impl Tracer {
    /// Sends `request` through `transport` as the next step of trace `id`.
    ///
    /// The step and durations are taken before dispatch. A transport failure
    /// is logged at `warn` and returned; a response of any status is logged
    /// at `debug` and audited when enabled. If `id` is no longer open the
    /// call still goes out and is logged with step 0.
    #[track_caller]
    pub fn call<'a, T>(
        &'a self,
        id: ResponseId,
        transport: &'a T,
        request: OutboundRequest,
    ) -> impl std::future::Future<Output = Result<OutboundResponse, OutboundError>> + Send + 'a
    where
        T: Transport + ?Sized,
    {
        let location = Location::caller();
        async move {
            let stage = self
                .inner
                .store
                .next_stage(id)
                .unwrap_or(Checkpoint::UNKNOWN);

            let mut event = TraceEvent::new(Level::DEBUG, id, "outbound call")
                .field("step", stage.step)
                .field("duration", stage.duration_ms())
                .field("total-duration", stage.total_ms());
            if !request.additional_tracer.is_empty() {
                event = event.field("additional-tracer", request.additional_tracer.join(" "));
            }
            event = event
                .field("url", request.url.as_str())
                .field("http-method", request.method.as_str())
                .field("header", headers_json(&request.headers));
            if let Some(body) = &request.body {
                event = event.field("request-body", body.as_str());
            }
            if !request.query.is_empty() {
                event = event.field("query-param", request.query_json());
            }

            let response = match transport.send(&request).await {
                Ok(response) => response,
                Err(error) => {
                    let mut event = event.field("error", error.to_string());
                    event.level = Level::WARN;
                    self.emit(event);
                    return Err(error.into());
                }
            };

            self.emit(
                event
                    .field("http-code", response.status)
                    .field("client-response-body", response.body.as_str())
                    .field("client-response-header", headers_json(&response.headers)),
            );

            if self.audit_enabled() {
                self.audit_call(id, stage, &request, &response, location);
            }

            Ok(response)
        }
    }

    fn audit_call(
        &self,
        id: ResponseId,
        stage: Checkpoint,
        request: &OutboundRequest,
        response: &OutboundResponse,
        location: &Location<'_>,
    ) {
        let request_data = json!({
            "url": request.url,
            "http_method": request.method.as_str(),
            "header": headers_json(&request.headers),
            "request_body": request.body.as_deref().unwrap_or_default(),
            "query_param": request.query_json(),
            "base_auth": request
                .basic_auth
                .as_ref()
                .map(|(user, _)| format!("{user}:***"))
                .unwrap_or_default(),
        });
        let response_data = json!({
            "http_code": response.status,
            "response_header": headers_json(&response.headers),
            "response_body": response.body,
        });

        let correlation_id = self.inner.store.correlation_id(id).unwrap_or_default();
        self.inner.audit.submit(
            AuditRecord::new(id, stage.step)
                .request_id(correlation_id)
                .function_name("client.hit")
                .data(&json!({
                    "request_data": request_data,
                    "response_data": response_data,
                }))
                .duration(stage.duration_ms())
                .location(location),
        );
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[test]
    fn must_ok_rejects_other_statuses() {
        let ok = OutboundResponse {
            status: 200,
            body: "{}".into(),
            headers: vec![],
        };
        assert!(ok.must_ok().is_ok());

        let created = OutboundResponse {
            status: 201,
            body: "made".into(),
            headers: vec![],
        };
        match created.must_ok() {
            Err(OutboundError::UnexpectedStatus { status, body }) => {
                assert_eq!(status, 201);
                assert_eq!(body, "made");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn json_decodes_body() {
        #[derive(Deserialize)]
        struct Balance {
            amount: u64,
        }

        let response = OutboundResponse {
            status: 200,
            body: r#"{"amount": 12}"#.into(),
            headers: vec![],
        };
        assert_eq!(response.json::<Balance>().unwrap().amount, 12);

        let broken = OutboundResponse {
            status: 200,
            body: "<html>".into(),
            headers: vec![],
        };
        assert!(matches!(
            broken.json::<Balance>(),
            Err(OutboundError::Decode(_))
        ));
    }

    #[test]
    fn request_builder_collects_parts() {
        let request = OutboundRequest::new(http::Method::POST, "https://bank.test/transfer")
            .header("content-type", "application/json")
            .query("dry_run", "1")
            .basic_auth("svc", "secret")
            .body("{}")
            .additional_tracer("transfer");

        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.query_json(), json!({"dry_run": "1"}));
        assert_eq!(request.basic_auth, Some(("svc".into(), "secret".into())));
        assert_eq!(request.additional_tracer, vec!["transfer".to_string()]);
    }
}
