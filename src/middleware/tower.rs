use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use tower::Service;
use tower_layer::Layer;

use crate::lifecycle::{RequestHead, Tracer};

/// Opens a trace for every request that passes through.
///
/// Generally, the middleware should be used on every http route, this usually
/// means that it can be registered globally and in the last position, to be the
/// first to run.
///
/// The request body is buffered and put back, so handlers read it as usual.
/// The [`ResponseId`](crate::ResponseId), the [`Tracer`] and the request's
/// [`Language`](crate::Language) are stored in the request extensions. If the body cannot be read the request is answered
/// with a 500 and never reaches the handler. The trace is finalized once the
/// handler future completes or is dropped, whether or not the handler
/// finished it itself.
///
/// ```ignore
/// let app = Router::new()
///     .route("/foo", post(foo))
///     .route("/bar", get(bar))
///     .layer(TraceLayer::new(tracer));
/// ```
#[derive(Debug, Clone)]
pub struct TraceLayer {
    tracer: Tracer,
}

impl TraceLayer {
    pub fn new(tracer: Tracer) -> Self {
        TraceLayer { tracer }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TraceService {
            service,
            tracer: self.tracer.clone(),
        }
    }
}

/// This service implements the Trace behavior
#[derive(Debug, Clone)]
pub struct TraceService<S> {
    service: S,
    tracer: Tracer,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TraceService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Body<Data = Bytes> + From<Bytes> + Send + 'static,
    ReqBody::Error: std::fmt::Display,
    ResBody: Default + Send + 'static,
{
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = Response<ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // the instance that was polled ready serves this request
        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);
        let tracer = self.tracer.clone();

        Box::pin(async move {
            let scope = tracer.begin();
            let (mut parts, body) = request.into_parts();

            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(error) => {
                    scope.abort_request(&parts, &error);
                    let mut response = Response::new(ResBody::default());
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    return Ok(response);
                }
            };

            scope.enter_request(&parts, &body);
            let language = RequestHead::language(&parts);
            parts.extensions.insert(scope.id());
            parts.extensions.insert(language);
            parts.extensions.insert(tracer.clone());

            let response = service
                .call(Request::from_parts(parts, ReqBody::from(body)))
                .await;
            drop(scope);
            response
        })
    }
}
