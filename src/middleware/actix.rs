use std::{
    future::{ready, Ready},
    rc::Rc,
};

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    error::ErrorInternalServerError,
    web::BytesMut,
    Error, FromRequest, HttpMessage, HttpRequest, HttpResponse,
};
use futures::{future::LocalBoxFuture, StreamExt};

use crate::{
    lifecycle::{RequestHead, Tracer},
    response::Language,
    store::ResponseId,
};

/// Opens a trace for every request that passes through.
///
/// Generally, the middleware should be used on every http route, this usually
/// means that it can be registered globally and in the last position, to be the
/// first to run, even before general logging layers.
///
/// The body is buffered and put back for the handler. Handlers receive the
/// [`ResponseId`] and the response [`Language`] as extractors and the
/// [`Tracer`] from the request extensions. A body that cannot be read is answered with a 500.
///
/// ```ignore
/// let app = App::new()
///     .route("/foo", web::post().to(foo))
///     .wrap(TraceLayer::new(tracer));
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

impl<S, B> Transform<S, ServiceRequest> for TraceLayer
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;
    type InitError = ();
    type Response = ServiceResponse<EitherBody<B>>;
    type Transform = TraceService<S>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(TraceService {
            service: Rc::new(service),
            tracer: self.tracer.clone(),
        }))
    }
}

/// This service implements the Trace behavior
pub struct TraceService<S> {
    service: Rc<S>,
    tracer: Tracer,
}

impl<S, B> Service<ServiceRequest> for TraceService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = ServiceResponse<EitherBody<B>>;

    // This service is ready when its next service is ready
    forward_ready!(service);

    fn call(&self, mut request: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let tracer = self.tracer.clone();

        Box::pin(async move {
            let scope = tracer.begin();

            let mut payload = request.take_payload();
            let mut body = BytesMut::new();
            while let Some(chunk) = payload.next().await {
                match chunk {
                    Ok(chunk) => body.extend_from_slice(&chunk),
                    Err(error) => {
                        scope.abort_request(&request, &error);
                        let response = HttpResponse::InternalServerError().finish();
                        return Ok(request.into_response(response).map_into_right_body());
                    }
                }
            }
            let body = body.freeze();

            scope.enter_request(&request, &body);
            let language = RequestHead::language(&request);
            request.extensions_mut().insert(scope.id());
            request.extensions_mut().insert(language);
            request.extensions_mut().insert(tracer.clone());
            request.set_payload(Payload::from(body));

            let response = service.call(request).await;
            drop(scope);
            Ok(response?.map_into_left_body())
        })
    }
}

impl RequestHead for ServiceRequest {
    fn method(&self) -> &str {
        ServiceRequest::method(self).as_str()
    }

    fn uri(&self) -> String {
        ServiceRequest::uri(self).to_string()
    }

    fn headers(&self) -> Vec<(String, String)> {
        ServiceRequest::headers(self)
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect()
    }

    fn client_ip(&self) -> Option<String> {
        self.connection_info()
            .realip_remote_addr()
            .map(str::to_string)
    }
}

impl FromRequest for ResponseId {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(request: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            request
                .extensions()
                .get::<ResponseId>()
                .copied()
                .ok_or_else(|| ErrorInternalServerError("request is not traced")),
        )
    }
}

impl FromRequest for Language {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(request: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Ok(request
            .extensions()
            .get::<Language>()
            .copied()
            .unwrap_or_default()))
    }
}
