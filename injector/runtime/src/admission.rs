use crate::{AdmissionMetrics, MeshInjector};
use bytes::{Buf, Bytes};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::time;
use tracing::{debug, trace, warn};

/// Serves the mutating webhook on `POST /`.
#[derive(Clone)]
pub struct Admission {
    injector: Arc<MeshInjector>,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to build response: {0}")]
    Http(#[from] http::Error),
}

type Review = AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<Bytes>;

// === impl Admission ===

impl Admission {
    pub fn new(injector: Arc<MeshInjector>, metrics: AdmissionMetrics) -> Self {
        Self { injector, metrics }
    }

    async fn review(self, body: Bytes) -> Review {
        let req = match decode(body) {
            Ok(req) => req,
            Err(rsp) => return rsp.into_review(),
        };
        debug!(uid = %req.uid, ns = ?req.namespace, name = %req.name, dry_run = req.dry_run);

        let start = time::Instant::now();
        let rsp = self.injector.admit(req).await;
        self.metrics.observe(start, &rsp);
        debug!(allowed = rsp.allowed, patched = rsp.patch.is_some(), uid = %rsp.uid);
        rsp.into_review()
    }
}

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if !is_review_route(&req) {
            return Box::pin(future::ready(not_found()));
        }

        let admission = self.clone();
        Box::pin(async move {
            let body = req.into_body().collect().await?.to_bytes();
            json_response(&admission.review(body).await)
        })
    }
}

fn is_review_route<B>(req: &Request<B>) -> bool {
    req.method() == http::Method::POST && req.uri().path() == "/"
}

/// Decodes an `AdmissionReview` body into its request, or the `invalid` response to send back.
fn decode(body: Bytes) -> Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    let review: Review = serde_json::from_reader(body.reader()).map_err(|error| {
        warn!(%error, "Failed to parse request body");
        AdmissionResponse::invalid(error)
    })?;
    trace!(?review);

    review.try_into().map_err(|error| {
        warn!(%error, "Invalid admission request");
        AdmissionResponse::invalid(error)
    })
}

fn not_found() -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(http::StatusCode::NOT_FOUND)
        .body(Body::default())?)
}

fn json_response(review: &Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(review)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))?)
}
