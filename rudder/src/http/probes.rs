use std::sync::Arc;

use axum::{
    Router,
    extract::State as AxumState,
    response::{IntoResponse, Response},
    routing::get,
};
use http::{StatusCode, header::CONTENT_TYPE};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub(crate) struct State {
    ready: CancellationToken,
}

impl State {
    pub fn new(token: CancellationToken) -> Self {
        Self { ready: token }
    }

    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

pub(crate) fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn healthz() -> Readiness {
    Readiness::Ready
}

async fn readyz(AxumState(state): AxumState<Arc<State>>) -> Readiness {
    state.ready()
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Readiness::Ready => (StatusCode::OK, "Ok"),
            Readiness::NotReady => (StatusCode::INTERNAL_SERVER_ERROR, "NotReady"),
        };
        (status, [(CONTENT_TYPE, "text/plain")], body).into_response()
    }
}
