use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// `GET /v1/models`: lists configured model names.
pub async fn list_models(State(st): State<AppState>) -> Response {
    st.handler.models_response().await
}

/// `POST /v1/chat/completions`.
pub async fn chat_completions(State(st): State<AppState>, body: Bytes) -> Response {
    st.handler.handle_request("/v1/chat/completions", body).await
}

/// `POST /v1/completions`.
pub async fn completions(State(st): State<AppState>, body: Bytes) -> Response {
    st.handler.handle_request("/v1/completions", body).await
}

/// `POST /v1/embeddings`.
pub async fn embeddings(State(st): State<AppState>, body: Bytes) -> Response {
    st.handler.handle_request("/v1/embeddings", body).await
}

/// `GET /healthz`: process liveness only, independent of engine state.
pub async fn healthz(State(st): State<AppState>) -> Response {
    if st.handler.is_stopped() {
        return (StatusCode::SERVICE_UNAVAILABLE, "stopping").into_response();
    }
    (StatusCode::OK, "ok").into_response()
}
