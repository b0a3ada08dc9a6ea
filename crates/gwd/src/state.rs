use std::sync::Arc;

use gwcore::{Config, Metrics};

use crate::handler::RequestHandler;

/// Top-level axum state: one `Clone`-able struct of `Arc`s handed to every
/// route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub handler: Arc<RequestHandler>,
    pub metrics: Arc<Metrics>,
}
