use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::client::EngineClient;
use crate::error::ManagerError;
use crate::manager::{EngineManager, EnsureRequired, Purpose};

/// The core two-phase sizing pipeline: a cheap local tokenizer sizes the
/// first engine start so the estimation engine is often the engine we end
/// up serving the request with; worst case is two starts.
pub struct ModelSelector;

impl ModelSelector {
    /// `path` is the request's HTTP path, used only to special-case
    /// `/v1/embeddings`, which never needs token-count sizing.
    pub async fn select_variant(
        tier: &EngineManager,
        path: &str,
        model_name: &str,
        request: &Value,
    ) -> Result<(Arc<dyn EngineClient>, Duration), ManagerError> {
        if path == "/v1/embeddings" {
            return tier
                .ensure_engine(
                    model_name,
                    EnsureRequired {
                        purpose: Purpose::TextQuery,
                        context_size_required: 0,
                    },
                )
                .await;
        }

        let mut size = 0u32;
        if let Some(tokenizer) = tier.ensure_local_tokenizer(model_name) {
            size = tokenizer.estimate_tokens(request).await;
        }

        let (est_client, _) = tier
            .ensure_engine(
                model_name,
                EnsureRequired {
                    purpose: Purpose::ContextEstimation,
                    context_size_required: size,
                },
            )
            .await?;
        size = est_client.estimate_tokens(request).await;

        tier.ensure_engine(
            model_name,
            EnsureRequired {
                purpose: Purpose::TextQuery,
                context_size_required: size,
            },
        )
        .await
    }
}
