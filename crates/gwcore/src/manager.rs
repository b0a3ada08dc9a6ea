use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::client::{EngineClient, EngineHttp};
use crate::config::{Config, KNOWN_ENGINE_KINDS};
use crate::error::ManagerError;
use crate::metrics::Metrics;
use crate::process::EngineProcess;
use crate::tokenizer::StandaloneTokenizer;

/// Grace period given to a replaced engine before escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(15);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The role a slot was sized for; decides whether a running engine can be
/// reused for a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    ContextEstimation,
    TextQuery,
}

/// What the caller needs the current slot to satisfy.
#[derive(Debug, Clone, Copy)]
pub struct EnsureRequired {
    pub purpose: Purpose,
    pub context_size_required: u32,
}

/// The at-most-one engine a tier's [`EngineManager`] currently owns.
pub struct RunningEngine {
    model_name: String,
    variant_index: usize,
    process: EngineProcess,
    client: Arc<dyn EngineClient>,
    idle_timeout: Duration,
    purpose: Purpose,
    context_size_required: u32,
}

/// Owns the single "current engine" slot for one tier; decides reuse vs.
/// restart, gates starts with readiness polling. One explicit instance
/// lives per tier rather than behind a process-wide singleton, so the
/// top-level gateway can hold and pass around both by reference.
pub struct EngineManager {
    config: Arc<Config>,
    slot: Mutex<Option<RunningEngine>>,
    disposed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl EngineManager {
    pub fn new(config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
            disposed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Pure lookup: a configured standalone tokenizer for the model, if any.
    /// No effect on the running-engine slot.
    pub fn ensure_local_tokenizer(&self, model_name: &str) -> Option<StandaloneTokenizer> {
        let model = self.config.model(model_name)?;
        let spec = model.local_tokenizer.as_ref()?;
        Some(StandaloneTokenizer::new(
            spec.binary.clone(),
            spec.args.clone(),
            spec.add_tokens_per_message,
        ))
    }

    /// Make a running engine fit for `required` and return its client and
    /// idle timeout: reuse the current slot when it still fits, otherwise
    /// stop it, select a suitable variant, and start fresh.
    pub async fn ensure_engine(
        &self,
        model_name: &str,
        required: EnsureRequired,
    ) -> Result<(Arc<dyn EngineClient>, Duration), ManagerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ManagerError::ManagerShutdown);
        }

        let model = self
            .config
            .model(model_name)
            .ok_or_else(|| ManagerError::UnknownModel(model_name.to_string()))?;
        if !KNOWN_ENGINE_KINDS.contains(&model.engine_kind.as_str()) {
            return Err(ManagerError::UnsupportedEngine(model.engine_kind.clone()));
        }

        let mut slot = self.slot.lock().await;

        if let Some(running) = slot.as_ref() {
            if self.can_reuse(running, model_name, model, required) && running.client.check_health().await {
                tracing::info!(model = model_name, "reusing running engine");
                return Ok((running.client.clone(), running.idle_timeout));
            }
            if running.model_name == model_name {
                tracing::warn!(model = model_name, "current engine unsuitable or unhealthy, replacing");
            }
            Self::stop_locked(&mut slot).await;
        }

        let variant_index = match (required.purpose, required.context_size_required) {
            (Purpose::ContextEstimation, 0) => model.smallest_variant_index(),
            _ => model
                .variant_for(required.context_size_required)
                .ok_or_else(|| {
                    ManagerError::NoSuitableVariant(model_name.to_string(), required.context_size_required)
                })?,
        };
        let variant = &model.variants[variant_index];

        let client: Arc<dyn EngineClient> = Arc::new(EngineHttp::new(
            variant.connect.clone(),
            Duration::from_secs_f64(variant.health_check_timeout),
            self.metrics.clone(),
        ));
        let mut process = EngineProcess::new(variant.binary.clone(), variant.args.clone(), None);
        process.start().await?;

        let startup_timeout = Duration::from_secs_f64(variant.engine_startup_timeout);
        let deadline = Instant::now() + startup_timeout;
        let ready = loop {
            if client.check_health().await {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            sleep(READINESS_POLL_INTERVAL).await;
        };

        if !ready {
            process.stop(STOP_GRACE).await;
            return Err(ManagerError::EngineNotReady(
                model_name.to_string(),
                variant.engine_startup_timeout,
            ));
        }

        let idle_timeout = Duration::from_secs_f64(variant.engine_idle_timeout);
        tracing::info!(model = model_name, variant_index, "engine started successfully");
        self.metrics.record_engine_start();
        *slot = Some(RunningEngine {
            model_name: model_name.to_string(),
            variant_index,
            process,
            client: client.clone(),
            idle_timeout,
            purpose: required.purpose,
            context_size_required: required.context_size_required,
        });

        Ok((client, idle_timeout))
    }

    fn can_reuse(
        &self,
        cur: &RunningEngine,
        model_name: &str,
        model: &crate::config::Model,
        req: EnsureRequired,
    ) -> bool {
        if cur.model_name != model_name {
            return false;
        }
        let variant = &model.variants[cur.variant_index];
        match req.purpose {
            Purpose::ContextEstimation => {
                cur.purpose == Purpose::ContextEstimation || variant.tokenize
            }
            Purpose::TextQuery => {
                matches!(cur.purpose, Purpose::TextQuery | Purpose::ContextEstimation)
                    && variant.context >= req.context_size_required
            }
        }
    }

    /// Idle timeout of the current slot, if any, without side effects.
    /// Used to rearm a tier's watchdog after a failed `ensure_engine` call
    /// that still left an earlier slot (e.g. from the estimation pass)
    /// running.
    pub async fn current_idle_timeout(&self) -> Option<Duration> {
        self.slot.lock().await.as_ref().map(|r| r.idle_timeout)
    }

    /// Stops the current slot, if any. Returns whether an engine was
    /// actually running and torn down.
    pub async fn stop_current_engine(&self) -> bool {
        let mut slot = self.slot.lock().await;
        Self::stop_locked(&mut slot).await
    }

    async fn stop_locked(slot: &mut Option<RunningEngine>) -> bool {
        if let Some(mut running) = slot.take() {
            tracing::info!(model = %running.model_name, "stopping current engine");
            running.process.stop(STOP_GRACE).await;
            true
        } else {
            false
        }
    }

    /// Irreversible: stops the current slot and marks the manager disposed.
    /// Subsequent `ensure_engine` calls fail with `ManagerShutdown`.
    pub async fn shutdown(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.stop_current_engine().await;
    }
}

// Silence unused-field warnings: these are part of the slot's recorded
// state even though only `variant_index` drives reuse today.
#[allow(dead_code)]
impl RunningEngine {
    fn context_size_required(&self) -> u32 {
        self.context_size_required
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LocalTokenizerSpec, Model, ServerConfig, Tier, Variant};

    fn variant(context: u32, tokenize: bool) -> Variant {
        Variant {
            binary: "/bin/true".to_string(),
            args: vec![],
            connect: "http://127.0.0.1:0".to_string(),
            context,
            tokenize,
            engine_startup_timeout: 0.05,
            health_check_timeout: 0.05,
            engine_idle_timeout: 60.0,
        }
    }

    fn test_manager(variants: Vec<Variant>) -> EngineManager {
        EngineManager::new(cfg_with(variants), Arc::new(Metrics::default()))
    }

    fn cfg_with(variants: Vec<Variant>) -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                listen_v4: "127.0.0.1:0".to_string(),
                listen_v6: "none".to_string(),
                dumps_dir: None,
                clear_dumps_on_start: false,
                log_format: "text".to_string(),
            },
            models: vec![Model {
                name: "alpha".to_string(),
                tier: Tier::Primary,
                engine_kind: "llama.cpp".to_string(),
                local_tokenizer: Some(LocalTokenizerSpec {
                    binary: "/bin/true".to_string(),
                    args: vec![],
                    add_tokens_per_message: 0,
                }),
                variants,
            }],
        })
    }

    #[tokio::test]
    async fn unknown_model_errors() {
        let manager = test_manager(vec![variant(4096, false)]);
        let err = manager
            .ensure_engine(
                "nope",
                EnsureRequired {
                    purpose: Purpose::TextQuery,
                    context_size_required: 100,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::UnknownModel(_)));
    }

    #[tokio::test]
    async fn no_suitable_variant_errors() {
        let manager = test_manager(vec![variant(4096, false)]);
        let err = manager
            .ensure_engine(
                "alpha",
                EnsureRequired {
                    purpose: Purpose::TextQuery,
                    context_size_required: 999_999,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NoSuitableVariant(_, _)));
    }

    #[tokio::test]
    async fn shutdown_then_ensure_fails() {
        let manager = test_manager(vec![variant(4096, false)]);
        manager.shutdown().await;
        let err = manager
            .ensure_engine(
                "alpha",
                EnsureRequired {
                    purpose: Purpose::TextQuery,
                    context_size_required: 10,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::ManagerShutdown));
    }

    #[tokio::test]
    async fn engine_not_ready_stops_process_and_fails() {
        // binary exists (/bin/true) but exits immediately, so /health never answers.
        let manager = test_manager(vec![variant(4096, false)]);
        let err = manager
            .ensure_engine(
                "alpha",
                EnsureRequired {
                    purpose: Purpose::TextQuery,
                    context_size_required: 10,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::EngineNotReady(_, _)));
    }

}
