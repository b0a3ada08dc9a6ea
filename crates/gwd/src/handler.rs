use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use gwcore::{Config, EngineClient, EngineManager, GatewayError, Metrics, ModelSelector, Tier};

use crate::dump::DumpWriter;

const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": err.error_type(),
            "param": Value::Null,
            "code": Value::Null,
        }
    });
    (status, Json(body)).into_response()
}

/// Coordinates one request end to end: model lookup, variant selection,
/// forwarding, streaming/non-streaming response assembly, disconnect
/// cancellation, and idle watchdog rearm.
pub struct RequestHandler {
    config: Arc<Config>,
    primary: Arc<EngineManager>,
    secondary: Arc<EngineManager>,
    primary_watchdog: Mutex<gwcore::IdleWatchdog>,
    secondary_watchdog: Mutex<gwcore::IdleWatchdog>,
    request_lock: Mutex<()>,
    stopped: AtomicBool,
    disposed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl RequestHandler {
    pub fn new(
        config: Arc<Config>,
        primary: Arc<EngineManager>,
        secondary: Arc<EngineManager>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            primary,
            secondary,
            primary_watchdog: Mutex::new(gwcore::IdleWatchdog::new()),
            secondary_watchdog: Mutex::new(gwcore::IdleWatchdog::new()),
            request_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            metrics,
        })
    }

    fn is_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst)
    }

    /// Whether `stop()` or `shutdown()` has been called. Used by `/healthz`
    /// to report liveness independent of engine state.
    pub fn is_stopped(&self) -> bool {
        self.is_down()
    }

    fn manager_for(&self, tier: Tier) -> &Arc<EngineManager> {
        match tier {
            Tier::Primary => &self.primary,
            Tier::Secondary => &self.secondary,
        }
    }

    pub fn list_models(&self) -> Vec<String> {
        self.config.models.iter().map(|m| m.name.clone()).collect()
    }

    pub async fn models_response(&self) -> Response {
        if self.is_down() {
            return error_response(&GatewayError::ManagerShutdown);
        }
        let data: Vec<Value> = self
            .list_models()
            .into_iter()
            .map(|id| json!({"id": id, "object": "model", "created": 0, "owned_by": "system"}))
            .collect();
        (StatusCode::OK, Json(json!({"object": "list", "data": data}))).into_response()
    }

    pub async fn handle_request(self: &Arc<Self>, path: &str, raw_body: Bytes) -> Response {
        if self.is_down() {
            return error_response(&GatewayError::ManagerShutdown);
        }

        let _request_guard = self.request_lock.lock().await;
        if self.is_down() {
            return error_response(&GatewayError::ManagerShutdown);
        }

        let dumps_dir = self.config.server.dumps_dir.clone();
        let request_text = String::from_utf8_lossy(&raw_body).into_owned();

        let body: Value = match serde_json::from_str(&request_text) {
            Ok(v) => v,
            Err(e) => {
                let err = GatewayError::ClientError(format!("invalid JSON in request body: {e}"));
                if let Some(dir) = &dumps_dir {
                    let mut dw = DumpWriter::new(dir, Some("request_parse_error"));
                    dw.write_request(&request_text);
                    dw.write_error(&e);
                }
                return error_response(&err);
            }
        };

        let model_name = match body.get("model").and_then(|v| v.as_str()) {
            Some(name) => name.to_string(),
            None => {
                let err = GatewayError::ClientError("missing required field: 'model'".to_string());
                if let Some(dir) = &dumps_dir {
                    let mut dw = DumpWriter::new(dir, Some("model_missing_error"));
                    dw.write_request(&request_text);
                    return_with_dump_error(&mut dw, &err);
                }
                return error_response(&err);
            }
        };

        let model = match self.config.model(&model_name) {
            Some(m) => m,
            None => return error_response(&GatewayError::ClientError(format!("model '{model_name}' not found in configuration"))),
        };
        let tier = model.tier;

        self.disarm(tier).await;

        let mut dump_writer = dumps_dir.map(|dir| DumpWriter::new(&dir, Some(model_name.as_str())));
        if let Some(dw) = dump_writer.as_mut() {
            let formatted = serde_json::to_string_pretty(&body).unwrap_or_else(|_| request_text.clone());
            dw.write_request(&formatted);
        }

        let tier_manager = self.manager_for(tier).clone();
        let (client, idle_timeout) = match ModelSelector::select_variant(&tier_manager, path, &model_name, &body).await {
            Ok(pair) => pair,
            Err(e) => {
                let err = GatewayError::from(e);
                if let Some(dw) = dump_writer.as_mut() {
                    return_with_dump_error(dw, &err);
                }
                // Selection may have left an earlier slot (e.g. from the
                // context-estimation pass) running; rearm its watchdog so
                // it still expires on idle even though this request failed.
                if let Some(t) = tier_manager.current_idle_timeout().await {
                    self.rearm(tier, t).await;
                }
                return error_response(&err);
            }
        };

        let cancel_token = CancellationToken::new();
        let monitor_token = cancel_token.clone();
        let monitor_client = client.clone();
        let forward_done = Arc::new(AtomicBool::new(false));
        let monitor_forward_done = forward_done.clone();
        let monitor_metrics = self.metrics.clone();
        let monitor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(DISCONNECT_POLL_INTERVAL) => {}
                    _ = monitor_token.cancelled() => {
                        monitor_client.terminate_request();
                        // Cancellation also fires on ordinary completion
                        // (below); only count it as a disconnect if the
                        // forward call hadn't already returned.
                        if !monitor_forward_done.load(Ordering::SeqCst) {
                            monitor_metrics.record_client_disconnect();
                        }
                        break;
                    }
                }
            }
        });
        // Cancelled the instant this request's future is dropped by the
        // server on client disconnect -- hyper doesn't expose a pollable
        // "is client still connected" flag the way aiohttp's transport
        // does, so we substitute Tokio's own cancellation-on-drop.
        let _disconnect_guard = cancel_token.clone().drop_guard();

        let forward_result = client.forward_request(path, &body).await;
        forward_done.store(true, Ordering::SeqCst);
        cancel_token.cancel();
        let _ = monitor.await;

        let response = match forward_result {
            Ok(resp) => resp,
            Err(e) => {
                if let Some(dw) = dump_writer.as_mut() {
                    return_with_dump_error(dw, &e);
                }
                self.rearm(tier, idle_timeout).await;
                return error_response(&e);
            }
        };

        let is_streaming = response.content_type.contains("text/event-stream")
            || body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = response.content_type.clone();

        let out = if is_streaming {
            if let Some(dw) = dump_writer.as_mut() {
                dw.write_response_start();
            }
            let mut upstream = response.inner.bytes_stream();
            let mut dw_for_task = dump_writer.take();
            let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(64);
            tokio::spawn(async move {
                while let Some(item) = upstream.next().await {
                    match item {
                        Ok(chunk) => {
                            if let Some(dw) = dw_for_task.as_mut() {
                                dw.write_response_chunk(&chunk);
                            }
                            if tx.send(Ok(chunk)).await.is_err() {
                                // Client disconnected mid-stream; stop copying but
                                // leave the engine call alone unless the monitor's
                                // own cancellation already fired.
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "error reading upstream stream");
                            break;
                        }
                    }
                }
                if let Some(dw) = dw_for_task.as_mut() {
                    dw.write_response_end();
                }
            });
            Response::builder()
                .status(status)
                .header(axum::http::header::CONTENT_TYPE, content_type)
                .body(Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx)))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        } else {
            let bytes = response.inner.bytes().await.unwrap_or_default();
            if let Some(dw) = dump_writer.as_mut() {
                let text = String::from_utf8_lossy(&bytes);
                match serde_json::from_str::<Value>(&text) {
                    Ok(v) => {
                        let formatted = serde_json::to_string_pretty(&v).unwrap_or_else(|_| text.into_owned());
                        dw.write_response(&formatted);
                    }
                    Err(_) => dw.write_response(&text),
                }
            }
            Response::builder()
                .status(status)
                .header(axum::http::header::CONTENT_TYPE, content_type)
                .body(Body::from(bytes))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        };

        self.rearm(tier, idle_timeout).await;
        out
    }

    async fn disarm(&self, tier: Tier) {
        match tier {
            Tier::Primary => self.primary_watchdog.lock().await.disarm(),
            Tier::Secondary => self.secondary_watchdog.lock().await.disarm(),
        }
    }

    async fn rearm(self: &Arc<Self>, tier: Tier, idle_timeout: Duration) {
        let handler = self.clone();
        match tier {
            Tier::Primary => {
                self.primary_watchdog.lock().await.rearm(idle_timeout, move || {
                    let handler = handler.clone();
                    async move { handler.handle_idle_timeout(Tier::Primary).await }
                });
            }
            Tier::Secondary => {
                self.secondary_watchdog.lock().await.rearm(idle_timeout, move || {
                    let handler = handler.clone();
                    async move { handler.handle_idle_timeout(Tier::Secondary).await }
                });
            }
        }
    }

    pub async fn handle_idle_timeout(&self, tier: Tier) {
        if self.is_down() {
            return;
        }
        let _idle_guard = match tier {
            Tier::Primary => self.primary_watchdog.lock().await,
            Tier::Secondary => self.secondary_watchdog.lock().await,
        };
        if self.is_down() {
            return;
        }
        if self.manager_for(tier).stop_current_engine().await {
            self.metrics.record_idle_stop();
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub async fn shutdown(&self) {
        let _guard = self.request_lock.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.disposed.store(true, Ordering::SeqCst);
        self.primary_watchdog.lock().await.disarm();
        self.secondary_watchdog.lock().await.disarm();
        self.primary.shutdown().await;
        self.secondary.shutdown().await;
    }
}

fn return_with_dump_error(dw: &mut DumpWriter, err: &GatewayError) {
    dw.write_error(err);
}
