//! Synthetic adapter harness for tests.
//!
//! Plays back a script of outcomes (replies, chunk sequences, failures,
//! hangs) and counts invocations, so pipeline and router behavior can be
//! asserted without any network. Kept in the library proper because
//! integration tests in other crates drive it.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{EmbeddingResponse, FinishReason, StreamFrame, Usage};

use crate::{Adapter, AdapterContext, AdapterResponse, HealthStatus};

/// One scripted call outcome.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Succeed with the given text.
    Reply { text: String, usage: Usage },
    /// Stream the given deltas, then a terminal frame with usage.
    Chunks { deltas: Vec<String>, usage: Usage },
    /// Stream some deltas, then cut the stream with an error.
    ChunksThenError { deltas: Vec<String> },
    /// Fail with the given error.
    Fail(GatewayError),
    /// Never answer (for timeout tests).
    Hang,
}

/// A scriptable fake provider.
pub struct ScriptedAdapter {
    id: String,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    /// Played when the script runs dry.
    fallback: ScriptedOutcome,
    invoke_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    cost_per_request: f64,
}

impl ScriptedAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: ScriptedOutcome::Reply {
                text: "ok".into(),
                usage: Usage::new(1, 1),
            },
            invoke_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            cost_per_request: 0.001,
        }
    }

    /// An adapter that always succeeds with `text`.
    pub fn always_ok(id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut adapter = Self::new(id);
        adapter.fallback = ScriptedOutcome::Reply {
            text: text.into(),
            usage: Usage::new(2, 3),
        };
        adapter
    }

    /// An adapter that always fails with `err`.
    pub fn always_fail(id: impl Into<String>, err: GatewayError) -> Self {
        let mut adapter = Self::new(id);
        adapter.fallback = ScriptedOutcome::Fail(err);
        adapter
    }

    /// Queue the next outcome.
    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    pub fn invoke_calls(&self) -> usize {
        self.invoke_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.invoke_calls() + self.stream_calls()
    }

    fn next_outcome(&self) -> ScriptedOutcome {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        _request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<AdapterResponse> {
        self.invoke_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_outcome() {
            ScriptedOutcome::Reply { text, usage } => Ok(AdapterResponse {
                text,
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                usage,
                model: ctx.model.clone(),
                notes: Vec::new(),
            }),
            ScriptedOutcome::Chunks { deltas, usage } => Ok(AdapterResponse {
                text: deltas.concat(),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                usage,
                model: ctx.model.clone(),
                notes: Vec::new(),
            }),
            ScriptedOutcome::ChunksThenError { .. } => Err(GatewayError::UpstreamProtocol {
                provider: self.id.clone(),
                message: "scripted mid-call failure".into(),
            }),
            ScriptedOutcome::Fail(err) => Err(err),
            ScriptedOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                unreachable!()
            }
        }
    }

    async fn stream(
        &self,
        _request: &InferenceRequest,
        _ctx: &AdapterContext,
    ) -> Result<mpsc::Receiver<Result<StreamFrame>>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        let id = self.id.clone();

        match outcome {
            ScriptedOutcome::Fail(err) => Err(err),
            ScriptedOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                unreachable!()
            }
            ScriptedOutcome::Reply { text, usage } => {
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    let _ = tx.send(Ok(StreamFrame::delta(text))).await;
                    let _ = tx
                        .send(Ok(StreamFrame::terminal(FinishReason::Stop, Some(usage))))
                        .await;
                });
                Ok(rx)
            }
            ScriptedOutcome::Chunks { deltas, usage } => {
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    for delta in deltas {
                        if tx.send(Ok(StreamFrame::delta(delta))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx
                        .send(Ok(StreamFrame::terminal(FinishReason::Stop, Some(usage))))
                        .await;
                });
                Ok(rx)
            }
            ScriptedOutcome::ChunksThenError { deltas } => {
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    for delta in deltas {
                        if tx.send(Ok(StreamFrame::delta(delta))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx
                        .send(Err(GatewayError::UpstreamProtocol {
                            provider: id,
                            message: "scripted mid-stream failure".into(),
                        }))
                        .await;
                });
                Ok(rx)
            }
        }
    }

    async fn embed(&self, texts: &[String], _ctx: &AdapterContext) -> Result<EmbeddingResponse> {
        self.invoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbeddingResponse {
            embeddings: texts.iter().map(|t| vec![t.len() as f32, 0.5, -0.5]).collect(),
            model: "scripted-embed".into(),
            provider: self.id.clone(),
            usage: Usage::new(texts.len() as u32, 0),
        })
    }

    async fn health(&self) -> Result<HealthStatus> {
        Ok(HealthStatus {
            ok: true,
            latency_ms: 1,
            rate_remaining: None,
        })
    }

    fn estimate_cost(&self, _request: &InferenceRequest) -> f64 {
        self.cost_per_request
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InferenceRequest {
        InferenceRequest::from_prompt("hello")
    }

    #[tokio::test]
    async fn script_plays_in_order_then_fallback() {
        let adapter = ScriptedAdapter::always_ok("p", "fallback");
        adapter.push(ScriptedOutcome::Fail(GatewayError::ProviderUnavailable {
            provider: "p".into(),
            message: "503".into(),
        }));

        let ctx = AdapterContext::new("r", "m");
        assert!(adapter.invoke(&request(), &ctx).await.is_err());
        let ok = adapter.invoke(&request(), &ctx).await.unwrap();
        assert_eq!(ok.text, "fallback");
        assert_eq!(adapter.invoke_calls(), 2);
    }

    #[tokio::test]
    async fn chunks_stream_with_single_terminal_frame() {
        let adapter = ScriptedAdapter::new("p");
        adapter.push(ScriptedOutcome::Chunks {
            deltas: vec!["He".into(), "llo".into(), ", ".into(), "world".into()],
            usage: Usage::new(1, 4),
        });

        let mut rx = adapter
            .stream(&request(), &AdapterContext::new("r", "m"))
            .await
            .unwrap();

        let mut text = String::new();
        let mut terminals = 0;
        let mut frames = 0;
        while let Some(frame) = rx.recv().await {
            let frame = frame.unwrap();
            frames += 1;
            text.push_str(&frame.delta);
            if frame.is_terminal() {
                terminals += 1;
                assert_eq!(frame.usage.unwrap().total_tokens, 5);
            }
        }
        assert_eq!(frames, 5);
        assert_eq!(terminals, 1);
        assert_eq!(text, "Hello, world");
    }

    #[tokio::test]
    async fn mid_stream_error_surfaces_as_err_item() {
        let adapter = ScriptedAdapter::new("p");
        adapter.push(ScriptedOutcome::ChunksThenError {
            deltas: vec!["partial".into()],
        });

        let mut rx = adapter
            .stream(&request(), &AdapterContext::new("r", "m"))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
    }
}
