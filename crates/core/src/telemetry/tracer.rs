//! Tracer (§4.13): creates spans around pipeline stages, batches finished
//! spans, and exports them to one of console/Jaeger/Zipkin/OTLP.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::TracerConfig;
use crate::error::Result;
use crate::telemetry::span::{build_otlp_request, SpanStatus, TraceSpan};
use crate::Error;

/// Export destination a finished batch of spans is flushed to.
#[async_trait::async_trait]
pub trait SpanExporter: Send + Sync {
    async fn export(&self, spans: &[TraceSpan]) -> Result<()>;
}

/// Prints one line per span; useful for local development.
pub struct ConsoleExporter;

#[async_trait::async_trait]
impl SpanExporter for ConsoleExporter {
    async fn export(&self, spans: &[TraceSpan]) -> Result<()> {
        for span in spans {
            tracing::info!(
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                operation = %span.operation_name,
                status = ?span.status,
                "span finished"
            );
        }
        Ok(())
    }
}

/// Jaeger's Thrift-over-HTTP collector accepts a JSON-ish batch shape on
/// its `/api/traces` endpoint in recent versions; this exporter posts that
/// shape directly rather than depending on a dedicated Jaeger client crate.
pub struct JaegerExporter {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl JaegerExporter {
    pub fn new(endpoint: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            service_name: service_name.into(),
        }
    }
}

#[derive(serde::Serialize)]
struct JaegerBatch<'a> {
    process: JaegerProcess<'a>,
    spans: Vec<JaegerSpan<'a>>,
}

#[derive(serde::Serialize)]
struct JaegerProcess<'a> {
    #[serde(rename = "serviceName")]
    service_name: &'a str,
}

#[derive(serde::Serialize)]
struct JaegerSpan<'a> {
    #[serde(rename = "traceID")]
    trace_id: &'a str,
    #[serde(rename = "spanID")]
    span_id: &'a str,
    #[serde(rename = "operationName")]
    operation_name: &'a str,
    #[serde(rename = "startTime")]
    start_time: u64,
    duration: u64,
}

#[async_trait::async_trait]
impl SpanExporter for JaegerExporter {
    async fn export(&self, spans: &[TraceSpan]) -> Result<()> {
        let batch = JaegerBatch {
            process: JaegerProcess {
                service_name: &self.service_name,
            },
            spans: spans
                .iter()
                .map(|s| JaegerSpan {
                    trace_id: &s.trace_id,
                    span_id: &s.span_id,
                    operation_name: &s.operation_name,
                    start_time: s.start_unix_ns / 1_000,
                    duration: s.end_unix_ns.unwrap_or(s.start_unix_ns).saturating_sub(s.start_unix_ns) / 1_000,
                })
                .collect(),
        };

        self.client
            .post(format!("{}/api/traces", self.endpoint))
            .json(&batch)
            .send()
            .await
            .map_err(|e| Error::transient_storage(format!("jaeger export failed: {}", e)))?;
        Ok(())
    }
}

/// Zipkin's v2 JSON span format, posted to `/api/v2/spans`.
pub struct ZipkinExporter {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl ZipkinExporter {
    pub fn new(endpoint: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            service_name: service_name.into(),
        }
    }
}

#[derive(serde::Serialize)]
struct ZipkinSpan<'a> {
    #[serde(rename = "traceId")]
    trace_id: &'a str,
    id: &'a str,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    name: &'a str,
    timestamp: u64,
    duration: u64,
    #[serde(rename = "localEndpoint")]
    local_endpoint: ZipkinEndpoint<'a>,
}

#[derive(serde::Serialize)]
struct ZipkinEndpoint<'a> {
    #[serde(rename = "serviceName")]
    service_name: &'a str,
}

#[async_trait::async_trait]
impl SpanExporter for ZipkinExporter {
    async fn export(&self, spans: &[TraceSpan]) -> Result<()> {
        let batch: Vec<ZipkinSpan> = spans
            .iter()
            .map(|s| ZipkinSpan {
                trace_id: &s.trace_id,
                id: &s.span_id,
                parent_id: s.parent_span_id.as_deref(),
                name: &s.operation_name,
                timestamp: s.start_unix_ns / 1_000,
                duration: s.end_unix_ns.unwrap_or(s.start_unix_ns).saturating_sub(s.start_unix_ns) / 1_000,
                local_endpoint: ZipkinEndpoint {
                    service_name: &self.service_name,
                },
            })
            .collect();

        self.client
            .post(format!("{}/api/v2/spans", self.endpoint))
            .json(&batch)
            .send()
            .await
            .map_err(|e| Error::transient_storage(format!("zipkin export failed: {}", e)))?;
        Ok(())
    }
}

/// Authentication attached to the OTLP HTTP request, resolved out-of-band
/// from `OTLP_API_KEY` (bearer token) or `OTLP_AUTH_HEADER` (a raw
/// `"Name: value"` header) per §6's Environment Inputs.
#[derive(Debug, Clone, Default)]
pub struct OtlpAuth {
    pub bearer_token: Option<String>,
    pub custom_header: Option<(String, String)>,
}

impl OtlpAuth {
    /// Reads `OTLP_API_KEY` and `OTLP_AUTH_HEADER` from the process
    /// environment. Either or both may be unset, in which case the export
    /// request simply carries no authentication, per §6: unset secrets
    /// disable the corresponding feature rather than failing start-up.
    pub fn from_env() -> Self {
        let bearer_token = std::env::var("OTLP_API_KEY").ok();
        let custom_header = std::env::var("OTLP_AUTH_HEADER").ok().and_then(|raw| {
            let (name, value) = raw.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        });
        Self { bearer_token, custom_header }
    }
}

/// OTLP/HTTP JSON exporter (§6). Retries up to `max_retries` times with
/// exponential backoff, honoring `Retry-After` on 429; any other 4xx is
/// treated as non-retryable.
pub struct OtlpExporter {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
    compress_above_bytes: usize,
    max_retries: u32,
    auth: OtlpAuth,
}

impl OtlpExporter {
    pub fn new(endpoint: impl Into<String>, service_name: impl Into<String>, compress_above_bytes: usize, max_retries: u32, auth: OtlpAuth) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            service_name: service_name.into(),
            compress_above_bytes,
            max_retries,
            auth,
        }
    }

    fn apply_auth(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some((name, value)) = &self.auth.custom_header {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn send_once(&self, body: Vec<u8>, compressed: bool) -> Result<reqwest::Response> {
        let mut builder = self.client.post(&self.endpoint).header("Content-Type", "application/json");
        if compressed {
            builder = builder.header("Content-Encoding", "gzip");
        }
        builder = self.apply_auth(builder);

        builder
            .body(body)
            .send()
            .await
            .map_err(|e| Error::transient_storage(format!("otlp export request failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl SpanExporter for OtlpExporter {
    async fn export(&self, spans: &[TraceSpan]) -> Result<()> {
        let request = build_otlp_request(spans, &self.service_name);
        let json = serde_json::to_vec(&request)?;

        let (body, compressed) = if json.len() > self.compress_above_bytes {
            use std::io::Write;
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(&json)
                .map_err(|e| Error::internal(format!("failed to compress otlp payload: {}", e)))?;
            (
                encoder
                    .finish()
                    .map_err(|e| Error::internal(format!("failed to finish otlp compression: {}", e)))?,
                true,
            )
        } else {
            (json, false)
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self.send_once(body.clone(), compressed).await?;
            let status = response.status();

            if status.is_success() {
                return Ok(());
            }

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);

                if attempt > self.max_retries {
                    return Err(Error::transient_storage("otlp export exhausted retries after 429"));
                }
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            if status.is_client_error() {
                return Err(Error::new(
                    crate::error::ErrorCode::ValidationFailed,
                    format!("otlp collector rejected export: {}", status),
                ));
            }

            if attempt > self.max_retries {
                return Err(Error::transient_storage(format!("otlp export failed after retries: {}", status)));
            }
            let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(6)));
            tokio::time::sleep(backoff).await;
        }
    }
}

struct BatchState {
    spans: Vec<TraceSpan>,
    last_flush: Instant,
}

/// Owns the in-flight span batch and flushes it to the configured
/// [`SpanExporter`] when it reaches `batch_size` spans or `batch_timeout`
/// elapses, whichever comes first.
pub struct Tracer {
    config: TracerConfig,
    exporter: Arc<dyn SpanExporter>,
    batch: Mutex<BatchState>,
}

impl Tracer {
    pub fn new(config: TracerConfig, exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            batch: Mutex::new(BatchState {
                spans: Vec::with_capacity(config.batch_size),
                last_flush: Instant::now(),
            }),
            config,
            exporter,
        }
    }

    pub fn start_span(&self, operation_name: impl Into<String>) -> TraceSpan {
        TraceSpan::start_root(operation_name)
    }

    pub fn start_child_span(&self, parent: &TraceSpan, operation_name: impl Into<String>) -> TraceSpan {
        TraceSpan::start_child(parent.trace_id.clone(), parent.span_id.clone(), operation_name)
    }

    /// Records a finished span into the batch and flushes if the batch is
    /// now full or old enough. Call [`Self::finish_span`] rather than
    /// pushing a half-finished span directly.
    pub async fn finish_span(&self, mut span: TraceSpan, status: SpanStatus) -> Result<()> {
        if !span.is_finished() {
            span.finish(status);
        }

        let should_flush = {
            let mut batch = self.batch.lock().await;
            batch.spans.push(span);
            batch.spans.len() >= self.config.batch_size
                || batch.last_flush.elapsed() >= Duration::from_millis(self.config.batch_timeout_ms)
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let spans = {
            let mut batch = self.batch.lock().await;
            if batch.spans.is_empty() {
                return Ok(());
            }
            let spans = std::mem::take(&mut batch.spans);
            batch.last_flush = Instant::now();
            spans
        };

        self.exporter.export(&spans).await
    }

    /// Runs [`Self::flush`] on `batch_timeout_ms` intervals so spans for a
    /// slow trickle of traffic aren't held indefinitely below `batch_size`.
    pub fn spawn_periodic_flush(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.batch_timeout_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.flush().await {
                    tracing::warn!(error = %err, "periodic span flush failed");
                }
            }
        })
    }
}

/// Builds the exporter named by `config.exporter` ("console", "jaeger",
/// "zipkin", "otlp"). Falls back to [`ConsoleExporter`] for an unrecognized
/// name rather than failing construction.
pub fn build_exporter(config: &TracerConfig, service_name: &str) -> Arc<dyn SpanExporter> {
    match config.exporter.as_str() {
        "jaeger" => Arc::new(JaegerExporter::new(
            config.otlp_endpoint.clone().unwrap_or_default(),
            service_name,
        )),
        "zipkin" => Arc::new(ZipkinExporter::new(
            config.otlp_endpoint.clone().unwrap_or_default(),
            service_name,
        )),
        "otlp" => Arc::new(OtlpExporter::new(
            config.otlp_endpoint.clone().unwrap_or_default(),
            service_name,
            config.compress_above_bytes,
            config.max_export_retries,
            OtlpAuth::from_env(),
        )),
        _ => Arc::new(ConsoleExporter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExporter {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SpanExporter for CountingExporter {
        async fn export(&self, _spans: &[TraceSpan]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn flushes_automatically_once_batch_size_is_reached() {
        let exporter = Arc::new(CountingExporter { calls: AtomicUsize::new(0) });
        let config = TracerConfig {
            batch_size: 2,
            batch_timeout_ms: 60_000,
            ..TracerConfig::default()
        };
        let tracer = Tracer::new(config, exporter.clone());

        tracer.finish_span(tracer.start_span("a"), SpanStatus::Ok).await.unwrap();
        assert_eq!(exporter.calls.load(Ordering::SeqCst), 0);
        tracer.finish_span(tracer.start_span("b"), SpanStatus::Ok).await.unwrap();
        assert_eq!(exporter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_flush_is_a_no_op_on_an_empty_batch() {
        let exporter = Arc::new(CountingExporter { calls: AtomicUsize::new(0) });
        let tracer = Tracer::new(TracerConfig::default(), exporter.clone());
        tracer.flush().await.unwrap();
        assert_eq!(exporter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unrecognized_exporter_name_falls_back_to_console() {
        let config = TracerConfig {
            exporter: "carrier-pigeon".to_string(),
            ..TracerConfig::default()
        };
        let _exporter = build_exporter(&config, "audit-pipeline");
    }
}
