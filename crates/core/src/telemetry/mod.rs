pub mod span;
pub mod tracer;

pub use span::{
    build_otlp_request, to_otlp_span, OtlpAttribute, OtlpExportRequest, OtlpResource, OtlpResourceSpans, OtlpScope,
    OtlpScopeSpans, OtlpSpan, OtlpStatus, SpanLog, SpanStatus, TraceSpan,
};
pub use tracer::{build_exporter, ConsoleExporter, JaegerExporter, OtlpAuth, OtlpExporter, SpanExporter, Tracer, ZipkinExporter};
