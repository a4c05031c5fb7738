//! Tracing setup for the risk core.
//!
//! [`init_tracing`] installs the global subscriber in one of two formats:
//! - [`LogFormat::Json`]: one JSON object per event with nanosecond UTC
//!   timestamps. Every risk transition carries `tenant_id` and entity fields,
//!   so an audit trail can be rebuilt from the log stream alone.
//! - [`LogFormat::Pretty`]: single-line text output for local work.
//!
//! Filtering follows `RUST_LOG` (e.g., `RUST_LOG=tg_risk=debug,tg_oms=trace`)
//! and falls back to the supplied default directive.
//!
//! Fields that look like operator tokens or exchange secrets are written as
//! `[REDACTED]` in both formats. [`CredentialGuard`] also warns with the
//! offending field name, so the call site can be fixed.

use std::fmt;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Subscriber};
use tracing_subscriber::field::RecordFields;
use tracing_subscriber::fmt::format::{FmtSpan, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Written in place of a credential.
pub const REDACTED: &str = "[REDACTED]";

/// Output format for the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON, for production.
    Json,
    /// Human-readable, for development.
    Pretty,
}

impl LogFormat {
    /// `Json` when `json` is set, `Pretty` otherwise.
    pub fn from_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Install the global tracing subscriber.
///
/// Returns an error instead of panicking when a subscriber is already set,
/// which happens when several tests in one binary initialise logging.
///
/// # Examples
///
/// ```
/// use tg_core::logging::{init_tracing, LogFormat};
/// let _ = init_tracing(LogFormat::Pretty, "info");
/// ```
pub fn init_tracing(format: LogFormat, default_directive: &str) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(CredentialGuard)
        .with(fmt_layer(format, std::io::stdout))
        .try_init()?;
    Ok(())
}

/// Output layer for `format` writing to `writer`. Event and span fields go
/// through [`RedactedFields`]; JSON lines are built by [`RedactedJson`].
pub fn fmt_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_span_events(FmtSpan::CLOSE)
        .fmt_fields(RedactedFields);
    match format {
        LogFormat::Json => layer.event_format(RedactedJson).boxed(),
        LogFormat::Pretty => layer.with_timer(UtcNanos).with_target(true).boxed(),
    }
}

/// RFC 3339 timestamps with nanosecond precision.
#[derive(Debug, Clone, Copy)]
struct UtcNanos;

impl UtcNanos {
    fn now() -> String {
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
    }
}

impl tracing_subscriber::fmt::time::FormatTime for UtcNanos {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        w.write_str(&Self::now())
    }
}

/// Field names that always carry credentials.
const CREDENTIAL_FIELDS: &[&str] = &[
    "token",
    "auth_token",
    "operator_token",
    "api_key",
    "api_secret",
    "secret",
    "password",
    "signature",
    "private_key",
];

/// Returns `true` if a field with this name must never be logged.
pub fn is_credential_field(name: &str) -> bool {
    CREDENTIAL_FIELDS.contains(&name)
}

/// Heuristic for opaque high-entropy values (API keys, bearer tokens).
///
/// Flags 32+ character base64-alphabet strings and 40+ character hex strings.
/// Ordinary log prose contains spaces or punctuation and never matches.
pub fn looks_like_credential(value: &str) -> bool {
    if value.len() < 32 {
        return false;
    }
    let base64_alphabet = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_'));
    if !base64_alphabet {
        return false;
    }
    let has_digit = value.chars().any(|c| c.is_ascii_digit());
    let has_alpha = value.chars().any(|c| c.is_ascii_alphabetic());
    (has_digit && has_alpha)
        || (value.len() >= 40 && value.chars().all(|c| c.is_ascii_hexdigit()))
}

fn must_redact(name: &str, rendered: &str) -> bool {
    is_credential_field(name) || (name != "message" && looks_like_credential(rendered.trim_matches('"')))
}

/// Text field formatter that writes credentials as [`REDACTED`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RedactedFields;

impl<'writer> FormatFields<'writer> for RedactedFields {
    fn format_fields<R: RecordFields>(&self, writer: Writer<'writer>, fields: R) -> fmt::Result {
        let mut text = TextFields {
            writer,
            empty: true,
            result: Ok(()),
        };
        fields.record(&mut text);
        text.result
    }
}

struct TextFields<'w> {
    writer: Writer<'w>,
    empty: bool,
    result: fmt::Result,
}

impl TextFields<'_> {
    fn write(&mut self, field: &Field, value: &dyn fmt::Display) {
        if self.result.is_err() {
            return;
        }
        let sep = if self.empty { "" } else { " " };
        self.empty = false;
        self.result = if field.name() == "message" {
            write!(self.writer, "{}{}", sep, value)
        } else {
            write!(self.writer, "{}{}={}", sep, field.name(), value)
        };
    }
}

impl Visit for TextFields<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if must_redact(field.name(), value) {
            self.write(field, &REDACTED);
        } else {
            self.write(field, &format_args!("{:?}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        if must_redact(field.name(), &rendered) {
            self.write(field, &REDACTED);
        } else {
            self.write(field, &rendered);
        }
    }
}

/// One JSON object per event with `timestamp`, `level`, `target`,
/// `threadId`, `fields` and the enclosing `spans`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedactedJson;

impl<S, N> FormatEvent<S, N> for RedactedJson
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let meta = event.metadata();
        let mut fields = JsonFields::default();
        event.record(&mut fields);

        let mut line = Map::new();
        line.insert("timestamp".into(), Value::String(UtcNanos::now()));
        line.insert("level".into(), Value::String(meta.level().to_string()));
        line.insert("target".into(), Value::String(meta.target().to_string()));
        line.insert(
            "threadId".into(),
            Value::String(format!("{:?}", std::thread::current().id())),
        );
        line.insert("fields".into(), Value::Object(fields.0));

        if let Some(scope) = ctx.event_scope() {
            let spans = scope
                .from_root()
                .map(|span| {
                    let mut entry = Map::new();
                    entry.insert("name".into(), Value::String(span.name().to_string()));
                    let ext = span.extensions();
                    if let Some(formatted) = ext.get::<FormattedFields<N>>() {
                        if !formatted.fields.is_empty() {
                            entry.insert("fields".into(), Value::String(formatted.fields.clone()));
                        }
                    }
                    Value::Object(entry)
                })
                .collect();
            line.insert("spans".into(), Value::Array(spans));
        }
        writeln!(writer, "{}", Value::Object(line))
    }
}

#[derive(Default)]
struct JsonFields(Map<String, Value>);

impl JsonFields {
    fn put(&mut self, field: &Field, value: Value) {
        let value = if is_credential_field(field.name()) {
            Value::String(REDACTED.to_string())
        } else {
            value
        };
        self.0.insert(field.name().to_string(), value);
    }

    fn put_text(&mut self, field: &Field, text: &str) {
        let text = if must_redact(field.name(), text) { REDACTED } else { text };
        self.0.insert(field.name().to_string(), Value::String(text.to_string()));
    }
}

impl Visit for JsonFields {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.put(field, value);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_text(field, value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put_text(field, &format!("{:?}", value));
    }
}

/// Layer that warns whenever a span or event records a credential-like field.
/// The value itself is redacted by the output formatters.
#[derive(Debug, Clone, Copy)]
pub struct CredentialGuard;

impl<S> Layer<S> for CredentialGuard
where
    S: tracing::Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(
        &self,
        attrs: &span::Attributes<'_>,
        _id: &span::Id,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut scan = CredentialScan::default();
        attrs.record(&mut scan);
        if let Some(field) = scan.offending {
            tracing::warn!(field, "credential-like value recorded on a span");
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // The warning below is itself an event; skip our own output.
        if event.metadata().target() == module_path!() {
            return;
        }
        let mut scan = CredentialScan::default();
        event.record(&mut scan);
        if let Some(field) = scan.offending {
            tracing::warn!(field, "credential-like value recorded on an event");
        }
    }
}

#[derive(Default)]
struct CredentialScan {
    offending: Option<&'static str>,
}

impl Visit for CredentialScan {
    fn record_debug(&mut self, field: &Field, _value: &dyn fmt::Debug) {
        if is_credential_field(field.name()) {
            self.offending = Some(field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if is_credential_field(field.name()) || looks_like_credential(value) {
            self.offending = Some(field.name());
        }
    }
}
