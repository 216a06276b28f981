//! `tracing_subscriber` layer that writes every event as a frame through a [`Handler`].
//!
//! Each span becomes a derived handler: a group named after the span holding the span's fields.
//! Events inside the span are written through it, so their fields nest under the span groups.

use crate::handler::Handler;
use crate::record::{Level, LogEvent, Origin};
use crate::value::Attr;
use chrono::Utc;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::{LookupSpan, SpanRef};

pub struct ProtoLayer<W> {
    handler: Handler<W>,
    /// Events that could not be encoded or written.
    pub dropped_events: Arc<AtomicU64>,
}

/// Handler derived for one span, kept in the span's extensions.
struct SpanHandler<W>(Handler<W>);

impl<W: Write + Send + 'static> ProtoLayer<W> {
    pub fn new(handler: Handler<W>) -> Self {
        ProtoLayer { handler, dropped_events: Arc::new(AtomicU64::new(0)) }
    }

    fn handler_for<S>(&self, span: Option<SpanRef<'_, S>>) -> Handler<W>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        span.and_then(|s| {
            let ext = s.extensions();
            ext.get::<SpanHandler<W>>().map(|h| h.0.clone())
        })
        .unwrap_or_else(|| self.handler.clone())
    }
}

pub fn map_level(level: &tracing::Level) -> Level {
    match *level {
        tracing::Level::ERROR => Level::Error,
        tracing::Level::WARN => Level::Warn,
        tracing::Level::INFO => Level::Info,
        _ => Level::Debug,
    }
}

impl<S, W> Layer<S> for ProtoLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: Write + Send + 'static,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = Vec::new();
        attrs.record(&mut FieldVisitor { attrs: &mut fields, message: None });
        let handler = self.handler_for(span.parent()).with_group(span.name()).with_attrs(fields);
        span.extensions_mut().insert(SpanHandler(handler));
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = Vec::new();
        values.record(&mut FieldVisitor { attrs: &mut fields, message: None });
        let mut ext = span.extensions_mut();
        if let Some(SpanHandler(h)) = ext.get_mut::<SpanHandler<W>>() {
            *h = h.with_attrs(fields);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        let level = map_level(meta.level());
        if !self.handler.enabled(level) {
            return;
        }
        let mut attrs = Vec::new();
        let mut message = None;
        event.record(&mut FieldVisitor { attrs: &mut attrs, message: Some(&mut message) });

        let log_event = LogEvent {
            time: Some(Utc::now()),
            level,
            message: message.unwrap_or_default(),
            attrs,
            origin: meta.file().zip(meta.line()).map(|(file, line)| Origin { file, line }),
        };
        if self.handler_for(ctx.event_span(event)).handle(&log_event).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Collects fields as attributes. With `message` set, the `message` field is captured there.
struct FieldVisitor<'a> {
    attrs: &'a mut Vec<Attr>,
    message: Option<&'a mut Option<String>>,
}

impl FieldVisitor<'_> {
    fn push(&mut self, field: &Field, attr: impl FnOnce(&'static str) -> Attr) {
        self.attrs.push(attr(field.name()));
    }
}

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            if let Some(m) = self.message.as_deref_mut() {
                *m = Some(value.to_string());
                return;
            }
        }
        self.push(field, |k| Attr::string(k, value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, |k| Attr::int(k, value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, |k| Attr::uint(k, value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, |k| Attr::float(k, value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, |k| Attr::bool(k, value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, |k| Attr::string(k, value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            if let Some(m) = self.message.as_deref_mut() {
                *m = Some(format!("{:?}", value));
                return;
            }
        }
        self.push(field, |k| Attr::string(k, format!("{:?}", value)));
    }
}
