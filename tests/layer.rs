//! `tracing` adapter tests: events become frames, spans become groups.

use logproto::layer::ProtoLayer;
use logproto::{read, CancellationToken, Handler, HandlerOptions, Level, Record, Value};
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

fn capture(handler: Handler<Vec<u8>>, body: impl FnOnce()) -> Vec<Record> {
    let layer = ProtoLayer::new(handler.clone());
    let dropped = layer.dropped_events.clone();
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::with_default(subscriber, body);
    assert_eq!(dropped.load(Ordering::Relaxed), 0);

    let bytes = handler.lock_sink().clone();
    let mut out = Vec::new();
    read(&CancellationToken::new(), bytes.as_slice(), |r| {
        out.push(r);
        ControlFlow::Continue(())
    })
    .expect("read");
    out
}

#[test]
fn test_event_fields_and_message() {
    let records = capture(Handler::new(Vec::new()), || {
        tracing::warn!(user = "ann", attempts = 3u64, ratio = 0.5, ok = false, "login failed");
    });
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.level, Level::Warn);
    assert_eq!(r.message, "login failed");
    assert!(r.time.is_some());
    assert_eq!(r.attrs["user"], Value::String("ann".into()));
    assert_eq!(r.attrs["attempts"], Value::Uint(3));
    assert_eq!(r.attrs["ratio"], Value::Float(0.5));
    assert_eq!(r.attrs["ok"], Value::Bool(false));
    assert!(r.attrs.get("message").is_none());
}

#[test]
fn test_level_mapping() {
    let records = capture(Handler::new(Vec::new()), || {
        tracing::trace!("t");
        tracing::debug!("d");
        tracing::info!("i");
        tracing::error!("e");
    });
    let levels: Vec<Level> = records.iter().map(|r| r.level).collect();
    assert_eq!(levels, [Level::Debug, Level::Debug, Level::Info, Level::Error]);
}

#[test]
fn test_spans_become_nested_groups() {
    let records = capture(Handler::new(Vec::new()), || {
        let outer = tracing::info_span!("request", id = 42i64);
        let _o = outer.enter();
        let inner = tracing::info_span!("db", table = "users");
        let _i = inner.enter();
        tracing::info!(rows = 2i64, "query done");
    });
    assert_eq!(records.len(), 1);
    let request = records[0].attrs["request"].as_group().expect("request group");
    assert_eq!(request["id"], Value::Int(42));
    let db = request["db"].as_group().expect("db group");
    assert_eq!(db["table"], Value::String("users".into()));
    assert_eq!(db["rows"], Value::Int(2));
}

#[test]
fn test_recorded_span_fields_are_added() {
    let records = capture(Handler::new(Vec::new()), || {
        let span = tracing::info_span!("job", status = tracing::field::Empty);
        let _g = span.enter();
        tracing::info!("before");
        span.record("status", "done");
        tracing::info!("after");
    });
    assert_eq!(records.len(), 2);
    assert!(records[0].attrs.get("job").is_none());
    let job = records[1].attrs["job"].as_group().expect("job group");
    assert_eq!(job["status"], Value::String("done".into()));
}

#[test]
fn test_disabled_levels_are_not_written() {
    let handler = Handler::with_options(Vec::new(), HandlerOptions { min_level: Level::Warn, ..HandlerOptions::default() });
    let records = capture(handler, || {
        tracing::info!("quiet");
        tracing::error!("loud");
    });
    let msgs: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(msgs, ["loud"]);
}
