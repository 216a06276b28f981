//! Handler tests: attribute lineage, group inlining and suppression, dropped events, lazy and
//! opaque values, level enablement, concurrent writers.

use logproto::{
    read, Attr, AttrValue, CancellationToken, Group, Handler, HandlerError, HandlerOptions, Level,
    LogEvent, LogValue, Record, Value,
};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn records<W: AsRef<[u8]>>(handler: &Handler<W>) -> Vec<Record> {
    let bytes = handler.lock_sink().as_ref().to_vec();
    let mut out = Vec::new();
    read(&CancellationToken::new(), bytes.as_slice(), |r| {
        out.push(r);
        ControlFlow::Continue(())
    })
    .expect("read");
    out
}

fn s(v: &str) -> Value {
    Value::String(v.into())
}

fn group(entries: &[(&str, Value)]) -> Value {
    Value::Group(entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
}

#[test]
fn test_empty_key_group_is_inlined() {
    let h = Handler::new(Vec::<u8>::new());
    let attrs = h
        .build_attrs(&[
            Attr::string("a", "b"),
            Attr::group("", [Attr::string("c", "d")]),
            Attr::string("e", "f"),
        ])
        .expect("build");
    let expected: Group = [("a", "b"), ("c", "d"), ("e", "f")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), s(v)))
        .collect();
    assert_eq!(attrs, expected);
}

#[test]
fn test_empty_groups_are_dropped() {
    let h = Handler::new(Vec::<u8>::new());
    let attrs = h
        .build_attrs(&[
            Attr::group("none", Vec::<Attr>::new()),
            Attr::group("nested", [Attr::group("also_none", Vec::<Attr>::new())]),
            Attr::string("kept", "yes"),
        ])
        .expect("build");
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs["kept"], s("yes"));

    // An open group with nothing in it is not attached either.
    let g = h.with_group("G").with_group("H");
    assert!(g.build_attrs(&[]).expect("build").is_empty());
}

#[test]
fn test_empty_key_scalar_is_dropped() {
    let h = Handler::new(Vec::<u8>::new());
    let attrs = h.build_attrs(&[Attr::string("", "lost"), Attr::int("n", 1)]).expect("build");
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs["n"], Value::Int(1));
}

#[test]
fn test_nested_groups_from_lineage() {
    let h = Handler::new(Vec::<u8>::new()).with_group("G").with_group("H");
    h.handle(&LogEvent::new(Level::Info, "m").attr(Attr::string("e", "f"))).expect("handle");
    let rs = records(&h);
    assert_eq!(rs.len(), 1);
    assert_eq!(rs[0].attrs["G"], group(&[("H", group(&[("e", s("f"))]))]));
}

#[test]
fn test_reopening_a_group_name_nests_it() {
    let h = Handler::new(Vec::<u8>::new()).with_group("G").with_group("G");
    let attrs = h.build_attrs(&[Attr::string("e", "f")]).expect("build");
    assert_eq!(attrs["G"], group(&[("G", group(&[("e", s("f"))]))]));

    let between = Handler::new(Vec::<u8>::new())
        .with_group("G")
        .with_attrs([Attr::int("a", 1)])
        .with_group("G");
    let attrs = between.build_attrs(&[Attr::string("e", "f")]).expect("build");
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs["G"], group(&[("a", Value::Int(1)), ("G", group(&[("e", s("f"))]))]));
}

#[test]
fn test_attrs_land_in_innermost_open_group() {
    let h = Handler::new(Vec::<u8>::new())
        .with_attrs([Attr::int("top", 1)])
        .with_group("req")
        .with_attrs([Attr::string("id", "42")]);
    let attrs = h.build_attrs(&[Attr::int("status", 200)]).expect("build");
    assert_eq!(attrs["top"], Value::Int(1));
    assert_eq!(attrs["req"], group(&[("id", s("42")), ("status", Value::Int(200))]));
    assert_eq!(attrs.len(), 2);
}

#[test]
fn test_sibling_handlers_are_isolated() {
    let base = Handler::new(Vec::<u8>::new()).with_attrs([Attr::string("svc", "api")]);
    let left = base.with_attrs([Attr::string("side", "left")]);
    let right = base.with_group("r").with_attrs([Attr::string("side", "right")]);

    let l = left.build_attrs(&[]).expect("build");
    let r = right.build_attrs(&[]).expect("build");
    let b = base.build_attrs(&[]).expect("build");

    assert_eq!(l.len(), 2);
    assert_eq!(l["side"], s("left"));
    assert_eq!(r["svc"], s("api"));
    assert_eq!(r["r"], group(&[("side", s("right"))]));
    assert!(r.get("side").is_none());
    assert_eq!(b.len(), 1);
}

#[test]
fn test_empty_group_name_and_no_attrs_are_no_ops() {
    let h = Handler::new(Vec::<u8>::new()).with_attrs([Attr::int("x", 1)]);
    let same = h.with_group("").with_attrs(Vec::<Attr>::new());
    assert_eq!(same.build_attrs(&[Attr::int("y", 2)]).expect("build"), h.build_attrs(&[Attr::int("y", 2)]).expect("build"));
}

#[test]
fn test_later_attrs_override_earlier_keys() {
    let h = Handler::new(Vec::<u8>::new()).with_attrs([Attr::string("k", "handler")]);
    let attrs = h.build_attrs(&[Attr::string("k", "call")]).expect("build");
    assert_eq!(attrs["k"], s("call"));
}

#[test]
fn test_event_without_origin_or_time_is_dropped() {
    let h = Handler::new(Vec::<u8>::new());
    h.handle(&LogEvent::new(Level::Info, "ghost").at(None).origin(None)).expect("handle");
    assert!(h.lock_sink().is_empty());

    // Either one alone is enough to keep the event.
    h.handle(&LogEvent::new(Level::Info, "untimed").at(None)).expect("handle");
    h.handle(&LogEvent::new(Level::Info, "nowhere").origin(None)).expect("handle");
    let msgs: Vec<String> = records(&h).into_iter().map(|r| r.message).collect();
    assert_eq!(msgs, ["untimed", "nowhere"]);
}

#[test]
fn test_lazy_values_resolve_at_handle_time() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let h = Handler::new(Vec::<u8>::new()).with_attrs([Attr::lazy("n", move || {
        AttrValue::Uint(counter.fetch_add(1, Ordering::SeqCst) as u64)
    })]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    h.handle(&LogEvent::new(Level::Info, "a")).expect("handle");
    h.handle(&LogEvent::new(Level::Info, "b")).expect("handle");
    let rs = records(&h);
    assert_eq!(rs[0].attrs["n"], Value::Uint(0));
    assert_eq!(rs[1].attrs["n"], Value::Uint(1));
}

#[test]
fn test_lazy_group_with_empty_key_is_inlined() {
    let h = Handler::new(Vec::<u8>::new());
    let attrs = h
        .build_attrs(&[Attr::lazy("", || AttrValue::Group(vec![Attr::int("x", 1), Attr::int("y", 2)]))])
        .expect("build");
    assert_eq!(attrs.len(), 2);
    assert_eq!(attrs["y"], Value::Int(2));
}

#[test]
fn test_runaway_lazy_value_is_an_error() {
    struct Forever;
    impl LogValue for Forever {
        fn log_value(&self) -> AttrValue {
            AttrValue::Lazy(Arc::new(Forever))
        }
    }
    let h = Handler::new(Vec::<u8>::new());
    let err = h
        .handle(&LogEvent::new(Level::Info, "loop").attr(Attr::lazy("k", Forever)))
        .expect_err("unresolved");
    assert!(matches!(err, HandlerError::Unresolved { ref key } if key == "k"), "{err}");
    assert!(h.lock_sink().is_empty());
}

#[test]
fn test_opaque_values_carry_json() {
    #[derive(serde::Serialize)]
    struct Point {
        x: i32,
        y: i32,
    }
    let h = Handler::new(Vec::<u8>::new());
    let attrs = h.build_attrs(&[Attr::any("p", Point { x: 1, y: -2 })]).expect("build");
    match &attrs["p"] {
        Value::Opaque { type_tag, bytes } => {
            assert!(type_tag.ends_with("Point"), "{type_tag}");
            assert_eq!(bytes, br#"{"x":1,"y":-2}"#);
        }
        other => panic!("expected opaque, got {other:?}"),
    }
}

#[test]
fn test_enabled_honours_min_level() {
    let all = Handler::new(Vec::<u8>::new());
    assert!(all.enabled(Level::Debug));
    assert!(all.enabled(Level::Error));

    let warn = Handler::with_options(Vec::<u8>::new(), HandlerOptions { min_level: Level::Warn, ..HandlerOptions::default() });
    assert!(!warn.enabled(Level::Debug));
    assert!(!warn.enabled(Level::Info));
    assert!(warn.enabled(Level::Warn));
    assert!(warn.enabled(Level::Error));
    // Derived handlers share the options.
    assert!(!warn.with_group("g").enabled(Level::Info));
}

#[test]
fn test_concurrent_writers_never_interleave_frames() {
    let h = Handler::new(Vec::<u8>::new());
    thread::scope(|scope| {
        for t in 0..8 {
            let h = h.with_attrs([Attr::int("thread", t)]);
            scope.spawn(move || {
                for i in 0..50 {
                    let ev = LogEvent::new(Level::Info, format!("t{t}-{i}")).attr(Attr::string("pad", "x".repeat(i * 7)));
                    h.handle(&ev).expect("handle");
                }
            });
        }
    });
    let rs = records(&h);
    assert_eq!(rs.len(), 400);
    for r in &rs {
        let Value::Int(t) = r.attrs["thread"] else { panic!("thread attr missing") };
        assert!(r.message.starts_with(&format!("t{t}-")), "{}", r.message);
    }
}
