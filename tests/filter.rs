//! Filter tests: compile-time rejection, record variables, optional access, error absorption in
//! `&&`/`||`, runtime errors, time arithmetic, comprehensions, and filtered stream reads.

use chrono::{DateTime, TimeDelta};
use logproto::filter::{self, FilterError};
use logproto::{
    compile, read_filtered, Attr, CancellationToken, EvalErrorPolicy, Handler, Level, LogEvent,
    ReadError, ReaderConfig, Record, Value,
};
use std::ops::ControlFlow;

fn record(level: Level, msg: &str, attrs: &[(&str, Value)]) -> Record {
    Record {
        time: DateTime::from_timestamp(1_700_000_000, 0),
        message: msg.to_string(),
        level,
        attrs: attrs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
    }
}

fn eval(src: &str, r: &Record) -> Result<bool, FilterError> {
    compile(src).expect("compile").evaluate(r)
}

fn info() -> Record {
    record(
        Level::Info,
        "this is a test",
        &[
            ("pi", Value::Float(3.14159)),
            ("n", Value::Int(7)),
            ("name", Value::String("thing".into())),
            ("tags", Value::Opaque { type_tag: "rust/alloc::vec::Vec<&str>".into(), bytes: br#"["a","b"]"#.to_vec() }),
        ],
    )
}

#[test]
fn test_non_boolean_expression_is_rejected() {
    assert!(matches!(compile(r#""abc""#), Err(FilterError::NotBoolean(t)) if t == "string"));
    assert!(matches!(compile("1 + 2"), Err(FilterError::NotBoolean(_))));
}

#[test]
fn test_parse_and_type_errors() {
    assert!(matches!(compile("level =="), Err(FilterError::Parse(_))));
    assert!(matches!(compile("msg > 1"), Err(FilterError::Check(_))));
    assert!(matches!(compile("nope == 1"), Err(FilterError::Check(e)) if e.contains("nope")));
    assert!(matches!(compile("1 + 1.0 == 2.0"), Err(FilterError::Check(_))));
    assert!(matches!(compile("msg == 1"), Err(FilterError::Check(_))));
    assert!(matches!(compile(r#"level != time"#), Err(FilterError::Check(_))));
}

#[test]
fn test_level_comparison() {
    let r = info();
    assert!(!eval(r#"level == "ERROR""#, &r).expect("eval"));
    assert!(eval(r#"level == "INFO""#, &r).expect("eval"));
    let warn = record(Level::Warn, "w", &[]);
    assert!(eval(r#"level in ["WARN", "ERROR"]"#, &warn).expect("eval"));
}

#[test]
fn test_bind_with_optional_default() {
    let src = r#"cel.bind(value, attrs.?missing.orValue("other"), value != "thing")"#;
    assert!(eval(src, &info()).expect("eval"));

    let present = record(Level::Info, "m", &[("missing", Value::String("thing".into()))]);
    assert!(!eval(src, &present).expect("eval"));
}

#[test]
fn test_long_conjunction() {
    let src = r#"level == "INFO" && msg == "this is a test" && attrs.pi == 3.14159 && attrs.n > 5 && attrs.name.startsWith("th")"#;
    assert!(eval(src, &info()).expect("eval"));
    let mut r = info();
    r.attrs.insert("pi".into(), Value::Float(3.0));
    assert!(!eval(src, &r).expect("eval"));
}

#[test]
fn test_optional_chains() {
    let r = info();
    assert!(eval(r#"attrs.?missing.orValue("x") != "y""#, &r).expect("eval"));
    assert!(eval("!attrs.?missing.hasValue() && attrs.?n.hasValue()", &r).expect("eval"));
    assert!(eval(r#"attrs[?"n"].orValue(0) == 7"#, &r).expect("eval"));
    assert!(eval("has(attrs.pi) && !has(attrs.nope)", &r).expect("eval"));
}

#[test]
fn test_missing_key_is_an_evaluation_error() {
    let err = eval("attrs.missing == 1", &info()).expect_err("no such key");
    assert!(matches!(err, FilterError::Eval(ref m) if m.contains("no such key")), "{err}");
}

#[test]
fn test_logic_absorbs_errors_when_decided() {
    let r = info();
    assert!(!eval("attrs.missing == 1 && false", &r).expect("false wins"));
    assert!(!eval("false && attrs.missing == 1", &r).expect("false wins"));
    assert!(eval("attrs.missing == 1 || true", &r).expect("true wins"));
    assert!(eval(r#"true || attrs.name / 2 == 1"#, &r).expect("true wins"));
    assert!(eval("attrs.missing == 1 && true", &r).is_err());
    assert!(eval("attrs.missing == 1 || false", &r).is_err());
}

#[test]
fn test_arithmetic_errors() {
    let r = record(Level::Info, "m", &[("big", Value::Int(i64::MAX)), ("zero", Value::Int(0))]);
    let err = eval("attrs.big + 1 > 0", &r).expect_err("overflow");
    assert!(err.to_string().contains("overflow"), "{err}");
    let err = eval("10 / attrs.zero == 0", &r).expect_err("div by zero");
    assert!(err.to_string().contains("division by zero"), "{err}");
    let err = eval("10 % attrs.zero == 0", &r).expect_err("mod by zero");
    assert!(err.to_string().contains("modulus by zero"), "{err}");
    assert!(eval("-9223372036854775808 < 0", &r).expect("min int literal"));
}

#[test]
fn test_mixed_numeric_kinds_compare_and_equal() {
    let r = record(Level::Info, "m", &[("u", Value::Uint(3)), ("f", Value::Float(2.5))]);
    assert!(eval("attrs.u == 3 && attrs.u > 2.5 && attrs.f < 3", &r).expect("eval"));
    assert!(eval(r#"attrs.u != "3""#, &r).expect("different kinds are unequal"));
}

#[test]
fn test_time_and_duration() {
    let r = info();
    assert!(eval(r#"time == timestamp("2023-11-14T22:13:20Z")"#, &r).expect("eval"));
    assert!(eval(r#"time - duration("1h") < time"#, &r).expect("eval"));
    assert!(eval(r#"time.getFullYear() == 2023 && time.getHours("+02:00") == 0"#, &r).expect("eval"));

    let d = record(Level::Info, "m", &[("took", Value::Duration(TimeDelta::milliseconds(1500)))]);
    assert!(eval(r#"attrs.took > duration("1s") && attrs.took.getMilliseconds() == 1500"#, &d).expect("eval"));
}

#[test]
fn test_out_of_range_time_arguments_are_errors() {
    let r = info();
    let err = eval(r#"time.getHours("+999999:00") == 0"#, &r).expect_err("bad offset");
    assert!(matches!(err, FilterError::Eval(ref m) if m.contains("time zone")), "{err}");

    let huge = format!(r#"duration("{}.999999999999999999h") > duration("1s")"#, i128::MAX / 3_600_000_000_000);
    let err = eval(&huge, &r).expect_err("bad duration");
    assert!(matches!(err, FilterError::Eval(ref m) if m.contains("invalid duration")), "{err}");
}

#[test]
fn test_missing_time_binds_the_epoch() {
    let mut r = info();
    r.time = None;
    assert!(eval(r#"time == timestamp("1970-01-01T00:00:00Z")"#, &r).expect("eval"));
}

#[test]
fn test_unset_level_reads_as_info() {
    let r = Record::default();
    assert!(eval(r#"level == "INFO""#, &r).expect("eval"));
    assert!(eval(r#"level == "INFO" && time.getFullYear() == 1970"#, &r).expect("eval"));
}

#[test]
fn test_nested_groups_and_opaque_json() {
    let mut inner = logproto::Group::new();
    inner.insert("status".into(), Value::Int(503));
    let r = record(Level::Error, "m", &[("http", Value::Group(inner))]);
    assert!(eval("attrs.http.status >= 500", &r).expect("eval"));
    assert!(eval(r#"attrs.?http.?status.orValue(0) == 503 && attrs.?http.?nope.orValue(1) == 1"#, &r).expect("eval"));

    assert!(eval(r#""b" in attrs.tags && size(attrs.tags) == 2"#, &info()).expect("eval"));
}

#[test]
fn test_comprehensions_and_strings() {
    let r = info();
    assert!(eval("[1, 2, 3].exists(x, x == attrs.n - 5)", &r).expect("eval"));
    assert!(eval("[1, 2, 3].all(x, x > 0) && [1, 2, 3].exists_one(x, x > 2)", &r).expect("eval"));
    assert!(eval("[1, 2, 3].map(x, x * 2) == [2, 4, 6]", &r).expect("eval"));
    assert!(eval("[1, 2, 3, 4].filter(x, x % 2 == 0).size() == 2", &r).expect("eval"));
    assert!(eval(r#"msg.matches("^this\\s+is") && msg.contains("test") && msg.size() == 14"#, &r).expect("eval"));
    assert!(eval(r#"msg.split(" ")[3] == "test" && msg.upperAscii().endsWith("TEST")"#, &r).expect("eval"));
}

#[test]
fn test_no_program_selects_everything() {
    assert!(filter::evaluate(None, &Record::default()).expect("eval"));
}

#[test]
fn test_program_is_reusable_across_threads() {
    let program = compile(r#"attrs.n > 5"#).expect("compile");
    std::thread::scope(|s| {
        for i in 0..4i64 {
            let program = &program;
            s.spawn(move || {
                let r = record(Level::Info, "m", &[("n", Value::Int(i * 3))]);
                assert_eq!(program.evaluate(&r).expect("eval"), i * 3 > 5);
            });
        }
    });
}

fn mixed_stream() -> Vec<u8> {
    let h = Handler::new(Vec::<u8>::new());
    h.handle(&LogEvent::new(Level::Info, "a").attr(Attr::int("n", 1))).expect("handle");
    h.handle(&LogEvent::new(Level::Error, "b")).expect("handle");
    h.handle(&LogEvent::new(Level::Error, "c").attr(Attr::int("n", 9))).expect("handle");
    let bytes = h.lock_sink().clone();
    bytes
}

fn run(src: &str, policy: EvalErrorPolicy) -> (Result<logproto::ReadSummary, ReadError>, Vec<String>) {
    let program = compile(src).expect("compile");
    let config = ReaderConfig { eval_error_policy: policy, ..ReaderConfig::default() };
    let bytes = mixed_stream();
    let mut seen = Vec::new();
    let result = read_filtered(&CancellationToken::new(), bytes.as_slice(), Some(&program), &config, |r| {
        seen.push(r.message);
        ControlFlow::Continue(())
    });
    (result, seen)
}

#[test]
fn test_read_filtered_selects_records() {
    let (result, seen) = run(r#"level == "ERROR""#, EvalErrorPolicy::Abort);
    let summary = result.expect("read");
    assert_eq!(seen, ["b", "c"]);
    assert_eq!((summary.records, summary.accepted, summary.skipped), (3, 2, 1));
}

#[test]
fn test_eval_error_aborts_by_default() {
    let (result, seen) = run("attrs.n > 0", EvalErrorPolicy::default());
    assert!(matches!(result, Err(ReadError::Filter(FilterError::Eval(_)))));
    assert_eq!(seen, ["a"]);
}

#[test]
fn test_eval_error_skip_policy_drops_the_record() {
    let (result, seen) = run("attrs.n > 0", EvalErrorPolicy::Skip);
    let summary = result.expect("read");
    assert_eq!(seen, ["a", "c"]);
    assert_eq!(summary.skipped, 1);
}
