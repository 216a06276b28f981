//! Tree-walking evaluation of checked filter expressions.

use super::ast::*;
use crate::value::{format_duration, Value};
use chrono::{DateTime, Datelike, FixedOffset, TimeDelta, Timelike, Utc};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Map key. Only these kinds may key a map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Bool(bool),
    Int(i64),
    Uint(u64),
    String(String),
}

impl Key {
    fn to_val(&self) -> Val {
        match self {
            Key::Bool(b) => Val::Bool(*b),
            Key::Int(i) => Val::Int(*i),
            Key::Uint(u) => Val::Uint(*u),
            Key::String(s) => Val::String(s.clone()),
        }
    }
}

/// Runtime value of the expression language.
#[derive(Debug, Clone)]
pub enum Val {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Duration(TimeDelta),
    List(Rc<Vec<Val>>),
    Map(Rc<BTreeMap<Key, Val>>),
    Optional(Option<Rc<Val>>),
}

impl Val {
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null_type",
            Val::Bool(_) => "bool",
            Val::Int(_) => "int",
            Val::Uint(_) => "uint",
            Val::Double(_) => "double",
            Val::String(_) => "string",
            Val::Bytes(_) => "bytes",
            Val::Timestamp(_) => "google.protobuf.Timestamp",
            Val::Duration(_) => "google.protobuf.Duration",
            Val::List(_) => "list",
            Val::Map(_) => "map",
            Val::Optional(_) => "optional_type",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Val::Int(_) | Val::Uint(_) | Val::Double(_))
    }

    fn is_zero(&self) -> bool {
        match self {
            Val::Null => true,
            Val::Bool(b) => !b,
            Val::Int(i) => *i == 0,
            Val::Uint(u) => *u == 0,
            Val::Double(d) => *d == 0.0,
            Val::String(s) => s.is_empty(),
            Val::Bytes(b) => b.is_empty(),
            Val::Timestamp(t) => t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0,
            Val::Duration(d) => d.is_zero(),
            Val::List(l) => l.is_empty(),
            Val::Map(m) => m.is_empty(),
            Val::Optional(o) => o.is_none(),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => f.write_str("null"),
            Val::Bool(b) => write!(f, "{}", b),
            Val::Int(i) => write!(f, "{}", i),
            Val::Uint(u) => write!(f, "{}u", u),
            Val::Double(d) => write!(f, "{}", d),
            Val::String(s) => f.write_str(s),
            Val::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Val::Timestamp(t) => f.write_str(&t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
            Val::Duration(d) => f.write_str(&format_duration(*d)),
            Val::List(l) => {
                f.write_str("[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            Val::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k.to_val(), v)?;
                }
                f.write_str("}")
            }
            Val::Optional(None) => f.write_str("optional.none()"),
            Val::Optional(Some(v)) => write!(f, "optional.of({})", v),
        }
    }
}

/// Convert a decoded attribute value into the expression domain.
pub fn from_value(v: &Value) -> Val {
    match v {
        Value::Empty => Val::Null,
        Value::Bool(b) => Val::Bool(*b),
        Value::Float(x) => Val::Double(*x),
        Value::Int(i) => Val::Int(*i),
        Value::Uint(u) => Val::Uint(*u),
        Value::String(s) => Val::String(s.clone()),
        Value::Time(t) => Val::Timestamp(*t),
        Value::Duration(d) => Val::Duration(*d),
        Value::Group(g) => Val::Map(Rc::new(
            g.iter().map(|(k, v)| (Key::String(k.clone()), from_value(v))).collect(),
        )),
        Value::Opaque { bytes, .. } => match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(json) => from_json(json),
            Err(_) => Val::Bytes(bytes.clone()),
        },
    }
}

fn from_json(j: serde_json::Value) -> Val {
    match j {
        serde_json::Value::Null => Val::Null,
        serde_json::Value::Bool(b) => Val::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Val::Int(i)
            } else if let Some(u) = n.as_u64() {
                Val::Uint(u)
            } else {
                Val::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Val::String(s),
        serde_json::Value::Array(a) => Val::List(Rc::new(a.into_iter().map(from_json).collect())),
        serde_json::Value::Object(o) => {
            Val::Map(Rc::new(o.into_iter().map(|(k, v)| (Key::String(k), from_json(v))).collect()))
        }
    }
}

/// Values of the record variables for one evaluation.
pub struct Activation {
    pub msg: Val,
    pub level: Val,
    pub time: Val,
    pub attrs: Val,
}

pub struct Evaluator<'p> {
    regexes: &'p HashMap<String, Regex>,
    vars: Activation,
    locals: Vec<(&'p str, Val)>,
}

fn no_overload(function: &str, args: &[&Val]) -> String {
    let list: Vec<&str> = args.iter().map(|v| v.type_name()).collect();
    format!("no such overload: {}({})", function, list.join(", "))
}

fn key_of(v: &Val) -> Result<Key, String> {
    Ok(match v {
        Val::Bool(b) => Key::Bool(*b),
        Val::Int(i) => Key::Int(*i),
        Val::Uint(u) => Key::Uint(*u),
        Val::String(s) => Key::String(s.clone()),
        other => return Err(format!("unsupported map key type: {}", other.type_name())),
    })
}

/// Map lookup where numerically equal int, uint and double keys match each other.
fn lookup<'m>(map: &'m BTreeMap<Key, Val>, key: &Val) -> Result<Option<&'m Val>, String> {
    let mut candidates = Vec::with_capacity(2);
    match key {
        Val::Int(i) => {
            candidates.push(Key::Int(*i));
            if let Ok(u) = u64::try_from(*i) {
                candidates.push(Key::Uint(u));
            }
        }
        Val::Uint(u) => {
            candidates.push(Key::Uint(*u));
            if let Ok(i) = i64::try_from(*u) {
                candidates.push(Key::Int(i));
            }
        }
        Val::Double(d) if d.fract() == 0.0 => {
            if *d >= I64_RANGE.0 && *d < I64_RANGE.1 {
                candidates.push(Key::Int(*d as i64));
            }
            if *d >= 0.0 && *d < U64_MAX_EXCL {
                candidates.push(Key::Uint(*d as u64));
            }
        }
        Val::Double(_) => {}
        other => candidates.push(key_of(other)?),
    }
    Ok(candidates.iter().find_map(|k| map.get(k)))
}

fn numeric_cmp(a: &Val, b: &Val) -> Option<Ordering> {
    match (a, b) {
        (Val::Int(x), Val::Int(y)) => Some(x.cmp(y)),
        (Val::Uint(x), Val::Uint(y)) => Some(x.cmp(y)),
        (Val::Double(x), Val::Double(y)) => x.partial_cmp(y),
        (Val::Int(x), Val::Uint(y)) => Some(match u64::try_from(*x) {
            Ok(x) => x.cmp(y),
            Err(_) => Ordering::Less,
        }),
        (Val::Uint(_), Val::Int(_)) => numeric_cmp(b, a).map(Ordering::reverse),
        (Val::Int(x), Val::Double(y)) => (*x as f64).partial_cmp(y),
        (Val::Uint(x), Val::Double(y)) => (*x as f64).partial_cmp(y),
        (Val::Double(_), Val::Int(_) | Val::Uint(_)) => numeric_cmp(b, a).map(Ordering::reverse),
        _ => None,
    }
}

/// Equality; values of different kinds are unequal except across numeric kinds.
pub fn equals(a: &Val, b: &Val) -> bool {
    match (a, b) {
        (Val::Null, Val::Null) => true,
        (Val::Bool(x), Val::Bool(y)) => x == y,
        (Val::String(x), Val::String(y)) => x == y,
        (Val::Bytes(x), Val::Bytes(y)) => x == y,
        (Val::Timestamp(x), Val::Timestamp(y)) => x == y,
        (Val::Duration(x), Val::Duration(y)) => x == y,
        (Val::List(x), Val::List(y)) => x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| equals(p, q)),
        (Val::Map(x), Val::Map(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| equals(v, w)))
        }
        (Val::Optional(x), Val::Optional(y)) => match (x, y) {
            (None, None) => true,
            (Some(p), Some(q)) => equals(p, q),
            _ => false,
        },
        _ => numeric_cmp(a, b) == Some(Ordering::Equal),
    }
}

fn compare(op: BinaryOp, a: &Val, b: &Val) -> Result<Val, String> {
    let ord = match (a, b) {
        (Val::Bool(x), Val::Bool(y)) => Some(x.cmp(y)),
        (Val::String(x), Val::String(y)) => Some(x.cmp(y)),
        (Val::Bytes(x), Val::Bytes(y)) => Some(x.cmp(y)),
        (Val::Timestamp(x), Val::Timestamp(y)) => Some(x.cmp(y)),
        (Val::Duration(x), Val::Duration(y)) => Some(x.cmp(y)),
        _ if a.is_numeric() && b.is_numeric() => numeric_cmp(a, b),
        _ => return Err(no_overload(&format!("_{}_", op.symbol()), &[a, b])),
    };
    let Some(o) = ord else {
        return Ok(Val::Bool(false));
    };
    Ok(Val::Bool(match op {
        BinaryOp::Lt => o == Ordering::Less,
        BinaryOp::Le => o != Ordering::Greater,
        BinaryOp::Gt => o == Ordering::Greater,
        _ => o != Ordering::Less,
    }))
}

fn arith(op: BinaryOp, a: Val, b: Val) -> Result<Val, String> {
    use BinaryOp::*;
    let overflow = || "integer overflow".to_string();
    Ok(match (op, &a, &b) {
        (Add, Val::Int(x), Val::Int(y)) => Val::Int(x.checked_add(*y).ok_or_else(overflow)?),
        (Sub, Val::Int(x), Val::Int(y)) => Val::Int(x.checked_sub(*y).ok_or_else(overflow)?),
        (Mul, Val::Int(x), Val::Int(y)) => Val::Int(x.checked_mul(*y).ok_or_else(overflow)?),
        (Div | Rem, Val::Int(_), Val::Int(0)) | (Div | Rem, Val::Uint(_), Val::Uint(0)) => {
            let msg = if op == Div { "division by zero" } else { "modulus by zero" };
            return Err(msg.to_string());
        }
        (Div, Val::Int(x), Val::Int(y)) => Val::Int(x.checked_div(*y).ok_or_else(overflow)?),
        (Rem, Val::Int(x), Val::Int(y)) => Val::Int(x.checked_rem(*y).ok_or_else(overflow)?),
        (Add, Val::Uint(x), Val::Uint(y)) => Val::Uint(x.checked_add(*y).ok_or_else(overflow)?),
        (Sub, Val::Uint(x), Val::Uint(y)) => Val::Uint(x.checked_sub(*y).ok_or_else(overflow)?),
        (Mul, Val::Uint(x), Val::Uint(y)) => Val::Uint(x.checked_mul(*y).ok_or_else(overflow)?),
        (Div, Val::Uint(x), Val::Uint(y)) => Val::Uint(x / y),
        (Rem, Val::Uint(x), Val::Uint(y)) => Val::Uint(x % y),
        (Add, Val::Double(x), Val::Double(y)) => Val::Double(x + y),
        (Sub, Val::Double(x), Val::Double(y)) => Val::Double(x - y),
        (Mul, Val::Double(x), Val::Double(y)) => Val::Double(x * y),
        (Div, Val::Double(x), Val::Double(y)) => Val::Double(x / y),
        (Add, Val::String(x), Val::String(y)) => Val::String(format!("{}{}", x, y)),
        (Add, Val::Bytes(x), Val::Bytes(y)) => Val::Bytes([x.as_slice(), y.as_slice()].concat()),
        (Add, Val::List(x), Val::List(y)) => Val::List(Rc::new(x.iter().chain(y.iter()).cloned().collect())),
        (Add, Val::Timestamp(t), Val::Duration(d)) | (Add, Val::Duration(d), Val::Timestamp(t)) => {
            Val::Timestamp(t.checked_add_signed(*d).ok_or("timestamp overflow")?)
        }
        (Sub, Val::Timestamp(t), Val::Duration(d)) => {
            Val::Timestamp(t.checked_sub_signed(*d).ok_or("timestamp overflow")?)
        }
        (Sub, Val::Timestamp(x), Val::Timestamp(y)) => Val::Duration(x.signed_duration_since(*y)),
        (Add, Val::Duration(x), Val::Duration(y)) => Val::Duration(x.checked_add(y).ok_or("duration overflow")?),
        (Sub, Val::Duration(x), Val::Duration(y)) => Val::Duration(x.checked_sub(y).ok_or("duration overflow")?),
        _ => return Err(no_overload(&format!("_{}_", op.symbol()), &[&a, &b])),
    })
}

fn optional(v: Option<Val>) -> Val {
    Val::Optional(v.map(Rc::new))
}

fn select(v: Val, field: &str, opt: bool) -> Result<Val, String> {
    match v {
        Val::Optional(None) => Ok(Val::Optional(None)),
        Val::Optional(Some(inner)) => select((*inner).clone(), field, true),
        Val::Map(m) => {
            let got = m.get(&Key::String(field.to_string())).cloned();
            if opt {
                Ok(optional(got))
            } else {
                got.ok_or_else(|| format!("no such key: {}", field))
            }
        }
        other => Err(format!("type '{}' does not support field selection", other.type_name())),
    }
}

fn index(v: Val, key: Val, opt: bool) -> Result<Val, String> {
    match v {
        Val::Optional(None) => Ok(Val::Optional(None)),
        Val::Optional(Some(inner)) => index((*inner).clone(), key, true),
        Val::List(l) => {
            let i = match key {
                Val::Int(i) => i,
                Val::Uint(u) => i64::try_from(u).map_err(|_| format!("index out of range: {}", u))?,
                Val::Double(d) if d.fract() == 0.0 && d.abs() < 9.0e18 => d as i64,
                other => return Err(no_overload("_[_]", &[&Val::List(l), &other])),
            };
            let got = usize::try_from(i).ok().and_then(|i| l.get(i)).cloned();
            if opt {
                Ok(optional(got))
            } else {
                got.ok_or_else(|| format!("index out of range: {}", i))
            }
        }
        Val::Map(m) => {
            let got = lookup(&m, &key)?.cloned();
            if opt {
                Ok(optional(got))
            } else {
                got.ok_or_else(|| format!("no such key: {}", key))
            }
        }
        other => Err(no_overload("_[_]", &[&other, &key])),
    }
}

fn parse_offset(tz: &str) -> Result<FixedOffset, String> {
    let bad = || format!("unsupported time zone: {}", tz);
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(bad);
    }
    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(bad()),
    };
    let (h, m) = rest.split_once(':').ok_or_else(bad)?;
    let h: i32 = h.parse().map_err(|_| bad())?;
    let m: i32 = m.parse().map_err(|_| bad())?;
    if !(0..=23).contains(&h) || !(0..=59).contains(&m) {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60)).ok_or_else(bad)
}

/// Largest magnitude accepted while parsing: the `i64` seconds range.
const MAX_DURATION_NANOS: i128 = i64::MAX as i128 * NANOS_PER_SEC;

/// Parse a duration string such as `1h30m`, `-1.5s`, `250ms` or `0`.
pub fn parse_duration(s: &str) -> Result<TimeDelta, String> {
    let err = || format!("invalid duration: {:?}", s);
    let (neg, mut rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest == "0" {
        return Ok(TimeDelta::zero());
    }
    if rest.is_empty() {
        return Err(err());
    }
    let mut total: i128 = 0;
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).ok_or_else(err)?;
        let (num, tail) = rest.split_at(num_end);
        let unit_end = tail.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale: i128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3600 * NANOS_PER_SEC,
            _ => return Err(err()),
        };
        let (whole, frac) = num.split_once('.').unwrap_or((num, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        let whole: i128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| err())? };
        let mut nanos = whole.checked_mul(scale).filter(|n| *n <= MAX_DURATION_NANOS).ok_or_else(err)?;
        if !frac.is_empty() {
            let frac = &frac[..frac.len().min(18)];
            let digits: i128 = frac.parse().map_err(|_| err())?;
            nanos = nanos.checked_add(digits * scale / 10i128.pow(frac.len() as u32)).ok_or_else(err)?;
        }
        total = total.checked_add(nanos).filter(|t| *t <= MAX_DURATION_NANOS).ok_or_else(err)?;
        rest = tail;
    }
    if neg {
        total = -total;
    }
    let secs = i64::try_from(total.div_euclid(NANOS_PER_SEC)).map_err(|_| err())?;
    let sub = total.rem_euclid(NANOS_PER_SEC) as i64;
    TimeDelta::try_seconds(secs)
        .and_then(|d| d.checked_add(&TimeDelta::nanoseconds(sub)))
        .ok_or_else(err)
}

impl<'p> Evaluator<'p> {
    pub fn new(regexes: &'p HashMap<String, Regex>, vars: Activation) -> Self {
        Evaluator { regexes, vars, locals: Vec::new() }
    }

    pub fn eval(&mut self, expr: &'p Expr) -> Result<Val, String> {
        match expr {
            Expr::Literal(l) => Ok(match l {
                Literal::Null => Val::Null,
                Literal::Bool(b) => Val::Bool(*b),
                Literal::Int(i) => Val::Int(*i),
                Literal::Uint(u) => Val::Uint(*u),
                Literal::Double(d) => Val::Double(*d),
                Literal::String(s) => Val::String(s.clone()),
                Literal::Bytes(b) => Val::Bytes(b.clone()),
            }),
            Expr::Ident(name) => self.lookup_var(name),
            Expr::List(items) => {
                let vals = items.iter().map(|e| self.eval(e)).collect::<Result<Vec<_>, _>>()?;
                Ok(Val::List(Rc::new(vals)))
            }
            Expr::Map(entries) => {
                let mut m = BTreeMap::new();
                for (k, v) in entries {
                    let key = key_of(&self.eval(k)?)?;
                    let val = self.eval(v)?;
                    if m.insert(key, val).is_some() {
                        return Err("repeated key in map literal".to_string());
                    }
                }
                Ok(Val::Map(Rc::new(m)))
            }
            Expr::Unary(op, operand) => {
                let v = self.eval(operand)?;
                match (op, &v) {
                    (UnaryOp::Not, Val::Bool(b)) => Ok(Val::Bool(!b)),
                    (UnaryOp::Neg, Val::Int(i)) => Ok(Val::Int(i.checked_neg().ok_or("integer overflow")?)),
                    (UnaryOp::Neg, Val::Double(d)) => Ok(Val::Double(-d)),
                    (UnaryOp::Neg, Val::Duration(d)) => {
                        Ok(Val::Duration(TimeDelta::zero().checked_sub(d).ok_or("duration overflow")?))
                    }
                    (UnaryOp::Not, _) => Err(no_overload("!_", &[&v])),
                    (UnaryOp::Neg, _) => Err(no_overload("-_", &[&v])),
                }
            }
            Expr::Binary(BinaryOp::And, l, r) => self.eval_logic(false, l, r),
            Expr::Binary(BinaryOp::Or, l, r) => self.eval_logic(true, l, r),
            Expr::Binary(op, l, r) => {
                let a = self.eval(l)?;
                let b = self.eval(r)?;
                match op {
                    BinaryOp::Eq => Ok(Val::Bool(equals(&a, &b))),
                    BinaryOp::Ne => Ok(Val::Bool(!equals(&a, &b))),
                    BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(*op, &a, &b),
                    BinaryOp::In => match &b {
                        Val::List(l) => Ok(Val::Bool(l.iter().any(|x| equals(&a, x)))),
                        Val::Map(m) => Ok(Val::Bool(lookup(m, &a)?.is_some())),
                        _ => Err(no_overload("@in", &[&a, &b])),
                    },
                    _ => arith(*op, a, b),
                }
            }
            Expr::Ternary(c, t, e) => match self.eval(c)? {
                Val::Bool(true) => self.eval(t),
                Val::Bool(false) => self.eval(e),
                other => Err(no_overload("_?_:_", &[&other])),
            },
            Expr::Select { operand, field, optional } => {
                let v = self.eval(operand)?;
                select(v, field, *optional)
            }
            Expr::Index { operand, index: idx, optional } => {
                let v = self.eval(operand)?;
                let k = self.eval(idx)?;
                index(v, k, *optional)
            }
            Expr::Has { operand, field } => match self.eval(operand)? {
                Val::Map(m) => Ok(Val::Bool(m.contains_key(&Key::String(field.clone())))),
                other => Err(format!("type '{}' does not support presence test", other.type_name())),
            },
            Expr::Comprehension { kind, range, var, body } => self.eval_comprehension(*kind, range, var, body),
            Expr::Bind { var, init, body } => {
                let v = self.eval(init)?;
                self.locals.push((var.as_str(), v));
                let out = self.eval(body);
                self.locals.pop();
                out
            }
            Expr::Call { target: None, function, args } => {
                let args = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>, _>>()?;
                self.call_function(function, args)
            }
            Expr::Call { target: Some(t), function, args } => {
                let target = self.eval(t)?;
                let args = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>, _>>()?;
                self.call_method(target, function, args)
            }
        }
    }

    fn lookup_var(&self, name: &str) -> Result<Val, String> {
        if let Some((_, v)) = self.locals.iter().rev().find(|(n, _)| *n == name) {
            return Ok(v.clone());
        }
        Ok(match name {
            "msg" => self.vars.msg.clone(),
            "level" => self.vars.level.clone(),
            "time" => self.vars.time.clone(),
            "attrs" => self.vars.attrs.clone(),
            _ => return Err(format!("no such attribute: {}", name)),
        })
    }

    /// `&&` (`short == false`) and `||` (`short == true`). A deciding operand wins over an error
    /// on the other side, whichever order they appear in.
    fn eval_logic(&mut self, short: bool, l: &'p Expr, r: &'p Expr) -> Result<Val, String> {
        let symbol = if short { "_||_" } else { "_&&_" };
        let left = self.eval(l);
        if let Ok(Val::Bool(b)) = left {
            if b == short {
                return Ok(Val::Bool(short));
            }
        }
        let right = self.eval(r);
        if let Ok(Val::Bool(b)) = right {
            if b == short {
                return Ok(Val::Bool(short));
            }
        }
        match (left?, right?) {
            (Val::Bool(_), Val::Bool(_)) => Ok(Val::Bool(!short)),
            (a, b) => Err(no_overload(symbol, &[&a, &b])),
        }
    }

    fn eval_comprehension(
        &mut self,
        kind: MacroKind,
        range: &'p Expr,
        var: &'p str,
        body: &'p Expr,
    ) -> Result<Val, String> {
        let items: Vec<Val> = match self.eval(range)? {
            Val::List(l) => l.iter().cloned().collect(),
            Val::Map(m) => m.keys().map(Key::to_val).collect(),
            other => return Err(format!("expression of type '{}' cannot be iterated", other.type_name())),
        };
        let step = |this: &mut Self, item: &Val| -> Result<Val, String> {
            this.locals.push((var, item.clone()));
            let out = this.eval(body);
            this.locals.pop();
            out
        };
        match kind {
            MacroKind::Exists | MacroKind::All => {
                let decisive = kind == MacroKind::Exists;
                let mut first_err = None;
                for item in &items {
                    match step(self, item) {
                        Ok(Val::Bool(b)) if b == decisive => return Ok(Val::Bool(decisive)),
                        Ok(Val::Bool(_)) => {}
                        Ok(other) => {
                            if first_err.is_none() {
                                first_err = Some(format!("predicate returned {}", other.type_name()));
                            }
                        }
                        Err(e) => {
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(Val::Bool(!decisive)),
                }
            }
            MacroKind::ExistsOne => {
                let mut count = 0usize;
                for item in &items {
                    match step(self, item)? {
                        Val::Bool(true) => count += 1,
                        Val::Bool(false) => {}
                        other => return Err(format!("predicate returned {}", other.type_name())),
                    }
                }
                Ok(Val::Bool(count == 1))
            }
            MacroKind::Map => {
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(step(self, item)?);
                }
                Ok(Val::List(Rc::new(out)))
            }
            MacroKind::Filter => {
                let mut out = Vec::new();
                for item in items {
                    match step(self, &item)? {
                        Val::Bool(true) => out.push(item),
                        Val::Bool(false) => {}
                        other => return Err(format!("predicate returned {}", other.type_name())),
                    }
                }
                Ok(Val::List(Rc::new(out)))
            }
        }
    }

    fn regex_matches(&self, text: &str, pattern: &str) -> Result<bool, String> {
        if let Some(re) = self.regexes.get(pattern) {
            return Ok(re.is_match(text));
        }
        let re = Regex::new(pattern).map_err(|e| format!("invalid regex {:?}: {}", pattern, e))?;
        Ok(re.is_match(text))
    }

    fn call_function(&self, function: &str, args: Vec<Val>) -> Result<Val, String> {
        let refs: Vec<&Val> = args.iter().collect();
        let fail = || Err(no_overload(function, &refs));
        match (function, args.as_slice()) {
            ("size", [v]) => size_of(v).ok_or_else(|| no_overload(function, &refs)),
            ("int", [v]) => to_int(v),
            ("uint", [v]) => to_uint(v),
            ("double", [v]) => to_double(v),
            ("string", [v]) => to_string(v),
            ("bool", [v]) => to_bool(v),
            ("bytes", [Val::String(s)]) => Ok(Val::Bytes(s.as_bytes().to_vec())),
            ("bytes", [Val::Bytes(b)]) => Ok(Val::Bytes(b.clone())),
            ("timestamp", [v]) => to_timestamp(v),
            ("duration", [Val::String(s)]) => Ok(Val::Duration(parse_duration(s)?)),
            ("duration", [Val::Duration(d)]) => Ok(Val::Duration(*d)),
            ("dyn", [v]) => Ok(v.clone()),
            ("matches", [Val::String(s), Val::String(p)]) => Ok(Val::Bool(self.regex_matches(s, p)?)),
            ("optional.of", [v]) => Ok(optional(Some(v.clone()))),
            ("optional.ofNonZeroValue", [v]) => Ok(optional((!v.is_zero()).then(|| v.clone()))),
            ("optional.none", []) => Ok(Val::Optional(None)),
            _ => fail(),
        }
    }

    fn call_method(&self, target: Val, method: &str, args: Vec<Val>) -> Result<Val, String> {
        let mut refs: Vec<&Val> = vec![&target];
        refs.extend(args.iter());
        let fail = || Err(no_overload(method, &refs));
        match (&target, method, args.as_slice()) {
            (Val::String(s), "contains", [Val::String(a)]) => Ok(Val::Bool(s.contains(a.as_str()))),
            (Val::String(s), "startsWith", [Val::String(a)]) => Ok(Val::Bool(s.starts_with(a.as_str()))),
            (Val::String(s), "endsWith", [Val::String(a)]) => Ok(Val::Bool(s.ends_with(a.as_str()))),
            (Val::String(s), "matches", [Val::String(p)]) => Ok(Val::Bool(self.regex_matches(s, p)?)),
            (Val::String(s), "lowerAscii", []) => Ok(Val::String(s.to_ascii_lowercase())),
            (Val::String(s), "upperAscii", []) => Ok(Val::String(s.to_ascii_uppercase())),
            (Val::String(s), "trim", []) => Ok(Val::String(s.trim().to_string())),
            (Val::String(s), "indexOf", [Val::String(a)]) => Ok(Val::Int(match s.find(a.as_str()) {
                Some(byte) => s[..byte].chars().count() as i64,
                None => -1,
            })),
            (Val::String(s), "replace", [Val::String(a), Val::String(b)]) => {
                Ok(Val::String(s.replace(a.as_str(), b)))
            }
            (Val::String(s), "split", [Val::String(sep)]) => Ok(Val::List(Rc::new(
                s.split(sep.as_str()).map(|p| Val::String(p.to_string())).collect(),
            ))),
            (Val::String(s), "substring", [Val::Int(start)]) => substring(s, *start, None),
            (Val::String(s), "substring", [Val::Int(start), Val::Int(end)]) => substring(s, *start, Some(*end)),
            (_, "size", []) => size_of(&target).ok_or_else(|| no_overload(method, &refs)),
            (Val::Optional(o), "hasValue", []) => Ok(Val::Bool(o.is_some())),
            (Val::Optional(o), "value", []) => {
                o.as_deref().cloned().ok_or_else(|| "optional.none() dereference".to_string())
            }
            (Val::Optional(o), "orValue", [d]) => Ok(o.as_deref().cloned().unwrap_or_else(|| d.clone())),
            (Val::Optional(o), "or", [alt @ Val::Optional(_)]) => {
                Ok(if o.is_some() { target.clone() } else { alt.clone() })
            }
            (Val::Timestamp(t), _, []) => {
                timestamp_part(t.fixed_offset(), method).ok_or_else(|| no_overload(method, &refs))
            }
            (Val::Timestamp(t), _, [Val::String(tz)]) => {
                timestamp_part(t.with_timezone(&parse_offset(tz)?), method).ok_or_else(|| no_overload(method, &refs))
            }
            (Val::Duration(d), _, []) => Ok(Val::Int(match method {
                "getHours" => d.num_hours(),
                "getMinutes" => d.num_minutes(),
                "getSeconds" => d.num_seconds(),
                "getMilliseconds" => d.num_milliseconds(),
                _ => return fail(),
            })),
            _ => fail(),
        }
    }
}

fn size_of(v: &Val) -> Option<Val> {
    let n = match v {
        Val::String(s) => s.chars().count(),
        Val::Bytes(b) => b.len(),
        Val::List(l) => l.len(),
        Val::Map(m) => m.len(),
        _ => return None,
    };
    Some(Val::Int(n as i64))
}

fn substring(s: &str, start: i64, end: Option<i64>) -> Result<Val, String> {
    let len = s.chars().count() as i64;
    let end = end.unwrap_or(len);
    if start < 0 || end > len || start > end {
        return Err(format!("substring range out of bounds: [{}, {}) of {}", start, end, len));
    }
    Ok(Val::String(s.chars().skip(start as usize).take((end - start) as usize).collect()))
}

fn timestamp_part(t: DateTime<FixedOffset>, method: &str) -> Option<Val> {
    let n = match method {
        "getFullYear" => i64::from(t.year()),
        "getMonth" => i64::from(t.month0()),
        "getDayOfMonth" => i64::from(t.day0()),
        "getDate" => i64::from(t.day()),
        "getDayOfWeek" => i64::from(t.weekday().num_days_from_sunday()),
        "getDayOfYear" => i64::from(t.ordinal0()),
        "getHours" => i64::from(t.hour()),
        "getMinutes" => i64::from(t.minute()),
        "getSeconds" => i64::from(t.second()),
        "getMilliseconds" => i64::from(t.nanosecond() / 1_000_000),
        _ => return None,
    };
    Some(Val::Int(n))
}

const I64_RANGE: (f64, f64) = (-9.223_372_036_854_775_808e18, 9.223_372_036_854_775_808e18);
const U64_MAX_EXCL: f64 = 1.844_674_407_370_955_2e19;

fn to_int(v: &Val) -> Result<Val, String> {
    let overflow = || "int conversion overflow".to_string();
    Ok(Val::Int(match v {
        Val::Int(i) => *i,
        Val::Uint(u) => i64::try_from(*u).map_err(|_| overflow())?,
        Val::Double(d) if d.is_nan() || *d < I64_RANGE.0 || *d >= I64_RANGE.1 => return Err(overflow()),
        Val::Double(d) => *d as i64,
        Val::String(s) => s.parse().map_err(|_| format!("cannot convert {:?} to int", s))?,
        Val::Timestamp(t) => t.timestamp(),
        other => return Err(no_overload("int", &[other])),
    }))
}

fn to_uint(v: &Val) -> Result<Val, String> {
    let overflow = || "uint conversion overflow".to_string();
    Ok(Val::Uint(match v {
        Val::Uint(u) => *u,
        Val::Int(i) => u64::try_from(*i).map_err(|_| overflow())?,
        Val::Double(d) if d.is_nan() || *d <= -1.0 || *d >= U64_MAX_EXCL => return Err(overflow()),
        Val::Double(d) => *d as u64,
        Val::String(s) => s.parse().map_err(|_| format!("cannot convert {:?} to uint", s))?,
        other => return Err(no_overload("uint", &[other])),
    }))
}

fn to_double(v: &Val) -> Result<Val, String> {
    Ok(Val::Double(match v {
        Val::Double(d) => *d,
        Val::Int(i) => *i as f64,
        Val::Uint(u) => *u as f64,
        Val::String(s) => s.parse().map_err(|_| format!("cannot convert {:?} to double", s))?,
        other => return Err(no_overload("double", &[other])),
    }))
}

fn to_string(v: &Val) -> Result<Val, String> {
    Ok(Val::String(match v {
        Val::String(s) => s.clone(),
        Val::Bool(_) | Val::Int(_) | Val::Double(_) | Val::Timestamp(_) | Val::Duration(_) => v.to_string(),
        Val::Uint(u) => u.to_string(),
        Val::Bytes(b) => String::from_utf8(b.clone()).map_err(|_| "invalid UTF-8 in bytes".to_string())?,
        other => return Err(no_overload("string", &[other])),
    }))
}

fn to_bool(v: &Val) -> Result<Val, String> {
    Ok(Val::Bool(match v {
        Val::Bool(b) => *b,
        Val::String(s) => match s.as_str() {
            "1" | "t" | "true" | "TRUE" | "True" => true,
            "0" | "f" | "false" | "FALSE" | "False" => false,
            _ => return Err(format!("cannot convert {:?} to bool", s)),
        },
        other => return Err(no_overload("bool", &[other])),
    }))
}

fn to_timestamp(v: &Val) -> Result<Val, String> {
    Ok(Val::Timestamp(match v {
        Val::Timestamp(t) => *t,
        Val::String(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| format!("cannot parse timestamp {:?}: {}", s, e))?
            .with_timezone(&Utc),
        Val::Int(secs) => DateTime::from_timestamp(*secs, 0).ok_or("timestamp out of range")?,
        other => return Err(no_overload("timestamp", &[other])),
    }))
}
