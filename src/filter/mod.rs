//! Record filters: boolean expressions over `msg`, `level`, `time` and `attrs`.
//!
//! The language is a subset of CEL. An expression is parsed and type-checked once by
//! [`compile`]; the resulting [`FilterProgram`] is immutable and can be evaluated against any
//! number of records, from any number of threads.
//!
//! ```
//! use logproto::filter;
//! use logproto::{Level, Record};
//!
//! let program = filter::compile(r#"level == "ERROR" || attrs.?retry.orValue(0) > 3"#).unwrap();
//! let record = Record { level: Level::Info, ..Record::default() };
//! assert!(!program.evaluate(&record).unwrap());
//! ```

pub mod ast;
pub mod check;
pub mod eval;
pub mod parser;

use crate::record::{Level, Record};
use ast::{Expr, Literal};
use chrono::{DateTime, Utc};
use check::Type;
use eval::{Activation, Evaluator, Val};
use regex::Regex;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("{0}")]
    Parse(String),
    #[error("Type error: {0}")]
    Check(String),
    #[error("Filter must evaluate to bool, not {0}")]
    NotBoolean(String),
    #[error("Invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Evaluation error: {0}")]
    Eval(String),
}

/// A compiled filter.
#[derive(Debug, Clone)]
pub struct FilterProgram {
    source: String,
    expr: Expr,
    /// Constant `matches` patterns, compiled up front.
    regexes: HashMap<String, Regex>,
}

/// Parse and type-check `source`. The expression's static type must be `bool`.
pub fn compile(source: &str) -> Result<FilterProgram, FilterError> {
    let expr = parser::parse(source).map_err(FilterError::Parse)?;
    let ty = check::check(&expr, &check::record_variables()).map_err(FilterError::Check)?;
    if ty != Type::Bool {
        return Err(FilterError::NotBoolean(ty.to_string()));
    }

    let mut patterns = Vec::new();
    expr.walk(&mut |e| {
        if let Expr::Call { function, args, target } = e {
            if function == "matches" {
                let pattern = match (target, args.as_slice()) {
                    (Some(_), [Expr::Literal(Literal::String(p))]) => Some(p),
                    (None, [_, Expr::Literal(Literal::String(p))]) => Some(p),
                    _ => None,
                };
                patterns.extend(pattern.cloned());
            }
        }
    });
    let mut regexes = HashMap::new();
    for pattern in patterns {
        let re = Regex::new(&pattern).map_err(|source| FilterError::Regex { pattern: pattern.clone(), source })?;
        regexes.insert(pattern, re);
    }

    Ok(FilterProgram { source: source.to_string(), expr, regexes })
}

/// Evaluate an optional program; no program selects every record.
pub fn evaluate(program: Option<&FilterProgram>, record: &Record) -> Result<bool, FilterError> {
    match program {
        Some(p) => p.evaluate(record),
        None => Ok(true),
    }
}

impl FilterProgram {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, record: &Record) -> Result<bool, FilterError> {
        let mut evaluator = Evaluator::new(&self.regexes, bind(record));
        match evaluator.eval(&self.expr).map_err(FilterError::Eval)? {
            Val::Bool(b) => Ok(b),
            other => Err(FilterError::NotBoolean(other.type_name().to_string())),
        }
    }
}

fn bind(record: &Record) -> Activation {
    // Untimed records sit at the epoch; an unset level reads as INFO.
    let time = record.time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let level = match record.level {
        Level::Unset => Level::Info,
        l => l,
    };
    Activation {
        msg: Val::String(record.message.clone()),
        level: Val::String(level.name().to_string()),
        time: Val::Timestamp(time),
        attrs: Val::Map(Rc::new(
            record
                .attrs
                .iter()
                .map(|(k, v)| (eval::Key::String(k.clone()), eval::from_value(v)))
                .collect(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_epoch_and_info() {
        let vars = bind(&Record::default());
        assert!(matches!(vars.time, Val::Timestamp(t) if t.timestamp() == 0));
        assert!(matches!(vars.level, Val::String(ref s) if &**s == "INFO"));
    }

    #[test]
    fn constant_patterns_are_compiled_once() {
        let p = compile(r#"msg.matches("^a+$") && matches(level, "INFO|WARN")"#).expect("compile");
        assert_eq!(p.regexes.len(), 2);
        assert!(matches!(compile(r#"msg.matches("(")"#), Err(FilterError::Regex { .. })));
    }
}
