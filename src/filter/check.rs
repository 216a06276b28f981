//! Static type checking of filter expressions against the record variables.
//!
//! Types that cannot be known statically (attribute values) are `Dyn`; any operation on `Dyn`
//! is accepted here and checked again at evaluation time.

use super::ast::*;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Null,
    Bool,
    Int,
    Uint,
    Double,
    String,
    Bytes,
    Timestamp,
    Duration,
    List(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Optional(Box<Type>),
    Dyn,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Null => f.write_str("null_type"),
            Type::Bool => f.write_str("bool"),
            Type::Int => f.write_str("int"),
            Type::Uint => f.write_str("uint"),
            Type::Double => f.write_str("double"),
            Type::String => f.write_str("string"),
            Type::Bytes => f.write_str("bytes"),
            Type::Timestamp => f.write_str("google.protobuf.Timestamp"),
            Type::Duration => f.write_str("google.protobuf.Duration"),
            Type::List(t) => write!(f, "list({})", t),
            Type::Map(k, v) => write!(f, "map({}, {})", k, v),
            Type::Optional(t) => write!(f, "optional_type({})", t),
            Type::Dyn => f.write_str("dyn"),
        }
    }
}

impl Type {
    fn is_dyn(&self) -> bool {
        matches!(self, Type::Dyn)
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Uint | Type::Double)
    }

    /// Whether values of the two types can ever compare equal.
    fn comparable(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Dyn, _) | (_, Type::Dyn) => true,
            (a, b) if a.is_numeric() && b.is_numeric() => true,
            (Type::List(a), Type::List(b)) | (Type::Optional(a), Type::Optional(b)) => a.comparable(b),
            (Type::Map(ka, va), Type::Map(kb, vb)) => ka.comparable(kb) && va.comparable(vb),
            (Type::Null, Type::Optional(_)) | (Type::Optional(_), Type::Null) => true,
            (a, b) => a == b,
        }
    }

    /// `self` if both sides agree, otherwise `Dyn`.
    fn join(self, other: &Type) -> Type {
        if &self == other {
            self
        } else {
            Type::Dyn
        }
    }
}

/// Variables every filter can reference.
pub fn record_variables() -> Vec<(String, Type)> {
    vec![
        ("msg".to_string(), Type::String),
        ("level".to_string(), Type::String),
        ("time".to_string(), Type::Timestamp),
        ("attrs".to_string(), Type::Map(Box::new(Type::String), Box::new(Type::Dyn))),
    ]
}

/// Type-check `expr` and return its static type.
pub fn check(expr: &Expr, vars: &[(String, Type)]) -> Result<Type, String> {
    let mut checker = Checker { scope: vars.to_vec() };
    checker.check(expr)
}

struct Checker {
    /// Innermost binding last.
    scope: Vec<(String, Type)>,
}

fn no_overload(function: &str, args: &[&Type]) -> String {
    let list: Vec<String> = args.iter().map(|t| t.to_string()).collect();
    format!("found no matching overload for '{}' applied to '({})'", function, list.join(", "))
}

impl Checker {
    fn check(&mut self, expr: &Expr) -> Result<Type, String> {
        match expr {
            Expr::Literal(l) => Ok(match l {
                Literal::Null => Type::Null,
                Literal::Bool(_) => Type::Bool,
                Literal::Int(_) => Type::Int,
                Literal::Uint(_) => Type::Uint,
                Literal::Double(_) => Type::Double,
                Literal::String(_) => Type::String,
                Literal::Bytes(_) => Type::Bytes,
            }),
            Expr::Ident(name) => self
                .scope
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t.clone())
                .ok_or_else(|| format!("undeclared reference to '{}'", name)),
            Expr::List(items) => {
                let mut elem: Option<Type> = None;
                for item in items {
                    let t = self.check(item)?;
                    elem = Some(match elem {
                        None => t,
                        Some(e) => e.join(&t),
                    });
                }
                Ok(Type::List(Box::new(elem.unwrap_or(Type::Dyn))))
            }
            Expr::Map(entries) => {
                let mut key: Option<Type> = None;
                let mut val: Option<Type> = None;
                for (k, v) in entries {
                    let kt = self.check(k)?;
                    if !matches!(kt, Type::Bool | Type::Int | Type::Uint | Type::String | Type::Dyn) {
                        return Err(format!("unsupported map key type: {}", kt));
                    }
                    let vt = self.check(v)?;
                    key = Some(match key {
                        None => kt,
                        Some(e) => e.join(&kt),
                    });
                    val = Some(match val {
                        None => vt,
                        Some(e) => e.join(&vt),
                    });
                }
                Ok(Type::Map(Box::new(key.unwrap_or(Type::Dyn)), Box::new(val.unwrap_or(Type::Dyn))))
            }
            Expr::Unary(op, operand) => {
                let t = self.check(operand)?;
                match (op, &t) {
                    (_, Type::Dyn) => Ok(if *op == UnaryOp::Not { Type::Bool } else { Type::Dyn }),
                    (UnaryOp::Not, Type::Bool) => Ok(Type::Bool),
                    (UnaryOp::Neg, Type::Int | Type::Double | Type::Duration) => Ok(t.clone()),
                    (UnaryOp::Not, _) => Err(no_overload("!_", &[&t])),
                    (UnaryOp::Neg, _) => Err(no_overload("-_", &[&t])),
                }
            }
            Expr::Binary(op, l, r) => {
                let lt = self.check(l)?;
                let rt = self.check(r)?;
                binary_type(*op, &lt, &rt)
            }
            Expr::Ternary(c, t, e) => {
                let ct = self.check(c)?;
                if !matches!(ct, Type::Bool | Type::Dyn) {
                    return Err(no_overload("_?_:_", &[&ct]));
                }
                let tt = self.check(t)?;
                let et = self.check(e)?;
                Ok(tt.join(&et))
            }
            Expr::Select { operand, field, optional } => {
                let t = self.check(operand)?;
                let (inner, via_optional) = match t {
                    Type::Optional(inner) => (*inner, true),
                    other => (other, false),
                };
                let field_type = match inner {
                    Type::Map(_, v) => *v,
                    Type::Dyn => Type::Dyn,
                    other => return Err(format!("type '{}' does not support field selection: {}", other, field)),
                };
                Ok(if *optional || via_optional { Type::Optional(Box::new(field_type)) } else { field_type })
            }
            Expr::Index { operand, index, optional } => {
                let t = self.check(operand)?;
                let it = self.check(index)?;
                let (inner, via_optional) = match t {
                    Type::Optional(inner) => (*inner, true),
                    other => (other, false),
                };
                let elem = match (&inner, &it) {
                    (Type::List(e), Type::Int | Type::Uint | Type::Dyn) => (**e).clone(),
                    (Type::Map(_, v), _) => (**v).clone(),
                    (Type::Dyn, _) => Type::Dyn,
                    _ => return Err(no_overload("_[_]", &[&inner, &it])),
                };
                Ok(if *optional || via_optional { Type::Optional(Box::new(elem)) } else { elem })
            }
            Expr::Has { operand, field } => match self.check(operand)? {
                Type::Map(..) | Type::Dyn => Ok(Type::Bool),
                other => Err(format!("type '{}' does not support presence test: {}", other, field)),
            },
            Expr::Comprehension { kind, range, var, body } => {
                let var_type = match self.check(range)? {
                    Type::List(e) => *e,
                    Type::Map(k, _) => *k,
                    Type::Dyn => Type::Dyn,
                    other => return Err(format!("expression of type '{}' cannot be the range of a comprehension", other)),
                };
                self.scope.push((var.clone(), var_type.clone()));
                let body_type = self.check(body);
                self.scope.pop();
                let body_type = body_type?;
                match kind {
                    MacroKind::Map => Ok(Type::List(Box::new(body_type))),
                    _ if !matches!(body_type, Type::Bool | Type::Dyn) => {
                        Err(format!("comprehension predicate must be bool, got {}", body_type))
                    }
                    MacroKind::Filter => Ok(Type::List(Box::new(var_type))),
                    _ => Ok(Type::Bool),
                }
            }
            Expr::Bind { var, init, body } => {
                let init_type = self.check(init)?;
                self.scope.push((var.clone(), init_type));
                let body_type = self.check(body);
                self.scope.pop();
                body_type
            }
            Expr::Call { target, function, args } => {
                let target_type = match target {
                    Some(t) => Some(self.check(t)?),
                    None => None,
                };
                let arg_types = args.iter().map(|a| self.check(a)).collect::<Result<Vec<_>, _>>()?;
                match target_type {
                    None => function_type(function, &arg_types),
                    Some(t) => method_type(&t, function, &arg_types),
                }
            }
        }
    }
}

fn binary_type(op: BinaryOp, lt: &Type, rt: &Type) -> Result<Type, String> {
    use BinaryOp::*;
    let fail = || Err(no_overload(&format!("_{}_", op.symbol()), &[lt, rt]));
    match op {
        Or | And => match (lt, rt) {
            (Type::Bool | Type::Dyn, Type::Bool | Type::Dyn) => Ok(Type::Bool),
            _ => fail(),
        },
        Eq | Ne if lt.comparable(rt) => Ok(Type::Bool),
        Eq | Ne => fail(),
        Lt | Le | Gt | Ge => {
            let ok = lt.is_dyn()
                || rt.is_dyn()
                || (lt.is_numeric() && rt.is_numeric())
                || (lt == rt
                    && matches!(lt, Type::Bool | Type::String | Type::Bytes | Type::Timestamp | Type::Duration));
            if ok {
                Ok(Type::Bool)
            } else {
                fail()
            }
        }
        In => match rt {
            Type::List(_) | Type::Map(..) | Type::Dyn => Ok(Type::Bool),
            _ => fail(),
        },
        Add | Sub | Mul | Div | Rem => {
            if lt.is_dyn() || rt.is_dyn() {
                return Ok(match (lt, rt, op) {
                    (Type::Timestamp, _, Sub) | (_, Type::Timestamp, Sub) => Type::Dyn,
                    (Type::Dyn, other, _) | (other, Type::Dyn, _) if other.is_numeric() => other.clone(),
                    _ => Type::Dyn,
                });
            }
            match (op, lt, rt) {
                (Rem, Type::Double, Type::Double) => fail(),
                (_, a, b) if a == b && a.is_numeric() => Ok(a.clone()),
                (Add, Type::String, Type::String) => Ok(Type::String),
                (Add, Type::Bytes, Type::Bytes) => Ok(Type::Bytes),
                (Add, Type::List(a), Type::List(b)) => Ok(Type::List(Box::new((**a).clone().join(b)))),
                (Add, Type::Timestamp, Type::Duration) | (Add, Type::Duration, Type::Timestamp) => Ok(Type::Timestamp),
                (Add | Sub, Type::Duration, Type::Duration) => Ok(Type::Duration),
                (Sub, Type::Timestamp, Type::Duration) => Ok(Type::Timestamp),
                (Sub, Type::Timestamp, Type::Timestamp) => Ok(Type::Duration),
                _ => fail(),
            }
        }
    }
}

fn function_type(function: &str, args: &[Type]) -> Result<Type, String> {
    let refs: Vec<&Type> = args.iter().collect();
    let fail = || Err(no_overload(function, &refs));
    let one = |allowed: &dyn Fn(&Type) -> bool, result: Type| -> Result<Type, String> {
        match args {
            [a] if a.is_dyn() || allowed(a) => Ok(result),
            _ => Err(no_overload(function, &refs)),
        }
    };
    match function {
        "size" => one(&|t: &Type| matches!(t, Type::String | Type::Bytes | Type::List(_) | Type::Map(..)), Type::Int),
        "int" => one(
            &|t: &Type| matches!(t, Type::Int | Type::Uint | Type::Double | Type::String | Type::Timestamp),
            Type::Int,
        ),
        "uint" => one(&|t: &Type| matches!(t, Type::Int | Type::Uint | Type::Double | Type::String), Type::Uint),
        "double" => one(&|t: &Type| matches!(t, Type::Int | Type::Uint | Type::Double | Type::String), Type::Double),
        "string" => one(
            &|t: &Type| {
                matches!(
                    t,
                    Type::Bool
                        | Type::Int
                        | Type::Uint
                        | Type::Double
                        | Type::String
                        | Type::Bytes
                        | Type::Timestamp
                        | Type::Duration
                )
            },
            Type::String,
        ),
        "bool" => one(&|t: &Type| matches!(t, Type::Bool | Type::String), Type::Bool),
        "bytes" => one(&|t: &Type| matches!(t, Type::String | Type::Bytes), Type::Bytes),
        "timestamp" => one(&|t: &Type| matches!(t, Type::String | Type::Int | Type::Timestamp), Type::Timestamp),
        "duration" => one(&|t: &Type| matches!(t, Type::String | Type::Duration), Type::Duration),
        "dyn" => one(&|_: &Type| true, Type::Dyn),
        "matches" => match args {
            [a, b] if matches!(a, Type::String | Type::Dyn) && matches!(b, Type::String | Type::Dyn) => Ok(Type::Bool),
            _ => fail(),
        },
        "optional.of" | "optional.ofNonZeroValue" => match args {
            [a] => Ok(Type::Optional(Box::new(a.clone()))),
            _ => fail(),
        },
        "optional.none" => match args {
            [] => Ok(Type::Optional(Box::new(Type::Dyn))),
            _ => fail(),
        },
        _ => Err(format!("undeclared reference to '{}'", function)),
    }
}

fn method_type(target: &Type, method: &str, args: &[Type]) -> Result<Type, String> {
    let mut refs: Vec<&Type> = vec![target];
    refs.extend(args.iter());
    let fail = || Err(no_overload(method, &refs));
    let str_arg = |t: &Type| matches!(t, Type::String | Type::Dyn);
    let int_arg = |t: &Type| matches!(t, Type::Int | Type::Dyn);

    if let Type::Optional(inner) = target {
        return match (method, args) {
            ("hasValue", []) => Ok(Type::Bool),
            ("value", []) => Ok((**inner).clone()),
            ("orValue", [d]) => Ok((**inner).clone().join(d)),
            ("or", [Type::Optional(other)]) => Ok(Type::Optional(Box::new((**inner).clone().join(other)))),
            ("or", [Type::Dyn]) => Ok(Type::Optional(Box::new(Type::Dyn))),
            _ => fail(),
        };
    }

    let string_method = |args: &[Type]| -> Option<Type> {
        Some(match (method, args) {
            ("contains" | "startsWith" | "endsWith" | "matches", [a]) if str_arg(a) => Type::Bool,
            ("lowerAscii" | "upperAscii" | "trim", []) => Type::String,
            ("size", []) => Type::Int,
            ("indexOf", [a]) if str_arg(a) => Type::Int,
            ("replace", [a, b]) if str_arg(a) && str_arg(b) => Type::String,
            ("split", [a]) if str_arg(a) => Type::List(Box::new(Type::String)),
            ("substring", [a]) if int_arg(a) => Type::String,
            ("substring", [a, b]) if int_arg(a) && int_arg(b) => Type::String,
            _ => return None,
        })
    };
    let time_method = |args: &[Type], is_timestamp: bool| -> Option<Type> {
        let name_ok = match method {
            "getHours" | "getMinutes" | "getSeconds" | "getMilliseconds" => true,
            "getFullYear" | "getMonth" | "getDayOfMonth" | "getDate" | "getDayOfWeek" | "getDayOfYear" => {
                is_timestamp
            }
            _ => false,
        };
        let args_ok = match args {
            [] => true,
            [tz] => is_timestamp && str_arg(tz),
            _ => false,
        };
        (name_ok && args_ok).then_some(Type::Int)
    };

    let found = match target {
        Type::String => string_method(args),
        Type::Timestamp => time_method(args, true),
        Type::Duration => time_method(args, false),
        Type::Bytes | Type::List(_) | Type::Map(..) if method == "size" && args.is_empty() => Some(Type::Int),
        Type::Dyn => string_method(args)
            .or_else(|| time_method(args, true))
            .or_else(|| match (method, args) {
                ("hasValue", []) => Some(Type::Bool),
                ("value" | "orValue", _) => Some(Type::Dyn),
                ("or", [_]) => Some(Type::Optional(Box::new(Type::Dyn))),
                _ => None,
            }),
        _ => None,
    };
    match found {
        Some(t) => Ok(t),
        None => fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parser::parse;

    fn type_of(src: &str) -> Result<Type, String> {
        check(&parse(src).expect("parse"), &record_variables())
    }

    #[test]
    fn record_variables_have_fixed_types() {
        assert_eq!(type_of("msg").expect("msg"), Type::String);
        assert_eq!(type_of("time").expect("time"), Type::Timestamp);
        assert_eq!(type_of("attrs.x").expect("attrs"), Type::Dyn);
        assert_eq!(type_of("attrs.?x").expect("opt"), Type::Optional(Box::new(Type::Dyn)));
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        assert!(type_of("foo == 1").expect_err("undeclared").contains("undeclared reference"));
    }

    #[test]
    fn mismatched_operands_are_rejected() {
        assert!(type_of("msg + 1").is_err());
        assert!(type_of("1 + 2.0").is_err());
        assert!(type_of("msg < 1").is_err());
        assert!(type_of("msg.getHours()").is_err());
        assert_eq!(type_of("time - time").expect("sub"), Type::Duration);
    }

    #[test]
    fn equality_needs_comparable_operands() {
        assert!(type_of("msg == 1").expect_err("string vs int").contains("no matching overload"));
        assert!(type_of("time != duration('1s')").is_err());
        assert!(type_of("[1] == ['a']").is_err());
        assert_eq!(type_of("1 == 1u").expect("numeric"), Type::Bool);
        assert_eq!(type_of("attrs.x == 1").expect("dyn"), Type::Bool);
        assert_eq!(type_of("[1, 2] == []").expect("empty list"), Type::Bool);
        assert_eq!(type_of("attrs.?x == optional.none()").expect("optional"), Type::Bool);
    }

    #[test]
    fn comprehension_scopes_do_not_leak() {
        assert_eq!(type_of("[1, 2].all(x, x > 0)").expect("all"), Type::Bool);
        assert!(type_of("[1].all(x, x > 0) && x == 1").is_err());
        assert_eq!(type_of("[1, 2].map(x, x * 2)").expect("map"), Type::List(Box::new(Type::Int)));
    }
}
