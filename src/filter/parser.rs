//! Parse filter source into an [`Expr`] using PEST, expanding macros on the way.

use super::ast::*;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser as PestParser;

#[derive(PestParser)]
#[grammar = "filter/grammar.pest"]
struct FilterParser;

/// Longest accepted source, in characters.
pub const MAX_SOURCE_CHARS: usize = 100_000;
/// Deepest accepted bracket or ternary nesting in the source.
pub const MAX_NESTING: usize = 64;
/// Deepest accepted expression tree.
pub const MAX_TREE_DEPTH: usize = 250;

/// Parse filter source into an expression tree.
pub fn parse(source: &str) -> Result<Expr, String> {
    let chars = source.chars().count();
    if chars > MAX_SOURCE_CHARS {
        return Err(format!("expression is {} characters long, limit is {}", chars, MAX_SOURCE_CHARS));
    }
    check_nesting(source)?;
    let expr = parse_tree(source)?;
    if expr.depth() > MAX_TREE_DEPTH {
        return Err(format!("expression nested deeper than {}", MAX_TREE_DEPTH));
    }
    Ok(expr)
}

/// Reject deep nesting before the recursive-descent parser sees it. Quoted text is skipped.
///
/// A ternary's else branch runs to the end of its enclosing bracket or argument, so each `?`
/// stays open until then.
fn check_nesting(source: &str) -> Result<(), String> {
    let too_deep = || format!("expression nested deeper than {}", MAX_NESTING);
    let mut depth = 0usize;
    // Open ternaries per bracket level, innermost last.
    let mut ternaries: Vec<usize> = vec![0];
    let mut quote: Option<char> = None;
    let mut prev = ' ';
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' {
                chars.next();
            } else if c == q {
                quote = None;
            }
            continue;
        }
        let ternary = c == '?' && prev != '.' && prev != '[';
        if !c.is_whitespace() {
            prev = c;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '?' if ternary => {
                depth += 1;
                if let Some(open) = ternaries.last_mut() {
                    *open += 1;
                }
                if depth > MAX_NESTING {
                    return Err(too_deep());
                }
            }
            '(' | '[' | '{' => {
                depth += 1;
                ternaries.push(0);
                if depth > MAX_NESTING {
                    return Err(too_deep());
                }
            }
            ',' => {
                if let Some(open) = ternaries.last_mut() {
                    depth = depth.saturating_sub(*open);
                    *open = 0;
                }
            }
            ')' | ']' | '}' => {
                let open = if ternaries.len() > 1 { ternaries.pop().unwrap_or(0) } else { 0 };
                depth = depth.saturating_sub(open + 1);
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_tree(source: &str) -> Result<Expr, String> {
    let pairs = FilterParser::parse(Rule::filter, source).map_err(|e| format!("Parse error: {}", e))?;
    let filter = pairs.into_iter().next().ok_or("Empty parse")?;
    let expr = filter.into_inner().next().ok_or("Empty expression")?;
    build_expr(expr)
}

fn build_expr(pair: Pair<Rule>) -> Result<Expr, String> {
    match pair.as_rule() {
        Rule::expr => {
            let mut it = pair.into_inner();
            let cond = build_expr(it.next().ok_or("expr: condition")?)?;
            match (it.next(), it.next()) {
                (Some(t), Some(e)) => Ok(Expr::Ternary(
                    Box::new(cond),
                    Box::new(build_expr(t)?),
                    Box::new(build_expr(e)?),
                )),
                _ => Ok(cond),
            }
        }
        Rule::or_expr => fold_fixed(pair, BinaryOp::Or),
        Rule::and_expr => fold_fixed(pair, BinaryOp::And),
        Rule::rel_expr | Rule::add_expr | Rule::mul_expr => fold_ops(pair),
        Rule::unary => build_unary(pair),
        Rule::member => build_member(pair),
        _ => build_primary(pair),
    }
}

/// Left fold for levels with a single operator that the grammar does not capture.
fn fold_fixed(pair: Pair<Rule>, op: BinaryOp) -> Result<Expr, String> {
    let mut it = pair.into_inner();
    let mut acc = build_expr(it.next().ok_or("binary: left operand")?)?;
    for rhs in it {
        acc = Expr::Binary(op, Box::new(acc), Box::new(build_expr(rhs)?));
    }
    Ok(acc)
}

/// Left fold for `operand (op operand)*` levels.
fn fold_ops(pair: Pair<Rule>) -> Result<Expr, String> {
    let mut it = pair.into_inner();
    let mut acc = build_expr(it.next().ok_or("binary: left operand")?)?;
    while let Some(op_pair) = it.next() {
        let op = match op_pair.as_str() {
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "in" => BinaryOp::In,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            other => return Err(format!("unknown operator: {}", other)),
        };
        let rhs = build_expr(it.next().ok_or("binary: right operand")?)?;
        acc = Expr::Binary(op, Box::new(acc), Box::new(rhs));
    }
    Ok(acc)
}

fn build_unary(pair: Pair<Rule>) -> Result<Expr, String> {
    let mut ops = Vec::new();
    let mut operand = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::unary_op => ops.push(if inner.as_str() == "!" { UnaryOp::Not } else { UnaryOp::Neg }),
            _ => operand = Some(inner),
        }
    }
    let operand = operand.ok_or("unary: operand")?;
    // `-9223372036854775808` is only representable when the sign is part of the literal.
    if ops.last() == Some(&UnaryOp::Neg) && is_bare_int(&operand) {
        ops.pop();
        let text = format!("-{}", operand.as_str().trim());
        let mut e = Expr::Literal(Literal::Int(parse_int(&text)?));
        for op in ops.into_iter().rev() {
            e = Expr::Unary(op, Box::new(e));
        }
        return Ok(e);
    }
    let mut e = build_expr(operand)?;
    for op in ops.into_iter().rev() {
        e = Expr::Unary(op, Box::new(e));
    }
    Ok(e)
}

fn is_bare_int(member: &Pair<Rule>) -> bool {
    let mut it = member.clone().into_inner();
    matches!((it.next().map(|p| p.as_rule()), it.next()), (Some(Rule::int_lit), None))
}

fn build_member(pair: Pair<Rule>) -> Result<Expr, String> {
    let mut it = pair.into_inner();
    let mut acc = build_expr(it.next().ok_or("member: primary")?)?;
    for post in it {
        acc = match post.as_rule() {
            Rule::select => {
                let mut inner = post.into_inner();
                let field = inner.next().ok_or("select: field")?.as_str().to_string();
                match inner.next() {
                    Some(args) => make_call(Some(acc), field, build_args(args)?)?,
                    None => Expr::Select { operand: Box::new(acc), field, optional: false },
                }
            }
            Rule::opt_select => {
                let field = post.into_inner().next().ok_or("opt_select: field")?.as_str().to_string();
                Expr::Select { operand: Box::new(acc), field, optional: true }
            }
            Rule::index | Rule::opt_index => {
                let optional = post.as_rule() == Rule::opt_index;
                let index = build_expr(post.into_inner().next().ok_or("index: key")?)?;
                Expr::Index { operand: Box::new(acc), index: Box::new(index), optional }
            }
            other => return Err(format!("unexpected postfix: {:?}", other)),
        };
    }
    Ok(acc)
}

fn build_primary(pair: Pair<Rule>) -> Result<Expr, String> {
    Ok(match pair.as_rule() {
        Rule::null_lit => Expr::Literal(Literal::Null),
        Rule::bool_lit => Expr::Literal(Literal::Bool(pair.as_str() == "true")),
        Rule::int_lit => Expr::Literal(Literal::Int(parse_int(pair.as_str())?)),
        Rule::uint_lit => {
            let s = pair.as_str();
            Expr::Literal(Literal::Uint(parse_uint(&s[..s.len() - 1])?))
        }
        Rule::double_lit => Expr::Literal(Literal::Double(
            pair.as_str().parse::<f64>().map_err(|e| format!("invalid double literal: {}", e))?,
        )),
        Rule::string_lit => {
            let bytes = build_quoted(pair.into_inner().next().ok_or("string literal")?, false)?;
            Expr::Literal(Literal::String(
                String::from_utf8(bytes).map_err(|_| "invalid UTF-8 in string literal".to_string())?,
            ))
        }
        Rule::bytes_lit => {
            Expr::Literal(Literal::Bytes(build_quoted(pair.into_inner().next().ok_or("bytes literal")?, true)?))
        }
        Rule::ident => Expr::Ident(pair.as_str().to_string()),
        Rule::global_call => {
            let mut it = pair.into_inner();
            let name = it.next().ok_or("call: name")?.as_str().to_string();
            let args = build_args(it.next().ok_or("call: arguments")?)?;
            make_call(None, name, args)?
        }
        Rule::list => Expr::List(pair.into_inner().map(build_expr).collect::<Result<_, _>>()?),
        Rule::map => {
            let mut entries = Vec::new();
            for entry in pair.into_inner() {
                let mut kv = entry.into_inner();
                let k = build_expr(kv.next().ok_or("map entry: key")?)?;
                let v = build_expr(kv.next().ok_or("map entry: value")?)?;
                entries.push((k, v));
            }
            Expr::Map(entries)
        }
        other => return Err(format!("unexpected rule: {:?}", other)),
    })
}

fn build_args(pair: Pair<Rule>) -> Result<Vec<Expr>, String> {
    pair.into_inner().map(build_expr).collect()
}

/// Expand macros (`has`, comprehensions, `cel.bind`) and namespaced functions.
fn make_call(target: Option<Expr>, function: String, mut args: Vec<Expr>) -> Result<Expr, String> {
    match (target, function.as_str()) {
        (None, "has") => match args.pop() {
            Some(Expr::Select { operand, field, optional: false }) if args.is_empty() => {
                Ok(Expr::Has { operand, field })
            }
            _ => Err("invalid argument to has() macro".to_string()),
        },
        (Some(Expr::Ident(ns)), "bind") if ns == "cel" => {
            if args.len() != 3 {
                return Err("cel.bind() takes 3 arguments".to_string());
            }
            let body = args.pop().ok_or("cel.bind: body")?;
            let init = args.pop().ok_or("cel.bind: init")?;
            let Some(Expr::Ident(var)) = args.pop() else {
                return Err("cel.bind() variable name must be a simple identifier".to_string());
            };
            Ok(Expr::Bind { var, init: Box::new(init), body: Box::new(body) })
        }
        (Some(Expr::Ident(ns)), name) if ns == "optional" => {
            Ok(Expr::Call { target: None, function: format!("optional.{}", name), args })
        }
        (Some(range), name) if args.len() == 2 && macro_kind(name).is_some() => {
            let kind = macro_kind(name).ok_or("macro kind")?;
            let body = args.pop().ok_or("macro: body")?;
            let Some(Expr::Ident(var)) = args.pop() else {
                return Err(format!("{}() variable name must be a simple identifier", name));
            };
            Ok(Expr::Comprehension { kind, range: Box::new(range), var, body: Box::new(body) })
        }
        (target, name) => Ok(Expr::Call { target: target.map(Box::new), function: name.to_string(), args }),
    }
}

fn macro_kind(name: &str) -> Option<MacroKind> {
    Some(match name {
        "exists" => MacroKind::Exists,
        "all" => MacroKind::All,
        "exists_one" => MacroKind::ExistsOne,
        "map" => MacroKind::Map,
        "filter" => MacroKind::Filter,
        _ => return None,
    })
}

fn parse_int(s: &str) -> Result<i64, String> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let parsed = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|e| format!("invalid int literal {}: {}", s, e))?;
    let v = if neg { -parsed } else { parsed };
    i64::try_from(v).map_err(|_| format!("int literal out of range: {}", s))
}

fn parse_uint(s: &str) -> Result<u64, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    }
    .map_err(|e| format!("invalid uint literal {}: {}", s, e))
}

/// Decode a quoted literal (`raw_str`, `dq_str`, `sq_str`) into bytes.
fn build_quoted(pair: Pair<Rule>, bytes_mode: bool) -> Result<Vec<u8>, String> {
    let text = pair.as_str();
    match pair.as_rule() {
        Rule::raw_str => Ok(text[2..text.len() - 1].as_bytes().to_vec()),
        _ => unescape(&text[1..text.len() - 1], bytes_mode),
    }
}

/// Resolve backslash escapes. `\x` and octal escapes are raw bytes in byte literals and
/// code points in string literals.
fn unescape(body: &str, bytes_mode: bool) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(body.len());
    let mut chars = body.chars();
    let push_char = |out: &mut Vec<u8>, c: char| {
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    };
    while let Some(c) = chars.next() {
        if c != '\\' {
            push_char(&mut out, c);
            continue;
        }
        let esc = chars.next().ok_or("dangling escape")?;
        match esc {
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0c),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'v' => out.push(0x0b),
            '\\' | '\'' | '"' | '`' | '?' => out.push(esc as u8),
            'x' | 'X' | 'u' | 'U' => {
                let width = match esc {
                    'x' | 'X' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = chars.by_ref().take(width).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == width)
                    .ok_or_else(|| format!("invalid escape \\{}{}", esc, hex))?;
                if width == 2 && bytes_mode {
                    out.push(code as u8);
                } else {
                    let ch = char::from_u32(code).ok_or_else(|| format!("invalid code point {:#x}", code))?;
                    push_char(&mut out, ch);
                }
            }
            '0'..='7' => {
                let rest: String = chars.by_ref().take(2).collect();
                let oct = format!("{}{}", esc, rest);
                let code = u32::from_str_radix(&oct, 8)
                    .ok()
                    .filter(|v| oct.len() == 3 && *v <= 0o377)
                    .ok_or_else(|| format!("invalid octal escape \\{}", oct))?;
                if bytes_mode {
                    out.push(code as u8);
                } else {
                    push_char(&mut out, char::from(code as u8));
                }
            }
            other => return Err(format!("invalid escape \\{}", other)),
        }
    }
    Ok(out)
}
