//! Filter expression tree, produced by the parser with macros already expanded.

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// Iteration macros over a list (elements) or a map (keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    Exists,
    All,
    ExistsOne,
    Map,
    Filter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `a.b`, or `a.?b` when `optional`.
    Select { operand: Box<Expr>, field: String, optional: bool },
    /// `a[k]`, or `a[?k]` when `optional`.
    Index { operand: Box<Expr>, index: Box<Expr>, optional: bool },
    /// Global function (`target == None`) or method call.
    Call { target: Option<Box<Expr>>, function: String, args: Vec<Expr> },
    /// `has(a.b)`
    Has { operand: Box<Expr>, field: String },
    Comprehension { kind: MacroKind, range: Box<Expr>, var: String, body: Box<Expr> },
    /// `cel.bind(var, init, body)`
    Bind { var: String, init: Box<Expr>, body: Box<Expr> },
}

impl Expr {
    /// Direct subexpressions, in source order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_) | Expr::Ident(_) => Vec::new(),
            Expr::List(items) => items.iter().collect(),
            Expr::Map(entries) => entries.iter().flat_map(|(k, v)| [k, v]).collect(),
            Expr::Unary(_, e) => vec![&**e],
            Expr::Binary(_, l, r) => vec![&**l, &**r],
            Expr::Ternary(c, t, e) => vec![&**c, &**t, &**e],
            Expr::Select { operand, .. } | Expr::Has { operand, .. } => vec![&**operand],
            Expr::Index { operand, index, .. } => vec![&**operand, &**index],
            Expr::Call { target, args, .. } => target.as_deref().into_iter().chain(args).collect(),
            Expr::Comprehension { range, body, .. } => vec![&**range, &**body],
            Expr::Bind { init, body, .. } => vec![&**init, &**body],
        }
    }

    /// Visit this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            f(e);
            stack.extend(e.children().into_iter().rev());
        }
    }

    /// Height of the tree; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack = vec![(self, 1)];
        while let Some((e, d)) = stack.pop() {
            max = max.max(d);
            stack.extend(e.children().into_iter().map(|c| (c, d + 1)));
        }
        max
    }
}
