//! Production templates: the expression text inside `[...]`.
//!
//! Templates are parsed once, at grammar construction, into a small AST whose
//! placeholders `x1..xn` refer to the production's arguments. The AST drives
//! occurrence counting, precedence-aware rendering and native evaluation.

use std::fmt;

/// Binding power of the ternary conditional.
pub const PREC_TERNARY: u8 = 1;
/// Binding power of unary prefix operators.
pub const PREC_UNARY: u8 = 8;
/// Binding power of literals, placeholders and calls.
pub const PREC_ATOM: u8 = 9;

/// Binary operators, in the usual C precedence order.
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
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn precedence(self) -> u8 {
        match self {
            Self::Or => 2,
            Self::And => 3,
            Self::Eq | Self::Ne => 4,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 5,
            Self::Add | Self::Sub => 6,
            Self::Mul | Self::Div | Self::Rem => 7,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
        }
    }
}

/// Math library functions callable from templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Log10,
    Sqrt,
    Cbrt,
    Abs,
    Pow,
    Min,
    Max,
    Floor,
    Ceil,
    Round,
    Signum,
    Hypot,
}

impl Function {
    const ALL: [Function; 24] = [
        Self::Sin,
        Self::Cos,
        Self::Tan,
        Self::Asin,
        Self::Acos,
        Self::Atan,
        Self::Atan2,
        Self::Sinh,
        Self::Cosh,
        Self::Tanh,
        Self::Exp,
        Self::Log,
        Self::Log10,
        Self::Sqrt,
        Self::Cbrt,
        Self::Abs,
        Self::Pow,
        Self::Min,
        Self::Max,
        Self::Floor,
        Self::Ceil,
        Self::Round,
        Self::Signum,
        Self::Hypot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Asin => "asin",
            Self::Acos => "acos",
            Self::Atan => "atan",
            Self::Atan2 => "atan2",
            Self::Sinh => "sinh",
            Self::Cosh => "cosh",
            Self::Tanh => "tanh",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Log10 => "log10",
            Self::Sqrt => "sqrt",
            Self::Cbrt => "cbrt",
            Self::Abs => "abs",
            Self::Pow => "pow",
            Self::Min => "min",
            Self::Max => "max",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Round => "round",
            Self::Signum => "signum",
            Self::Hypot => "hypot",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Self::Atan2 | Self::Pow | Self::Min | Self::Max | Self::Hypot => 2,
            _ => 1,
        }
    }

    fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Template AST node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Zero-based argument placeholder (`x1` is `Arg(0)`).
    Arg(usize),
    Num(f64),
    Bool(bool),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

impl Node {
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Arg(_) | Self::Num(_) | Self::Bool(_) | Self::Call(..) => PREC_ATOM,
            Self::Unary(..) => PREC_UNARY,
            Self::Binary(op, ..) => op.precedence(),
            Self::Ternary(..) => PREC_TERNARY,
        }
    }

    fn visit_args(&self, f: &mut impl FnMut(usize)) {
        match self {
            Self::Arg(idx) => f(*idx),
            Self::Num(_) | Self::Bool(_) => {}
            Self::Unary(_, inner) => inner.visit_args(f),
            Self::Binary(_, lhs, rhs) => {
                lhs.visit_args(f);
                rhs.visit_args(f);
            }
            Self::Ternary(cond, then, other) => {
                cond.visit_args(f);
                then.visit_args(f);
                other.visit_args(f);
            }
            Self::Call(_, args) => args.iter().for_each(|a| a.visit_args(f)),
        }
    }
}

/// Template parsing errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("Unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("Unexpected '{token}' at offset {offset}")]
    UnexpectedToken { token: String, offset: usize },
    #[error("Unexpected end of template")]
    UnexpectedEnd,
    #[error("Invalid placeholder '{0}', placeholders are x1, x2, ...")]
    InvalidPlaceholder(String),
    #[error("Unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("Function '{name}' takes {expected} argument(s), got {found}")]
    WrongArity {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Invalid number literal '{0}'")]
    InvalidNumber(String),
}

/// A parsed production template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    root: Node,
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Template {
    /// Parse template text such as `$sin(x1) * x2`.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expression(0)?;
        if let Some((token, offset)) = parser.tokens.get(parser.pos) {
            return Err(TemplateError::UnexpectedToken {
                token: token.to_string(),
                offset: *offset,
            });
        }
        Ok(Self {
            source: source.trim().to_string(),
            root,
        })
    }

    /// The template text, trimmed.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// `true` for the identity template `x1`.
    pub fn is_placement(&self) -> bool {
        self.root == Node::Arg(0)
    }

    /// Highest placeholder index referenced, if any.
    pub fn max_arg(&self) -> Option<usize> {
        let mut max = None;
        self.root.visit_args(&mut |idx| max = max.max(Some(idx)));
        max
    }

    /// Number of times each of the `arity` arguments appears in the template.
    pub fn occurrences(&self, arity: usize) -> Vec<usize> {
        let mut counts = vec![0; arity];
        self.root.visit_args(&mut |idx| {
            if let Some(count) = counts.get_mut(idx) {
                *count += 1;
            }
        });
        counts
    }

    /// Render with each placeholder replaced by `(text, precedence)` of its argument.
    pub fn render(&self, args: &[(String, u8)]) -> (String, u8) {
        render_node(&self.root, args)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn wrap(text: String, parens: bool) -> String {
    if parens { format!("({text})") } else { text }
}

fn render_node(node: &Node, args: &[(String, u8)]) -> (String, u8) {
    match node {
        Node::Arg(idx) => args
            .get(*idx)
            .cloned()
            .unwrap_or_else(|| (format!("x{}", idx + 1), PREC_ATOM)),
        Node::Num(value) => (format_number(*value), PREC_ATOM),
        Node::Bool(value) => (value.to_string(), PREC_ATOM),
        Node::Unary(op, inner) => {
            let (text, prec) = render_node(inner, args);
            let parens = prec < PREC_UNARY || text.starts_with('-') || text.starts_with('!');
            (format!("{}{}", op.symbol(), wrap(text, parens)), PREC_UNARY)
        }
        Node::Binary(op, lhs, rhs) => {
            let prec = op.precedence();
            let (left, left_prec) = render_node(lhs, args);
            let (right, right_prec) = render_node(rhs, args);
            (
                format!(
                    "{} {} {}",
                    wrap(left, left_prec < prec),
                    op.symbol(),
                    wrap(right, right_prec <= prec)
                ),
                prec,
            )
        }
        Node::Ternary(cond, then, other) => {
            let (cond, cond_prec) = render_node(cond, args);
            let (then, _) = render_node(then, args);
            let (other, _) = render_node(other, args);
            (
                format!("{} ? {} : {}", wrap(cond, cond_prec <= PREC_TERNARY), then, other),
                PREC_TERNARY,
            )
        }
        Node::Call(func, call_args) => {
            let rendered: Vec<String> = call_args.iter().map(|a| render_node(a, args).0).collect();
            (format!("{}({})", func.name(), rendered.join(", ")), PREC_ATOM)
        }
    }
}

/// Format a numeric literal so it always reads back as a number.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(value) => write!(f, "{value}"),
            Self::Ident(name) => f.write_str(name),
            Self::Op(op) => f.write_str(op),
        }
    }
}

const OPERATORS: [&str; 19] = [
    "<=", ">=", "==", "!=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "?", ":", "(",
    ")", ",",
];

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, TemplateError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let ch = bytes[pos] as char;
        if ch.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;
        if ch.is_ascii_digit() || (ch == '.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit))
        {
            while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                pos += 1;
            }
            // Optional exponent part.
            if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
                let mut end = pos + 1;
                if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
                    end += 1;
                }
                if end < bytes.len() && bytes[end].is_ascii_digit() {
                    pos = end;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
            }
            let text = &source[start..pos];
            let value = text
                .parse::<f64>()
                .map_err(|_| TemplateError::InvalidNumber(text.to_string()))?;
            tokens.push((Token::Num(value), start));
            continue;
        }

        if ch == '$' || ch.is_ascii_alphabetic() || ch == '_' {
            // `$` marks a math library call and carries no meaning of its own.
            if ch == '$' {
                pos += 1;
            }
            let name_start = pos;
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            if name_start == pos {
                return Err(TemplateError::UnexpectedChar { ch, offset: start });
            }
            tokens.push((Token::Ident(source[name_start..pos].to_string()), start));
            continue;
        }

        let rest = &source[pos..];
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push((Token::Op(op), start));
                pos += op.len();
            }
            None => {
                let ch = rest.chars().next().unwrap_or(ch);
                return Err(TemplateError::UnexpectedChar { ch, offset: start });
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn next(&mut self) -> Result<(Token, usize), TemplateError> {
        let item = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(TemplateError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(item)
    }

    fn expect(&mut self, op: &'static str) -> Result<(), TemplateError> {
        match self.next()? {
            (Token::Op(found), _) if found == op => Ok(()),
            (token, offset) => Err(TemplateError::UnexpectedToken {
                token: token.to_string(),
                offset,
            }),
        }
    }

    fn expression(&mut self, min_prec: u8) -> Result<Node, TemplateError> {
        let mut lhs = self.prefix()?;

        loop {
            let Some(Token::Op(op)) = self.peek() else {
                break;
            };
            let op = *op;

            if op == "?" {
                if PREC_TERNARY < min_prec {
                    break;
                }
                self.pos += 1;
                let then = self.expression(0)?;
                self.expect(":")?;
                let other = self.expression(PREC_TERNARY)?;
                lhs = Node::Ternary(Box::new(lhs), Box::new(then), Box::new(other));
                continue;
            }

            let Some(binary) = binary_op(op) else {
                break;
            };
            let prec = binary.precedence();
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(prec + 1)?;
            lhs = Node::Binary(binary, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Node, TemplateError> {
        let (token, offset) = self.next()?;
        match token {
            Token::Num(value) => Ok(Node::Num(value)),
            Token::Op("-") => Ok(Node::Unary(
                UnaryOp::Neg,
                Box::new(self.expression(PREC_UNARY)?),
            )),
            Token::Op("!") => Ok(Node::Unary(
                UnaryOp::Not,
                Box::new(self.expression(PREC_UNARY)?),
            )),
            Token::Op("(") => {
                let inner = self.expression(0)?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Ident(name) => self.identifier(name),
            token => Err(TemplateError::UnexpectedToken {
                token: token.to_string(),
                offset,
            }),
        }
    }

    fn identifier(&mut self, name: String) -> Result<Node, TemplateError> {
        if matches!(self.peek(), Some(Token::Op("("))) {
            self.pos += 1;
            let func =
                Function::lookup(&name).ok_or_else(|| TemplateError::UnknownIdentifier(name))?;
            let mut args = Vec::new();
            if !matches!(self.peek(), Some(Token::Op(")"))) {
                loop {
                    args.push(self.expression(0)?);
                    if matches!(self.peek(), Some(Token::Op(","))) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            self.expect(")")?;
            if args.len() != func.arity() {
                return Err(TemplateError::WrongArity {
                    name: func.name(),
                    expected: func.arity(),
                    found: args.len(),
                });
            }
            return Ok(Node::Call(func, args));
        }

        match name.as_str() {
            "true" => Ok(Node::Bool(true)),
            "false" => Ok(Node::Bool(false)),
            "PI" => Ok(Node::Num(std::f64::consts::PI)),
            "E" => Ok(Node::Num(std::f64::consts::E)),
            _ => placeholder(&name),
        }
    }
}

fn placeholder(name: &str) -> Result<Node, TemplateError> {
    let Some(digits) = name.strip_prefix('x') else {
        return Err(TemplateError::UnknownIdentifier(name.to_string()));
    };
    match digits.parse::<usize>() {
        Ok(n) if n >= 1 && !digits.starts_with('0') => Ok(Node::Arg(n - 1)),
        _ => Err(TemplateError::InvalidPlaceholder(name.to_string())),
    }
}

fn binary_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "||" => BinaryOp::Or,
        "&&" => BinaryOp::And,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        _ => return None,
    })
}
