//! Syntax for the declarative scene language.
//!
//! Submitted code is a sequence of single-line statements: imports,
//! assignments to top-level names, deletions and expressions. Expressions
//! cover literals, lists, dicts, arithmetic and comparison operators,
//! function calls with keyword arguments, and method calls on named
//! bindings. That is the surface an agent needs to build up a scene
//! incrementally; anything fancier is a parse error reported back through
//! the error stream, never a protocol failure.

use std::{fmt, iter::Peekable, str::Chars};

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `import m` / `import m as n` / `from m import a, b`
    Import { module: String, bindings: Vec<String> },
    /// `name = expr`
    Assign { name: String, expr: Expr },
    /// `del name`
    Del { name: String },
    /// A bare expression; its value becomes the execution result.
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        target: Target,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
}

/// What a call is applied to: a free function or a method on a binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Function(String),
    Method { object: String, method: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// Coarse, line-level classification used by context compaction. Must agree
/// with the parser on what counts as an import or a top-level assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Blank,
    Import,
    Assign(String),
    Other,
}

pub fn classify_line(line: &str) -> LineKind {
    let t = line.trim();
    if t.is_empty() || t.starts_with('#') {
        return LineKind::Blank;
    }
    if t.starts_with("import ") || t.starts_with("from ") {
        return LineKind::Import;
    }
    if let Some((lhs, rhs)) = t.split_once('=') {
        let name = lhs.trim();
        if !rhs.starts_with('=') && is_identifier(name) {
            return LineKind::Assign(name.to_string());
        }
    }
    LineKind::Other
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a whole submission into statements, one per non-blank line.
pub fn parse_program(src: &str) -> Result<Vec<Stmt>, String> {
    let mut stmts = Vec::new();
    for (lineno, line) in src.lines().enumerate() {
        let t = line.trim();
        if t.is_empty() || t.starts_with('#') {
            continue;
        }
        for piece in t.split(';') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let stmt = parse_statement(piece)
                .map_err(|e| format!("line {}: {e}", lineno + 1))?;
            stmts.push(stmt);
        }
    }
    Ok(stmts)
}

fn parse_statement(line: &str) -> Result<Stmt, String> {
    if let Some(rest) = line.strip_prefix("import ") {
        let mut parts = rest.split_whitespace();
        let module = parts.next().ok_or("import needs a module name")?.to_string();
        let binding = match (parts.next(), parts.next()) {
            (None, _) => module.clone(),
            (Some("as"), Some(alias)) => alias.to_string(),
            _ => return Err("expected 'import m' or 'import m as n'".into()),
        };
        return Ok(Stmt::Import {
            module,
            bindings: vec![binding],
        });
    }
    if let Some(rest) = line.strip_prefix("from ") {
        let (module, names) = rest
            .split_once(" import ")
            .ok_or("expected 'from m import a, b'")?;
        let bindings: Vec<String> = names
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if bindings.is_empty() {
            return Err("'from ... import' needs at least one name".into());
        }
        return Ok(Stmt::Import {
            module: module.trim().to_string(),
            bindings,
        });
    }
    if let Some(rest) = line.strip_prefix("del ") {
        let name = rest.trim();
        if !is_identifier(name) {
            return Err(format!("cannot delete '{name}'"));
        }
        return Ok(Stmt::Del {
            name: name.to_string(),
        });
    }

    if let LineKind::Assign(name) = classify_line(line) {
        let (_, rhs) = line.split_once('=').unwrap();
        let expr = parse_expr_str(rhs)?;
        return Ok(Stmt::Assign { name, expr });
    }

    Ok(Stmt::Expr(parse_expr_str(line)?))
}

fn parse_expr_str(src: &str) -> Result<Expr, String> {
    let mut p = Parser::new(src);
    let expr = p.expression()?;
    p.expect_end()?;
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Punct(&'static str),
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    // Pushback stack; the last element is the next token.
    pending: Vec<Tok>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Parser<'a> {
        Parser {
            chars: src.chars().peekable(),
            pending: Vec::new(),
        }
    }

    fn push_back(&mut self, t: Tok) {
        self.pending.push(t);
    }

    fn next_tok(&mut self) -> Result<Option<Tok>, String> {
        if let Some(t) = self.pending.pop() {
            return Ok(Some(t));
        }
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
        let Some(&c) = self.chars.peek() else {
            return Ok(None);
        };
        if c == '#' {
            // trailing comment ends the line
            self.chars.by_ref().for_each(drop);
            return Ok(None);
        }
        if c.is_ascii_digit() {
            return Ok(Some(self.number()?));
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let mut name = String::new();
            while matches!(self.chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
                name.push(self.chars.next().unwrap());
            }
            return Ok(Some(Tok::Name(name)));
        }
        if c == '"' || c == '\'' {
            return Ok(Some(self.string(c)?));
        }

        self.chars.next();
        let two = |p: &mut Self, next: char, yes: &'static str, no: &'static str| {
            if p.chars.peek() == Some(&next) {
                p.chars.next();
                yes
            } else {
                no
            }
        };
        let punct = match c {
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            '{' => "{",
            '}' => "}",
            ',' => ",",
            ':' => ":",
            '.' => ".",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '%' => "%",
            '=' => two(self, '=', "==", "="),
            '!' => {
                if self.chars.peek() == Some(&'=') {
                    self.chars.next();
                    "!="
                } else {
                    return Err("unexpected '!'".into());
                }
            }
            '<' => two(self, '=', "<=", "<"),
            '>' => two(self, '=', ">=", ">"),
            other => return Err(format!("unexpected character '{other}'")),
        };
        Ok(Some(Tok::Punct(punct)))
    }

    fn number(&mut self) -> Result<Tok, String> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.chars.next();
            } else if c == '.' && !is_float {
                // lookahead: `1.foo` is not a float
                let mut probe = self.chars.clone();
                probe.next();
                if matches!(probe.peek(), Some(d) if d.is_ascii_digit()) {
                    is_float = true;
                    text.push('.');
                    self.chars.next();
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| format!("bad float literal '{text}'"))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| format!("bad int literal '{text}'"))
        }
    }

    fn string(&mut self, quote: char) -> Result<Tok, String> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err("unterminated string".into()),
                Some(c) if c == quote => break,
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('\\') => out.push('\\'),
                    Some(c) if c == quote => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return Err("unterminated string".into()),
                },
                Some(c) => out.push(c),
            }
        }
        Ok(Tok::Str(out))
    }

    fn peek_tok(&mut self) -> Result<Option<&Tok>, String> {
        if self.pending.is_empty() {
            if let Some(t) = self.next_tok()? {
                self.pending.push(t);
            }
        }
        Ok(self.pending.last())
    }

    fn eat_punct(&mut self, p: &str) -> Result<bool, String> {
        if matches!(self.peek_tok()?, Some(Tok::Punct(q)) if *q == p) {
            self.next_tok()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_punct(&mut self, p: &'static str) -> Result<(), String> {
        if self.eat_punct(p)? {
            Ok(())
        } else {
            Err(format!("expected '{p}'"))
        }
    }

    fn expect_end(&mut self) -> Result<(), String> {
        match self.peek_tok()? {
            None => Ok(()),
            Some(t) => Err(format!("trailing input at {t:?}")),
        }
    }

    fn expression(&mut self) -> Result<Expr, String> {
        let lhs = self.sum()?;
        let op = match self.peek_tok()? {
            Some(Tok::Punct("==")) => Some(BinOp::Eq),
            Some(Tok::Punct("!=")) => Some(BinOp::Ne),
            Some(Tok::Punct("<")) => Some(BinOp::Lt),
            Some(Tok::Punct("<=")) => Some(BinOp::Le),
            Some(Tok::Punct(">")) => Some(BinOp::Gt),
            Some(Tok::Punct(">=")) => Some(BinOp::Ge),
            _ => None,
        };
        match op {
            None => Ok(lhs),
            Some(op) => {
                self.next_tok()?;
                let rhs = self.sum()?;
                Ok(Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
        }
    }

    fn sum(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek_tok()? {
                Some(Tok::Punct("+")) => BinOp::Add,
                Some(Tok::Punct("-")) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.next_tok()?;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek_tok()? {
                Some(Tok::Punct("*")) => BinOp::Mul,
                Some(Tok::Punct("/")) => BinOp::Div,
                Some(Tok::Punct("%")) => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.next_tok()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat_punct("-")? {
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                operand: Box::new(self.unary()?),
            });
        }
        if matches!(self.peek_tok()?, Some(Tok::Name(n)) if n == "not") {
            self.next_tok()?;
            return Ok(Expr::Unary {
                op: UnOp::Not,
                operand: Box::new(self.unary()?),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let atom = self.atom()?;
        // Trailers only apply to plain names: `f(...)`, `obj.method(...)`.
        let Expr::Name(name) = &atom else {
            return Ok(atom);
        };
        if self.eat_punct("(")? {
            let (args, kwargs) = self.call_args()?;
            return Ok(Expr::Call {
                target: Target::Function(name.clone()),
                args,
                kwargs,
            });
        }
        if self.eat_punct(".")? {
            let method = match self.next_tok()? {
                Some(Tok::Name(m)) => m,
                other => return Err(format!("expected method name, got {other:?}")),
            };
            self.expect_punct("(")?;
            let (args, kwargs) = self.call_args()?;
            return Ok(Expr::Call {
                target: Target::Method {
                    object: name.clone(),
                    method,
                },
                args,
                kwargs,
            });
        }
        Ok(atom)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), String> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if self.eat_punct(")")? {
            return Ok((args, kwargs));
        }
        loop {
            // `name=expr` is a keyword argument; plain expression otherwise.
            let mut keyword = None;
            if let Some(Tok::Name(n)) = self.peek_tok()? {
                let n = n.clone();
                self.next_tok()?;
                if self.eat_punct("=")? {
                    keyword = Some(n);
                } else {
                    self.push_back(Tok::Name(n));
                }
            }
            let expr = self.expression()?;
            match keyword {
                Some(k) => kwargs.push((k, expr)),
                None => {
                    if !kwargs.is_empty() {
                        return Err("positional argument after keyword argument".into());
                    }
                    args.push(expr);
                }
            }
            if self.eat_punct(",")? {
                continue;
            }
            self.expect_punct(")")?;
            return Ok((args, kwargs));
        }
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.next_tok()? {
            None => Err("unexpected end of input".into()),
            Some(Tok::Int(v)) => Ok(Expr::Int(v)),
            Some(Tok::Float(v)) => Ok(Expr::Float(v)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Name(n)) => match n.as_str() {
                "None" => Ok(Expr::None),
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                _ => Ok(Expr::Name(n)),
            },
            Some(Tok::Punct("(")) => {
                let e = self.expression()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            Some(Tok::Punct("[")) => {
                let mut items = Vec::new();
                if self.eat_punct("]")? {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.expression()?);
                    if self.eat_punct(",")? {
                        if self.eat_punct("]")? {
                            return Ok(Expr::List(items));
                        }
                        continue;
                    }
                    self.expect_punct("]")?;
                    return Ok(Expr::List(items));
                }
            }
            Some(Tok::Punct("{")) => {
                let mut pairs = Vec::new();
                if self.eat_punct("}")? {
                    return Ok(Expr::Dict(pairs));
                }
                loop {
                    let key = self.expression()?;
                    self.expect_punct(":")?;
                    let value = self.expression()?;
                    pairs.push((key, value));
                    if self.eat_punct(",")? {
                        if self.eat_punct("}")? {
                            return Ok(Expr::Dict(pairs));
                        }
                        continue;
                    }
                    self.expect_punct("}")?;
                    return Ok(Expr::Dict(pairs));
                }
            }
            Some(Tok::Punct(p)) => Err(format!("unexpected '{p}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(src: &str) -> Stmt {
        let mut stmts = parse_program(src).unwrap();
        assert_eq!(stmts.len(), 1, "expected one statement in {src:?}");
        stmts.remove(0)
    }

    #[test]
    fn parses_assignment() {
        match one("x = 1 + 2 * 3") {
            Stmt::Assign { name, expr } => {
                assert_eq!(name, "x");
                match expr {
                    Expr::Binary { op: BinOp::Add, .. } => {}
                    other => panic!("precedence broken: {other:?}"),
                }
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parses_calls_with_kwargs() {
        match one("rect(0, 0, 100, 50, color=\"#ff0000\")") {
            Stmt::Expr(Expr::Call {
                target: Target::Function(f),
                args,
                kwargs,
            }) => {
                assert_eq!(f, "rect");
                assert_eq!(args.len(), 4);
                assert_eq!(kwargs[0].0, "color");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parses_method_calls() {
        match one("scene.clear()") {
            Stmt::Expr(Expr::Call {
                target: Target::Method { object, method },
                ..
            }) => {
                assert_eq!(object, "scene");
                assert_eq!(method, "clear");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn parses_imports_and_del() {
        assert_eq!(
            one("import math"),
            Stmt::Import {
                module: "math".into(),
                bindings: vec!["math".into()]
            }
        );
        assert_eq!(
            one("from geometry import circle, square"),
            Stmt::Import {
                module: "geometry".into(),
                bindings: vec!["circle".into(), "square".into()]
            }
        );
        assert_eq!(one("del w"), Stmt::Del { name: "w".into() });
    }

    #[test]
    fn parses_containers_and_literals() {
        match one("cfg = {\"size\": [800, 600], \"on\": True, \"label\": None}") {
            Stmt::Assign { expr: Expr::Dict(pairs), .. } => assert_eq!(pairs.len(), 3),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let stmts = parse_program("# a comment\n\nx = 1  # trailing\n").unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn comparison_is_not_confused_with_assignment() {
        assert!(matches!(one("x == 1"), Stmt::Expr(Expr::Binary { op: BinOp::Eq, .. })));
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse_program("x = 1\ny = (((\n").unwrap_err();
        assert!(err.starts_with("line 2:"), "{err}");
    }

    #[test]
    fn classify_line_agrees_with_parser() {
        assert_eq!(classify_line("import math"), LineKind::Import);
        assert_eq!(classify_line("x = 1"), LineKind::Assign("x".into()));
        assert_eq!(classify_line("x == 1"), LineKind::Other);
        assert_eq!(classify_line("   # hi"), LineKind::Blank);
        assert_eq!(classify_line("print(x)"), LineKind::Other);
    }
}
