//! Per-pixel band algebra.
//!
//! Formulas are parsed once into a small AST, checked against a namespace of
//! band and flag names, then bound to concrete bands of a product. A bound
//! expression evaluates one pixel at a time and never materialises its
//! operands.
//!
//! Supported syntax:
//! - arithmetic `+ - * /`, unary `-`
//! - comparison `< <= > >= == !=`
//! - boolean `&& || !` (also `and`, `or`, `not`)
//! - functions `exp log log10 sqrt abs sin cos tan min max pow`
//! - flag tests `flag_band.FLAG_NAME`
//! - literals: numbers, `true`, `false`, `PI`
//!
//! All arithmetic is carried out in `f64`; booleans are 1.0 / 0.0. A no-data
//! operand, a division by zero or a non-finite result makes the whole pixel
//! no-data.

use std::collections::BTreeSet;

use crate::types::{Band, Product, SnowError, SnowResult};

/// Name lookup used to check formulas before any pixel is evaluated
pub trait Namespace {
    fn contains_band(&self, name: &str) -> bool;

    /// True when `band` is a flag band defining `flag`
    fn contains_flag(&self, band: &str, flag: &str) -> bool;

    /// True when `band` carries a flag coding at all
    fn is_flag_band(&self, band: &str) -> bool;
}

impl Namespace for Product {
    fn contains_band(&self, name: &str) -> bool {
        self.band(name).is_some()
    }

    fn contains_flag(&self, band: &str, flag: &str) -> bool {
        self.flag_codings.flag_mask(band, flag).is_some()
    }

    fn is_flag_band(&self, band: &str) -> bool {
        self.flag_codings.contains_band(band)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Exp,
    Log,
    Log10,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Min,
    Max,
    Pow,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let func = match name {
            "exp" => Function::Exp,
            "log" => Function::Log,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "min" => Function::Min,
            "max" => Function::Max,
            "pow" => Function::Pow,
            _ => return None,
        };
        Some(func)
    }

    fn arity(self) -> usize {
        match self {
            Function::Min | Function::Max | Function::Pow => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Function::Exp => args[0].exp(),
            Function::Log => args[0].ln(),
            Function::Log10 => args[0].log10(),
            Function::Sqrt => args[0].sqrt(),
            Function::Abs => args[0].abs(),
            Function::Sin => args[0].sin(),
            Function::Cos => args[0].cos(),
            Function::Tan => args[0].tan(),
            Function::Min => args[0].min(args[1]),
            Function::Max => args[0].max(args[1]),
            Function::Pow => args[0].powf(args[1]),
        }
    }
}

/// Node of the parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Band(String),
    Flag { band: String, flag: String },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Call { func: Function, args: Vec<Expr> },
}

fn tokenize(formula: &str) -> SnowResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = formula.chars().collect();
    let mut i = 0;

    let next_is = |i: usize, c: char| chars.get(i + 1) == Some(&c);

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => { tokens.push(Token::LParen); i += 1; }
            ')' => { tokens.push(Token::RParen); i += 1; }
            ',' => { tokens.push(Token::Comma); i += 1; }
            '+' => { tokens.push(Token::Plus); i += 1; }
            '-' => { tokens.push(Token::Minus); i += 1; }
            '*' => { tokens.push(Token::Star); i += 1; }
            '/' => { tokens.push(Token::Slash); i += 1; }
            '<' if next_is(i, '=') => { tokens.push(Token::Le); i += 2; }
            '<' => { tokens.push(Token::Lt); i += 1; }
            '>' if next_is(i, '=') => { tokens.push(Token::Ge); i += 2; }
            '>' => { tokens.push(Token::Gt); i += 1; }
            '=' if next_is(i, '=') => { tokens.push(Token::EqEq); i += 2; }
            '!' if next_is(i, '=') => { tokens.push(Token::NotEq); i += 2; }
            '!' => { tokens.push(Token::Bang); i += 1; }
            '&' if next_is(i, '&') => { tokens.push(Token::AndAnd); i += 2; }
            '|' if next_is(i, '|') => { tokens.push(Token::OrOr); i += 2; }
            '.' if !chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Optional exponent: e.g. 1e-3, 2.5E+4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| {
                    definition_error(formula, format!("invalid number '{}'", text))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let token = match ident.as_str() {
                    "and" => Token::AndAnd,
                    "or" => Token::OrOr,
                    "not" => Token::Bang,
                    _ => Token::Ident(ident),
                };
                tokens.push(token);
            }
            other => {
                return Err(definition_error(
                    formula,
                    format!("unexpected character '{}' at position {}", other, i),
                ));
            }
        }
    }

    Ok(tokens)
}

/// Recursive descent parser, lowest precedence first:
/// `||`, `&&`, equality, comparison, additive, multiplicative, unary, primary
struct Parser<'a> {
    formula: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(formula: &'a str, tokens: Vec<Token>) -> Self {
        Self { formula, tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> SnowError {
        definition_error(self.formula, message)
    }

    fn expect(&mut self, expected: Token, what: &str) -> SnowResult<()> {
        match self.advance() {
            Some(ref t) if *t == expected => Ok(()),
            Some(other) => Err(self.error(format!("expected {}, found {:?}", what, other))),
            None => Err(self.error(format!("expected {}, found end of formula", what))),
        }
    }

    fn parse(mut self) -> SnowResult<Expr> {
        if self.tokens.is_empty() {
            return Err(self.error("empty formula"));
        }
        let expr = self.parse_or()?;
        if let Some(token) = self.peek() {
            return Err(self.error(format!("unexpected trailing token {:?}", token)));
        }
        Ok(expr)
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn parse_or(&mut self) -> SnowResult<Expr> {
        let mut left = self.parse_and()?;
        while let Some(Token::OrOr) = self.peek() {
            self.advance();
            let right = self.parse_and()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> SnowResult<Expr> {
        let mut left = self.parse_equality()?;
        while let Some(Token::AndAnd) = self.peek() {
            self.advance();
            let right = self.parse_equality()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> SnowResult<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> SnowResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> SnowResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> SnowResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> SnowResult<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::Neg, operand: Box::new(operand) })
            }
            Some(Token::Bang) => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand) })
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> SnowResult<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => self.parse_identifier(name),
            Some(other) => Err(self.error(format!("unexpected token {:?}", other))),
            None => Err(self.error("unexpected end of formula")),
        }
    }

    fn parse_identifier(&mut self, name: String) -> SnowResult<Expr> {
        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let func = Function::lookup(&name)
                    .ok_or_else(|| self.error(format!("unknown function '{}'", name)))?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    args.push(self.parse_or()?);
                    while let Some(Token::Comma) = self.peek() {
                        self.advance();
                        args.push(self.parse_or()?);
                    }
                }
                self.expect(Token::RParen, "')'")?;
                if args.len() != func.arity() {
                    return Err(self.error(format!(
                        "function '{}' takes {} argument(s), got {}",
                        name,
                        func.arity(),
                        args.len()
                    )));
                }
                Ok(Expr::Call { func, args })
            }
            Some(Token::Dot) => {
                self.advance();
                match self.advance() {
                    Some(Token::Ident(flag)) => Ok(Expr::Flag { band: name, flag }),
                    _ => Err(self.error(format!("expected flag name after '{}.'", name))),
                }
            }
            _ => Ok(match name.as_str() {
                "true" => Expr::Number(1.0),
                "false" => Expr::Number(0.0),
                "PI" => Expr::Number(std::f64::consts::PI),
                _ => Expr::Band(name),
            }),
        }
    }
}

fn definition_error(formula: &str, message: impl Into<String>) -> SnowError {
    SnowError::Definition(format!("formula '{}': {}", formula, message.into()))
}

/// A parsed, not yet bound, formula
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    text: String,
    root: Expr,
}

impl Expression {
    /// Parse a formula; syntax errors are reported as `Definition` errors
    pub fn parse(text: &str) -> SnowResult<Self> {
        let tokens = tokenize(text)?;
        let root = Parser::new(text, tokens).parse()?;
        Ok(Self {
            text: text.to_string(),
            root,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Plain band references, excluding flag bands used in flag tests
    pub fn referenced_bands(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_names(&self.root, &mut names, &mut BTreeSet::new());
        names
    }

    /// Flag tests as (flag band, flag name)
    pub fn referenced_flags(&self) -> BTreeSet<(String, String)> {
        let mut flags = BTreeSet::new();
        collect_names(&self.root, &mut BTreeSet::new(), &mut flags);
        flags
    }

    /// Check every referenced band and flag against a namespace
    pub fn check_names(&self, namespace: &impl Namespace) -> SnowResult<()> {
        for name in self.referenced_bands() {
            if !namespace.contains_band(&name) {
                return Err(definition_error(
                    &self.text,
                    format!("undefined band '{}'", name),
                ));
            }
        }
        for (band, flag) in self.referenced_flags() {
            if !namespace.contains_band(&band) {
                return Err(definition_error(
                    &self.text,
                    format!("undefined flag band '{}'", band),
                ));
            }
            if !namespace.is_flag_band(&band) {
                return Err(definition_error(
                    &self.text,
                    format!("band '{}' carries no flag coding", band),
                ));
            }
            if !namespace.contains_flag(&band, &flag) {
                return Err(definition_error(
                    &self.text,
                    format!("undefined flag '{}.{}'", band, flag),
                ));
            }
        }
        Ok(())
    }

    /// Bind the formula against the bands of a product.
    ///
    /// The bound expression keeps its own handles on the referenced bands, so
    /// later changes to the product do not affect it.
    pub fn bind(&self, product: &Product) -> SnowResult<BoundExpression> {
        self.check_names(product)?;
        let mut operands: Vec<Band> = Vec::new();
        let root = bind_node(&self.root, product, &mut operands)?;
        log::debug!(
            "Bound formula '{}' against {} band(s) of '{}'",
            self.text,
            operands.len(),
            product.name
        );
        Ok(BoundExpression {
            text: self.text.clone(),
            root,
            operands,
            width: product.width(),
            height: product.height(),
        })
    }
}

fn collect_names(
    expr: &Expr,
    bands: &mut BTreeSet<String>,
    flags: &mut BTreeSet<(String, String)>,
) {
    match expr {
        Expr::Number(_) => {}
        Expr::Band(name) => {
            bands.insert(name.clone());
        }
        Expr::Flag { band, flag } => {
            flags.insert((band.clone(), flag.clone()));
        }
        Expr::Unary { operand, .. } => collect_names(operand, bands, flags),
        Expr::Binary { left, right, .. } => {
            collect_names(left, bands, flags);
            collect_names(right, bands, flags);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_names(arg, bands, flags);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum BoundNode {
    Const(f64),
    Band(usize),
    Flag { band: usize, mask: u32 },
    Unary(UnaryOp, Box<BoundNode>),
    Binary(BinaryOp, Box<BoundNode>, Box<BoundNode>),
    Call(Function, Vec<BoundNode>),
}

fn operand_index(name: &str, product: &Product, operands: &mut Vec<Band>) -> SnowResult<usize> {
    if let Some(index) = operands.iter().position(|b| b.name == name) {
        return Ok(index);
    }
    let band = product.band(name).ok_or_else(|| {
        SnowError::Definition(format!("undefined band '{}' in '{}'", name, product.name))
    })?;
    operands.push(band.clone());
    Ok(operands.len() - 1)
}

fn bind_node(expr: &Expr, product: &Product, operands: &mut Vec<Band>) -> SnowResult<BoundNode> {
    Ok(match expr {
        Expr::Number(v) => BoundNode::Const(*v),
        Expr::Band(name) => BoundNode::Band(operand_index(name, product, operands)?),
        Expr::Flag { band, flag } => {
            let mask = product.flag_codings.flag_mask(band, flag).ok_or_else(|| {
                SnowError::Definition(format!("undefined flag '{}.{}'", band, flag))
            })?;
            BoundNode::Flag {
                band: operand_index(band, product, operands)?,
                mask,
            }
        }
        Expr::Unary { op, operand } => {
            BoundNode::Unary(*op, Box::new(bind_node(operand, product, operands)?))
        }
        Expr::Binary { op, left, right } => BoundNode::Binary(
            *op,
            Box::new(bind_node(left, product, operands)?),
            Box::new(bind_node(right, product, operands)?),
        ),
        Expr::Call { func, args } => BoundNode::Call(
            *func,
            args.iter()
                .map(|a| bind_node(a, product, operands))
                .collect::<SnowResult<Vec<_>>>()?,
        ),
    })
}

fn truth(value: f64) -> f64 {
    if value != 0.0 {
        1.0
    } else {
        0.0
    }
}

fn flag_set(value: f64, mask: u32) -> bool {
    (value as u32) & mask == mask
}

/// A formula bound to concrete bands, evaluated pixel by pixel
#[derive(Debug, Clone)]
pub struct BoundExpression {
    text: String,
    root: BoundNode,
    operands: Vec<Band>,
    width: usize,
    height: usize,
}

impl BoundExpression {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// (width, height) of the namespace the formula was bound against
    pub fn raster_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Names of the bands this expression reads
    pub fn operand_names(&self) -> Vec<&str> {
        self.operands.iter().map(|b| b.name.as_str()).collect()
    }

    /// Value at pixel (x, y); `None` means no-data
    pub fn evaluate(&self, x: usize, y: usize) -> Option<f64> {
        let value = self.eval_node(&self.root, x, y)?;
        if value.is_finite() {
            Some(value)
        } else {
            None
        }
    }

    fn eval_node(&self, node: &BoundNode, x: usize, y: usize) -> Option<f64> {
        match node {
            BoundNode::Const(v) => Some(*v),
            BoundNode::Band(index) => self.operands[*index].sample(x, y),
            BoundNode::Flag { band, mask } => {
                let value = self.operands[*band].sample(x, y)?;
                Some(if flag_set(value, *mask) { 1.0 } else { 0.0 })
            }
            BoundNode::Unary(op, operand) => {
                let v = self.eval_node(operand, x, y)?;
                Some(match op {
                    UnaryOp::Neg => -v,
                    UnaryOp::Not => 1.0 - truth(v),
                })
            }
            BoundNode::Binary(op, left, right) => {
                // Both sides are always evaluated so a no-data operand
                // anywhere in the formula yields no-data.
                let l = self.eval_node(left, x, y)?;
                let r = self.eval_node(right, x, y)?;
                let result = match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => {
                        if r == 0.0 {
                            return None;
                        }
                        l / r
                    }
                    BinaryOp::Lt => (l < r) as u8 as f64,
                    BinaryOp::Le => (l <= r) as u8 as f64,
                    BinaryOp::Gt => (l > r) as u8 as f64,
                    BinaryOp::Ge => (l >= r) as u8 as f64,
                    BinaryOp::Eq => (l == r) as u8 as f64,
                    BinaryOp::Ne => (l != r) as u8 as f64,
                    BinaryOp::And => truth(l) * truth(r),
                    BinaryOp::Or => truth(truth(l) + truth(r)),
                };
                result.is_finite().then_some(result)
            }
            BoundNode::Call(func, args) => {
                let mut values = [0.0f64; 2];
                for (slot, arg) in values.iter_mut().zip(args) {
                    *slot = self.eval_node(arg, x, y)?;
                }
                let result = func.apply(&values[..args.len()]);
                result.is_finite().then_some(result)
            }
        }
    }
}
