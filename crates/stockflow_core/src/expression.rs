use crate::error::{Result, SimError};
use crate::traits::Scalar;
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of an argument (by index) onto the stack.
    /// Indices correspond to the order arguments were declared (0=x, 1=y).
    LoadArg(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes f(a).
    Call(Function),
}

/// Built-in functions callable from user-function bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Ln,
    Sqrt,
    Abs,
    Floor,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "ln" | "log" => Function::Ln,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "floor" => Function::Floor,
            _ => return None,
        })
    }

    fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Asin => a.asin(),
            Function::Acos => a.acos(),
            Function::Atan => a.atan(),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
            Function::Floor => a.floor(),
        }
    }
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based Virtual Machine for evaluating expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `args`: Argument values (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, args: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();
        let zero = T::zero();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(val).unwrap_or(zero));
                }
                OpCode::LoadArg(idx) => {
                    stack.push(args.get(idx).copied().unwrap_or(zero));
                }
                OpCode::Neg => {
                    let a = stack.pop().unwrap_or(zero);
                    stack.push(-a);
                }
                OpCode::Call(function) => {
                    let a = stack.pop().unwrap_or(zero);
                    stack.push(function.apply(a));
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = stack.pop().unwrap_or(zero);
                    let a = stack.pop().unwrap_or(zero);
                    stack.push(match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    });
                }
            }
        }

        // The compiler guarantees a single value is left on the stack.
        stack.pop().unwrap_or(zero)
    }
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>),
}

/// Compiles an AST (`Expr`) into `Bytecode`, resolving argument names to
/// indices.
pub struct Compiler {
    pub arg_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(arg_names: &[&str]) -> Self {
        let arg_map = arg_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        Self { arg_map }
    }

    pub fn compile(&self, expr: &Expr) -> std::result::Result<Bytecode, String> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> std::result::Result<(), String> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.arg_map.get(name) {
                    ops.push(OpCode::LoadArg(idx));
                } else {
                    match name.as_str() {
                        "pi" => ops.push(OpCode::LoadConst(std::f64::consts::PI)),
                        "e" => ops.push(OpCode::LoadConst(std::f64::consts::E)),
                        _ => return Err(format!("Unknown identifier: {}", name)),
                    }
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                match op {
                    '+' => ops.push(OpCode::Add),
                    '-' => ops.push(OpCode::Sub),
                    '*' => ops.push(OpCode::Mul),
                    '/' => ops.push(OpCode::Div),
                    '^' => ops.push(OpCode::Pow),
                    _ => return Err(format!("Unknown binary operator: {}", op)),
                }
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => return Err(format!("Unknown unary operator: {}", op)),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                match Function::lookup(func) {
                    Some(function) => ops.push(OpCode::Call(function)),
                    None => return Err(format!("Unknown function: {}", func)),
                }
            }
        }
        Ok(())
    }
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> std::result::Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if parser.pos < parser.tokens.len() {
        return Err("Unexpected trailing input".to_string());
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(['e', 'E']) {
                    // only an exponent if digits follow
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    let mut exponent = String::from(d);
                    if let Some(&sign) = lookahead.peek().filter(|s| **s == '+' || **s == '-') {
                        exponent.push(sign);
                        lookahead.next();
                    }
                    if !lookahead.peek().is_some_and(|x| x.is_ascii_digit()) {
                        break;
                    }
                    num_str.push_str(&exponent);
                    chars = lookahead;
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("Invalid number: {}", num_str))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(format!("Unexpected character: {}", other)),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expression(&mut self) -> std::result::Result<Expr, String> {
        self.parse_term()
    }

    fn parse_term(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> std::result::Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    /// Exponentiation is right associative and binds tighter than unary minus.
    fn parse_power(&mut self) -> std::result::Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> std::result::Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    if let Some(Token::RParen) = self.consume() {
                        Ok(Expr::Call(name, Box::new(arg)))
                    } else {
                        Err("Expected ')'".to_string())
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                if let Some(Token::RParen) = self.consume() {
                    Ok(expr)
                } else {
                    Err("Expected ')'".to_string())
                }
            }
            _ => Err("Unexpected token".to_string()),
        }
    }
}

// --- UserFunction ---

/// A user-defined function of the two operation inputs `x` and `y`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFunction {
    pub expression: String,
    bytecode: Bytecode,
}

impl UserFunction {
    pub fn compile(expression: &str) -> Result<Self> {
        let bytecode = parse(expression)
            .and_then(|expr| Compiler::new(&["x", "y"]).compile(&expr))
            .map_err(|e| {
                SimError::structural(format!("invalid user function {}: {}", expression, e))
            })?;
        Ok(Self {
            expression: expression.to_string(),
            bytecode,
        })
    }

    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        let mut stack = Vec::with_capacity(self.bytecode.ops.len());
        VM::execute(&self.bytecode, &[x, y], &mut stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str, x: f64, y: f64) -> f64 {
        UserFunction::compile(expression)
            .expect("expression should compile")
            .evaluate(x, y)
    }

    #[test]
    fn precedence_follows_arithmetic_rules() {
        assert_eq!(eval("1 + 2 * 3", 0.0, 0.0), 7.0);
        assert_eq!(eval("(1 + 2) * 3", 0.0, 0.0), 9.0);
        assert_eq!(eval("2 ^ 3 ^ 2", 0.0, 0.0), 512.0);
        assert_eq!(eval("-x^2", 3.0, 0.0), -9.0);
        assert_eq!(eval("10 - 4 - 3", 0.0, 0.0), 3.0);
    }

    #[test]
    fn arguments_and_functions_resolve() {
        assert!((eval("x*sin(y)", 2.0, std::f64::consts::FRAC_PI_2) - 2.0).abs() < 1e-12);
        assert!((eval("exp(ln(x))", 5.0, 0.0) - 5.0).abs() < 1e-12);
        assert_eq!(eval("1.5e2 + y", 0.0, 1.0), 151.0);
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        let err = UserFunction::compile("x + z").expect_err("z is not an argument");
        assert!(err.to_string().contains("Unknown identifier: z"));
        let err = UserFunction::compile("foo(x)").expect_err("foo is not a function");
        assert!(err.to_string().contains("Unknown function: foo"));
        assert!(UserFunction::compile("x +").is_err());
        assert!(UserFunction::compile("x ) ").is_err());
    }

    #[test]
    fn vm_runs_on_f32() {
        let expr = parse("x * 2").expect("parse");
        let bytecode = Compiler::new(&["x"]).compile(&expr).expect("compile");
        let mut stack = Vec::new();
        assert_eq!(VM::execute(&bytecode, &[1.5f32], &mut stack), 3.0f32);
    }
}
