//! Statements, expressions and patterns
//!
//! Every node is a closed sum type: one payload per variant.

use serde::Serialize;
use std::fmt;

use crate::types::{FieldSchema, TypeRef};

/// Literal value shared by patterns and annotations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LiteralValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
}

impl LiteralValue {
    pub fn to_expr(&self) -> ExprIR {
        match self {
            LiteralValue::Int(v) => ExprIR::Int(*v),
            LiteralValue::Float(v) => ExprIR::Float(*v),
            LiteralValue::String(v) => ExprIR::String(v.clone()),
            LiteralValue::Bool(v) => ExprIR::Bool(*v),
            LiteralValue::Null => ExprIR::Null,
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Int(v) => write!(f, "{}", v),
            LiteralValue::Float(v) => write!(f, "{:?}", v),
            LiteralValue::String(v) => write!(f, "{:?}", v),
            LiteralValue::Bool(v) => write!(f, "{}", v),
            LiteralValue::Null => write!(f, "null"),
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
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
    And,
    Or,
}

impl BinOp {
    /// C-family spelling, shared by most targets
    pub fn symbol(&self) -> &'static str {
        match self {
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
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnOp {
    Not,
    Neg,
}

impl UnOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnOp::Not => "!",
            UnOp::Neg => "-",
        }
    }
}

/// Function or method call
///
/// A method receiver, when there is one, is the first argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallExpr {
    pub name: String,
    pub type_args: Vec<TypeRef>,
    pub args: Vec<ExprIR>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectField {
    pub key: String,
    pub value: ExprIR,
}

/// Lambda body: a single expression or a statement block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LambdaBody {
    Expr(Box<ExprIR>),
    Block(Vec<StmtIR>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LambdaExpr {
    pub params: Vec<FieldSchema>,
    pub body: LambdaBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCase {
    pub pattern: PatternIR,
    pub guard: Option<ExprIR>,
    pub body: ExprIR,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchExpr {
    pub value: Box<ExprIR>,
    pub cases: Vec<MatchCase>,
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExprIR {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
    Var(String),
    Binary {
        op: BinOp,
        left: Box<ExprIR>,
        right: Box<ExprIR>,
    },
    Unary {
        op: UnOp,
        operand: Box<ExprIR>,
    },
    FieldAccess {
        object: Box<ExprIR>,
        field: String,
    },
    IndexAccess {
        object: Box<ExprIR>,
        index: Box<ExprIR>,
    },
    Call(CallExpr),
    Object(Vec<ObjectField>),
    Array(Vec<ExprIR>),
    Lambda(LambdaExpr),
    /// `left |> right`
    Pipe {
        left: Box<ExprIR>,
        right: Box<ExprIR>,
    },
    Match(MatchExpr),
    Async(Vec<StmtIR>),
    Await(Box<ExprIR>),
}

impl ExprIR {
    pub fn var(name: impl Into<String>) -> Self {
        ExprIR::Var(name.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        ExprIR::String(value.into())
    }

    pub fn field(object: ExprIR, field: impl Into<String>) -> Self {
        ExprIR::FieldAccess {
            object: Box::new(object),
            field: field.into(),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<ExprIR>) -> Self {
        ExprIR::Call(CallExpr {
            name: name.into(),
            type_args: Vec::new(),
            args,
        })
    }

    pub fn binary(op: BinOp, left: ExprIR, right: ExprIR) -> Self {
        ExprIR::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            ExprIR::Int(_) | ExprIR::Float(_) | ExprIR::String(_) | ExprIR::Bool(_) | ExprIR::Null
        )
    }

    /// Whether evaluating this expression awaits, outside of nested async
    /// blocks and lambdas
    pub fn contains_await(&self) -> bool {
        match self {
            ExprIR::Await(_) => true,
            ExprIR::Binary { left, right, .. } | ExprIR::Pipe { left, right } => {
                left.contains_await() || right.contains_await()
            }
            ExprIR::Unary { operand, .. } => operand.contains_await(),
            ExprIR::FieldAccess { object, .. } => object.contains_await(),
            ExprIR::IndexAccess { object, index } => {
                object.contains_await() || index.contains_await()
            }
            ExprIR::Call(call) => call.args.iter().any(ExprIR::contains_await),
            ExprIR::Object(fields) => fields.iter().any(|f| f.value.contains_await()),
            ExprIR::Array(elements) => elements.iter().any(ExprIR::contains_await),
            ExprIR::Match(m) => {
                m.value.contains_await()
                    || m.cases.iter().any(|c| {
                        c.body.contains_await()
                            || c.guard.as_ref().is_some_and(ExprIR::contains_await)
                    })
            }
            ExprIR::Lambda(_) | ExprIR::Async(_) => false,
            ExprIR::Int(_)
            | ExprIR::Float(_)
            | ExprIR::String(_)
            | ExprIR::Bool(_)
            | ExprIR::Null
            | ExprIR::Var(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchCase {
    pub value: ExprIR,
    pub body: Vec<StmtIR>,
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StmtIR {
    Assign {
        target: String,
        value: ExprIR,
    },
    Reassign {
        target: String,
        value: ExprIR,
    },
    Return(ExprIR),
    If {
        condition: ExprIR,
        then_body: Vec<StmtIR>,
        else_body: Vec<StmtIR>,
    },
    For {
        key: Option<String>,
        value: String,
        iterable: ExprIR,
        body: Vec<StmtIR>,
    },
    While {
        condition: ExprIR,
        body: Vec<StmtIR>,
    },
    Switch {
        value: ExprIR,
        cases: Vec<SwitchCase>,
        default: Vec<StmtIR>,
    },
    Expr(ExprIR),
    Validate(ExprIR),
    Break,
    Continue,
}

impl StmtIR {
    /// Placeholder for a statement that could not be converted
    pub fn noop() -> Self {
        StmtIR::Expr(ExprIR::Null)
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, StmtIR::Expr(ExprIR::Null))
    }

    pub fn assign(target: impl Into<String>, value: ExprIR) -> Self {
        StmtIR::Assign {
            target: target.into(),
            value,
        }
    }

    /// Whether control never falls through past this statement
    pub fn is_terminal(&self) -> bool {
        matches!(self, StmtIR::Return(_) | StmtIR::Break | StmtIR::Continue)
    }

    pub fn contains_await(&self) -> bool {
        match self {
            StmtIR::Assign { value, .. } | StmtIR::Reassign { value, .. } => value.contains_await(),
            StmtIR::Return(value) | StmtIR::Expr(value) | StmtIR::Validate(value) => {
                value.contains_await()
            }
            StmtIR::If {
                condition,
                then_body,
                else_body,
            } => condition.contains_await() || body_awaits(then_body) || body_awaits(else_body),
            StmtIR::For { iterable, body, .. } => iterable.contains_await() || body_awaits(body),
            StmtIR::While { condition, body } => condition.contains_await() || body_awaits(body),
            StmtIR::Switch {
                value,
                cases,
                default,
            } => {
                value.contains_await()
                    || cases
                        .iter()
                        .any(|c| c.value.contains_await() || body_awaits(&c.body))
                    || body_awaits(default)
            }
            StmtIR::Break | StmtIR::Continue => false,
        }
    }
}

/// Whether any statement in `body` awaits
pub fn body_awaits(body: &[StmtIR]) -> bool {
    body.iter().any(StmtIR::contains_await)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectPatternField {
    pub key: String,
    /// `None` binds the field to a variable named `key`
    pub pattern: Option<PatternIR>,
}

/// Match patterns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PatternIR {
    Literal(LiteralValue),
    Variable(String),
    Wildcard,
    Object(Vec<ObjectPatternField>),
    Array {
        elements: Vec<PatternIR>,
        rest: Option<String>,
    },
}

impl PatternIR {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, PatternIR::Wildcard)
    }
}

impl fmt::Display for PatternIR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternIR::Literal(lit) => write!(f, "{}", lit),
            PatternIR::Variable(name) => write!(f, "{}", name),
            PatternIR::Wildcard => write!(f, "_"),
            PatternIR::Object(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match &field.pattern {
                        Some(p) => write!(f, "{}: {}", field.key, p)?,
                        None => write!(f, "{}", field.key)?,
                    }
                }
                write!(f, " }}")
            }
            PatternIR::Array { elements, rest } => {
                write!(f, "[")?;
                for (i, p) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                if let Some(rest) = rest {
                    if !elements.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...{}", rest)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for ExprIR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprIR::Int(v) => write!(f, "{}", v),
            ExprIR::Float(v) => write!(f, "{:?}", v),
            ExprIR::String(v) => write!(f, "{:?}", v),
            ExprIR::Bool(v) => write!(f, "{}", v),
            ExprIR::Null => write!(f, "null"),
            ExprIR::Var(name) => write!(f, "{}", name),
            ExprIR::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            ExprIR::Unary { op, operand } => write!(f, "{}{}", op.symbol(), operand),
            ExprIR::FieldAccess { object, field } => write!(f, "{}.{}", object, field),
            ExprIR::IndexAccess { object, index } => write!(f, "{}[{}]", object, index),
            ExprIR::Call(call) => {
                write!(f, "{}(", call.name)?;
                for (i, arg) in call.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            ExprIR::Object(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", field.key, field.value)?;
                }
                write!(f, " }}")
            }
            ExprIR::Array(elements) => {
                write!(f, "[")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            ExprIR::Lambda(lambda) => {
                write!(f, "(")?;
                for (i, p) in lambda.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p.name)?;
                }
                match &lambda.body {
                    LambdaBody::Expr(body) => write!(f, ") => {}", body),
                    LambdaBody::Block(stmts) => write!(f, ") => {{ {} statements }}", stmts.len()),
                }
            }
            ExprIR::Pipe { left, right } => write!(f, "{} |> {}", left, right),
            ExprIR::Match(m) => {
                write!(f, "match {} {{", m.value)?;
                for case in &m.cases {
                    write!(f, " {}", case.pattern)?;
                    if let Some(guard) = &case.guard {
                        write!(f, " when {}", guard)?;
                    }
                    write!(f, " => {};", case.body)?;
                }
                write!(f, " }}")
            }
            ExprIR::Async(body) => write!(f, "async {{ {} statements }}", body.len()),
            ExprIR::Await(inner) => write!(f, "await {}", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_placeholder() {
        assert!(StmtIR::noop().is_noop());
        assert!(!StmtIR::Expr(ExprIR::var("x")).is_noop());
        assert!(!StmtIR::Return(ExprIR::Null).is_noop());
    }

    #[test]
    fn test_contains_await() {
        let awaited = ExprIR::Await(Box::new(ExprIR::call("fetch", vec![])));
        assert!(StmtIR::assign("data", awaited.clone()).contains_await());

        let nested = StmtIR::If {
            condition: ExprIR::Bool(true),
            then_body: vec![StmtIR::Expr(awaited.clone())],
            else_body: vec![],
        };
        assert!(nested.contains_await());

        // awaits inside async blocks belong to the block
        let spawned = StmtIR::Expr(ExprIR::Async(vec![StmtIR::Expr(awaited)]));
        assert!(!spawned.contains_await());
    }

    #[test]
    fn test_expr_display() {
        let call = ExprIR::call(
            "Get",
            vec![
                ExprIR::field(ExprIR::var("db"), "users"),
                ExprIR::var("id"),
            ],
        );
        assert_eq!(call.to_string(), "Get(db.users, id)");

        let sum = ExprIR::binary(BinOp::Add, ExprIR::Int(1), ExprIR::Float(2.0));
        assert_eq!(sum.to_string(), "(1 + 2.0)");
    }

    #[test]
    fn test_pattern_display() {
        let pattern = PatternIR::Array {
            elements: vec![PatternIR::Variable("head".to_string())],
            rest: Some("tail".to_string()),
        };
        assert_eq!(pattern.to_string(), "[head, ...tail]");

        let pattern = PatternIR::Object(vec![
            ObjectPatternField {
                key: "role".to_string(),
                pattern: Some(PatternIR::Literal(LiteralValue::String("admin".to_string()))),
            },
            ObjectPatternField {
                key: "name".to_string(),
                pattern: None,
            },
        ]);
        assert_eq!(pattern.to_string(), "{ role: \"admin\", name }");
    }
}
