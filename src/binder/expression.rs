use std::cmp::Ordering;
use std::collections::HashMap;

use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::parser::ast::{BinOp, UnaryOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    CountStar,
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

impl AggFunc {
    pub fn parse(name: &str) -> Option<AggFunc> {
        match name {
            "count" => Some(AggFunc::Count),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "sum" => Some(AggFunc::Sum),
            "avg" => Some(AggFunc::Avg),
            _ => None,
        }
    }
}

/// Expression over named row columns; property accesses were resolved
/// by the binder into `Column("var.key")` references that the
/// executor materializes before evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    Literal(Value),
    Column(String),
    Binary {
        op: BinOp,
        left: Box<BoundExpr>,
        right: Box<BoundExpr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<BoundExpr>,
    },
    Aggregate {
        func: AggFunc,
        arg: Option<Box<BoundExpr>>,
        distinct: bool,
    },
    ScalarFn {
        name: String,
        args: Vec<BoundExpr>,
    },
    List(Vec<BoundExpr>),
}

impl BoundExpr {
    pub fn has_aggregate(&self) -> bool {
        match self {
            BoundExpr::Aggregate { .. } => true,
            BoundExpr::Literal(_) | BoundExpr::Column(_) => false,
            BoundExpr::Binary { left, right, .. } => left.has_aggregate() || right.has_aggregate(),
            BoundExpr::Unary { expr, .. } => expr.has_aggregate(),
            BoundExpr::ScalarFn { args, .. } | BoundExpr::List(args) => {
                args.iter().any(|a| a.has_aggregate())
            }
        }
    }

    pub fn referenced_columns(&self, out: &mut Vec<String>) {
        match self {
            BoundExpr::Column(name) => out.push(name.clone()),
            BoundExpr::Literal(_) => {}
            BoundExpr::Binary { left, right, .. } => {
                left.referenced_columns(out);
                right.referenced_columns(out);
            }
            BoundExpr::Unary { expr, .. } => expr.referenced_columns(out),
            BoundExpr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.referenced_columns(out);
                }
            }
            BoundExpr::ScalarFn { args, .. } | BoundExpr::List(args) => {
                for arg in args {
                    arg.referenced_columns(out);
                }
            }
        }
    }

    /// Evaluate against one row. Aggregates are handled by the
    /// aggregate operator and are an internal error here.
    pub fn evaluate(&self, row: &[Value], columns: &HashMap<String, usize>) -> DbResult<Value> {
        match self {
            BoundExpr::Literal(v) => Ok(v.clone()),
            BoundExpr::Column(name) => {
                let idx = columns.get(name).ok_or_else(|| {
                    DbError::binder(format!("variable {} is not in scope", name))
                })?;
                Ok(row[*idx].clone())
            }
            BoundExpr::Binary { op, left, right } => {
                let l = left.evaluate(row, columns)?;
                let r = right.evaluate(row, columns)?;
                eval_binary(*op, &l, &r)
            }
            BoundExpr::Unary { op, expr } => {
                let v = expr.evaluate(row, columns)?;
                match op {
                    UnaryOp::Not => match v {
                        Value::Null => Ok(Value::Null),
                        Value::Bool(b) => Ok(Value::Bool(!b)),
                        other => Err(DbError::binder(format!("cannot apply NOT to {}", other))),
                    },
                    UnaryOp::Neg => match v {
                        Value::Null => Ok(Value::Null),
                        Value::Int16(x) => Ok(Value::Int16(-x)),
                        Value::Int32(x) => Ok(Value::Int32(-x)),
                        Value::Int64(x) => Ok(Value::Int64(-x)),
                        Value::Float(x) => Ok(Value::Float(-x)),
                        Value::Double(x) => Ok(Value::Double(-x)),
                        other => Err(DbError::binder(format!("cannot negate {}", other))),
                    },
                }
            }
            BoundExpr::Aggregate { .. } => Err(DbError::binder(
                "aggregate function used outside a projection",
            )),
            BoundExpr::ScalarFn { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(row, columns)?);
                }
                eval_scalar_fn(name, &values)
            }
            BoundExpr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.evaluate(row, columns)?);
                }
                Ok(Value::VarList(values))
            }
        }
    }
}

fn eval_binary(op: BinOp, l: &Value, r: &Value) -> DbResult<Value> {
    use BinOp::*;
    match op {
        And | Or | Xor => {
            let lb = logical_operand(l)?;
            let rb = logical_operand(r)?;
            // three-valued logic
            Ok(match (op, lb, rb) {
                (And, Some(false), _) | (And, _, Some(false)) => Value::Bool(false),
                (And, Some(true), Some(true)) => Value::Bool(true),
                (Or, Some(true), _) | (Or, _, Some(true)) => Value::Bool(true),
                (Or, Some(false), Some(false)) => Value::Bool(false),
                (Xor, Some(a), Some(b)) => Value::Bool(a ^ b),
                _ => Value::Null,
            })
        }
        Eq | Neq | Lt | Le | Gt | Ge => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ord = l.compare(r);
            let result = match op {
                Eq => ord == Ordering::Equal,
                Neq => ord != Ordering::Equal,
                Lt => ord == Ordering::Less,
                Le => ord != Ordering::Greater,
                Gt => ord == Ordering::Greater,
                Ge => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        Add | Sub | Mul | Div | Mod => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            if let (Value::String(a), Value::String(b), Add) = (l, r, op) {
                return Ok(Value::String(format!("{}{}", a, b)));
            }
            arithmetic(op, l, r)
        }
    }
}

fn logical_operand(v: &Value) -> DbResult<Option<bool>> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => Err(DbError::binder(format!(
            "expected a boolean operand, got {}",
            other
        ))),
    }
}

fn arithmetic(op: BinOp, l: &Value, r: &Value) -> DbResult<Value> {
    // integer arithmetic stays integral; anything floating promotes
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        let result = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return Err(DbError::binder("division by zero"));
                }
                a.checked_div(b)
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(DbError::binder("division by zero"));
                }
                a.checked_rem(b)
            }
            _ => unreachable!(),
        };
        return result
            .map(Value::Int64)
            .ok_or_else(|| DbError::binder("integer overflow"));
    }
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => {
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a % b,
                _ => unreachable!(),
            };
            Ok(Value::Double(result))
        }
        _ => Err(DbError::binder(format!(
            "cannot apply arithmetic to {} and {}",
            l, r
        ))),
    }
}

fn eval_scalar_fn(name: &str, args: &[Value]) -> DbResult<Value> {
    let arity = |n: usize| -> DbResult<()> {
        if args.len() != n {
            return Err(DbError::binder(format!(
                "function {} expects {} argument(s), got {}",
                name,
                n,
                args.len()
            )));
        }
        Ok(())
    };
    match name {
        "abs" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::Int64(v) => Ok(Value::Int64(v.abs())),
                Value::Int32(v) => Ok(Value::Int32(v.abs())),
                Value::Int16(v) => Ok(Value::Int16(v.abs())),
                Value::Double(v) => Ok(Value::Double(v.abs())),
                Value::Float(v) => Ok(Value::Float(v.abs())),
                other => Err(DbError::binder(format!("cannot apply abs to {}", other))),
            }
        }
        "lower" | "tolower" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(Value::String(s.to_lowercase())),
                other => Err(DbError::binder(format!("cannot apply lower to {}", other))),
            }
        }
        "upper" | "toupper" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(Value::String(s.to_uppercase())),
                other => Err(DbError::binder(format!("cannot apply upper to {}", other))),
            }
        }
        "size" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(Value::Int64(s.chars().count() as i64)),
                Value::VarList(items) | Value::FixedList(items) => {
                    Ok(Value::Int64(items.len() as i64))
                }
                other => Err(DbError::binder(format!("cannot apply size to {}", other))),
            }
        }
        other => Err(DbError::binder(format!("unknown function: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> HashMap<String, usize> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i))
            .collect()
    }

    #[test]
    fn arithmetic_and_comparison() {
        let columns = cols(&["a.id"]);
        let row = vec![Value::Int64(10)];
        let expr = BoundExpr::Binary {
            op: BinOp::Lt,
            left: Box::new(BoundExpr::Binary {
                op: BinOp::Add,
                left: Box::new(BoundExpr::Column("a.id".into())),
                right: Box::new(BoundExpr::Literal(Value::Int64(5))),
            }),
            right: Box::new(BoundExpr::Literal(Value::Int64(20))),
        };
        assert_eq!(expr.evaluate(&row, &columns).unwrap(), Value::Bool(true));
    }

    #[test]
    fn null_propagates_through_comparison() {
        let columns = cols(&["x"]);
        let row = vec![Value::Null];
        let expr = BoundExpr::Binary {
            op: BinOp::Eq,
            left: Box::new(BoundExpr::Column("x".into())),
            right: Box::new(BoundExpr::Literal(Value::Int64(1))),
        };
        assert_eq!(expr.evaluate(&row, &columns).unwrap(), Value::Null);
    }

    #[test]
    fn three_valued_and() {
        let columns = cols(&[]);
        let null = BoundExpr::Literal(Value::Null);
        let f = BoundExpr::Literal(Value::Bool(false));
        let expr = BoundExpr::Binary {
            op: BinOp::And,
            left: Box::new(null),
            right: Box::new(f),
        };
        // null AND false is false
        assert_eq!(expr.evaluate(&[], &columns).unwrap(), Value::Bool(false));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let expr = BoundExpr::Binary {
            op: BinOp::Div,
            left: Box::new(BoundExpr::Literal(Value::Int64(1))),
            right: Box::new(BoundExpr::Literal(Value::Int64(0))),
        };
        assert!(expr.evaluate(&[], &cols(&[])).is_err());
    }

    #[test]
    fn scalar_functions() {
        let c = cols(&[]);
        let expr = BoundExpr::ScalarFn {
            name: "size".into(),
            args: vec![BoundExpr::Literal(Value::String("abc".into()))],
        };
        assert_eq!(expr.evaluate(&[], &c).unwrap(), Value::Int64(3));
    }
}
