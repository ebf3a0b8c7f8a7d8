//! Existential evaluation of requirement expressions
//!
//! An expression holds if it holds for at least one record of the resources
//! it references. With several resources every combination of records is
//! tried. A record that cannot be evaluated (missing field, type mismatch)
//! counts as false; the error is only surfaced when no record matched.
//!
//! Program lines without parentheses are split at their top-level `or` and
//! `and`, and each clause is matched against the records on its own:
//! `device.vendor == 'Intel' and device.category == 'AUDIO'` holds when one
//! record is from Intel and another is an audio device. Parenthesise the
//! line to require a single record to satisfy every clause.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::expr::{CmpOp, Expr, Func, Program, Value};
use super::table::{ResourceMap, ResourceRecord};
use crate::common::{Error, Result};

type Binding<'a> = BTreeMap<&'a str, &'a ResourceRecord>;

/// Evaluate `expr` against the resource tables in `tables`
pub fn evaluate(expr: &Expr, tables: &ResourceMap) -> Result<bool> {
    evaluate_with_text(expr, "<expression>", tables)
}

/// Evaluate every line of a program; all of them must hold
pub fn evaluate_program(program: &Program, tables: &ResourceMap) -> Result<bool> {
    for (expr, text) in program.exprs.iter().zip(&program.lines) {
        let holds = if text.contains('(') {
            evaluate_with_text(expr, text, tables)?
        } else {
            evaluate_clauses(expr, text, tables)?
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate_clauses(expr: &Expr, text: &str, tables: &ResourceMap) -> Result<bool> {
    match expr {
        Expr::Or { lhs, rhs } => {
            let lhs = evaluate_clauses(lhs, text, tables);
            let rhs = evaluate_clauses(rhs, text, tables);
            match (lhs, rhs) {
                (Ok(true), _) | (_, Ok(true)) => Ok(true),
                (Err(e), _) | (_, Err(e)) => Err(e),
                _ => Ok(false),
            }
        }
        Expr::And { lhs, rhs } => {
            let lhs = evaluate_clauses(lhs, text, tables);
            let rhs = evaluate_clauses(rhs, text, tables);
            match (lhs, rhs) {
                (Ok(false), _) | (_, Ok(false)) => Ok(false),
                (Err(e), _) | (_, Err(e)) => Err(e),
                _ => Ok(true),
            }
        }
        _ => evaluate_with_text(expr, text, tables),
    }
}

fn evaluate_with_text(expr: &Expr, text: &str, tables: &ResourceMap) -> Result<bool> {
    let resources: Vec<String> = expr.resource_ids().into_iter().collect();

    let mut columns: Vec<(&str, &[ResourceRecord])> = Vec::with_capacity(resources.len());
    for id in &resources {
        let table = tables
            .get(id)
            .ok_or_else(|| Error::evaluation(text, format!("resource '{}' is not available", id)))?;
        if table.is_empty() {
            return Ok(false);
        }
        columns.push((id.as_str(), table.records.as_slice()));
    }

    // Odometer over the cartesian product of records
    let mut indices = vec![0usize; columns.len()];
    let mut first_error: Option<String> = None;
    loop {
        let binding: Binding = columns
            .iter()
            .zip(&indices)
            .map(|((id, records), &i)| (*id, &records[i]))
            .collect();

        match eval(expr, &binding) {
            Ok(value) if truthy(&value) => return Ok(true),
            Ok(_) => {}
            Err(message) => {
                first_error.get_or_insert(message);
            }
        }

        let mut column = 0;
        loop {
            if column == columns.len() {
                return match first_error {
                    Some(message) => Err(Error::evaluation(text, message)),
                    None => Ok(false),
                };
            }
            indices[column] += 1;
            if indices[column] < columns[column].1.len() {
                break;
            }
            indices[column] = 0;
            column += 1;
        }
    }
}

type EvalResult = std::result::Result<Value, String>;

fn eval(expr: &Expr, binding: &Binding) -> EvalResult {
    match expr {
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Field { resource, field } => {
            let record = binding
                .get(resource.as_str())
                .ok_or_else(|| format!("resource '{}' is not bound", resource))?;
            record
                .get(field)
                .map(|v| Value::Str(v.clone()))
                .ok_or_else(|| format!("resource '{}' has no field '{}'", resource, field))
        }
        Expr::List { items } => items
            .iter()
            .map(|item| eval(item, binding))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Call { func, arg } => call(*func, eval(arg, binding)?),
        Expr::Not { expr } => Ok(Value::Bool(!truthy(&eval(expr, binding)?))),
        Expr::And { lhs, rhs } => {
            if !truthy(&eval(lhs, binding)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(rhs, binding)?)))
        }
        Expr::Or { lhs, rhs } => {
            if truthy(&eval(lhs, binding)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(rhs, binding)?)))
        }
        Expr::Compare { op, lhs, rhs } => {
            let lhs = eval(lhs, binding)?;
            let rhs = eval(rhs, binding)?;
            compare(*op, &lhs, &rhs).map(Value::Bool)
        }
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Str(s) => !s.is_empty(),
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Bool(b) => *b,
        Value::None => false,
        Value::List(items) => !items.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Str(_) => "str",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Bool(_) => "bool",
        Value::None => "None",
        Value::List(_) => "list",
    }
}

fn call(func: Func, arg: Value) -> EvalResult {
    match (func, &arg) {
        (Func::Int, Value::Str(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("invalid literal for int(): '{}'", s)),
        (Func::Int, Value::Int(i)) => Ok(Value::Int(*i)),
        (Func::Int, Value::Float(f)) => Ok(Value::Int(f.trunc() as i64)),
        (Func::Int, Value::Bool(b)) => Ok(Value::Int(*b as i64)),
        (Func::Float, Value::Str(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("could not convert string to float: '{}'", s)),
        (Func::Float, Value::Int(i)) => Ok(Value::Float(*i as f64)),
        (Func::Float, Value::Float(f)) => Ok(Value::Float(*f)),
        (Func::Float, Value::Bool(b)) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        (Func::Bool, value) => Ok(Value::Bool(truthy(value))),
        (Func::Len, Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
        (Func::Len, Value::List(items)) => Ok(Value::Int(items.len() as i64)),
        (func, value) => Err(format!(
            "{:?}() does not accept a {}",
            func,
            type_name(value)
        )
        .to_lowercase()),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::None, Value::None) => true,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y))
        }
        _ => match (as_number(lhs), as_number(rhs)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn order(lhs: &Value, rhs: &Value) -> std::result::Result<Ordering, String> {
    let unorderable = || {
        format!(
            "'<' not supported between instances of '{}' and '{}'",
            type_name(lhs),
            type_name(rhs)
        )
    };
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => match (as_number(lhs), as_number(rhs)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(unorderable),
            _ => Err(unorderable()),
        },
    }
}

fn contains(needle: &Value, haystack: &Value) -> std::result::Result<bool, String> {
    match (needle, haystack) {
        (Value::Str(n), Value::Str(h)) => Ok(h.contains(n.as_str())),
        (_, Value::List(items)) => Ok(items.iter().any(|item| equals(needle, item))),
        _ => Err(format!(
            "'in <{}>' requires a str or list, got {}",
            type_name(haystack),
            type_name(needle)
        )),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> std::result::Result<bool, String> {
    Ok(match op {
        CmpOp::Eq => equals(lhs, rhs),
        CmpOp::Ne => !equals(lhs, rhs),
        CmpOp::Lt => order(lhs, rhs)? == Ordering::Less,
        CmpOp::Le => order(lhs, rhs)? != Ordering::Greater,
        CmpOp::Gt => order(lhs, rhs)? == Ordering::Greater,
        CmpOp::Ge => order(lhs, rhs)? != Ordering::Less,
        CmpOp::In => contains(lhs, rhs)?,
        CmpOp::NotIn => !contains(lhs, rhs)?,
    })
}
