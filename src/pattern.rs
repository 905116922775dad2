/// Structural pattern matching for match arms.
/// Depth-first and short-circuit: the first failing sub-pattern stops
/// the arm. Matching is two-phase; names bind into the tentative table
/// passed in by the caller, which commits them to the arm's scope only
/// after pattern and guard both succeed. Guards themselves are
/// evaluated by the interpreter with the tentative bindings visible.
///
/// Strict mode rejects object values carrying fields the pattern does
/// not name (unless the pattern ends with `...`) and never coerces.

use crate::ast::{Expr, Pattern, TypeTag};
use crate::value::{values_equal, Value};
use std::sync::Arc;

/// Recursion bound exceeded; the interpreter reports it as a runtime
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthExceeded;

pub fn match_pattern(
    value: &Value,
    pattern: &Pattern,
    binds: &mut Vec<(Arc<str>, Value)>,
    depth: usize,
    max_depth: usize,
    strict: bool,
) -> Result<bool, DepthExceeded> {
    if depth > max_depth {
        return Err(DepthExceeded);
    }
    match pattern {
        Pattern::Wildcard => Ok(true),

        Pattern::Ident(name) => {
            binds.push((name.clone(), value.clone()));
            Ok(true)
        }

        Pattern::Literal(expr) => {
            let literal = literal_value(expr);
            Ok(values_equal(value, &literal))
        }

        Pattern::TypeTag(tag) => Ok(match tag {
            TypeTag::Number => matches!(value, Value::Num(_)),
            TypeTag::String => matches!(value, Value::Str(_)),
            TypeTag::Bool => matches!(value, Value::Bool(_)),
        }),

        Pattern::Tuple(items) => {
            let Value::Tuple(values) = value else { return Ok(false) };
            if values.len() != items.len() {
                return Ok(false);
            }
            for (item, sub) in values.iter().zip(items) {
                if !match_pattern(item, sub, binds, depth + 1, max_depth, strict)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }

        Pattern::List { items, rest } => {
            let Value::List(list) = value else { return Ok(false) };
            let values = list.read();
            match rest {
                None => {
                    if values.len() != items.len() {
                        return Ok(false);
                    }
                }
                Some(_) => {
                    if values.len() < items.len() {
                        return Ok(false);
                    }
                }
            }
            for (item, sub) in values.iter().zip(items) {
                if !match_pattern(item, sub, binds, depth + 1, max_depth, strict)? {
                    return Ok(false);
                }
            }
            if let Some(rest_name) = rest {
                if rest_name.as_ref() != "_" {
                    let remaining: Vec<Value> = values[items.len()..].to_vec();
                    binds.push((rest_name.clone(), Value::list(remaining)));
                }
            }
            Ok(true)
        }

        Pattern::Object { fields, rest } => {
            // Field-by-field over objects and dicts alike.
            let (field_count, get): (usize, Box<dyn Fn(&str) -> Option<Value>>) = match value {
                Value::Object(o) => {
                    let o = o.clone();
                    let len = o.read().fields.len();
                    (len, Box::new(move |name| o.read().fields.get(name).cloned()))
                }
                Value::Dict(d) => {
                    let d = d.clone();
                    let len = d.read().len();
                    (len, Box::new(move |name| d.read().get(name).cloned()))
                }
                _ => return Ok(false),
            };

            if strict && !rest && field_count > fields.len() {
                return Ok(false);
            }

            for (name, sub) in fields {
                let Some(field_value) = get(name) else { return Ok(false) };
                match sub {
                    Some(sub) => {
                        if !match_pattern(&field_value, sub, binds, depth + 1, max_depth, strict)?
                        {
                            return Ok(false);
                        }
                    }
                    None => binds.push((name.clone(), field_value)),
                }
            }
            Ok(true)
        }
    }
}

/// Patterns only carry literal expressions; evaluate them without an
/// environment.
fn literal_value(expr: &Expr) -> Value {
    match expr {
        Expr::Num { value, .. } => Value::Num(*value),
        Expr::Str { value, .. } => Value::Str(value.clone()),
        Expr::Bool { value, .. } => Value::Bool(*value),
        Expr::Null { .. } => Value::Null,
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Span;

    fn matches(value: &Value, pattern: &Pattern) -> (bool, Vec<(Arc<str>, Value)>) {
        let mut binds = Vec::new();
        let ok = match_pattern(value, pattern, &mut binds, 0, 64, false).unwrap();
        (ok, binds)
    }

    fn num_lit(n: f64) -> Pattern {
        Pattern::Literal(Expr::Num { value: n, span: Span::default() })
    }

    #[test]
    fn identifier_binds_any_value() {
        let value = Value::str("anything");
        let (ok, binds) = matches(&value, &Pattern::Ident(Arc::from("x")));
        assert!(ok);
        assert_eq!(binds.len(), 1);
        assert!(values_equal(&binds[0].1, &value));
    }

    #[test]
    fn literal_matches_by_equality() {
        let (ok, _) = matches(&Value::Num(4.0), &num_lit(4.0));
        assert!(ok);
        let (ok, _) = matches(&Value::Num(5.0), &num_lit(4.0));
        assert!(!ok);
        // NaN literals never match, like NaN equality.
        let (ok, _) = matches(&Value::Num(f64::NAN), &num_lit(f64::NAN));
        assert!(!ok);
    }

    #[test]
    fn list_with_rest_binds_remainder() {
        let value = Value::list(vec![Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)]);
        let pattern = Pattern::List {
            items: vec![Pattern::Ident(Arc::from("head"))],
            rest: Some(Arc::from("tail")),
        };
        let (ok, binds) = matches(&value, &pattern);
        assert!(ok);
        let tail = &binds.iter().find(|(n, _)| n.as_ref() == "tail").unwrap().1;
        assert!(values_equal(tail, &Value::list(vec![Value::Num(2.0), Value::Num(3.0)])));
    }

    #[test]
    fn list_without_rest_requires_exact_length() {
        let value = Value::list(vec![Value::Num(1.0), Value::Num(2.0)]);
        let pattern = Pattern::List { items: vec![Pattern::Wildcard], rest: None };
        let (ok, _) = matches(&value, &pattern);
        assert!(!ok);
    }

    #[test]
    fn tuple_patterns_destructure() {
        let value = Value::Tuple(vec![Value::Num(1.0), Value::str("a")].into());
        let pattern = Pattern::Tuple(vec![
            Pattern::Ident(Arc::from("n")),
            Pattern::Ident(Arc::from("s")),
        ]);
        let (ok, binds) = matches(&value, &pattern);
        assert!(ok);
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn object_pattern_matches_fields() {
        let mut map = crate::value::DictMap::new();
        map.insert(Arc::from("x"), Value::Num(1.0));
        map.insert(Arc::from("y"), Value::Num(2.0));
        let value = Value::dict(map);
        let pattern = Pattern::Object {
            fields: vec![
                (Arc::from("x"), None),
                (Arc::from("y"), Some(num_lit(2.0))),
            ],
            rest: false,
        };
        let (ok, binds) = matches(&value, &pattern);
        assert!(ok);
        assert_eq!(binds.len(), 1);
    }

    #[test]
    fn strict_mode_rejects_extra_fields_without_rest() {
        let mut map = crate::value::DictMap::new();
        map.insert(Arc::from("x"), Value::Num(1.0));
        map.insert(Arc::from("extra"), Value::Num(9.0));
        let value = Value::dict(map);
        let fields = vec![(Arc::from("x") as Arc<str>, None)];

        let mut binds = Vec::new();
        let strict_no_rest = Pattern::Object { fields: fields.clone(), rest: false };
        assert!(!match_pattern(&value, &strict_no_rest, &mut binds, 0, 64, true).unwrap());

        let mut binds = Vec::new();
        let strict_with_rest = Pattern::Object { fields, rest: true };
        assert!(match_pattern(&value, &strict_with_rest, &mut binds, 0, 64, true).unwrap());
    }

    #[test]
    fn type_tags_match_kinds() {
        let (ok, _) = matches(&Value::Num(1.0), &Pattern::TypeTag(TypeTag::Number));
        assert!(ok);
        let (ok, _) = matches(&Value::str("s"), &Pattern::TypeTag(TypeTag::Number));
        assert!(!ok);
    }

    #[test]
    fn depth_bound_is_enforced() {
        // Nest list patterns beyond the limit.
        let mut pattern = Pattern::Ident(Arc::from("x"));
        let mut value = Value::Num(0.0);
        for _ in 0..70 {
            pattern = Pattern::List { items: vec![pattern], rest: None };
            value = Value::list(vec![value]);
        }
        let mut binds = Vec::new();
        assert_eq!(
            match_pattern(&value, &pattern, &mut binds, 0, 64, false),
            Err(DepthExceeded)
        );
    }
}
