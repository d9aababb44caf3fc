//! Operator semantics for `BINARY_OP` and `UNARY_OP`.
//!
//! Dispatch is type-directed: a double on either side wins, then integer
//! pairs, then strings, pointers, lists and dicts. Integer arithmetic is
//! performed in 64 bits and wraps on overflow.

use super::error::VmError;
use super::value::Value;

/// Upper bound on the element count `list * n` may produce.
const MAX_LIST_LEN: usize = 1 << 26;

pub fn binary_op(left: &Value, right: &Value, op: &str, line: usize) -> Result<Value, VmError> {
    if left.is_double() || right.is_double() {
        return float_op(left.coerce_f64(), right.coerce_f64(), op, line);
    }
    if left.is_integer() && right.is_integer() {
        return int_op(left.coerce_i64(), right.coerce_i64(), op, line);
    }

    match (left, right) {
        (Value::Str(a), Value::Str(b)) => match op {
            "+" => Ok(Value::Str(format!("{}{}", a, b))),
            "==" => Ok(Value::Bool(a == b)),
            "!=" => Ok(Value::Bool(a != b)),
            _ => Err(VmError::type_error(
                format!("Unsupported operator for string: {}", op),
                line,
            )),
        },
        (Value::Pointer(_), _) | (_, Value::Pointer(_)) => pointer_op(left, right, op, line),
        (Value::List(a), Value::List(b)) if op == "+" => {
            let mut items = Vec::with_capacity(a.len() + b.len());
            items.extend(a.iter().cloned());
            items.extend(b.iter().cloned());
            Ok(Value::List(items))
        }
        (Value::List(items), count) if op == "*" && count.is_integer() => {
            let times = count.coerce_i64().max(0) as usize;
            if items.is_empty() || times == 0 {
                return Ok(Value::List(Vec::new()));
            }
            let too_large = || {
                VmError::memory(
                    format!("List repetition too large: {} x {}", items.len(), times),
                    line,
                )
            };
            let total = items
                .len()
                .checked_mul(times)
                .filter(|&total| total <= MAX_LIST_LEN)
                .ok_or_else(too_large)?;
            let mut out = Vec::new();
            out.try_reserve_exact(total).map_err(|_| too_large())?;
            for _ in 0..times {
                out.extend(items.iter().cloned());
            }
            Ok(Value::List(out))
        }
        (Value::Dict(a), Value::Dict(b)) if op == "==" => Ok(Value::Bool(a == b)),
        _ => Err(VmError::type_error("Binary operation type mismatch", line)),
    }
}

fn float_op(l: f64, r: f64, op: &str, line: usize) -> Result<Value, VmError> {
    let value = match op {
        "+" => Value::Double(l + r),
        "-" => Value::Double(l - r),
        "*" => Value::Double(l * r),
        "/" => {
            if r == 0.0 {
                return Err(VmError::runtime("Division by zero error", line));
            }
            Value::Double(l / r)
        }
        "==" => Value::Bool(l == r),
        "!=" => Value::Bool(l != r),
        "<" => Value::Bool(l < r),
        ">" => Value::Bool(l > r),
        "<=" => Value::Bool(l <= r),
        ">=" => Value::Bool(l >= r),
        "and" | "&&" => Value::Bool(l != 0.0 && r != 0.0),
        "or" | "||" => Value::Bool(l != 0.0 || r != 0.0),
        _ => {
            return Err(VmError::type_error(
                format!("Unsupported operator for floating point: {}", op),
                line,
            ));
        }
    };
    Ok(value)
}

fn int_op(l: i64, r: i64, op: &str, line: usize) -> Result<Value, VmError> {
    let value = match op {
        "+" => Value::Long(l.wrapping_add(r)),
        "-" => Value::Long(l.wrapping_sub(r)),
        "*" => Value::Long(l.wrapping_mul(r)),
        "/" => {
            if r == 0 {
                return Err(VmError::runtime("Division by zero error", line));
            }
            Value::Long(l.wrapping_div(r))
        }
        "%" => {
            if r == 0 {
                return Err(VmError::runtime("Modulo by zero error", line));
            }
            Value::Long(l.wrapping_rem(r))
        }
        "==" => Value::Bool(l == r),
        "!=" => Value::Bool(l != r),
        "<" => Value::Bool(l < r),
        ">" => Value::Bool(l > r),
        "<=" => Value::Bool(l <= r),
        ">=" => Value::Bool(l >= r),
        "and" | "&&" => Value::Bool(l != 0 && r != 0),
        "or" | "||" => Value::Bool(l != 0 || r != 0),
        _ => {
            return Err(VmError::type_error(
                format!("Unsupported operator for integer: {}", op),
                line,
            ));
        }
    };
    Ok(value)
}

fn pointer_op(left: &Value, right: &Value, op: &str, line: usize) -> Result<Value, VmError> {
    // A non-pointer operand compares as null.
    let is_null = |v: &Value| v.as_pointer().is_none_or(|p| p.is_null());

    match (op, left, right) {
        ("==", Value::Pointer(a), Value::Pointer(b)) => Ok(Value::Bool(a.target == b.target)),
        ("!=", Value::Pointer(a), Value::Pointer(b)) => Ok(Value::Bool(a.target != b.target)),
        ("==", _, _) => Ok(Value::Bool(is_null(left) && is_null(right))),
        ("!=", _, _) => Ok(Value::Bool(is_null(left) != is_null(right))),
        ("=", _, Value::Pointer(_)) => Ok(right.clone()),
        _ => Err(VmError::type_error(
            format!("Unsupported operator for pointer: {}", op),
            line,
        )),
    }
}

pub fn unary_op(operand: &Value, op: &str, line: usize) -> Result<Value, VmError> {
    match op {
        "-" => match operand {
            Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
            Value::Long(n) => Ok(Value::Long(n.wrapping_neg())),
            Value::Double(d) => Ok(Value::Double(-d)),
            _ => Err(VmError::type_error("Invalid operand type for unary minus", line)),
        },
        "!" | "not" => Ok(Value::Bool(!operand.is_truthy())),
        _ => Err(VmError::type_error(
            format!("Unsupported unary operator: {}", op),
            line,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::{PointerTarget, PointerValue};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_int_arithmetic_widens_to_long() {
        assert_eq!(binary_op(&Value::Int(2), &Value::Int(3), "+", 1).unwrap(), Value::Long(5));
        assert!(matches!(
            binary_op(&Value::Int(7), &Value::Int(2), "/", 1).unwrap(),
            Value::Long(3)
        ));
        assert_eq!(binary_op(&Value::Int(7), &Value::Long(4), "%", 1).unwrap(), Value::Long(3));
        assert_eq!(binary_op(&Value::Int(1), &Value::Int(2), "<", 1).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_double_promotion() {
        let result = binary_op(&Value::Double(1.5), &Value::Int(2), "+", 1).unwrap();
        assert!(matches!(result, Value::Double(d) if d == 3.5));
        // Strings count as 0.0 next to a double.
        let result = binary_op(&Value::Double(1.0), &Value::from("x"), "*", 1).unwrap();
        assert!(matches!(result, Value::Double(d) if d == 0.0));
    }

    #[test]
    fn test_list_repetition_bounds() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let err = binary_op(&list, &Value::Long(1_000_000_000_000_000_000), "*", 7).unwrap_err();
        assert!(matches!(err, VmError::Memory { .. }));
        assert_eq!(err.line(), Some(7));
        assert!(err.message().starts_with("List repetition too large"));

        let err = binary_op(&list, &Value::Long(i64::MAX), "*", 3).unwrap_err();
        assert_eq!(err.line(), Some(3));

        assert_eq!(
            binary_op(&Value::List(vec![]), &Value::Long(i64::MAX), "*", 1).unwrap(),
            Value::List(vec![])
        );
        assert_eq!(
            binary_op(&list, &Value::Int(-2), "*", 1).unwrap(),
            Value::List(vec![])
        );
    }

    #[test]
    fn test_division_by_zero_carries_line() {
        let err = binary_op(&Value::Int(1), &Value::Int(0), "/", 12).unwrap_err();
        assert_eq!(err.to_string(), "Runtime Error: Division by zero error");
        assert_eq!(err.line(), Some(12));

        let err = binary_op(&Value::Double(1.0), &Value::Double(0.0), "/", 4).unwrap_err();
        assert_eq!(err.line(), Some(4));

        let err = binary_op(&Value::Int(1), &Value::Int(0), "%", 5).unwrap_err();
        assert_eq!(err.message(), "Modulo by zero error");
    }

    #[test]
    fn test_strings() {
        let result = binary_op(&Value::from("ab"), &Value::from("cd"), "+", 1).unwrap();
        assert_eq!(result, Value::from("abcd"));
        assert!(matches!(
            binary_op(&Value::from("a"), &Value::from("b"), "-", 1),
            Err(VmError::Type { .. })
        ));
    }

    #[test]
    fn test_pointers() {
        let a = Value::Pointer(PointerValue::new(PointerTarget::Object(1), "int"));
        let b = Value::Pointer(PointerValue::new(PointerTarget::Object(2), "int"));
        let null = Value::Pointer(PointerValue::null("int"));
        assert_eq!(binary_op(&a, &a, "==", 1).unwrap(), Value::Bool(true));
        assert_eq!(binary_op(&a, &b, "!=", 1).unwrap(), Value::Bool(true));
        assert_eq!(binary_op(&null, &Value::Null, "==", 1).unwrap(), Value::Bool(true));
        assert_eq!(binary_op(&a, &Value::Null, "!=", 1).unwrap(), Value::Bool(true));
        assert_eq!(binary_op(&a, &b, "=", 1).unwrap(), b);
        assert!(binary_op(&a, &b, "+", 1).is_err());
    }

    #[test]
    fn test_lists_and_dicts() {
        let list = Value::List(vec![Value::Int(1)]);
        let doubled = binary_op(&list, &list, "+", 1).unwrap();
        assert_eq!(doubled, Value::List(vec![Value::Int(1), Value::Int(1)]));
        let tripled = binary_op(&list, &Value::Int(3), "*", 1).unwrap();
        assert_eq!(tripled, Value::List(vec![Value::Int(1); 3]));
        assert!(binary_op(&list, &Value::from("x"), "*", 1).is_err());

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::Int(1));
        let dict = Value::Dict(map);
        assert_eq!(binary_op(&dict, &dict.clone(), "==", 1).unwrap(), Value::Bool(true));
        assert!(binary_op(&dict, &Value::Int(1), "==", 1).is_err());
    }

    #[test]
    fn test_mismatch() {
        let err = binary_op(&Value::Bool(true), &Value::Int(1), "+", 3).unwrap_err();
        assert!(matches!(err, VmError::Type { .. }));
        assert_eq!(err.line(), Some(3));
    }

    #[test]
    fn test_unary() {
        assert_eq!(unary_op(&Value::Int(5), "-", 1).unwrap(), Value::Int(-5));
        assert_eq!(unary_op(&Value::Int(0), "!", 1).unwrap(), Value::Bool(true));
        assert_eq!(unary_op(&Value::from("x"), "not", 1).unwrap(), Value::Bool(false));
        assert_eq!(
            unary_op(&Value::from("x"), "-", 1).unwrap_err().message(),
            "Invalid operand type for unary minus"
        );
        assert!(unary_op(&Value::Int(1), "~", 1).is_err());
    }

    proptest! {
        #[test]
        fn int_addition_is_exact(a in any::<i32>(), b in any::<i32>()) {
            let result = binary_op(&Value::Int(a), &Value::Int(b), "+", 1).unwrap();
            prop_assert_eq!(result, Value::Long(a as i64 + b as i64));
        }
    }
}
