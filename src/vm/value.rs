use std::collections::BTreeMap;
use std::fmt;

use super::gc::GcHandle;

/// Identifier of an entry in the VM's managed-object table.
pub type ObjectId = i64;

/// What a pointer refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerTarget {
    Null,
    /// Entry in the managed-object table (`new`, `PTR_new`).
    Object(ObjectId),
    /// Object owned by the garbage collector (`GC_new`).
    Gc(GcHandle),
    /// Open file handle (`open`).
    File(i64),
    /// Raw block from `MEM_malloc`.
    Address(i64),
}

/// A pointer value.
///
/// `is_null()` is derived from the target, so a pointer can never claim to be
/// null while still referring to something.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerValue {
    pub target: PointerTarget,
    pub type_tag: String,
    /// Non-owning; not treated as a root by the collector.
    pub is_weak: bool,
    /// A reference cannot be rebound to null.
    pub is_ref: bool,
}

impl PointerValue {
    pub fn null(type_tag: &str) -> Self {
        Self {
            target: PointerTarget::Null,
            type_tag: type_tag.to_string(),
            is_weak: false,
            is_ref: false,
        }
    }

    pub fn new(target: PointerTarget, type_tag: &str) -> Self {
        Self {
            target,
            type_tag: type_tag.to_string(),
            is_weak: false,
            is_ref: false,
        }
    }

    pub fn weak(target: PointerTarget, type_tag: &str) -> Self {
        Self {
            is_weak: true,
            ..Self::new(target, type_tag)
        }
    }

    /// Create a reference. Returns `None` for a null target.
    pub fn reference(target: PointerTarget, type_tag: &str) -> Option<Self> {
        if target == PointerTarget::Null {
            return None;
        }
        Some(Self {
            is_ref: true,
            ..Self::new(target, type_tag)
        })
    }

    pub fn is_null(&self) -> bool {
        self.target == PointerTarget::Null
    }

    /// Point at a new target. References refuse to become null.
    pub fn rebind(&mut self, target: PointerTarget) -> bool {
        if self.is_ref && target == PointerTarget::Null {
            return false;
        }
        self.target = target;
        true
    }

    /// Integer identity of the target, used for pointer arithmetic coercion.
    pub fn address(&self) -> i64 {
        match self.target {
            PointerTarget::Null => 0,
            PointerTarget::Object(id) | PointerTarget::File(id) | PointerTarget::Address(id) => id,
            PointerTarget::Gc(handle) => handle.raw() as i64,
        }
    }
}

/// A dynamically typed VM value.
#[derive(Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Str(String),
    Null,
    Pointer(PointerValue),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// Int or Long.
    pub fn is_integer(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Long(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self, Value::Double(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&PointerValue> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    /// Exact integer view of Int/Long.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n as i64),
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    /// Truthiness used by IF, WHILE and logical operators.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Long(n) => *n != 0,
            Value::Double(d) => *d != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Null => false,
            Value::Pointer(p) => !p.is_null(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(items) => !items.is_empty(),
        }
    }

    /// Numeric coercion used when the other operand is a double.
    pub fn coerce_f64(&self) -> f64 {
        match self {
            Value::Double(d) => *d,
            Value::Int(n) => *n as f64,
            Value::Long(n) => *n as f64,
            Value::Bool(b) => *b as i64 as f64,
            Value::List(items) => items.len() as f64,
            Value::Dict(items) => items.len() as f64,
            Value::Str(_) | Value::Null | Value::Pointer(_) => 0.0,
        }
    }

    /// Integer coercion used for sizes and addresses.
    pub fn coerce_i64(&self) -> i64 {
        match self {
            Value::Int(n) => *n as i64,
            Value::Long(n) => *n,
            Value::Bool(b) => *b as i64,
            Value::Pointer(p) => p.address(),
            Value::List(items) => items.len() as i64,
            Value::Dict(items) => items.len() as i64,
            Value::Double(_) | Value::Str(_) | Value::Null => 0,
        }
    }

    /// Name reported by the `type` built-in.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Double(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Null => "null",
            Value::Pointer(p) => &p.type_tag,
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Double(a), b) if b.is_integer() => *a == b.coerce_f64(),
            (a, Value::Double(b)) if a.is_integer() => a.coerce_f64() == *b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (a, b) if a.is_integer() && b.is_integer() => a.as_i64() == b.as_i64(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Pointer(a), Value::Pointer(b)) => a.target == b.target,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Long(n) => write!(f, "Long({})", n),
            Value::Double(d) => write!(f, "Double({})", d),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Null => write!(f, "Null"),
            Value::Pointer(p) => write!(f, "Pointer({:?}, {})", p.target, p.type_tag),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Dict(items) => f.debug_map().entries(items).finish(),
        }
    }
}

/// Display form used by PRINT and the `print` built-in.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Long(n) => write!(f, "{}", n),
            Value::Double(d) => write!(f, "{}", format_double(*d)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Null => write!(f, "null"),
            Value::Pointer(p) if p.is_null() => write!(f, "null_ptr"),
            Value::Pointer(p) => write!(f, "ptr({})", p.type_tag),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(items) => {
                write!(f, "{{")?;
                for (i, (key, item)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, item)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Format a double the way a C++ stream does by default (`%g`, six
/// significant digits).
pub fn format_double(value: f64) -> String {
    const PRECISION: i32 = 6;

    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let sci = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i32 = exp.parse().unwrap_or(0);

    if exp < -4 || exp >= PRECISION {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (PRECISION - 1 - exp) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Long(0).is_truthy());
        assert!(!Value::Double(0.0).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(!Value::Dict(BTreeMap::new()).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Null.is_truthy());

        assert!(Value::Int(-1).is_truthy());
        assert!(Value::Double(0.5).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn test_mixed_numeric_equality() {
        assert_eq!(Value::Int(42), Value::Long(42));
        assert_eq!(Value::Int(42), Value::Double(42.0));
        assert_ne!(Value::Int(1), Value::Bool(true));
        assert_ne!(Value::Int(0), Value::Null);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Int(1).type_name(), "int");
        assert_eq!(Value::Long(1).type_name(), "long");
        assert_eq!(Value::Double(1.0).type_name(), "float");
        let ptr = PointerValue::new(PointerTarget::Object(3), "int");
        assert_eq!(Value::Pointer(ptr).type_name(), "int");
    }

    #[test]
    fn test_reference_cannot_be_null() {
        assert!(PointerValue::reference(PointerTarget::Null, "object").is_none());
        let mut r = PointerValue::reference(PointerTarget::Object(1), "object").unwrap();
        assert!(!r.rebind(PointerTarget::Null));
        assert!(!r.is_null());
        assert!(r.rebind(PointerTarget::Object(2)));
    }

    #[test]
    fn test_display() {
        let list = Value::List(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(list.to_string(), "[1, a]");
        let mut dict = BTreeMap::new();
        dict.insert("b".to_string(), Value::Bool(true));
        dict.insert("a".to_string(), Value::Null);
        assert_eq!(Value::Dict(dict).to_string(), "{a: null, b: true}");
        assert_eq!(Value::Pointer(PointerValue::null("object")).to_string(), "null_ptr");
    }

    #[test]
    fn test_format_double() {
        assert_eq!(format_double(3.5), "3.5");
        assert_eq!(format_double(2.0), "2");
        assert_eq!(format_double(0.1 + 0.2), "0.3");
        assert_eq!(format_double(1e20), "1e+20");
        assert_eq!(format_double(123456789.0), "1.23457e+08");
        assert_eq!(format_double(0.0001), "0.0001");
        assert_eq!(format_double(0.00001), "1e-05");
        assert_eq!(format_double(-2.25), "-2.25");
        assert_eq!(format_double(100000.0), "100000");
    }
}
