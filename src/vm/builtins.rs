//! Built-in function table.
//!
//! Built-ins never fail on bad arguments: they print a diagnostic to stderr
//! and return a sentinel (`-1`, `""`, a null pointer). Only `throw` raises.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use super::error::VmError;
use super::objects::size_for_type;
use super::value::{PointerTarget, PointerValue, Value};
use super::vm::{SharedOutput, VirtualMachine};

pub type BuiltinFn = fn(&mut VirtualMachine, Vec<Value>) -> Result<Value, VmError>;

/// Nested `run` calls allowed before refusing.
const MAX_RUN_DEPTH: usize = 16;

/// Build the name -> function table.
pub fn builtin_table() -> HashMap<&'static str, BuiltinFn> {
    let entries: [(&'static str, BuiltinFn); 26] = [
        ("print", builtin_print),
        ("input", builtin_input),
        ("int", builtin_int),
        ("float", builtin_float),
        ("string", builtin_string),
        ("bool", builtin_bool),
        ("new", builtin_new),
        ("type", builtin_type),
        ("hash", builtin_hash),
        ("bs", builtin_bs),
        ("run", builtin_run),
        ("open", builtin_open),
        ("close", builtin_close),
        ("write", builtin_write),
        ("read", builtin_read),
        ("throw", builtin_throw),
        ("abs", builtin_abs),
        ("pow", builtin_pow),
        ("len", builtin_len),
        ("substr", builtin_substr),
        ("append", builtin_append),
        ("dict_append", builtin_dict_append),
        ("del", builtin_del),
        ("list", builtin_list),
        ("deref", builtin_deref),
        ("dict", builtin_dict),
    ];
    entries.into_iter().collect()
}

fn builtin_print(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let text = args.first().map(Value::to_string).unwrap_or_default();
    vm.write_line(&text)?;
    Ok(Value::Null)
}

fn builtin_input(vm: &mut VirtualMachine, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::Str(vm.read_line()))
}

/// Parse a leading integer the way `std::stoi` does. Out-of-range and
/// missing digits give 0.
fn parse_int_prefix(text: &str) -> i32 {
    let trimmed = text.trim_start();
    let mut end = 0;
    for (i, c) in trimmed.char_indices() {
        let sign = i == 0 && (c == '+' || c == '-');
        if !(sign || c.is_ascii_digit()) {
            break;
        }
        end = i + c.len_utf8();
    }
    trimmed[..end].parse().unwrap_or(0)
}

/// Longest leading run of `text` that parses as a double.
fn parse_float_prefix(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let mut boundaries: Vec<usize> = trimmed.char_indices().map(|(i, _)| i).skip(1).collect();
    boundaries.push(trimmed.len());
    boundaries
        .into_iter()
        .rev()
        .find_map(|end| trimmed[..end].parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn builtin_int(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let value = match args.first() {
        Some(Value::Str(s)) => Value::Int(parse_int_prefix(s)),
        Some(Value::Double(d)) => Value::Int(*d as i32),
        Some(Value::Long(n)) => Value::Int(*n as i32),
        Some(Value::Bool(b)) => Value::Int(*b as i32),
        Some(v @ Value::Int(_)) => v.clone(),
        _ => Value::Int(0),
    };
    Ok(value)
}

fn builtin_float(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let value = match args.first() {
        Some(Value::Str(s)) => parse_float_prefix(s),
        Some(v @ (Value::Int(_) | Value::Long(_) | Value::Bool(_) | Value::Double(_))) => {
            v.coerce_f64()
        }
        _ => 0.0,
    };
    Ok(Value::Double(value))
}

fn builtin_string(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let text = match args.first() {
        Some(Value::Int(n)) => n.to_string(),
        Some(Value::Long(n)) => n.to_string(),
        Some(Value::Double(d)) => format!("{:.6}", d),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Str(s)) => s.clone(),
        Some(Value::Null) => "null".to_string(),
        _ => String::new(),
    };
    Ok(Value::Str(text))
}

fn builtin_bool(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let truth = match args.first() {
        Some(Value::Int(n)) => *n != 0,
        Some(Value::Long(n)) => *n != 0,
        Some(Value::Double(d)) => *d != 0.0,
        Some(Value::Str(s)) => {
            let lower = s.to_lowercase();
            lower != "false" && lower != "0" && !lower.is_empty()
        }
        Some(Value::Bool(b)) => *b,
        _ => false,
    };
    Ok(Value::Bool(truth))
}

fn builtin_new(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(arg) = args.first() else {
        return Ok(Value::Pointer(PointerValue::null("object")));
    };
    let type_tag = match arg {
        Value::Str(s) => s.clone(),
        other => other.type_name().to_string(),
    };
    let size = size_for_type(&type_tag);

    if !vm.fits_heap_limit(size) {
        eprintln!("Error: heap limit exceeded allocating {}", type_tag);
        return Ok(Value::Pointer(PointerValue::null(&type_tag)));
    }
    match vm.objects.create(&type_tag, size) {
        Some(id) => Ok(Value::Pointer(PointerValue::new(
            PointerTarget::Object(id),
            &type_tag,
        ))),
        None => Ok(Value::Pointer(PointerValue::null(&type_tag))),
    }
}

fn builtin_type(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let name = args.first().map_or("unknown", Value::type_name);
    Ok(Value::Str(name.to_string()))
}

fn builtin_hash(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(arg) = args.first() else {
        return Ok(Value::Long(0));
    };
    let mut hasher = DefaultHasher::new();
    match arg {
        Value::Str(s) => s.hash(&mut hasher),
        Value::Int(n) => n.hash(&mut hasher),
        Value::Double(d) => d.to_bits().hash(&mut hasher),
        other => other.type_name().hash(&mut hasher),
    }
    Ok(Value::Long(hasher.finish() as i64))
}

fn builtin_bs(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    match args.first().and_then(Value::as_i64) {
        Some(n) => Ok(Value::Long(n)),
        None => Ok(Value::from("0")),
    }
}

/// Load and execute another IR file in a child VM, forwarding its output.
fn builtin_run(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(path) = args.first().and_then(Value::as_str) else {
        eprintln!("Error: run expects a file path");
        return Ok(Value::Int(-1));
    };
    if vm.run_depth >= MAX_RUN_DEPTH {
        eprintln!("Error: run nested too deeply: {}", path);
        return Ok(Value::Int(-1));
    }

    let captured = SharedOutput::new();
    let mut child = VirtualMachine::with_config(vm.config.clone());
    child.set_output(Box::new(captured.clone()));
    child.run_depth = vm.run_depth + 1;

    let status = match child.load_program(path) {
        Ok(()) => match child.execute() {
            Ok(()) => 0,
            Err(_) => -1,
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            -1
        }
    };
    drop(child);

    vm.write_raw(&captured.contents())?;
    Ok(Value::Int(status))
}

fn file_handle(value: Option<&Value>) -> Option<i64> {
    match value?.as_pointer()?.target {
        PointerTarget::File(id) => Some(id),
        _ => None,
    }
}

fn builtin_open(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(path) = args.first().and_then(Value::as_str) else {
        return Ok(Value::Pointer(PointerValue::null("file")));
    };
    let mode = args.get(1).and_then(Value::as_str).unwrap_or("r");

    match vm.files.open(path, mode) {
        Ok(id) => Ok(Value::Pointer(PointerValue::new(PointerTarget::File(id), "file"))),
        Err(_) => {
            eprintln!("Error: Could not open file: {}", path);
            Ok(Value::Pointer(PointerValue::null("file")))
        }
    }
}

fn builtin_close(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(id) = file_handle(args.first()) else {
        eprintln!("Error: Cannot close null file handle");
        return Ok(Value::Int(-1));
    };
    if vm.files.close(id) {
        Ok(Value::Int(0))
    } else {
        eprintln!("Error: Invalid file handle");
        Ok(Value::Int(-1))
    }
}

fn builtin_write(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let (Some(id), Some(content)) = (file_handle(args.first()), args.get(1)) else {
        eprintln!("Error: Invalid file handle for write");
        return Ok(Value::Int(-1));
    };
    match vm.files.write(id, &content.to_string()) {
        Some(Ok(written)) => Ok(Value::Int(written as i32)),
        Some(Err(_)) => {
            eprintln!("Error: File not open for writing");
            Ok(Value::Int(-1))
        }
        None => {
            eprintln!("Error: Invalid file handle for write");
            Ok(Value::Int(-1))
        }
    }
}

fn builtin_read(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let result = file_handle(args.first()).and_then(|id| vm.files.read_to_end(id));
    match result {
        Some(Ok(text)) => Ok(Value::Str(text)),
        Some(Err(_)) => {
            eprintln!("Error: File not open for reading");
            Ok(Value::from(""))
        }
        None => {
            eprintln!("Error: Invalid file handle for read");
            Ok(Value::from(""))
        }
    }
}

fn builtin_throw(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let message = match args.first() {
        Some(value) => value.to_string(),
        None => "Exception thrown".to_string(),
    };
    Err(VmError::runtime(message, 0))
}

fn builtin_abs(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let value = match args.first() {
        Some(Value::Int(n)) => Value::Int(n.wrapping_abs()),
        Some(Value::Long(n)) => Value::Long(n.wrapping_abs()),
        Some(Value::Double(d)) => Value::Double(d.abs()),
        _ => Value::Int(0),
    };
    Ok(value)
}

fn builtin_pow(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let [base, exponent, ..] = args.as_slice() else {
        return Ok(Value::Double(1.0));
    };
    let numeric = |v: &Value| match v {
        Value::Int(_) | Value::Long(_) | Value::Double(_) => v.coerce_f64(),
        _ => 0.0,
    };
    Ok(Value::Double(numeric(base).powf(numeric(exponent))))
}

fn builtin_len(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let len = match args.first() {
        Some(Value::Str(s)) => s.chars().count(),
        Some(Value::List(items)) => items.len(),
        Some(Value::Dict(items)) => items.len(),
        _ => 0,
    };
    Ok(Value::Int(len as i32))
}

fn builtin_substr(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let (Some(Value::Str(s)), Some(start)) = (args.first(), args.get(1)) else {
        return Ok(Value::from(""));
    };
    let chars: Vec<char> = s.chars().collect();
    let total = chars.len() as i64;

    let start = start.as_i64().unwrap_or(0).max(0);
    if start >= total {
        return Ok(Value::from(""));
    }
    let len = args
        .get(2)
        .and_then(Value::as_i64)
        .unwrap_or(total)
        .clamp(0, total - start);

    let text: String = chars[start as usize..(start + len) as usize].iter().collect();
    Ok(Value::Str(text))
}

fn builtin_append(_vm: &mut VirtualMachine, mut args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() >= 2 && matches!(args[0], Value::List(_)) {
        let item = args.swap_remove(1);
        if let Value::List(mut items) = args.swap_remove(0) {
            items.push(item);
            return Ok(Value::List(items));
        }
    }
    Ok(args.into_iter().next().unwrap_or(Value::Int(0)))
}

fn builtin_dict_append(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    if let [Value::Dict(items), key, value, ..] = args.as_slice() {
        let mut items = items.clone();
        items.insert(key.to_string(), value.clone());
        return Ok(Value::Dict(items));
    }
    Ok(args.into_iter().next().unwrap_or(Value::Int(0)))
}

fn builtin_dict(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let mut items = BTreeMap::new();
    for pair in args.chunks(2) {
        if let [key, value] = pair {
            items.insert(key.to_string(), value.clone());
        }
    }
    Ok(Value::Dict(items))
}

fn builtin_del(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(arg) = args.first() else {
        return Ok(Value::Int(-1));
    };
    if let Some(ptr) = arg.as_pointer() {
        match ptr.target {
            PointerTarget::Object(id) => {
                vm.objects.free(id);
            }
            PointerTarget::Gc(handle) => vm.gc.deallocate(handle),
            PointerTarget::Address(address) => {
                vm.raw_blocks.free(address);
            }
            PointerTarget::File(_) | PointerTarget::Null => {}
        }
    }
    Ok(Value::Int(0))
}

fn builtin_list(_vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::List(args))
}

fn builtin_deref(vm: &mut VirtualMachine, args: Vec<Value>) -> Result<Value, VmError> {
    match args.first().and_then(Value::as_pointer) {
        Some(ptr) if vm.pointer_is_live(ptr) => {
            Ok(Value::Str(format!("[ptr_data:{}]", ptr.type_tag)))
        }
        _ => Ok(Value::from("null")),
    }
}
