//! The `internals` object and the handful of Lisp functions the host
//! predefines so that macro expanders have something to call.

use std::rc::Rc;

use super::{
    interp::{EvalResult, Interp, Throw},
    value::{Class, ConditionKind, Value},
};
use crate::compiler::sexpr::{COMMON_LISP, KEYWORD};

impl Interp {
    pub fn make_symbol(&self, name: &str, package: Option<&str>) -> Value {
        let symbol = Value::object(Class::Symbol, [("name", Value::str(name))]);
        if let Some(package) = package {
            symbol.set("package", Value::str(package));
        }
        symbol
    }

    pub fn intern(&mut self, name: &str, package: &str) -> Value {
        let key: (Rc<str>, Rc<str>) = (Rc::from(package), Rc::from(name));
        if let Some(symbol) = self.obarray.get(&key) {
            return symbol.clone();
        }
        let symbol = self.make_symbol(name, Some(package));
        let self_evaluating =
            package == KEYWORD || (package == COMMON_LISP && (name == "NIL" || name == "T"));
        if self_evaluating {
            symbol.set("value", symbol.clone());
        }
        self.obarray.insert(key, symbol.clone());
        symbol
    }

    pub fn nil(&mut self) -> Value {
        self.intern("NIL", COMMON_LISP)
    }

    pub fn t(&mut self) -> Value {
        self.intern("T", COMMON_LISP)
    }

    pub fn boolean(&mut self, b: bool) -> Value {
        if b {
            self.t()
        } else {
            self.nil()
        }
    }

    pub fn cons(&self, car: Value, cdr: Value) -> Value {
        Value::object(Class::Cons, [("car", car), ("cdr", cdr)])
    }

    pub fn list_to_vec(&self, mut list: Value) -> Vec<Value> {
        let mut items = vec![];
        while list.is_class(Class::Cons) {
            items.push(list.get("car"));
            list = list.get("cdr");
        }
        items
    }

    pub fn vec_to_list(&self, items: Vec<Value>, tail: Value) -> Value {
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| self.cons(item, acc))
    }

    pub fn is_mv(&self, value: &Value) -> bool {
        matches!(value, Value::Array(_)) && value.get("multiple-value").truthy()
    }

    pub fn make_mv(&self, values: Vec<Value>) -> Value {
        let mv = Value::array(values);
        mv.set("multiple-value", Value::Bool(true));
        mv
    }

    fn coerce_function(&mut self, f: &Value) -> EvalResult<Value> {
        if f.is_function() {
            return Ok(f.clone());
        }
        if f.is_class(Class::Symbol) {
            let fvalue = f.get("fvalue");
            if fvalue.is_function() {
                return Ok(fvalue);
            }
            return Err(self.condition(
                ConditionKind::UndefinedFunction,
                format!("the function {} is undefined", f),
                f.clone(),
            ));
        }
        Err(self.type_error(format!("{} is not a function designator", f)))
    }

    fn storage_index(&self, v: &Value, i: &Value) -> EvalResult<usize> {
        let len = match v {
            Value::Array(arr) => arr.items.borrow().len(),
            _ => return Err(self.type_error(format!("{} is not a storage vector", v))),
        };
        match i.as_number() {
            Some(n) if n >= 0.0 && n.fract() == 0.0 && (n as usize) < len => Ok(n as usize),
            _ => Err(self.condition(
                ConditionKind::OutOfRange,
                format!("index {} out of range for a vector of size {}", i, len),
                i.clone(),
            )),
        }
    }
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

fn nargs_check(interp: &mut Interp, args: &[Value], ok: fn(f64, f64) -> bool, message: &str) -> EvalResult<Value> {
    let nargs = interp.number(&arg(args, 0))?;
    let expected = interp.number(&arg(args, 1))?;
    if ok(nargs, expected) {
        Ok(Value::Undefined)
    } else {
        Err(interp.condition(ConditionKind::ArgumentCount, message, arg(args, 0)))
    }
}

fn check_args(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    nargs_check(interp, args, |n, e| n == e, "invalid number of arguments")
}

fn check_args_at_least(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    nargs_check(interp, args, |n, e| n >= e, "too few arguments")
}

fn check_args_at_most(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    nargs_check(interp, args, |n, e| n <= e, "too many arguments")
}

fn symbol(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let name = arg(args, 0).to_key();
    Ok(interp.make_symbol(&name, None))
}

fn intern(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let name = arg(args, 0).to_key();
    let package = match arg(args, 1) {
        Value::Undefined => Rc::from(COMMON_LISP),
        other => other.to_key(),
    };
    Ok(interp.intern(&name, &package))
}

fn make_lisp_string(_: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(Value::Str(arg(args, 0).to_key()))
}

fn qi_list(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    match args.split_last() {
        Some((tail, items)) => Ok(interp.vec_to_list(items.to_vec(), tail.clone())),
        None => Ok(interp.nil()),
    }
}

fn cons(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(interp.cons(arg(args, 0), arg(args, 1)))
}

fn mv(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(interp.make_mv(args.to_vec()))
}

/// The primary value: the first argument, or the first element of a
/// multiple-value array.
fn pv(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    match args.first() {
        Some(Value::Undefined) | None => Ok(interp.nil()),
        Some(x) if interp.is_mv(x) => match x.get("0") {
            Value::Undefined => Ok(interp.nil()),
            first => Ok(first),
        },
        Some(x) => Ok(x.clone()),
    }
}

fn forcemv(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let x = arg(args, 0);
    if interp.is_mv(&x) {
        Ok(x)
    } else {
        Ok(interp.make_mv(vec![x]))
    }
}

fn symbol_value(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let symbol = arg(args, 0);
    match symbol.get("value") {
        Value::Undefined => Err(interp.condition(
            ConditionKind::UnboundVariable,
            format!("the variable {} is unbound", symbol),
            symbol,
        )),
        value => Ok(value),
    }
}

fn symbol_function(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let symbol = arg(args, 0);
    match symbol.get("fvalue") {
        f if f.is_function() => Ok(f),
        _ => Err(interp.condition(
            ConditionKind::UndefinedFunction,
            format!("the function {} is undefined", symbol),
            symbol,
        )),
    }
}

fn coerce_function(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    interp.coerce_function(&arg(args, 0))
}

/// `apply(values, f, arg..., list)`
fn apply(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let function = interp.coerce_function(&arg(args, 1))?;
    let mut spread = args.get(2..).map(<[Value]>::to_vec).unwrap_or_default();
    if let Some(list) = spread.pop() {
        spread.extend(interp.list_to_vec(list));
    }
    let mut call_args = vec![arg(args, 0), Value::Number(spread.len() as f64)];
    call_args.extend(spread);
    interp.call(&function, &call_args)
}

fn block_nlx(_: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(Value::object(
        Class::BlockNlx,
        [("id", arg(args, 0)), ("values", arg(args, 1)), ("name", arg(args, 2))],
    ))
}

fn catch_nlx(_: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(Value::object(
        Class::CatchNlx,
        [("id", arg(args, 0)), ("values", arg(args, 1))],
    ))
}

fn tag_nlx(_: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(Value::object(
        Class::TagNlx,
        [("id", arg(args, 0)), ("label", arg(args, 1))],
    ))
}

fn check_number(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    match arg(args, 0) {
        x @ Value::Number(_) => Ok(x),
        x => Err(interp.condition(
            ConditionKind::TypeError,
            format!("{} is not a number", x),
            x,
        )),
    }
}

/// The integer quotient of `x / y`, rounded toward negative infinity.
fn floor(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let x = interp.number(&arg(args, 0))?;
    let y = match arg(args, 1) {
        Value::Undefined => 1.0,
        y => interp.number(&y)?,
    };
    Ok(Value::Number((x / y).floor()))
}

fn raise(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let kind = ConditionKind::from_name(&arg(args, 0).to_key()).unwrap_or(ConditionKind::SimpleError);
    let message = arg(args, 1).to_key();
    Err(interp.condition(kind, message.to_string(), arg(args, 2)))
}

fn error(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let datum = arg(args, 0);
    Err(interp.condition(ConditionKind::SimpleError, datum.to_string(), datum))
}

fn list_to_array(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(Value::array(interp.list_to_vec(arg(args, 0))))
}

fn append_lists(interp: &mut Interp, lists: &[Value]) -> Value {
    match lists.split_last() {
        None => interp.nil(),
        Some((last, init)) => {
            let items = init
                .iter()
                .flat_map(|list| interp.list_to_vec(list.clone()))
                .collect::<Vec<_>>();
            interp.vec_to_list(items, last.clone())
        }
    }
}

fn append(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(append_lists(interp, args))
}

fn new_array(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let size = interp.number(&arg(args, 0))?;
    Ok(Value::array(vec![Value::Undefined; size.max(0.0) as usize]))
}

fn storage_ref(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let v = arg(args, 0);
    let i = interp.storage_index(&v, &arg(args, 1))?;
    Ok(v.get(&i.to_string()))
}

fn storage_set(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let v = arg(args, 0);
    let i = interp.storage_index(&v, &arg(args, 1))?;
    let x = arg(args, 2);
    v.set(&i.to_string(), x.clone());
    Ok(x)
}

fn code_char(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let code = interp.number(&arg(args, 0))?;
    match char::from_u32(code as u32) {
        Some(c) => Ok(Value::str(&c.to_string())),
        None => Err(interp.type_error(format!("{} is not a character code", code))),
    }
}

fn char_code(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    match arg(args, 0) {
        Value::Str(s) if s.chars().count() == 1 => {
            Ok(Value::Number(s.chars().next().map_or(0, |c| c as u32) as f64))
        }
        other => Err(interp.type_error(format!("{} is not a character", other))),
    }
}

/// Lisp functions receive `(values, nargs, args...)`.
fn lisp_args(args: &[Value]) -> &[Value] {
    args.get(2..).unwrap_or(&[])
}

fn lisp_list(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let nil = interp.nil();
    Ok(interp.vec_to_list(lisp_args(args).to_vec(), nil))
}

fn lisp_append(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(append_lists(interp, lisp_args(args)))
}

fn lisp_reverse(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let mut items = interp.list_to_vec(arg(lisp_args(args), 0));
    items.reverse();
    let nil = interp.nil();
    Ok(interp.vec_to_list(items, nil))
}

fn lisp_length(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    match arg(lisp_args(args), 0) {
        x @ (Value::Str(_) | Value::Array(_)) => Ok(x.get("length")),
        list => Ok(Value::Number(interp.list_to_vec(list).len() as f64)),
    }
}

fn lisp_nth(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let args = lisp_args(args);
    let n = interp.number(&arg(args, 0))? as usize;
    let items = interp.list_to_vec(arg(args, 1));
    match items.get(n) {
        Some(x) => Ok(x.clone()),
        None => Ok(interp.nil()),
    }
}

fn lisp_gensym(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let prefix = match arg(lisp_args(args), 0) {
        Value::Str(s) => s.to_string(),
        _ => "G".to_string(),
    };
    interp.gensym_counter += 1;
    let name = format!("{}{}", prefix, interp.gensym_counter);
    Ok(interp.make_symbol(&name, None))
}

fn lisp_mapcar(interp: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    let args = lisp_args(args);
    let function = interp.coerce_function(&arg(args, 0))?;
    let pv = interp.internals.get("pv").cloned().unwrap_or(Value::Undefined);
    let mut result = vec![];
    for item in interp.list_to_vec(arg(args, 1)) {
        result.push(interp.call(&function, &[pv.clone(), Value::Number(1.0), item])?);
    }
    let nil = interp.nil();
    Ok(interp.vec_to_list(result, nil))
}

fn lisp_identity(_: &mut Interp, args: &[Value]) -> EvalResult<Value> {
    Ok(arg(lisp_args(args), 0))
}

pub fn install(interp: &mut Interp) {
    let natives: &[(&'static str, super::value::NativeFn)] = &[
        ("intern", intern),
        ("make_lisp_string", make_lisp_string),
        ("QIList", qi_list),
        ("mv", mv),
        ("pv", pv),
        ("forcemv", forcemv),
        ("checkArgs", check_args),
        ("checkArgsAtLeast", check_args_at_least),
        ("checkArgsAtMost", check_args_at_most),
        ("symbolValue", symbol_value),
        ("symbolFunction", symbol_function),
        ("coerceFunction", coerce_function),
        ("apply", apply),
        ("checkNumber", check_number),
        ("floor", floor),
        ("raise", raise),
        ("error", error),
        ("listToArray", list_to_array),
        ("append", append),
        ("newArray", new_array),
        ("storageRef", storage_ref),
        ("storageSet", storage_set),
        ("codeChar", code_char),
        ("charCode", char_code),
    ];
    for &(name, func) in natives {
        interp.internals.insert(name, Value::native(name, func));
    }

    let constructors: &[(&'static str, super::value::NativeFn, Class)] = &[
        ("Symbol", symbol, Class::Symbol),
        ("Cons", cons, Class::Cons),
        ("BlockNLX", block_nlx, Class::BlockNlx),
        ("CatchNLX", catch_nlx, Class::CatchNlx),
        ("TagNLX", tag_nlx, Class::TagNlx),
    ];
    for &(name, func, class) in constructors {
        interp
            .internals
            .insert(name, Value::constructor(name, func, class));
    }

    let mv = interp.internals.get("mv").cloned().unwrap_or(Value::Undefined);
    interp.global.declare(Rc::from("values"), mv);

    let functions: &[(&'static str, super::value::NativeFn)] = &[
        ("LIST", lisp_list),
        ("APPEND", lisp_append),
        ("REVERSE", lisp_reverse),
        ("LENGTH", lisp_length),
        ("NTH", lisp_nth),
        ("GENSYM", lisp_gensym),
        ("MAPCAR", lisp_mapcar),
        ("IDENTITY", lisp_identity),
    ];
    for &(name, func) in functions {
        let symbol = interp.intern(name, COMMON_LISP);
        symbol.set("fvalue", Value::native(name, func));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Interp {
        let mut interp = Interp::new();
        install(&mut interp);
        interp
    }

    fn call(interp: &mut Interp, name: &str, args: &[Value]) -> EvalResult<Value> {
        let f = interp.internals.get(name).cloned().unwrap_or(Value::Undefined);
        interp.call(&f, args)
    }

    #[test]
    fn interning_is_identity_preserving() {
        let mut interp = host();
        let a = interp.intern("FOO", COMMON_LISP);
        let b = interp.intern("FOO", COMMON_LISP);
        assert!(a.strict_equals(&b));
        let nil = interp.nil();
        assert!(nil.get("value").strict_equals(&nil));
        let key = interp.intern("K", KEYWORD);
        assert!(key.get("value").strict_equals(&key));
    }

    #[test]
    fn qilist_builds_dotted_lists() {
        let mut interp = host();
        let nil = interp.nil();
        let list = call(&mut interp, "QIList", &[Value::Number(1.0), Value::Number(2.0), nil]).unwrap();
        assert_eq!(list.to_string(), "(1 2)");
        let dotted = call(&mut interp, "QIList", &[Value::Number(1.0), Value::Number(2.0)]).unwrap();
        assert_eq!(dotted.to_string(), "(1 . 2)");
    }

    #[test]
    fn arity_checks_raise_conditions() {
        let mut interp = host();
        assert!(call(&mut interp, "checkArgsAtLeast", &[Value::Number(2.0), Value::Number(2.0)]).is_ok());
        let Err(Throw(condition)) = call(&mut interp, "checkArgsAtMost", &[Value::Number(4.0), Value::Number(3.0)]) else {
            panic!("expected an arity error");
        };
        assert!(condition.get("kind").strict_equals(&Value::str("argument-count")));
    }

    #[test]
    fn storage_access_is_bounds_checked() {
        let mut interp = host();
        let v = call(&mut interp, "newArray", &[Value::Number(2.0)]).unwrap();
        assert!(call(&mut interp, "storageSet", &[v.clone(), Value::Number(1.0), Value::Number(7.0)]).is_ok());
        assert_eq!(call(&mut interp, "storageRef", &[v.clone(), Value::Number(1.0)]).unwrap().to_string(), "7");
        assert!(call(&mut interp, "storageRef", &[v, Value::Number(2.0)]).is_err());
    }
}
