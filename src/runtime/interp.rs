//! A tree-walking evaluator for target code.
//!
//! It implements the subset of the target runtime model the compiler emits:
//! function-scoped `var`, `arguments`, labelled `break`, fall-through
//! `switch`, `try`/`catch`/`finally` and strict equality.

use std::{cell::RefCell, rc::Rc};

use rustc_hash::FxHashMap;

use super::value::{Class, Closure, ConditionKind, Value};
use crate::compiler::target::{BinaryOp, Expr, Function, Ident, Stmt, UnaryOp};

pub const DEFAULT_MAX_CALL_DEPTH: usize = 1000;

/// A value in flight through `throw`.
#[derive(Clone, Debug)]
pub struct Throw(pub Value);

pub type EvalResult<T> = Result<T, Throw>;

struct ScopeData {
    vars: RefCell<FxHashMap<Ident, Value>>,
    parent: Option<Scope>,
}

#[derive(Clone)]
pub struct Scope(Rc<ScopeData>);

impl Scope {
    pub fn root() -> Self {
        Scope(Rc::new(ScopeData {
            vars: RefCell::default(),
            parent: None,
        }))
    }

    pub fn child(&self) -> Self {
        Scope(Rc::new(ScopeData {
            vars: RefCell::default(),
            parent: Some(self.clone()),
        }))
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(s) = scope {
            if let Some(value) = s.0.vars.borrow().get(name) {
                return Some(value.clone());
            }
            scope = s.0.parent.as_ref();
        }
        None
    }

    /// Assigns the innermost existing binding; returns false if there is none.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut scope = Some(self);
        while let Some(s) = scope {
            if let Some(slot) = s.0.vars.borrow_mut().get_mut(name) {
                *slot = value;
                return true;
            }
            scope = s.0.parent.as_ref();
        }
        false
    }

    pub fn declare(&self, name: Ident, value: Value) {
        self.0.vars.borrow_mut().insert(name, value);
    }

    fn declare_hoisted(&self, name: &Ident) {
        let mut vars = self.0.vars.borrow_mut();
        if !vars.contains_key(name) {
            vars.insert(name.clone(), Value::Undefined);
        }
    }
}

enum Completion {
    Normal,
    Return(Value),
    Break(Option<Ident>),
}

pub struct Interp {
    pub global: Scope,
    pub internals: FxHashMap<&'static str, Value>,
    pub(crate) obarray: FxHashMap<(Rc<str>, Rc<str>), Value>,
    pub(crate) gensym_counter: usize,
    depth: usize,
    max_depth: usize,
}

impl Default for Interp {
    fn default() -> Self {
        Self::new()
    }
}

impl Interp {
    pub fn new() -> Self {
        Interp {
            global: Scope::root(),
            internals: FxHashMap::default(),
            obarray: FxHashMap::default(),
            gensym_counter: 0,
            depth: 0,
            max_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    /// Nesting of Lisp calls past which a call signals "control stack exhausted".
    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_depth = depth;
    }

    /// Builds a condition object and returns it ready to be thrown.
    pub fn condition(&self, kind: ConditionKind, message: impl Into<String>, datum: Value) -> Throw {
        let message: String = message.into();
        log::trace!(target: "lispjs::host", "signal {}: {}", kind, message);
        Throw(Value::object(
            Class::Condition,
            [
                ("kind", Value::str(kind.as_str())),
                ("message", Value::str(&message)),
                ("datum", datum),
            ],
        ))
    }

    pub fn type_error(&self, message: impl Into<String>) -> Throw {
        self.condition(ConditionKind::TypeError, message, Value::Undefined)
    }

    /// Runs toplevel statements in the global scope and returns the value of
    /// the last expression statement.
    pub fn run(&mut self, stmts: &[Stmt]) -> EvalResult<Value> {
        let scope = self.global.clone();
        hoist(&scope, stmts);
        let mut last = Value::Undefined;
        for stmt in stmts {
            match stmt {
                Stmt::Expr(expr) => last = self.eval(expr, &scope)?,
                _ => match self.exec(stmt, &scope)? {
                    Completion::Normal => {}
                    Completion::Return(value) => return Ok(value),
                    Completion::Break(_) => break,
                },
            }
        }
        Ok(last)
    }

    pub fn call(&mut self, function: &Value, args: &[Value]) -> EvalResult<Value> {
        match function {
            Value::Function(closure) => self.call_closure(closure, args),
            Value::Native(native) => (native.func)(self, args),
            other => Err(self.type_error(format!("{} is not a function", other))),
        }
    }

    fn call_closure(&mut self, closure: &Rc<Closure>, args: &[Value]) -> EvalResult<Value> {
        if self.depth >= self.max_depth {
            return Err(self.condition(
                ConditionKind::SimpleError,
                "control stack exhausted",
                Value::Undefined,
            ));
        }

        let function = &closure.function;
        let scope = closure.scope.child();
        for (i, param) in function.params.iter().enumerate() {
            scope.declare(param.clone(), args.get(i).cloned().unwrap_or(Value::Undefined));
        }
        scope.declare(Rc::from("arguments"), Value::array(args.to_vec()));
        hoist(&scope, &function.body);

        self.depth += 1;
        let result = self.exec_block(&function.body, &scope);
        self.depth -= 1;

        match result? {
            Completion::Return(value) => Ok(value),
            _ => Ok(Value::Undefined),
        }
    }

    fn exec_block(&mut self, body: &[Stmt], scope: &Scope) -> EvalResult<Completion> {
        for stmt in body {
            match self.exec(stmt, scope)? {
                Completion::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Completion::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Scope) -> EvalResult<Completion> {
        match stmt {
            Stmt::Var(name, init) => {
                if let Some(init) = init {
                    let value = self.eval(init, scope)?;
                    scope.declare(name.clone(), value);
                }
                Ok(Completion::Normal)
            }
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Completion::Normal)
            }
            Stmt::Return(expr) => Ok(Completion::Return(self.eval(expr, scope)?)),
            Stmt::If(test, then, otherwise) => {
                if self.eval(test, scope)?.truthy() {
                    self.exec_block(then, scope)
                } else {
                    self.exec_block(otherwise, scope)
                }
            }
            Stmt::While(test, body) => {
                while self.eval(test, scope)?.truthy() {
                    match self.exec_block(body, scope)? {
                        Completion::Normal => {}
                        Completion::Break(None) => break,
                        other => return Ok(other),
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::Label(label, body) => match self.exec(body, scope)? {
                Completion::Break(Some(target)) if target == *label => Ok(Completion::Normal),
                other => Ok(other),
            },
            Stmt::Break(label) => Ok(Completion::Break(label.clone())),
            Stmt::Switch(value, cases) => {
                let value = self.eval(value, scope)?;
                let mut start = None;
                for (i, case) in cases.iter().enumerate() {
                    if let Some(test) = &case.test {
                        if self.eval(test, scope)?.strict_equals(&value) {
                            start = Some(i);
                            break;
                        }
                    }
                }
                let start = start.or_else(|| cases.iter().position(|case| case.test.is_none()));
                if let Some(start) = start {
                    for case in &cases[start..] {
                        match self.exec_block(&case.body, scope)? {
                            Completion::Normal => {}
                            Completion::Break(None) => break,
                            other => return Ok(other),
                        }
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::Throw(expr) => Err(Throw(self.eval(expr, scope)?)),
            Stmt::Try {
                body,
                catch,
                finally,
            } => {
                let mut result = self.exec_block(body, scope);
                if let Some(catch) = catch {
                    if let Err(Throw(value)) = result {
                        scope.declare(catch.var.clone(), value);
                        result = self.exec_block(&catch.body, scope);
                    }
                }
                if let Some(finally) = finally {
                    match self.exec_block(finally, scope)? {
                        Completion::Normal => {}
                        other => return Ok(other),
                    }
                }
                result
            }
            Stmt::Block(body) => self.exec_block(body, scope),
        }
    }

    pub fn eval(&mut self, expr: &Expr, scope: &Scope) -> EvalResult<Value> {
        match expr {
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Number(*i as f64)),
            Expr::Float(f) => Ok(Value::Number(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Var(name) => match scope.lookup(name) {
                Some(value) => Ok(value),
                None => Err(self.condition(
                    ConditionKind::ReferenceError,
                    format!("{} is not defined", name),
                    Value::Undefined,
                )),
            },
            Expr::Internal(name) => match self.internals.get(name) {
                Some(value) => Ok(value.clone()),
                None => Err(self.condition(
                    ConditionKind::ReferenceError,
                    format!("internals.{} is not defined", name),
                    Value::Undefined,
                )),
            },
            Expr::Array(items) => {
                let items = self.eval_args(items, scope)?;
                Ok(Value::array(items))
            }
            Expr::Object(props) => {
                let object = Value::object(Class::Plain, []);
                for (key, value) in props {
                    let value = self.eval(value, scope)?;
                    object.set(key, value);
                }
                Ok(object)
            }
            Expr::Get(object, key) => {
                let object = self.eval(object, scope)?;
                let key = self.eval(key, scope)?.to_key();
                match object {
                    Value::Undefined | Value::Null => Err(self.type_error(format!(
                        "cannot read property {} of {}",
                        key, object
                    ))),
                    _ => Ok(object.get(&key)),
                }
            }
            Expr::Assign(place, value) => match &**place {
                Expr::Var(name) => {
                    let value = self.eval(value, scope)?;
                    if !scope.assign(name, value.clone()) {
                        self.global.declare(name.clone(), value.clone());
                    }
                    Ok(value)
                }
                Expr::Get(object, key) => {
                    let object = self.eval(object, scope)?;
                    let key = self.eval(key, scope)?.to_key();
                    let value = self.eval(value, scope)?;
                    if !object.set(&key, value.clone()) {
                        return Err(self.type_error(format!(
                            "cannot set property {} of {}",
                            key, object
                        )));
                    }
                    Ok(value)
                }
                _ => Err(self.type_error("invalid assignment target")),
            },
            Expr::Call(function, args) => {
                let function = self.eval(function, scope)?;
                let args = self.eval_args(args, scope)?;
                self.call(&function, &args)
            }
            Expr::MethodCall(object, name, args) => {
                let object = self.eval(object, scope)?;
                let args = self.eval_args(args, scope)?;
                self.call_method(&object, name, &args)
            }
            Expr::New(class, args) => {
                let class = self.eval(class, scope)?;
                let args = self.eval_args(args, scope)?;
                match &class {
                    Value::Native(native) if native.class.is_some() => (native.func)(self, &args),
                    _ => Err(self.type_error(format!("{} is not a constructor", class))),
                }
            }
            Expr::Unary(op, x) => {
                let x = self.eval(x, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!x.truthy())),
                    UnaryOp::Neg => Ok(Value::Number(-self.number(&x)?)),
                    UnaryOp::Typeof => Ok(Value::str(x.type_of())),
                }
            }
            Expr::Binary(BinaryOp::And, x, y) => {
                let x = self.eval(x, scope)?;
                if x.truthy() {
                    self.eval(y, scope)
                } else {
                    Ok(x)
                }
            }
            Expr::Binary(BinaryOp::Or, x, y) => {
                let x = self.eval(x, scope)?;
                if x.truthy() {
                    Ok(x)
                } else {
                    self.eval(y, scope)
                }
            }
            Expr::Binary(op, x, y) => {
                let x = self.eval(x, scope)?;
                let y = self.eval(y, scope)?;
                self.binary(*op, x, y)
            }
            Expr::Cond(test, then, otherwise) => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(then, scope)
                } else {
                    self.eval(otherwise, scope)
                }
            }
            Expr::Progn(exprs) => {
                let mut last = Value::Undefined;
                for expr in exprs {
                    last = self.eval(expr, scope)?;
                }
                Ok(last)
            }
            Expr::Function(function) => Ok(self.make_closure(function, scope)),
            Expr::SelfCall(body) => {
                let inner = scope.child();
                hoist(&inner, body);
                match self.exec_block(body, &inner)? {
                    Completion::Return(value) => Ok(value),
                    _ => Ok(Value::Undefined),
                }
            }
        }
    }

    pub fn make_closure(&self, function: &Rc<Function>, scope: &Scope) -> Value {
        Value::Function(Rc::new(Closure {
            function: function.clone(),
            scope: scope.clone(),
            props: RefCell::default(),
        }))
    }

    fn eval_args(&mut self, args: &[Expr], scope: &Scope) -> EvalResult<Vec<Value>> {
        args.iter().map(|arg| self.eval(arg, scope)).collect()
    }

    fn call_method(&mut self, object: &Value, name: &str, args: &[Value]) -> EvalResult<Value> {
        match (object, name) {
            (Value::Function(_) | Value::Native(_), "apply") => {
                let spread = match args.get(1) {
                    Some(Value::Array(arr)) => arr.items.borrow().clone(),
                    Some(Value::Undefined | Value::Null) | None => vec![],
                    Some(other) => {
                        return Err(self.type_error(format!("{} is not an array", other)))
                    }
                };
                self.call(object, &spread)
            }
            (Value::Function(_) | Value::Native(_), "call") => {
                self.call(object, args.get(1..).unwrap_or(&[]))
            }
            (Value::Array(arr), "push") => {
                let mut items = arr.items.borrow_mut();
                items.extend(args.iter().cloned());
                Ok(Value::Number(items.len() as f64))
            }
            (Value::Array(arr), "concat") => {
                let mut items = arr.items.borrow().clone();
                for arg in args {
                    match arg {
                        Value::Array(other) => items.extend(other.items.borrow().iter().cloned()),
                        other => items.push(other.clone()),
                    }
                }
                Ok(Value::array(items))
            }
            (Value::Str(s), "charCodeAt") => {
                let index = args.first().and_then(Value::as_number).unwrap_or(0.0) as usize;
                Ok(s.chars()
                    .nth(index)
                    .map(|c| Value::Number(c as u32 as f64))
                    .unwrap_or(Value::Number(f64::NAN)))
            }
            _ => {
                let function = match object {
                    Value::Undefined | Value::Null => {
                        return Err(self.type_error(format!(
                            "cannot read property {} of {}",
                            name, object
                        )))
                    }
                    _ => object.get(name),
                };
                if !function.is_function() {
                    if name == "fvalue" && object.is_class(Class::Symbol) {
                        return Err(self.condition(
                            ConditionKind::UndefinedFunction,
                            format!("the function {} is undefined", object),
                            object.clone(),
                        ));
                    }
                    return Err(self.type_error(format!("{}.{} is not a function", object, name)));
                }
                self.call(&function, args)
            }
        }
    }

    pub fn number(&self, x: &Value) -> EvalResult<f64> {
        match x {
            Value::Number(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Null => Ok(0.0),
            Value::Str(s) => Ok(s.trim().parse::<f64>().unwrap_or(f64::NAN)),
            _ => Ok(f64::NAN),
        }
    }

    fn binary(&mut self, op: BinaryOp, x: Value, y: Value) -> EvalResult<Value> {
        let result = match op {
            BinaryOp::Add => match (&x, &y) {
                (Value::Str(_), _) | (_, Value::Str(_)) => {
                    Value::str(&format!("{}{}", x, y))
                }
                _ => Value::Number(self.number(&x)? + self.number(&y)?),
            },
            BinaryOp::Sub => Value::Number(self.number(&x)? - self.number(&y)?),
            BinaryOp::Mul => Value::Number(self.number(&x)? * self.number(&y)?),
            BinaryOp::Div => Value::Number(self.number(&x)? / self.number(&y)?),
            BinaryOp::Mod => Value::Number(self.number(&x)? % self.number(&y)?),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let ordering = match (&x, &y) {
                    (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                    _ => self.number(&x)?.partial_cmp(&self.number(&y)?),
                };
                let holds = match (op, ordering) {
                    (_, None) => false,
                    (BinaryOp::Lt, Some(o)) => o.is_lt(),
                    (BinaryOp::Gt, Some(o)) => o.is_gt(),
                    (BinaryOp::Le, Some(o)) => o.is_le(),
                    (_, Some(o)) => o.is_ge(),
                };
                Value::Bool(holds)
            }
            BinaryOp::StrictEq => Value::Bool(x.strict_equals(&y)),
            BinaryOp::StrictNe => Value::Bool(!x.strict_equals(&y)),
            BinaryOp::Eq => Value::Bool(x.loose_equals(&y)),
            BinaryOp::In => Value::Bool(y.has(&x.to_key())),
            BinaryOp::InstanceOf => match &y {
                Value::Native(native) if native.class.is_some() => {
                    Value::Bool(x.class() == native.class)
                }
                _ => return Err(self.type_error(format!("{} is not a constructor", y))),
            },
            BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators are evaluated lazily"),
        };
        Ok(result)
    }
}

/// Declares every `var` of a function body, not descending into nested
/// functions.
fn hoist(scope: &Scope, body: &[Stmt]) {
    for stmt in body {
        match stmt {
            Stmt::Var(name, _) => scope.declare_hoisted(name),
            Stmt::If(_, then, otherwise) => {
                hoist(scope, then);
                hoist(scope, otherwise);
            }
            Stmt::While(_, body) | Stmt::Block(body) => hoist(scope, body),
            Stmt::Label(_, body) => hoist(scope, std::slice::from_ref(&**body)),
            Stmt::Switch(_, cases) => {
                for case in cases {
                    hoist(scope, &case.body);
                }
            }
            Stmt::Try {
                body,
                catch,
                finally,
            } => {
                hoist(scope, body);
                if let Some(catch) = catch {
                    hoist(scope, &catch.body);
                }
                if let Some(finally) = finally {
                    hoist(scope, finally);
                }
            }
            Stmt::Expr(_) | Stmt::Return(_) | Stmt::Break(_) | Stmt::Throw(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::target::SwitchCase;

    fn num(value: &Value) -> f64 {
        value.as_number().unwrap_or(f64::NAN)
    }

    #[test]
    fn switch_falls_through() {
        let mut interp = Interp::new();
        let acc = || Expr::var("acc");
        let push = |n| Stmt::expr(Expr::assign(acc(), Expr::binary(BinaryOp::Add, acc(), Expr::Int(n))));
        let stmts = vec![
            Stmt::var("acc", Expr::Int(0)),
            Stmt::Switch(
                Expr::Int(2),
                vec![
                    SwitchCase { test: Some(Expr::Int(1)), body: vec![push(1)] },
                    SwitchCase { test: Some(Expr::Int(2)), body: vec![push(10)] },
                    SwitchCase { test: Some(Expr::Int(3)), body: vec![push(100), Stmt::Break(None)] },
                    SwitchCase { test: None, body: vec![push(1000)] },
                ],
            ),
            Stmt::expr(acc()),
        ];
        assert_eq!(num(&interp.run(&stmts).unwrap()), 110.0);
    }

    #[test]
    fn finally_runs_on_throw() {
        let mut interp = Interp::new();
        let stmts = vec![
            Stmt::var("log", Expr::Array(vec![])),
            Stmt::try_catch(
                vec![Stmt::try_finally(
                    vec![Stmt::Throw(Expr::Int(1))],
                    vec![Stmt::expr(Expr::method(Expr::var("log"), "push", vec![Expr::str("finally")]))],
                )],
                "e".into(),
                vec![Stmt::expr(Expr::method(Expr::var("log"), "push", vec![Expr::var("e")]))],
            ),
            Stmt::expr(Expr::get(Expr::var("log"), "length")),
        ];
        assert_eq!(num(&interp.run(&stmts).unwrap()), 2.0);
    }

    #[test]
    fn closures_capture_function_scope() {
        let mut interp = Interp::new();
        let make_counter = Expr::function(
            None,
            vec![],
            vec![
                Stmt::var("n", Expr::Int(0)),
                Stmt::Return(Expr::function(
                    None,
                    vec![],
                    vec![Stmt::Return(Expr::assign(
                        Expr::var("n"),
                        Expr::binary(BinaryOp::Add, Expr::var("n"), Expr::Int(1)),
                    ))],
                )),
            ],
        );
        let stmts = vec![
            Stmt::var("c", Expr::call(make_counter, vec![])),
            Stmt::expr(Expr::call(Expr::var("c"), vec![])),
            Stmt::expr(Expr::call(Expr::var("c"), vec![])),
        ];
        assert_eq!(num(&interp.run(&stmts).unwrap()), 2.0);
    }

    #[test]
    fn labelled_break_leaves_loop() {
        let mut interp = Interp::new();
        let i = || Expr::var("i");
        let stmts = vec![
            Stmt::var("i", Expr::Int(0)),
            Stmt::Label(
                "outer".into(),
                Box::new(Stmt::While(
                    Expr::Bool(true),
                    vec![Stmt::Switch(
                        i(),
                        vec![
                            SwitchCase {
                                test: Some(Expr::Int(3)),
                                body: vec![Stmt::Break(Some("outer".into()))],
                            },
                            SwitchCase {
                                test: None,
                                body: vec![Stmt::expr(Expr::assign(
                                    i(),
                                    Expr::binary(BinaryOp::Add, i(), Expr::Int(1)),
                                ))],
                            },
                        ],
                    )],
                )),
            ),
            Stmt::expr(i()),
        ];
        assert_eq!(num(&interp.run(&stmts).unwrap()), 3.0);
    }
}
