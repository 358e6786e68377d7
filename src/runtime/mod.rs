//! The compile-time host.
//!
//! User macro expanders and `eval-when (:compile-toplevel)` forms are
//! compiled like everything else and then executed here. The host also lets
//! tests run generated code and inspect the result.

pub mod internals;
pub mod interp;
pub mod value;

use rustc_hash::FxHashMap;

pub use self::{
    interp::{Interp, Throw},
    value::{Class, ConditionKind, HostError, Value},
};
use crate::compiler::{
    sexpr::{Sexpr, Symbol, COMMON_LISP},
    target::Stmt,
};

pub struct Host {
    interp: Interp,
    /// Uninterned compile-time symbols and their host counterparts, keyed by
    /// the compile-time symbol's address.
    to_host: FxHashMap<usize, (Symbol, Value)>,
    /// The reverse direction, keyed by the host object's address.
    from_host: FxHashMap<usize, (Symbol, Value)>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        let mut interp = Interp::new();
        internals::install(&mut interp);
        Host {
            interp,
            to_host: FxHashMap::default(),
            from_host: FxHashMap::default(),
        }
    }

    pub fn interp(&mut self) -> &mut Interp {
        &mut self.interp
    }

    pub fn run(&mut self, stmts: &[Stmt]) -> Result<Value, HostError> {
        log::trace!(target: "lispjs::host", "running {} statements", stmts.len());
        self.interp.run(stmts).map_err(|throw| self.uncaught(throw))
    }

    /// Calls a Lisp function with the single-value convention.
    pub fn call_lisp(&mut self, function: &Value, args: &[Value]) -> Result<Value, HostError> {
        let pv = self
            .interp
            .internals
            .get("pv")
            .cloned()
            .unwrap_or(Value::Undefined);
        let mut call_args = Vec::with_capacity(args.len() + 2);
        call_args.push(pv);
        call_args.push(Value::Number(args.len() as f64));
        call_args.extend(args.iter().cloned());
        self.interp
            .call(function, &call_args)
            .map_err(|throw| self.uncaught(throw))
    }

    pub fn symbol_value(&mut self, symbol: &Symbol) -> Option<Value> {
        match self.symbol(symbol).get("value") {
            Value::Undefined => None,
            value => Some(value),
        }
    }

    pub fn symbol(&mut self, symbol: &Symbol) -> Value {
        match symbol.package() {
            Some(package) => self.interp.intern(symbol.name(), package),
            None => {
                let key = symbol.as_ptr() as usize;
                if let Some((_, value)) = self.to_host.get(&key) {
                    return value.clone();
                }
                let value = self.interp.make_symbol(symbol.name(), None);
                self.remember(symbol.clone(), value.clone());
                value
            }
        }
    }

    fn remember(&mut self, symbol: Symbol, value: Value) {
        let host_key = value.identity().unwrap_or_default();
        self.to_host
            .insert(symbol.as_ptr() as usize, (symbol.clone(), value.clone()));
        self.from_host.insert(host_key, (symbol, value));
    }

    pub fn to_value(&mut self, datum: &Sexpr) -> Value {
        match datum {
            Sexpr::Symbol(symbol) => self.symbol(symbol),
            Sexpr::Fixnum(n) => Value::Number(*n as f64),
            Sexpr::Flonum(n) => Value::Number(*n),
            Sexpr::Char(c) => Value::str(&c.to_string()),
            Sexpr::String(s) => Value::Str(s.clone()),
            Sexpr::Pair(_) => {
                let (elems, tail) = datum.list_with_tail();
                let tail = self.to_value(&tail);
                let elems = elems.iter().map(|x| self.to_value(x)).collect::<Vec<_>>();
                self.interp.vec_to_list(elems, tail)
            }
            Sexpr::Vector(items) => {
                let items = items.iter().map(|x| self.to_value(x)).collect();
                Value::array(items)
            }
        }
    }

    pub fn from_value(&mut self, value: &Value) -> Result<Sexpr, HostError> {
        match value {
            Value::Undefined | Value::Null | Value::Bool(false) => Ok(Sexpr::nil()),
            Value::Bool(true) => Ok(Sexpr::t()),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 9007199254740992.0 => {
                Ok(Sexpr::Fixnum(*n as i64))
            }
            Value::Number(n) => Ok(Sexpr::Flonum(*n)),
            Value::Str(s) => Ok(Sexpr::String(s.clone())),
            Value::Object(obj) => match obj.class {
                Class::Symbol => Ok(Sexpr::Symbol(self.symbol_from_host(value))),
                Class::Cons => {
                    let mut elems = vec![];
                    let mut list = value.clone();
                    while list.is_class(Class::Cons) {
                        elems.push(self.from_value(&list.get("car"))?);
                        list = list.get("cdr");
                    }
                    let tail = self.from_value(&list)?;
                    Ok(Sexpr::list_star(&elems, tail))
                }
                _ => Err(HostError::Unconvertible(value.to_string())),
            },
            Value::Array(arr) => {
                let items = arr.items.borrow().clone();
                let items = items
                    .iter()
                    .map(|x| self.from_value(x))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Sexpr::Vector(items.into()))
            }
            Value::Function(_) | Value::Native(_) => {
                Err(HostError::Unconvertible(value.to_string()))
            }
        }
    }

    fn symbol_from_host(&mut self, value: &Value) -> Symbol {
        let name = value.get("name").to_key();
        match value.get("package") {
            Value::Str(package) => Symbol::intern_in(&name, &package),
            _ => {
                let key = value.identity().unwrap_or_default();
                if let Some((symbol, _)) = self.from_host.get(&key) {
                    return symbol.clone();
                }
                let symbol = Symbol::uninterned(&name);
                self.remember(symbol.clone(), value.clone());
                symbol
            }
        }
    }

    fn uncaught(&mut self, Throw(value): Throw) -> HostError {
        if value.is_class(Class::Condition) {
            let kind = ConditionKind::from_name(&value.get("kind").to_key())
                .unwrap_or(ConditionKind::SimpleError);
            return HostError::Condition {
                kind,
                message: value.get("message").to_string(),
            };
        }
        HostError::Uncaught(value.to_string())
    }

    pub fn nil(&mut self) -> Value {
        self.interp.intern("NIL", COMMON_LISP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_survive_a_round_trip() {
        let mut host = Host::new();
        let gensym = Symbol::uninterned("G");
        let datum = Sexpr::list_star(
            &[
                Sexpr::symbol("FOO"),
                Sexpr::keyword("BAR"),
                Sexpr::Symbol(gensym.clone()),
                Sexpr::string("baz"),
                Sexpr::Vector(vec![Sexpr::Fixnum(1), Sexpr::Flonum(2.5)].into()),
            ],
            Sexpr::Fixnum(3),
        );
        let value = host.to_value(&datum);
        let back = host.from_value(&value).unwrap();
        assert_eq!(back, datum);

        let elems = back.list_with_tail().0;
        assert_eq!(elems[2].as_symbol(), Some(&gensym));
    }

    #[test]
    fn host_gensyms_map_to_one_symbol() {
        let mut host = Host::new();
        let g = host.interp().make_symbol("G1", None);
        let a = host.from_value(&g).unwrap();
        let b = host.from_value(&g).unwrap();
        assert!(crate::compiler::sexpr::sexp_eq(&a, &b));
        assert!(host.to_value(&a).strict_equals(&g));
    }
}
