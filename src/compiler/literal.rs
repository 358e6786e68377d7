//! Serialization of compile-time data into target initializers.
//!
//! Each distinct heap object is constructed once per unit, in a toplevel
//! `var`, and every later occurrence refers to that variable. Numbers and
//! characters are emitted inline. Sub-objects are built inside their parent
//! unless they occur more than once in it; a list tail is only shared when
//! it is the dotted tail of another list.

use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    sexpr::{Sexpr, Symbol, KEYWORD},
    target::{Expr, Ident, Stmt},
    CompileResult, Compiler,
};

thread_local! {
    static UNQUOTE_MARKER: Symbol = Symbol::uninterned("MAGIC-UNQUOTE");
}

/// The reserved operator that makes the dumper compile a nested form instead
/// of serializing it: `(MARKER form)` dumps as the code of `form`.
pub fn unquote_marker() -> Symbol {
    UNQUOTE_MARKER.with(|marker| marker.clone())
}

#[derive(Clone, Default)]
pub struct LiteralTable {
    /// Keyed by object address; the datum is kept alive so the address
    /// cannot be reused while the entry exists.
    entries: FxHashMap<usize, (Sexpr, Ident)>,
    /// Sub-objects of the literal being dumped that occur more than once.
    shared: FxHashSet<usize>,
    prefix: String,
    counter: usize,
}

impl LiteralTable {
    pub fn new(prefix: &str) -> Self {
        Self {
            entries: FxHashMap::default(),
            shared: FxHashSet::default(),
            prefix: prefix.to_string(),
            counter: 0,
        }
    }

    /// Forgets every entry. The name counter keeps running so identifiers
    /// of consecutive units never collide.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, datum: &Sexpr) -> Option<Ident> {
        let key = datum.identity()?;
        self.entries.get(&key).map(|(_, ident)| ident.clone())
    }

    fn insert(&mut self, datum: &Sexpr, ident: Ident) {
        if let Some(key) = datum.identity() {
            self.entries.insert(key, (datum.clone(), ident));
        }
    }

    fn is_shared(&self, datum: &Sexpr) -> bool {
        datum.identity().is_some_and(|key| self.shared.contains(&key))
    }

    fn genlit(&mut self) -> Ident {
        self.counter += 1;
        Rc::from(format!("{}{}", self.prefix, self.counter))
    }
}

impl Compiler {
    /// The code that evaluates to `datum`. `recursive` is set while dumping
    /// the inside of another object; such sub-objects are constructed inline
    /// unless they already have a variable or occur again in the same literal.
    pub fn literal(&mut self, datum: &Sexpr, recursive: bool) -> CompileResult<Expr> {
        match datum {
            Sexpr::Fixnum(n) => return Ok(Expr::Int(*n)),
            Sexpr::Flonum(n) => return Ok(Expr::Float(*n)),
            Sexpr::Char(c) => return Ok(Expr::Str(Rc::from(c.to_string()))),
            _ => {}
        }

        if let Some(ident) = self.literals.get(datum) {
            return Ok(Expr::Var(ident));
        }

        if !recursive && matches!(datum, Sexpr::Pair(_) | Sexpr::Vector(_)) {
            let mut seen = FxHashMap::default();
            count_occurrences(datum, &mut seen);
            let shared = seen.into_iter().filter(|&(_, n)| n > 1).map(|(key, _)| key).collect();
            let outer = std::mem::replace(&mut self.literals.shared, shared);
            let result = self.dump_literal(datum, recursive);
            self.literals.shared = outer;
            return result;
        }

        self.dump_literal(datum, recursive)
    }

    fn dump_literal(&mut self, datum: &Sexpr, recursive: bool) -> CompileResult<Expr> {
        let dumped = match datum {
            Sexpr::Symbol(symbol) => dump_symbol(symbol),
            Sexpr::String(s) => Expr::internal("make_lisp_string", vec![Expr::Str(s.clone())]),
            Sexpr::Pair(_) if is_unquoted(datum) => {
                let form = datum.cdr().and_then(Sexpr::car).cloned().unwrap_or_else(Sexpr::nil);
                self.convert(&form, false)?
            }
            Sexpr::Pair(_) => self.dump_cons(datum)?,
            Sexpr::Vector(items) => {
                let items = items
                    .iter()
                    .map(|item| self.literal(item, true))
                    .collect::<CompileResult<Vec<_>>>()?;
                Expr::Array(items)
            }
            Sexpr::Fixnum(_) | Sexpr::Flonum(_) | Sexpr::Char(_) => unreachable!(),
        };

        if recursive && !datum.is_symbol() && !self.literals.is_shared(datum) {
            return Ok(dumped);
        }

        let ident = self.literals.genlit();
        log::trace!(target: "lispjs::literal", "{} = {}", ident, datum);
        self.literals.insert(datum, ident.clone());
        self.push_toplevel(Stmt::var(ident.clone(), dumped));
        if datum.is_keyword() {
            self.push_toplevel(Stmt::expr(Expr::assign(
                Expr::get(Expr::Var(ident.clone()), "value"),
                Expr::Var(ident.clone()),
            )));
        }
        Ok(Expr::Var(ident))
    }

    /// `QIList(e1, ..., en, tail)` for a proper or dotted list.
    fn dump_cons(&mut self, datum: &Sexpr) -> CompileResult<Expr> {
        let (elems, tail) = datum.list_with_tail();
        let mut args = Vec::with_capacity(elems.len() + 1);
        for elem in &elems {
            args.push(self.literal(elem, true)?);
        }
        args.push(self.literal(&tail, true)?);
        Ok(Expr::internal("QIList", args))
    }

    /// Drops every literal recorded so far; the next unit starts afresh.
    pub fn begin_unit(&mut self) {
        self.literals.clear();
    }
}

fn dump_symbol(symbol: &Symbol) -> Expr {
    let name = Expr::str(symbol.name());
    match symbol.package() {
        None => Expr::new_object(Expr::Internal("Symbol"), vec![name]),
        Some(KEYWORD) => Expr::internal("intern", vec![name, Expr::str(KEYWORD)]),
        Some(package) => Expr::internal("intern", vec![name, Expr::str(package)]),
    }
}

/// Counts the sub-objects of `datum` the way the dumper visits them: list
/// elements and dotted tails, vector items. Each object is entered once.
fn count_occurrences(datum: &Sexpr, seen: &mut FxHashMap<usize, usize>) {
    let Some(key) = datum.identity() else {
        return;
    };
    if datum.is_symbol() {
        return;
    }
    let count = seen.entry(key).or_insert(0);
    *count += 1;
    if *count > 1 {
        return;
    }
    match datum {
        Sexpr::Pair(_) if is_unquoted(datum) => {}
        Sexpr::Pair(_) => {
            let (elems, tail) = datum.list_with_tail();
            for elem in &elems {
                count_occurrences(elem, seen);
            }
            count_occurrences(&tail, seen);
        }
        Sexpr::Vector(items) => {
            for item in items.iter() {
                count_occurrences(item, seen);
            }
        }
        _ => {}
    }
}

fn is_unquoted(datum: &Sexpr) -> bool {
    datum
        .car()
        .and_then(Sexpr::as_symbol)
        .is_some_and(|head| *head == unquote_marker())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{target::Stmt, test_reader::read};

    fn var_inits(c: &Compiler) -> Vec<String> {
        c.toplevel_code
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Var(name, Some(_)) => Some(name.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn same_object_is_constructed_once() {
        let mut c = Compiler::default();
        let datum = Sexpr::list(&[Sexpr::Fixnum(1), Sexpr::string("a")]);
        let a = c.literal(&datum, false).unwrap();
        let b = c.literal(&datum, false).unwrap();
        assert_eq!(a.to_string(), b.to_string());
        let lists = c
            .toplevel_code
            .iter()
            .filter(|stmt| stmt.to_string().contains("QIList"))
            .count();
        assert_eq!(lists, 1);
    }

    #[test]
    fn equal_but_distinct_objects_are_not_shared() {
        let mut c = Compiler::default();
        let a = c.literal(&Sexpr::string("abc"), false).unwrap();
        let b = c.literal(&Sexpr::string("abc"), false).unwrap();
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn numbers_and_characters_are_inline() {
        let mut c = Compiler::default();
        assert!(matches!(c.literal(&Sexpr::Fixnum(42), false), Ok(Expr::Int(42))));
        assert!(matches!(c.literal(&Sexpr::Char('x'), false), Ok(Expr::Str(_))));
        assert!(c.toplevel_code.is_empty());
    }

    #[test]
    fn symbols_get_their_own_entry_inside_lists() {
        let mut c = Compiler::default();
        let datum = Sexpr::list(&[Sexpr::symbol("FOO"), Sexpr::keyword("BAR")]);
        c.literal(&datum, false).unwrap();
        // FOO, :BAR, NIL and the list itself
        assert_eq!(var_inits(&c).len(), 4);
        assert!(c
            .toplevel_code
            .iter()
            .any(|stmt| matches!(stmt, Stmt::Expr(Expr::Assign(..)))));
    }

    #[test]
    fn repeated_sub_objects_keep_their_identity() {
        let inner = read("(1 2)");
        let name = Sexpr::string("n");
        let datum = Sexpr::list(&[inner.clone(), name.clone(), inner, name]);
        let quoted = Sexpr::quote(datum);
        let nth = |n: usize| {
            let mut list = quoted.clone();
            for _ in 0..n {
                list = Sexpr::list(&[Sexpr::symbol("CDR"), list]);
            }
            Sexpr::list(&[Sexpr::symbol("CAR"), list])
        };
        let eq = |a: usize, b: usize| Sexpr::list(&[Sexpr::symbol("EQ"), nth(a), nth(b)]);
        let form = Sexpr::list(&[Sexpr::symbol("AND"), eq(0, 2), eq(1, 3)]);
        let mut c = Compiler::default();
        assert_eq!(c.eval(&form).unwrap(), Sexpr::t());
    }

    #[test]
    fn distinct_sub_objects_stay_inline() {
        let mut c = Compiler::default();
        c.literal(&read("((1 2) (1 2))"), false).unwrap();
        let lists = c
            .toplevel_code
            .iter()
            .filter(|stmt| matches!(stmt, Stmt::Var(_, Some(_))) && stmt.to_string().contains("QIList"))
            .count();
        assert_eq!(lists, 1);
    }

    #[test]
    fn unquote_marker_compiles_code() {
        let mut c = Compiler::default();
        let datum = Sexpr::list(&[
            Sexpr::symbol("A"),
            Sexpr::list(&[
                Sexpr::Symbol(unquote_marker()),
                Sexpr::list(&[Sexpr::symbol("CONS"), Sexpr::Fixnum(1), Sexpr::Fixnum(2)]),
            ]),
        ]);
        c.literal(&datum, false).unwrap();
        let dump = crate::compiler::target::dump(&c.toplevel_code);
        assert!(dump.contains("internals.Cons"));
        assert!(!dump.contains("MAGIC-UNQUOTE"));
    }
}
