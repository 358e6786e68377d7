//! Compile-time data.
//!
//! Everything the reader hands to the compiler, and everything the literal
//! dumper serializes, is an [`Sexpr`]. Symbols, strings, conses and vectors
//! are heap objects compared by identity; numbers and characters are values.

use std::{cell::RefCell, fmt, rc::Rc};

use rustc_hash::FxHashMap;

pub const COMMON_LISP: &str = "COMMON-LISP";
pub const KEYWORD: &str = "KEYWORD";

pub struct SymbolData {
    name: Rc<str>,
    package: Option<Rc<str>>,
}

/// An interned or uninterned symbol. Two `Symbol`s are equal only when they
/// are the same object.
#[derive(Clone)]
pub struct Symbol(Rc<SymbolData>);

thread_local! {
    static OBARRAY: RefCell<FxHashMap<(Rc<str>, Rc<str>), Symbol>> =
        RefCell::new(FxHashMap::default());
    static NIL: Symbol = Symbol::intern("NIL");
    static T: Symbol = Symbol::intern("T");
}

impl Symbol {
    /// Intern `name` in the COMMON-LISP package.
    pub fn intern(name: &str) -> Symbol {
        Self::intern_in(name, COMMON_LISP)
    }

    pub fn intern_in(name: &str, package: &str) -> Symbol {
        OBARRAY.with(|obarray| {
            let mut obarray = obarray.borrow_mut();
            let key: (Rc<str>, Rc<str>) = (Rc::from(package), Rc::from(name));
            if let Some(sym) = obarray.get(&key) {
                return sym.clone();
            }
            let sym = Symbol(Rc::new(SymbolData {
                name: key.1.clone(),
                package: Some(key.0.clone()),
            }));
            obarray.insert(key, sym.clone());
            sym
        })
    }

    pub fn keyword(name: &str) -> Symbol {
        Self::intern_in(name, KEYWORD)
    }

    /// A fresh symbol that belongs to no package.
    pub fn uninterned(name: &str) -> Symbol {
        Symbol(Rc::new(SymbolData {
            name: Rc::from(name),
            package: None,
        }))
    }

    pub fn nil() -> Symbol {
        NIL.with(|s| s.clone())
    }

    pub fn t() -> Symbol {
        T.with(|s| s.clone())
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn package(&self) -> Option<&str> {
        self.0.package.as_deref()
    }

    pub fn is_keyword(&self) -> bool {
        self.package() == Some(KEYWORD)
    }

    /// True for the COMMON-LISP symbol called `name`.
    pub fn is(&self, name: &str) -> bool {
        self.package() == Some(COMMON_LISP) && self.name() == name
    }

    pub fn is_nil(&self) -> bool {
        NIL.with(|nil| nil == self)
    }

    pub fn as_ptr(&self) -> *const SymbolData {
        Rc::as_ptr(&self.0)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Symbol {}

impl std::hash::Hash for Symbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_ptr().hash(state)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.package() {
            None => write!(f, "#:{}", self.name()),
            Some(KEYWORD) => write!(f, ":{}", self.name()),
            Some(_) => write!(f, "{}", self.name()),
        }
    }
}

#[derive(Clone)]
pub enum Sexpr {
    Symbol(Symbol),
    Fixnum(i64),
    Flonum(f64),
    Char(char),
    String(Rc<str>),
    Pair(Rc<(Sexpr, Sexpr)>),
    Vector(Rc<[Sexpr]>),
}

/// Compares heap objects by identity and immediates by value (`eql`).
pub fn sexp_eq(x: &Sexpr, y: &Sexpr) -> bool {
    match (x, y) {
        (Sexpr::Symbol(x), Sexpr::Symbol(y)) => x == y,
        (Sexpr::Fixnum(x), Sexpr::Fixnum(y)) => x == y,
        (Sexpr::Flonum(x), Sexpr::Flonum(y)) => x == y,
        (Sexpr::Char(x), Sexpr::Char(y)) => x == y,
        (Sexpr::String(x), Sexpr::String(y)) => Rc::ptr_eq(x, y),
        (Sexpr::Pair(x), Sexpr::Pair(y)) => Rc::ptr_eq(x, y),
        (Sexpr::Vector(x), Sexpr::Vector(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Structural equality (`equal`, extended to vectors).
pub fn sexp_equal(x: &Sexpr, y: &Sexpr) -> bool {
    match (x, y) {
        (Sexpr::String(x), Sexpr::String(y)) => x == y,
        (Sexpr::Pair(x), Sexpr::Pair(y)) => sexp_equal(&x.0, &y.0) && sexp_equal(&x.1, &y.1),
        (Sexpr::Vector(x), Sexpr::Vector(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(x, y)| sexp_equal(x, y))
        }
        _ => sexp_eq(x, y),
    }
}

impl PartialEq for Sexpr {
    fn eq(&self, other: &Self) -> bool {
        sexp_equal(self, other)
    }
}

impl Sexpr {
    pub fn nil() -> Sexpr {
        Sexpr::Symbol(Symbol::nil())
    }

    pub fn t() -> Sexpr {
        Sexpr::Symbol(Symbol::t())
    }

    pub fn symbol(name: &str) -> Sexpr {
        Sexpr::Symbol(Symbol::intern(name))
    }

    pub fn keyword(name: &str) -> Sexpr {
        Sexpr::Symbol(Symbol::keyword(name))
    }

    pub fn string(s: &str) -> Sexpr {
        Sexpr::String(Rc::from(s))
    }

    pub fn boolean(b: bool) -> Sexpr {
        if b {
            Sexpr::t()
        } else {
            Sexpr::nil()
        }
    }

    pub fn cons(car: Sexpr, cdr: Sexpr) -> Sexpr {
        Sexpr::Pair(Rc::new((car, cdr)))
    }

    pub fn list(exprs: &[Sexpr]) -> Sexpr {
        Self::list_star(exprs, Sexpr::nil())
    }

    /// Builds `(e1 ... en . tail)`.
    pub fn list_star(exprs: &[Sexpr], tail: Sexpr) -> Sexpr {
        let mut res = tail;
        for expr in exprs.iter().rev() {
            res = Sexpr::cons(expr.clone(), res);
        }
        res
    }

    pub fn list_from_iter<I: DoubleEndedIterator<Item = Sexpr>>(iter: I) -> Sexpr {
        let mut res = Sexpr::nil();
        for expr in iter.rev() {
            res = Sexpr::cons(expr, res);
        }
        res
    }

    /// `(quote x)`
    pub fn quote(x: Sexpr) -> Sexpr {
        Sexpr::list(&[Sexpr::symbol("QUOTE"), x])
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Sexpr::Symbol(s) if s.is_nil())
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, Sexpr::Pair(_))
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, Sexpr::Symbol(_))
    }

    pub fn is_keyword(&self) -> bool {
        matches!(self, Sexpr::Symbol(s) if s.is_keyword())
    }

    /// True for the COMMON-LISP symbol called `name`.
    pub fn is_symbol_named(&self, name: &str) -> bool {
        matches!(self, Sexpr::Symbol(s) if s.is(name))
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Sexpr::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn car(&self) -> Option<&Sexpr> {
        match self {
            Sexpr::Pair(p) => Some(&p.0),
            _ => None,
        }
    }

    pub fn cdr(&self) -> Option<&Sexpr> {
        match self {
            Sexpr::Pair(p) => Some(&p.1),
            _ => None,
        }
    }

    /// The operator of a compound form whose head is `name`.
    pub fn is_form(&self, name: &str) -> bool {
        self.car().is_some_and(|head| head.is_symbol_named(name))
    }

    pub fn is_list(&self) -> bool {
        self.list_length().is_some()
    }

    pub fn list_length(&self) -> Option<usize> {
        let mut list = self;
        let mut len = 0;
        while let Sexpr::Pair(x) = list {
            len += 1;
            list = &x.1;
        }
        list.is_null().then_some(len)
    }

    /// The elements of a proper list, or `None` for a dotted list or atom
    /// other than nil.
    pub fn list_to_vec(&self) -> Option<Vec<Sexpr>> {
        let mut res = vec![];
        let mut list = self;
        while let Sexpr::Pair(x) = list {
            res.push(x.0.clone());
            list = &x.1;
        }
        list.is_null().then_some(res)
    }

    /// Splits a possibly dotted list into its elements and final cdr.
    pub fn list_with_tail(&self) -> (Vec<Sexpr>, Sexpr) {
        let mut res = vec![];
        let mut list = self;
        while let Sexpr::Pair(x) = list {
            res.push(x.0.clone());
            list = &x.1;
        }
        (res, list.clone())
    }

    /// Address of a heap object; `None` for immediates.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Sexpr::Symbol(s) => Some(s.as_ptr() as usize),
            Sexpr::String(s) => Some(Rc::as_ptr(s) as *const u8 as usize),
            Sexpr::Pair(p) => Some(Rc::as_ptr(p) as usize),
            Sexpr::Vector(v) => Some(Rc::as_ptr(v) as *const Sexpr as usize),
            Sexpr::Fixnum(_) | Sexpr::Flonum(_) | Sexpr::Char(_) => None,
        }
    }
}

use pretty::{BoxAllocator, DocAllocator, DocBuilder};
use termcolor::{Color, ColorSpec, WriteColor};

impl Sexpr {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        match self {
            Self::Symbol(sym) if sym.is_keyword() => allocator
                .text(sym.to_string())
                .annotate(ColorSpec::new().set_fg(Some(Color::Magenta)).clone()),
            Self::Symbol(sym) => allocator.text(sym.to_string()),

            Self::Pair(_) if self.is_form("QUOTE") && self.list_length() == Some(2) => {
                let quoted = self.cdr().and_then(Sexpr::car).cloned().unwrap_or_else(Sexpr::nil);
                allocator.text("'").append(quoted.pretty(allocator))
            }

            Self::Pair(_) => {
                let (elems, tail) = self.list_with_tail();
                let mut docs = elems
                    .iter()
                    .map(|x| x.pretty(allocator))
                    .collect::<Vec<_>>();

                if !tail.is_null() {
                    docs.push(allocator.text("."));
                    docs.push(tail.pretty(allocator));
                }

                allocator
                    .intersperse(docs, allocator.softline())
                    .nest(1)
                    .group()
                    .parens()
            }

            Self::Vector(vec) => allocator.text("#").append(
                allocator
                    .intersperse(vec.iter().map(|x| x.pretty(allocator)), allocator.softline())
                    .group()
                    .parens(),
            ),

            Self::Fixnum(x) => allocator.text(format!("{}", x)),
            Self::Flonum(x) => allocator.text(format!("{:?}", x)),
            Self::Char(x) => allocator.text(format!("#\\{}", x)),
            Self::String(x) => allocator
                .text(format!("{:?}", x))
                .annotate(ColorSpec::new().set_fg(Some(Color::Green)).clone()),
        }
    }

    pub fn pretty_print(&self, w: &mut dyn WriteColor) -> std::io::Result<()> {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        doc.render_colored(80, w)
    }
}

impl fmt::Display for Sexpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        let mut out = Vec::new();
        let mut writer = termcolor::NoColor::new(&mut out);
        doc.render_colored(80, &mut writer)
            .map_err(|_| fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(&out))
    }
}

impl fmt::Debug for Sexpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_preserves_identity() {
        assert_eq!(Symbol::intern("FOO"), Symbol::intern("FOO"));
        assert_ne!(Symbol::intern("FOO"), Symbol::keyword("FOO"));
        assert_ne!(Symbol::uninterned("FOO"), Symbol::uninterned("FOO"));
        assert!(Sexpr::nil().is_null());
        assert_eq!(Sexpr::nil().list_length(), Some(0));
    }

    #[test]
    fn eq_is_identity_equal_is_structure() {
        let a = Sexpr::list(&[Sexpr::Fixnum(1), Sexpr::string("x")]);
        let b = Sexpr::list(&[Sexpr::Fixnum(1), Sexpr::string("x")]);
        assert!(sexp_equal(&a, &b));
        assert!(!sexp_eq(&a, &b));
        assert!(sexp_eq(&a, &a.clone()));
        assert!(sexp_eq(&Sexpr::Fixnum(3), &Sexpr::Fixnum(3)));
    }

    #[test]
    fn dotted_lists() {
        let dotted = Sexpr::list_star(&[Sexpr::Fixnum(1), Sexpr::Fixnum(2)], Sexpr::Fixnum(3));
        assert!(dotted.list_to_vec().is_none());
        let (elems, tail) = dotted.list_with_tail();
        assert_eq!(elems.len(), 2);
        assert!(sexp_eq(&tail, &Sexpr::Fixnum(3)));
        assert_eq!(dotted.to_string(), "(1 2 . 3)");
    }

    #[test]
    fn printing() {
        let form = Sexpr::list(&[
            Sexpr::symbol("QUOTE"),
            Sexpr::list(&[Sexpr::keyword("A"), Sexpr::Char('b'), Sexpr::string("c")]),
        ]);
        assert_eq!(form.to_string(), "'(:A #\\b \"c\")");
        assert_eq!(Symbol::uninterned("G1").to_string(), "#:G1");
    }
}
