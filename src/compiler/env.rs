//! Lexical environments.
//!
//! Each namespace is a persistent chain of bindings; extending returns a new
//! handle that shares the parent's chain, so a snapshot captured while
//! compiling an inner closure never sees later extensions. The global frame
//! is the only mutable part and is shared by every environment of one
//! compiler.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use bitflags::bitflags;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

use super::{
    sexpr::{Sexpr, Symbol},
    target::Ident,
    CompileResult, Compiler,
};
use crate::runtime::Value;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Declarations: u8 {
        const SPECIAL = 1 << 0;
        const CONSTANT = 1 << 1;
        const NOTINLINE = 1 << 2;
        /// Set on a block binding once some `return-from` targets it.
        const USED = 1 << 3;
        /// Set on a block binding when a `return-from` passes multiple values.
        const MULTIPLE_VALUE = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    Variable = 0,
    Function,
    Block,
    GoTag,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Variable,
    Macro,
    Block,
    GoTag,
    Constant,
    Special,
}

pub type NativeExpander = fn(&mut Compiler, &Sexpr, &[Sexpr]) -> CompileResult<Sexpr>;

#[derive(Clone)]
pub enum Macro {
    /// An expander written in Rust.
    Native(NativeExpander),
    /// Source of an expander function, compiled on first use.
    Source(Sexpr),
    /// The expander after compilation, still remembering its source so the
    /// global environment can be dumped.
    Compiled { source: Sexpr, function: Value },
}

#[derive(Clone)]
pub enum BindingValue {
    None,
    Ident(Ident),
    Macro(Macro),
    SymbolMacro(Sexpr),
    /// `scope` holds the per-activation identity of the tagbody.
    Tag { scope: Ident, label: u32 },
}

pub struct Binding {
    pub name: Symbol,
    pub namespace: Namespace,
    kind: Cell<BindingKind>,
    value: RefCell<BindingValue>,
    declarations: Cell<Declarations>,
}

pub type BindingRef = Rc<Binding>;

impl Binding {
    pub fn new(
        name: Symbol,
        namespace: Namespace,
        kind: BindingKind,
        value: BindingValue,
    ) -> BindingRef {
        Rc::new(Binding {
            name,
            namespace,
            kind: Cell::new(kind),
            value: RefCell::new(value),
            declarations: Cell::new(Declarations::empty()),
        })
    }

    pub fn variable(name: Symbol, ident: Ident) -> BindingRef {
        Self::new(
            name,
            Namespace::Variable,
            BindingKind::Variable,
            BindingValue::Ident(ident),
        )
    }

    pub fn function(name: Symbol, ident: Ident) -> BindingRef {
        Self::new(
            name,
            Namespace::Function,
            BindingKind::Variable,
            BindingValue::Ident(ident),
        )
    }

    pub fn special(name: Symbol) -> BindingRef {
        let binding = Self::new(
            name,
            Namespace::Variable,
            BindingKind::Special,
            BindingValue::None,
        );
        binding.declare(Declarations::SPECIAL);
        binding
    }

    pub fn kind(&self) -> BindingKind {
        self.kind.get()
    }

    pub fn set_kind(&self, kind: BindingKind) {
        self.kind.set(kind);
    }

    pub fn value(&self) -> BindingValue {
        self.value.borrow().clone()
    }

    pub fn set_value(&self, value: BindingValue) {
        *self.value.borrow_mut() = value;
    }

    pub fn ident(&self) -> Option<Ident> {
        match &*self.value.borrow() {
            BindingValue::Ident(ident) => Some(ident.clone()),
            _ => None,
        }
    }

    pub fn declarations(&self) -> Declarations {
        self.declarations.get()
    }

    pub fn declare(&self, decls: Declarations) {
        self.declarations.set(self.declarations.get() | decls);
    }

    pub fn undeclare(&self, decls: Declarations) {
        self.declarations.set(self.declarations.get() - decls);
    }

    pub fn has(&self, decls: Declarations) -> bool {
        self.declarations.get().contains(decls)
    }
}

struct Frame {
    binding: BindingRef,
    next: Option<Rc<Frame>>,
}

type GlobalTable = IndexMap<Symbol, BindingRef, FxBuildHasher>;

#[derive(Default)]
pub struct GlobalFrame {
    tables: [GlobalTable; 4],
}

#[derive(Clone)]
pub struct Environment {
    chains: [Option<Rc<Frame>>; 4],
    global: Rc<RefCell<GlobalFrame>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self {
            chains: Default::default(),
            global: Rc::new(RefCell::new(GlobalFrame::default())),
        }
    }

    /// Innermost binding of `name`, falling back to the global frame.
    pub fn lookup(&self, name: &Symbol, ns: Namespace) -> Option<BindingRef> {
        self.lookup_local(name, ns)
            .or_else(|| self.lookup_global(name, ns))
    }

    pub fn lookup_local(&self, name: &Symbol, ns: Namespace) -> Option<BindingRef> {
        let mut frame = self.chains[ns as usize].as_ref();
        while let Some(f) = frame {
            if &f.binding.name == name {
                return Some(f.binding.clone());
            }
            frame = f.next.as_ref();
        }
        None
    }

    pub fn lookup_global(&self, name: &Symbol, ns: Namespace) -> Option<BindingRef> {
        self.global.borrow().tables[ns as usize].get(name).cloned()
    }

    /// A new environment where `bindings` shadow everything in `self`. Later
    /// entries of `bindings` shadow earlier ones.
    pub fn extend(&self, bindings: impl IntoIterator<Item = BindingRef>, ns: Namespace) -> Self {
        let mut env = self.clone();
        for binding in bindings {
            debug_assert_eq!(binding.namespace, ns);
            let next = env.chains[ns as usize].take();
            env.chains[ns as usize] = Some(Rc::new(Frame { binding, next }));
        }
        env
    }

    /// The global binding of `name`, created as `kind` if missing.
    pub fn declare_global(&self, ns: Namespace, kind: BindingKind, name: &Symbol) -> BindingRef {
        let mut global = self.global.borrow_mut();
        global.tables[ns as usize]
            .entry(name.clone())
            .or_insert_with(|| Binding::new(name.clone(), ns, kind, BindingValue::None))
            .clone()
    }

    /// Installs `binding` in the global frame, replacing any previous one.
    pub fn define_global(&self, binding: BindingRef) {
        let ns = binding.namespace as usize;
        self.global.borrow_mut().tables[ns].insert(binding.name.clone(), binding);
    }

    pub fn remove_global(&self, name: &Symbol, ns: Namespace) -> Option<BindingRef> {
        self.global.borrow_mut().tables[ns as usize].shift_remove(name)
    }

    /// The same global frame with every lexical contour dropped.
    pub fn global_only(&self) -> Self {
        Self {
            chains: Default::default(),
            global: self.global.clone(),
        }
    }

    /// Global bindings of `ns` in definition order.
    pub fn globals(&self, ns: Namespace) -> Vec<BindingRef> {
        self.global.borrow().tables[ns as usize]
            .values()
            .cloned()
            .collect()
    }

    pub fn is_special(&self, name: &Symbol) -> bool {
        self.lookup(name, Namespace::Variable)
            .is_some_and(|b| b.has(Declarations::SPECIAL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Symbol {
        Symbol::intern(name)
    }

    #[test]
    fn innermost_binding_wins() {
        let env = Environment::new();
        let outer = env.extend([Binding::variable(sym("X"), "x_1".into())], Namespace::Variable);
        let inner = outer.extend([Binding::variable(sym("X"), "x_2".into())], Namespace::Variable);

        let ident = |env: &Environment| env.lookup(&sym("X"), Namespace::Variable).and_then(|b| b.ident());
        assert_eq!(ident(&inner).as_deref(), Some("x_2"));
        assert_eq!(ident(&outer).as_deref(), Some("x_1"));
        assert!(ident(&env).is_none());
    }

    #[test]
    fn namespaces_are_independent() {
        let env = Environment::new()
            .extend([Binding::function(sym("F"), "f_1".into())], Namespace::Function);
        assert!(env.lookup(&sym("F"), Namespace::Variable).is_none());
        assert!(env.lookup(&sym("F"), Namespace::Function).is_some());
    }

    #[test]
    fn global_frame_is_shared() {
        let env = Environment::new();
        let inner = env.extend([Binding::variable(sym("Y"), "y_1".into())], Namespace::Variable);

        let a = inner.declare_global(Namespace::Variable, BindingKind::Special, &sym("*G*"));
        a.declare(Declarations::SPECIAL);
        let b = env.declare_global(Namespace::Variable, BindingKind::Variable, &sym("*G*"));

        assert!(Rc::ptr_eq(&a, &b));
        assert!(env.is_special(&sym("*G*")));
        assert!(inner.global_only().lookup(&sym("Y"), Namespace::Variable).is_none());
        assert_eq!(env.globals(Namespace::Variable).len(), 1);
    }
}
