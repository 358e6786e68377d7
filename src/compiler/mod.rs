//! The expression-to-code translator.
//!
//! A [`Compiler`] owns everything that lives for one compilation session: the
//! global environment, the literal tables, name counters, the Fn-info
//! registry and the compile-time [`Host`] that runs user macro expanders.

use std::rc::Rc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::runtime::{Host, Value};

macro_rules! define_compilation {
    ($table: ident, $name: literal, ($c: ident, $form: ident, $args: ident, $mv: ident) $b: block) => {{
        #[allow(unused_variables)]
        fn compilation(
            $c: &mut Compiler,
            $form: &Sexpr,
            $args: &[Sexpr],
            $mv: bool,
        ) -> CompileResult<Expr> {
            $b
        }

        $table.insert($name, compilation as SpecialForm);
    }};
}

macro_rules! define_builtin {
    ($table: ident, $name: literal, $min: expr, $max: expr, ($c: ident, $args: ident, $mv: ident) $b: block) => {{
        #[allow(unused_variables, unused_mut)]
        fn builtin($c: &mut Compiler, mut $args: Vec<Expr>, $mv: bool) -> CompileResult<Expr> {
            $b
        }

        $table.insert(
            $name,
            Builtin {
                min: $min,
                max: $max,
                compile: builtin,
            },
        );
    }};
}

macro_rules! define_macro {
    ($table: ident, $name: literal, ($c: ident, $form: ident, $args: ident) $b: block) => {{
        #[allow(unused_variables)]
        fn expander($c: &mut Compiler, $form: &Sexpr, $args: &[Sexpr]) -> CompileResult<Sexpr> {
            $b
        }

        $table.push(($name, expander as NativeExpander));
    }};
}

pub mod builtins;
pub mod convert;
pub mod dynamic;
pub mod env;
pub mod error;
pub mod lambda_list;
pub mod literal;
pub mod macros;
pub mod nlx;
pub mod options;
pub mod sexpr;
pub mod special;
pub mod target;
#[cfg(test)]
pub mod test_reader;
pub mod toplevel;
pub mod values;

pub use self::{
    error::{CompileError, CompileResult},
    options::CompilerOptions,
};

use self::{
    env::{BindingRef, BindingValue, Environment, Macro, NativeExpander},
    literal::LiteralTable,
    sexpr::{Sexpr, Symbol},
    target::{Expr, Ident, Stmt},
};

/// Generator for a special form. Receives the whole form, its raw arguments
/// and whether the context wants multiple values.
pub type SpecialForm = fn(&mut Compiler, &Sexpr, &[Sexpr], bool) -> CompileResult<Expr>;

/// Inline code generator for an ordinary-looking call. Arguments arrive
/// already compiled.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub min: usize,
    pub max: Option<usize>,
    pub compile: fn(&mut Compiler, Vec<Expr>, bool) -> CompileResult<Expr>,
}

impl Builtin {
    pub fn accepts(&self, nargs: usize) -> bool {
        nargs >= self.min && self.max.map_or(true, |max| nargs <= max)
    }
}

pub static SPECIAL_FORMS: Lazy<FxHashMap<&'static str, SpecialForm>> = Lazy::new(|| {
    let mut table = FxHashMap::default();
    special::define_special_forms(&mut table);
    nlx::define_special_forms(&mut table);
    dynamic::define_special_forms(&mut table);
    values::define_special_forms(&mut table);
    table
});

pub static BUILTINS: Lazy<FxHashMap<&'static str, Builtin>> = Lazy::new(|| {
    let mut table = FxHashMap::default();
    builtins::define_builtins(&mut table);
    values::define_builtins(&mut table);
    table
});

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FnInfo {
    pub defined: bool,
    pub called: bool,
}

pub struct Compiler {
    pub options: CompilerOptions,
    pub(crate) env: Environment,
    pub(crate) literals: LiteralTable,
    host_literals: LiteralTable,
    pub(crate) toplevel_code: Vec<Stmt>,
    fn_info: IndexMap<Symbol, FnInfo, FxBuildHasher>,
    variable_counter: usize,
    gensym_counter: usize,
    pub(crate) go_tag_counter: u32,
    /// Depth of nested `convert` calls; 1 while compiling a toplevel form.
    pub(crate) convert_level: usize,
    pub(crate) host: Host,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilerOptions::new())
    }
}

impl Compiler {
    pub fn new(options: CompilerOptions) -> Self {
        let literals = LiteralTable::new(&options.literal_prefix);
        let host_literals = LiteralTable::new(&format!("{}host", options.literal_prefix));
        let mut compiler = Compiler {
            options,
            env: Environment::new(),
            literals,
            host_literals,
            toplevel_code: vec![],
            fn_info: IndexMap::default(),
            variable_counter: 0,
            gensym_counter: 0,
            go_tag_counter: 0,
            convert_level: 0,
            host: Host::new(),
        };
        compiler.host.interp().set_max_call_depth(compiler.options.max_call_depth);
        macros::install(&compiler.env);
        compiler
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn host(&mut self) -> &mut Host {
        &mut self.host
    }

    /// A fresh target identifier derived from `hint`.
    pub fn gvarname(&mut self, hint: &str) -> Ident {
        self.variable_counter += 1;
        let mut name = String::with_capacity(hint.len() + 4);
        for c in hint.chars() {
            if c.is_ascii_alphanumeric() {
                name.push(c.to_ascii_lowercase());
            } else if !name.ends_with('_') {
                name.push('_');
            }
        }
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            name.insert(0, 'v');
        }
        if !name.ends_with('_') {
            name.push('_');
        }
        Rc::from(format!("{}{}", name, self.variable_counter))
    }

    /// A fresh uninterned symbol for macro expansions.
    pub fn gensym(&mut self, prefix: &str) -> Symbol {
        self.gensym_counter += 1;
        Symbol::uninterned(&format!("{}{}", prefix, self.gensym_counter))
    }

    /// Runs `f` with `env` as the current environment, restoring the previous
    /// one afterwards, also when `f` fails.
    pub fn with_env<T>(
        &mut self,
        env: Environment,
        f: impl FnOnce(&mut Self) -> CompileResult<T>,
    ) -> CompileResult<T> {
        let saved = std::mem::replace(&mut self.env, env);
        let result = f(self);
        self.env = saved;
        result
    }

    pub fn push_toplevel(&mut self, stmt: Stmt) {
        self.toplevel_code.push(stmt);
    }

    /// The compiled `nil` literal.
    pub fn nil(&mut self) -> CompileResult<Expr> {
        self.literal(&Sexpr::nil(), false)
    }

    pub fn t(&mut self) -> CompileResult<Expr> {
        self.literal(&Sexpr::t(), false)
    }

    /// `test ? t : nil`
    pub fn boolean(&mut self, test: Expr) -> CompileResult<Expr> {
        let t = self.t()?;
        let nil = self.nil()?;
        Ok(Expr::cond(test, t, nil))
    }

    /// The function receiving multiple values in the current context.
    pub fn values_arg(&self, wants_values: bool) -> Expr {
        if wants_values {
            Expr::var("values")
        } else {
            Expr::Internal("pv")
        }
    }

    pub fn note_defined(&mut self, name: &Symbol) {
        self.fn_info.entry(name.clone()).or_default().defined = true;
    }

    pub fn note_called(&mut self, name: &Symbol) {
        self.fn_info.entry(name.clone()).or_default().called = true;
    }

    pub fn fn_info(&self, name: &Symbol) -> Option<FnInfo> {
        self.fn_info.get(name).copied()
    }

    pub(crate) fn take_fn_info(&mut self) -> IndexMap<Symbol, FnInfo, FxBuildHasher> {
        std::mem::take(&mut self.fn_info)
    }

    /// Compiles `form` against the global environment and runs it in the
    /// compile-time host.
    pub fn eval_value(&mut self, form: &Sexpr) -> CompileResult<Value> {
        log::debug!(target: "lispjs::host", "eval {}", form);
        let snapshot = self.host_literals.clone();
        let unit_literals = std::mem::replace(&mut self.literals, std::mem::take(&mut self.host_literals));
        let unit_toplevel = std::mem::take(&mut self.toplevel_code);
        let saved_level = std::mem::replace(&mut self.convert_level, 0);

        let env = self.env.global_only();
        let result = self.with_env(env, |c| c.compile_toplevel(form, false));

        self.host_literals = std::mem::replace(&mut self.literals, unit_literals);
        self.toplevel_code = unit_toplevel;
        self.convert_level = saved_level;

        let stmts = match result {
            Ok(stmts) => stmts,
            Err(err) => {
                self.host_literals = snapshot;
                return Err(err);
            }
        };
        Ok(self.host.run(&stmts)?)
    }

    pub fn eval(&mut self, form: &Sexpr) -> CompileResult<Sexpr> {
        let value = self.eval_value(form)?;
        Ok(self.host.from_value(&value)?)
    }

    /// The expander of a macro binding, compiling a source expander on first
    /// use.
    pub(crate) fn expander(&mut self, binding: &BindingRef) -> CompileResult<Option<Expander>> {
        let BindingValue::Macro(mac) = binding.value() else {
            return Ok(None);
        };
        match mac {
            Macro::Native(f) => Ok(Some(Expander::Native(f))),
            Macro::Compiled { function, .. } => Ok(Some(Expander::Host(function))),
            Macro::Source(source) => {
                log::debug!(target: "lispjs::convert", "compiling expander of {}", binding.name);
                let function = self.eval_value(&source)?;
                binding.set_value(BindingValue::Macro(Macro::Compiled {
                    source,
                    function: function.clone(),
                }));
                Ok(Some(Expander::Host(function)))
            }
        }
    }
}

pub(crate) enum Expander {
    Native(NativeExpander),
    Host(Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ConditionKind, HostError};

    #[test]
    fn variable_names_are_unique_and_sanitized() {
        let mut c = Compiler::default();
        let a = c.gvarname("*FOO-BAR*");
        let b = c.gvarname("*FOO-BAR*");
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert!(c.gvarname("1+").starts_with('v'));
    }

    #[test]
    fn tables_are_populated() {
        assert!(SPECIAL_FORMS.contains_key("TAGBODY"));
        assert!(SPECIAL_FORMS.contains_key("MULTIPLE-VALUE-CALL"));
        assert!(BUILTINS.contains_key("CONS"));
        assert!(BUILTINS["VALUES"].accepts(0));
        assert!(!BUILTINS["CAR"].accepts(2));
    }

    fn count_down(c: &mut Compiler, n: i64) -> CompileResult<Sexpr> {
        let mut result = Sexpr::nil();
        for form in test_reader::read_all(&format!(
            "(defun count-down (n) (if (= n 0) 0 (1+ (count-down (1- n)))))
             (count-down {})",
            n
        )) {
            result = c.eval(&form)?;
        }
        Ok(result)
    }

    #[test]
    fn host_call_depth_follows_options() {
        let mut options = CompilerOptions::new();
        options.set_max_call_depth(10);
        let mut c = Compiler::new(options);
        assert_eq!(count_down(&mut c, 5).unwrap(), Sexpr::Fixnum(5));
        assert!(matches!(
            count_down(&mut c, 20),
            Err(CompileError::Host(HostError::Condition {
                kind: ConditionKind::SimpleError,
                ..
            }))
        ));
    }

    #[test]
    fn default_depth_allows_recursive_expanders() {
        let result = std::thread::Builder::new()
            .stack_size(256 * 1024 * 1024)
            .spawn(|| {
                let mut c = Compiler::default();
                count_down(&mut c, 500)
                    .map(|n| n.to_string())
                    .map_err(|e| e.to_string())
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(result, Ok("500".to_string()));
    }
}
