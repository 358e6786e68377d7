//! Compilation of toplevel forms and whole units.

use super::{
    env::{BindingKind, BindingValue, Declarations, Macro, Namespace},
    literal::unquote_marker,
    sexpr::{Sexpr, Symbol},
    target::Stmt,
    CompileError, CompileResult, Compiler,
};

impl Compiler {
    /// Compiles one toplevel form. Toplevel `progn`s are flattened so their
    /// subforms stay at toplevel. The literal constructions the form needs
    /// come first; the last statement evaluates to the form's value.
    pub fn compile_toplevel(&mut self, form: &Sexpr, wants_values: bool) -> CompileResult<Vec<Stmt>> {
        let expanded = self.macroexpand(form)?;
        if expanded.is_form("PROGN") {
            let forms = expanded
                .cdr()
                .and_then(Sexpr::list_to_vec)
                .ok_or_else(|| CompileError::malformed("progn", &expanded))?;
            if !forms.is_empty() {
                let last = forms.len() - 1;
                let mut stmts = vec![];
                for (i, form) in forms.iter().enumerate() {
                    stmts.extend(self.compile_toplevel(form, wants_values && i == last)?);
                }
                return Ok(stmts);
            }
        }

        log::trace!(target: "lispjs::convert", "toplevel {}", expanded);
        let code = self.convert(&expanded, wants_values)?;
        let mut stmts = std::mem::take(&mut self.toplevel_code);
        stmts.push(Stmt::Expr(code));
        Ok(stmts)
    }

    /// Compiles `forms` as one unit with a fresh literal table. Undefined
    /// functions are reported at the end when the options ask for it.
    pub fn compile_unit(&mut self, forms: &[Sexpr]) -> CompileResult<Vec<Stmt>> {
        self.begin_unit();
        let mut stmts = vec![];
        for form in forms {
            stmts.extend(self.compile_toplevel(form, false)?);
        }
        if self.options.warn_undefined_functions {
            self.report_undefined_functions();
        }
        Ok(stmts)
    }

    /// Warns about every function that was called but never defined, then
    /// forgets what was recorded.
    pub fn report_undefined_functions(&mut self) -> Vec<Symbol> {
        let undefined = self
            .take_fn_info()
            .into_iter()
            .filter(|(_, info)| info.called && !info.defined)
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        for name in &undefined {
            log::warn!("the function {} is undefined", name);
        }
        undefined
    }

    /// Code that evaluates to a list describing the global environment:
    /// `(:macro name expander)` for each macro defined from source and
    /// `(:special name)`, `(:constant name)` or `(:notinline name)` for each
    /// proclamation. Expanders are compiled into real functions.
    pub fn dump_global_environment(&mut self) -> CompileResult<Vec<Stmt>> {
        let mut entries = vec![];

        for binding in self.env.globals(Namespace::Variable) {
            let name = Sexpr::Symbol(binding.name.clone());
            if binding.has(Declarations::CONSTANT) || binding.kind() == BindingKind::Constant {
                entries.push(Sexpr::list(&[Sexpr::keyword("CONSTANT"), name]));
            } else if binding.has(Declarations::SPECIAL) {
                entries.push(Sexpr::list(&[Sexpr::keyword("SPECIAL"), name]));
            }
        }

        for binding in self.env.globals(Namespace::Function) {
            let name = Sexpr::Symbol(binding.name.clone());
            if binding.has(Declarations::NOTINLINE) {
                entries.push(Sexpr::list(&[Sexpr::keyword("NOTINLINE"), name.clone()]));
            }
            if binding.kind() != BindingKind::Macro {
                continue;
            }
            let source = match binding.value() {
                BindingValue::Macro(Macro::Source(source) | Macro::Compiled { source, .. }) => source,
                _ => continue,
            };
            let expander = Sexpr::list(&[Sexpr::Symbol(unquote_marker()), source]);
            entries.push(Sexpr::list(&[Sexpr::keyword("MACRO"), name, expander]));
        }

        log::debug!(target: "lispjs::convert", "dumping {} global entries", entries.len());
        let datum = Sexpr::list(&entries);
        let env = self.env.global_only();
        let code = self.with_env(env, |c| c.literal(&datum, false))?;
        let mut stmts = std::mem::take(&mut self.toplevel_code);
        stmts.push(Stmt::Expr(code));
        Ok(stmts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::{test_reader::read_all, CompilerOptions},
        runtime::{Class, Host, Value},
    };

    fn file_compiler() -> Compiler {
        let mut options = CompilerOptions::new();
        options.set_compiling_file(true);
        options.set_warn_undefined_functions(false);
        Compiler::new(options)
    }

    fn list_items(value: &Value) -> Vec<Value> {
        let mut items = vec![];
        let mut list = value.clone();
        while list.is_class(Class::Cons) {
            items.push(list.get("car"));
            list = list.get("cdr");
        }
        items
    }

    #[test]
    fn toplevel_progn_is_flattened() {
        let mut c = Compiler::default();
        let stmts = c
            .compile_toplevel(&read_all("(progn 1 (progn 2 3))")[0], false)
            .unwrap();
        let exprs = stmts.iter().filter(|s| matches!(s, Stmt::Expr(_))).count();
        assert_eq!(exprs, 3);
    }

    #[test]
    fn units_run_in_a_fresh_image() {
        let mut c = file_compiler();
        let forms = read_all(
            "(defmacro twice (x) `(* 2 ,x))
             (defvar *base* 4)
             (defun f () (twice *base*))",
        );
        let stmts = c.compile_unit(&forms).unwrap();

        let mut image = Host::new();
        image.run(&stmts).unwrap();
        let f = image.symbol(&Symbol::intern("F")).get("fvalue");
        let result = image.call_lisp(&f, &[]).unwrap();
        assert_eq!(image.from_value(&result).unwrap(), Sexpr::Fixnum(8));
    }

    #[test]
    fn compile_toplevel_eval_when_only_runs_in_the_compiler() {
        let mut c = file_compiler();
        let forms = read_all("(eval-when (:compile-toplevel) (defvar *only-here* 1))");
        let stmts = c.compile_unit(&forms).unwrap();

        assert!(c.host().symbol_value(&Symbol::intern("*ONLY-HERE*")).is_some());
        let mut image = Host::new();
        image.run(&stmts).unwrap();
        assert!(image.symbol_value(&Symbol::intern("*ONLY-HERE*")).is_none());
    }

    #[test]
    fn undefined_functions_are_reported_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut c = file_compiler();
        c.compile_unit(&read_all("(defun a () (b) (c)) (defun c () 1)")).unwrap();
        let undefined = c.report_undefined_functions();
        assert_eq!(undefined, vec![Symbol::intern("B")]);
        assert!(c.report_undefined_functions().is_empty());
    }

    #[test]
    fn global_environment_dump_recreates_macros() {
        let mut c = file_compiler();
        c.compile_unit(&read_all(
            "(defmacro twice (x) `(* 2 ,x))
             (defvar *v* 1)
             (declaim (notinline car))",
        ))
        .unwrap();
        c.begin_unit();
        let stmts = c.dump_global_environment().unwrap();

        let mut image = Host::new();
        let env = image.run(&stmts).unwrap();
        let entries = list_items(&env);
        let kinds = entries
            .iter()
            .map(|entry| list_items(entry)[0].get("name").to_key().to_string())
            .collect::<Vec<_>>();
        assert!(kinds.contains(&"SPECIAL".to_string()));
        assert!(kinds.contains(&"NOTINLINE".to_string()));

        let twice = entries
            .iter()
            .map(list_items)
            .find(|entry| entry[1].get("name").to_key().as_ref() == "TWICE")
            .unwrap();
        assert!(twice[2].is_function());
        let expansion = image.call_lisp(&twice[2], &[Value::Number(21.0)]).unwrap();
        assert_eq!(
            image.from_value(&expansion).unwrap(),
            crate::compiler::test_reader::read("(* 2 21)")
        );
        assert!(!entries
            .iter()
            .any(|entry| list_items(entry)[1].get("name").to_key().as_ref() == "DEFUN"));
    }
}
