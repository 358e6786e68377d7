//! The convert dispatcher: macroexpansion, then symbols, atoms, special
//! forms, inline builtins and ordinary calls.

use std::rc::Rc;

use super::{
    env::{Binding, BindingKind, BindingValue, Declarations, Environment, Namespace},
    sexpr::{Sexpr, Symbol, COMMON_LISP},
    target::{Expr, Stmt},
    CompileError, CompileResult, Compiler, Expander, BUILTINS, SPECIAL_FORMS,
};

impl Compiler {
    /// Compiles `form` into an expression. `wants_values` is set when the
    /// surrounding context consumes every value the form returns.
    pub fn convert(&mut self, form: &Sexpr, wants_values: bool) -> CompileResult<Expr> {
        let form = self.macroexpand(form)?;
        self.convert_level += 1;
        let result = self.convert_expanded(&form, wants_values);
        self.convert_level -= 1;
        result
    }

    fn convert_expanded(&mut self, form: &Sexpr, wants_values: bool) -> CompileResult<Expr> {
        match form {
            Sexpr::Symbol(sym) => self.convert_symbol(sym),
            Sexpr::Pair(_) => {
                let items = form
                    .list_to_vec()
                    .ok_or_else(|| CompileError::ImproperForm {
                        form: form.to_string(),
                    })?;
                let (head, args) = (&items[0], &items[1..]);

                if let Some(sym) = head.as_symbol() {
                    if sym.package() == Some(COMMON_LISP) {
                        if let Some(special) = SPECIAL_FORMS.get(sym.name()) {
                            return special(self, form, args, wants_values);
                        }
                        if let Some(builtin) = self.inline_builtin(sym, args.len()) {
                            let args = args
                                .iter()
                                .map(|arg| self.convert(arg, false))
                                .collect::<CompileResult<Vec<_>>>()?;
                            return (builtin.compile)(self, args, wants_values);
                        }
                    }
                }

                self.compile_funcall(head, args, wants_values)
            }
            _ => self.literal(form, false),
        }
    }

    fn convert_symbol(&mut self, sym: &Symbol) -> CompileResult<Expr> {
        if sym.is_nil() || *sym == Symbol::t() {
            return self.literal(&Sexpr::Symbol(sym.clone()), false);
        }

        let binding = self.env.lookup(sym, Namespace::Variable);
        if let Some(binding) = &binding {
            if binding.kind() == BindingKind::Variable
                && !binding.has(Declarations::SPECIAL)
                && !binding.has(Declarations::CONSTANT)
            {
                if let Some(ident) = binding.ident() {
                    return Ok(Expr::Var(ident));
                }
            }
        }

        let literal = self.literal(&Sexpr::Symbol(sym.clone()), false)?;
        let constant = binding.is_some_and(|b| b.has(Declarations::CONSTANT));
        if sym.is_keyword() || constant {
            Ok(Expr::get(literal, "value"))
        } else {
            Ok(Expr::internal("symbolValue", vec![literal]))
        }
    }

    /// The inline compiler of `name`, unless a local function shadows it, it
    /// is declared notinline or the argument count does not fit.
    fn inline_builtin(&self, name: &Symbol, nargs: usize) -> Option<super::Builtin> {
        let builtin = BUILTINS.get(name.name())?;
        if self.env.lookup_local(name, Namespace::Function).is_some() {
            return None;
        }
        if let Some(global) = self.env.lookup_global(name, Namespace::Function) {
            if global.has(Declarations::NOTINLINE) || global.kind() == BindingKind::Macro {
                return None;
            }
        }
        if !builtin.accepts(nargs) {
            log::debug!(target: "lispjs::convert", "{} called with {} arguments", name, nargs);
            return None;
        }
        Some(*builtin)
    }

    /// A call through the `(values, nargs, args...)` convention.
    pub fn compile_funcall(
        &mut self,
        function: &Sexpr,
        args: &[Sexpr],
        wants_values: bool,
    ) -> CompileResult<Expr> {
        let mut call_args = Vec::with_capacity(args.len() + 2);
        call_args.push(self.values_arg(wants_values));
        call_args.push(Expr::Int(args.len() as i64));
        for arg in args {
            call_args.push(self.convert(arg, false)?);
        }

        match function {
            Sexpr::Symbol(sym) => {
                let local = self
                    .env
                    .lookup_local(sym, Namespace::Function)
                    .and_then(|binding| binding.ident());
                if let Some(ident) = local {
                    return Ok(Expr::call(Expr::Var(ident), call_args));
                }
                self.note_called(sym);
                let symbol = self.literal(function, false)?;
                Ok(Expr::method(symbol, "fvalue", call_args))
            }
            _ if function.is_form("LAMBDA") => {
                let function = Sexpr::list(&[Sexpr::symbol("FUNCTION"), function.clone()]);
                let function = self.convert(&function, false)?;
                Ok(Expr::call(function, call_args))
            }
            _ => Err(CompileError::BadFunction {
                form: function.to_string(),
            }),
        }
    }

    /// Statements for a body. The last form's value is returned when
    /// `return_last` is set; an empty body then returns nil.
    pub fn convert_block(
        &mut self,
        body: &[Sexpr],
        return_last: bool,
        wants_values: bool,
    ) -> CompileResult<Vec<Stmt>> {
        let Some((last, init)) = body.split_last() else {
            if return_last {
                return Ok(vec![Stmt::Return(self.nil()?)]);
            }
            return Ok(vec![]);
        };

        let mut stmts = Vec::with_capacity(body.len());
        for form in init {
            stmts.push(Stmt::expr(self.convert(form, false)?));
        }
        let last = self.convert(last, wants_values)?;
        stmts.push(if return_last {
            Stmt::Return(last)
        } else {
            Stmt::expr(last)
        });
        Ok(stmts)
    }

    /// A body as one expression; an empty body is nil.
    pub fn convert_progn(&mut self, body: &[Sexpr], wants_values: bool) -> CompileResult<Expr> {
        let Some((last, init)) = body.split_last() else {
            return self.nil();
        };
        let mut exprs = Vec::with_capacity(body.len());
        for form in init {
            exprs.push(self.convert(form, false)?);
        }
        exprs.push(self.convert(last, wants_values)?);
        Ok(Expr::progn(exprs))
    }

    /// Splits leading declarations and an optional docstring off a body.
    /// A string is only a docstring when more forms follow it.
    pub fn parse_body(
        &self,
        body: &[Sexpr],
        docstring: bool,
    ) -> CompileResult<(Vec<Sexpr>, Vec<Sexpr>, Option<Rc<str>>)> {
        let mut decls = vec![];
        let mut doc = None;
        let mut rest = body;

        while let Some((first, tail)) = rest.split_first() {
            if first.is_form("DECLARE") {
                let specs = first
                    .list_to_vec()
                    .ok_or_else(|| CompileError::malformed("declare", first))?;
                decls.extend(specs.into_iter().skip(1));
            } else if let Sexpr::String(s) = first {
                if !docstring || doc.is_some() || tail.is_empty() {
                    break;
                }
                doc = Some(s.clone());
            } else {
                break;
            }
            rest = tail;
        }

        Ok((rest.to_vec(), decls, doc))
    }

    /// Extends `env` with special bindings for every `(special ...)` name in
    /// `decls` that is not in `bound`.
    pub fn declare_specials(&self, env: Environment, decls: &[Sexpr], bound: &[Symbol]) -> Environment {
        let free = special_names(decls)
            .into_iter()
            .filter(|name| !bound.contains(name))
            .map(Binding::special)
            .collect::<Vec<_>>();
        if free.is_empty() {
            return env;
        }
        env.extend(free, Namespace::Variable)
    }

    /// Expands `form` once. Returns the expansion and whether anything was
    /// expanded.
    pub fn macroexpand_1(&mut self, form: &Sexpr) -> CompileResult<(Sexpr, bool)> {
        match form {
            Sexpr::Symbol(sym) => {
                let binding = self.env.lookup(sym, Namespace::Variable);
                match binding.map(|b| b.value()) {
                    Some(BindingValue::SymbolMacro(expansion)) => Ok((expansion, true)),
                    _ => Ok((form.clone(), false)),
                }
            }
            Sexpr::Pair(_) => {
                let Some(name) = form.car().and_then(Sexpr::as_symbol) else {
                    return Ok((form.clone(), false));
                };
                let Some(binding) = self.env.lookup(name, Namespace::Function) else {
                    return Ok((form.clone(), false));
                };
                if binding.kind() != BindingKind::Macro {
                    return Ok((form.clone(), false));
                }
                let Some(args) = form.cdr().and_then(Sexpr::list_to_vec) else {
                    return Ok((form.clone(), false));
                };

                let expansion = match self.expander(&binding)? {
                    None => return Ok((form.clone(), false)),
                    Some(Expander::Native(expander)) => expander(self, form, &args)?,
                    Some(Expander::Host(function)) => {
                        let args = args
                            .iter()
                            .map(|arg| self.host.to_value(arg))
                            .collect::<Vec<_>>();
                        let expansion = self
                            .host
                            .call_lisp(&function, &args)
                            .and_then(|value| self.host.from_value(&value));
                        expansion.map_err(|err| CompileError::Expansion {
                            form: form.to_string(),
                            message: err.to_string(),
                        })?
                    }
                };
                log::trace!(target: "lispjs::convert", "{} => {}", form, expansion);
                Ok((expansion, true))
            }
            _ => Ok((form.clone(), false)),
        }
    }

    /// Expands `form` until its head is no longer a macro.
    pub fn macroexpand(&mut self, form: &Sexpr) -> CompileResult<Sexpr> {
        let mut form = form.clone();
        loop {
            let (expansion, expanded) = self.macroexpand_1(&form)?;
            if !expanded {
                return Ok(expansion);
            }
            form = expansion;
        }
    }
}

/// Names declared special by `(special ...)` specifiers.
pub fn special_names(decls: &[Sexpr]) -> Vec<Symbol> {
    decls
        .iter()
        .filter(|decl| decl.is_form("SPECIAL"))
        .filter_map(Sexpr::list_to_vec)
        .flat_map(|spec| spec.into_iter().skip(1))
        .filter_map(|name| name.as_symbol().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::test_reader::{read, read_all};

    fn eval(src: &str) -> Sexpr {
        let mut c = Compiler::default();
        let mut result = Sexpr::nil();
        for form in read_all(src) {
            result = c.eval(&form).unwrap();
        }
        result
    }

    #[test]
    fn lexical_variables_shadow() {
        assert_eq!(eval("(let ((x 1)) (let ((x 2)) x))"), Sexpr::Fixnum(2));
        assert_eq!(eval("(let ((x 1)) (let ((y 2)) x))"), Sexpr::Fixnum(1));
    }

    #[test]
    fn keywords_evaluate_to_themselves() {
        assert_eq!(eval(":foo"), Sexpr::keyword("FOO"));
    }

    #[test]
    fn unbound_global_is_a_runtime_condition() {
        let mut c = Compiler::default();
        let err = c.eval(&read("no-such-variable")).unwrap_err();
        assert!(err.to_string().contains("unbound"));
    }

    #[test]
    fn calls_to_unknown_functions_are_recorded() {
        let mut c = Compiler::default();
        c.convert(&read("(frobnicate 1 2)"), false).unwrap();
        let info = c.fn_info(&Symbol::intern("FROBNICATE")).unwrap();
        assert!(info.called);
        assert!(!info.defined);
    }

    #[test]
    fn improper_forms_are_rejected() {
        let mut c = Compiler::default();
        assert!(matches!(
            c.convert(&read("(foo . 1)"), false),
            Err(CompileError::ImproperForm { .. })
        ));
        assert!(matches!(
            c.convert(&read("(1 2)"), false),
            Err(CompileError::BadFunction { .. })
        ));
    }

    #[test]
    fn builtin_with_wrong_arity_becomes_a_call() {
        let mut c = Compiler::default();
        let code = c.convert(&read("(car 1 2)"), false).unwrap();
        assert!(matches!(code, Expr::MethodCall(_, ref name, _) if &**name == "fvalue"));
    }

    #[test]
    fn flet_shadows_builtins() {
        assert_eq!(eval("(flet ((car (x) 42)) (car '(1)))"), Sexpr::Fixnum(42));
    }

    #[test]
    fn docstrings_need_a_following_form() {
        let c = Compiler::default();
        let body = read_all("\"doc\" (declare (special x)) x");
        let (forms, decls, doc) = c.parse_body(&body, true).unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(decls.len(), 1);
        assert_eq!(doc.as_deref(), Some("doc"));

        let body = read_all("\"only\"");
        let (forms, _, doc) = c.parse_body(&body, true).unwrap();
        assert_eq!(forms.len(), 1);
        assert!(doc.is_none());
    }

    #[test]
    fn lambda_in_operator_position() {
        assert_eq!(eval("((lambda (x y) (+ x y)) 1 2)"), Sexpr::Fixnum(3));
    }
}
