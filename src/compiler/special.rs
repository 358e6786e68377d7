//! Core special forms: quotation, functions, assignment, conditionals,
//! local functions and macros, evaluation control and proclamations.

use super::{
    env::{Binding, BindingKind, BindingValue, Declarations, Macro, Namespace},
    sexpr::{Sexpr, Symbol},
    target::{BinaryOp, Expr, Ident, Stmt},
    CompileError, CompileResult, Compiler, SpecialForm,
};
use rustc_hash::FxHashMap;

/// `x` for a form `(quote x)`.
pub(crate) fn unquote(form: &Sexpr) -> Option<Sexpr> {
    if !form.is_form("QUOTE") {
        return None;
    }
    form.cdr().and_then(Sexpr::car).cloned()
}

/// `(name lambda-list . body)` of a `flet`, `labels` or `macrolet` binding.
fn local_definition(operator: &str, def: &Sexpr) -> CompileResult<(Symbol, Sexpr, Vec<Sexpr>)> {
    let parts = def
        .list_to_vec()
        .filter(|parts| parts.len() >= 2)
        .ok_or_else(|| CompileError::malformed(operator, def))?;
    let name = parts[0]
        .as_symbol()
        .cloned()
        .ok_or_else(|| CompileError::malformed(operator, def))?;
    Ok((name, parts[1].clone(), parts[2..].to_vec()))
}

fn definitions(operator: &str, form: &Sexpr, args: &[Sexpr]) -> CompileResult<Vec<(Symbol, Sexpr, Vec<Sexpr>)>> {
    let defs = args
        .first()
        .and_then(Sexpr::list_to_vec)
        .ok_or_else(|| CompileError::malformed(operator, form))?;
    defs.iter().map(|def| local_definition(operator, def)).collect()
}

impl Compiler {
    /// `test !== nil`
    pub fn truthy(&mut self, test: Expr) -> CompileResult<Expr> {
        let nil = self.nil()?;
        Ok(Expr::binary(BinaryOp::StrictNe, test, nil))
    }

    pub fn compile_function(&mut self, form: &Sexpr, designator: &Sexpr) -> CompileResult<Expr> {
        match designator {
            Sexpr::Symbol(sym) => {
                let local = self
                    .env
                    .lookup_local(sym, Namespace::Function)
                    .and_then(|binding| binding.ident());
                if let Some(ident) = local {
                    return Ok(Expr::Var(ident));
                }
                let symbol = self.literal(designator, false)?;
                Ok(Expr::internal("symbolFunction", vec![symbol]))
            }
            _ if designator.is_form("LAMBDA") => {
                let parts = designator
                    .list_to_vec()
                    .filter(|parts| parts.len() >= 2)
                    .ok_or_else(|| CompileError::malformed("function", form))?;
                self.compile_lambda(&parts[1], &parts[2..], None)
            }
            _ if designator.is_form("NAMED-LAMBDA") => {
                let parts = designator
                    .list_to_vec()
                    .filter(|parts| parts.len() >= 3)
                    .ok_or_else(|| CompileError::malformed("function", form))?;
                let name = parts[1]
                    .as_symbol()
                    .cloned()
                    .ok_or_else(|| CompileError::malformed("function", form))?;
                self.compile_lambda(&parts[2], &parts[3..], Some(&name))
            }
            _ => Err(CompileError::BadFunction {
                form: designator.to_string(),
            }),
        }
    }

    fn setq_pair(&mut self, form: &Sexpr, var: &Sexpr, value: &Sexpr) -> CompileResult<Expr> {
        let sym = var
            .as_symbol()
            .ok_or_else(|| CompileError::malformed("setq", form))?;
        let binding = self.env.lookup(sym, Namespace::Variable);

        if let Some(binding) = &binding {
            match binding.value() {
                BindingValue::Ident(ident)
                    if binding.kind() == BindingKind::Variable
                        && !binding
                            .declarations()
                            .intersects(Declarations::SPECIAL | Declarations::CONSTANT) =>
                {
                    let value = self.convert(value, false)?;
                    return Ok(Expr::assign(Expr::Var(ident), value));
                }
                BindingValue::SymbolMacro(expansion) => {
                    if !expansion.is_symbol() {
                        return Err(CompileError::malformed("setq", form));
                    }
                    return self.setq_pair(form, &expansion, value);
                }
                _ => {}
            }
        }

        let set = Sexpr::list(&[
            Sexpr::symbol("SET"),
            Sexpr::quote(var.clone()),
            value.clone(),
        ]);
        self.convert(&set, false)
    }
}

pub fn define_special_forms(table: &mut FxHashMap<&'static str, SpecialForm>) {
    define_compilation!(table, "QUOTE", (c, form, args, mv) {
        match args {
            [datum] => c.literal(datum, false),
            _ => Err(CompileError::malformed("quote", form)),
        }
    });

    define_compilation!(table, "FUNCTION", (c, form, args, mv) {
        match args {
            [designator] => c.compile_function(form, designator),
            _ => Err(CompileError::malformed("function", form)),
        }
    });

    define_compilation!(table, "SETQ", (c, form, args, mv) {
        if args.is_empty() {
            return c.nil();
        }
        if args.len() % 2 != 0 {
            return Err(CompileError::OddSetq { form: form.to_string() });
        }
        let mut assignments = Vec::with_capacity(args.len() / 2);
        for pair in args.chunks(2) {
            assignments.push(c.setq_pair(form, &pair[0], &pair[1])?);
        }
        Ok(Expr::progn(assignments))
    });

    define_compilation!(table, "IF", (c, form, args, mv) {
        let (test, then, otherwise) = match args {
            [test, then] => (test, then, Sexpr::nil()),
            [test, then, otherwise] => (test, then, otherwise.clone()),
            _ => return Err(CompileError::malformed("if", form)),
        };
        let test = c.convert(test, false)?;
        let test = c.truthy(test)?;
        let then = c.convert(then, mv)?;
        let otherwise = c.convert(&otherwise, mv)?;
        Ok(Expr::cond(test, then, otherwise))
    });

    define_compilation!(table, "PROGN", (c, form, args, mv) {
        c.convert_progn(args, mv)
    });

    define_compilation!(table, "FLET", (c, form, args, mv) {
        let defs = definitions("flet", form, args)?;
        let mut functions = Vec::with_capacity(defs.len());
        for (name, ll, body) in &defs {
            functions.push(c.compile_lambda(ll, body, Some(name))?);
        }

        let bindings = defs
            .iter()
            .map(|(name, ..)| {
                let ident = c.gvarname(name.name());
                Binding::function(name.clone(), ident)
            })
            .collect::<Vec<_>>();
        let params = bindings.iter().filter_map(|b| b.ident()).collect::<Vec<Ident>>();

        let (body, decls, _) = c.parse_body(&args[1..], false)?;
        let env = c.env.extend(bindings, Namespace::Function);
        let env = c.declare_specials(env, &decls, &[]);
        let code = c.with_env(env, |c| c.convert_block(&body, true, mv))?;
        Ok(Expr::call(Expr::function(None, params, code), functions))
    });

    define_compilation!(table, "LABELS", (c, form, args, mv) {
        let defs = definitions("labels", form, args)?;
        let bindings = defs
            .iter()
            .map(|(name, ..)| {
                let ident = c.gvarname(name.name());
                Binding::function(name.clone(), ident)
            })
            .collect::<Vec<_>>();

        let (body, decls, _) = c.parse_body(&args[1..], false)?;
        let env = c.env.extend(bindings.clone(), Namespace::Function);
        let env = c.declare_specials(env, &decls, &[]);
        let code = c.with_env(env, |c| {
            let mut stmts = vec![];
            for ((name, ll, body), binding) in defs.iter().zip(&bindings) {
                let function = c.compile_lambda(ll, body, Some(name))?;
                if let Some(ident) = binding.ident() {
                    stmts.push(Stmt::var(ident, function));
                }
            }
            stmts.extend(c.convert_block(&body, true, mv)?);
            Ok(stmts)
        })?;
        Ok(Expr::self_call(code))
    });

    define_compilation!(table, "MACROLET", (c, form, args, mv) {
        let defs = definitions("macrolet", form, args)?;
        let bindings = defs
            .into_iter()
            .map(|(name, ll, body)| {
                let expander = Sexpr::list(&[
                    Sexpr::symbol("FUNCTION"),
                    Sexpr::list_star(
                        &[Sexpr::symbol("NAMED-LAMBDA"), Sexpr::Symbol(name.clone()), ll],
                        Sexpr::list(&body),
                    ),
                ]);
                Binding::new(
                    name,
                    Namespace::Function,
                    BindingKind::Macro,
                    BindingValue::Macro(Macro::Source(expander)),
                )
            })
            .collect::<Vec<_>>();
        let env = c.env.extend(bindings, Namespace::Function);
        c.with_env(env, |c| c.convert_progn(&args[1..], mv))
    });

    define_compilation!(table, "SYMBOL-MACROLET", (c, form, args, mv) {
        let defs = args
            .first()
            .and_then(Sexpr::list_to_vec)
            .ok_or_else(|| CompileError::malformed("symbol-macrolet", form))?;
        let mut bindings = Vec::with_capacity(defs.len());
        for def in &defs {
            match def.list_to_vec().as_deref() {
                Some([Sexpr::Symbol(name), expansion]) => bindings.push(Binding::new(
                    name.clone(),
                    Namespace::Variable,
                    BindingKind::Macro,
                    BindingValue::SymbolMacro(expansion.clone()),
                )),
                _ => return Err(CompileError::malformed("symbol-macrolet", def)),
            }
        }
        let env = c.env.extend(bindings, Namespace::Variable);
        c.with_env(env, |c| c.convert_progn(&args[1..], mv))
    });

    define_compilation!(table, "EVAL-WHEN", (c, form, args, mv) {
        let situations = args
            .first()
            .and_then(Sexpr::list_to_vec)
            .ok_or_else(|| CompileError::malformed("eval-when", form))?;
        let has = |names: &[&str]| {
            situations
                .iter()
                .filter_map(Sexpr::as_symbol)
                .any(|sym| names.contains(&sym.name()))
        };
        let compile = has(&["COMPILE-TOPLEVEL", "COMPILE"]);
        let load = has(&["LOAD-TOPLEVEL", "LOAD"]);
        let execute = has(&["EXECUTE", "EVAL"]);
        let body = &args[1..];

        if c.options.compiling_file && c.convert_level == 1 {
            if compile {
                let progn = Sexpr::list_star(&[Sexpr::symbol("PROGN")], Sexpr::list(body));
                c.eval_value(&progn)?;
            }
            if load {
                return c.convert_progn(body, mv);
            }
            return c.nil();
        }

        if execute {
            c.convert_progn(body, mv)
        } else {
            c.nil()
        }
    });

    define_compilation!(table, "THE", (c, form, args, mv) {
        match args {
            [_, value] => c.convert(value, mv),
            _ => Err(CompileError::malformed("the", form)),
        }
    });

    define_compilation!(table, "LOAD-TIME-VALUE", (c, form, args, mv) {
        let value = match args {
            [value] | [value, _] => value,
            _ => return Err(CompileError::malformed("load-time-value", form)),
        };
        if c.options.compiling_file {
            let ident = c.gvarname("ltv");
            let env = c.env.global_only();
            let code = c.with_env(env, |c| c.convert(value, false))?;
            c.push_toplevel(Stmt::var(ident.clone(), code));
            return Ok(Expr::Var(ident));
        }
        let datum = c.eval(value)?;
        c.literal(&datum, false)
    });

    define_compilation!(table, "%WHILE", (c, form, args, mv) {
        let Some((test, body)) = args.split_first() else {
            return Err(CompileError::malformed("%while", form));
        };
        let test = c.convert(test, false)?;
        let test = c.truthy(test)?;
        let body = c.convert_block(body, false, false)?;
        let nil = c.nil()?;
        Ok(Expr::self_call(vec![Stmt::While(test, body), Stmt::Return(nil)]))
    });

    define_compilation!(table, "%JS-VREF", (c, form, args, mv) {
        match args {
            [Sexpr::String(name)] => Ok(Expr::Var(name.clone())),
            _ => Err(CompileError::malformed("%js-vref", form)),
        }
    });

    define_compilation!(table, "%JS-VSET", (c, form, args, mv) {
        match args {
            [Sexpr::String(name), value] => {
                let value = c.convert(value, false)?;
                Ok(Expr::assign(Expr::Var(name.clone()), value))
            }
            _ => Err(CompileError::malformed("%js-vset", form)),
        }
    });

    define_compilation!(table, "DECLAIM", (c, form, args, mv) {
        for spec in args {
            let parts = spec
                .list_to_vec()
                .filter(|parts| !parts.is_empty())
                .ok_or_else(|| CompileError::malformed("declaim", form))?;
            let names = parts[1..].iter().filter_map(Sexpr::as_symbol);
            match parts[0].as_symbol().map(Symbol::name) {
                Some("SPECIAL") => {
                    for name in names {
                        let binding = c.env.declare_global(Namespace::Variable, BindingKind::Special, name);
                        binding.set_kind(BindingKind::Special);
                        binding.declare(Declarations::SPECIAL);
                    }
                }
                Some("CONSTANT") => {
                    for name in names {
                        let binding = c.env.declare_global(Namespace::Variable, BindingKind::Constant, name);
                        binding.set_kind(BindingKind::Constant);
                        binding.declare(Declarations::CONSTANT);
                    }
                }
                Some("NOTINLINE") => {
                    for name in names {
                        c.env
                            .declare_global(Namespace::Function, BindingKind::Variable, name)
                            .declare(Declarations::NOTINLINE);
                    }
                }
                Some("INLINE") => {
                    for name in names {
                        if let Some(binding) = c.env.lookup_global(name, Namespace::Function) {
                            binding.undeclare(Declarations::NOTINLINE);
                        }
                    }
                }
                _ => log::debug!(target: "lispjs::convert", "ignoring proclamation {}", spec),
            }
        }
        c.nil()
    });

    define_compilation!(table, "%COMPILE-DEFMACRO", (c, form, args, mv) {
        let (name, expander) = match args {
            [name, expander] => (unquote(name), unquote(expander)),
            _ => return Err(CompileError::malformed("%compile-defmacro", form)),
        };
        let (Some(Sexpr::Symbol(name)), Some(expander)) = (name, expander) else {
            return Err(CompileError::malformed("%compile-defmacro", form));
        };
        log::debug!(target: "lispjs::convert", "defining macro {}", name);
        c.env.define_global(Binding::new(
            name.clone(),
            Namespace::Function,
            BindingKind::Macro,
            BindingValue::Macro(Macro::Source(expander)),
        ));
        c.literal(&Sexpr::Symbol(name), false)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{test_reader::read_all, CompilerOptions};

    fn eval_with(c: &mut Compiler, src: &str) -> CompileResult<Sexpr> {
        let mut result = Sexpr::nil();
        for form in read_all(src) {
            result = c.eval(&form)?;
        }
        Ok(result)
    }

    fn eval(src: &str) -> Sexpr {
        eval_with(&mut Compiler::default(), src).unwrap()
    }

    #[test]
    fn if_treats_only_nil_as_false() {
        assert_eq!(eval("(if nil 1 2)"), Sexpr::Fixnum(2));
        assert_eq!(eval("(if 0 1 2)"), Sexpr::Fixnum(1));
        assert_eq!(eval("(if nil 1)"), Sexpr::nil());
    }

    #[test]
    fn setq_assigns_lexicals_and_globals() {
        assert_eq!(eval("(let ((x 1)) (setq x 2) x)"), Sexpr::Fixnum(2));
        assert_eq!(eval("(setq *g* 5) *g*"), Sexpr::Fixnum(5));
        assert_eq!(eval("(setq)"), Sexpr::nil());
    }

    #[test]
    fn odd_setq_is_rejected() {
        let mut c = Compiler::default();
        assert!(matches!(
            eval_with(&mut c, "(setq a 1 b)"),
            Err(CompileError::OddSetq { .. })
        ));
    }

    #[test]
    fn labels_can_recurse() {
        let src = "(labels ((fact (n) (if (= n 0) 1 (* n (fact (- n 1)))))) (fact 5))";
        assert_eq!(eval(src), Sexpr::Fixnum(120));
    }

    #[test]
    fn flet_functions_see_outer_definitions() {
        let src = "(flet ((f (x) (+ x 1))) (flet ((f (x) (* 2 (f x)))) (f 3)))";
        assert_eq!(eval(src), Sexpr::Fixnum(8));
    }

    #[test]
    fn macrolet_and_symbol_macrolet_expand_locally() {
        assert_eq!(eval("(macrolet ((twice (x) (list '+ x x))) (twice 21))"), Sexpr::Fixnum(42));
        assert_eq!(
            eval("(let ((y 1)) (symbol-macrolet ((x y)) (setq x 4) y))"),
            Sexpr::Fixnum(4)
        );
    }

    #[test]
    fn eval_when_execute_outside_files() {
        assert_eq!(eval("(eval-when (:execute) 7)"), Sexpr::Fixnum(7));
        assert_eq!(eval("(eval-when (:compile-toplevel) 7)"), Sexpr::nil());
    }

    #[test]
    fn eval_when_compile_toplevel_runs_in_the_host() {
        let mut options = CompilerOptions::new();
        options.set_compiling_file(true);
        let mut c = Compiler::new(options);
        let form = &read_all("(eval-when (:compile-toplevel) (setq *seen* 42))")[0];
        let code = c.compile_toplevel(form, false).unwrap();
        assert!(!crate::compiler::target::dump(&code).contains("42"));
        let seen = c.host().symbol_value(&Symbol::intern("*SEEN*"));
        assert!(seen.is_some_and(|v| v.strict_equals(&crate::runtime::Value::Number(42.0))));
    }

    #[test]
    fn while_loops_until_nil() {
        let src = "(let ((i 0) (acc nil)) (%while (< i 3) (setq acc (cons i acc)) (setq i (+ i 1))) acc)";
        assert_eq!(eval(src), crate::compiler::test_reader::read("(2 1 0)"));
    }

    #[test]
    fn notinline_disables_builtins() {
        let mut c = Compiler::default();
        eval_with(&mut c, "(declaim (notinline car))").unwrap();
        let code = c.convert(&read_all("(car x)")[0], false).unwrap();
        assert!(matches!(code, Expr::MethodCall(_, ref name, _) if &**name == "fvalue"));
    }

    #[test]
    fn load_time_value_is_evaluated_once_at_compile_time() {
        assert_eq!(eval("(load-time-value (+ 1 2))"), Sexpr::Fixnum(3));
    }
}
