//! `let`, `let*` and `locally`, including the binding of special variables.
//!
//! A special variable lives in its symbol's `value` slot. Binding one saves
//! the old value, stores the new one and restores the old one in a
//! `finally`, so every exit path unbinds it.

use rustc_hash::FxHashMap;

use super::{
    convert::special_names,
    env::{Binding, Namespace},
    sexpr::{Sexpr, Symbol},
    target::{Expr, Ident, Stmt},
    CompileError, CompileResult, Compiler, SpecialForm,
};

/// `(var init)`, `(var)` or `var`
fn parse_bindings(operator: &str, form: &Sexpr, bindings: Option<&Sexpr>) -> CompileResult<Vec<(Symbol, Sexpr)>> {
    let bindings = bindings
        .and_then(Sexpr::list_to_vec)
        .ok_or_else(|| CompileError::malformed(operator, form))?;
    bindings
        .iter()
        .map(|binding| match binding {
            Sexpr::Symbol(var) => Ok((var.clone(), Sexpr::nil())),
            _ => match binding.list_to_vec().as_deref() {
                Some([Sexpr::Symbol(var)]) => Ok((var.clone(), Sexpr::nil())),
                Some([Sexpr::Symbol(var), init]) => Ok((var.clone(), init.clone())),
                _ => Err(CompileError::malformed(operator, binding)),
            },
        })
        .collect()
}

impl Compiler {
    fn symbol_value_slot(&mut self, var: &Symbol) -> CompileResult<Expr> {
        let symbol = self.literal(&Sexpr::Symbol(var.clone()), false)?;
        Ok(Expr::get(symbol, "value"))
    }

    /// Swaps each special's value slot with the temporary holding its new
    /// value, runs `body` and swaps back in a `finally`.
    fn let_binding_wrapper(&mut self, specials: &[(Symbol, Ident)], body: Vec<Stmt>) -> CompileResult<Vec<Stmt>> {
        if specials.is_empty() {
            return Ok(body);
        }

        let tmp: Ident = "tmp".into();
        let mut swap = vec![Stmt::Var(tmp.clone(), None)];
        let mut restore = vec![];
        for (var, temp) in specials {
            let slot = self.symbol_value_slot(var)?;
            swap.push(Stmt::expr(Expr::assign(Expr::Var(tmp.clone()), slot.clone())));
            swap.push(Stmt::expr(Expr::assign(slot.clone(), Expr::Var(temp.clone()))));
            swap.push(Stmt::expr(Expr::assign(Expr::Var(temp.clone()), Expr::Var(tmp.clone()))));
            restore.push(Stmt::expr(Expr::assign(slot, Expr::Var(temp.clone()))));
        }
        swap.extend(body);
        Ok(vec![Stmt::try_finally(swap, restore)])
    }
}

pub fn define_special_forms(table: &mut FxHashMap<&'static str, SpecialForm>) {
    define_compilation!(table, "LET", (c, form, args, mv) {
        let bindings = parse_bindings("let", form, args.first())?;
        let (body, decls, _) = c.parse_body(&args[1..], false)?;
        let local_specials = special_names(&decls);

        let mut inits = Vec::with_capacity(bindings.len());
        for (_, init) in &bindings {
            inits.push(c.convert(init, false)?);
        }

        let mut params = vec![];
        let mut lexicals = vec![];
        let mut specials = vec![];
        for (var, _) in &bindings {
            let ident = c.gvarname(var.name());
            if local_specials.contains(var) || c.env.is_special(var) {
                specials.push((var.clone(), ident.clone()));
            } else {
                lexicals.push(Binding::variable(var.clone(), ident.clone()));
            }
            params.push(ident);
        }

        let env = c.env.extend(lexicals, Namespace::Variable);
        let env = c.declare_specials(env, &decls, &[]);
        let code = c.with_env(env, |c| c.convert_block(&body, true, mv))?;
        let code = c.let_binding_wrapper(&specials, code)?;
        Ok(Expr::call(Expr::function(None, params, code), inits))
    });

    define_compilation!(table, "LET*", (c, form, args, mv) {
        let bindings = parse_bindings("let*", form, args.first())?;
        let (body, decls, _) = c.parse_body(&args[1..], false)?;
        let local_specials = special_names(&decls);

        let outer = c.env.clone();
        let result = (|| -> CompileResult<Expr> {
            let mut saved = vec![];
            let mut stmts = vec![];
            for (var, init) in &bindings {
                let value = c.convert(init, false)?;
                if local_specials.contains(var) || c.env.is_special(var) {
                    if !saved.iter().any(|(saved_var, _): &(Symbol, Ident)| saved_var == var) {
                        saved.push((var.clone(), c.gvarname(var.name())));
                    }
                    let slot = c.symbol_value_slot(var)?;
                    stmts.push(Stmt::expr(Expr::assign(slot, value)));
                    if local_specials.contains(var) {
                        c.env = c.env.extend([Binding::special(var.clone())], Namespace::Variable);
                    }
                } else {
                    let ident = c.gvarname(var.name());
                    stmts.push(Stmt::var(ident.clone(), value));
                    c.env = c.env.extend([Binding::variable(var.clone(), ident)], Namespace::Variable);
                }
            }
            let env = c.env.clone();
            c.env = c.declare_specials(env, &decls, &[]);
            stmts.extend(c.convert_block(&body, true, mv)?);

            if saved.is_empty() {
                return Ok(Expr::self_call(stmts));
            }

            let mut protected = vec![];
            let mut restore = vec![];
            for (var, temp) in &saved {
                let slot = c.symbol_value_slot(var)?;
                protected.push(Stmt::var(temp.clone(), slot.clone()));
                restore.push(Stmt::expr(Expr::assign(slot, Expr::Var(temp.clone()))));
            }
            protected.extend(stmts);
            Ok(Expr::self_call(vec![Stmt::try_finally(protected, restore)]))
        })();
        c.env = outer;
        result
    });

    define_compilation!(table, "LOCALLY", (c, form, args, mv) {
        let (body, decls, _) = c.parse_body(args, false)?;
        let env = c.declare_specials(c.env.clone(), &decls, &[]);
        c.with_env(env, |c| c.convert_progn(&body, mv))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::test_reader::{read, read_all};

    fn eval_with(c: &mut Compiler, src: &str) -> CompileResult<Sexpr> {
        let mut result = Sexpr::nil();
        for form in read_all(src) {
            result = c.eval(&form)?;
        }
        Ok(result)
    }

    fn with_special() -> Compiler {
        let mut c = Compiler::default();
        eval_with(&mut c, "(defvar *x* 1) (defun get-x () *x*)").unwrap();
        c
    }

    #[test]
    fn let_binds_in_parallel() {
        let mut c = Compiler::default();
        assert_eq!(eval_with(&mut c, "(let ((a 1)) (let ((a 2) (b a)) b))").unwrap(), Sexpr::Fixnum(1));
        assert_eq!(eval_with(&mut c, "(let (a (b) (c 3)) (list a b c))").unwrap(), read("(nil nil 3)"));
    }

    #[test]
    fn let_star_binds_in_sequence() {
        let mut c = Compiler::default();
        assert_eq!(eval_with(&mut c, "(let* ((a 1) (b (+ a 1))) (list a b))").unwrap(), read("(1 2)"));
    }

    #[test]
    fn specials_are_seen_by_callees_and_restored() {
        let mut c = with_special();
        assert_eq!(eval_with(&mut c, "(list (let ((*x* 2)) (get-x)) (get-x))").unwrap(), read("(2 1)"));
        assert_eq!(eval_with(&mut c, "(let* ((*x* 5) (y *x*)) (list y (get-x)))").unwrap(), read("(5 5)"));
        assert_eq!(eval_with(&mut c, "*x*").unwrap(), Sexpr::Fixnum(1));
    }

    #[test]
    fn specials_are_restored_after_non_local_exit() {
        let mut c = with_special();
        eval_with(&mut c, "(block b (let ((*x* 3)) (return-from b (get-x))))").unwrap();
        assert_eq!(eval_with(&mut c, "*x*").unwrap(), Sexpr::Fixnum(1));
    }

    #[test]
    fn specials_are_restored_after_errors() {
        let mut c = with_special();
        assert!(eval_with(&mut c, "(let ((*x* 4)) (error \"oops\"))").is_err());
        assert!(eval_with(&mut c, "(let* ((*x* 4)) (error \"oops\"))").is_err());
        assert_eq!(eval_with(&mut c, "*x*").unwrap(), Sexpr::Fixnum(1));
    }

    #[test]
    fn local_special_declarations() {
        let mut c = Compiler::default();
        eval_with(&mut c, "(defun get-y () y)").unwrap();
        assert_eq!(
            eval_with(&mut c, "(let ((y 10)) (declare (special y)) (get-y))").unwrap(),
            Sexpr::Fixnum(10)
        );
        assert!(c.host().symbol_value(&Symbol::intern("Y")).is_none());
        assert_eq!(
            eval_with(&mut c, "(let ((z 1)) (locally (declare (special z)) (setq z 2)) z)").unwrap(),
            Sexpr::Fixnum(1)
        );
    }
}
