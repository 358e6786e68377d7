//! Non-local transfer: `block`/`return-from`, `catch`/`throw`,
//! `tagbody`/`go` and `unwind-protect`.
//!
//! Every transfer throws a marker object; handlers compare the marker's
//! identity token with their own and rethrow anything else. Block and
//! tagbody tokens are fresh arrays, so each activation is distinct.

use rustc_hash::FxHashMap;

use super::{
    env::{Binding, BindingKind, BindingValue, Declarations, Namespace},
    sexpr::{Sexpr, Symbol},
    target::{BinaryOp, Expr, Ident, Stmt, SwitchCase},
    CompileError, CompileResult, Compiler, SpecialForm,
};

/// `marker instanceof internals.<class> && marker.id === id`
fn marker_matches(marker: &Ident, class: &'static str, id: Expr) -> Expr {
    Expr::binary(
        BinaryOp::And,
        Expr::binary(
            BinaryOp::InstanceOf,
            Expr::Var(marker.clone()),
            Expr::Internal(class),
        ),
        Expr::binary(BinaryOp::StrictEq, Expr::get(Expr::Var(marker.clone()), "id"), id),
    )
}

/// `values.apply(undefined, forcemv(marker.values))`
fn forward_values(values: Expr, marker: &Ident) -> Expr {
    Expr::method(
        values,
        "apply",
        vec![
            Expr::Undefined,
            Expr::internal("forcemv", vec![Expr::get(Expr::Var(marker.clone()), "values")]),
        ],
    )
}

/// Go tags are symbols or integers. Integer tags live in their own package
/// so they cannot collide with symbols.
fn go_tag(form: &Sexpr) -> Option<Symbol> {
    match form {
        Sexpr::Symbol(sym) => Some(sym.clone()),
        Sexpr::Fixnum(n) => Some(Symbol::intern_in(&n.to_string(), "%GO-TAG")),
        _ => None,
    }
}

impl Compiler {
    fn compile_tagbody(&mut self, body: &[Sexpr], wants_values: bool) -> CompileResult<Expr> {
        if !body.iter().any(|form| go_tag(form).is_some()) {
            let mut forms = body.to_vec();
            forms.push(Sexpr::nil());
            return self.convert_progn(&forms, wants_values);
        }

        let mut body = body.to_vec();
        if go_tag(&body[0]).is_none() {
            body.insert(0, Sexpr::Symbol(self.gensym("START")));
        }

        let branch = self.gvarname("branch");
        let tbidx = self.gvarname("tbidx");
        let bindings = body
            .iter()
            .filter_map(go_tag)
            .map(|tag| {
                self.go_tag_counter += 1;
                Binding::new(
                    tag,
                    Namespace::GoTag,
                    BindingKind::GoTag,
                    BindingValue::Tag {
                        scope: tbidx.clone(),
                        label: self.go_tag_counter,
                    },
                )
            })
            .collect::<Vec<_>>();
        let initial = match bindings.first().map(|b| b.value()) {
            Some(BindingValue::Tag { label, .. }) => label,
            _ => return Err(CompileError::malformed("tagbody", &Sexpr::list(&body))),
        };

        let env = self.env.extend(bindings, Namespace::GoTag);
        self.with_env(env, |c| {
            let mut cases: Vec<SwitchCase> = vec![];
            for form in &body {
                match go_tag(form) {
                    Some(tag) => {
                        let label = match c.env.lookup(&tag, Namespace::GoTag).map(|b| b.value()) {
                            Some(BindingValue::Tag { label, .. }) => label,
                            _ => return Err(CompileError::UnknownGoTag { tag: tag.to_string() }),
                        };
                        cases.push(SwitchCase {
                            test: Some(Expr::Int(label as i64)),
                            body: vec![],
                        });
                    }
                    None => {
                        let code = c.convert(form, false)?;
                        if let Some(case) = cases.last_mut() {
                            case.body.push(Stmt::expr(code));
                        }
                    }
                }
            }
            cases.push(SwitchCase {
                test: None,
                body: vec![Stmt::Break(Some("tbloop".into()))],
            });

            let jump: Ident = "jump".into();
            let dispatch = Stmt::try_catch(
                vec![Stmt::Switch(Expr::Var(branch.clone()), cases)],
                jump.clone(),
                vec![Stmt::If(
                    marker_matches(&jump, "TagNLX", Expr::Var(tbidx.clone())),
                    vec![Stmt::expr(Expr::assign(
                        Expr::Var(branch.clone()),
                        Expr::get(Expr::Var(jump.clone()), "label"),
                    ))],
                    vec![Stmt::Throw(Expr::Var(jump))],
                )],
            );

            Ok(Expr::self_call(vec![
                Stmt::var(branch.clone(), Expr::Int(initial as i64)),
                Stmt::var(tbidx.clone(), Expr::Array(vec![])),
                Stmt::Label(
                    "tbloop".into(),
                    Box::new(Stmt::While(Expr::Bool(true), vec![dispatch])),
                ),
                Stmt::Return(c.nil()?),
            ]))
        })
    }
}

pub fn define_special_forms(table: &mut FxHashMap<&'static str, SpecialForm>) {
    define_compilation!(table, "BLOCK", (c, form, args, mv) {
        let Some((Sexpr::Symbol(name), body)) = args.split_first() else {
            return Err(CompileError::malformed("block", form));
        };
        let id = c.gvarname(name.name());
        let binding = Binding::new(
            name.clone(),
            Namespace::Block,
            BindingKind::Block,
            BindingValue::Ident(id.clone()),
        );
        if mv {
            binding.declare(Declarations::MULTIPLE_VALUE);
        }

        let env = c.env.extend([binding.clone()], Namespace::Block);
        let code = c.with_env(env, |c| c.convert_block(body, true, mv))?;

        if !binding.has(Declarations::USED) {
            return Ok(Expr::self_call(code));
        }

        let mut try_body = vec![Stmt::var(id.clone(), Expr::Array(vec![]))];
        try_body.extend(code);
        let cf: Ident = "cf".into();
        let result = if mv {
            forward_values(Expr::var("values"), &cf)
        } else {
            Expr::get(Expr::Var(cf.clone()), "values")
        };
        Ok(Expr::self_call(vec![Stmt::try_catch(
            try_body,
            cf.clone(),
            vec![Stmt::If(
                marker_matches(&cf, "BlockNLX", Expr::Var(id)),
                vec![Stmt::Return(result)],
                vec![Stmt::Throw(Expr::Var(cf))],
            )],
        )]))
    });

    define_compilation!(table, "RETURN-FROM", (c, form, args, mv) {
        let (name, value) = match args {
            [Sexpr::Symbol(name)] => (name, Sexpr::nil()),
            [Sexpr::Symbol(name), value] => (name, value.clone()),
            _ => return Err(CompileError::malformed("return-from", form)),
        };
        let binding = c
            .env
            .lookup(name, Namespace::Block)
            .ok_or_else(|| CompileError::UnknownBlock { name: name.to_string() })?;
        let Some(id) = binding.ident() else {
            return Err(CompileError::UnknownBlock { name: name.to_string() });
        };
        binding.declare(Declarations::USED);

        let multiple_values = binding.has(Declarations::MULTIPLE_VALUE);
        let mut stmts = vec![];
        if multiple_values {
            stmts.push(Stmt::var("values", Expr::Internal("mv")));
        }
        let value = c.convert(&value, multiple_values)?;
        stmts.push(Stmt::Throw(Expr::new_object(
            Expr::Internal("BlockNLX"),
            vec![Expr::Var(id), value, Expr::str(name.name())],
        )));
        Ok(Expr::self_call(stmts))
    });

    define_compilation!(table, "CATCH", (c, form, args, mv) {
        let Some((tag, body)) = args.split_first() else {
            return Err(CompileError::malformed("catch", form));
        };
        let id = c.gvarname("id");
        let tag = c.convert(tag, false)?;
        let code = c.convert_block(body, true, mv)?;
        let cf: Ident = "cf".into();
        let values = c.values_arg(mv);
        Ok(Expr::self_call(vec![
            Stmt::var(id.clone(), tag),
            Stmt::try_catch(
                code,
                cf.clone(),
                vec![Stmt::If(
                    marker_matches(&cf, "CatchNLX", Expr::Var(id)),
                    vec![Stmt::Return(forward_values(values, &cf))],
                    vec![Stmt::Throw(Expr::Var(cf))],
                )],
            ),
        ]))
    });

    define_compilation!(table, "THROW", (c, form, args, mv) {
        let [tag, value] = args else {
            return Err(CompileError::malformed("throw", form));
        };
        let tag = c.convert(tag, false)?;
        let value = c.convert(value, true)?;
        Ok(Expr::self_call(vec![
            Stmt::var("values", Expr::Internal("mv")),
            Stmt::Throw(Expr::new_object(Expr::Internal("CatchNLX"), vec![tag, value])),
        ]))
    });

    define_compilation!(table, "TAGBODY", (c, form, args, mv) {
        c.compile_tagbody(args, mv)
    });

    define_compilation!(table, "GO", (c, form, args, mv) {
        let [tag] = args else {
            return Err(CompileError::malformed("go", form));
        };
        let binding = go_tag(tag).and_then(|tag| c.env.lookup(&tag, Namespace::GoTag));
        let Some(BindingValue::Tag { scope, label }) = binding.map(|b| b.value()) else {
            return Err(CompileError::UnknownGoTag { tag: tag.to_string() });
        };
        Ok(Expr::self_call(vec![Stmt::Throw(Expr::new_object(
            Expr::Internal("TagNLX"),
            vec![Expr::Var(scope), Expr::Int(label as i64)],
        ))]))
    });

    define_compilation!(table, "UNWIND-PROTECT", (c, form, args, mv) {
        let Some((protected, cleanup)) = args.split_first() else {
            return Err(CompileError::malformed("unwind-protect", form));
        };
        let ret = c.gvarname("ret");
        let nil = c.nil()?;
        let protected = c.convert(protected, mv)?;
        let cleanup = c.convert_block(cleanup, false, false)?;
        Ok(Expr::self_call(vec![
            Stmt::var(ret.clone(), nil),
            Stmt::try_finally(
                vec![Stmt::expr(Expr::assign(Expr::Var(ret.clone()), protected))],
                cleanup,
            ),
            Stmt::Return(Expr::Var(ret)),
        ]))
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

    fn eval(src: &str) -> Sexpr {
        eval_with(&mut Compiler::default(), src).unwrap()
    }

    #[test]
    fn return_from_leaves_the_block() {
        assert_eq!(eval("(block b (return-from b 1) 2)"), Sexpr::Fixnum(1));
        assert_eq!(eval("(block b 2)"), Sexpr::Fixnum(2));
        assert_eq!(eval("(block b (return-from b))"), Sexpr::nil());
    }

    #[test]
    fn each_activation_has_its_own_block() {
        let src = "
            (defun call-it (g n)
              (block b
                (if (= n 0)
                    (funcall g)
                    (list n (call-it (lambda () (return-from b n)) (- n 1))))))
            (call-it nil 2)";
        assert_eq!(eval(src), read("(2 1)"));
    }

    #[test]
    fn unused_blocks_have_no_handler() {
        let mut c = Compiler::default();
        let code = c.convert(&read("(block b 1)"), false).unwrap();
        assert!(!code.to_string().contains("BlockNLX"));
    }

    #[test]
    fn backward_go_repeats_forms() {
        let src = "
            (let ((i 0) (acc nil))
              (tagbody
               top
                 (setq acc (cons i acc))
                 (setq i (+ i 1))
                 (if (< i 3) (go top)))
              acc)";
        assert_eq!(eval(src), read("(2 1 0)"));
    }

    #[test]
    fn tagbody_returns_nil() {
        assert_eq!(eval("(tagbody a 1 b 2)"), Sexpr::nil());
        assert_eq!(eval("(tagbody (+ 1 2))"), Sexpr::nil());
        assert_eq!(eval("(let ((x 0)) (tagbody (go 10) (setq x 1) 10 (setq x (+ x 2))) x)"), Sexpr::Fixnum(2));
    }

    #[test]
    fn go_leaves_nested_functions() {
        let src = "
            (let ((n 0))
              (tagbody
               again
                 (setq n (+ n 1))
                 (funcall (lambda () (if (< n 5) (go again)))))
              n)";
        assert_eq!(eval(src), Sexpr::Fixnum(5));
    }

    #[test]
    fn catch_receives_thrown_values() {
        assert_eq!(eval("(catch 'k (throw 'k 5) 6)"), Sexpr::Fixnum(5));
        assert_eq!(eval("(catch 'k 6)"), Sexpr::Fixnum(6));
        assert_eq!(
            eval("(multiple-value-list (catch 'k (throw 'k (values 1 2))))"),
            read("(1 2)")
        );
        assert_eq!(eval("(catch 'outer (catch 'inner (throw 'outer 1)) 2)"), Sexpr::Fixnum(1));
    }

    #[test]
    fn cleanup_runs_on_every_exit() {
        assert_eq!(
            eval("(let ((x 0)) (block b (unwind-protect (return-from b 1) (setq x 2))) x)"),
            Sexpr::Fixnum(2)
        );
        assert_eq!(eval("(let ((x 0)) (unwind-protect (setq x 1) (setq x (+ x 10))) x)"), Sexpr::Fixnum(11));

        let mut c = Compiler::default();
        eval_with(&mut c, "(defvar *log* nil)").unwrap();
        assert!(eval_with(&mut c, "(unwind-protect (error \"boom\") (setq *log* 'cleaned))").is_err());
        assert_eq!(eval_with(&mut c, "*log*").unwrap(), Sexpr::symbol("CLEANED"));
    }

    #[test]
    fn unknown_targets_are_compile_errors() {
        let mut c = Compiler::default();
        assert!(matches!(
            c.convert(&read("(return-from nowhere 1)"), false),
            Err(CompileError::UnknownBlock { .. })
        ));
        assert!(matches!(
            c.convert(&read("(tagbody a (go b))"), false),
            Err(CompileError::UnknownGoTag { .. })
        ));
    }
}
