//! The multiple-value protocol.
//!
//! A call passes the function that should receive its values as the first
//! argument: the ambient `values` when the caller consumes every value, or
//! `internals.pv` when it only needs the primary one. `internals.mv` packages
//! values into a marked array.

use rustc_hash::FxHashMap;

use super::{
    sexpr::Sexpr,
    target::{BinaryOp, Expr, Ident, Stmt, UnaryOp},
    Builtin, CompileError, CompileResult, Compiler, SpecialForm,
};

pub fn define_builtins(table: &mut FxHashMap<&'static str, Builtin>) {
    define_builtin!(table, "VALUES", 0, None, (c, args, mv) {
        if mv {
            Ok(Expr::call(Expr::var("values"), args))
        } else {
            Ok(Expr::internal("pv", args))
        }
    });

    define_builtin!(table, "VALUES-LIST", 1, Some(1), (c, args, mv) {
        let list = args.remove(0);
        Ok(Expr::method(
            c.values_arg(mv),
            "apply",
            vec![Expr::Undefined, Expr::internal("listToArray", vec![list])],
        ))
    });
}

pub fn define_special_forms(table: &mut FxHashMap<&'static str, SpecialForm>) {
    define_compilation!(table, "MULTIPLE-VALUE-CALL", (c, form, args, mv) {
        let Some((function, forms)) = args.split_first() else {
            return Err(CompileError::malformed("multiple-value-call", form));
        };
        let func: Ident = "func".into();
        let argv: Ident = "args".into();
        let vs: Ident = "vs".into();

        let function = c.convert(function, false)?;
        let mut collect = vec![
            Stmt::var("values", Expr::Internal("mv")),
            Stmt::Var(vs.clone(), None),
        ];
        for form in forms {
            collect.push(Stmt::expr(Expr::assign(Expr::Var(vs.clone()), c.convert(form, true)?)));
            let packaged = Expr::binary(
                BinaryOp::And,
                Expr::binary(
                    BinaryOp::And,
                    Expr::binary(
                        BinaryOp::StrictEq,
                        Expr::unary(UnaryOp::Typeof, Expr::Var(vs.clone())),
                        Expr::str("object"),
                    ),
                    Expr::Var(vs.clone()),
                ),
                Expr::binary(BinaryOp::In, Expr::str("multiple-value"), Expr::Var(vs.clone())),
            );
            collect.push(Stmt::If(
                packaged,
                vec![Stmt::expr(Expr::assign(
                    Expr::Var(argv.clone()),
                    Expr::method(Expr::Var(argv.clone()), "concat", vec![Expr::Var(vs.clone())]),
                ))],
                vec![Stmt::expr(Expr::method(
                    Expr::Var(argv.clone()),
                    "push",
                    vec![Expr::Var(vs.clone())],
                ))],
            ));
        }
        collect.push(Stmt::expr(Expr::assign(
            Expr::index(Expr::Var(argv.clone()), Expr::Int(1)),
            Expr::binary(
                BinaryOp::Sub,
                Expr::get(Expr::Var(argv.clone()), "length"),
                Expr::Int(2),
            ),
        )));
        collect.push(Stmt::Return(Expr::method(
            Expr::Var(func.clone()),
            "apply",
            vec![Expr::Undefined, Expr::Var(argv.clone())],
        )));

        Ok(Expr::self_call(vec![
            Stmt::var(func, Expr::internal("coerceFunction", vec![function])),
            Stmt::var(argv, Expr::Array(vec![c.values_arg(mv), Expr::Int(0)])),
            Stmt::Return(Expr::self_call(collect)),
        ]))
    });

    define_compilation!(table, "MULTIPLE-VALUE-PROG1", (c, form, args, mv) {
        let Some((first, rest)) = args.split_first() else {
            return Err(CompileError::malformed("multiple-value-prog1", form));
        };
        let result: Ident = c.gvarname("args");
        let mut stmts = vec![Stmt::var(result.clone(), c.convert(first, mv)?)];
        for form in rest {
            stmts.push(Stmt::expr(c.convert(form, false)?));
        }
        stmts.push(Stmt::Return(Expr::Var(result)));
        Ok(Expr::self_call(stmts))
    });
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
    fn multiple_value_call_spreads_every_value() {
        assert_eq!(
            eval("(multiple-value-call #'list (values 1 2 3) 10)"),
            read("(1 2 3 10)")
        );
        assert_eq!(eval("(multiple-value-call #'list (values) (values))"), Sexpr::nil());
        assert_eq!(eval("(multiple-value-call (lambda (&rest xs) (length xs)) 1 (values 2 3))"), Sexpr::Fixnum(3));
    }

    #[test]
    fn single_value_contexts_take_the_primary_value() {
        assert_eq!(eval("(+ (values 1 2) 10)"), Sexpr::Fixnum(11));
        assert_eq!(eval("(let ((x (values))) x)"), Sexpr::nil());
    }

    #[test]
    fn values_cross_function_boundaries() {
        assert_eq!(
            eval("(defun two () (values 1 2)) (multiple-value-list (two))"),
            read("(1 2)")
        );
        assert_eq!(eval("(defun two () (values 1 2)) (list (two))"), read("(1)"));
    }

    #[test]
    fn prog1_keeps_all_first_values() {
        assert_eq!(
            eval("(multiple-value-list (multiple-value-prog1 (values 1 2) 3))"),
            read("(1 2)")
        );
        assert_eq!(eval("(multiple-value-list (values-list '(4 5)))"), read("(4 5)"));
    }
}
