//! Inline code generators for primitive functions.
//!
//! Arguments arrive compiled. Anything that reads an argument more than once
//! first binds it to a temporary so it is evaluated exactly once, in order.

use rustc_hash::FxHashMap;

use super::{
    sexpr::KEYWORD,
    target::{BinaryOp, Expr, Stmt, UnaryOp},
    Builtin, CompileResult, Compiler,
};

fn is_simple(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Undefined | Expr::Null
    )
}

/// `checkNumber(x)` unless `x` is a numeric constant.
fn number(x: Expr) -> Expr {
    match x {
        Expr::Int(_) | Expr::Float(_) => x,
        _ => Expr::internal("checkNumber", vec![x]),
    }
}

fn numbers(args: Vec<Expr>) -> Vec<Expr> {
    args.into_iter().map(number).collect()
}

/// Binds each non-constant argument to a temporary and hands `build` the
/// resulting simple expressions.
fn with_temps(
    c: &mut Compiler,
    args: Vec<Expr>,
    build: impl FnOnce(&mut Compiler, Vec<Expr>) -> CompileResult<Expr>,
) -> CompileResult<Expr> {
    let mut stmts = vec![];
    let mut simple = Vec::with_capacity(args.len());
    for arg in args {
        if is_simple(&arg) {
            simple.push(arg);
        } else {
            let temp = c.gvarname("x");
            stmts.push(Stmt::var(temp.clone(), arg));
            simple.push(Expr::Var(temp));
        }
    }
    let body = build(c, simple)?;
    if stmts.is_empty() {
        return Ok(body);
    }
    stmts.push(Stmt::Return(body));
    Ok(Expr::self_call(stmts))
}

fn fold(op: BinaryOp, args: Vec<Expr>) -> Expr {
    numbers(args)
        .into_iter()
        .reduce(|acc, x| Expr::binary(op, acc, x))
        .unwrap_or(Expr::Int(0))
}

/// `(op a b c)` as `a op b && b op c`.
fn compare(c: &mut Compiler, op: BinaryOp, args: Vec<Expr>) -> CompileResult<Expr> {
    with_temps(c, numbers(args), |c, xs| {
        let test = xs
            .windows(2)
            .map(|pair| Expr::binary(op, pair[0].clone(), pair[1].clone()))
            .reduce(|acc, test| Expr::binary(BinaryOp::And, acc, test));
        match test {
            Some(test) => c.boolean(test),
            None => c.t(),
        }
    })
}

fn type_of_is(x: Expr, name: &str) -> Expr {
    Expr::binary(BinaryOp::StrictEq, Expr::unary(UnaryOp::Typeof, x), Expr::str(name))
}

fn instance_of(x: Expr, class: &'static str) -> Expr {
    Expr::binary(BinaryOp::InstanceOf, x, Expr::Internal(class))
}

fn first(args: &mut Vec<Expr>) -> Expr {
    args.remove(0)
}

pub fn define_builtins(table: &mut FxHashMap<&'static str, Builtin>) {
    define_builtin!(table, "+", 0, None, (c, args, mv) {
        Ok(fold(BinaryOp::Add, args))
    });

    define_builtin!(table, "-", 1, None, (c, args, mv) {
        if args.len() == 1 {
            return Ok(Expr::unary(UnaryOp::Neg, number(first(&mut args))));
        }
        Ok(fold(BinaryOp::Sub, args))
    });

    define_builtin!(table, "*", 0, None, (c, args, mv) {
        if args.is_empty() {
            return Ok(Expr::Int(1));
        }
        Ok(fold(BinaryOp::Mul, args))
    });

    define_builtin!(table, "/", 1, None, (c, args, mv) {
        if args.len() == 1 {
            return Ok(Expr::binary(BinaryOp::Div, Expr::Int(1), number(first(&mut args))));
        }
        Ok(fold(BinaryOp::Div, args))
    });

    define_builtin!(table, "1+", 1, Some(1), (c, args, mv) {
        Ok(Expr::binary(BinaryOp::Add, number(first(&mut args)), Expr::Int(1)))
    });

    define_builtin!(table, "1-", 1, Some(1), (c, args, mv) {
        Ok(Expr::binary(BinaryOp::Sub, number(first(&mut args)), Expr::Int(1)))
    });

    define_builtin!(table, "MOD", 2, Some(2), (c, args, mv) {
        with_temps(c, numbers(args), |_, xs| {
            let (x, y) = (xs[0].clone(), xs[1].clone());
            let rem = Expr::binary(BinaryOp::Mod, x, y.clone());
            Ok(Expr::binary(
                BinaryOp::Mod,
                Expr::binary(BinaryOp::Add, rem, y.clone()),
                y,
            ))
        })
    });

    define_builtin!(table, "FLOOR", 1, Some(2), (c, args, mv) {
        if args.len() == 1 {
            args.push(Expr::Int(1));
        }
        with_temps(c, numbers(args), |c, xs| {
            let (x, y) = (xs[0].clone(), xs[1].clone());
            let quotient = Expr::internal("floor", vec![x.clone(), y.clone()]);
            if !mv {
                return Ok(quotient);
            }
            let q = c.gvarname("q");
            let remainder = Expr::binary(
                BinaryOp::Sub,
                x,
                Expr::binary(BinaryOp::Mul, Expr::Var(q.clone()), y),
            );
            Ok(Expr::self_call(vec![
                Stmt::var(q.clone(), quotient),
                Stmt::Return(Expr::call(Expr::var("values"), vec![Expr::Var(q), remainder])),
            ]))
        })
    });

    define_builtin!(table, "<", 1, None, (c, args, mv) {
        compare(c, BinaryOp::Lt, args)
    });
    define_builtin!(table, ">", 1, None, (c, args, mv) {
        compare(c, BinaryOp::Gt, args)
    });
    define_builtin!(table, "<=", 1, None, (c, args, mv) {
        compare(c, BinaryOp::Le, args)
    });
    define_builtin!(table, ">=", 1, None, (c, args, mv) {
        compare(c, BinaryOp::Ge, args)
    });
    define_builtin!(table, "=", 1, None, (c, args, mv) {
        compare(c, BinaryOp::StrictEq, args)
    });
    define_builtin!(table, "/=", 1, Some(2), (c, args, mv) {
        compare(c, BinaryOp::StrictNe, args)
    });

    define_builtin!(table, "NUMBERP", 1, Some(1), (c, args, mv) {
        c.boolean(type_of_is(first(&mut args), "number"))
    });

    define_builtin!(table, "CONS", 2, Some(2), (c, args, mv) {
        Ok(Expr::new_object(Expr::Internal("Cons"), args))
    });

    define_builtin!(table, "CAR", 1, Some(1), (c, args, mv) {
        with_temps(c, args, |c, xs| {
            let nil = c.nil()?;
            let x = xs[0].clone();
            Ok(Expr::cond(
                Expr::binary(BinaryOp::StrictEq, x.clone(), nil.clone()),
                nil,
                Expr::get(x, "car"),
            ))
        })
    });

    define_builtin!(table, "CDR", 1, Some(1), (c, args, mv) {
        with_temps(c, args, |c, xs| {
            let nil = c.nil()?;
            let x = xs[0].clone();
            Ok(Expr::cond(
                Expr::binary(BinaryOp::StrictEq, x.clone(), nil.clone()),
                nil,
                Expr::get(x, "cdr"),
            ))
        })
    });

    define_builtin!(table, "RPLACA", 2, Some(2), (c, args, mv) {
        with_temps(c, args, |_, xs| {
            Ok(Expr::progn(vec![
                Expr::assign(Expr::get(xs[0].clone(), "car"), xs[1].clone()),
                xs[0].clone(),
            ]))
        })
    });

    define_builtin!(table, "RPLACD", 2, Some(2), (c, args, mv) {
        with_temps(c, args, |_, xs| {
            Ok(Expr::progn(vec![
                Expr::assign(Expr::get(xs[0].clone(), "cdr"), xs[1].clone()),
                xs[0].clone(),
            ]))
        })
    });

    define_builtin!(table, "CONSP", 1, Some(1), (c, args, mv) {
        c.boolean(instance_of(first(&mut args), "Cons"))
    });

    define_builtin!(table, "ATOM", 1, Some(1), (c, args, mv) {
        c.boolean(Expr::not(instance_of(first(&mut args), "Cons")))
    });

    define_builtin!(table, "NULL", 1, Some(1), (c, args, mv) {
        let nil = c.nil()?;
        c.boolean(Expr::binary(BinaryOp::StrictEq, first(&mut args), nil))
    });

    define_builtin!(table, "NOT", 1, Some(1), (c, args, mv) {
        let nil = c.nil()?;
        c.boolean(Expr::binary(BinaryOp::StrictEq, first(&mut args), nil))
    });

    define_builtin!(table, "LIST", 0, None, (c, args, mv) {
        if args.is_empty() {
            return c.nil();
        }
        args.push(c.nil()?);
        Ok(Expr::internal("QIList", args))
    });

    define_builtin!(table, "LIST*", 1, None, (c, args, mv) {
        if args.len() == 1 {
            return Ok(first(&mut args));
        }
        Ok(Expr::internal("QIList", args))
    });

    define_builtin!(table, "APPEND", 0, None, (c, args, mv) {
        if args.is_empty() {
            return c.nil();
        }
        Ok(Expr::internal("append", args))
    });

    define_builtin!(table, "EQ", 2, Some(2), (c, args, mv) {
        let x = first(&mut args);
        c.boolean(Expr::binary(BinaryOp::StrictEq, x, first(&mut args)))
    });

    define_builtin!(table, "EQL", 2, Some(2), (c, args, mv) {
        let x = first(&mut args);
        c.boolean(Expr::binary(BinaryOp::StrictEq, x, first(&mut args)))
    });

    define_builtin!(table, "SYMBOLP", 1, Some(1), (c, args, mv) {
        c.boolean(instance_of(first(&mut args), "Symbol"))
    });

    define_builtin!(table, "KEYWORDP", 1, Some(1), (c, args, mv) {
        with_temps(c, args, |c, xs| {
            let x = xs[0].clone();
            c.boolean(Expr::binary(
                BinaryOp::And,
                instance_of(x.clone(), "Symbol"),
                Expr::binary(BinaryOp::StrictEq, Expr::get(x, "package"), Expr::str(KEYWORD)),
            ))
        })
    });

    define_builtin!(table, "MAKE-SYMBOL", 1, Some(1), (c, args, mv) {
        Ok(Expr::new_object(Expr::Internal("Symbol"), args))
    });

    define_builtin!(table, "SYMBOL-NAME", 1, Some(1), (c, args, mv) {
        Ok(Expr::get(first(&mut args), "name"))
    });

    define_builtin!(table, "SYMBOL-VALUE", 1, Some(1), (c, args, mv) {
        Ok(Expr::internal("symbolValue", args))
    });

    define_builtin!(table, "SET", 2, Some(2), (c, args, mv) {
        let symbol = first(&mut args);
        Ok(Expr::assign(Expr::get(symbol, "value"), first(&mut args)))
    });

    define_builtin!(table, "SYMBOL-FUNCTION", 1, Some(1), (c, args, mv) {
        Ok(Expr::internal("symbolFunction", args))
    });

    define_builtin!(table, "FSET", 2, Some(2), (c, args, mv) {
        let symbol = first(&mut args);
        Ok(Expr::assign(Expr::get(symbol, "fvalue"), first(&mut args)))
    });

    define_builtin!(table, "BOUNDP", 1, Some(1), (c, args, mv) {
        c.boolean(Expr::binary(
            BinaryOp::StrictNe,
            Expr::get(first(&mut args), "value"),
            Expr::Undefined,
        ))
    });

    define_builtin!(table, "FBOUNDP", 1, Some(1), (c, args, mv) {
        c.boolean(Expr::binary(
            BinaryOp::StrictNe,
            Expr::get(first(&mut args), "fvalue"),
            Expr::Undefined,
        ))
    });

    define_builtin!(table, "FUNCALL", 1, None, (c, args, mv) {
        let function = Expr::internal("coerceFunction", vec![first(&mut args)]);
        let mut call_args = vec![c.values_arg(mv), Expr::Int(args.len() as i64)];
        call_args.extend(args);
        Ok(Expr::call(function, call_args))
    });

    define_builtin!(table, "APPLY", 2, None, (c, args, mv) {
        args.insert(0, c.values_arg(mv));
        Ok(Expr::internal("apply", args))
    });

    define_builtin!(table, "FUNCTIONP", 1, Some(1), (c, args, mv) {
        c.boolean(type_of_is(first(&mut args), "function"))
    });

    define_builtin!(table, "CHARACTERP", 1, Some(1), (c, args, mv) {
        with_temps(c, args, |c, xs| {
            let x = xs[0].clone();
            c.boolean(Expr::binary(
                BinaryOp::And,
                type_of_is(x.clone(), "string"),
                Expr::binary(BinaryOp::StrictEq, Expr::get(x, "length"), Expr::Int(1)),
            ))
        })
    });

    define_builtin!(table, "CHAR-CODE", 1, Some(1), (c, args, mv) {
        Ok(Expr::internal("charCode", args))
    });

    define_builtin!(table, "CODE-CHAR", 1, Some(1), (c, args, mv) {
        Ok(Expr::internal("codeChar", args))
    });

    define_builtin!(table, "STRINGP", 1, Some(1), (c, args, mv) {
        c.boolean(type_of_is(first(&mut args), "string"))
    });

    define_builtin!(table, "MAKE-STORAGE-VECTOR", 1, Some(1), (c, args, mv) {
        Ok(Expr::internal("newArray", args))
    });

    define_builtin!(table, "STORAGE-VECTOR-SIZE", 1, Some(1), (c, args, mv) {
        Ok(Expr::get(first(&mut args), "length"))
    });

    define_builtin!(table, "STORAGE-VECTOR-REF", 2, Some(2), (c, args, mv) {
        Ok(Expr::internal("storageRef", args))
    });

    define_builtin!(table, "STORAGE-VECTOR-SET", 3, Some(3), (c, args, mv) {
        Ok(Expr::internal("storageSet", args))
    });

    define_builtin!(table, "OGET", 1, None, (c, args, mv) {
        let object = first(&mut args);
        Ok(args.into_iter().fold(object, Expr::index))
    });

    define_builtin!(table, "OSET", 2, None, (c, args, mv) {
        let value = first(&mut args);
        let object = first(&mut args);
        let Some(last) = args.pop() else {
            return Ok(value);
        };
        let place = Expr::index(args.into_iter().fold(object, Expr::index), last);
        Ok(Expr::assign(place, value))
    });

    define_builtin!(table, "NEW", 0, Some(0), (c, args, mv) {
        Ok(Expr::Object(vec![]))
    });

    define_builtin!(table, "IN", 2, Some(2), (c, args, mv) {
        let key = first(&mut args);
        c.boolean(Expr::binary(BinaryOp::In, key, first(&mut args)))
    });

    define_builtin!(table, "ERROR", 1, None, (c, args, mv) {
        Ok(Expr::internal("error", args))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::{
            sexpr::Sexpr,
            test_reader::{read, read_all},
            CompileError,
        },
        runtime::{ConditionKind, HostError},
    };

    fn eval(src: &str) -> CompileResult<Sexpr> {
        let mut c = Compiler::default();
        let mut result = Sexpr::nil();
        for form in read_all(src) {
            result = c.eval(&form)?;
        }
        Ok(result)
    }

    fn value(src: &str) -> Sexpr {
        eval(src).unwrap()
    }

    fn condition(src: &str) -> ConditionKind {
        match eval(src) {
            Err(CompileError::Host(HostError::Condition { kind, .. })) => kind,
            other => panic!("expected a condition from {}, got {:?}", src, other),
        }
    }

    #[test]
    fn arithmetic() {
        assert_eq!(value("(+ 1 2 3)"), Sexpr::Fixnum(6));
        assert_eq!(value("(+)"), Sexpr::Fixnum(0));
        assert_eq!(value("(*)"), Sexpr::Fixnum(1));
        assert_eq!(value("(- 10)"), Sexpr::Fixnum(-10));
        assert_eq!(value("(- 10 1 2)"), Sexpr::Fixnum(7));
        assert_eq!(value("(/ 12 2 3)"), Sexpr::Fixnum(2));
        assert_eq!(value("(1+ (1- 5))"), Sexpr::Fixnum(5));
        assert_eq!(value("(mod -7 3)"), Sexpr::Fixnum(2));
        assert_eq!(value("(floor 7 2)"), Sexpr::Fixnum(3));
        assert_eq!(value("(floor -7 2)"), Sexpr::Fixnum(-4));
        assert_eq!(value("(multiple-value-list (floor 7 2))"), read("(3 1)"));
    }

    #[test]
    fn arithmetic_checks_operands() {
        assert_eq!(condition("(+ 1 'a)"), ConditionKind::TypeError);
        assert_eq!(condition("(< 1 \"x\")"), ConditionKind::TypeError);
    }

    #[test]
    fn comparisons_chain() {
        assert_eq!(value("(< 1 2 3)"), Sexpr::t());
        assert_eq!(value("(< 1 3 2)"), Sexpr::nil());
        assert_eq!(value("(= 2 2)"), Sexpr::t());
        assert_eq!(value("(/= 1 2)"), Sexpr::t());
        assert_eq!(value("(>= 3 3 1)"), Sexpr::t());
    }

    #[test]
    fn list_operations() {
        assert_eq!(value("(car nil)"), Sexpr::nil());
        assert_eq!(value("(cdr '(1 2))"), read("(2)"));
        assert_eq!(value("(cons 1 2)"), read("(1 . 2)"));
        assert_eq!(value("(list* 1 2 '(3))"), read("(1 2 3)"));
        assert_eq!(value("(append '(1) '(2) '(3 4))"), read("(1 2 3 4)"));
        assert_eq!(value("(let ((x (list 1 2))) (rplaca x 0) x)"), read("(0 2)"));
        assert_eq!(value("(list (consp '(1)) (atom 1) (null nil) (not 1))"), read("(t t t nil)"));
    }

    #[test]
    fn symbols_and_functions() {
        assert_eq!(value("(symbol-name 'foo)"), Sexpr::string("FOO"));
        assert_eq!(value("(list (keywordp :a) (keywordp 'a) (symbolp 'a) (eq 'a 'a))"), read("(t nil t t)"));
        assert_eq!(value("(funcall (lambda (x y) (+ x y)) 1 2)"), Sexpr::Fixnum(3));
        assert_eq!(value("(apply #'list 1 '(2 3))"), read("(1 2 3)"));
        assert_eq!(value("(progn (fset 'f (lambda () 9)) (list (fboundp 'f) (boundp 'f) (f)))"), read("(t nil 9)"));
        assert_eq!(condition("(undefined-function-here)"), ConditionKind::UndefinedFunction);
    }

    #[test]
    fn storage_vectors_and_objects() {
        assert_eq!(
            value("(let ((v (make-storage-vector 2))) (storage-vector-set v 0 'a) (list (storage-vector-size v) (storage-vector-ref v 0)))"),
            read("(2 a)")
        );
        assert_eq!(condition("(storage-vector-ref (make-storage-vector 1) 5)"), ConditionKind::OutOfRange);
        assert_eq!(value("(let ((o (new))) (oset 5 o \"x\") (list (oget o \"x\") (in \"x\" o)))"), read("(5 t)"));
    }

    #[test]
    fn characters() {
        assert_eq!(value("(char-code #\\a)"), Sexpr::Fixnum(97));
        assert_eq!(value("(char-code (code-char 98))"), Sexpr::Fixnum(98));
        assert_eq!(value("(characterp #\\a)"), Sexpr::t());
    }

    #[test]
    fn error_signals_a_condition() {
        assert_eq!(condition("(error \"boom\")"), ConditionKind::SimpleError);
    }
}
