//! Macros implemented in Rust.
//!
//! These are installed into the global function namespace of every new
//! [`Compiler`] and can be shadowed by `macrolet`, `flet` or a later global
//! `defmacro`/`defun` of the same name.

use once_cell::sync::Lazy;

use super::{
    env::{Binding, BindingKind, BindingValue, Environment, Macro, Namespace, NativeExpander},
    sexpr::{Sexpr, Symbol},
    CompileError, CompileResult, Compiler,
};

fn sym(name: &str) -> Sexpr {
    Sexpr::symbol(name)
}

/// `(head . tail)`
fn form(head: &str, tail: &[Sexpr]) -> Sexpr {
    Sexpr::cons(sym(head), Sexpr::list(tail))
}

fn list_of(operator: &str, whole: &Sexpr, list: &Sexpr) -> CompileResult<Vec<Sexpr>> {
    list.list_to_vec()
        .ok_or_else(|| CompileError::malformed(operator, whole))
}

/// The `(name lambda-list . body)` shared by `defun` and `defmacro`.
fn definition<'a>(operator: &str, whole: &Sexpr, args: &'a [Sexpr]) -> CompileResult<(&'a Sexpr, &'a Sexpr, &'a [Sexpr])> {
    match args {
        [name @ Sexpr::Symbol(_), lambda_list, body @ ..] => Ok((name, lambda_list, body)),
        _ => Err(CompileError::malformed(operator, whole)),
    }
}

fn named_lambda(name: &Sexpr, lambda_list: &Sexpr, body: &[Sexpr]) -> Sexpr {
    let mut parts = vec![name.clone(), lambda_list.clone()];
    parts.extend_from_slice(body);
    form("FUNCTION", &[form("NAMED-LAMBDA", &parts)])
}

/// Splits declarations off `body` and returns `((declare . decls))` ready to
/// splice into a `let`.
fn split_declarations(c: &Compiler, body: &[Sexpr]) -> CompileResult<(Vec<Sexpr>, Vec<Sexpr>)> {
    let (body, decls, _) = c.parse_body(body, false)?;
    let declare = if decls.is_empty() {
        vec![]
    } else {
        vec![form("DECLARE", &decls)]
    };
    Ok((body, declare))
}

fn let_form(bindings: Vec<Sexpr>, declare: Vec<Sexpr>, body: Vec<Sexpr>) -> Sexpr {
    let mut parts = vec![Sexpr::list(&bindings)];
    parts.extend(declare);
    parts.extend(body);
    form("LET", &parts)
}

fn backquote(form_: &Sexpr) -> CompileResult<Sexpr> {
    match form_ {
        Sexpr::Symbol(_) | Sexpr::Vector(_) => Ok(Sexpr::quote(form_.clone())),
        Sexpr::Pair(_) if form_.is_form("UNQUOTE") => unquoted(form_),
        Sexpr::Pair(_) if form_.is_form("UNQUOTE-SPLICING") => {
            Err(CompileError::malformed("backquote", form_))
        }
        Sexpr::Pair(_) if form_.is_form("BACKQUOTE") => Ok(Sexpr::quote(form_.clone())),
        Sexpr::Pair(_) => {
            let mut segments = vec![];
            let mut group = vec![];
            let mut rest = form_.clone();
            let tail = loop {
                if rest.is_form("UNQUOTE") {
                    break Some(unquoted(&rest)?);
                }
                let Sexpr::Pair(pair) = &rest else {
                    break if rest.is_null() {
                        None
                    } else {
                        Some(Sexpr::quote(rest.clone()))
                    };
                };
                let (item, next) = (pair.0.clone(), pair.1.clone());
                if item.is_form("UNQUOTE-SPLICING") {
                    if !group.is_empty() {
                        segments.push(form("LIST", &std::mem::take(&mut group)));
                    }
                    segments.push(unquoted(&item)?);
                } else {
                    group.push(backquote(&item)?);
                }
                rest = next;
            };

            if segments.is_empty() {
                return Ok(match tail {
                    None => form("LIST", &group),
                    Some(tail) => {
                        group.push(tail);
                        form("LIST*", &group)
                    }
                });
            }
            if !group.is_empty() {
                segments.push(form("LIST", &group));
            }
            segments.push(tail.unwrap_or_else(Sexpr::nil));
            Ok(form("APPEND", &segments))
        }
        _ => Ok(form_.clone()),
    }
}

fn unquoted(form_: &Sexpr) -> CompileResult<Sexpr> {
    match form_.list_to_vec().as_deref() {
        Some([_, x]) => Ok(x.clone()),
        _ => Err(CompileError::malformed("unquote", form_)),
    }
}

/// Expanders of `(incf place delta)` and `(decf place delta)`.
fn modify(operator: &str, op: &str, whole: &Sexpr, args: &[Sexpr]) -> CompileResult<Sexpr> {
    let (place, delta) = match args {
        [place @ Sexpr::Symbol(_)] => (place, Sexpr::Fixnum(1)),
        [place @ Sexpr::Symbol(_), delta] => (place, delta.clone()),
        _ => return Err(CompileError::malformed(operator, whole)),
    };
    Ok(form("SETQ", &[place.clone(), form(op, &[place.clone(), delta])]))
}

pub static NATIVE_MACROS: Lazy<Vec<(&'static str, NativeExpander)>> = Lazy::new(|| {
    let mut table = vec![];

    define_macro!(table, "DEFMACRO", (c, whole, args) {
        let (name, lambda_list, body) = definition("defmacro", whole, args)?;
        let expander = named_lambda(name, lambda_list, body);
        Ok(form("EVAL-WHEN", &[
            Sexpr::list(&[Sexpr::keyword("COMPILE-TOPLEVEL"), Sexpr::keyword("EXECUTE")]),
            form("%COMPILE-DEFMACRO", &[Sexpr::quote(name.clone()), Sexpr::quote(expander)]),
        ]))
    });

    define_macro!(table, "DEFUN", (c, whole, args) {
        let (name, lambda_list, body) = definition("defun", whole, args)?;
        if let Some(symbol) = name.as_symbol() {
            c.note_defined(symbol);
            let shadows_macro = c
                .env
                .lookup_global(symbol, Namespace::Function)
                .is_some_and(|binding| binding.kind() == BindingKind::Macro);
            if shadows_macro {
                c.env.remove_global(symbol, Namespace::Function);
            }
        }
        Ok(form("PROGN", &[
            form("FSET", &[Sexpr::quote(name.clone()), named_lambda(name, lambda_list, body)]),
            Sexpr::quote(name.clone()),
        ]))
    });

    define_macro!(table, "DEFVAR", (c, whole, args) {
        let (name, value) = match args {
            [name @ Sexpr::Symbol(_)] => (name, None),
            [name @ Sexpr::Symbol(_), value] | [name @ Sexpr::Symbol(_), value, Sexpr::String(_)] => {
                (name, Some(value))
            }
            _ => return Err(CompileError::malformed("defvar", whole)),
        };
        let mut body = vec![form("DECLAIM", &[form("SPECIAL", &[name.clone()])])];
        if let Some(value) = value {
            body.push(form("UNLESS", &[
                form("BOUNDP", &[Sexpr::quote(name.clone())]),
                form("SETQ", &[name.clone(), value.clone()]),
            ]));
        }
        body.push(Sexpr::quote(name.clone()));
        Ok(form("PROGN", &body))
    });

    define_macro!(table, "DEFPARAMETER", (c, whole, args) {
        let (name, value) = match args {
            [name @ Sexpr::Symbol(_), value] | [name @ Sexpr::Symbol(_), value, Sexpr::String(_)] => (name, value),
            _ => return Err(CompileError::malformed("defparameter", whole)),
        };
        Ok(form("PROGN", &[
            form("DECLAIM", &[form("SPECIAL", &[name.clone()])]),
            form("SETQ", &[name.clone(), value.clone()]),
            Sexpr::quote(name.clone()),
        ]))
    });

    define_macro!(table, "DEFCONSTANT", (c, whole, args) {
        let (name, value) = match args {
            [name @ Sexpr::Symbol(_), value] | [name @ Sexpr::Symbol(_), value, Sexpr::String(_)] => (name, value),
            _ => return Err(CompileError::malformed("defconstant", whole)),
        };
        Ok(form("PROGN", &[
            form("DECLAIM", &[form("SPECIAL", &[name.clone()])]),
            form("SETQ", &[name.clone(), value.clone()]),
            form("DECLAIM", &[form("CONSTANT", &[name.clone()])]),
            Sexpr::quote(name.clone()),
        ]))
    });

    define_macro!(table, "LAMBDA", (c, whole, args) {
        if args.is_empty() {
            return Err(CompileError::malformed("lambda", whole));
        }
        Ok(form("FUNCTION", &[form("LAMBDA", args)]))
    });

    define_macro!(table, "NAMED-LAMBDA", (c, whole, args) {
        if args.len() < 2 {
            return Err(CompileError::malformed("named-lambda", whole));
        }
        Ok(form("FUNCTION", &[form("NAMED-LAMBDA", args)]))
    });

    define_macro!(table, "WHEN", (c, whole, args) {
        let Some((test, body)) = args.split_first() else {
            return Err(CompileError::malformed("when", whole));
        };
        Ok(form("IF", &[test.clone(), form("PROGN", body)]))
    });

    define_macro!(table, "UNLESS", (c, whole, args) {
        let Some((test, body)) = args.split_first() else {
            return Err(CompileError::malformed("unless", whole));
        };
        Ok(form("IF", &[test.clone(), Sexpr::nil(), form("PROGN", body)]))
    });

    define_macro!(table, "COND", (c, whole, args) {
        let Some((clause, rest)) = args.split_first() else {
            return Ok(Sexpr::nil());
        };
        let clause = list_of("cond", whole, clause)?;
        let Some((test, body)) = clause.split_first() else {
            return Err(CompileError::malformed("cond", whole));
        };
        let more = form("COND", rest);
        if body.is_empty() {
            return Ok(form("OR", &[test.clone(), more]));
        }
        if test.is_symbol_named("T") {
            return Ok(form("PROGN", body));
        }
        Ok(form("IF", &[test.clone(), form("PROGN", body), more]))
    });

    define_macro!(table, "AND", (c, whole, args) {
        match args {
            [] => Ok(Sexpr::t()),
            [x] => Ok(x.clone()),
            [x, rest @ ..] => Ok(form("IF", &[x.clone(), form("AND", rest)])),
        }
    });

    define_macro!(table, "OR", (c, whole, args) {
        match args {
            [] => Ok(Sexpr::nil()),
            [x] => Ok(x.clone()),
            [x, rest @ ..] => {
                let g = Sexpr::Symbol(c.gensym("OR"));
                Ok(let_form(
                    vec![Sexpr::list(&[g.clone(), x.clone()])],
                    vec![],
                    vec![form("IF", &[g.clone(), g, form("OR", rest)])],
                ))
            }
        }
    });

    define_macro!(table, "RETURN", (c, whole, args) {
        match args {
            [] => Ok(form("RETURN-FROM", &[Sexpr::nil()])),
            [value] => Ok(form("RETURN-FROM", &[Sexpr::nil(), value.clone()])),
            _ => Err(CompileError::malformed("return", whole)),
        }
    });

    define_macro!(table, "PROG1", (c, whole, args) {
        let Some((first, rest)) = args.split_first() else {
            return Err(CompileError::malformed("prog1", whole));
        };
        let g = Sexpr::Symbol(c.gensym("PROG1"));
        let mut body = rest.to_vec();
        body.push(g.clone());
        Ok(let_form(vec![Sexpr::list(&[g, first.clone()])], vec![], body))
    });

    define_macro!(table, "PROG2", (c, whole, args) {
        let Some((first, rest)) = args.split_first() else {
            return Err(CompileError::malformed("prog2", whole));
        };
        if rest.is_empty() {
            return Err(CompileError::malformed("prog2", whole));
        }
        Ok(form("PROGN", &[first.clone(), form("PROG1", rest)]))
    });

    define_macro!(table, "DOLIST", (c, whole, args) {
        let Some((spec, body)) = args.split_first() else {
            return Err(CompileError::malformed("dolist", whole));
        };
        let (var, list, result) = match list_of("dolist", whole, spec)?.as_slice() {
            [var @ Sexpr::Symbol(_), list] => (var.clone(), list.clone(), Sexpr::nil()),
            [var @ Sexpr::Symbol(_), list, result] => (var.clone(), list.clone(), result.clone()),
            _ => return Err(CompileError::malformed("dolist", whole)),
        };
        let (body, declare) = split_declarations(c, body)?;
        let tail = Sexpr::Symbol(c.gensym("LIST"));
        let step = form("%WHILE", &[
            form("NOT", &[form("NULL", &[tail.clone()])]),
            form("SETQ", &[var.clone(), form("CAR", &[tail.clone()])]),
            form("TAGBODY", &body),
            form("SETQ", &[tail.clone(), form("CDR", &[tail.clone()])]),
        ]);
        let done = form("SETQ", &[var.clone(), Sexpr::nil()]);
        Ok(form("BLOCK", &[
            Sexpr::nil(),
            let_form(
                vec![Sexpr::list(&[tail, list]), Sexpr::list(&[var])],
                declare,
                vec![step, done, result],
            ),
        ]))
    });

    define_macro!(table, "DOTIMES", (c, whole, args) {
        let Some((spec, body)) = args.split_first() else {
            return Err(CompileError::malformed("dotimes", whole));
        };
        let (var, count, result) = match list_of("dotimes", whole, spec)?.as_slice() {
            [var @ Sexpr::Symbol(_), count] => (var.clone(), count.clone(), Sexpr::nil()),
            [var @ Sexpr::Symbol(_), count, result] => (var.clone(), count.clone(), result.clone()),
            _ => return Err(CompileError::malformed("dotimes", whole)),
        };
        let (body, declare) = split_declarations(c, body)?;
        let limit = Sexpr::Symbol(c.gensym("LIMIT"));
        let step = form("%WHILE", &[
            form("<", &[var.clone(), limit.clone()]),
            form("TAGBODY", &body),
            form("SETQ", &[var.clone(), form("1+", &[var.clone()])]),
        ]);
        Ok(form("BLOCK", &[
            Sexpr::nil(),
            let_form(
                vec![Sexpr::list(&[var, Sexpr::Fixnum(0)]), Sexpr::list(&[limit, count])],
                declare,
                vec![step, result],
            ),
        ]))
    });

    define_macro!(table, "LOOP", (c, whole, args) {
        if args.iter().any(Sexpr::is_symbol) {
            return Err(CompileError::malformed("loop", whole));
        }
        let mut body = vec![Sexpr::t()];
        body.extend_from_slice(args);
        Ok(form("BLOCK", &[Sexpr::nil(), form("%WHILE", &body)]))
    });

    define_macro!(table, "PUSH", (c, whole, args) {
        match args {
            [item, place @ Sexpr::Symbol(_)] => Ok(form("SETQ", &[
                place.clone(),
                form("CONS", &[item.clone(), place.clone()]),
            ])),
            _ => Err(CompileError::malformed("push", whole)),
        }
    });

    define_macro!(table, "INCF", (c, whole, args) {
        modify("incf", "+", whole, args)
    });

    define_macro!(table, "DECF", (c, whole, args) {
        modify("decf", "-", whole, args)
    });

    define_macro!(table, "CASE", (c, whole, args) {
        let Some((key, clauses)) = args.split_first() else {
            return Err(CompileError::malformed("case", whole));
        };
        let g = Sexpr::Symbol(c.gensym("KEY"));
        let mut cond = vec![];
        for clause in clauses {
            let clause = list_of("case", whole, clause)?;
            let Some((keys, body)) = clause.split_first() else {
                return Err(CompileError::malformed("case", whole));
            };
            let test = if keys.is_symbol_named("T") || keys.is_symbol_named("OTHERWISE") {
                Sexpr::t()
            } else {
                let keys = match keys.list_to_vec() {
                    Some(keys) => keys,
                    None => vec![keys.clone()],
                };
                let tests = keys
                    .into_iter()
                    .map(|k| form("EQL", &[g.clone(), Sexpr::quote(k)]))
                    .collect::<Vec<_>>();
                form("OR", &tests)
            };
            let mut clause = vec![test];
            clause.extend_from_slice(body);
            if body.is_empty() {
                clause.push(Sexpr::nil());
            }
            cond.push(Sexpr::list(&clause));
        }
        Ok(let_form(vec![Sexpr::list(&[g, key.clone()])], vec![], vec![form("COND", &cond)]))
    });

    define_macro!(table, "MULTIPLE-VALUE-BIND", (c, whole, args) {
        let [vars, values_form, body @ ..] = args else {
            return Err(CompileError::malformed("multiple-value-bind", whole));
        };
        let vars = list_of("multiple-value-bind", whole, vars)?;
        let mut lambda_list = vec![sym("&OPTIONAL")];
        lambda_list.extend(vars);
        lambda_list.push(sym("&REST"));
        lambda_list.push(Sexpr::Symbol(c.gensym("IGNORE")));
        let mut lambda = vec![Sexpr::list(&lambda_list)];
        lambda.extend_from_slice(body);
        Ok(form("MULTIPLE-VALUE-CALL", &[
            form("FUNCTION", &[form("LAMBDA", &lambda)]),
            values_form.clone(),
        ]))
    });

    define_macro!(table, "MULTIPLE-VALUE-LIST", (c, whole, args) {
        match args {
            [values_form] => Ok(form("MULTIPLE-VALUE-CALL", &[
                form("FUNCTION", &[sym("LIST")]),
                values_form.clone(),
            ])),
            _ => Err(CompileError::malformed("multiple-value-list", whole)),
        }
    });

    define_macro!(table, "BACKQUOTE", (c, whole, args) {
        match args {
            [template] => backquote(template),
            _ => Err(CompileError::malformed("backquote", whole)),
        }
    });

    table
});

/// Defines every native macro in the global frame of `env`.
pub fn install(env: &Environment) {
    for &(name, expander) in NATIVE_MACROS.iter() {
        env.define_global(Binding::new(
            Symbol::intern(name),
            Namespace::Function,
            BindingKind::Macro,
            BindingValue::Macro(Macro::Native(expander)),
        ));
    }
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
    fn natives_are_global_macros() {
        let c = Compiler::default();
        let binding = c
            .environment()
            .lookup(&Symbol::intern("DEFUN"), Namespace::Function)
            .unwrap();
        assert_eq!(binding.kind(), BindingKind::Macro);
    }

    #[test]
    fn definitions() {
        assert_eq!(eval("(defun add (a b) (+ a b)) (add 1 2)"), Sexpr::Fixnum(3));
        assert_eq!(eval("(defvar *a* 1) (defvar *a* 2) *a*"), Sexpr::Fixnum(1));
        assert_eq!(eval("(defparameter *b* 1) (defparameter *b* 2) *b*"), Sexpr::Fixnum(2));
        assert_eq!(eval("(defconstant +c+ 7) +c+"), Sexpr::Fixnum(7));
        assert_eq!(eval("(defun early (x) (return-from early x) 0) (early 5)"), Sexpr::Fixnum(5));
    }

    #[test]
    fn user_macros_expand_through_the_host() {
        assert_eq!(
            eval("(defmacro my-if (c a b) `(cond (,c ,a) (t ,b))) (list (my-if t 1 2) (my-if nil 1 2))"),
            read("(1 2)")
        );
        assert_eq!(
            eval("(defmacro swap-args (f . args) `(,f ,@(reverse args))) (swap-args - 1 10)"),
            Sexpr::Fixnum(9)
        );
    }

    #[test]
    fn defun_replaces_a_global_macro() {
        assert_eq!(
            eval("(defmacro m () 1) (defun m () 2) (m)"),
            Sexpr::Fixnum(2)
        );
    }

    #[test]
    fn conditionals() {
        assert_eq!(eval("(list (when t 1) (when nil 1) (unless nil 2))"), read("(1 nil 2)"));
        assert_eq!(eval("(cond ((= 1 2) 'a) ((= 1 1) 'b) (t 'c))"), Sexpr::symbol("B"));
        assert_eq!(eval("(cond (nil) (3))"), Sexpr::Fixnum(3));
        assert_eq!(eval("(list (and) (and 1 2) (and 1 nil 2) (or) (or nil 3) (or nil nil))"), read("(t 2 nil nil 3 nil)"));
        assert_eq!(eval("(case 2 (1 'one) ((2 3) 'few) (otherwise 'many))"), Sexpr::symbol("FEW"));
        assert_eq!(eval("(case 9 (1 'one) (t 'many))"), Sexpr::symbol("MANY"));
    }

    #[test]
    fn iteration() {
        assert_eq!(eval("(let ((acc nil)) (dolist (x '(1 2 3) acc) (push x acc)))"), read("(3 2 1)"));
        assert_eq!(eval("(let ((n 0)) (dotimes (i 5 n) (incf n i)))"), Sexpr::Fixnum(10));
        assert_eq!(eval("(let ((i 0)) (loop (when (= i 3) (return i)) (incf i)))"), Sexpr::Fixnum(3));
        assert_eq!(eval("(dolist (x '(1 2 3)) (when (= x 2) (return x)))"), Sexpr::Fixnum(2));
        assert_eq!(eval("(let ((n 10)) (decf n 4) n)"), Sexpr::Fixnum(6));
    }

    #[test]
    fn sequencing() {
        assert_eq!(eval("(let ((x 1)) (prog1 x (setq x 2)))"), Sexpr::Fixnum(1));
        assert_eq!(eval("(prog2 1 2 3)"), Sexpr::Fixnum(2));
    }

    #[test]
    fn multiple_value_binding() {
        assert_eq!(eval("(multiple-value-bind (a b c) (values 1 2) (list a b c))"), read("(1 2 nil)"));
        assert_eq!(eval("(multiple-value-bind (a) (values 1 2 3) a)"), Sexpr::Fixnum(1));
    }

    #[test]
    fn backquote_templates() {
        assert_eq!(eval("(let ((x 1) (ys '(2 3))) `(a ,x ,@ys b))"), read("(a 1 2 3 b)"));
        assert_eq!(eval("(let ((x 1)) `(a . ,x))"), read("(a . 1)"));
        assert_eq!(eval("`(1 (2 ,(+ 1 2)))"), read("(1 (2 3))"));
        assert_eq!(eval("`sym"), Sexpr::symbol("SYM"));
    }
}
