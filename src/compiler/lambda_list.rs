//! Lambda lists and the calling convention.
//!
//! A compiled function takes `(values, nargs, required..., optional...)`;
//! rest and keyword arguments are read back from `arguments`.

use super::{
    env::{Binding, BindingRef, Namespace},
    sexpr::{Sexpr, Symbol},
    target::{BinaryOp, Expr, Ident, Stmt, SwitchCase},
    CompileError, CompileResult, Compiler,
};

#[derive(Debug)]
pub struct OptionalArg {
    pub var: Symbol,
    pub init: Sexpr,
    pub svar: Option<Symbol>,
}

#[derive(Debug)]
pub struct KeyArg {
    pub keyword: Symbol,
    pub var: Symbol,
    pub init: Sexpr,
    pub svar: Option<Symbol>,
}

#[derive(Debug, Default)]
pub struct LambdaList {
    pub required: Vec<Symbol>,
    pub optional: Vec<OptionalArg>,
    pub rest: Option<Symbol>,
    pub keys: Vec<KeyArg>,
    pub has_keys: bool,
    pub allow_other_keys: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    Required,
    Optional,
    Rest,
    AfterRest,
    Key,
    AfterAllowOtherKeys,
}

fn variable(ll: &Sexpr, x: &Sexpr) -> CompileResult<Symbol> {
    match x.as_symbol() {
        Some(sym) if !sym.is_keyword() && !sym.is_nil() && *sym != Symbol::t() => Ok(sym.clone()),
        _ => Err(CompileError::lambda_list(ll, format!("{} is not a variable name", x))),
    }
}

/// `var` or `(var [init [svar]])`
fn parse_optional(ll: &Sexpr, x: &Sexpr) -> CompileResult<(Sexpr, Sexpr, Option<Symbol>)> {
    if x.is_symbol() {
        return Ok((x.clone(), Sexpr::nil(), None));
    }
    let parts = x
        .list_to_vec()
        .filter(|parts| !parts.is_empty() && parts.len() <= 3)
        .ok_or_else(|| CompileError::lambda_list(ll, format!("bad parameter specifier {}", x)))?;
    let init = parts.get(1).cloned().unwrap_or_else(Sexpr::nil);
    let svar = match parts.get(2) {
        Some(svar) => Some(variable(ll, svar)?),
        None => None,
    };
    Ok((parts[0].clone(), init, svar))
}

pub fn parse_lambda_list(ll: &Sexpr) -> CompileResult<LambdaList> {
    let (items, tail) = ll.list_with_tail();
    let mut parsed = LambdaList::default();
    let mut section = Section::Required;

    for item in &items {
        let keyword = item.as_symbol().filter(|sym| sym.name().starts_with('&'));
        if let Some(keyword) = keyword {
            let next = match keyword.name() {
                "&OPTIONAL" if section < Section::Optional => Section::Optional,
                "&REST" | "&BODY" if section < Section::Rest => Section::Rest,
                "&KEY" if section < Section::Key && section != Section::Rest => {
                    parsed.has_keys = true;
                    Section::Key
                }
                "&ALLOW-OTHER-KEYS" if section == Section::Key => {
                    parsed.allow_other_keys = true;
                    Section::AfterAllowOtherKeys
                }
                _ => {
                    return Err(CompileError::lambda_list(
                        ll,
                        format!("unexpected {}", keyword),
                    ))
                }
            };
            section = next;
            continue;
        }

        match section {
            Section::Required => parsed.required.push(variable(ll, item)?),
            Section::Optional => {
                let (var, init, svar) = parse_optional(ll, item)?;
                parsed.optional.push(OptionalArg {
                    var: variable(ll, &var)?,
                    init,
                    svar,
                });
            }
            Section::Rest => {
                parsed.rest = Some(variable(ll, item)?);
                section = Section::AfterRest;
            }
            Section::Key => {
                let (spec, init, svar) = parse_optional(ll, item)?;
                let (keyword, var) = match spec.list_to_vec() {
                    Some(pair) if spec.is_pair() => match pair.as_slice() {
                        [Sexpr::Symbol(keyword), var] => (keyword.clone(), variable(ll, var)?),
                        _ => {
                            return Err(CompileError::lambda_list(
                                ll,
                                format!("bad keyword parameter {}", spec),
                            ))
                        }
                    },
                    _ => {
                        let var = variable(ll, &spec)?;
                        (Symbol::keyword(var.name()), var)
                    }
                };
                parsed.keys.push(KeyArg {
                    keyword,
                    var,
                    init,
                    svar,
                });
            }
            Section::AfterRest | Section::AfterAllowOtherKeys => {
                return Err(CompileError::lambda_list(
                    ll,
                    format!("unexpected {} after the last section", item),
                ))
            }
        }
    }

    if section == Section::Rest {
        return Err(CompileError::lambda_list(ll, "missing rest variable"));
    }

    if !tail.is_null() {
        if parsed.rest.is_some() || section > Section::Optional {
            return Err(CompileError::lambda_list(ll, "dotted tail after &rest or &key"));
        }
        parsed.rest = Some(variable(ll, &tail)?);
    }

    Ok(parsed)
}

impl LambdaList {
    /// Every variable the lambda list binds, in binding order.
    pub fn variables(&self) -> Vec<Symbol> {
        let mut vars = vec![];
        vars.extend(self.rest.iter().cloned());
        vars.extend(self.required.iter().cloned());
        vars.extend(self.optional.iter().map(|opt| opt.var.clone()));
        vars.extend(self.keys.iter().map(|key| key.var.clone()));
        vars.extend(self.optional.iter().filter_map(|opt| opt.svar.clone()));
        vars.extend(self.keys.iter().filter_map(|key| key.svar.clone()));
        vars
    }

    fn n_positional(&self) -> i64 {
        (self.required.len() + self.optional.len()) as i64
    }
}

fn nargs() -> Expr {
    Expr::var("nargs")
}

fn argument(index: Expr) -> Expr {
    Expr::index(Expr::var("arguments"), index)
}

fn plus(x: Expr, n: i64) -> Expr {
    Expr::binary(BinaryOp::Add, x, Expr::Int(n))
}

fn set(var: &Ident, value: Expr) -> Stmt {
    Stmt::expr(Expr::assign(Expr::Var(var.clone()), value))
}

impl Compiler {
    fn translate_variable(&self, var: &Symbol) -> CompileResult<Ident> {
        self.env
            .lookup(var, Namespace::Variable)
            .and_then(|b| b.ident())
            .ok_or_else(|| CompileError::lambda_list(&Sexpr::Symbol(var.clone()), "unbound parameter"))
    }

    fn check_argument_count(&self, ll: &LambdaList) -> Vec<Stmt> {
        let min = ll.required.len() as i64;
        let max = (ll.rest.is_none() && !ll.has_keys).then(|| ll.n_positional());

        if min > 0 && Some(min) == max {
            return vec![Stmt::expr(Expr::internal("checkArgs", vec![nargs(), Expr::Int(min)]))];
        }

        let mut stmts = vec![];
        if min > 0 {
            stmts.push(Stmt::expr(Expr::internal(
                "checkArgsAtLeast",
                vec![nargs(), Expr::Int(min)],
            )));
        }
        if let Some(max) = max {
            stmts.push(Stmt::expr(Expr::internal(
                "checkArgsAtMost",
                vec![nargs(), Expr::Int(max)],
            )));
        }
        stmts
    }

    /// One fall-through case per optional position: a call with `n`
    /// arguments starts at the first optional it did not supply.
    fn compile_optionals(&mut self, ll: &LambdaList) -> CompileResult<Vec<Stmt>> {
        if ll.optional.is_empty() {
            return Ok(vec![]);
        }

        let mut stmts = vec![];
        for opt in &ll.optional {
            if let Some(svar) = &opt.svar {
                let t = self.t()?;
                stmts.push(Stmt::var(self.translate_variable(svar)?, t));
            }
        }

        let n_required = ll.required.len() as i64;
        let mut cases = vec![];
        for (idx, opt) in ll.optional.iter().enumerate() {
            let mut body = vec![set(
                &self.translate_variable(&opt.var)?,
                self.convert(&opt.init, false)?,
            )];
            if let Some(svar) = &opt.svar {
                let nil = self.nil()?;
                body.push(set(&self.translate_variable(svar)?, nil));
            }
            cases.push(SwitchCase {
                test: Some(Expr::Int(idx as i64 + n_required)),
                body,
            });
        }
        cases.push(SwitchCase {
            test: None,
            body: vec![Stmt::Break(None)],
        });

        stmts.push(Stmt::Switch(nargs(), cases));
        Ok(stmts)
    }

    /// Conses the arguments past the positional ones, walking backwards so
    /// the list comes out in order.
    fn compile_rest(&mut self, ll: &LambdaList) -> CompileResult<Vec<Stmt>> {
        let Some(rest) = &ll.rest else {
            return Ok(vec![]);
        };
        let rest = self.translate_variable(rest)?;
        let i = || Expr::var("i");

        Ok(vec![
            Stmt::var(rest.clone(), self.nil()?),
            Stmt::var("i", Expr::binary(BinaryOp::Sub, nargs(), Expr::Int(1))),
            Stmt::While(
                Expr::binary(BinaryOp::Ge, i(), Expr::Int(ll.n_positional())),
                vec![
                    set(
                        &rest,
                        Expr::new_object(
                            Expr::Internal("Cons"),
                            vec![argument(plus(i(), 2)), Expr::Var(rest.clone())],
                        ),
                    ),
                    set(&"i".into(), Expr::binary(BinaryOp::Sub, i(), Expr::Int(1))),
                ],
            ),
        ])
    }

    /// Binds each keyword variable by scanning the keyword region, then
    /// validates the region in a second pass over the same argument values.
    /// A scan that ends without a match leaves `i >= nargs`; that includes
    /// calls that stop short of the keyword region.
    fn compile_keywords(&mut self, ll: &LambdaList) -> CompileResult<Vec<Stmt>> {
        if !ll.has_keys {
            return Ok(vec![]);
        }

        let start = ll.n_positional();
        let i = || Expr::var("i");
        let step = |i: Expr| Stmt::expr(Expr::assign(i.clone(), plus(i, 2)));

        let mut stmts = vec![];
        for key in &ll.keys {
            stmts.push(Stmt::Var(self.translate_variable(&key.var)?, None));
            if let Some(svar) = &key.svar {
                let nil = self.nil()?;
                stmts.push(Stmt::var(self.translate_variable(svar)?, nil));
            }
        }

        stmts.push(Stmt::Var("i".into(), None));
        for key in &ll.keys {
            let var = self.translate_variable(&key.var)?;
            let keyword = self.literal(&Sexpr::Symbol(key.keyword.clone()), false)?;

            let mut found = vec![set(&var, argument(plus(i(), 3)))];
            if let Some(svar) = &key.svar {
                let t = self.t()?;
                found.push(set(&self.translate_variable(svar)?, t));
            }
            found.push(Stmt::Break(None));

            stmts.push(set(&"i".into(), Expr::Int(start)));
            stmts.push(Stmt::While(
                Expr::binary(BinaryOp::Lt, i(), nargs()),
                vec![
                    Stmt::If(
                        Expr::binary(BinaryOp::StrictEq, argument(plus(i(), 2)), keyword),
                        found,
                        vec![],
                    ),
                    step(i()),
                ],
            ));
            let init = self.convert(&key.init, false)?;
            stmts.push(Stmt::If(
                Expr::binary(BinaryOp::Ge, i(), nargs()),
                vec![set(&var, init)],
                vec![],
            ));
        }

        let region = Expr::binary(BinaryOp::Sub, nargs(), Expr::Int(start));
        stmts.push(Stmt::If(
            Expr::binary(
                BinaryOp::StrictEq,
                Expr::binary(BinaryOp::Mod, region, Expr::Int(2)),
                Expr::Int(1),
            ),
            vec![Stmt::expr(Expr::internal(
                "raise",
                vec![
                    Expr::str("odd-keywords"),
                    Expr::str("odd number of keyword arguments"),
                ],
            ))],
            vec![],
        ));

        if !ll.allow_other_keys {
            let mut unknown: Option<Expr> = None;
            for key in &ll.keys {
                let keyword = self.literal(&Sexpr::Symbol(key.keyword.clone()), false)?;
                let test = Expr::binary(BinaryOp::StrictNe, argument(plus(i(), 2)), keyword);
                unknown = Some(match unknown {
                    Some(acc) => Expr::binary(BinaryOp::And, acc, test),
                    None => test,
                });
            }
            // a bare &key accepts no keyword at all
            let unknown = unknown.unwrap_or(Expr::Bool(true));
            stmts.push(set(&"i".into(), Expr::Int(start)));
            stmts.push(Stmt::While(
                Expr::binary(BinaryOp::Lt, i(), nargs()),
                vec![
                    Stmt::If(
                        unknown,
                        vec![Stmt::expr(Expr::internal(
                            "raise",
                            vec![
                                Expr::str("unknown-keyword"),
                                Expr::str("unknown keyword argument"),
                                argument(plus(i(), 2)),
                            ],
                        ))],
                        vec![],
                    ),
                    step(i()),
                ],
            ));
        }

        Ok(stmts)
    }

    /// Compiles `(lambda ll . body)`. A named lambda gets an implicit block
    /// and records its name and docstring on the function object.
    pub fn compile_lambda(
        &mut self,
        ll: &Sexpr,
        body: &[Sexpr],
        name: Option<&Symbol>,
    ) -> CompileResult<Expr> {
        let parsed = parse_lambda_list(ll)?;
        let (body, decls, docstring) = self.parse_body(body, true)?;

        let bindings = parsed
            .variables()
            .into_iter()
            .map(|var| {
                let ident = self.gvarname(var.name());
                Binding::variable(var, ident)
            })
            .collect::<Vec<BindingRef>>();
        let mut env = self.env.extend(bindings, Namespace::Variable);
        env = self.declare_specials(env, &decls, &parsed.variables());

        let code = self.with_env(env, |c| {
            let mut params: Vec<Ident> = vec!["values".into(), "nargs".into()];
            for var in &parsed.required {
                params.push(c.translate_variable(var)?);
            }
            for opt in &parsed.optional {
                params.push(c.translate_variable(&opt.var)?);
            }

            let mut stmts = c.check_argument_count(&parsed);
            stmts.extend(c.compile_optionals(&parsed)?);
            stmts.extend(c.compile_rest(&parsed)?);
            stmts.extend(c.compile_keywords(&parsed)?);

            match name {
                Some(name) => {
                    let block = Sexpr::list_star(
                        &[Sexpr::symbol("BLOCK"), Sexpr::Symbol(name.clone())],
                        Sexpr::list(&body),
                    );
                    stmts.extend(c.convert_block(&[block], true, true)?);
                }
                None => stmts.extend(c.convert_block(&body, true, true)?),
            }

            Ok(Expr::function(None, params, stmts))
        })?;

        if name.is_none() && docstring.is_none() {
            return Ok(code);
        }

        let func: Ident = self.gvarname("func");
        let mut wrapper = vec![Stmt::var(func.clone(), code)];
        if let Some(name) = name {
            wrapper.push(Stmt::expr(Expr::assign(
                Expr::get(Expr::Var(func.clone()), "fname"),
                Expr::str(name.name()),
            )));
        }
        if let Some(docstring) = docstring {
            wrapper.push(Stmt::expr(Expr::assign(
                Expr::get(Expr::Var(func.clone()), "docstring"),
                Expr::Str(docstring),
            )));
        }
        wrapper.push(Stmt::Return(Expr::Var(func)));
        Ok(Expr::self_call(wrapper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::test_reader::{read, read_all},
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
    fn parses_every_section() {
        let ll = parse_lambda_list(&read("(a b &optional (c 1 c-p) d &rest r &key e ((:f g) 2) &allow-other-keys)")).unwrap();
        assert_eq!(ll.required.len(), 2);
        assert_eq!(ll.optional.len(), 2);
        assert_eq!(ll.optional[0].svar.as_ref().map(Symbol::name), Some("C-P"));
        assert_eq!(ll.rest.as_ref().map(Symbol::name), Some("R"));
        assert_eq!(ll.keys.len(), 2);
        assert_eq!(ll.keys[0].keyword, Symbol::keyword("E"));
        assert_eq!(ll.keys[1].keyword, Symbol::keyword("F"));
        assert_eq!(ll.keys[1].var.name(), "G");
        assert!(ll.allow_other_keys);
    }

    #[test]
    fn dotted_tail_is_rest() {
        let ll = parse_lambda_list(&read("(a . more)")).unwrap();
        assert_eq!(ll.rest.as_ref().map(Symbol::name), Some("MORE"));
    }

    #[test]
    fn malformed_lists_are_rejected() {
        for src in ["(&rest)", "(&key a &optional b)", "(a &rest b c)", "(:k)", "(&optional (a 1 2 3))", "(&allow-other-keys)"] {
            assert!(
                matches!(parse_lambda_list(&read(src)), Err(CompileError::LambdaList { .. })),
                "{} should be rejected",
                src
            );
        }
    }

    #[test]
    fn exact_arity_uses_one_check() {
        let mut c = Compiler::default();
        let code = c.compile_lambda(&read("(a b)"), &[read("a")], None).unwrap();
        let dump = code.to_string();
        assert!(dump.contains("internals.checkArgs "));
        assert!(!dump.contains("checkArgsAtLeast"));
    }

    #[test]
    fn required_and_optional_arity() {
        let f = "(defun f (a b &optional c) (list a b c))";
        assert_eq!(value(&format!("{} (f 1 2)", f)), read("(1 2 nil)"));
        assert_eq!(value(&format!("{} (f 1 2 3)", f)), read("(1 2 3)"));
        assert_eq!(condition(&format!("{} (f 1)", f)), ConditionKind::ArgumentCount);
        assert_eq!(condition(&format!("{} (f 1 2 3 4)", f)), ConditionKind::ArgumentCount);
    }

    #[test]
    fn keywords_bind_in_any_order() {
        let k = "(defun k (&key a b) (list a b))";
        assert_eq!(value(&format!("{} (k :b 2 :a 1)", k)), read("(1 2)"));
        assert_eq!(value(&format!("{} (k :a 1 :a 3)", k)), read("(1 nil)"));
        assert_eq!(value(&format!("{} (k)", k)), read("(nil nil)"));
        assert_eq!(condition(&format!("{} (k :a)", k)), ConditionKind::OddKeywords);
        assert_eq!(condition(&format!("{} (k :c 1)", k)), ConditionKind::UnknownKeyword);
    }

    #[test]
    fn keyword_defaults_without_optionals() {
        let h = "(defun h (&optional x &key (b 5)) (list x b))";
        assert_eq!(value(&format!("{} (h)", h)), read("(nil 5)"));
        assert_eq!(value(&format!("{} (h 1)", h)), read("(1 5)"));
        assert_eq!(value(&format!("{} (h 1 :b 2)", h)), read("(1 2)"));
        assert_eq!(value("(defun h2 (&optional x &key (b 5)) (+ b 1)) (h2)"), Sexpr::Fixnum(6));
    }

    #[test]
    fn supplied_p_flags() {
        let s = "(defun s (&optional (x 1 x-p) &key (y 2 y-p)) (list x x-p y y-p))";
        assert_eq!(value(&format!("{} (s)", s)), read("(1 nil 2 nil)"));
        assert_eq!(value(&format!("{} (s 3 :y 4)", s)), read("(3 t 4 t)"));
    }

    #[test]
    fn rest_keeps_argument_order() {
        assert_eq!(value("(defun r (a &rest xs) xs) (r 1 2 3 4)"), read("(2 3 4)"));
        assert_eq!(value("(defun r (a &rest xs) xs) (r 1)"), Sexpr::nil());
    }

    #[test]
    fn other_keys_are_allowed_on_request() {
        let k = "(defun k (&key a &allow-other-keys) a)";
        assert_eq!(value(&format!("{} (k :c 1 :a 2)", k)), Sexpr::Fixnum(2));
        assert_eq!(condition(&format!("{} (k :c)", k)), ConditionKind::OddKeywords);
    }

    #[test]
    fn bare_key_rejects_every_keyword() {
        assert_eq!(value("(defun e (&key) 1) (e)"), Sexpr::Fixnum(1));
        assert_eq!(condition("(defun e (&key) 1) (e :zz 1)"), ConditionKind::UnknownKeyword);
    }
}
