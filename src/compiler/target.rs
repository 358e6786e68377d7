//! The target code tree.
//!
//! This is the abstract form of the imperative code the compiler produces:
//! functions with a `var`-scoped body, statements, expressions, property
//! access and structured exceptions. Rendering it as text is left to a
//! separate printer; [`Expr::pretty`] and [`Stmt::pretty`] only produce an
//! S-expression dump for debugging.

use std::rc::Rc;

pub type Ident = Rc<str>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Typeof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    StrictEq,
    StrictNe,
    Eq,
    And,
    Or,
    In,
    InstanceOf,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::StrictEq => "===",
            Self::StrictNe => "!==",
            Self::Eq => "==",
            Self::And => "&&",
            Self::Or => "||",
            Self::In => "in",
            Self::InstanceOf => "instanceof",
        }
    }
}

#[derive(Clone, Debug)]
pub enum Expr {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Var(Ident),
    /// A member of the runtime `internals` object.
    Internal(&'static str),
    Array(Vec<Expr>),
    Object(Vec<(Rc<str>, Expr)>),
    /// `object[key]`
    Get(Box<Expr>, Box<Expr>),
    /// `place = value`; the place is a `Var` or a `Get`.
    Assign(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    /// `object.name(args...)`
    MethodCall(Box<Expr>, Rc<str>, Vec<Expr>),
    New(Box<Expr>, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Comma sequence; the value is the last expression's.
    Progn(Vec<Expr>),
    Function(Rc<Function>),
    /// `(function () { body })()`
    SelfCall(Vec<Stmt>),
}

#[derive(Debug)]
pub struct Function {
    pub name: Option<Ident>,
    pub params: Vec<Ident>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub struct SwitchCase {
    /// `None` is the `default` case.
    pub test: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub struct Catch {
    pub var: Ident,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Var(Ident, Option<Expr>),
    Expr(Expr),
    Return(Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    While(Expr, Vec<Stmt>),
    Label(Ident, Box<Stmt>),
    Break(Option<Ident>),
    Switch(Expr, Vec<SwitchCase>),
    Throw(Expr),
    Try {
        body: Vec<Stmt>,
        catch: Option<Catch>,
        finally: Option<Vec<Stmt>>,
    },
    Block(Vec<Stmt>),
}

impl Expr {
    pub fn var(name: impl Into<Ident>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn str(s: &str) -> Expr {
        Expr::Str(Rc::from(s))
    }

    /// `object.key`
    pub fn get(object: Expr, key: &str) -> Expr {
        Expr::Get(Box::new(object), Box::new(Expr::str(key)))
    }

    /// `object[index]`
    pub fn index(object: Expr, index: Expr) -> Expr {
        Expr::Get(Box::new(object), Box::new(index))
    }

    pub fn assign(place: Expr, value: Expr) -> Expr {
        Expr::Assign(Box::new(place), Box::new(value))
    }

    pub fn call(function: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call(Box::new(function), args)
    }

    pub fn internal(name: &'static str, args: Vec<Expr>) -> Expr {
        Expr::call(Expr::Internal(name), args)
    }

    pub fn method(object: Expr, name: &str, args: Vec<Expr>) -> Expr {
        Expr::MethodCall(Box::new(object), Rc::from(name), args)
    }

    pub fn new_object(class: Expr, args: Vec<Expr>) -> Expr {
        Expr::New(Box::new(class), args)
    }

    pub fn unary(op: UnaryOp, x: Expr) -> Expr {
        Expr::Unary(op, Box::new(x))
    }

    pub fn not(x: Expr) -> Expr {
        Expr::unary(UnaryOp::Not, x)
    }

    pub fn binary(op: BinaryOp, x: Expr, y: Expr) -> Expr {
        Expr::Binary(op, Box::new(x), Box::new(y))
    }

    pub fn cond(test: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Cond(Box::new(test), Box::new(then), Box::new(otherwise))
    }

    pub fn function(name: Option<Ident>, params: Vec<Ident>, body: Vec<Stmt>) -> Expr {
        Expr::Function(Rc::new(Function { name, params, body }))
    }

    /// Wraps statements so they can appear where an expression is expected.
    pub fn self_call(body: Vec<Stmt>) -> Expr {
        Expr::SelfCall(body)
    }

    pub fn progn(mut exprs: Vec<Expr>) -> Expr {
        match exprs.len() {
            0 => Expr::Undefined,
            1 => exprs.pop().unwrap_or(Expr::Undefined),
            _ => Expr::Progn(exprs),
        }
    }
}

impl Stmt {
    pub fn var(name: impl Into<Ident>, init: Expr) -> Stmt {
        Stmt::Var(name.into(), Some(init))
    }

    pub fn expr(expr: Expr) -> Stmt {
        Stmt::Expr(expr)
    }

    pub fn try_finally(body: Vec<Stmt>, finally: Vec<Stmt>) -> Stmt {
        Stmt::Try {
            body,
            catch: None,
            finally: Some(finally),
        }
    }

    pub fn try_catch(body: Vec<Stmt>, var: Ident, handler: Vec<Stmt>) -> Stmt {
        Stmt::Try {
            body,
            catch: Some(Catch { var, body: handler }),
            finally: None,
        }
    }
}

use pretty::{BoxAllocator, DocAllocator, DocBuilder};
use termcolor::{Color, ColorSpec, WriteColor};

fn keyword<'a, D>(allocator: &'a D, name: &'static str) -> DocBuilder<'a, D, ColorSpec>
where
    D: DocAllocator<'a, ColorSpec>,
    D::Doc: Clone,
{
    allocator
        .text(name)
        .annotate(ColorSpec::new().set_fg(Some(Color::Blue)).set_bold(true).clone())
}

fn node<'a, D, I>(
    allocator: &'a D,
    head: DocBuilder<'a, D, ColorSpec>,
    children: I,
) -> DocBuilder<'a, D, ColorSpec>
where
    D: DocAllocator<'a, ColorSpec>,
    D::Doc: Clone,
    I: IntoIterator<Item = DocBuilder<'a, D, ColorSpec>>,
{
    let children = children.into_iter().collect::<Vec<_>>();
    if children.is_empty() {
        return head.parens();
    }
    head.append(allocator.line())
        .append(allocator.intersperse(children, allocator.line()))
        .nest(1)
        .group()
        .parens()
}

fn block<'a, D>(allocator: &'a D, body: &[Stmt]) -> DocBuilder<'a, D, ColorSpec>
where
    D: DocAllocator<'a, ColorSpec>,
    D::Doc: Clone,
{
    allocator
        .intersperse(body.iter().map(|stmt| stmt.pretty(allocator)), allocator.hardline())
        .nest(1)
        .brackets()
}

impl Expr {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        match self {
            Expr::Undefined => allocator.text("undefined"),
            Expr::Null => allocator.text("null"),
            Expr::Bool(b) => allocator.text(b.to_string()),
            Expr::Int(i) => allocator.text(i.to_string()),
            Expr::Float(f) => allocator.text(format!("{:?}", f)),
            Expr::Str(s) => allocator
                .text(format!("{:?}", s))
                .annotate(ColorSpec::new().set_fg(Some(Color::Green)).clone()),
            Expr::Var(name) => allocator.text(name.to_string()),
            Expr::Internal(name) => allocator
                .text(format!("internals.{}", name))
                .annotate(ColorSpec::new().set_fg(Some(Color::Cyan)).clone()),
            Expr::Array(elems) => node(
                allocator,
                keyword(allocator, "array"),
                elems.iter().map(|e| e.pretty(allocator)),
            ),
            Expr::Object(props) => node(
                allocator,
                keyword(allocator, "object"),
                props.iter().map(|(k, v)| {
                    allocator
                        .text(k.to_string())
                        .append(allocator.space())
                        .append(v.pretty(allocator))
                        .group()
                        .parens()
                }),
            ),
            Expr::Get(obj, key) => node(
                allocator,
                keyword(allocator, "get"),
                [obj.pretty(allocator), key.pretty(allocator)],
            ),
            Expr::Assign(place, value) => node(
                allocator,
                keyword(allocator, "set!"),
                [place.pretty(allocator), value.pretty(allocator)],
            ),
            Expr::Call(f, args) => node(
                allocator,
                keyword(allocator, "call"),
                std::iter::once(f.pretty(allocator)).chain(args.iter().map(|a| a.pretty(allocator))),
            ),
            Expr::MethodCall(obj, name, args) => node(
                allocator,
                keyword(allocator, "send"),
                [obj.pretty(allocator), allocator.text(name.to_string())]
                    .into_iter()
                    .chain(args.iter().map(|a| a.pretty(allocator))),
            ),
            Expr::New(class, args) => node(
                allocator,
                keyword(allocator, "new"),
                std::iter::once(class.pretty(allocator))
                    .chain(args.iter().map(|a| a.pretty(allocator))),
            ),
            Expr::Unary(op, x) => {
                let op = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "neg",
                    UnaryOp::Typeof => "typeof",
                };
                node(allocator, allocator.text(op), [x.pretty(allocator)])
            }
            Expr::Binary(op, x, y) => node(
                allocator,
                allocator.text(op.as_str()),
                [x.pretty(allocator), y.pretty(allocator)],
            ),
            Expr::Cond(test, then, otherwise) => node(
                allocator,
                keyword(allocator, "?"),
                [
                    test.pretty(allocator),
                    then.pretty(allocator),
                    otherwise.pretty(allocator),
                ],
            ),
            Expr::Progn(exprs) => node(
                allocator,
                keyword(allocator, "comma"),
                exprs.iter().map(|e| e.pretty(allocator)),
            ),
            Expr::Function(function) => function.pretty(allocator),
            Expr::SelfCall(body) => keyword(allocator, "selfcall")
                .append(allocator.space())
                .append(block(allocator, body))
                .group()
                .parens(),
        }
    }

    pub fn pretty_print(&self, writer: &mut impl WriteColor) -> std::io::Result<()> {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        doc.render_colored(70, writer)
    }
}

impl Function {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        let name_pret = self
            .name
            .as_ref()
            .map(|name| allocator.text(name.to_string()).append(allocator.space()))
            .unwrap_or_else(|| allocator.nil());

        let params_pret = allocator
            .intersperse(
                self.params.iter().map(|p| allocator.text(p.to_string())),
                allocator.space(),
            )
            .parens();

        keyword(allocator, "function")
            .append(allocator.space())
            .append(name_pret)
            .append(params_pret)
            .append(allocator.line())
            .append(block(allocator, &self.body))
            .nest(1)
            .group()
            .parens()
    }
}

impl Stmt {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        match self {
            Stmt::Var(name, init) => node(
                allocator,
                keyword(allocator, "var"),
                std::iter::once(allocator.text(name.to_string()))
                    .chain(init.iter().map(|init| init.pretty(allocator))),
            ),
            Stmt::Expr(expr) => expr.pretty(allocator),
            Stmt::Return(expr) => node(
                allocator,
                keyword(allocator, "return"),
                [expr.pretty(allocator)],
            ),
            Stmt::If(test, then, otherwise) => node(
                allocator,
                keyword(allocator, "if"),
                [
                    test.pretty(allocator),
                    block(allocator, then),
                    block(allocator, otherwise),
                ],
            ),
            Stmt::While(test, body) => node(
                allocator,
                keyword(allocator, "while"),
                [test.pretty(allocator), block(allocator, body)],
            ),
            Stmt::Label(label, body) => node(
                allocator,
                keyword(allocator, "label"),
                [allocator.text(label.to_string()), body.pretty(allocator)],
            ),
            Stmt::Break(label) => node(
                allocator,
                keyword(allocator, "break"),
                label.iter().map(|l| allocator.text(l.to_string())),
            ),
            Stmt::Switch(value, cases) => node(
                allocator,
                keyword(allocator, "switch"),
                std::iter::once(value.pretty(allocator)).chain(cases.iter().map(|case| {
                    let test = match &case.test {
                        Some(test) => test.pretty(allocator),
                        None => keyword(allocator, "default"),
                    };
                    test.append(allocator.space())
                        .append(block(allocator, &case.body))
                        .nest(1)
                        .group()
                        .parens()
                })),
            ),
            Stmt::Throw(expr) => node(
                allocator,
                keyword(allocator, "throw"),
                [expr.pretty(allocator)],
            ),
            Stmt::Try {
                body,
                catch,
                finally,
            } => {
                let mut parts = vec![block(allocator, body)];
                if let Some(catch) = catch {
                    parts.push(node(
                        allocator,
                        keyword(allocator, "catch"),
                        [allocator.text(catch.var.to_string()), block(allocator, &catch.body)],
                    ));
                }
                if let Some(finally) = finally {
                    parts.push(node(
                        allocator,
                        keyword(allocator, "finally"),
                        [block(allocator, finally)],
                    ));
                }
                node(allocator, keyword(allocator, "try"), parts)
            }
            Stmt::Block(body) => block(allocator, body),
        }
    }

    pub fn pretty_print(&self, writer: &mut impl WriteColor) -> std::io::Result<()> {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        doc.render_colored(70, writer)
    }
}

fn render_plain(doc: DocBuilder<'_, BoxAllocator, ColorSpec>) -> String {
    let mut out = Vec::new();
    let mut writer = termcolor::NoColor::new(&mut out);
    if doc.render_colored(70, &mut writer).is_err() {
        return String::from("#<unprintable>");
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&render_plain(self.pretty(&BoxAllocator)))
    }
}

impl std::fmt::Display for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&render_plain(self.pretty(&BoxAllocator)))
    }
}

/// Renders a whole unit, one statement per line.
pub fn dump(stmts: &[Stmt]) -> String {
    stmts
        .iter()
        .map(|stmt| stmt.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_is_an_sexpr() {
        let stmt = Stmt::var(
            "x",
            Expr::call(Expr::var("f"), vec![Expr::Int(1), Expr::str("a")]),
        );
        assert_eq!(stmt.to_string(), "(var x (call f 1 \"a\"))");
    }

    #[test]
    fn progn_collapses() {
        assert!(matches!(Expr::progn(vec![]), Expr::Undefined));
        assert!(matches!(Expr::progn(vec![Expr::Int(1)]), Expr::Int(1)));
        assert!(matches!(
            Expr::progn(vec![Expr::Int(1), Expr::Int(2)]),
            Expr::Progn(_)
        ));
    }
}
