//! A small reader for tests. Symbols are upcased and interned in
//! COMMON-LISP; `'`, `#'`, backquote, `,` and `,@` read as their long forms.

use std::{iter::Peekable, str::Chars};

use super::sexpr::{Sexpr, Symbol};

const DELIMITERS: &str = "()'`,\";";

struct Reader<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else if c == ';' {
                while self.chars.next().is_some_and(|c| c != '\n') {}
            } else {
                break;
            }
        }
    }

    fn token(&mut self) -> String {
        let mut token = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || DELIMITERS.contains(c) {
                break;
            }
            token.push(c);
            self.chars.next();
        }
        token
    }

    fn wrap(&mut self, name: &str) -> Sexpr {
        let datum = self.read();
        Sexpr::list(&[Sexpr::symbol(name), datum])
    }

    fn read(&mut self) -> Sexpr {
        self.skip_whitespace();
        let c = self.chars.next().expect("unexpected end of input");
        match c {
            '(' => self.read_list(')'),
            ')' => panic!("unexpected )"),
            '\'' => self.wrap("QUOTE"),
            '`' => self.wrap("BACKQUOTE"),
            ',' => {
                if self.chars.next_if_eq(&'@').is_some() {
                    self.wrap("UNQUOTE-SPLICING")
                } else {
                    self.wrap("UNQUOTE")
                }
            }
            '"' => self.read_string(),
            '#' => match self.chars.next() {
                Some('\'') => self.wrap("FUNCTION"),
                Some('\\') => self.read_char(),
                Some('(') => match self.read_list(')').list_to_vec() {
                    Some(items) => Sexpr::Vector(items.into()),
                    None => panic!("dotted vector"),
                },
                other => panic!("unknown dispatch #{:?}", other),
            },
            c => {
                let mut token = c.to_string();
                token.push_str(&self.token());
                atom(&token)
            }
        }
    }

    fn read_list(&mut self, close: char) -> Sexpr {
        let mut items = vec![];
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                Some(&c) if c == close => {
                    self.chars.next();
                    return Sexpr::list(&items);
                }
                Some('.') => {
                    self.chars.next();
                    if self.chars.peek().is_some_and(|c| c.is_whitespace()) {
                        let tail = self.read();
                        self.skip_whitespace();
                        assert_eq!(self.chars.next(), Some(close), "malformed dotted list");
                        return Sexpr::list_star(&items, tail);
                    }
                    let mut token = ".".to_string();
                    token.push_str(&self.token());
                    items.push(atom(&token));
                }
                Some(_) => items.push(self.read()),
                None => panic!("unterminated list"),
            }
        }
    }

    fn read_string(&mut self) -> Sexpr {
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Sexpr::string(&s),
                Some('\\') => s.extend(self.chars.next()),
                Some(c) => s.push(c),
                None => panic!("unterminated string"),
            }
        }
    }

    fn read_char(&mut self) -> Sexpr {
        let first = self.chars.next().expect("unexpected end of input");
        let mut name = first.to_string();
        name.push_str(&self.token());
        if name.chars().count() == 1 {
            return Sexpr::Char(first);
        }
        match name.to_ascii_lowercase().as_str() {
            "space" => Sexpr::Char(' '),
            "newline" => Sexpr::Char('\n'),
            "tab" => Sexpr::Char('\t'),
            _ => panic!("unknown character name {}", name),
        }
    }
}

fn atom(token: &str) -> Sexpr {
    if let Ok(n) = token.parse::<i64>() {
        return Sexpr::Fixnum(n);
    }
    if token.contains(|c: char| c.is_ascii_digit()) {
        if let Ok(n) = token.parse::<f64>() {
            return Sexpr::Flonum(n);
        }
    }
    let name = token.to_uppercase();
    match name.strip_prefix(':') {
        Some(keyword) => Sexpr::Symbol(Symbol::keyword(keyword)),
        None => Sexpr::Symbol(Symbol::intern(&name)),
    }
}

pub fn read(src: &str) -> Sexpr {
    Reader::new(src).read()
}

pub fn read_all(src: &str) -> Vec<Sexpr> {
    let mut reader = Reader::new(src);
    let mut forms = vec![];
    loop {
        reader.skip_whitespace();
        if reader.chars.peek().is_none() {
            return forms;
        }
        forms.push(reader.read());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_data() {
        assert_eq!(read("(a . 1)"), Sexpr::cons(Sexpr::symbol("A"), Sexpr::Fixnum(1)));
        assert_eq!(read("nil"), Sexpr::nil());
        assert_eq!(read("-7"), Sexpr::Fixnum(-7));
        assert_eq!(read("2.5"), Sexpr::Flonum(2.5));
        assert_eq!(read("#\\a"), Sexpr::Char('a'));
        assert_eq!(read(":key"), Sexpr::keyword("KEY"));
        assert_eq!(read("\"a\\\"b\""), Sexpr::string("a\"b"));
        assert!(read("(1- x)").is_form("1-"));
        assert_eq!(read("'x"), Sexpr::quote(Sexpr::symbol("X")));
        assert!(read("#'car").is_form("FUNCTION"));
        assert!(read("`(a ,b ,@c)").is_form("BACKQUOTE"));
    }

    #[test]
    fn reads_several_forms() {
        assert_eq!(read_all("1 ; comment\n (x) #(1 2)").len(), 3);
    }
}
