use std::fmt;
use std::hash::{Hash, Hasher};

use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use num_rational::BigRational;

/// Source position of a form: 1-based line/column plus the byte offset into
/// the source text. The file name travels separately in reader options and
/// error context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub line: usize,
    pub col: usize,
    pub index: usize,
}

impl Span {
    pub fn start() -> Self {
        Span {
            line: 1,
            col: 1,
            index: 0,
        }
    }
}

/// A possibly namespace-qualified name. Symbols and keywords compare
/// structurally on (namespace, name).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    pub ns: Option<String>,
    pub name: String,
}

impl Symbol {
    pub fn simple(name: impl Into<String>) -> Self {
        Symbol {
            ns: None,
            name: name.into(),
        }
    }

    pub fn qualified(ns: impl Into<String>, name: impl Into<String>) -> Self {
        Symbol {
            ns: Some(ns.into()),
            name: name.into(),
        }
    }

    /// Splits `ns/name` tokens. A lone `/` is the division symbol, and a
    /// trailing or leading separator keeps the token whole.
    pub fn parse(token: &str) -> Self {
        if token == "/" {
            return Symbol::simple("/");
        }
        match token.find('/') {
            Some(idx) if idx > 0 && idx + 1 < token.len() => {
                Symbol::qualified(&token[..idx], &token[idx + 1..])
            }
            _ => Symbol::simple(token),
        }
    }

    pub fn is_qualified(&self) -> bool {
        self.ns.is_some()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One reader value. Atoms never carry metadata; symbols and collections may.
#[derive(Clone, Debug)]
pub struct Form {
    pub kind: FormKind,
    pub span: Span,
    /// Metadata entries, merged left-to-right from successive `^meta` forms.
    pub meta: Vec<(Form, Form)>,
}

#[derive(Clone, Debug)]
pub enum FormKind {
    Nil,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Ratio(BigRational),
    Float(f64),
    BigDecimal(BigDecimal),
    Char(char),
    String(String),
    Regex(String),
    Keyword(Symbol),
    Symbol(Symbol),
    List(Vec<Form>),
    Vector(Vec<Form>),
    Map(Vec<(Form, Form)>),
    Set(Vec<Form>),
    Tagged {
        tag: Symbol,
        value: Box<Form>,
    },
    /// A `#?(...)` form kept intact under `ReadCond::Preserve`.
    ReaderCond {
        splicing: bool,
        branches: Vec<(Form, Form)>,
    },
}

impl Form {
    pub fn new(kind: FormKind, span: Span) -> Self {
        Form {
            kind,
            span,
            meta: Vec::new(),
        }
    }

    pub fn nil(span: Span) -> Self {
        Form::new(FormKind::Nil, span)
    }

    pub fn symbol(name: &str, span: Span) -> Self {
        Form::new(FormKind::Symbol(Symbol::parse(name)), span)
    }

    pub fn keyword(name: &str, span: Span) -> Self {
        Form::new(FormKind::Keyword(Symbol::parse(name)), span)
    }

    pub fn int(n: i64, span: Span) -> Self {
        Form::new(FormKind::Int(n), span)
    }

    pub fn string(s: impl Into<String>, span: Span) -> Self {
        Form::new(FormKind::String(s.into()), span)
    }

    pub fn list(items: Vec<Form>, span: Span) -> Self {
        Form::new(FormKind::List(items), span)
    }

    pub fn is_atom(&self) -> bool {
        !matches!(
            self.kind,
            FormKind::List(_)
                | FormKind::Vector(_)
                | FormKind::Map(_)
                | FormKind::Set(_)
                | FormKind::Tagged { .. }
                | FormKind::ReaderCond { .. }
        )
    }

    /// Metadata may attach to symbols and compound forms only.
    pub fn accepts_meta(&self) -> bool {
        matches!(
            self.kind,
            FormKind::Symbol(_)
                | FormKind::List(_)
                | FormKind::Vector(_)
                | FormKind::Map(_)
                | FormKind::Set(_)
                | FormKind::Tagged { .. }
        )
    }

    pub fn merge_meta(&mut self, entries: Vec<(Form, Form)>) {
        for (k, v) in entries {
            if let Some(slot) = self.meta.iter_mut().find(|(ek, _)| ek == &k) {
                slot.1 = v;
            } else {
                self.meta.push((k, v));
            }
        }
    }

    pub fn meta_get(&self, key: &str) -> Option<&Form> {
        self.meta.iter().find_map(|(k, v)| match &k.kind {
            FormKind::Keyword(sym) if sym.ns.is_none() && sym.name == key => Some(v),
            _ => None,
        })
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        matches!(self.meta_get(key).map(|f| &f.kind), Some(FormKind::Bool(true)))
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match &self.kind {
            FormKind::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&Symbol> {
        match &self.kind {
            FormKind::Keyword(sym) => Some(sym),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Form]> {
        match &self.kind {
            FormKind::List(items) => Some(items),
            _ => None,
        }
    }

    /// True for `(head ...)` with the given simple (unqualified) head symbol.
    pub fn is_call_to(&self, head: &str) -> bool {
        match &self.kind {
            FormKind::List(items) => matches!(
                items.first().and_then(|f| f.as_symbol()),
                Some(sym) if sym.ns.is_none() && sym.name == head
            ),
            _ => false,
        }
    }

    pub fn truthy_literal(&self) -> Option<bool> {
        match &self.kind {
            FormKind::Nil | FormKind::Bool(false) => Some(false),
            _ if self.is_atom() => Some(true),
            _ => None,
        }
    }
}

/// Structural equality ignores spans and metadata.
impl PartialEq for Form {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Form {}

impl PartialEq for FormKind {
    fn eq(&self, other: &Self) -> bool {
        use FormKind::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (BigInt(a), BigInt(b)) => a == b,
            (Ratio(a), Ratio(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (BigDecimal(a), BigDecimal(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Regex(a), Regex(b)) => a == b,
            (Keyword(a), Keyword(b)) => a == b,
            (Symbol(a), Symbol(b)) => a == b,
            (List(a), List(b)) | (Vector(a), Vector(b)) => a == b,
            (Set(a), Set(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Tagged { tag: ta, value: va }, Tagged { tag: tb, value: vb }) => {
                ta == tb && va == vb
            }
            (
                ReaderCond {
                    splicing: sa,
                    branches: ba,
                },
                ReaderCond {
                    splicing: sb,
                    branches: bb,
                },
            ) => sa == sb && ba == bb,
            _ => false,
        }
    }
}

impl Eq for FormKind {}

impl Hash for Form {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl Hash for FormKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            FormKind::Nil => {}
            FormKind::Bool(b) => b.hash(state),
            FormKind::Int(n) => n.hash(state),
            FormKind::BigInt(n) => n.hash(state),
            FormKind::Ratio(r) => r.hash(state),
            FormKind::Float(f) => f.to_bits().hash(state),
            FormKind::BigDecimal(d) => d.to_string().hash(state),
            FormKind::Char(c) => c.hash(state),
            FormKind::String(s) | FormKind::Regex(s) => s.hash(state),
            FormKind::Keyword(sym) | FormKind::Symbol(sym) => sym.hash(state),
            FormKind::List(items) | FormKind::Vector(items) | FormKind::Set(items) => {
                items.hash(state)
            }
            FormKind::Map(entries) => entries.hash(state),
            FormKind::Tagged { tag, value } => {
                tag.hash(state);
                value.hash(state);
            }
            FormKind::ReaderCond { splicing, branches } => {
                splicing.hash(state);
                branches.hash(state);
            }
        }
    }
}

fn char_name(c: char) -> Option<&'static str> {
    match c {
        ' ' => Some("space"),
        '\t' => Some("tab"),
        '\n' => Some("newline"),
        '\r' => Some("return"),
        '\u{0c}' => Some("formfeed"),
        '\u{08}' => Some("backspace"),
        _ => None,
    }
}

fn write_string_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in s.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            _ => write!(f, "{}", ch)?,
        }
    }
    f.write_str("\"")
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[Form], close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(close)
}

/// Canonical printed syntax. Metadata is elided; `read(print(v))` yields a
/// structurally equal value for every printable form.
impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl fmt::Display for FormKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormKind::Nil => f.write_str("nil"),
            FormKind::Bool(b) => write!(f, "{}", b),
            FormKind::Int(n) => write!(f, "{}", n),
            FormKind::BigInt(n) => write!(f, "{}N", n),
            FormKind::Ratio(r) => write!(f, "{}/{}", r.numer(), r.denom()),
            FormKind::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            FormKind::BigDecimal(d) => write!(f, "{}M", d),
            FormKind::Char(c) => match char_name(*c) {
                Some(name) => write!(f, "\\{}", name),
                None => write!(f, "\\{}", c),
            },
            FormKind::String(s) => write_string_literal(f, s),
            FormKind::Regex(p) => write!(f, "#\"{}\"", p),
            FormKind::Keyword(sym) => write!(f, ":{}", sym),
            FormKind::Symbol(sym) => write!(f, "{}", sym),
            FormKind::List(items) => write_seq(f, "(", items, ")"),
            FormKind::Vector(items) => write_seq(f, "[", items, "]"),
            FormKind::Set(items) => write_seq(f, "#{", items, "}"),
            FormKind::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{} {}", k, v)?;
                }
                f.write_str("}")
            }
            FormKind::Tagged { tag, value } => write!(f, "#{} {}", tag, value),
            FormKind::ReaderCond { splicing, branches } => {
                f.write_str(if *splicing { "#?@(" } else { "#?(" })?;
                for (i, (feature, branch)) in branches.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{} {}", feature, branch)?;
                }
                f.write_str(")")
            }
        }
    }
}
