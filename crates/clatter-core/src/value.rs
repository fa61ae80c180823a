use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bigdecimal::BigDecimal;
use im::{HashMap, HashSet, Vector};
use num_bigint::BigInt;
use num_rational::BigRational;
use regex::Regex;

use crate::ast::{Form, FormKind, Span, Symbol};
use crate::error::ClatterError;
use crate::ir::LambdaMethod;
use crate::vars::Var;

/// A runtime value as exchanged with the host VM.
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Ratio(BigRational),
    Float(f64),
    Decimal(BigDecimal),
    Char(char),
    String(Arc<String>),
    Keyword(Symbol),
    Symbol(Symbol),
    List(Vector<Value>),
    Vector(Vector<Value>),
    Map(HashMap<Value, Value>),
    Set(HashSet<Value>),
    Tuple(Arc<Vec<Value>>),
    Binary(Arc<Vec<u8>>),
    Regex(Arc<Regex>),
    Tagged {
        tag: Symbol,
        value: Arc<Value>,
    },
    Fn(FnValue),
    Var(Var),
}

#[derive(Clone, Debug)]
pub enum FnValue {
    /// Named top-level functions of a loaded module, one entry per arity.
    Module {
        module: String,
        name: String,
        arities: BTreeSet<usize>,
        /// Minimum argument count accepted by the variadic overload, if any.
        variadic: Option<usize>,
    },
    Closure(Arc<Closure>),
}

#[derive(Debug)]
pub struct Closure {
    pub methods: Vec<LambdaMethod>,
    pub env: HashMap<String, Value>,
    pub self_name: Option<String>,
}

/// Host value shapes onto which protocols may be extended. The numeric order
/// of this enum is frozen; generated dispatch modules emit their primitive
/// clauses in exactly this sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrimKind {
    Nil = 1,
    Boolean,
    Integer,
    BigInteger,
    Ratio,
    Float,
    Decimal,
    Char,
    Str,
    Keyword,
    Symbol,
    Tuple,
    List,
    Map,
}

pub const PRIM_ORDER: [PrimKind; 14] = [
    PrimKind::Nil,
    PrimKind::Boolean,
    PrimKind::Integer,
    PrimKind::BigInteger,
    PrimKind::Ratio,
    PrimKind::Float,
    PrimKind::Decimal,
    PrimKind::Char,
    PrimKind::Str,
    PrimKind::Keyword,
    PrimKind::Symbol,
    PrimKind::Tuple,
    PrimKind::List,
    PrimKind::Map,
];

impl PrimKind {
    pub fn from_name(name: &str) -> Option<PrimKind> {
        Some(match name {
            "nil" => PrimKind::Nil,
            "boolean" => PrimKind::Boolean,
            "integer" => PrimKind::Integer,
            "bigint" => PrimKind::BigInteger,
            "ratio" => PrimKind::Ratio,
            "float" => PrimKind::Float,
            "decimal" => PrimKind::Decimal,
            "char" => PrimKind::Char,
            "string" => PrimKind::Str,
            "keyword" => PrimKind::Keyword,
            "symbol" => PrimKind::Symbol,
            "tuple" => PrimKind::Tuple,
            "list" => PrimKind::List,
            "map" => PrimKind::Map,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrimKind::Nil => "nil",
            PrimKind::Boolean => "boolean",
            PrimKind::Integer => "integer",
            PrimKind::BigInteger => "bigint",
            PrimKind::Ratio => "ratio",
            PrimKind::Float => "float",
            PrimKind::Decimal => "decimal",
            PrimKind::Char => "char",
            PrimKind::Str => "string",
            PrimKind::Keyword => "keyword",
            PrimKind::Symbol => "symbol",
            PrimKind::Tuple => "tuple",
            PrimKind::List => "list",
            PrimKind::Map => "map",
        }
    }

    /// Guard predicate used by generated dispatch clauses.
    pub fn predicate(&self) -> &'static str {
        match self {
            PrimKind::Nil => "nil?",
            PrimKind::Boolean => "boolean?",
            PrimKind::Integer => "integer?",
            PrimKind::BigInteger => "bigint?",
            PrimKind::Ratio => "ratio?",
            PrimKind::Float => "float?",
            PrimKind::Decimal => "decimal?",
            PrimKind::Char => "char?",
            PrimKind::Str => "string?",
            PrimKind::Keyword => "keyword?",
            PrimKind::Symbol => "symbol?",
            PrimKind::Tuple => "tuple?",
            PrimKind::List => "list?",
            PrimKind::Map => "map?",
        }
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(Arc::new(s.into()))
    }

    pub fn keyword(name: &str) -> Value {
        Value::Keyword(Symbol::parse(name))
    }

    pub fn symbol(name: &str) -> Value {
        Value::Symbol(Symbol::parse(name))
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Primitive dispatch shape, when the value has one. Vectors, sets, fns
    /// and other non-extensible shapes answer `None` and fall through to the
    /// catch-all clause.
    pub fn prim_kind(&self) -> Option<PrimKind> {
        Some(match self {
            Value::Nil => PrimKind::Nil,
            Value::Bool(_) => PrimKind::Boolean,
            Value::Int(_) => PrimKind::Integer,
            Value::BigInt(_) => PrimKind::BigInteger,
            Value::Ratio(_) => PrimKind::Ratio,
            Value::Float(_) => PrimKind::Float,
            Value::Decimal(_) => PrimKind::Decimal,
            Value::Char(_) => PrimKind::Char,
            Value::String(_) => PrimKind::Str,
            Value::Keyword(_) => PrimKind::Keyword,
            Value::Symbol(_) => PrimKind::Symbol,
            Value::Tuple(_) => PrimKind::Tuple,
            Value::List(_) => PrimKind::List,
            Value::Map(_) if self.record_type().is_none() => PrimKind::Map,
            _ => return None,
        })
    }

    /// The `:type` discriminator of a tagged record, when present.
    pub fn record_type(&self) -> Option<Symbol> {
        match self {
            Value::Map(entries) => match entries.get(&Value::keyword("type")) {
                Some(Value::Symbol(sym)) => Some(sym.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn type_name(&self) -> String {
        if let Some(rtype) = self.record_type() {
            return rtype.to_string();
        }
        match self {
            Value::Nil => "nil".into(),
            Value::Bool(_) => "boolean".into(),
            Value::Int(_) => "integer".into(),
            Value::BigInt(_) => "bigint".into(),
            Value::Ratio(_) => "ratio".into(),
            Value::Float(_) => "float".into(),
            Value::Decimal(_) => "decimal".into(),
            Value::Char(_) => "char".into(),
            Value::String(_) => "string".into(),
            Value::Keyword(_) => "keyword".into(),
            Value::Symbol(_) => "symbol".into(),
            Value::List(_) => "list".into(),
            Value::Vector(_) => "vector".into(),
            Value::Map(_) => "map".into(),
            Value::Set(_) => "set".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Binary(_) => "binary".into(),
            Value::Regex(_) => "regex".into(),
            Value::Tagged { tag, .. } => format!("tagged/{}", tag),
            Value::Fn(_) => "fn".into(),
            Value::Var(_) => "var".into(),
        }
    }

    /// Constant conversion under quote semantics.
    pub fn from_form(form: &Form) -> Result<Value, ClatterError> {
        Ok(match &form.kind {
            FormKind::Nil => Value::Nil,
            FormKind::Bool(b) => Value::Bool(*b),
            FormKind::Int(n) => Value::Int(*n),
            FormKind::BigInt(n) => Value::BigInt(n.clone()),
            FormKind::Ratio(r) => Value::Ratio(r.clone()),
            FormKind::Float(x) => Value::Float(*x),
            FormKind::BigDecimal(d) => Value::Decimal(d.clone()),
            FormKind::Char(c) => Value::Char(*c),
            FormKind::String(s) => Value::string(s.clone()),
            FormKind::Regex(p) => Value::Regex(Arc::new(Regex::new(p).map_err(|e| {
                ClatterError::bad_form(format!("invalid regex constant: {}", e))
                    .with_span(form.span)
            })?)),
            FormKind::Keyword(sym) => Value::Keyword(sym.clone()),
            FormKind::Symbol(sym) => Value::Symbol(sym.clone()),
            FormKind::List(items) => Value::List(
                items
                    .iter()
                    .map(Value::from_form)
                    .collect::<Result<_, _>>()?,
            ),
            FormKind::Vector(items) => Value::Vector(
                items
                    .iter()
                    .map(Value::from_form)
                    .collect::<Result<_, _>>()?,
            ),
            FormKind::Set(items) => Value::Set(
                items
                    .iter()
                    .map(Value::from_form)
                    .collect::<Result<_, _>>()?,
            ),
            FormKind::Map(entries) => {
                let mut map = HashMap::new();
                for (k, v) in entries {
                    map.insert(Value::from_form(k)?, Value::from_form(v)?);
                }
                Value::Map(map)
            }
            FormKind::Tagged { tag, value } => Value::Tagged {
                tag: tag.clone(),
                value: Arc::new(Value::from_form(value)?),
            },
            FormKind::ReaderCond { .. } => {
                return Err(ClatterError::bad_form(
                    "unresolved reader conditional cannot become a value",
                )
                .with_span(form.span))
            }
        })
    }

    /// The inverse of `from_form`, used to feed macroexpansion results back
    /// into the analyzer. Functions and vars have no reader syntax.
    pub fn to_form(&self, span: Span) -> Result<Form, ClatterError> {
        Ok(match self {
            Value::Nil => Form::nil(span),
            Value::Bool(b) => Form::new(FormKind::Bool(*b), span),
            Value::Int(n) => Form::new(FormKind::Int(*n), span),
            Value::BigInt(n) => Form::new(FormKind::BigInt(n.clone()), span),
            Value::Ratio(r) => Form::new(FormKind::Ratio(r.clone()), span),
            Value::Float(x) => Form::new(FormKind::Float(*x), span),
            Value::Decimal(d) => Form::new(FormKind::BigDecimal(d.clone()), span),
            Value::Char(c) => Form::new(FormKind::Char(*c), span),
            Value::String(s) => Form::string(s.as_str(), span),
            Value::Keyword(sym) => Form::new(FormKind::Keyword(sym.clone()), span),
            Value::Symbol(sym) => Form::new(FormKind::Symbol(sym.clone()), span),
            Value::Regex(re) => Form::new(FormKind::Regex(re.as_str().to_string()), span),
            Value::List(items) => Form::new(
                FormKind::List(
                    items
                        .iter()
                        .map(|v| v.to_form(span))
                        .collect::<Result<_, _>>()?,
                ),
                span,
            ),
            Value::Vector(items) => Form::new(
                FormKind::Vector(
                    items
                        .iter()
                        .map(|v| v.to_form(span))
                        .collect::<Result<_, _>>()?,
                ),
                span,
            ),
            Value::Set(items) => Form::new(
                FormKind::Set(
                    items
                        .iter()
                        .map(|v| v.to_form(span))
                        .collect::<Result<_, _>>()?,
                ),
                span,
            ),
            Value::Map(entries) => {
                let mut pairs = Vec::new();
                for (k, v) in entries {
                    pairs.push((k.to_form(span)?, v.to_form(span)?));
                }
                Form::new(FormKind::Map(pairs), span)
            }
            Value::Tuple(items) => {
                // no reader syntax for tuples; macroexpansion surfaces them
                // through the rt constructor
                let mut forms = vec![Form::symbol("clatter.rt/tuple", span)];
                for item in items.iter() {
                    forms.push(item.to_form(span)?);
                }
                Form::list(forms, span)
            }
            Value::Tagged { tag, value } => Form::new(
                FormKind::Tagged {
                    tag: tag.clone(),
                    value: Box::new(value.to_form(span)?),
                },
                span,
            ),
            Value::Binary(_) | Value::Fn(_) | Value::Var(_) => {
                return Err(ClatterError::bad_form(format!(
                    "{} has no reader representation",
                    self.type_name()
                )))
            }
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (BigInt(a), BigInt(b)) => a == b,
            (Ratio(a), Ratio(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Decimal(a), Decimal(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Keyword(a), Keyword(b)) => a == b,
            (Symbol(a), Symbol(b)) => a == b,
            (List(a), List(b)) | (Vector(a), Vector(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Set(a), Set(b)) => a == b,
            (Tuple(a), Tuple(b)) => a == b,
            (Binary(a), Binary(b)) => a == b,
            (Regex(a), Regex(b)) => a.as_str() == b.as_str(),
            (Tagged { tag: ta, value: va }, Tagged { tag: tb, value: vb }) => {
                ta == tb && va == vb
            }
            (Fn(a), Fn(b)) => match (a, b) {
                (
                    FnValue::Module {
                        module: ma,
                        name: na,
                        ..
                    },
                    FnValue::Module {
                        module: mb,
                        name: nb,
                        ..
                    },
                ) => ma == mb && na == nb,
                (FnValue::Closure(a), FnValue::Closure(b)) => Arc::ptr_eq(a, b),
                _ => false,
            },
            (Var(a), Var(b)) => a.ns() == b.ns() && a.name() == b.name(),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(n) => n.hash(state),
            Value::BigInt(n) => n.hash(state),
            Value::Ratio(r) => r.hash(state),
            Value::Float(x) => x.to_bits().hash(state),
            Value::Decimal(d) => d.to_string().hash(state),
            Value::Char(c) => c.hash(state),
            Value::String(s) => s.hash(state),
            Value::Keyword(sym) | Value::Symbol(sym) => sym.hash(state),
            Value::List(items) | Value::Vector(items) => items.hash(state),
            Value::Map(entries) => entries.hash(state),
            Value::Set(items) => items.hash(state),
            Value::Tuple(items) => items.hash(state),
            Value::Binary(bytes) => bytes.hash(state),
            Value::Regex(re) => re.as_str().hash(state),
            Value::Tagged { tag, value } => {
                tag.hash(state);
                value.hash(state);
            }
            Value::Fn(FnValue::Module { module, name, .. }) => {
                module.hash(state);
                name.hash(state);
            }
            Value::Fn(FnValue::Closure(c)) => (Arc::as_ptr(c) as usize).hash(state),
            Value::Var(var) => {
                var.ns().hash(state);
                var.name().hash(state);
            }
        }
    }
}

fn write_value_seq(f: &mut fmt::Formatter<'_>, items: &Vector<Value>) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::BigInt(n) => write!(f, "{}N", n),
            Value::Ratio(r) => write!(f, "{}/{}", r.numer(), r.denom()),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Decimal(d) => write!(f, "{}M", d),
            Value::Char(c) => write!(f, "\\{}", c),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Keyword(sym) => write!(f, ":{}", sym),
            Value::Symbol(sym) => write!(f, "{}", sym),
            Value::List(items) => {
                f.write_str("(")?;
                write_value_seq(f, items)?;
                f.write_str(")")
            }
            Value::Vector(items) => {
                f.write_str("[")?;
                write_value_seq(f, items)?;
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} {}", k, v)?;
                }
                f.write_str("}")
            }
            Value::Set(items) => {
                f.write_str("#{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("}")
            }
            Value::Tuple(items) => {
                f.write_str("#tuple[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Binary(bytes) => {
                f.write_str("#bin[")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", b)?;
                }
                f.write_str("]")
            }
            Value::Regex(re) => write!(f, "#\"{}\"", re.as_str()),
            Value::Tagged { tag, value } => write!(f, "#{} {}", tag, value),
            Value::Fn(FnValue::Module { module, name, .. }) => {
                write!(f, "#fn<{}:{}>", module, name)
            }
            Value::Fn(FnValue::Closure(_)) => f.write_str("#fn<anonymous>"),
            Value::Var(var) => write!(f, "#'{}/{}", var.ns(), var.name()),
        }
    }
}
