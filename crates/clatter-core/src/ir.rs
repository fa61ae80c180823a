use std::fmt;

use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use num_rational::BigRational;

use crate::ast::Symbol;

/// One loadable Core IR module. Immutable once flushed from the module
/// context; `Display` renders the textual `.core` dump.
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub name: String,
    pub attrs: Vec<(String, Literal)>,
    pub exports: Vec<FunName>,
    pub funs: Vec<FunDef>,
    /// Run once at load time, before the module is callable. Lifted constants
    /// initialize here.
    pub on_load: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunName {
    pub name: String,
    pub arity: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunDef {
    pub name: String,
    pub params: Vec<String>,
    /// The last parameter collects any remaining arguments.
    pub variadic: bool,
    pub body: Expr,
}

impl FunDef {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Nil,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Ratio(BigRational),
    Float(f64),
    Decimal(BigDecimal),
    Char(char),
    String(String),
    Keyword(Symbol),
    Symbol(Symbol),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// A lexical variable introduced by `Let`, `LetRec`, lambda params or a
    /// pattern bind.
    Var(String),
    /// Reference to a named top-level function.
    FunRef {
        module: String,
        name: String,
        arity: usize,
    },
    /// Closure over the lexical scope. Multi-arity fns carry one method per
    /// arity; application dispatches on argument count.
    Lambda {
        methods: Vec<LambdaMethod>,
        self_name: Option<String>,
    },
    Apply {
        f: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Inter-module call, `module:function(args)`.
    Call {
        module: String,
        function: String,
        args: Vec<Expr>,
    },
    Let {
        bindings: Vec<(String, Expr)>,
        body: Box<Expr>,
    },
    /// A named single function recursion target applied immediately; the
    /// compilation of `loop*` and of every fn method body. `TailCall` jumps
    /// back to it.
    LetRec {
        name: String,
        params: Vec<String>,
        fun_body: Box<Expr>,
        args: Vec<Expr>,
    },
    TailCall {
        target: String,
        args: Vec<Expr>,
    },
    Seq(Vec<Expr>),
    Case {
        subject: Box<Expr>,
        clauses: Vec<Clause>,
    },
    Try {
        body: Box<Expr>,
        catches: Vec<CatchClause>,
        finally: Option<Box<Expr>>,
    },
    Throw(Box<Expr>),
    Receive {
        clauses: Vec<Clause>,
        after: Option<AfterClause>,
    },
    Tuple(Vec<Expr>),
    /// Host list construction.
    List(Vec<Expr>),
    /// Host map construction.
    MapNew(Vec<(Expr, Expr)>),
    Binary(Vec<BinSegment>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LambdaMethod {
    pub params: Vec<String>,
    pub variadic: bool,
    pub body: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Clause {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatchClause {
    /// `None` matches every thrown value (`:default`).
    pub class: Option<Symbol>,
    pub var: String,
    pub stack_var: Option<String>,
    pub body: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AfterClause {
    pub timeout: Box<Expr>,
    pub body: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    Wildcard,
    Bind(String),
    Literal(Literal),
    Tuple(Vec<Pattern>),
    List {
        items: Vec<Pattern>,
        tail: Option<Box<Pattern>>,
    },
    /// Partial match on host map entries.
    Map(Vec<(Literal, Pattern)>),
    Alias {
        name: String,
        pattern: Box<Pattern>,
    },
}

impl Module {
    pub fn fun(&self, name: &str, arity: usize) -> Option<&FunDef> {
        self.funs
            .iter()
            .find(|f| f.name == name && f.arity() == arity)
    }

    pub fn exports_fun(&self, name: &str, arity: usize) -> bool {
        self.exports
            .iter()
            .any(|e| e.name == name && e.arity == arity)
    }
}

// ---- textual dump ---------------------------------------------------------

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "(module {}", self.name)?;
        for (key, value) in &self.attrs {
            writeln!(f, "  (attr {} {})", key, value)?;
        }
        for export in &self.exports {
            writeln!(f, "  (export {}/{})", export.name, export.arity)?;
        }
        if !self.on_load.is_empty() {
            writeln!(f, "  (on-load")?;
            for expr in &self.on_load {
                writeln!(f, "    {}", expr)?;
            }
            writeln!(f, "  )")?;
        }
        for fun in &self.funs {
            let variadic = if fun.variadic { " &" } else { "" };
            writeln!(
                f,
                "  (fun {}/{} ({}{})\n    {})",
                fun.name,
                fun.arity(),
                fun.params.join(" "),
                variadic,
                fun.body
            )?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Nil => f.write_str("nil"),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Int(n) => write!(f, "{}", n),
            Literal::BigInt(n) => write!(f, "{}N", n),
            Literal::Ratio(r) => write!(f, "{}/{}", r.numer(), r.denom()),
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::Decimal(d) => write!(f, "{}M", d),
            Literal::Char(c) => write!(f, "\\{}", c),
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::Keyword(sym) => write!(f, ":{}", sym),
            Literal::Symbol(sym) => write!(f, "'{}", sym),
        }
    }
}

fn write_exprs(f: &mut fmt::Formatter<'_>, exprs: &[Expr]) -> fmt::Result {
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{}", expr)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => write!(f, "{}", lit),
            Expr::Var(name) => write!(f, "{}", name),
            Expr::FunRef {
                module,
                name,
                arity,
            } => write!(f, "(fn-ref {}:{}/{})", module, name, arity),
            Expr::Lambda { methods, .. } => {
                f.write_str("(lambda")?;
                for m in methods {
                    let variadic = if m.variadic { " &" } else { "" };
                    write!(f, " (({}{}) {})", m.params.join(" "), variadic, m.body)?;
                }
                f.write_str(")")
            }
            Expr::Apply { f: callee, args } => {
                write!(f, "(apply {} ", callee)?;
                write_exprs(f, args)?;
                f.write_str(")")
            }
            Expr::Call {
                module,
                function,
                args,
            } => {
                write!(f, "(call {}:{} ", module, function)?;
                write_exprs(f, args)?;
                f.write_str(")")
            }
            Expr::Let { bindings, body } => {
                f.write_str("(let (")?;
                for (i, (name, value)) in bindings.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "({} {})", name, value)?;
                }
                write!(f, ") {})", body)
            }
            Expr::LetRec {
                name,
                params,
                fun_body,
                args,
            } => {
                write!(
                    f,
                    "(letrec {} ({}) {} (",
                    name,
                    params.join(" "),
                    fun_body
                )?;
                write_exprs(f, args)?;
                f.write_str("))")
            }
            Expr::TailCall { target, args } => {
                write!(f, "(goto {} ", target)?;
                write_exprs(f, args)?;
                f.write_str(")")
            }
            Expr::Seq(exprs) => {
                f.write_str("(seq ")?;
                write_exprs(f, exprs)?;
                f.write_str(")")
            }
            Expr::Case { subject, clauses } => {
                write!(f, "(case {}", subject)?;
                for clause in clauses {
                    write!(f, " {}", clause)?;
                }
                f.write_str(")")
            }
            Expr::Try {
                body,
                catches,
                finally,
            } => {
                write!(f, "(try {}", body)?;
                for catch in catches {
                    let class = catch
                        .class
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "_".into());
                    write!(f, " (catch {} {} {})", class, catch.var, catch.body)?;
                }
                if let Some(fin) = finally {
                    write!(f, " (finally {})", fin)?;
                }
                f.write_str(")")
            }
            Expr::Throw(value) => write!(f, "(throw {})", value),
            Expr::Receive { clauses, after } => {
                f.write_str("(receive")?;
                for clause in clauses {
                    write!(f, " {}", clause)?;
                }
                if let Some(after) = after {
                    write!(f, " (after {} {})", after.timeout, after.body)?;
                }
                f.write_str(")")
            }
            Expr::Tuple(items) => {
                f.write_str("(tuple ")?;
                write_exprs(f, items)?;
                f.write_str(")")
            }
            Expr::List(items) => {
                f.write_str("(list ")?;
                write_exprs(f, items)?;
                f.write_str(")")
            }
            Expr::MapNew(entries) => {
                f.write_str("(map")?;
                for (k, v) in entries {
                    write!(f, " {} {}", k, v)?;
                }
                f.write_str(")")
            }
            Expr::Binary(segments) => {
                f.write_str("(binary")?;
                for seg in segments {
                    write!(f, " {}", seg)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.guard {
            Some(guard) => write!(f, "({} when {} -> {})", self.pattern, guard, self.body),
            None => write!(f, "({} -> {})", self.pattern, self.body),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Wildcard => f.write_str("_"),
            Pattern::Bind(name) => write!(f, "{}", name),
            Pattern::Literal(lit) => write!(f, "{}", lit),
            Pattern::Tuple(items) => {
                f.write_str("{")?;
                for (i, p) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str("}")
            }
            Pattern::List { items, tail } => {
                f.write_str("[")?;
                for (i, p) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", p)?;
                }
                if let Some(tail) = tail {
                    write!(f, " | {}", tail)?;
                }
                f.write_str("]")
            }
            Pattern::Map(entries) => {
                f.write_str("#{")?;
                for (i, (k, p)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{} {}", k, p)?;
                }
                f.write_str("}")
            }
            Pattern::Alias { name, pattern } => write!(f, "(= {} {})", name, pattern),
        }
    }
}

/// Binary segment in a `Binary` constructor.
#[derive(Clone, Debug, PartialEq)]
pub struct BinSegment {
    pub value: Expr,
    pub size: Option<Box<Expr>>,
    pub unit: u32,
    pub kind: SegmentKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Int,
    Float,
    Bytes,
    Utf8,
}

impl fmt::Display for BinSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SegmentKind::Int => "int",
            SegmentKind::Float => "float",
            SegmentKind::Bytes => "bytes",
            SegmentKind::Utf8 => "utf8",
        };
        match &self.size {
            Some(size) => write!(f, "({}:{} {} unit {})", self.value, size, kind, self.unit),
            None => write!(f, "({} {} unit {})", self.value, kind, self.unit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_dump_is_stable() {
        let module = Module {
            name: "ex".into(),
            attrs: vec![],
            exports: vec![FunName {
                name: "x".into(),
                arity: 0,
            }],
            funs: vec![FunDef {
                name: "x".into(),
                params: vec![],
                variadic: false,
                body: Expr::Literal(Literal::Int(1)),
            }],
            on_load: vec![],
        };
        let dump = module.to_string();
        assert!(dump.contains("(module ex"));
        assert!(dump.contains("(export x/0)"));
        assert!(dump.contains("(fun x/0"));
    }
}
