use crate::ast::{Form, Span, Symbol};
use crate::env::{Env, LocalBinding};
use crate::vars::Var;

/// Names the analyzer never macroexpands and dispatches on directly.
pub const SPECIAL_FORMS: &[&str] = &[
    "def",
    "if",
    "do",
    "let*",
    "loop*",
    "recur",
    "fn*",
    "letfn*",
    "quote",
    "var",
    "throw",
    "try",
    "catch",
    "finally",
    "new",
    ".",
    "set!",
    "case*",
    "reify*",
    "deftype*",
    "defprotocol",
    "extend-type",
    "import*",
    "monitor-enter",
    "monitor-exit",
    "receive*",
    "on-load*",
    "ns",
];

pub fn is_special_form(name: &str) -> bool {
    SPECIAL_FORMS.contains(&name)
}

/// One analyzed node. `env` is the lexical snapshot at analysis time, kept
/// for diagnostics; `form` is the source value the node came from.
#[derive(Clone, Debug)]
pub struct Node {
    pub op: Op,
    pub span: Span,
    pub form: Form,
    pub env: Env,
    /// Type hint from `^Tag` metadata, itself analyzed.
    pub tag: Option<Box<Node>>,
}

impl Node {
    pub fn new(op: Op, span: Span, form: Form, env: Env) -> Self {
        Node {
            op,
            span,
            form,
            env,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: Option<Node>) -> Self {
        self.tag = tag.map(Box::new);
        self
    }
}

#[derive(Clone, Debug)]
pub enum Op {
    /// A literal or quoted value.
    Constant { value: Form },
    Quote { expr: Box<Node> },
    /// A use of a resolved local.
    Local { binding: LocalBinding },
    /// An introduction of a local (params, let/loop/catch bindings).
    Binding { binding: LocalBinding },
    Fn {
        name: Option<Symbol>,
        methods: Vec<Node>,
        variadic: bool,
        fixed_arities: Vec<usize>,
        min_fixed_arity: usize,
        max_fixed_arity: usize,
        variadic_arity: Option<usize>,
        once: bool,
        self_binding: Option<LocalBinding>,
    },
    FnMethod {
        params: Vec<Node>,
        variadic: bool,
        fixed_arity: usize,
        loop_id: usize,
        body: Box<Node>,
    },
    Do {
        statements: Vec<Node>,
        ret: Box<Node>,
    },
    If {
        test: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },
    Let {
        bindings: Vec<(Node, Node)>,
        body: Box<Node>,
    },
    Loop {
        bindings: Vec<(Node, Node)>,
        loop_id: usize,
        body: Box<Node>,
    },
    Recur {
        exprs: Vec<Node>,
        loop_id: usize,
    },
    LetFn {
        bindings: Vec<(Node, Node)>,
        body: Box<Node>,
    },
    Case {
        test: Box<Node>,
        clauses: Vec<(Node, Node)>,
        default: Option<Box<Node>>,
    },
    /// Host (native) map construction.
    NativeMap { pairs: Vec<(Node, Node)> },
    /// Host (native) list construction.
    NativeList { items: Vec<Node> },
    Binary { segments: Vec<Node> },
    BinarySegment {
        value: Box<Node>,
        size: Option<Box<Node>>,
        unit: u32,
        kind: crate::ir::SegmentKind,
    },
    Tuple { items: Vec<Node> },
    Def {
        var: Var,
        name: Symbol,
        init: Option<Box<Node>>,
        dynamic: bool,
        is_macro: bool,
    },
    Import { type_name: String },
    New {
        type_name: Symbol,
        args: Vec<Node>,
    },
    DefType {
        name: Symbol,
        fields: Vec<Node>,
        impls: Vec<ProtocolImpl>,
    },
    DefProtocol {
        name: Symbol,
        methods: Vec<(String, Vec<usize>)>,
    },
    ExtendType {
        type_name: Symbol,
        impls: Vec<ProtocolImpl>,
    },
    Invoke {
        f: Box<Node>,
        args: Vec<Node>,
    },
    /// Runtime lookup of a type by name.
    ResolveType { name: Symbol },
    Throw { exception: Box<Node> },
    Try {
        body: Box<Node>,
        catches: Vec<Node>,
        finally: Option<Box<Node>>,
    },
    Catch {
        class: CatchClass,
        local: Box<Node>,
        stack_local: Option<Box<Node>>,
        body: Box<Node>,
    },
    /// A reference to a host function, `module:function/arity`. The arity is
    /// unknown when a bare qualified symbol is taken as a function value.
    HostFn {
        module: String,
        function: String,
        arity: Option<usize>,
    },
    VarRef { var: Var },
    /// A reference to a known type as a value.
    TypeRef { name: Symbol },
    WithMeta {
        expr: Box<Node>,
        meta: Box<Node>,
    },
    VectorLit { items: Vec<Node> },
    SetLit { items: Vec<Node> },
    MapLit { pairs: Vec<(Node, Node)> },
    Receive {
        clauses: Vec<(Node, Node)>,
        after: Option<Box<Node>>,
    },
    After {
        timeout: Box<Node>,
        body: Box<Node>,
    },
    /// `(= name pattern)` alias inside a `case*`/`receive*` pattern.
    PatternAlias {
        binding: Box<Node>,
        pattern: Box<Node>,
    },
    OnLoad { body: Box<Node> },
}

#[derive(Clone, Debug)]
pub struct ProtocolImpl {
    pub protocol: Symbol,
    /// Module that receives the method bodies: the type's module for record
    /// impls, a per-protocol module for primitive extensions.
    pub impl_module: String,
    pub methods: Vec<ProtocolMethodImpl>,
}

#[derive(Clone, Debug)]
pub struct ProtocolMethodImpl {
    pub name: String,
    /// A single-method fn node.
    pub fn_node: Node,
}

#[derive(Clone, Debug)]
pub enum CatchClass {
    /// `:default`, matching anything thrown.
    Default,
    Type(Symbol),
}

impl Op {
    /// Short tag name, handy in tests and diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            Op::Constant { .. } => "constant",
            Op::Quote { .. } => "quote",
            Op::Local { .. } => "local",
            Op::Binding { .. } => "binding",
            Op::Fn { .. } => "fn",
            Op::FnMethod { .. } => "fn_method",
            Op::Do { .. } => "do",
            Op::If { .. } => "if",
            Op::Let { .. } => "let",
            Op::Loop { .. } => "loop",
            Op::Recur { .. } => "recur",
            Op::LetFn { .. } => "letfn",
            Op::Case { .. } => "case",
            Op::NativeMap { .. } => "native_map",
            Op::NativeList { .. } => "native_list",
            Op::Binary { .. } => "binary",
            Op::BinarySegment { .. } => "binary_segment",
            Op::Tuple { .. } => "tuple",
            Op::Def { .. } => "def",
            Op::Import { .. } => "import",
            Op::New { .. } => "new",
            Op::DefType { .. } => "deftype",
            Op::DefProtocol { .. } => "defprotocol",
            Op::ExtendType { .. } => "extend_type",
            Op::Invoke { .. } => "invoke",
            Op::ResolveType { .. } => "resolve_type",
            Op::Throw { .. } => "throw",
            Op::Try { .. } => "try",
            Op::Catch { .. } => "catch",
            Op::HostFn { .. } => "host_fn",
            Op::VarRef { .. } => "var",
            Op::TypeRef { .. } => "type",
            Op::WithMeta { .. } => "with_meta",
            Op::VectorLit { .. } => "vector",
            Op::SetLit { .. } => "set",
            Op::MapLit { .. } => "map",
            Op::Receive { .. } => "receive",
            Op::After { .. } => "after",
            Op::PatternAlias { .. } => "alias",
            Op::OnLoad { .. } => "on_load",
        }
    }
}

/// Walks a node tree depth-first, calling `f` on every node.
pub fn walk<F: FnMut(&Node)>(node: &Node, f: &mut F) {
    f(node);
    let mut each = |n: &Node| walk(n, f);
    match &node.op {
        Op::Quote { expr } => each(expr),
        Op::Fn { methods, .. } => methods.iter().for_each(each),
        Op::FnMethod { params, body, .. } => {
            params.iter().for_each(&mut each);
            each(body);
        }
        Op::Do { statements, ret } => {
            statements.iter().for_each(&mut each);
            each(ret);
        }
        Op::If {
            test,
            then,
            otherwise,
        } => {
            each(test);
            each(then);
            each(otherwise);
        }
        Op::Let { bindings, body } | Op::LetFn { bindings, body } => {
            for (b, init) in bindings {
                each(b);
                each(init);
            }
            each(body);
        }
        Op::Loop { bindings, body, .. } => {
            for (b, init) in bindings {
                each(b);
                each(init);
            }
            each(body);
        }
        Op::Recur { exprs, .. } => exprs.iter().for_each(each),
        Op::Case {
            test,
            clauses,
            default,
        } => {
            each(test);
            for (pat, body) in clauses {
                each(pat);
                each(body);
            }
            if let Some(d) = default {
                each(d);
            }
        }
        Op::NativeMap { pairs } | Op::MapLit { pairs } => {
            for (k, v) in pairs {
                each(k);
                each(v);
            }
        }
        Op::NativeList { items }
        | Op::Tuple { items }
        | Op::VectorLit { items }
        | Op::SetLit { items } => items.iter().for_each(each),
        Op::Binary { segments } => segments.iter().for_each(each),
        Op::BinarySegment { value, size, .. } => {
            each(value);
            if let Some(size) = size {
                each(size);
            }
        }
        Op::Def { init, .. } => {
            if let Some(init) = init {
                each(init);
            }
        }
        Op::New { args, .. } => args.iter().for_each(each),
        Op::DefType { fields, impls, .. } => {
            fields.iter().for_each(&mut each);
            for pimpl in impls {
                for method in &pimpl.methods {
                    each(&method.fn_node);
                }
            }
        }
        Op::ExtendType { impls, .. } => {
            for pimpl in impls {
                for method in &pimpl.methods {
                    each(&method.fn_node);
                }
            }
        }
        Op::Invoke { f: callee, args } => {
            each(callee);
            args.iter().for_each(each);
        }
        Op::Throw { exception } => each(exception),
        Op::Try {
            body,
            catches,
            finally,
        } => {
            each(body);
            catches.iter().for_each(&mut each);
            if let Some(fin) = finally {
                each(fin);
            }
        }
        Op::Catch {
            local,
            stack_local,
            body,
            ..
        } => {
            each(local);
            if let Some(s) = stack_local {
                each(s);
            }
            each(body);
        }
        Op::WithMeta { expr, meta } => {
            each(expr);
            each(meta);
        }
        Op::Receive { clauses, after } => {
            for (pat, body) in clauses {
                each(pat);
                each(body);
            }
            if let Some(after) = after {
                each(after);
            }
        }
        Op::After { timeout, body } => {
            each(timeout);
            each(body);
        }
        Op::PatternAlias { binding, pattern } => {
            each(binding);
            each(pattern);
        }
        Op::OnLoad { body } => each(body),
        Op::Constant { .. }
        | Op::Local { .. }
        | Op::Binding { .. }
        | Op::Import { .. }
        | Op::DefProtocol { .. }
        | Op::ResolveType { .. }
        | Op::HostFn { .. }
        | Op::VarRef { .. }
        | Op::TypeRef { .. } => {}
    }
}
