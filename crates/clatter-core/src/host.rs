use std::collections::HashMap as StdHashMap;
use std::sync::{Arc, RwLock};

use im::{HashMap, Vector};
use num_bigint::BigInt;

use crate::ast::Symbol;
use crate::error::ClatterError;
use crate::ir::{CatchClause, Clause, Expr, FunDef, Literal, Module, Pattern};
use crate::namespaces::RegistryRef;
use crate::reader::RT_NS;
use crate::value::{Closure, FnValue, Value};

/// Options forwarded to the assembler.
#[derive(Clone, Debug)]
pub struct AssembleOptions {
    pub from_core: bool,
    pub binary: bool,
    pub return_errors: bool,
    pub return_warnings: bool,
    pub source: Option<String>,
    /// Extra options appended from the environment.
    pub extra: Vec<String>,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        AssembleOptions {
            from_core: true,
            binary: true,
            return_errors: true,
            return_warnings: true,
            source: None,
            extra: Vec::new(),
        }
    }
}

/// The seam to the host VM: assembling Core IR to bytecode, loading modules,
/// evaluating emitted expressions, and applying function values (macros run
/// through the same door).
pub trait HostVm: Send + Sync {
    fn assemble(&self, module: &Module, opts: &AssembleOptions) -> Result<Vec<u8>, ClatterError>;
    fn load(&self, name: &str, bytecode: &[u8]) -> Result<(), ClatterError>;
    fn eval(&self, exprs: &[Expr]) -> Result<Value, ClatterError>;
    fn apply(&self, f: &Value, args: &[Value]) -> Result<Value, ClatterError>;

    /// The currently loaded tree for `name`, used to reopen a module when a
    /// later form appends to it.
    fn loaded(&self, name: &str) -> Option<Module> {
        let _ = name;
        None
    }
}

type Scope = HashMap<String, Value>;

/// Reference host: interprets loaded Core IR modules in process. Backs the
/// test suite and `clatter run` when no external VM is configured. Assembled
/// bytecode is the textual module dump; the module tree itself is staged in
/// memory and promoted on `load`.
pub struct InMemoryHost {
    registry: RegistryRef,
    staged: RwLock<StdHashMap<String, Arc<Module>>>,
    loaded: RwLock<StdHashMap<String, Arc<Module>>>,
    consts: RwLock<StdHashMap<(String, i64), Value>>,
}

impl InMemoryHost {
    pub fn new(registry: RegistryRef) -> Self {
        InMemoryHost {
            registry,
            staged: RwLock::new(StdHashMap::new()),
            loaded: RwLock::new(StdHashMap::new()),
            consts: RwLock::new(StdHashMap::new()),
        }
    }

    pub fn loaded_module(&self, name: &str) -> Option<Arc<Module>> {
        self.loaded.read().unwrap().get(name).cloned()
    }

    fn module_fun(&self, module: &str, function: &str, argc: usize) -> Option<(Arc<Module>, FunDef)> {
        let loaded = self.loaded.read().unwrap();
        let m = loaded.get(module)?.clone();
        if let Some(fun) = m.fun(function, argc) {
            let fun = fun.clone();
            return Some((m, fun));
        }
        let variadic = m
            .funs
            .iter()
            .find(|f| {
                f.name == function && f.variadic && argc + 1 >= f.params.len()
            })?
            .clone();
        Some((m, variadic))
    }

    fn call_module_fun(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, ClatterError> {
        if module == RT_NS {
            return self.native_call(function, args);
        }
        let (_, fun) = self.module_fun(module, function, args.len()).ok_or_else(|| {
            ClatterError::thrown_message(format!(
                "undefined function {}:{}/{}",
                module,
                function,
                args.len()
            ))
        })?;
        let env = bind_params(&fun.params, fun.variadic, args);
        match self.eval_flow(&fun.body, &env)? {
            Flow::Val(value) => Ok(value),
            Flow::Recur { .. } => Err(ClatterError::thrown_message(
                "recur escaped its loop target",
            )),
        }
    }

    // ---- interpreter -----------------------------------------------------

    fn eval_flow(&self, expr: &Expr, env: &Scope) -> Result<Flow, ClatterError> {
        match expr {
            Expr::Literal(lit) => Ok(Flow::Val(literal_value(lit))),
            Expr::Var(name) => match env.get(name) {
                Some(value) => Ok(Flow::Val(value.clone())),
                None => Err(ClatterError::thrown_message(format!(
                    "unbound variable {}",
                    name
                ))),
            },
            Expr::FunRef {
                module,
                name,
                arity,
            } => Ok(Flow::Val(Value::Fn(FnValue::Module {
                module: module.clone(),
                name: name.clone(),
                arities: std::iter::once(*arity).collect(),
                variadic: None,
            }))),
            Expr::Lambda { methods, self_name } => {
                Ok(Flow::Val(Value::Fn(FnValue::Closure(Arc::new(Closure {
                    methods: methods.clone(),
                    env: env.clone(),
                    self_name: self_name.clone(),
                })))))
            }
            Expr::Apply { f, args } => {
                let callee = self.eval_value(f, env)?;
                let args = self.eval_args(args, env)?;
                self.apply(&callee, &args).map(Flow::Val)
            }
            Expr::Call {
                module,
                function,
                args,
            } => {
                let args = self.eval_args(args, env)?;
                self.call_module_fun(module, function, args).map(Flow::Val)
            }
            Expr::Let { bindings, body } => {
                let mut scope = env.clone();
                for (name, value) in bindings {
                    let value = self.eval_value(value, &scope)?;
                    scope.insert(name.clone(), value);
                }
                self.eval_flow(body, &scope)
            }
            Expr::LetRec {
                name,
                params,
                fun_body,
                args,
            } => {
                let mut current = self.eval_args(args, env)?;
                loop {
                    if current.len() != params.len() {
                        return Err(ClatterError::thrown_message(format!(
                            "loop {} expects {} values, got {}",
                            name,
                            params.len(),
                            current.len()
                        )));
                    }
                    let mut scope = env.clone();
                    for (param, value) in params.iter().zip(current) {
                        scope.insert(param.clone(), value);
                    }
                    match self.eval_flow(fun_body, &scope)? {
                        Flow::Recur { target, args } if &target == name => {
                            current = args;
                        }
                        other => return Ok(other),
                    }
                }
            }
            Expr::TailCall { target, args } => Ok(Flow::Recur {
                target: target.clone(),
                args: self.eval_args(args, env)?,
            }),
            Expr::Seq(exprs) => match exprs.split_last() {
                None => Ok(Flow::Val(Value::Nil)),
                Some((last, init)) => {
                    for expr in init {
                        self.eval_value(expr, env)?;
                    }
                    self.eval_flow(last, env)
                }
            },
            Expr::Case { subject, clauses } => {
                let subject = self.eval_value(subject, env)?;
                for Clause {
                    pattern,
                    guard,
                    body,
                } in clauses
                {
                    if let Some(scope) = match_pattern(pattern, &subject, env) {
                        if let Some(guard) = guard {
                            if !self.eval_value(guard, &scope)?.is_truthy() {
                                continue;
                            }
                        }
                        return self.eval_flow(body, &scope);
                    }
                }
                Err(ClatterError::thrown_message(format!(
                    "no case clause matched {}",
                    subject
                )))
            }
            Expr::Try {
                body,
                catches,
                finally,
            } => {
                let outcome = self.eval_flow(body, env);
                let outcome = match outcome {
                    Err(err) => self.run_catches(catches, err, env),
                    ok => ok,
                };
                if let Some(finally) = finally {
                    self.eval_value(finally, env)?;
                }
                outcome
            }
            Expr::Throw(value) => {
                let value = self.eval_value(value, env)?;
                Err(ClatterError::thrown(value))
            }
            Expr::Receive { .. } => Err(ClatterError::thrown_message(
                "receive is not supported by the reference host",
            )),
            Expr::Tuple(items) => Ok(Flow::Val(Value::Tuple(Arc::new(
                self.eval_args(items, env)?,
            )))),
            Expr::List(items) => Ok(Flow::Val(Value::List(
                self.eval_args(items, env)?.into_iter().collect(),
            ))),
            Expr::MapNew(entries) => {
                let mut map = HashMap::new();
                for (k, v) in entries {
                    map.insert(self.eval_value(k, env)?, self.eval_value(v, env)?);
                }
                Ok(Flow::Val(Value::Map(map)))
            }
            Expr::Binary(segments) => {
                let mut bytes = Vec::new();
                for seg in segments {
                    let value = self.eval_value(&seg.value, env)?;
                    match (&seg.kind, value) {
                        (crate::ir::SegmentKind::Int, Value::Int(n)) => {
                            bytes.push((n & 0xff) as u8)
                        }
                        (crate::ir::SegmentKind::Utf8, Value::String(s)) => {
                            bytes.extend_from_slice(s.as_bytes())
                        }
                        (crate::ir::SegmentKind::Bytes, Value::Binary(b)) => {
                            bytes.extend_from_slice(&b)
                        }
                        (_, other) => {
                            return Err(ClatterError::thrown_message(format!(
                                "unsupported binary segment value {}",
                                other
                            )))
                        }
                    }
                }
                Ok(Flow::Val(Value::Binary(Arc::new(bytes))))
            }
        }
    }

    fn run_catches(
        &self,
        catches: &[CatchClause],
        err: ClatterError,
        env: &Scope,
    ) -> Result<Flow, ClatterError> {
        let thrown = match err.thrown_value() {
            Some(value) => value.clone(),
            // host-level failures propagate past user catches
            None => return Err(err),
        };
        for catch in catches {
            let matches = match &catch.class {
                None => true,
                Some(class) => thrown
                    .record_type()
                    .map(|rtype| &rtype == class)
                    .unwrap_or(false),
            };
            if !matches {
                continue;
            }
            let mut scope = env.clone();
            scope.insert(catch.var.clone(), thrown.clone());
            if let Some(stack_var) = &catch.stack_var {
                scope.insert(stack_var.clone(), Value::List(Vector::new()));
            }
            return self.eval_flow(&catch.body, &scope);
        }
        Err(err)
    }

    fn eval_value(&self, expr: &Expr, env: &Scope) -> Result<Value, ClatterError> {
        match self.eval_flow(expr, env)? {
            Flow::Val(value) => Ok(value),
            Flow::Recur { .. } => Err(ClatterError::thrown_message(
                "recur escaped its loop target",
            )),
        }
    }

    fn eval_args(&self, exprs: &[Expr], env: &Scope) -> Result<Vec<Value>, ClatterError> {
        exprs.iter().map(|e| self.eval_value(e, env)).collect()
    }

    // ---- rt natives ------------------------------------------------------

    fn native_call(&self, function: &str, mut args: Vec<Value>) -> Result<Value, ClatterError> {
        match function {
            "const-put" => {
                let (module, index) = const_key(&args)?;
                let value = args.pop().expect("const-put arity checked");
                self.consts.write().unwrap().insert((module, index), value);
                Ok(Value::Nil)
            }
            "const-get" => {
                let (module, index) = const_key(&args)?;
                self.consts
                    .read()
                    .unwrap()
                    .get(&(module.clone(), index))
                    .cloned()
                    .ok_or_else(|| {
                        ClatterError::thrown_message(format!(
                            "missing constant {} in {}",
                            index, module
                        ))
                    })
            }
            "def" => {
                let [Value::String(ns), Value::String(name), Value::Bool(dynamic), Value::Bool(is_macro), value] =
                    args.as_slice()
                else {
                    return Err(bad_native_args("def"));
                };
                let var = self.registry.write().unwrap().intern(ns.as_str(), name.as_str());
                var.set_dynamic(*dynamic);
                var.set_macro(*is_macro);
                var.set_root(value.clone());
                Ok(Value::Var(var))
            }
            "declare" => {
                let [Value::String(ns), Value::String(name)] = args.as_slice() else {
                    return Err(bad_native_args("declare"));
                };
                let var = self.registry.write().unwrap().intern(ns.as_str(), name.as_str());
                Ok(Value::Var(var))
            }
            "var-val" => {
                let [Value::String(ns), Value::String(name)] = args.as_slice() else {
                    return Err(bad_native_args("var-val"));
                };
                let var = self.registry.write().unwrap().intern(ns.as_str(), name.as_str());
                var.deref().ok_or_else(|| {
                    ClatterError::thrown_message(format!("unbound var {}/{}", ns, name))
                })
            }
            "var-get" => {
                let [Value::String(ns), Value::String(name)] = args.as_slice() else {
                    return Err(bad_native_args("var-get"));
                };
                let var = self.registry.write().unwrap().intern(ns.as_str(), name.as_str());
                Ok(Value::Var(var))
            }
            "var-set" => {
                let [Value::String(ns), Value::String(name), value] = args.as_slice() else {
                    return Err(bad_native_args("var-set"));
                };
                let var = self.registry.write().unwrap().intern(ns.as_str(), name.as_str());
                if !crate::vars::set_in_current(&var, value.clone()) {
                    var.set_root(value.clone());
                }
                Ok(value.clone())
            }
            "not-implemented" => {
                let [Value::String(protocol), Value::String(method), value] = args.as_slice()
                else {
                    return Err(bad_native_args("not-implemented"));
                };
                Err(ClatterError::NotImplemented {
                    protocol: protocol.to_string(),
                    method: method.to_string(),
                    value_type: value.type_name(),
                    context: Default::default(),
                })
            }
            "record-get" => {
                let [record, key] = args.as_slice() else {
                    return Err(bad_native_args("record-get"));
                };
                match record {
                    Value::Map(entries) => Ok(entries.get(key).cloned().unwrap_or(Value::Nil)),
                    _ => Err(ClatterError::thrown_message(format!(
                        "record-get on non-record {}",
                        record
                    ))),
                }
            }
            "type" => {
                let [value] = args.as_slice() else {
                    return Err(bad_native_args("type"));
                };
                Ok(Value::Symbol(Symbol::parse(&value.type_name())))
            }
            "fn-ref" => {
                let [Value::String(module), Value::String(name), arities, variadic] =
                    args.as_slice()
                else {
                    return Err(bad_native_args("fn-ref"));
                };
                let mut set = std::collections::BTreeSet::new();
                for arity in seq_items(arities)? {
                    match arity {
                        Value::Int(n) => {
                            set.insert(n as usize);
                        }
                        _ => return Err(bad_native_args("fn-ref")),
                    }
                }
                let variadic = match variadic {
                    Value::Int(n) => Some(*n as usize),
                    Value::Nil => None,
                    _ => return Err(bad_native_args("fn-ref")),
                };
                Ok(Value::Fn(FnValue::Module {
                    module: module.to_string(),
                    name: name.to_string(),
                    arities: set,
                    variadic,
                }))
            }
            "tagged" => {
                let [Value::Symbol(tag), value] = args.as_slice() else {
                    return Err(bad_native_args("tagged"));
                };
                Ok(Value::Tagged {
                    tag: tag.clone(),
                    value: Arc::new(value.clone()),
                })
            }
            "re-pattern" => {
                let [Value::String(pattern)] = args.as_slice() else {
                    return Err(bad_native_args("re-pattern"));
                };
                regex::Regex::new(pattern)
                    .map(|re| Value::Regex(Arc::new(re)))
                    .map_err(|e| {
                        ClatterError::thrown_message(format!("invalid regex: {}", e))
                    })
            }
            "with-meta" => {
                let [value, _meta] = args.as_slice() else {
                    return Err(bad_native_args("with-meta"));
                };
                // the reference host does not track value metadata
                Ok(value.clone())
            }
            "monitor-enter" | "monitor-exit" => Ok(Value::Nil),
            "list" => Ok(Value::List(args.into_iter().collect())),
            "vector" => Ok(Value::Vector(args.into_iter().collect())),
            "tuple" => Ok(Value::Tuple(Arc::new(args))),
            "concat" => {
                let mut out = Vector::new();
                for arg in &args {
                    out.append(seq_items(arg)?);
                }
                Ok(Value::List(out))
            }
            "vec" => {
                let [coll] = args.as_slice() else {
                    return Err(bad_native_args("vec"));
                };
                Ok(Value::Vector(seq_items(coll)?))
            }
            "set" => {
                let [coll] = args.as_slice() else {
                    return Err(bad_native_args("set"));
                };
                Ok(Value::Set(seq_items(coll)?.into_iter().collect()))
            }
            "map*" => {
                let [coll] = args.as_slice() else {
                    return Err(bad_native_args("map*"));
                };
                let items = seq_items(coll)?;
                if items.len() % 2 != 0 {
                    return Err(ClatterError::thrown_message(
                        "map* expects an even number of items",
                    ));
                }
                let mut map = HashMap::new();
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    map.insert(k, v);
                }
                Ok(Value::Map(map))
            }
            "seq" => {
                let [coll] = args.as_slice() else {
                    return Err(bad_native_args("seq"));
                };
                let items = seq_items(coll)?;
                if items.is_empty() {
                    Ok(Value::Nil)
                } else {
                    Ok(Value::List(items))
                }
            }
            "cons" => {
                let [head, coll] = args.as_slice() else {
                    return Err(bad_native_args("cons"));
                };
                let mut items = seq_items(coll)?;
                items.push_front(head.clone());
                Ok(Value::List(items))
            }
            "first" => {
                let [coll] = args.as_slice() else {
                    return Err(bad_native_args("first"));
                };
                Ok(seq_items(coll)?.front().cloned().unwrap_or(Value::Nil))
            }
            "rest" => {
                let [coll] = args.as_slice() else {
                    return Err(bad_native_args("rest"));
                };
                let mut items = seq_items(coll)?;
                if !items.is_empty() {
                    items.pop_front();
                }
                Ok(Value::List(items))
            }
            "count" => {
                let [coll] = args.as_slice() else {
                    return Err(bad_native_args("count"));
                };
                let count = match coll {
                    Value::Nil => 0,
                    Value::String(s) => s.chars().count(),
                    Value::Map(m) => m.len(),
                    Value::Set(s) => s.len(),
                    other => seq_items(other)?.len(),
                };
                Ok(Value::Int(count as i64))
            }
            "nth" => {
                let [coll, Value::Int(n)] = args.as_slice() else {
                    return Err(bad_native_args("nth"));
                };
                seq_items(coll)?
                    .get(*n as usize)
                    .cloned()
                    .ok_or_else(|| ClatterError::thrown_message(format!("index {} out of bounds", n)))
            }
            "get" => match args.as_slice() {
                [coll, key] => Ok(collection_get(coll, key).unwrap_or(Value::Nil)),
                [coll, key, default] => {
                    Ok(collection_get(coll, key).unwrap_or_else(|| default.clone()))
                }
                _ => Err(bad_native_args("get")),
            },
            "contains?" => {
                let [coll, key] = args.as_slice() else {
                    return Err(bad_native_args("contains?"));
                };
                let found = match coll {
                    Value::Map(m) => m.contains_key(key),
                    Value::Set(s) => s.contains(key),
                    Value::Vector(items) => match key {
                        Value::Int(n) => (*n as usize) < items.len(),
                        _ => false,
                    },
                    _ => false,
                };
                Ok(Value::Bool(found))
            }
            "assoc" => {
                let [coll, key, value] = args.as_slice() else {
                    return Err(bad_native_args("assoc"));
                };
                match coll {
                    Value::Map(m) => {
                        Ok(Value::Map(m.update(key.clone(), value.clone())))
                    }
                    _ => Err(ClatterError::thrown_message("assoc expects a map")),
                }
            }
            "str" => {
                let mut out = String::new();
                for arg in &args {
                    match arg {
                        Value::Nil => {}
                        Value::String(s) => out.push_str(s),
                        Value::Char(c) => out.push(*c),
                        other => out.push_str(&other.to_string()),
                    }
                }
                Ok(Value::string(out))
            }
            "println" => {
                let text = args
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.to_string(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("{}", text);
                Ok(Value::Nil)
            }
            "apply" => {
                if args.len() < 2 {
                    return Err(bad_native_args("apply"));
                }
                let callee = args.remove(0);
                let last = args.pop().expect("apply arity checked");
                let mut call_args = args;
                call_args.extend(seq_items(&last)?);
                self.apply(&callee, &call_args)
            }
            "satisfies?" => {
                let [Value::String(protocol), value] = args.as_slice() else {
                    return Err(bad_native_args("satisfies?"));
                };
                self.call_module_fun(protocol.as_str(), "__satisfies__", vec![value.clone()])
            }
            "extenders" => {
                let [Value::String(protocol)] = args.as_slice() else {
                    return Err(bad_native_args("extenders"));
                };
                self.call_module_fun(protocol.as_str(), "__extenders__", vec![])
            }
            "+" => numeric_fold(args, 0, |a, b| a.checked_add(b), |a, b| a + b, |a, b| a + b),
            "*" => numeric_fold(args, 1, |a, b| a.checked_mul(b), |a, b| a * b, |a, b| a * b),
            "-" => {
                if args.is_empty() {
                    return Err(bad_native_args("-"));
                }
                if args.len() == 1 {
                    args.insert(0, Value::Int(0));
                }
                let first = args.remove(0);
                let mut acc = first;
                for arg in args {
                    acc = numeric_binop(
                        &acc,
                        &arg,
                        |a, b| a.checked_sub(b),
                        |a, b| a - b,
                        |a, b| a - b,
                    )?;
                }
                Ok(acc)
            }
            "inc" => {
                let [value] = args.as_slice() else {
                    return Err(bad_native_args("inc"));
                };
                numeric_binop(value, &Value::Int(1), |a, b| a.checked_add(b), |a, b| a + b, |a, b| a + b)
            }
            "dec" => {
                let [value] = args.as_slice() else {
                    return Err(bad_native_args("dec"));
                };
                numeric_binop(value, &Value::Int(1), |a, b| a.checked_sub(b), |a, b| a - b, |a, b| a - b)
            }
            "=" => {
                let [a, b] = args.as_slice() else {
                    return Err(bad_native_args("="));
                };
                Ok(Value::Bool(values_equal(a, b)))
            }
            "<" | ">" | "<=" | ">=" => {
                let [a, b] = args.as_slice() else {
                    return Err(bad_native_args(function));
                };
                let ord = numeric_compare(a, b)?;
                let result = match function {
                    "<" => ord.is_lt(),
                    ">" => ord.is_gt(),
                    "<=" => ord.is_le(),
                    _ => ord.is_ge(),
                };
                Ok(Value::Bool(result))
            }
            name => {
                if let Some(kind_name) = name.strip_suffix('?') {
                    if let Some(kind) = crate::value::PrimKind::from_name(kind_name) {
                        let [value] = args.as_slice() else {
                            return Err(bad_native_args(name));
                        };
                        return Ok(Value::Bool(value.prim_kind() == Some(kind)));
                    }
                }
                Err(ClatterError::thrown_message(format!(
                    "undefined function {}:{}/{}",
                    RT_NS,
                    name,
                    args.len()
                )))
            }
        }
    }
}

impl HostVm for InMemoryHost {
    /// The reference assembler validates exports and emits the textual dump
    /// as "bytecode"; the module tree is staged for `load`.
    fn assemble(&self, module: &Module, opts: &AssembleOptions) -> Result<Vec<u8>, ClatterError> {
        for export in &module.exports {
            if module.fun(&export.name, export.arity).is_none() {
                return Err(ClatterError::assembly(format!(
                    "{}: exported function {}/{} is undefined",
                    module.name, export.name, export.arity
                )));
            }
        }
        self.staged
            .write()
            .unwrap()
            .insert(module.name.clone(), Arc::new(module.clone()));
        let mut dump = String::new();
        if let Some(source) = &opts.source {
            dump.push_str(&format!(";; source: {}\n", source));
        }
        dump.push_str(&module.to_string());
        Ok(dump.into_bytes())
    }

    fn load(&self, name: &str, _bytecode: &[u8]) -> Result<(), ClatterError> {
        let staged = self.staged.write().unwrap().remove(name);
        let module = match staged {
            Some(module) => module,
            None => self
                .loaded
                .read()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    ClatterError::load(format!("module {} was never assembled", name))
                })?,
        };
        self.loaded
            .write()
            .unwrap()
            .insert(name.to_string(), module.clone());
        let scope = Scope::new();
        for expr in &module.on_load {
            self.eval_value(expr, &scope)
                .map_err(|e| ClatterError::load(format!("{}: on-load failed: {}", name, e)))?;
        }
        Ok(())
    }

    fn eval(&self, exprs: &[Expr]) -> Result<Value, ClatterError> {
        let scope = Scope::new();
        let mut last = Value::Nil;
        for expr in exprs {
            last = self.eval_value(expr, &scope)?;
        }
        Ok(last)
    }

    fn loaded(&self, name: &str) -> Option<Module> {
        self.loaded_module(name).map(|m| (*m).clone())
    }

    fn apply(&self, f: &Value, args: &[Value]) -> Result<Value, ClatterError> {
        match f {
            Value::Fn(FnValue::Module {
                module,
                name,
                ..
            }) => self.call_module_fun(module, name, args.to_vec()),
            Value::Fn(FnValue::Closure(closure)) => {
                let method = select_method(&closure.methods, args.len()).ok_or_else(|| {
                    ClatterError::thrown_message(format!(
                        "no overload of arity {} for anonymous fn",
                        args.len()
                    ))
                })?;
                let mut scope = closure.env.clone();
                if let Some(self_name) = &closure.self_name {
                    scope.insert(self_name.clone(), f.clone());
                }
                let bound = bind_params(&method.params, method.variadic, args.to_vec());
                for (name, value) in bound {
                    scope.insert(name, value);
                }
                match self.eval_flow(&method.body, &scope)? {
                    Flow::Val(value) => Ok(value),
                    Flow::Recur { .. } => Err(ClatterError::thrown_message(
                        "recur escaped its loop target",
                    )),
                }
            }
            Value::Keyword(_) => match args {
                [coll] => Ok(collection_get(coll, f).unwrap_or(Value::Nil)),
                [coll, default] => {
                    Ok(collection_get(coll, f).unwrap_or_else(|| default.clone()))
                }
                _ => Err(ClatterError::thrown_message(
                    "keyword lookup expects one or two arguments",
                )),
            },
            Value::Var(var) => {
                let value = var.deref().ok_or_else(|| {
                    ClatterError::thrown_message(format!(
                        "unbound var {}",
                        var.qualified_name()
                    ))
                })?;
                self.apply(&value, args)
            }
            other => Err(ClatterError::thrown_message(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }
}

enum Flow {
    Val(Value),
    Recur { target: String, args: Vec<Value> },
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Nil => Value::Nil,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::Int(*n),
        Literal::BigInt(n) => Value::BigInt(n.clone()),
        Literal::Ratio(r) => Value::Ratio(r.clone()),
        Literal::Float(x) => Value::Float(*x),
        Literal::Decimal(d) => Value::Decimal(d.clone()),
        Literal::Char(c) => Value::Char(*c),
        Literal::String(s) => Value::string(s.clone()),
        Literal::Keyword(sym) => Value::Keyword(sym.clone()),
        Literal::Symbol(sym) => Value::Symbol(sym.clone()),
    }
}

fn bind_params(params: &[String], variadic: bool, mut args: Vec<Value>) -> Scope {
    let mut scope = Scope::new();
    if variadic && !params.is_empty() {
        let fixed = params.len() - 1;
        let rest: Vector<Value> = args.split_off(fixed.min(args.len())).into_iter().collect();
        for (param, value) in params[..fixed].iter().zip(args) {
            scope.insert(param.clone(), value);
        }
        let rest_value = if rest.is_empty() {
            Value::Nil
        } else {
            Value::List(rest)
        };
        scope.insert(params[fixed].clone(), rest_value);
    } else {
        for (param, value) in params.iter().zip(args) {
            scope.insert(param.clone(), value);
        }
    }
    scope
}

fn select_method(methods: &[crate::ir::LambdaMethod], argc: usize) -> Option<&crate::ir::LambdaMethod> {
    methods
        .iter()
        .find(|m| !m.variadic && m.params.len() == argc)
        .or_else(|| {
            methods
                .iter()
                .find(|m| m.variadic && argc + 1 >= m.params.len())
        })
}

fn match_pattern(pattern: &Pattern, value: &Value, env: &Scope) -> Option<Scope> {
    let mut scope = env.clone();
    match_into(pattern, value, &mut scope).then_some(scope)
}

fn match_into(pattern: &Pattern, value: &Value, scope: &mut Scope) -> bool {
    match pattern {
        Pattern::Wildcard => true,
        Pattern::Bind(name) => {
            scope.insert(name.clone(), value.clone());
            true
        }
        Pattern::Literal(lit) => values_equal(&literal_value(lit), value),
        Pattern::Tuple(patterns) => match value {
            Value::Tuple(items) if items.len() == patterns.len() => patterns
                .iter()
                .zip(items.iter())
                .all(|(p, v)| match_into(p, v, scope)),
            Value::Vector(items) if items.len() == patterns.len() => patterns
                .iter()
                .zip(items.iter())
                .all(|(p, v)| match_into(p, v, scope)),
            _ => false,
        },
        Pattern::List { items, tail } => {
            let source = match value {
                Value::List(items) => items.clone(),
                Value::Vector(items) => items.clone(),
                _ => return false,
            };
            if source.len() < items.len() {
                return false;
            }
            if tail.is_none() && source.len() != items.len() {
                return false;
            }
            for (p, v) in items.iter().zip(source.iter()) {
                if !match_into(p, v, scope) {
                    return false;
                }
            }
            if let Some(tail) = tail {
                let rest: Vector<Value> = source.iter().skip(items.len()).cloned().collect();
                return match_into(tail, &Value::List(rest), scope);
            }
            true
        }
        Pattern::Map(entries) => match value {
            Value::Map(map) => entries.iter().all(|(key, p)| {
                match map.get(&literal_value(key)) {
                    Some(v) => match_into(p, v, scope),
                    None => false,
                }
            }),
            _ => false,
        },
        Pattern::Alias { name, pattern } => {
            if match_into(pattern, value, scope) {
                scope.insert(name.clone(), value.clone());
                true
            } else {
                false
            }
        }
    }
}

fn seq_items(value: &Value) -> Result<Vector<Value>, ClatterError> {
    match value {
        Value::Nil => Ok(Vector::new()),
        Value::List(items) | Value::Vector(items) => Ok(items.clone()),
        Value::Set(items) => Ok(items.iter().cloned().collect()),
        Value::Map(entries) => Ok(entries
            .iter()
            .map(|(k, v)| Value::Tuple(Arc::new(vec![k.clone(), v.clone()])))
            .collect()),
        other => Err(ClatterError::thrown_message(format!(
            "{} is not seqable",
            other.type_name()
        ))),
    }
}

fn collection_get(coll: &Value, key: &Value) -> Option<Value> {
    match coll {
        Value::Map(m) => m.get(key).cloned(),
        Value::Vector(items) => match key {
            Value::Int(n) => items.get(*n as usize).cloned(),
            _ => None,
        },
        Value::Set(s) => s.contains(key).then(|| key.clone()),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::BigInt(y)) | (Value::BigInt(y), Value::Int(x)) => {
            BigInt::from(*x) == *y
        }
        _ => a == b,
    }
}

fn numeric_fold(
    args: Vec<Value>,
    identity: i64,
    int_op: fn(i64, i64) -> Option<i64>,
    big_op: fn(BigInt, BigInt) -> BigInt,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, ClatterError> {
    let mut acc = Value::Int(identity);
    for arg in args {
        acc = numeric_binop(&acc, &arg, int_op, big_op, float_op)?;
    }
    Ok(acc)
}

fn numeric_binop(
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    big_op: fn(BigInt, BigInt) -> BigInt,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, ClatterError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(match int_op(*x, *y) {
            Some(n) => Value::Int(n),
            None => Value::BigInt(big_op(BigInt::from(*x), BigInt::from(*y))),
        }),
        (Value::BigInt(x), Value::BigInt(y)) => Ok(Value::BigInt(big_op(x.clone(), y.clone()))),
        (Value::Int(x), Value::BigInt(y)) => Ok(Value::BigInt(big_op(BigInt::from(*x), y.clone()))),
        (Value::BigInt(x), Value::Int(y)) => Ok(Value::BigInt(big_op(x.clone(), BigInt::from(*y)))),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(float_op(*x, *y))),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(float_op(*x, *y as f64))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(float_op(*x as f64, *y))),
        _ => Err(ClatterError::thrown_message(format!(
            "cannot apply arithmetic to {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn numeric_compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, ClatterError> {
    let to_f64 = |v: &Value| -> Option<f64> {
        match v {
            Value::Int(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            Value::BigInt(n) => {
                use num_traits::ToPrimitive;
                n.to_f64()
            }
            _ => None,
        }
    };
    match (to_f64(a), to_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).ok_or_else(|| {
            ClatterError::thrown_message("NaN is not comparable")
        }),
        _ => Err(ClatterError::thrown_message(format!(
            "cannot compare {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn const_key(args: &[Value]) -> Result<(String, i64), ClatterError> {
    match (args.first(), args.get(1)) {
        (Some(Value::String(module)), Some(Value::Int(index))) => {
            Ok((module.to_string(), *index))
        }
        _ => Err(bad_native_args("const")),
    }
}

fn bad_native_args(name: &str) -> ClatterError {
    ClatterError::thrown_message(format!("bad arguments to {}:{}", RT_NS, name))
}
