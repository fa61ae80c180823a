use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ast::{Form, FormKind, Span, Symbol};
use crate::env::{BindingKind, Env, LocalBinding, LoopTarget};
use crate::error::{format_warning, ClatterError, ErrorData};
use crate::hir::{is_special_form, CatchClass, Node, Op, ProtocolImpl, ProtocolMethodImpl};
use crate::host::HostVm;
use crate::namespaces::{RegistryRef, Resolution};
use crate::protocols::{ImplKey, ProtocolMethod, ProtocolsRef};
use crate::reader::RT_NS;
use crate::value::{PrimKind, Value};

#[derive(Clone, Debug, Default)]
pub struct AnalyzerOptions {
    pub file: Option<String>,
    pub no_warn_symbol_as_host_fun: bool,
    pub no_warn_dynamic_var_name: bool,
}

/// Macro-expands and lowers one top-level form at a time into the typed AST,
/// interning vars and registering protocols and types as it goes.
pub struct Analyzer {
    registry: RegistryRef,
    protocols: ProtocolsRef,
    host: Arc<dyn HostVm>,
    pub opts: AnalyzerOptions,
    next_binding_id: usize,
    next_loop_id: usize,
    next_gensym: usize,
    pub warnings: Vec<String>,
}

impl Analyzer {
    pub fn new(
        registry: RegistryRef,
        protocols: ProtocolsRef,
        host: Arc<dyn HostVm>,
        opts: AnalyzerOptions,
    ) -> Self {
        Analyzer {
            registry,
            protocols,
            host,
            opts,
            next_binding_id: 0,
            next_loop_id: 0,
            next_gensym: 0,
            warnings: Vec::new(),
        }
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn current_ns(&self) -> String {
        self.registry.read().unwrap().current_ns().to_string()
    }

    pub fn analyze(&mut self, form: &Form, env: &Env) -> Result<Node, ClatterError> {
        let form = self.macroexpand(form, env)?;
        let tag = match form.meta_get("tag").cloned() {
            Some(tag_form) => Some(self.constant(&tag_form, env)),
            None => None,
        };
        let node = self.analyze_form(&form, env)?;
        Ok(node.with_tag(tag))
    }

    fn analyze_form(&mut self, form: &Form, env: &Env) -> Result<Node, ClatterError> {
        match &form.kind {
            FormKind::List(items) if items.is_empty() => Ok(self.constant(form, env)),
            FormKind::List(items) => self.analyze_seq(form, items, env),
            FormKind::Symbol(sym) => self.analyze_symbol(sym, form, env),
            // collection literals of nothing but constants are constants
            // themselves, which lets the emitter lift them to on-load
            FormKind::Vector(items) => {
                if is_constant_form(form) {
                    return Ok(self.constant(form, env));
                }
                let items = self.analyze_all(items, &env.with_tail(false))?;
                Ok(self.node(Op::VectorLit { items }, form, env))
            }
            FormKind::Set(items) => {
                if is_constant_form(form) {
                    return Ok(self.constant(form, env));
                }
                let items = self.analyze_all(items, &env.with_tail(false))?;
                Ok(self.node(Op::SetLit { items }, form, env))
            }
            FormKind::Map(entries) => {
                if is_constant_form(form) {
                    return Ok(self.constant(form, env));
                }
                let pairs = self.analyze_pairs(entries, &env.with_tail(false))?;
                Ok(self.node(Op::MapLit { pairs }, form, env))
            }
            FormKind::Tagged { tag, value } if tag.ns.as_deref() == Some("host") => {
                self.analyze_host_literal(form, tag, value, env)
            }
            FormKind::ReaderCond { .. } => Err(self.bad_form(
                form.span,
                "reader conditional was preserved and cannot be analyzed",
            )),
            _ => Ok(self.constant(form, env)),
        }
    }

    // ---- macroexpansion --------------------------------------------------

    pub fn macroexpand(&mut self, form: &Form, env: &Env) -> Result<Form, ClatterError> {
        let mut current = form.clone();
        while let Some(next) = self.macroexpand1(&current, env)? {
            current = next;
        }
        Ok(current)
    }

    fn macroexpand1(&mut self, form: &Form, env: &Env) -> Result<Option<Form>, ClatterError> {
        let FormKind::List(items) = &form.kind else {
            return Ok(None);
        };
        let Some(head) = items.first().and_then(|f| f.as_symbol()) else {
            return Ok(None);
        };
        if head.ns.is_none() && (is_special_form(&head.name) || env.lookup(&head.name).is_some()) {
            return Ok(None);
        }
        let resolved = {
            let registry = self.registry.read().unwrap();
            registry.resolve(registry.current_ns(), head)
        };
        let Some(Resolution::Var(var)) = resolved else {
            return Ok(None);
        };
        if !var.is_macro() {
            return Ok(None);
        }
        let macro_fn = var.root().ok_or_else(|| {
            ClatterError::macro_failed(
                var.qualified_name(),
                ClatterError::thrown_message("macro var is unbound"),
            )
            .with_span(form.span)
            .with_file(self.opts.file.clone())
        })?;
        let mut args = Vec::with_capacity(items.len() - 1);
        for item in &items[1..] {
            args.push(Value::from_form(item)?);
        }
        let result = self.host.apply(&macro_fn, &args).map_err(|cause| {
            ClatterError::macro_failed(var.qualified_name(), cause)
                .with_span(form.span)
                .with_file(self.opts.file.clone())
        })?;
        let expanded = result.to_form(form.span).map_err(|cause| {
            ClatterError::macro_failed(var.qualified_name(), cause)
                .with_span(form.span)
                .with_file(self.opts.file.clone())
        })?;
        Ok(Some(expanded))
    }

    // ---- dispatch --------------------------------------------------------

    fn analyze_seq(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        if let Some(head) = items[0].as_symbol().cloned() {
            if head.ns.is_none() {
                if is_special_form(&head.name) && env.lookup(&head.name).is_none() {
                    return self.analyze_special(&head.name, form, items, env);
                }
                // (Type. args) constructor sugar
                if head.name.len() > 1 && head.name.ends_with('.') {
                    let type_sym = Symbol::simple(head.name.trim_end_matches('.'));
                    let mut rewritten = vec![
                        Form::symbol("new", items[0].span),
                        Form::new(FormKind::Symbol(type_sym), items[0].span),
                    ];
                    rewritten.extend_from_slice(&items[1..]);
                    return self.analyze_special("new", form, &rewritten, env);
                }
            }
        }
        let arg_env = env.with_tail(false);
        let mut callee = self.analyze(&items[0], &arg_env)?;
        // call-position host fn picks up the call arity
        if let Op::HostFn { arity: arity @ None, .. } = &mut callee.op {
            *arity = Some(items.len() - 1);
        }
        let args = self.analyze_all(&items[1..], &arg_env)?;
        Ok(self.node(
            Op::Invoke {
                f: Box::new(callee),
                args,
            },
            form,
            env,
        ))
    }

    fn analyze_special(
        &mut self,
        name: &str,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        match name {
            "def" => self.analyze_def(form, items, env),
            "if" => self.analyze_if(form, items, env),
            "do" => {
                let body = self.analyze_body(&items[1..], form, env)?;
                Ok(body)
            }
            "let*" => self.analyze_let(form, items, env, false),
            "loop*" => self.analyze_let(form, items, env, true),
            "recur" => self.analyze_recur(form, items, env),
            "fn*" => self.analyze_fn(form, items, env),
            "letfn*" => self.analyze_letfn(form, items, env),
            "quote" => {
                if items.len() != 2 {
                    return Err(self.bad_form(form.span, "quote expects exactly one form"));
                }
                let inner = self.constant(&items[1], env);
                Ok(self.node(
                    Op::Quote {
                        expr: Box::new(inner),
                    },
                    form,
                    env,
                ))
            }
            "var" => {
                let sym = items
                    .get(1)
                    .and_then(|f| f.as_symbol())
                    .ok_or_else(|| self.bad_form(form.span, "var expects a symbol"))?;
                let resolved = {
                    let registry = self.registry.read().unwrap();
                    registry.resolve(registry.current_ns(), sym)
                };
                match resolved {
                    Some(Resolution::Var(var)) => Ok(self.node(Op::VarRef { var }, form, env)),
                    _ => Err(self.unresolved(form.span, sym)),
                }
            }
            "throw" => {
                if items.len() != 2 {
                    return Err(self.bad_form(form.span, "throw expects exactly one form"));
                }
                let exception = self.analyze(&items[1], &env.with_tail(false))?;
                Ok(self.node(
                    Op::Throw {
                        exception: Box::new(exception),
                    },
                    form,
                    env,
                ))
            }
            "try" => self.analyze_try(form, items, env),
            "catch" | "finally" => Err(self.bad_form(
                form.span,
                format!("{} is only valid directly inside try", name),
            )),
            "new" => self.analyze_new(form, items, env),
            "." => self.analyze_dot(form, items, env),
            "set!" => self.analyze_set(form, items, env),
            "case*" => self.analyze_case(form, items, env),
            "reify*" => self.analyze_reify(form, items, env),
            "deftype*" => self.analyze_deftype(form, items, env),
            "defprotocol" => self.analyze_defprotocol(form, items, env),
            "extend-type" => self.analyze_extend_type(form, items, env),
            "import*" => self.analyze_import(form, items, env),
            "monitor-enter" | "monitor-exit" => {
                if items.len() != 2 {
                    return Err(
                        self.bad_form(form.span, format!("{} expects exactly one form", name))
                    );
                }
                let arg = self.analyze(&items[1], &env.with_tail(false))?;
                let host = self.node(
                    Op::HostFn {
                        module: RT_NS.to_string(),
                        function: name.to_string(),
                        arity: Some(1),
                    },
                    form,
                    env,
                );
                Ok(self.node(
                    Op::Invoke {
                        f: Box::new(host),
                        args: vec![arg],
                    },
                    form,
                    env,
                ))
            }
            "receive*" => self.analyze_receive(form, items, env),
            "on-load*" => {
                let body = self.analyze_body(&items[1..], form, &env.with_tail(false))?;
                Ok(self.node(
                    Op::OnLoad {
                        body: Box::new(body),
                    },
                    form,
                    env,
                ))
            }
            "ns" => self.analyze_ns(form, items, env),
            other => Err(self.bad_form(form.span, format!("unhandled special form {}", other))),
        }
    }

    // ---- symbols ---------------------------------------------------------

    fn analyze_symbol(
        &mut self,
        sym: &Symbol,
        form: &Form,
        env: &Env,
    ) -> Result<Node, ClatterError> {
        if sym.ns.is_none() {
            if let Some(binding) = env.lookup(&sym.name) {
                return Ok(self.node(
                    Op::Local {
                        binding: binding.clone(),
                    },
                    form,
                    env,
                ));
            }
        }
        let current = self.current_ns();
        let resolved = self.registry.read().unwrap().resolve(&current, sym);
        match resolved {
            Some(Resolution::Var(var)) => return Ok(self.node(Op::VarRef { var }, form, env)),
            Some(Resolution::Type(type_name)) => {
                return Ok(self.node(
                    Op::TypeRef {
                        name: Symbol::parse(&type_name),
                    },
                    form,
                    env,
                ))
            }
            None => {}
        }
        if let Some(qualifier) = &sym.ns {
            // Type/static access through an import
            let import_target = self
                .registry
                .read()
                .unwrap()
                .get(&current)
                .and_then(|ns| ns.imports.get(qualifier).cloned());
            if let Some(type_name) = import_target {
                return Ok(self.node(
                    Op::HostFn {
                        module: type_name,
                        function: sym.name.clone(),
                        arity: None,
                    },
                    form,
                    env,
                ));
            }
            if self.registry.read().unwrap().get(qualifier).is_some() {
                return Err(self.unresolved(form.span, sym));
            }
            if !self.opts.no_warn_symbol_as_host_fun {
                self.warn(
                    form.span,
                    format!("treating {} as a host function reference", sym),
                );
            }
            return Ok(self.node(
                Op::HostFn {
                    module: qualifier.clone(),
                    function: sym.name.clone(),
                    arity: None,
                },
                form,
                env,
            ));
        }
        let qualified_type = format!("{}.{}", current, sym.name);
        if self
            .protocols
            .read()
            .unwrap()
            .type_def(&qualified_type)
            .is_some()
        {
            return Ok(self.node(
                Op::TypeRef {
                    name: Symbol::parse(&qualified_type),
                },
                form,
                env,
            ));
        }
        Err(self.unresolved(form.span, sym))
    }

    // ---- special forms ---------------------------------------------------

    fn analyze_def(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        if items.len() < 2 || items.len() > 4 {
            return Err(self.bad_form(form.span, "def expects a name, optional doc and init"));
        }
        let name_form = &items[1];
        let name = name_form
            .as_symbol()
            .filter(|sym| sym.ns.is_none())
            .cloned()
            .ok_or_else(|| self.bad_form(name_form.span, "def expects a simple symbol name"))?;
        let (doc, init_form) = match items.len() {
            2 => (None, None),
            3 => (None, Some(&items[2])),
            _ => match &items[2].kind {
                FormKind::String(doc) => (Some(doc.clone()), Some(&items[3])),
                _ => {
                    return Err(
                        self.bad_form(items[2].span, "def docstring must be a string literal")
                    )
                }
            },
        };
        let earmuffed = name.name.len() > 2
            && name.name.starts_with('*')
            && name.name.ends_with('*');
        let dynamic = name_form.meta_flag("dynamic");
        let is_macro = name_form.meta_flag("macro");
        if earmuffed && !dynamic && !self.opts.no_warn_dynamic_var_name {
            self.warn(
                name_form.span,
                format!("{} has an earmuffed name but is not declared :dynamic", name),
            );
        }
        let current = self.current_ns();
        let var = self.registry.write().unwrap().intern(&current, &name.name);
        var.set_dynamic(dynamic);
        var.set_macro(is_macro);
        var.set_private(name_form.meta_flag("private"));
        if let Some(doc) = doc {
            let mut meta = var.meta();
            meta.insert(Value::keyword("doc"), Value::string(doc));
            var.set_meta(meta);
        }
        let init = match init_form {
            Some(init_form) => Some(Box::new(self.analyze(init_form, &env.with_tail(false))?)),
            None => None,
        };
        Ok(self.node(
            Op::Def {
                var,
                name,
                init,
                dynamic,
                is_macro,
            },
            form,
            env,
        ))
    }

    fn analyze_if(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        if items.len() < 3 || items.len() > 4 {
            return Err(self.bad_form(form.span, "if expects a test, a then and an optional else"));
        }
        let test = self.analyze(&items[1], &env.with_tail(false))?;
        let then = self.analyze(&items[2], env)?;
        let otherwise = match items.get(3) {
            Some(f) => self.analyze(f, env)?,
            None => self.constant(&Form::nil(form.span), env),
        };
        Ok(self.node(
            Op::If {
                test: Box::new(test),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            form,
            env,
        ))
    }

    fn analyze_let(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
        looping: bool,
    ) -> Result<Node, ClatterError> {
        let head = if looping { "loop*" } else { "let*" };
        let bindings_form = items
            .get(1)
            .and_then(|f| match &f.kind {
                FormKind::Vector(entries) => Some(entries),
                _ => None,
            })
            .ok_or_else(|| {
                self.bad_form(form.span, format!("{} expects a binding vector", head))
            })?;
        if bindings_form.len() % 2 != 0 {
            return Err(self.bad_form(
                form.span,
                format!("{} binding vector must pair names with values", head),
            ));
        }
        let kind = if looping {
            BindingKind::Loop
        } else {
            BindingKind::Let
        };
        let mut scope = env.clone();
        let mut bindings = Vec::with_capacity(bindings_form.len() / 2);
        for pair in bindings_form.chunks(2) {
            let name = pair[0]
                .as_symbol()
                .filter(|sym| sym.ns.is_none())
                .cloned()
                .ok_or_else(|| {
                    self.bad_form(pair[0].span, "binding name must be a simple symbol")
                })?;
            let init = self.analyze(&pair[1], &scope.with_tail(false))?;
            let binding = self.fresh_binding(&name, kind, &scope);
            let binding_node = self.node(
                Op::Binding {
                    binding: binding.clone(),
                },
                &pair[0],
                &scope,
            );
            scope = scope.bind(binding);
            bindings.push((binding_node, init));
        }
        if looping {
            let loop_id = self.fresh_loop_id();
            let body_env = scope
                .push_loop(LoopTarget {
                    id: loop_id,
                    arity: bindings.len(),
                })
                .with_tail(true);
            let body = self.analyze_body(&items[2..], form, &body_env)?;
            Ok(self.node(
                Op::Loop {
                    bindings,
                    loop_id,
                    body: Box::new(body),
                },
                form,
                env,
            ))
        } else {
            let body = self.analyze_body(&items[2..], form, &scope)?;
            Ok(self.node(
                Op::Let {
                    bindings,
                    body: Box::new(body),
                },
                form,
                env,
            ))
        }
    }

    fn analyze_recur(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        if !env.in_tail() {
            return Err(ClatterError::RecurNotInTailPosition(ErrorData::new(
                "recur is only allowed in tail position",
            ))
            .with_span(form.span)
            .with_file(self.opts.file.clone()));
        }
        let target = env.current_loop().ok_or_else(|| {
            ClatterError::RecurNotInTailPosition(ErrorData::new(
                "recur has no enclosing loop or fn method",
            ))
            .with_span(form.span)
            .with_file(self.opts.file.clone())
        })?;
        let exprs = self.analyze_all(&items[1..], &env.with_tail(false))?;
        if exprs.len() != target.arity {
            return Err(ClatterError::RecurArityMismatch(ErrorData::new(format!(
                "recur expects {} arguments here, got {}",
                target.arity,
                exprs.len()
            )))
            .with_span(form.span)
            .with_file(self.opts.file.clone()));
        }
        Ok(self.node(
            Op::Recur {
                exprs,
                loop_id: target.id,
            },
            form,
            env,
        ))
    }

    fn analyze_fn(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let mut rest = &items[1..];
        let name = match rest.first().and_then(|f| f.as_symbol()) {
            Some(sym) if sym.ns.is_none() => {
                rest = &rest[1..];
                Some(sym.clone())
            }
            _ => None,
        };
        let once = form.meta_flag("once");
        let mut fn_env = env.clone();
        let self_binding = name.as_ref().map(|sym| {
            let binding = self.fresh_binding(sym, BindingKind::Arg, &fn_env);
            fn_env = fn_env.bind(binding.clone());
            binding
        });

        let method_forms: Vec<&[Form]> = match rest.first().map(|f| &f.kind) {
            Some(FormKind::Vector(_)) => vec![rest],
            _ => {
                let mut methods = Vec::new();
                for method in rest {
                    match &method.kind {
                        FormKind::List(body) if !body.is_empty() => methods.push(body.as_slice()),
                        _ => {
                            return Err(self.bad_form(
                                method.span,
                                "fn* overload must be a ([params] body...) list",
                            ))
                        }
                    }
                }
                methods
            }
        };
        if method_forms.is_empty() {
            return Err(self.bad_form(form.span, "fn* needs at least one overload"));
        }

        let mut methods = Vec::with_capacity(method_forms.len());
        let mut fixed_arities = BTreeSet::new();
        let mut variadic_arity: Option<usize> = None;
        for method in method_forms {
            let node = self.analyze_fn_method(method, form, &fn_env)?;
            let Op::FnMethod {
                variadic,
                fixed_arity,
                ..
            } = &node.op
            else {
                unreachable!("analyze_fn_method yields fn_method nodes");
            };
            if *variadic {
                if variadic_arity.is_some() {
                    return Err(ClatterError::MultipleVariadic(ErrorData::new(
                        "fn* can have at most one variadic overload",
                    ))
                    .with_span(form.span)
                    .with_file(self.opts.file.clone()));
                }
                variadic_arity = Some(*fixed_arity);
            } else if !fixed_arities.insert(*fixed_arity) {
                return Err(ClatterError::DuplicateArity(ErrorData::new(format!(
                    "duplicate overload for arity {}",
                    fixed_arity
                )))
                .with_span(form.span)
                .with_file(self.opts.file.clone()));
            }
            methods.push(node);
        }
        let max_fixed = fixed_arities.iter().next_back().copied().unwrap_or(0);
        if let Some(variadic_fixed) = variadic_arity {
            if variadic_fixed < max_fixed {
                return Err(ClatterError::InvalidVariadicArity(ErrorData::new(
                    "variadic overload must accept at least as many fixed arguments as any other overload",
                ))
                .with_span(form.span)
                .with_file(self.opts.file.clone()));
            }
        }
        Ok(self.node(
            Op::Fn {
                name,
                variadic: variadic_arity.is_some(),
                fixed_arities: fixed_arities.iter().copied().collect(),
                min_fixed_arity: fixed_arities.iter().next().copied().unwrap_or(0),
                max_fixed_arity: max_fixed,
                variadic_arity,
                methods,
                once,
                self_binding,
            },
            form,
            env,
        ))
    }

    fn analyze_fn_method(
        &mut self,
        method: &[Form],
        form: &Form,
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let params_form = method
            .first()
            .and_then(|f| match &f.kind {
                FormKind::Vector(items) => Some(items),
                _ => None,
            })
            .ok_or_else(|| self.bad_form(form.span, "fn* params must be a vector"))?;

        let mut scope = env.clone();
        let mut params = Vec::new();
        let mut variadic = false;
        let mut iter = params_form.iter().peekable();
        while let Some(param) = iter.next() {
            let sym = param
                .as_symbol()
                .filter(|sym| sym.ns.is_none())
                .cloned()
                .ok_or_else(|| self.bad_form(param.span, "fn* param must be a simple symbol"))?;
            if sym.name == "&" {
                let rest = iter.next().ok_or_else(|| {
                    self.bad_form(param.span, "& must be followed by a rest param")
                })?;
                if iter.peek().is_some() {
                    return Err(self.bad_form(param.span, "only one param may follow &"));
                }
                let rest_sym = rest
                    .as_symbol()
                    .filter(|sym| sym.ns.is_none())
                    .cloned()
                    .ok_or_else(|| {
                        self.bad_form(rest.span, "rest param must be a simple symbol")
                    })?;
                let mut binding = self.fresh_binding(&rest_sym, BindingKind::Arg, &scope);
                binding.is_variadic = true;
                let node = self.node(
                    Op::Binding {
                        binding: binding.clone(),
                    },
                    rest,
                    &scope,
                );
                scope = scope.bind(binding);
                params.push(node);
                variadic = true;
                break;
            }
            let binding = self.fresh_binding(&sym, BindingKind::Arg, &scope);
            let node = self.node(
                Op::Binding {
                    binding: binding.clone(),
                },
                param,
                &scope,
            );
            scope = scope.bind(binding);
            params.push(node);
        }
        let fixed_arity = if variadic {
            params.len() - 1
        } else {
            params.len()
        };
        let loop_id = self.fresh_loop_id();
        let body_env = scope
            .without_loops()
            .push_loop(LoopTarget {
                id: loop_id,
                arity: params.len(),
            })
            .with_tail(true);
        let body = self.analyze_body(&method[1..], form, &body_env)?;
        Ok(self.node(
            Op::FnMethod {
                params,
                variadic,
                fixed_arity,
                loop_id,
                body: Box::new(body),
            },
            form,
            env,
        ))
    }

    fn analyze_letfn(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let bindings_form = items
            .get(1)
            .and_then(|f| match &f.kind {
                FormKind::Vector(entries) => Some(entries),
                _ => None,
            })
            .ok_or_else(|| self.bad_form(form.span, "letfn* expects a binding vector"))?;
        if bindings_form.len() % 2 != 0 {
            return Err(self.bad_form(form.span, "letfn* binding vector must pair names with fns"));
        }
        let mut scope = env.clone();
        let mut binding_nodes = Vec::new();
        for pair in bindings_form.chunks(2) {
            let name = pair[0]
                .as_symbol()
                .filter(|sym| sym.ns.is_none())
                .cloned()
                .ok_or_else(|| {
                    self.bad_form(pair[0].span, "letfn* name must be a simple symbol")
                })?;
            let binding = self.fresh_binding(&name, BindingKind::Let, &scope);
            let node = self.node(
                Op::Binding {
                    binding: binding.clone(),
                },
                &pair[0],
                &scope,
            );
            scope = scope.bind(binding);
            binding_nodes.push(node);
        }
        let mut bindings = Vec::new();
        for (node, pair) in binding_nodes.into_iter().zip(bindings_form.chunks(2)) {
            let fn_node = self.analyze(&pair[1], &scope.with_tail(false))?;
            if !matches!(fn_node.op, Op::Fn { .. }) {
                return Err(self.bad_form(pair[1].span, "letfn* values must be fn* forms"));
            }
            bindings.push((node, fn_node));
        }
        let body = self.analyze_body(&items[2..], form, &scope)?;
        Ok(self.node(
            Op::LetFn {
                bindings,
                body: Box::new(body),
            },
            form,
            env,
        ))
    }

    fn analyze_try(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let mut body_forms = Vec::new();
        let mut catches = Vec::new();
        let mut finally = None;
        for item in &items[1..] {
            if item.is_call_to("catch") {
                if finally.is_some() {
                    return Err(self.bad_form(item.span, "catch must come before finally"));
                }
                catches.push(self.analyze_catch(item, env)?);
            } else if item.is_call_to("finally") {
                if finally.is_some() {
                    return Err(self.bad_form(item.span, "try allows at most one finally"));
                }
                let body =
                    self.analyze_body(&item.as_list().expect("finally is a list")[1..], item, &env.enter_try().with_tail(false))?;
                finally = Some(Box::new(body));
            } else {
                if !catches.is_empty() || finally.is_some() {
                    return Err(
                        self.bad_form(item.span, "try body must come before catch and finally")
                    );
                }
                body_forms.push(item.clone());
            }
        }
        let body = self.analyze_body(&body_forms, form, &env.enter_try().with_tail(false))?;
        Ok(self.node(
            Op::Try {
                body: Box::new(body),
                catches,
                finally,
            },
            form,
            env,
        ))
    }

    fn analyze_catch(&mut self, form: &Form, env: &Env) -> Result<Node, ClatterError> {
        let items = form.as_list().expect("catch is a list");
        if items.len() < 3 {
            return Err(self.bad_form(form.span, "catch expects a class and a binding"));
        }
        let class = match &items[1].kind {
            FormKind::Keyword(sym) if sym.ns.is_none() && sym.name == "default" => {
                CatchClass::Default
            }
            FormKind::Symbol(sym) => CatchClass::Type(self.resolve_type_symbol(sym)),
            _ => {
                return Err(self.bad_form(
                    items[1].span,
                    "catch class must be a type symbol or :default",
                ))
            }
        };
        let scope = env.enter_try();
        let (locals, stack_sym) = match &items[2].kind {
            FormKind::Symbol(sym) if sym.ns.is_none() => (sym.clone(), None),
            FormKind::Vector(pair) if pair.len() == 2 => {
                let value = pair[0]
                    .as_symbol()
                    .filter(|s| s.ns.is_none())
                    .cloned()
                    .ok_or_else(|| self.bad_form(pair[0].span, "catch binding must be simple"))?;
                let stack = pair[1]
                    .as_symbol()
                    .filter(|s| s.ns.is_none())
                    .cloned()
                    .ok_or_else(|| self.bad_form(pair[1].span, "catch binding must be simple"))?;
                (value, Some(stack))
            }
            _ => {
                return Err(self.bad_form(
                    items[2].span,
                    "catch binding must be a symbol or [value stacktrace]",
                ))
            }
        };
        let binding = self.fresh_binding(&locals, BindingKind::Catch, &scope);
        let local_node = self.node(
            Op::Binding {
                binding: binding.clone(),
            },
            &items[2],
            &scope,
        );
        let mut scope = scope.bind(binding);
        let stack_local = match stack_sym {
            Some(sym) => {
                let binding = self.fresh_binding(&sym, BindingKind::Catch, &scope);
                let node = self.node(
                    Op::Binding {
                        binding: binding.clone(),
                    },
                    &items[2],
                    &scope,
                );
                scope = scope.bind(binding);
                Some(Box::new(node))
            }
            None => None,
        };
        let body = self.analyze_body(&items[3..], form, &scope.with_tail(env.in_tail()))?;
        Ok(self.node(
            Op::Catch {
                class,
                local: Box::new(local_node),
                stack_local,
                body: Box::new(body),
            },
            form,
            env,
        ))
    }

    fn analyze_new(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let type_form = items
            .get(1)
            .and_then(|f| f.as_symbol())
            .ok_or_else(|| self.bad_form(form.span, "new expects a type symbol"))?;
        let type_name = self.resolve_type_symbol(type_form);
        if self
            .protocols
            .read()
            .unwrap()
            .type_def(&type_name.to_string())
            .is_none()
        {
            return Err(self.unresolved(form.span, type_form));
        }
        let args = self.analyze_all(&items[2..], &env.with_tail(false))?;
        Ok(self.node(Op::New { type_name, args }, form, env))
    }

    fn analyze_dot(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        if items.len() < 3 {
            return Err(self.bad_form(form.span, ". expects a module and a function"));
        }
        let module = items[1]
            .as_symbol()
            .filter(|sym| sym.ns.is_none())
            .ok_or_else(|| self.bad_form(items[1].span, ". expects a module symbol"))?;
        let function = items[2]
            .as_symbol()
            .filter(|sym| sym.ns.is_none())
            .ok_or_else(|| self.bad_form(items[2].span, ". expects a function symbol"))?;
        let current = self.current_ns();
        let module_name = self
            .registry
            .read()
            .unwrap()
            .get(&current)
            .and_then(|ns| ns.imports.get(&module.name).cloned())
            .unwrap_or_else(|| module.name.clone());
        let args = self.analyze_all(&items[3..], &env.with_tail(false))?;
        let host = self.node(
            Op::HostFn {
                module: module_name,
                function: function.name.clone(),
                arity: Some(args.len()),
            },
            form,
            env,
        );
        Ok(self.node(
            Op::Invoke {
                f: Box::new(host),
                args,
            },
            form,
            env,
        ))
    }

    fn analyze_set(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        if items.len() != 3 {
            return Err(self.bad_form(form.span, "set! expects a var symbol and a value"));
        }
        let sym = items[1]
            .as_symbol()
            .ok_or_else(|| self.bad_form(items[1].span, "set! expects a var symbol"))?;
        let resolved = {
            let registry = self.registry.read().unwrap();
            registry.resolve(registry.current_ns(), sym)
        };
        let Some(Resolution::Var(var)) = resolved else {
            return Err(self.unresolved(form.span, sym));
        };
        let value = self.analyze(&items[2], &env.with_tail(false))?;
        let host = self.node(
            Op::HostFn {
                module: RT_NS.to_string(),
                function: "var-set".to_string(),
                arity: Some(3),
            },
            form,
            env,
        );
        let ns_const = self.constant(&Form::string(var.ns(), form.span), env);
        let name_const = self.constant(&Form::string(var.name(), form.span), env);
        Ok(self.node(
            Op::Invoke {
                f: Box::new(host),
                args: vec![ns_const, name_const, value],
            },
            form,
            env,
        ))
    }

    fn analyze_case(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        if items.len() < 2 {
            return Err(self.bad_form(form.span, "case* expects a subject"));
        }
        let test = self.analyze(&items[1], &env.with_tail(false))?;
        let rest = &items[2..];
        let (pairs, default_form) = if rest.len() % 2 == 1 {
            (&rest[..rest.len() - 1], rest.last())
        } else {
            (rest, None)
        };
        let mut clauses = Vec::with_capacity(pairs.len() / 2);
        for pair in pairs.chunks(2) {
            let (pattern, clause_env) = self.analyze_pattern(&pair[0], env)?;
            let body = self.analyze(&pair[1], &clause_env)?;
            clauses.push((pattern, body));
        }
        let default = match default_form {
            Some(f) => Some(Box::new(self.analyze(f, env)?)),
            None => None,
        };
        Ok(self.node(
            Op::Case {
                test: Box::new(test),
                clauses,
                default,
            },
            form,
            env,
        ))
    }

    fn analyze_pattern(
        &mut self,
        form: &Form,
        env: &Env,
    ) -> Result<(Node, Env), ClatterError> {
        match &form.kind {
            FormKind::Symbol(sym) if sym.ns.is_none() => {
                let mut binding = self.fresh_binding(sym, BindingKind::Let, env);
                binding.is_underscore = sym.name == "_";
                let node = self.node(
                    Op::Binding {
                        binding: binding.clone(),
                    },
                    form,
                    env,
                );
                Ok((node, env.bind(binding)))
            }
            FormKind::List(items)
                if items.len() == 3 && matches!(items[0].as_symbol(), Some(sym) if sym.name == "=" && sym.ns.is_none()) =>
            {
                let (binding_node, env) = self.analyze_pattern(&items[1], env)?;
                let (pattern, env) = self.analyze_pattern(&items[2], &env)?;
                let node = self.node(
                    Op::PatternAlias {
                        binding: Box::new(binding_node),
                        pattern: Box::new(pattern),
                    },
                    form,
                    &env,
                );
                Ok((node, env))
            }
            FormKind::List(items)
                if items.len() == 2 && matches!(items[0].as_symbol(), Some(sym) if sym.name == "quote") =>
            {
                Ok((self.constant(&items[1], env), env.clone()))
            }
            FormKind::Vector(items) => {
                let mut scope = env.clone();
                let mut patterns = Vec::with_capacity(items.len());
                for item in items {
                    let (node, next) = self.analyze_pattern(item, &scope)?;
                    patterns.push(node);
                    scope = next;
                }
                let node = self.node(Op::Tuple { items: patterns }, form, &scope);
                Ok((node, scope))
            }
            FormKind::Map(entries) => {
                let mut scope = env.clone();
                let mut pairs = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = self.constant(k, &scope);
                    let (value, next) = self.analyze_pattern(v, &scope)?;
                    scope = next;
                    pairs.push((key, value));
                }
                let node = self.node(Op::MapLit { pairs }, form, &scope);
                Ok((node, scope))
            }
            _ if form.is_atom() => Ok((self.constant(form, env), env.clone())),
            _ => Err(self.bad_form(form.span, "unsupported pattern form")),
        }
    }

    fn analyze_reify(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        self.next_gensym += 1;
        let current = self.current_ns();
        let type_sym = Symbol::simple(format!("reify__{}", self.next_gensym));
        let qualified = format!("{}.{}", current, type_sym.name);
        self.protocols
            .write()
            .unwrap()
            .define_type(&qualified, Vec::new());
        // methods close over nothing: analyzed against an empty lexical env
        let key = ImplKey::Record(qualified.clone());
        let impls = self.analyze_protocol_impls(&items[1..], &qualified, Some(&key), &Env::new())?;
        let deftype = self.node(
            Op::DefType {
                name: Symbol::parse(&qualified),
                fields: Vec::new(),
                impls,
            },
            form,
            env,
        );
        let construct = self.node(
            Op::New {
                type_name: Symbol::parse(&qualified),
                args: Vec::new(),
            },
            form,
            env,
        );
        Ok(self.node(
            Op::Do {
                statements: vec![deftype],
                ret: Box::new(construct),
            },
            form,
            env,
        ))
    }

    fn analyze_deftype(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let name = items
            .get(1)
            .and_then(|f| f.as_symbol())
            .filter(|sym| sym.ns.is_none())
            .cloned()
            .ok_or_else(|| self.bad_form(form.span, "deftype* expects a simple type name"))?;
        let fields_form = items
            .get(2)
            .and_then(|f| match &f.kind {
                FormKind::Vector(fields) => Some(fields),
                _ => None,
            })
            .ok_or_else(|| self.bad_form(form.span, "deftype* expects a field vector"))?;
        let current = self.current_ns();
        let qualified = format!("{}.{}", current, name.name);

        let mut field_env = Env::new();
        let mut fields = Vec::with_capacity(fields_form.len());
        let mut field_names = Vec::with_capacity(fields_form.len());
        for field in fields_form {
            let sym = field
                .as_symbol()
                .filter(|sym| sym.ns.is_none())
                .cloned()
                .ok_or_else(|| {
                    self.bad_form(field.span, "deftype* field must be a simple symbol")
                })?;
            let binding = self.fresh_binding(&sym, BindingKind::Let, &field_env);
            let node = self.node(
                Op::Binding {
                    binding: binding.clone(),
                },
                field,
                &field_env,
            );
            field_env = field_env.bind(binding);
            field_names.push(sym.name.clone());
            fields.push(node);
        }
        self.protocols
            .write()
            .unwrap()
            .define_type(&qualified, field_names.clone());
        let key = ImplKey::Record(qualified.clone());
        let impls =
            self.analyze_protocol_impls(&items[3..], &qualified, Some(&key), &field_env)?;
        Ok(self.node(
            Op::DefType {
                name: Symbol::parse(&qualified),
                fields,
                impls,
            },
            form,
            env,
        ))
    }

    fn analyze_protocol_impls(
        &mut self,
        items: &[Form],
        impl_module: &str,
        register_key: Option<&ImplKey>,
        method_env: &Env,
    ) -> Result<Vec<ProtocolImpl>, ClatterError> {
        let mut impls: Vec<ProtocolImpl> = Vec::new();
        for item in items {
            match &item.kind {
                FormKind::Symbol(sym) => {
                    let protocol = self.resolve_protocol_symbol(sym, item.span)?;
                    if let Some(key) = register_key {
                        self.protocols.write().unwrap().extend(
                            &protocol.to_string(),
                            key.clone(),
                            impl_module,
                        );
                    }
                    impls.push(ProtocolImpl {
                        protocol,
                        impl_module: impl_module.to_string(),
                        methods: Vec::new(),
                    });
                }
                FormKind::List(method_items) if !method_items.is_empty() => {
                    let current = impls.last_mut().ok_or_else(|| {
                        self.bad_form(item.span, "method body must follow a protocol symbol")
                    })?;
                    let method_name = method_items[0]
                        .as_symbol()
                        .filter(|sym| sym.ns.is_none())
                        .cloned()
                        .ok_or_else(|| {
                            self.bad_form(item.span, "method name must be a simple symbol")
                        })?;
                    let mut fn_items = vec![Form::symbol("fn*", item.span)];
                    fn_items.extend_from_slice(&method_items[1..]);
                    let fn_form = Form::list(fn_items.clone(), item.span);
                    let fn_node = self.analyze_fn(&fn_form, &fn_items, method_env)?;
                    self.check_protocol_method(&current.protocol, &method_name, &fn_node, item.span)?;
                    current.methods.push(ProtocolMethodImpl {
                        name: method_name.name,
                        fn_node,
                    });
                }
                _ => return Err(self.bad_form(item.span, "expected protocol symbol or method")),
            }
        }
        Ok(impls)
    }

    fn check_protocol_method(
        &self,
        protocol: &Symbol,
        method: &Symbol,
        fn_node: &Node,
        span: Span,
    ) -> Result<(), ClatterError> {
        let protocols = self.protocols.read().unwrap();
        let def = protocols.protocol(&protocol.to_string()).ok_or_else(|| {
            self.bad_form(span, format!("{} is not a registered protocol", protocol))
        })?;
        let Op::Fn { fixed_arities, .. } = &fn_node.op else {
            return Err(self.bad_form(span, "protocol method must be a fn"));
        };
        let known = def.methods.iter().find(|m| m.name == method.name);
        match known {
            Some(sig) if fixed_arities.iter().all(|a| sig.arities.contains(a)) => Ok(()),
            Some(_) => Err(self.bad_form(
                span,
                format!("arity of {} does not match protocol {}", method, protocol),
            )),
            None => Err(self.bad_form(
                span,
                format!("protocol {} has no method {}", protocol, method),
            )),
        }
    }

    fn analyze_defprotocol(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let name = items
            .get(1)
            .and_then(|f| f.as_symbol())
            .filter(|sym| sym.ns.is_none())
            .cloned()
            .ok_or_else(|| self.bad_form(form.span, "defprotocol expects a simple name"))?;
        let current = self.current_ns();
        let qualified = format!("{}.{}", current, name.name);
        let mut methods = Vec::new();
        for sig in &items[2..] {
            let sig_items = sig
                .as_list()
                .ok_or_else(|| self.bad_form(sig.span, "protocol method must be a list"))?;
            let method_name = sig_items
                .first()
                .and_then(|f| f.as_symbol())
                .filter(|sym| sym.ns.is_none())
                .cloned()
                .ok_or_else(|| self.bad_form(sig.span, "method name must be a simple symbol"))?;
            let mut arities = BTreeSet::new();
            for arg_vec in &sig_items[1..] {
                match &arg_vec.kind {
                    FormKind::Vector(params) => {
                        if params.is_empty() {
                            return Err(self.bad_form(
                                arg_vec.span,
                                "protocol method needs at least the dispatch argument",
                            ));
                        }
                        arities.insert(params.len());
                    }
                    FormKind::String(_) => {} // docstring
                    _ => {
                        return Err(
                            self.bad_form(arg_vec.span, "method signature must be a vector")
                        )
                    }
                }
            }
            if arities.is_empty() {
                return Err(self.bad_form(sig.span, "protocol method needs a signature"));
            }
            methods.push(ProtocolMethod {
                name: method_name.name.clone(),
                arities,
            });
            // method names resolve as vars in the defining namespace
            self.registry
                .write()
                .unwrap()
                .intern(&current, &method_name.name);
        }
        self.protocols
            .write()
            .unwrap()
            .define_protocol(&qualified, methods.clone());
        Ok(self.node(
            Op::DefProtocol {
                name: Symbol::parse(&qualified),
                methods: methods
                    .into_iter()
                    .map(|m| (m.name, m.arities.into_iter().collect()))
                    .collect(),
            },
            form,
            env,
        ))
    }

    fn analyze_extend_type(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let type_form = items
            .get(1)
            .and_then(|f| f.as_symbol())
            .cloned()
            .ok_or_else(|| self.bad_form(form.span, "extend-type expects a type symbol"))?;
        let (key, type_name) = if type_form.ns.is_none()
            && PrimKind::from_name(&type_form.name).is_some()
        {
            (
                ImplKey::Prim(PrimKind::from_name(&type_form.name).expect("checked")),
                type_form.clone(),
            )
        } else {
            let resolved = self.resolve_type_symbol(&type_form);
            if self
                .protocols
                .read()
                .unwrap()
                .type_def(&resolved.to_string())
                .is_none()
            {
                return Err(self.unresolved(form.span, &type_form));
            }
            (ImplKey::Record(resolved.to_string()), resolved)
        };

        // split into protocol sections first: prim extensions land in a
        // per-protocol module, record extensions in the type's module
        let mut impls = Vec::new();
        let mut index = 2;
        while index < items.len() {
            let proto_form = items[index].clone();
            let proto_sym = proto_form
                .as_symbol()
                .cloned()
                .ok_or_else(|| self.bad_form(proto_form.span, "expected a protocol symbol"))?;
            let protocol = self.resolve_protocol_symbol(&proto_sym, proto_form.span)?;
            index += 1;
            let start = index;
            while index < items.len() && items[index].as_symbol().is_none() {
                index += 1;
            }
            let impl_module = match &key {
                ImplKey::Record(name) => name.clone(),
                ImplKey::Prim(prim) => format!("{}.{}", protocol, prim.name()),
            };
            let mut section = vec![proto_form];
            section.extend_from_slice(&items[start..index]);
            let parsed =
                self.analyze_protocol_impls(&section, &impl_module, Some(&key), &Env::new())?;
            impls.extend(parsed);
        }
        Ok(self.node(
            Op::ExtendType {
                type_name,
                impls,
            },
            form,
            env,
        ))
    }

    fn analyze_import(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let mut nodes = Vec::new();
        let current = self.current_ns();
        for item in &items[1..] {
            let qualified = match &item.kind {
                FormKind::String(s) => s.clone(),
                FormKind::Symbol(sym) => sym.to_string(),
                _ => {
                    return Err(
                        self.bad_form(item.span, "import* expects strings or symbols")
                    )
                }
            };
            let simple = qualified
                .rsplit('.')
                .next()
                .unwrap_or(qualified.as_str())
                .to_string();
            self.registry
                .write()
                .unwrap()
                .ensure(&current)
                .import(&simple, &qualified);
            nodes.push(self.node(
                Op::Import {
                    type_name: qualified,
                },
                item,
                env,
            ));
        }
        match nodes.len() {
            0 => Err(self.bad_form(form.span, "import* expects at least one type")),
            1 => Ok(nodes.pop().expect("one node")),
            _ => {
                let ret = nodes.pop().expect("nonempty");
                Ok(self.node(
                    Op::Do {
                        statements: nodes,
                        ret: Box::new(ret),
                    },
                    form,
                    env,
                ))
            }
        }
    }

    fn analyze_receive(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let mut rest = &items[1..];
        let after = match rest.last() {
            Some(last) if last.is_call_to("after") => {
                let after_items = last.as_list().expect("after is a list");
                if after_items.len() < 2 {
                    return Err(self.bad_form(last.span, "after expects a timeout"));
                }
                let timeout = self.analyze(&after_items[1], &env.with_tail(false))?;
                let body = self.analyze_body(&after_items[2..], last, env)?;
                rest = &rest[..rest.len() - 1];
                Some(Box::new(self.node(
                    Op::After {
                        timeout: Box::new(timeout),
                        body: Box::new(body),
                    },
                    last,
                    env,
                )))
            }
            _ => None,
        };
        if rest.len() % 2 != 0 {
            return Err(self.bad_form(form.span, "receive* expects pattern/body pairs"));
        }
        let mut clauses = Vec::with_capacity(rest.len() / 2);
        for pair in rest.chunks(2) {
            let (pattern, clause_env) = self.analyze_pattern(&pair[0], env)?;
            let body = self.analyze(&pair[1], &clause_env)?;
            clauses.push((pattern, body));
        }
        Ok(self.node(Op::Receive { clauses, after }, form, env))
    }

    fn analyze_ns(
        &mut self,
        form: &Form,
        items: &[Form],
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let name = items
            .get(1)
            .and_then(|f| f.as_symbol())
            .filter(|sym| sym.ns.is_none())
            .cloned()
            .ok_or_else(|| self.bad_form(form.span, "ns expects a simple namespace name"))?;
        self.registry.write().unwrap().set_current(&name.name);
        for clause in &items[2..] {
            let clause_items = clause
                .as_list()
                .ok_or_else(|| self.bad_form(clause.span, "ns clause must be a list"))?;
            let head = clause_items
                .first()
                .and_then(|f| f.as_keyword())
                .map(|sym| sym.name.clone())
                .ok_or_else(|| self.bad_form(clause.span, "ns clause must start with a keyword"))?;
            match head.as_str() {
                "require" => {
                    for spec in &clause_items[1..] {
                        self.analyze_require_spec(spec, &name.name)?;
                    }
                }
                "import" => {
                    let mut import_items = vec![Form::symbol("import*", clause.span)];
                    import_items.extend_from_slice(&clause_items[1..]);
                    let import_form = Form::list(import_items.clone(), clause.span);
                    self.analyze_import(&import_form, &import_items, env)?;
                }
                other => {
                    return Err(
                        self.bad_form(clause.span, format!("unsupported ns clause :{}", other))
                    )
                }
            }
        }
        Ok(self.constant(&Form::nil(form.span), env))
    }

    fn analyze_require_spec(&mut self, spec: &Form, home: &str) -> Result<(), ClatterError> {
        let (target, alias, refers) = match &spec.kind {
            FormKind::Symbol(sym) if sym.ns.is_none() => (sym.name.clone(), None, Vec::new()),
            FormKind::Vector(parts) => {
                let target = parts
                    .first()
                    .and_then(|f| f.as_symbol())
                    .filter(|sym| sym.ns.is_none())
                    .cloned()
                    .ok_or_else(|| {
                        self.bad_form(spec.span, "require spec must start with a namespace")
                    })?;
                let mut alias = None;
                let mut refers = Vec::new();
                let mut index = 1;
                while index < parts.len() {
                    let key = parts[index]
                        .as_keyword()
                        .map(|sym| sym.name.clone())
                        .ok_or_else(|| self.bad_form(parts[index].span, "expected :as or :refer"))?;
                    index += 1;
                    match key.as_str() {
                        "as" => {
                            alias = Some(
                                parts
                                    .get(index)
                                    .and_then(|f| f.as_symbol())
                                    .map(|sym| sym.name.clone())
                                    .ok_or_else(|| {
                                        self.bad_form(spec.span, ":as expects a symbol")
                                    })?,
                            );
                            index += 1;
                        }
                        "refer" => {
                            let list = parts
                                .get(index)
                                .and_then(|f| match &f.kind {
                                    FormKind::Vector(syms) => Some(syms),
                                    _ => None,
                                })
                                .ok_or_else(|| {
                                    self.bad_form(spec.span, ":refer expects a vector")
                                })?;
                            for sym in list {
                                refers.push(
                                    sym.as_symbol()
                                        .map(|s| s.name.clone())
                                        .ok_or_else(|| {
                                            self.bad_form(sym.span, ":refer expects symbols")
                                        })?,
                                );
                            }
                            index += 1;
                        }
                        other => {
                            return Err(self.bad_form(
                                spec.span,
                                format!("unsupported require option :{}", other),
                            ))
                        }
                    }
                }
                (target.name, alias, refers)
            }
            _ => return Err(self.bad_form(spec.span, "require spec must be a symbol or vector")),
        };
        let mut registry = self.registry.write().unwrap();
        registry.ensure(&target);
        if let Some(alias) = alias {
            registry.ensure(home).add_alias(&alias, &target);
        }
        for name in refers {
            let var = registry.intern(&target, &name);
            registry.ensure(home).refer(&name, var);
        }
        Ok(())
    }

    fn analyze_host_literal(
        &mut self,
        form: &Form,
        tag: &Symbol,
        value: &Form,
        env: &Env,
    ) -> Result<Node, ClatterError> {
        let arg_env = env.with_tail(false);
        match (tag.name.as_str(), &value.kind) {
            ("map", FormKind::Map(entries)) => {
                let pairs = self.analyze_pairs(entries, &arg_env)?;
                Ok(self.node(Op::NativeMap { pairs }, form, env))
            }
            ("list", FormKind::List(items)) | ("list", FormKind::Vector(items)) => {
                let items = self.analyze_all(items, &arg_env)?;
                Ok(self.node(Op::NativeList { items }, form, env))
            }
            ("tuple", FormKind::Vector(items)) => {
                let items = self.analyze_all(items, &arg_env)?;
                Ok(self.node(Op::Tuple { items }, form, env))
            }
            ("binary", FormKind::Vector(items)) => {
                let mut segments = Vec::with_capacity(items.len());
                for item in items {
                    let value = self.analyze(item, &arg_env)?;
                    let kind = match &item.kind {
                        FormKind::String(_) => crate::ir::SegmentKind::Utf8,
                        _ => crate::ir::SegmentKind::Int,
                    };
                    segments.push(self.node(
                        Op::BinarySegment {
                            value: Box::new(value),
                            size: None,
                            unit: 1,
                            kind,
                        },
                        item,
                        env,
                    ));
                }
                Ok(self.node(Op::Binary { segments }, form, env))
            }
            _ => Err(self.bad_form(
                form.span,
                format!("unsupported host literal #{} {}", tag, value),
            )),
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn analyze_body(
        &mut self,
        forms: &[Form],
        parent: &Form,
        env: &Env,
    ) -> Result<Node, ClatterError> {
        match forms.len() {
            0 => Ok(self.constant(&Form::nil(parent.span), env)),
            1 => self.analyze(&forms[0], env),
            _ => {
                let stmt_env = env.with_tail(false);
                let mut statements = Vec::with_capacity(forms.len() - 1);
                for form in &forms[..forms.len() - 1] {
                    statements.push(self.analyze(form, &stmt_env)?);
                }
                let ret = self.analyze(&forms[forms.len() - 1], env)?;
                Ok(self.node(
                    Op::Do {
                        statements,
                        ret: Box::new(ret),
                    },
                    parent,
                    env,
                ))
            }
        }
    }

    fn analyze_all(&mut self, forms: &[Form], env: &Env) -> Result<Vec<Node>, ClatterError> {
        forms.iter().map(|f| self.analyze(f, env)).collect()
    }

    fn analyze_pairs(
        &mut self,
        entries: &[(Form, Form)],
        env: &Env,
    ) -> Result<Vec<(Node, Node)>, ClatterError> {
        entries
            .iter()
            .map(|(k, v)| Ok((self.analyze(k, env)?, self.analyze(v, env)?)))
            .collect()
    }

    fn resolve_type_symbol(&self, sym: &Symbol) -> Symbol {
        if sym.ns.is_some() || sym.name.contains('.') {
            return sym.clone();
        }
        let current = self.registry.read().unwrap().current_ns().to_string();
        let imported = self
            .registry
            .read()
            .unwrap()
            .get(&current)
            .and_then(|ns| ns.imports.get(&sym.name).cloned());
        match imported {
            Some(qualified) => Symbol::parse(&qualified),
            None => Symbol::simple(format!("{}.{}", current, sym.name)),
        }
    }

    fn resolve_protocol_symbol(
        &self,
        sym: &Symbol,
        span: Span,
    ) -> Result<Symbol, ClatterError> {
        let protocols = self.protocols.read().unwrap();
        if sym.ns.is_none() && !sym.name.contains('.') {
            let current = self.registry.read().unwrap().current_ns().to_string();
            let qualified = format!("{}.{}", current, sym.name);
            if protocols.protocol(&qualified).is_some() {
                return Ok(Symbol::parse(&qualified));
            }
        }
        let as_written = sym.to_string();
        if protocols.protocol(&as_written).is_some() {
            return Ok(sym.clone());
        }
        Err(self.bad_form(span, format!("{} is not a registered protocol", sym)))
    }

    fn fresh_binding(&mut self, name: &Symbol, kind: BindingKind, env: &Env) -> LocalBinding {
        let id = self.next_binding_id;
        self.next_binding_id += 1;
        LocalBinding {
            id,
            name: name.clone(),
            kind,
            is_variadic: false,
            is_underscore: name.name == "_",
            shadows: env.shadowed_id(&name.name),
        }
    }

    fn fresh_loop_id(&mut self) -> usize {
        let id = self.next_loop_id;
        self.next_loop_id += 1;
        id
    }

    fn node(&self, op: Op, form: &Form, env: &Env) -> Node {
        Node::new(op, form.span, form.clone(), env.clone())
    }

    fn constant(&self, form: &Form, env: &Env) -> Node {
        self.node(
            Op::Constant {
                value: form.clone(),
            },
            form,
            env,
        )
    }

    fn bad_form(&self, span: Span, message: impl Into<String>) -> ClatterError {
        ClatterError::bad_form(message)
            .with_span(span)
            .with_file(self.opts.file.clone())
    }

    fn unresolved(&self, span: Span, sym: &Symbol) -> ClatterError {
        ClatterError::unresolved(format!("unable to resolve symbol {}", sym))
            .with_span(span)
            .with_file(self.opts.file.clone())
    }

    fn warn(&mut self, span: Span, message: impl Into<String>) {
        self.warnings.push(format_warning(
            self.opts.file.as_deref(),
            Some(span),
            &message.into(),
        ));
    }
}

/// True when the form evaluates to itself: atoms other than symbols, and
/// collections of such forms.
fn is_constant_form(form: &Form) -> bool {
    match &form.kind {
        FormKind::Symbol(_) | FormKind::List(_) | FormKind::ReaderCond { .. } => false,
        FormKind::Vector(items) | FormKind::Set(items) => items.iter().all(is_constant_form),
        FormKind::Map(entries) => entries
            .iter()
            .all(|(k, v)| is_constant_form(k) && is_constant_form(v)),
        FormKind::Tagged { tag, value } => {
            tag.ns.as_deref() != Some("host") && is_constant_form(value)
        }
        _ => true,
    }
}
