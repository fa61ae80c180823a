use std::sync::Arc;

use crate::ast::{Form, FormKind, Span, Symbol};
use crate::env::LocalBinding;
use crate::error::ClatterError;
use crate::hir::{CatchClass, Node, Op, ProtocolImpl};
use crate::host::HostVm;
use crate::ir::{
    BinSegment, CatchClause, Clause, Expr, FunDef, LambdaMethod, Literal, Pattern,
};
use crate::module::{ModuleBuilder, ModuleContext};
use crate::namespaces::RegistryRef;
use crate::protocols::ProtocolsRef;
use crate::reader::RT_NS;
use crate::value::FnValue;
use crate::vars::Var;

/// Translates analyzed nodes into Core IR, registering top-level functions
/// into the module context as it goes.
pub struct Emitter<'a> {
    registry: RegistryRef,
    protocols: ProtocolsRef,
    host: Arc<dyn HostVm>,
    ctx: &'a mut ModuleContext,
}

impl<'a> Emitter<'a> {
    pub fn new(
        registry: RegistryRef,
        protocols: ProtocolsRef,
        host: Arc<dyn HostVm>,
        ctx: &'a mut ModuleContext,
    ) -> Self {
        Emitter {
            registry,
            protocols,
            host,
            ctx,
        }
    }

    /// Emits one top-level node as a sequence of expressions for the driver
    /// to evaluate after the touched modules load.
    pub fn emit(&mut self, node: &Node) -> Result<Vec<Expr>, ClatterError> {
        Ok(vec![self.emit_expr(node)?])
    }

    fn current_module(&self) -> String {
        let registry = self.registry.read().unwrap();
        registry.module_name(registry.current_ns())
    }

    fn builder(&mut self, name: &str) -> &mut ModuleBuilder {
        let seed = if self.ctx.get(name).is_none() {
            self.host.loaded(name)
        } else {
            None
        };
        let builder = self.ctx.ensure(name);
        if let Some(module) = seed {
            builder.seed(&module);
        }
        builder
    }

    fn emit_expr(&mut self, node: &Node) -> Result<Expr, ClatterError> {
        match &node.op {
            Op::Constant { value } => self.emit_constant(value),
            Op::Quote { expr } => self.emit_expr(expr),
            Op::Local { binding } => Ok(Expr::Var(binding.ir_name())),
            Op::Binding { binding } => Ok(Expr::Var(binding.ir_name())),
            Op::Do { statements, ret } => {
                let mut exprs = Vec::with_capacity(statements.len() + 1);
                for stmt in statements {
                    exprs.push(self.emit_expr(stmt)?);
                }
                exprs.push(self.emit_expr(ret)?);
                Ok(Expr::Seq(exprs))
            }
            Op::If {
                test,
                then,
                otherwise,
            } => {
                let subject = self.emit_expr(test)?;
                let then = self.emit_expr(then)?;
                let otherwise = self.emit_expr(otherwise)?;
                Ok(truthiness_case(subject, then, otherwise))
            }
            Op::Let { bindings, body } => {
                let bindings = self.emit_bindings(bindings)?;
                let body = self.emit_expr(body)?;
                Ok(Expr::Let {
                    bindings,
                    body: Box::new(body),
                })
            }
            Op::Loop {
                bindings,
                loop_id,
                body,
            } => {
                let emitted = self.emit_bindings(bindings)?;
                let params: Vec<String> = emitted.iter().map(|(name, _)| name.clone()).collect();
                let args: Vec<Expr> = params.iter().map(|p| Expr::Var(p.clone())).collect();
                let body = self.emit_expr(body)?;
                Ok(Expr::Let {
                    bindings: emitted,
                    body: Box::new(Expr::LetRec {
                        name: loop_label(*loop_id),
                        params,
                        fun_body: Box::new(body),
                        args,
                    }),
                })
            }
            Op::Recur { exprs, loop_id } => {
                let args = exprs
                    .iter()
                    .map(|e| self.emit_expr(e))
                    .collect::<Result<_, _>>()?;
                Ok(Expr::TailCall {
                    target: loop_label(*loop_id),
                    args,
                })
            }
            Op::LetFn { bindings, body } => {
                // each closure self-binds under its letfn name; earlier
                // bindings are visible to later ones through the let chain
                let mut emitted = Vec::with_capacity(bindings.len());
                for (binding_node, fn_node) in bindings {
                    let name = binding_ir_name(binding_node)?;
                    let mut lambda = self.emit_expr(fn_node)?;
                    if let Expr::Lambda {
                        self_name: self_name @ None,
                        ..
                    } = &mut lambda
                    {
                        *self_name = Some(name.clone());
                    }
                    emitted.push((name, lambda));
                }
                let body = self.emit_expr(body)?;
                Ok(Expr::Let {
                    bindings: emitted,
                    body: Box::new(body),
                })
            }
            Op::Fn {
                methods,
                self_binding,
                ..
            } => self.emit_lambda(methods, self_binding.as_ref()),
            Op::FnMethod { .. } => Err(internal_error(node.span, "fn method outside fn")),
            Op::Case {
                test,
                clauses,
                default,
            } => {
                let subject = self.emit_expr(test)?;
                let mut emitted = Vec::with_capacity(clauses.len() + 1);
                for (pattern, body) in clauses {
                    emitted.push(Clause {
                        pattern: self.emit_pattern(pattern)?,
                        guard: None,
                        body: self.emit_expr(body)?,
                    });
                }
                let default_body = match default {
                    Some(node) => self.emit_expr(node)?,
                    None => Expr::Throw(Box::new(Expr::Literal(Literal::String(
                        "no matching clause".to_string(),
                    )))),
                };
                emitted.push(Clause {
                    pattern: Pattern::Wildcard,
                    guard: None,
                    body: default_body,
                });
                Ok(Expr::Case {
                    subject: Box::new(subject),
                    clauses: emitted,
                })
            }
            Op::NativeMap { pairs } => {
                let entries = pairs
                    .iter()
                    .map(|(k, v)| Ok((self.emit_expr(k)?, self.emit_expr(v)?)))
                    .collect::<Result<_, ClatterError>>()?;
                Ok(Expr::MapNew(entries))
            }
            Op::NativeList { items } => Ok(Expr::List(self.emit_all(items)?)),
            Op::Binary { segments } => {
                let mut emitted = Vec::with_capacity(segments.len());
                for segment in segments {
                    let Op::BinarySegment {
                        value,
                        size,
                        unit,
                        kind,
                    } = &segment.op
                    else {
                        return Err(internal_error(segment.span, "binary expects segments"));
                    };
                    emitted.push(BinSegment {
                        value: self.emit_expr(value)?,
                        size: match size {
                            Some(node) => Some(Box::new(self.emit_expr(node)?)),
                            None => None,
                        },
                        unit: *unit,
                        kind: *kind,
                    });
                }
                Ok(Expr::Binary(emitted))
            }
            Op::BinarySegment { .. } => {
                Err(internal_error(node.span, "binary segment outside binary"))
            }
            Op::Tuple { items } => Ok(Expr::Tuple(self.emit_all(items)?)),
            Op::Def {
                var,
                init,
                dynamic,
                is_macro,
                ..
            } => self.emit_def(var, init.as_deref(), *dynamic, *is_macro),
            Op::Import { .. } => Ok(Expr::Literal(Literal::Nil)),
            Op::New { type_name, args } => Ok(Expr::Call {
                module: type_name.to_string(),
                function: "__new__".to_string(),
                args: self.emit_all(args)?,
            }),
            Op::DefType {
                name,
                fields,
                impls,
            } => self.emit_deftype(name, fields, impls),
            Op::DefProtocol { name, methods } => self.emit_defprotocol(name, methods),
            Op::ExtendType { impls, .. } => self.emit_extend_type(impls),
            Op::Invoke { f, args } => self.emit_invoke(f, args),
            Op::ResolveType { name } => Ok(Expr::Literal(Literal::Symbol(name.clone()))),
            Op::Throw { exception } => {
                Ok(Expr::Throw(Box::new(self.emit_expr(exception)?)))
            }
            Op::Try {
                body,
                catches,
                finally,
            } => {
                let body = self.emit_expr(body)?;
                let mut emitted = Vec::with_capacity(catches.len());
                for catch in catches {
                    let Op::Catch {
                        class,
                        local,
                        stack_local,
                        body,
                    } = &catch.op
                    else {
                        return Err(internal_error(catch.span, "try expects catch nodes"));
                    };
                    emitted.push(CatchClause {
                        class: match class {
                            CatchClass::Default => None,
                            CatchClass::Type(sym) => Some(sym.clone()),
                        },
                        var: binding_ir_name(local)?,
                        stack_var: match stack_local {
                            Some(node) => Some(binding_ir_name(node)?),
                            None => None,
                        },
                        body: self.emit_expr(body)?,
                    });
                }
                let finally = match finally {
                    Some(node) => Some(Box::new(self.emit_expr(node)?)),
                    None => None,
                };
                Ok(Expr::Try {
                    body: Box::new(body),
                    catches: emitted,
                    finally,
                })
            }
            Op::Catch { .. } => Err(internal_error(node.span, "catch outside try")),
            Op::HostFn {
                module,
                function,
                arity,
            } => Ok(Expr::FunRef {
                module: module.clone(),
                name: function.clone(),
                arity: arity.unwrap_or(0),
            }),
            Op::VarRef { var } => Ok(var_val(var)),
            Op::TypeRef { name } => Ok(Expr::Literal(Literal::Symbol(name.clone()))),
            Op::WithMeta { expr, meta } => Ok(Expr::Call {
                module: RT_NS.to_string(),
                function: "with-meta".to_string(),
                args: vec![self.emit_expr(expr)?, self.emit_expr(meta)?],
            }),
            Op::VectorLit { items } => Ok(Expr::Call {
                module: RT_NS.to_string(),
                function: "vector".to_string(),
                args: self.emit_all(items)?,
            }),
            Op::SetLit { items } => Ok(Expr::Call {
                module: RT_NS.to_string(),
                function: "set".to_string(),
                args: vec![Expr::List(self.emit_all(items)?)],
            }),
            Op::MapLit { pairs } => {
                let mut flat = Vec::with_capacity(pairs.len() * 2);
                for (k, v) in pairs {
                    flat.push(self.emit_expr(k)?);
                    flat.push(self.emit_expr(v)?);
                }
                Ok(Expr::Call {
                    module: RT_NS.to_string(),
                    function: "map*".to_string(),
                    args: vec![Expr::List(flat)],
                })
            }
            Op::Receive { clauses, after } => {
                let mut emitted = Vec::with_capacity(clauses.len());
                for (pattern, body) in clauses {
                    emitted.push(Clause {
                        pattern: self.emit_pattern(pattern)?,
                        guard: None,
                        body: self.emit_expr(body)?,
                    });
                }
                let after = match after {
                    Some(node) => {
                        let Op::After { timeout, body } = &node.op else {
                            return Err(internal_error(node.span, "receive expects after"));
                        };
                        Some(crate::ir::AfterClause {
                            timeout: Box::new(self.emit_expr(timeout)?),
                            body: Box::new(self.emit_expr(body)?),
                        })
                    }
                    None => None,
                };
                Ok(Expr::Receive {
                    clauses: emitted,
                    after,
                })
            }
            Op::After { .. } => Err(internal_error(node.span, "after outside receive")),
            Op::PatternAlias { .. } => {
                Err(internal_error(node.span, "alias pattern outside a match"))
            }
            Op::OnLoad { body } => {
                let body = self.emit_expr(body)?;
                let module = self.current_module();
                self.builder(&module).append_on_load(body);
                Ok(Expr::Literal(Literal::Nil))
            }
        }
    }

    // ---- constants -------------------------------------------------------

    fn emit_constant(&mut self, form: &Form) -> Result<Expr, ClatterError> {
        if let Some(lit) = literal_of_form(form) {
            return Ok(Expr::Literal(lit));
        }
        let construction = self.constant_construction(form)?;
        let module = self.current_module();
        let builder = self.builder(&module);
        let index = builder.add_constant(construction);
        Ok(builder.const_ref(index))
    }

    /// Builds the one-time construction expression for a non-literal
    /// constant; the caller lifts it into the module's on-load body.
    fn constant_construction(&mut self, form: &Form) -> Result<Expr, ClatterError> {
        if let Some(lit) = literal_of_form(form) {
            return Ok(Expr::Literal(lit));
        }
        match &form.kind {
            FormKind::List(items) => Ok(Expr::List(
                items
                    .iter()
                    .map(|f| self.constant_construction(f))
                    .collect::<Result<_, _>>()?,
            )),
            FormKind::Vector(items) => Ok(Expr::Call {
                module: RT_NS.to_string(),
                function: "vector".to_string(),
                args: items
                    .iter()
                    .map(|f| self.constant_construction(f))
                    .collect::<Result<_, _>>()?,
            }),
            FormKind::Set(items) => Ok(Expr::Call {
                module: RT_NS.to_string(),
                function: "set".to_string(),
                args: vec![Expr::List(
                    items
                        .iter()
                        .map(|f| self.constant_construction(f))
                        .collect::<Result<_, _>>()?,
                )],
            }),
            FormKind::Map(entries) => {
                let mut flat = Vec::with_capacity(entries.len() * 2);
                for (k, v) in entries {
                    flat.push(self.constant_construction(k)?);
                    flat.push(self.constant_construction(v)?);
                }
                Ok(Expr::Call {
                    module: RT_NS.to_string(),
                    function: "map*".to_string(),
                    args: vec![Expr::List(flat)],
                })
            }
            FormKind::Regex(pattern) => Ok(Expr::Call {
                module: RT_NS.to_string(),
                function: "re-pattern".to_string(),
                args: vec![Expr::Literal(Literal::String(pattern.clone()))],
            }),
            FormKind::Tagged { tag, value } => Ok(Expr::Call {
                module: RT_NS.to_string(),
                function: "tagged".to_string(),
                args: vec![
                    Expr::Literal(Literal::Symbol(tag.clone())),
                    self.constant_construction(value)?,
                ],
            }),
            FormKind::ReaderCond { .. } => Err(ClatterError::bad_form(
                "unresolved reader conditional in constant",
            )
            .with_span(form.span)),
            _ => Err(ClatterError::bad_form("unexpected constant form").with_span(form.span)),
        }
    }

    // ---- functions -------------------------------------------------------

    fn emit_lambda(
        &mut self,
        methods: &[Node],
        self_binding: Option<&LocalBinding>,
    ) -> Result<Expr, ClatterError> {
        let mut emitted = Vec::with_capacity(methods.len());
        for method in methods {
            emitted.push(self.emit_lambda_method(method)?);
        }
        Ok(Expr::Lambda {
            methods: emitted,
            self_name: self_binding.map(|b| b.ir_name()),
        })
    }

    fn emit_lambda_method(&mut self, method: &Node) -> Result<LambdaMethod, ClatterError> {
        let Op::FnMethod {
            params,
            variadic,
            loop_id,
            body,
            ..
        } = &method.op
        else {
            return Err(internal_error(method.span, "expected fn method"));
        };
        let names: Vec<String> = params
            .iter()
            .map(|p| binding_ir_name(p))
            .collect::<Result<_, _>>()?;
        let body = self.emit_expr(body)?;
        Ok(LambdaMethod {
            params: names.clone(),
            variadic: *variadic,
            body: Expr::LetRec {
                name: loop_label(*loop_id),
                params: names.clone(),
                fun_body: Box::new(body),
                args: names.into_iter().map(Expr::Var).collect(),
            },
        })
    }

    fn emit_def(
        &mut self,
        var: &Var,
        init: Option<&Node>,
        dynamic: bool,
        is_macro: bool,
    ) -> Result<Expr, ClatterError> {
        let module = self.current_module();
        let value = match init {
            None => {
                return Ok(Expr::Call {
                    module: RT_NS.to_string(),
                    function: "declare".to_string(),
                    args: vec![
                        Expr::Literal(Literal::String(var.ns().to_string())),
                        Expr::Literal(Literal::String(var.name().to_string())),
                    ],
                })
            }
            Some(node) => match &node.op {
                // a fn init becomes named top-level functions; the var's
                // root closes over them through a fn-ref
                Op::Fn {
                    methods,
                    variadic_arity,
                    fixed_arities,
                    ..
                } => {
                    for method in methods {
                        self.emit_named_fun(var.name(), method)?;
                    }
                    let arity_items = fixed_arities
                        .iter()
                        .map(|a| Expr::Literal(Literal::Int(*a as i64)))
                        .collect();
                    Expr::Call {
                        module: RT_NS.to_string(),
                        function: "fn-ref".to_string(),
                        args: vec![
                            Expr::Literal(Literal::String(module.clone())),
                            Expr::Literal(Literal::String(var.name().to_string())),
                            Expr::List(arity_items),
                            match variadic_arity {
                                Some(n) => Expr::Literal(Literal::Int(*n as i64)),
                                None => Expr::Literal(Literal::Nil),
                            },
                        ],
                    }
                }
                // other inits become a nullary value function so the root
                // binding is computed by the loaded module itself
                _ => {
                    let body = self.emit_expr(node)?;
                    let fun_name = format!("{}__val", var.name());
                    self.builder(&module).add_fun(
                        FunDef {
                            name: fun_name.clone(),
                            params: vec![],
                            variadic: false,
                            body,
                        },
                        true,
                    );
                    Expr::Call {
                        module: module.clone(),
                        function: fun_name,
                        args: vec![],
                    }
                }
            },
        };
        Ok(Expr::Call {
            module: RT_NS.to_string(),
            function: "def".to_string(),
            args: vec![
                Expr::Literal(Literal::String(var.ns().to_string())),
                Expr::Literal(Literal::String(var.name().to_string())),
                Expr::Literal(Literal::Bool(dynamic)),
                Expr::Literal(Literal::Bool(is_macro)),
                value,
            ],
        })
    }

    /// Emits one fn method as a named exported top-level function in the
    /// current module; answers the method's full parameter count.
    fn emit_named_fun(&mut self, name: &str, method: &Node) -> Result<usize, ClatterError> {
        let lambda = self.emit_lambda_method(method)?;
        let module = self.current_module();
        self.builder(&module).add_fun(
            FunDef {
                name: name.to_string(),
                params: lambda.params.clone(),
                variadic: lambda.variadic,
                body: lambda.body,
            },
            true,
        );
        Ok(lambda.params.len())
    }

    // ---- protocols and types ---------------------------------------------

    fn emit_deftype(
        &mut self,
        name: &Symbol,
        fields: &[Node],
        impls: &[ProtocolImpl],
    ) -> Result<Expr, ClatterError> {
        let module_name = name.to_string();
        let field_bindings: Vec<(String, String)> = fields
            .iter()
            .map(|f| {
                binding_ir_name(f).map(|ir| {
                    let keyword = match &f.op {
                        Op::Binding { binding } => binding.name.name.clone(),
                        _ => ir.clone(),
                    };
                    (ir, keyword)
                })
            })
            .collect::<Result<_, _>>()?;

        // constructor: a tagged record is a host map carrying :type
        let mut entries = vec![(
            Expr::Literal(Literal::Keyword(Symbol::simple("type"))),
            Expr::Literal(Literal::Symbol(name.clone())),
        )];
        for (ir_name, keyword) in &field_bindings {
            entries.push((
                Expr::Literal(Literal::Keyword(Symbol::simple(keyword.clone()))),
                Expr::Var(ir_name.clone()),
            ));
        }
        let constructor = FunDef {
            name: "__new__".to_string(),
            params: field_bindings.iter().map(|(ir, _)| ir.clone()).collect(),
            variadic: false,
            body: Expr::MapNew(entries),
        };
        {
            let builder = self.builder(&module_name);
            builder.set_attr("record", Literal::Bool(true));
            builder.add_fun(constructor, true);
        }
        self.emit_impl_methods(&module_name, impls, Some(&field_bindings))?;
        for pimpl in impls {
            self.emit_protocol_module(&pimpl.protocol.to_string())?;
        }
        Ok(Expr::Literal(Literal::Symbol(name.clone())))
    }

    fn emit_defprotocol(
        &mut self,
        name: &Symbol,
        methods: &[(String, Vec<usize>)],
    ) -> Result<Expr, ClatterError> {
        let protocol = name.to_string();
        self.emit_protocol_module(&protocol)?;
        // each method name is also a var in the defining namespace whose
        // value dispatches through the protocol module
        let ns = self.registry.read().unwrap().current_ns().to_string();
        let mut exprs = Vec::new();
        for (method, arities) in methods {
            exprs.push(Expr::Call {
                module: RT_NS.to_string(),
                function: "def".to_string(),
                args: vec![
                    Expr::Literal(Literal::String(ns.clone())),
                    Expr::Literal(Literal::String(method.clone())),
                    Expr::Literal(Literal::Bool(false)),
                    Expr::Literal(Literal::Bool(false)),
                    Expr::Call {
                        module: RT_NS.to_string(),
                        function: "fn-ref".to_string(),
                        args: vec![
                            Expr::Literal(Literal::String(protocol.clone())),
                            Expr::Literal(Literal::String(method.clone())),
                            Expr::List(
                                arities
                                    .iter()
                                    .map(|a| Expr::Literal(Literal::Int(*a as i64)))
                                    .collect(),
                            ),
                            Expr::Literal(Literal::Nil),
                        ],
                    },
                ],
            });
        }
        exprs.push(Expr::Literal(Literal::Symbol(name.clone())));
        Ok(Expr::Seq(exprs))
    }

    /// Emits extension method bodies into their impl modules and refreshes
    /// each protocol's dispatch shell; the shell module's identity is stable
    /// across re-emission.
    fn emit_extend_type(&mut self, impls: &[ProtocolImpl]) -> Result<Expr, ClatterError> {
        let mut last = Expr::Literal(Literal::Nil);
        for pimpl in impls {
            self.emit_methods_into(&pimpl.impl_module, &pimpl.methods, None)?;
            self.emit_protocol_module(&pimpl.protocol.to_string())?;
            last = Expr::Literal(Literal::Symbol(pimpl.protocol.clone()));
        }
        Ok(last)
    }

    fn emit_impl_methods(
        &mut self,
        module: &str,
        impls: &[ProtocolImpl],
        fields: Option<&[(String, String)]>,
    ) -> Result<(), ClatterError> {
        for pimpl in impls {
            self.emit_methods_into(module, &pimpl.methods, fields)?;
        }
        Ok(())
    }

    fn emit_methods_into(
        &mut self,
        module: &str,
        methods: &[crate::hir::ProtocolMethodImpl],
        fields: Option<&[(String, String)]>,
    ) -> Result<(), ClatterError> {
        for method in methods {
            let Op::Fn { methods: fn_methods, .. } = &method.fn_node.op else {
                return Err(internal_error(
                    method.fn_node.span,
                    "protocol method must be a fn",
                ));
            };
            for fn_method in fn_methods {
                let lambda = self.emit_lambda_method(fn_method)?;
                let body = match fields {
                    Some(fields) if !fields.is_empty() => {
                        let self_param = lambda.params.first().cloned().ok_or_else(|| {
                            internal_error(
                                fn_method.span,
                                "protocol method needs a self parameter",
                            )
                        })?;
                        let bindings = fields
                            .iter()
                            .map(|(ir_name, keyword)| {
                                (
                                    ir_name.clone(),
                                    Expr::Call {
                                        module: RT_NS.to_string(),
                                        function: "record-get".to_string(),
                                        args: vec![
                                            Expr::Var(self_param.clone()),
                                            Expr::Literal(Literal::Keyword(Symbol::simple(
                                                keyword.clone(),
                                            ))),
                                        ],
                                    },
                                )
                            })
                            .collect();
                        Expr::Let {
                            bindings,
                            body: Box::new(lambda.body),
                        }
                    }
                    _ => lambda.body,
                };
                self.builder(module).add_fun(
                    FunDef {
                        name: method.name.clone(),
                        params: lambda.params,
                        variadic: lambda.variadic,
                        body,
                    },
                    true,
                );
            }
        }
        Ok(())
    }

    fn emit_protocol_module(&mut self, protocol: &str) -> Result<(), ClatterError> {
        let module = self
            .protocols
            .read()
            .unwrap()
            .dispatch_module(protocol)
            .ok_or_else(|| {
                ClatterError::bad_form(format!("{} is not a registered protocol", protocol))
            })?;
        let builder = self.builder(protocol);
        builder.mark_protocol();
        builder.set_attr("protocol", Literal::Bool(true));
        for fun in module.funs {
            builder.add_fun(fun, true);
        }
        Ok(())
    }

    // ---- invocation ------------------------------------------------------

    fn emit_invoke(&mut self, f: &Node, args: &[Node]) -> Result<Expr, ClatterError> {
        let emitted_args = self.emit_all(args)?;
        match &f.op {
            Op::HostFn {
                module,
                function,
                arity: Some(_),
            } => Ok(Expr::Call {
                module: module.clone(),
                function: function.clone(),
                args: emitted_args,
            }),
            Op::VarRef { var } => {
                // a var already bound to a module function of this arity
                // compiles to a direct call; anything else goes through the
                // dynamic apply path
                if let Some(crate::value::Value::Fn(FnValue::Module {
                    module,
                    name,
                    arities,
                    variadic,
                })) = var.root()
                {
                    let argc = emitted_args.len();
                    let direct = arities.contains(&argc)
                        || variadic.map(|min| argc >= min).unwrap_or(false);
                    if direct {
                        return Ok(Expr::Call {
                            module,
                            function: name,
                            args: emitted_args,
                        });
                    }
                }
                Ok(Expr::Apply {
                    f: Box::new(var_val(var)),
                    args: emitted_args,
                })
            }
            _ => Ok(Expr::Apply {
                f: Box::new(self.emit_expr(f)?),
                args: emitted_args,
            }),
        }
    }

    // ---- patterns --------------------------------------------------------

    fn emit_pattern(&mut self, node: &Node) -> Result<Pattern, ClatterError> {
        match &node.op {
            Op::Binding { binding } => {
                if binding.is_underscore {
                    Ok(Pattern::Wildcard)
                } else {
                    Ok(Pattern::Bind(binding.ir_name()))
                }
            }
            Op::Constant { value } => constant_pattern(value),
            Op::Tuple { items } => Ok(Pattern::Tuple(
                items
                    .iter()
                    .map(|i| self.emit_pattern(i))
                    .collect::<Result<_, _>>()?,
            )),
            Op::MapLit { pairs } => {
                let mut entries = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let Op::Constant { value: key_form } = &key.op else {
                        return Err(internal_error(key.span, "map pattern key must be constant"));
                    };
                    let key_lit = literal_of_form(key_form).ok_or_else(|| {
                        internal_error(key.span, "map pattern key must be a literal")
                    })?;
                    entries.push((key_lit, self.emit_pattern(value)?));
                }
                Ok(Pattern::Map(entries))
            }
            Op::PatternAlias { binding, pattern } => {
                let name = binding_ir_name(binding)?;
                Ok(Pattern::Alias {
                    name,
                    pattern: Box::new(self.emit_pattern(pattern)?),
                })
            }
            _ => Err(internal_error(node.span, "unsupported pattern node")),
        }
    }

    fn emit_bindings(
        &mut self,
        bindings: &[(Node, Node)],
    ) -> Result<Vec<(String, Expr)>, ClatterError> {
        bindings
            .iter()
            .map(|(binding, init)| Ok((binding_ir_name(binding)?, self.emit_expr(init)?)))
            .collect()
    }

    fn emit_all(&mut self, nodes: &[Node]) -> Result<Vec<Expr>, ClatterError> {
        nodes.iter().map(|n| self.emit_expr(n)).collect()
    }
}

fn var_val(var: &Var) -> Expr {
    Expr::Call {
        module: RT_NS.to_string(),
        function: "var-val".to_string(),
        args: vec![
            Expr::Literal(Literal::String(var.ns().to_string())),
            Expr::Literal(Literal::String(var.name().to_string())),
        ],
    }
}

/// `if` compiles to a case over truthiness: nil and false take the else
/// branch, everything else the then branch.
fn truthiness_case(subject: Expr, then: Expr, otherwise: Expr) -> Expr {
    Expr::Case {
        subject: Box::new(subject),
        clauses: vec![
            Clause {
                pattern: Pattern::Literal(Literal::Nil),
                guard: None,
                body: otherwise.clone(),
            },
            Clause {
                pattern: Pattern::Literal(Literal::Bool(false)),
                guard: None,
                body: otherwise,
            },
            Clause {
                pattern: Pattern::Wildcard,
                guard: None,
                body: then,
            },
        ],
    }
}

fn loop_label(id: usize) -> String {
    format!("loop__{}", id)
}

fn binding_ir_name(node: &Node) -> Result<String, ClatterError> {
    match &node.op {
        Op::Binding { binding } => Ok(binding.ir_name()),
        _ => Err(internal_error(node.span, "expected a binding node")),
    }
}

fn literal_of_form(form: &Form) -> Option<Literal> {
    Some(match &form.kind {
        FormKind::Nil => Literal::Nil,
        FormKind::Bool(b) => Literal::Bool(*b),
        FormKind::Int(n) => Literal::Int(*n),
        FormKind::BigInt(n) => Literal::BigInt(n.clone()),
        FormKind::Ratio(r) => Literal::Ratio(r.clone()),
        FormKind::Float(x) => Literal::Float(*x),
        FormKind::BigDecimal(d) => Literal::Decimal(d.clone()),
        FormKind::Char(c) => Literal::Char(*c),
        FormKind::String(s) => Literal::String(s.clone()),
        FormKind::Keyword(sym) => Literal::Keyword(sym.clone()),
        FormKind::Symbol(sym) => Literal::Symbol(sym.clone()),
        _ => return None,
    })
}

fn constant_pattern(form: &Form) -> Result<Pattern, ClatterError> {
    match literal_of_form(form) {
        Some(lit) => Ok(Pattern::Literal(lit)),
        None => match &form.kind {
            FormKind::Vector(items) | FormKind::List(items) => Ok(Pattern::List {
                items: items
                    .iter()
                    .map(constant_pattern)
                    .collect::<Result<_, _>>()?,
                tail: None,
            }),
            _ => Err(ClatterError::bad_form("unsupported constant pattern")
                .with_span(form.span)),
        },
    }
}

fn internal_error(span: Span, message: &str) -> ClatterError {
    ClatterError::bad_form(message.to_string()).with_span(span)
}
