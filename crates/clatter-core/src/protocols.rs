use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::ast::Symbol;
use crate::ir::{Clause, Expr, FunDef, Literal, Module, Pattern};
use crate::reader::RT_NS;
use crate::value::{PrimKind, PRIM_ORDER};

pub type ProtocolsRef = Arc<RwLock<ProtocolRegistry>>;

pub fn new_protocols_ref() -> ProtocolsRef {
    Arc::new(RwLock::new(ProtocolRegistry::new()))
}

/// What a protocol method can be implemented for: a host primitive shape or
/// a tagged record type. The derived order is the dispatch order — the
/// frozen primitive sequence first, then record types alphabetically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImplKey {
    Prim(PrimKind),
    Record(String),
}

impl ImplKey {
    pub fn parse(type_name: &Symbol) -> ImplKey {
        if type_name.ns.is_none() {
            if let Some(kind) = PrimKind::from_name(&type_name.name) {
                return ImplKey::Prim(kind);
            }
        }
        ImplKey::Record(type_name.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct ProtocolMethod {
    pub name: String,
    pub arities: BTreeSet<usize>,
}

#[derive(Clone, Debug)]
pub struct ProtocolDef {
    /// Also the dispatch module name, e.g. `ex.P`.
    pub name: String,
    pub methods: Vec<ProtocolMethod>,
    /// Implementing shape -> module holding the method bodies.
    pub impls: BTreeMap<ImplKey, String>,
}

/// A record type introduced by `deftype*`.
#[derive(Clone, Debug)]
pub struct TypeDef {
    /// Qualified name, e.g. `ex.T`; also the type's module name.
    pub name: String,
    pub fields: Vec<String>,
}

/// Process-scoped registry of protocols and record types, shared between the
/// analyzer (registration) and the emitter (dispatch shell generation).
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, ProtocolDef>,
    types: HashMap<String, TypeDef>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)defines a protocol. Extensions recorded against a previous
    /// definition carry over; the module identity is stable.
    pub fn define_protocol(&mut self, name: &str, methods: Vec<ProtocolMethod>) {
        let impls = self
            .protocols
            .remove(name)
            .map(|p| p.impls)
            .unwrap_or_default();
        self.protocols.insert(
            name.to_string(),
            ProtocolDef {
                name: name.to_string(),
                methods,
                impls,
            },
        );
    }

    pub fn protocol(&self, name: &str) -> Option<&ProtocolDef> {
        self.protocols.get(name)
    }

    /// Records that `key` implements `protocol` with bodies in `module`. A
    /// shape implements at most once per protocol; re-extension replaces.
    pub fn extend(&mut self, protocol: &str, key: ImplKey, module: &str) -> bool {
        match self.protocols.get_mut(protocol) {
            Some(def) => {
                def.impls.insert(key, module.to_string());
                true
            }
            None => false,
        }
    }

    pub fn define_type(&mut self, name: &str, fields: Vec<String>) {
        self.types.insert(
            name.to_string(),
            TypeDef {
                name: name.to_string(),
                fields,
            },
        );
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// The static extender set, as reported by `extenders`.
    pub fn extenders(&self, protocol: &str) -> Vec<ImplKey> {
        self.protocols
            .get(protocol)
            .map(|def| def.impls.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Builds the protocol's dispatch module: one exported function per
    /// method arity, each a flat case over the first argument's shape, plus
    /// the `satisfies?`/`extenders` shells. Marker protocols get only the
    /// shells.
    pub fn dispatch_module(&self, protocol: &str) -> Option<Module> {
        let def = self.protocols.get(protocol)?;
        let mut module = Module {
            name: def.name.clone(),
            attrs: vec![("protocol".to_string(), Literal::Bool(true))],
            exports: Vec::new(),
            funs: Vec::new(),
            on_load: Vec::new(),
        };
        for method in &def.methods {
            for &arity in &method.arities {
                let fun = dispatch_fun(def, &method.name, arity);
                module.exports.push(crate::ir::FunName {
                    name: fun.name.clone(),
                    arity,
                });
                module.funs.push(fun);
            }
        }
        module.exports.push(crate::ir::FunName {
            name: "__satisfies__".to_string(),
            arity: 1,
        });
        module.funs.push(satisfies_fun(def));
        module.exports.push(crate::ir::FunName {
            name: "__extenders__".to_string(),
            arity: 0,
        });
        module.funs.push(extenders_fun(def));
        Some(module)
    }
}

/// Clause order is total and stable: every primitive predicate in the frozen
/// 1..14 order, then tagged records alphabetically, then the untagged-record
/// clause, then the catch-all. Unimplemented shapes answer `NotImplemented`.
fn dispatch_fun(def: &ProtocolDef, method: &str, arity: usize) -> FunDef {
    let params: Vec<String> = (0..arity).map(|i| format!("x{}", i)).collect();
    let subject = Expr::Var(params[0].clone());
    let mut clauses = Vec::new();

    for prim in PRIM_ORDER {
        let body = match def.impls.get(&ImplKey::Prim(prim)) {
            Some(module) => call_impl(module, method, &params),
            None => not_implemented(def, method, &subject),
        };
        clauses.push(Clause {
            pattern: Pattern::Bind("v".to_string()),
            guard: Some(Expr::Call {
                module: RT_NS.to_string(),
                function: prim.predicate().to_string(),
                args: vec![Expr::Var("v".to_string())],
            }),
            body,
        });
    }

    for (key, module) in &def.impls {
        if let ImplKey::Record(type_name) = key {
            clauses.push(Clause {
                pattern: Pattern::Map(vec![(
                    Literal::Keyword(Symbol::simple("type")),
                    Pattern::Literal(Literal::Symbol(Symbol::parse(type_name))),
                )]),
                guard: None,
                body: call_impl(module, method, &params),
            });
        }
    }

    // untagged records: any map that fell through the shape clauses
    clauses.push(Clause {
        pattern: Pattern::Map(vec![]),
        guard: None,
        body: not_implemented(def, method, &subject),
    });
    clauses.push(Clause {
        pattern: Pattern::Wildcard,
        guard: None,
        body: not_implemented(def, method, &subject),
    });

    FunDef {
        name: method.to_string(),
        params: params.clone(),
        variadic: false,
        body: Expr::Case {
            subject: Box::new(subject),
            clauses,
        },
    }
}

fn call_impl(module: &str, method: &str, params: &[String]) -> Expr {
    Expr::Call {
        module: module.to_string(),
        function: method.to_string(),
        args: params.iter().map(|p| Expr::Var(p.clone())).collect(),
    }
}

fn not_implemented(def: &ProtocolDef, method: &str, subject: &Expr) -> Expr {
    Expr::Call {
        module: RT_NS.to_string(),
        function: "not-implemented".to_string(),
        args: vec![
            Expr::Literal(Literal::String(def.name.clone())),
            Expr::Literal(Literal::String(method.to_string())),
            subject.clone(),
        ],
    }
}

/// `satisfies?` compiles to a boolean predicate over the same discriminator.
fn satisfies_fun(def: &ProtocolDef) -> FunDef {
    let subject = Expr::Var("x0".to_string());
    let mut clauses = Vec::new();
    for (key, _) in &def.impls {
        match key {
            ImplKey::Prim(prim) => clauses.push(Clause {
                pattern: Pattern::Bind("v".to_string()),
                guard: Some(Expr::Call {
                    module: RT_NS.to_string(),
                    function: prim.predicate().to_string(),
                    args: vec![Expr::Var("v".to_string())],
                }),
                body: Expr::Literal(Literal::Bool(true)),
            }),
            ImplKey::Record(type_name) => clauses.push(Clause {
                pattern: Pattern::Map(vec![(
                    Literal::Keyword(Symbol::simple("type")),
                    Pattern::Literal(Literal::Symbol(Symbol::parse(type_name))),
                )]),
                guard: None,
                body: Expr::Literal(Literal::Bool(true)),
            }),
        }
    }
    clauses.push(Clause {
        pattern: Pattern::Wildcard,
        guard: None,
        body: Expr::Literal(Literal::Bool(false)),
    });
    FunDef {
        name: "__satisfies__".to_string(),
        params: vec!["x0".to_string()],
        variadic: false,
        body: Expr::Case {
            subject: Box::new(subject),
            clauses,
        },
    }
}

fn extenders_fun(def: &ProtocolDef) -> FunDef {
    let items = def
        .impls
        .keys()
        .map(|key| match key {
            ImplKey::Prim(prim) => {
                Expr::Literal(Literal::Keyword(Symbol::simple(prim.name())))
            }
            ImplKey::Record(type_name) => {
                Expr::Literal(Literal::Symbol(Symbol::parse(type_name)))
            }
        })
        .collect();
    FunDef {
        name: "__extenders__".to_string(),
        params: vec![],
        variadic: false,
        body: Expr::List(items),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> ProtocolRegistry {
        let mut registry = ProtocolRegistry::new();
        registry.define_protocol(
            "ex.P",
            vec![ProtocolMethod {
                name: "m".to_string(),
                arities: BTreeSet::from([1]),
            }],
        );
        registry
    }

    #[test]
    fn dispatch_clause_count_is_impls_plus_prims_plus_two() {
        let mut registry = sample_registry();
        registry.extend("ex.P", ImplKey::Record("ex.T".into()), "ex.T");
        registry.extend("ex.P", ImplKey::Record("ex.B".into()), "ex.B");
        let module = registry.dispatch_module("ex.P").unwrap();
        let fun = module.fun("m", 1).unwrap();
        let Expr::Case { clauses, .. } = &fun.body else {
            panic!("dispatch body must be a case");
        };
        assert_eq!(clauses.len(), 2 + PRIM_ORDER.len() + 2);
    }

    #[test]
    fn record_clauses_come_alphabetically_after_primitives() {
        let mut registry = sample_registry();
        registry.extend("ex.P", ImplKey::Record("ex.Zed".into()), "ex.Zed");
        registry.extend("ex.P", ImplKey::Record("ex.Alpha".into()), "ex.Alpha");
        let module = registry.dispatch_module("ex.P").unwrap();
        let fun = module.fun("m", 1).unwrap();
        let Expr::Case { clauses, .. } = &fun.body else {
            panic!("dispatch body must be a case");
        };
        let records: Vec<String> = clauses
            .iter()
            .filter_map(|c| match &c.pattern {
                Pattern::Map(entries) if !entries.is_empty() => match &entries[0].1 {
                    Pattern::Literal(Literal::Symbol(sym)) => Some(sym.to_string()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(records, vec!["ex.Alpha".to_string(), "ex.Zed".to_string()]);
    }

    #[test]
    fn marker_protocols_expose_only_the_shells() {
        let mut registry = ProtocolRegistry::new();
        registry.define_protocol("ex.Marker", vec![]);
        let module = registry.dispatch_module("ex.Marker").unwrap();
        let names: Vec<&str> = module.funs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["__satisfies__", "__extenders__"]);
    }
}
