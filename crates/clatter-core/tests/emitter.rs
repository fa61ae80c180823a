mod common;

use std::sync::Arc;

use clatter_core::analyzer::{Analyzer, AnalyzerOptions};
use clatter_core::emitter::Emitter;
use clatter_core::env::Env;
use clatter_core::host::InMemoryHost;
use clatter_core::ir::{Expr, Literal, Module, Pattern};
use clatter_core::module::ModuleContext;
use clatter_core::namespaces::new_registry_ref;
use clatter_core::protocols::new_protocols_ref;
use common::read_one;

/// Runs one form through analysis and emission, answering the emitted
/// expressions and the flushed modules.
fn emit_one(source: &str) -> (Vec<Expr>, Vec<Module>) {
    let registry = new_registry_ref();
    let protocols = new_protocols_ref();
    let host = Arc::new(InMemoryHost::new(registry.clone()));
    let mut analyzer = Analyzer::new(
        registry.clone(),
        protocols.clone(),
        host.clone(),
        AnalyzerOptions {
            no_warn_symbol_as_host_fun: true,
            ..AnalyzerOptions::default()
        },
    );
    let form = read_one(source);
    let node = analyzer
        .analyze(&form, &Env::new())
        .unwrap_or_else(|e| panic!("failed to analyze {:?}: {}", source, e));
    let mut ctx = ModuleContext::new();
    let mut emitter = Emitter::new(registry, protocols, host, &mut ctx);
    let exprs = emitter
        .emit(&node)
        .unwrap_or_else(|e| panic!("failed to emit {:?}: {}", source, e));
    (exprs, ctx.flush())
}

#[test]
fn if_compiles_to_a_truthiness_case() {
    let (exprs, _) = emit_one("(if nil 1 2)");
    let Expr::Case { clauses, .. } = &exprs[0] else {
        panic!("if must compile to case, got {:?}", exprs[0]);
    };
    assert_eq!(clauses.len(), 3);
    assert_eq!(clauses[0].pattern, Pattern::Literal(Literal::Nil));
    assert_eq!(clauses[1].pattern, Pattern::Literal(Literal::Bool(false)));
    assert_eq!(clauses[2].pattern, Pattern::Wildcard);
}

#[test]
fn loop_compiles_to_let_plus_letrec_and_recur_to_a_tail_call() {
    let (exprs, _) = emit_one("(loop* [x 1] (if x x (recur 2)))");
    let Expr::Let { body, .. } = &exprs[0] else {
        panic!("loop must bind first, got {:?}", exprs[0]);
    };
    let Expr::LetRec { fun_body, .. } = body.as_ref() else {
        panic!("loop body must be a letrec");
    };
    let printed = fun_body.to_string();
    assert!(printed.contains("goto"), "{}", printed);
}

#[test]
fn def_of_a_fn_emits_named_module_functions() {
    let (exprs, modules) = emit_one("(def f (fn* ([x] x) ([x y] y)))");
    assert_eq!(modules.len(), 1);
    let module = &modules[0];
    assert_eq!(module.name, "user");
    assert!(module.fun("f", 1).is_some());
    assert!(module.fun("f", 2).is_some());
    assert!(module.exports_fun("f", 1));
    assert!(module.exports_fun("f", 2));
    // the def expression itself closes the var over a fn-ref
    let printed = exprs[0].to_string();
    assert!(printed.contains("fn-ref"), "{}", printed);
    assert!(printed.contains("def"), "{}", printed);
}

#[test]
fn collection_constants_lift_into_on_load() {
    let (_, modules) = emit_one("(def v [1 2 3])");
    let module = &modules[0];
    let on_load = module
        .on_load
        .iter()
        .map(|e| e.to_string())
        .collect::<String>();
    assert!(on_load.contains("const-put"), "{}", on_load);
    // the value function reads the lifted slot back
    let val_fun = module.fun("v__val", 0).expect("value function emitted");
    assert!(val_fun.body.to_string().contains("const-get"));
}

#[test]
fn numeric_literals_stay_literal() {
    let (exprs, modules) = emit_one("9999999999999999999999N");
    assert!(modules.is_empty());
    assert!(matches!(
        exprs[0],
        Expr::Literal(Literal::BigInt(_))
    ));
}

#[test]
fn deftype_emits_a_constructor_module() {
    let (_, modules) = emit_one("(deftype* T [a b])");
    let module = modules
        .iter()
        .find(|m| m.name == "user.T")
        .expect("type module emitted");
    let constructor = module.fun("__new__", 2).expect("constructor present");
    let printed = constructor.body.to_string();
    assert!(printed.contains(":type"), "{}", printed);
    assert!(printed.contains("user.T"), "{}", printed);
}

#[test]
fn on_load_bodies_accumulate_into_the_current_module() {
    let (exprs, modules) = emit_one("(on-load* (clatter.rt/monitor-enter 1))");
    assert!(matches!(exprs[0], Expr::Literal(Literal::Nil)));
    let module = &modules[0];
    assert_eq!(module.on_load.len(), 1);
}

#[test]
fn receive_emits_clauses_and_after() {
    let (exprs, _) = emit_one("(receive* x x (after 100 :timeout))");
    let Expr::Receive { clauses, after } = &exprs[0] else {
        panic!("expected receive, got {:?}", exprs[0]);
    };
    assert_eq!(clauses.len(), 1);
    assert!(after.is_some());
}

#[test]
fn defprotocol_emits_a_dispatch_module_with_shells() {
    let (_, modules) = emit_one("(defprotocol P (m [x] [x y]))");
    let module = modules
        .iter()
        .find(|m| m.name == "user.P")
        .expect("protocol module emitted");
    assert!(module.fun("m", 1).is_some());
    assert!(module.fun("m", 2).is_some());
    assert!(module.fun("__satisfies__", 1).is_some());
    assert!(module.fun("__extenders__", 0).is_some());
    assert!(module
        .attrs
        .iter()
        .any(|(k, v)| k == "protocol" && *v == Literal::Bool(true)));
}
