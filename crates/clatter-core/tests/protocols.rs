use std::collections::BTreeSet;

use clatter_core::ir::{Expr, Pattern};
use clatter_core::protocols::{ImplKey, ProtocolMethod, ProtocolRegistry};
use clatter_core::value::{PrimKind, PRIM_ORDER};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn primitive_clause_order_is_frozen() {
    // the 1..14 order is part of the module contract
    let names: Vec<&str> = PRIM_ORDER.iter().map(|p| p.name()).collect();
    assert_eq!(
        names,
        vec![
            "nil", "boolean", "integer", "bigint", "ratio", "float", "decimal", "char",
            "string", "keyword", "symbol", "tuple", "list", "map",
        ]
    );
    assert_eq!(PRIM_ORDER.len(), 14);
}

#[test]
fn every_method_dispatch_is_total() {
    let mut registry = ProtocolRegistry::new();
    registry.define_protocol(
        "ns.P",
        vec![ProtocolMethod {
            name: "m".into(),
            arities: BTreeSet::from([1, 2]),
        }],
    );
    registry.extend("ns.P", ImplKey::Prim(PrimKind::Integer), "ns.P.integer");
    let module = registry.dispatch_module("ns.P").unwrap();
    for arity in [1usize, 2] {
        let fun = module.fun("m", arity).unwrap();
        let Expr::Case { clauses, .. } = &fun.body else {
            panic!("dispatch is a case");
        };
        assert!(
            matches!(clauses.last().unwrap().pattern, Pattern::Wildcard),
            "catch-all must close the dispatch"
        );
    }
}

#[test]
fn random_protocols_have_m_plus_prims_plus_two_clauses() {
    let mut rng = StdRng::seed_from_u64(0xd15);
    for round in 0..50 {
        let mut registry = ProtocolRegistry::new();
        let k = rng.gen_range(1..5);
        let methods = (0..k)
            .map(|i| ProtocolMethod {
                name: format!("m{}", i),
                arities: BTreeSet::from([rng.gen_range(1..4usize)]),
            })
            .collect();
        let name = format!("gen.P{}", round);
        registry.define_protocol(&name, methods);
        let m = rng.gen_range(0..6);
        for t in 0..m {
            let type_name = format!("gen.T{}", t);
            registry.extend(&name, ImplKey::Record(type_name.clone()), &type_name);
        }
        let module = registry.dispatch_module(&name).unwrap();
        for fun in module
            .funs
            .iter()
            .filter(|f| !f.name.starts_with("__"))
        {
            let Expr::Case { clauses, .. } = &fun.body else {
                panic!("dispatch is a case");
            };
            assert_eq!(
                clauses.len(),
                m + PRIM_ORDER.len() + 2,
                "protocol {} method {}",
                name,
                fun.name
            );
        }
    }
}

#[test]
fn extension_is_once_per_type_and_replaces() {
    let mut registry = ProtocolRegistry::new();
    registry.define_protocol(
        "ns.P",
        vec![ProtocolMethod {
            name: "m".into(),
            arities: BTreeSet::from([1]),
        }],
    );
    registry.extend("ns.P", ImplKey::Record("ns.T".into()), "ns.T");
    registry.extend("ns.P", ImplKey::Record("ns.T".into()), "ns.T2");
    let extenders = registry.extenders("ns.P");
    assert_eq!(extenders.len(), 1);
    let module = registry.dispatch_module("ns.P").unwrap();
    let fun = module.fun("m", 1).unwrap();
    assert!(fun.body.to_string().contains("ns.T2"));
}

#[test]
fn redefinition_keeps_extensions_and_identity() {
    let mut registry = ProtocolRegistry::new();
    registry.define_protocol(
        "ns.P",
        vec![ProtocolMethod {
            name: "m".into(),
            arities: BTreeSet::from([1]),
        }],
    );
    registry.extend("ns.P", ImplKey::Record("ns.T".into()), "ns.T");
    registry.define_protocol(
        "ns.P",
        vec![
            ProtocolMethod {
                name: "m".into(),
                arities: BTreeSet::from([1]),
            },
            ProtocolMethod {
                name: "n".into(),
                arities: BTreeSet::from([1]),
            },
        ],
    );
    assert_eq!(registry.extenders("ns.P").len(), 1);
    let module = registry.dispatch_module("ns.P").unwrap();
    assert!(module.fun("n", 1).is_some());
}
