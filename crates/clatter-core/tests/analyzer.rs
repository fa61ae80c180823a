mod common;

use clatter_core::error::ClatterError;
use clatter_core::hir::{walk, Op};
use common::{analyze_one, read_one};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn multi_arity_fn_records_its_shape() {
    let node = analyze_one("(fn* ([x] x) ([x y] [x y]))").unwrap();
    let Op::Fn {
        fixed_arities,
        variadic,
        min_fixed_arity,
        max_fixed_arity,
        variadic_arity,
        methods,
        ..
    } = &node.op
    else {
        panic!("expected a fn node, got {}", node.op.tag());
    };
    assert_eq!(fixed_arities, &vec![1, 2]);
    assert!(!variadic);
    assert_eq!(*min_fixed_arity, 1);
    assert_eq!(*max_fixed_arity, 2);
    assert_eq!(*variadic_arity, None);
    assert_eq!(methods.len(), 2);
}

#[test]
fn variadic_fn_records_its_minimum() {
    let node = analyze_one("(fn* ([x] x) ([x & more] more))").unwrap();
    let Op::Fn {
        variadic,
        variadic_arity,
        ..
    } = &node.op
    else {
        panic!("expected a fn node");
    };
    assert!(variadic);
    assert_eq!(*variadic_arity, Some(1));
}

#[test]
fn duplicate_arities_are_rejected() {
    let err = analyze_one("(fn* ([x] x) ([y] y))").unwrap_err();
    assert!(matches!(err, ClatterError::DuplicateArity(_)), "{}", err);
}

#[test]
fn two_variadic_overloads_are_rejected() {
    let err = analyze_one("(fn* ([x & a] a) ([x y & b] b))").unwrap_err();
    assert!(matches!(err, ClatterError::MultipleVariadic(_)), "{}", err);
}

#[test]
fn variadic_shorter_than_a_fixed_overload_is_rejected() {
    let err = analyze_one("(fn* ([x y z] z) ([x & rest] rest))").unwrap_err();
    assert!(
        matches!(err, ClatterError::InvalidVariadicArity(_)),
        "{}",
        err
    );
}

#[test]
fn recur_outside_a_loop_target_is_rejected() {
    // the let body is tail position, but nothing is there to recur to
    let err = analyze_one("(let* [x 1] (recur x))").unwrap_err();
    assert!(
        matches!(err, ClatterError::RecurNotInTailPosition(_)),
        "{}",
        err
    );
}

#[test]
fn recur_in_non_tail_position_is_rejected() {
    let err = analyze_one("(loop* [x 1] (if (recur x) 1 2))").unwrap_err();
    assert!(
        matches!(err, ClatterError::RecurNotInTailPosition(_)),
        "{}",
        err
    );
}

#[test]
fn recur_in_a_try_body_is_rejected() {
    let err = analyze_one("(loop* [x 1] (try (recur x)))").unwrap_err();
    assert!(
        matches!(err, ClatterError::RecurNotInTailPosition(_)),
        "{}",
        err
    );
}

#[test]
fn recur_arity_must_match_the_loop() {
    let err = analyze_one("(loop* [x 0] (recur 1 2))").unwrap_err();
    assert!(matches!(err, ClatterError::RecurArityMismatch(_)), "{}", err);
}

#[test]
fn recur_in_loop_and_fn_tails_is_accepted() {
    for source in [
        "(loop* [x 0] (if x x (recur 1)))",
        "(fn* [x] (recur 1))",
        "(loop* [a 1 b 2] (do 1 (recur a b)))",
    ] {
        let node = analyze_one(source)
            .unwrap_or_else(|e| panic!("expected {} to analyze: {}", source, e));
        let mut recurs = 0;
        walk(&node, &mut |n| {
            if matches!(n.op, Op::Recur { .. }) {
                recurs += 1;
            }
        });
        assert_eq!(recurs, 1, "{}", source);
    }
}

#[test]
fn unresolved_symbols_are_reported_with_their_kind() {
    let err = analyze_one("nope").unwrap_err();
    assert!(matches!(err, ClatterError::UnresolvedSymbol(_)), "{}", err);
}

#[test]
fn locals_shadow_outer_bindings() {
    let node = analyze_one("(let* [x 1] (let* [x 2] x))").unwrap();
    let mut shadowed = false;
    walk(&node, &mut |n| {
        if let Op::Binding { binding } = &n.op {
            if binding.shadows.is_some() {
                shadowed = true;
            }
        }
    });
    assert!(shadowed);
}

#[test]
fn if_defaults_the_else_branch_to_nil() {
    let node = analyze_one("(if true 1)").unwrap();
    let Op::If { otherwise, .. } = &node.op else {
        panic!("expected if");
    };
    assert!(matches!(otherwise.op, Op::Constant { .. }));
}

#[test]
fn try_parses_catches_and_finally() {
    let node =
        analyze_one("(try 1 (catch :default e e) (finally 2))").unwrap();
    let Op::Try {
        catches, finally, ..
    } = &node.op
    else {
        panic!("expected try");
    };
    assert_eq!(catches.len(), 1);
    assert!(finally.is_some());
}

#[test]
fn two_finally_blocks_are_rejected() {
    let err = analyze_one("(try 1 (finally 2) (finally 3))").unwrap_err();
    assert!(matches!(err, ClatterError::BadSpecialForm(_)), "{}", err);
}

#[test]
fn catch_outside_try_is_rejected() {
    let err = analyze_one("(catch :default e e)").unwrap_err();
    assert!(matches!(err, ClatterError::BadSpecialForm(_)), "{}", err);
}

#[test]
fn quote_never_resolves() {
    let node = analyze_one("'unknown-symbol").unwrap();
    assert!(matches!(node.op, Op::Quote { .. }));
}

#[test]
fn def_interns_into_the_current_namespace() {
    let mut analyzer = common::analyzer();
    let form = read_one("(def x 1)");
    analyzer
        .analyze(&form, &clatter_core::env::Env::new())
        .unwrap();
    // user namespace now owns the var even before evaluation
    let form = read_one("x");
    let node = analyzer
        .analyze(&form, &clatter_core::env::Env::new())
        .unwrap();
    assert!(matches!(node.op, Op::VarRef { .. }));
}

// ---- never-panic property --------------------------------------------------

fn gen_source(rng: &mut StdRng, depth: usize) -> String {
    if depth == 0 || rng.gen_bool(0.4) {
        return match rng.gen_range(0..6) {
            0 => "42".to_string(),
            1 => ":kw".to_string(),
            2 => "x".to_string(),
            3 => "\"s\"".to_string(),
            4 => "nil".to_string(),
            _ => "recur".to_string(),
        };
    }
    let heads = [
        "if", "do", "let* [x 1]", "loop* [x 1]", "fn* [x]", "recur", "quote", "throw", "try",
        "case* 1", "f",
    ];
    let head = heads[rng.gen_range(0..heads.len())];
    let children = (0..rng.gen_range(0..3))
        .map(|_| gen_source(rng, depth - 1))
        .collect::<Vec<_>>()
        .join(" ");
    format!("({} {})", head, children)
}

#[test]
fn random_inputs_fail_with_taxonomy_kinds_not_panics() {
    let mut rng = StdRng::seed_from_u64(0xc1a77e4);
    for _ in 0..400 {
        let source = gen_source(&mut rng, 3);
        let form = match clatter_core::reader::Reader::new(&source).read_one() {
            Ok(Some(form)) => form,
            _ => continue,
        };
        // success or a taxonomy error, never a panic
        let _ = common::analyzer().analyze(&form, &clatter_core::env::Env::new());
    }
}
