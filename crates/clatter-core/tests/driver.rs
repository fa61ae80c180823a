mod common;

use clatter_core::error::ClatterError;
use clatter_core::value::Value;
use clatter_core::{CompileOptions, Driver};
use common::{eval, eval_ok, quiet_options};

#[test]
fn ns_def_and_reference_compile_in_order() {
    let driver = Driver::new(quiet_options());
    let result = driver.compile_source("(ns ex) (def x 1) x").unwrap();
    assert_eq!(result.value, Value::Int(1));
    assert!(result.artifacts.iter().any(|a| a.name == "ex"));
    // the var landed in its home namespace
    let registry = driver.registry();
    let registry = registry.read().unwrap();
    let var = registry
        .get("ex")
        .and_then(|ns| ns.interns.get("x"))
        .expect("ex/x interned");
    assert_eq!(var.root(), Some(Value::Int(1)));
}

#[test]
fn the_last_form_value_is_returned() {
    assert_eq!(eval_ok("(def x 2) (clatter.rt/+ x 3)"), Value::Int(5));
}

#[test]
fn fns_define_and_apply() {
    assert_eq!(
        eval_ok("(def id (fn* [x] x)) (id 41)"),
        Value::Int(41)
    );
    assert_eq!(
        eval_ok("(def f (fn* ([x] x) ([x y] (clatter.rt/+ x y)))) (f 20 22)"),
        Value::Int(42)
    );
    assert_eq!(
        eval_ok("(def count-rest (fn* [x & more] (clatter.rt/count more))) (count-rest 1 2 3)"),
        Value::Int(2)
    );
}

#[test]
fn anonymous_fns_and_invocation() {
    assert_eq!(eval_ok("((fn* [x] x) 7)"), Value::Int(7));
    assert_eq!(eval_ok("(#(clatter.rt/+ %1 %2) 1 2)"), Value::Int(3));
}

#[test]
fn loop_recur_iterates() {
    assert_eq!(
        eval_ok(
            "(loop* [i 0 acc 0] \
               (if (clatter.rt/< i 5) \
                 (recur (clatter.rt/inc i) (clatter.rt/+ acc i)) \
                 acc))"
        ),
        Value::Int(10)
    );
}

#[test]
fn fn_method_bodies_are_recur_targets() {
    assert_eq!(
        eval_ok(
            "(def down (fn* [n] (if (clatter.rt/= n 0) :done (recur (clatter.rt/dec n))))) \
             (down 4)"
        ),
        Value::keyword("done")
    );
}

#[test]
fn throw_and_catch_round_trip() {
    assert_eq!(
        eval_ok("(try (throw 42) (catch :default e e))"),
        Value::Int(42)
    );
    assert_eq!(
        eval_ok("(try 1 (finally 2))"),
        Value::Int(1)
    );
}

#[test]
fn uncaught_throws_surface_as_thrown_errors() {
    let err = eval("(throw :boom)").unwrap_err();
    assert!(matches!(err, ClatterError::Thrown { .. }), "{}", err);
}

#[test]
fn macros_expand_before_analysis() {
    // the macro discards its (unresolvable) argument entirely
    assert_eq!(
        eval_ok("(def ^:macro always (fn* [x] 42)) (always some-unknown-symbol)"),
        Value::Int(42)
    );
    // and a macro can build forms with the rt library
    assert_eq!(
        eval_ok(
            "(def ^:macro do-twice (fn* [x] (clatter.rt/list 'do x x))) \
             (def counter 0) \
             (do-twice (set! counter (clatter.rt/inc counter))) \
             counter"
        ),
        Value::Int(2)
    );
}

#[test]
fn syntax_quoted_macros_expand() {
    assert_eq!(
        eval_ok(
            "(def ^:macro unless (fn* [test then] `(if ~test nil ~then))) \
             (unless false 7)"
        ),
        Value::Int(7)
    );
}

#[test]
fn set_bang_updates_vars() {
    assert_eq!(
        eval_ok("(def ^:dynamic *level* 1) (set! *level* 5) *level*"),
        Value::Int(5)
    );
}

#[test]
fn protocol_dispatch_reaches_a_deftype_method() {
    let driver = Driver::new(quiet_options());
    let result = driver
        .compile_source(
            "(ns ex) \
             (defprotocol P (m [x])) \
             (deftype* T [] P (m [_] 42)) \
             (m (T.))",
        )
        .unwrap();
    assert_eq!(result.value, Value::Int(42));
    // the protocol module was produced and carries the dispatch
    assert!(result.artifacts.iter().any(|a| a.name == "ex.P"));
    assert!(result.artifacts.iter().any(|a| a.name == "ex.T"));
}

#[test]
fn deftype_fields_are_visible_to_methods() {
    assert_eq!(
        eval_ok(
            "(defprotocol Area (area [shape])) \
             (deftype* Rect [w h] Area (area [_] (clatter.rt/* w h))) \
             (area (Rect. 3 4))"
        ),
        Value::Int(12)
    );
}

#[test]
fn extend_type_reaches_host_primitives() {
    assert_eq!(
        eval_ok(
            "(defprotocol Show (show [x])) \
             (extend-type integer Show (show [x] (clatter.rt/str \"int:\" x))) \
             (show 7)"
        ),
        Value::string("int:7")
    );
}

#[test]
fn unextended_values_raise_not_implemented() {
    let err = eval(
        "(defprotocol Show2 (show2 [x])) \
         (extend-type integer Show2 (show2 [x] x)) \
         (show2 \"nope\")",
    )
    .unwrap_err();
    assert!(matches!(err, ClatterError::NotImplemented { .. }), "{}", err);
}

#[test]
fn satisfies_and_extenders_shells_answer() {
    assert_eq!(
        eval_ok(
            "(defprotocol Q (q [x])) \
             (extend-type integer Q (q [x] x)) \
             (clatter.rt/satisfies? \"user.Q\" 5)"
        ),
        Value::Bool(true)
    );
    assert_eq!(
        eval_ok(
            "(defprotocol R (r [x])) \
             (clatter.rt/satisfies? \"user.R\" 5)"
        ),
        Value::Bool(false)
    );
}

#[test]
fn later_forms_see_earlier_namespace_effects() {
    let driver = Driver::new(quiet_options());
    driver.compile_source("(ns one) (def shared 10)").unwrap();
    let result = driver
        .compile_source("(ns two (:require [one :as o])) o/shared")
        .unwrap();
    assert_eq!(result.value, Value::Int(10));
}

#[test]
fn interned_vars_never_shrink_during_a_batch() {
    let driver = Driver::new(quiet_options());
    let registry = driver.registry();
    let mut last = registry.read().unwrap().interned_count();
    for source in ["(def a 1)", "(def b 2)", "(def a 3)", "(def c 4)"] {
        driver.compile_source(source).unwrap();
        let count = registry.read().unwrap().interned_count();
        assert!(count >= last, "{} shrank the registry", source);
        last = count;
    }
}

#[test]
fn top_level_do_is_flattened_in_order() {
    assert_eq!(
        eval_ok("(do (def x 1) (def y (clatter.rt/+ x 1))) y"),
        Value::Int(2)
    );
}

#[test]
fn case_star_matches_patterns() {
    assert_eq!(
        eval_ok("(case* 2 1 :one 2 :two :other)"),
        Value::keyword("two")
    );
    assert_eq!(
        eval_ok("(case* 9 1 :one :other)"),
        Value::keyword("other")
    );
    assert_eq!(
        eval_ok("(case* [1 2] [a b] (clatter.rt/+ a b) :other)"),
        Value::Int(3)
    );
}

#[test]
fn dynamic_bindings_snapshot_into_compile_children() {
    // the driver's serial loop keeps the same logical bindings visible to
    // every child; a plain root read suffices to prove inheritance
    assert_eq!(
        eval_ok("(def ^:dynamic *mode* :on) *mode*"),
        Value::keyword("on")
    );
}

#[test]
fn compile_files_writes_bytecode_and_dump() {
    let dir = tempfile::tempdir().unwrap();
    let opts = CompileOptions {
        compile_files: true,
        compile_path: Some(dir.path().to_path_buf()),
        output: clatter_core::options::OutputKind::Core,
        ..quiet_options()
    };
    let driver = Driver::new(opts);
    let result = driver.compile_source("(ns out.mod) (def x 1)").unwrap();
    let artifact = result
        .artifacts
        .iter()
        .find(|a| a.name == "out.mod")
        .expect("artifact for out.mod");
    let path = artifact.path.as_ref().expect("written to disk");
    assert!(path.exists());
    assert!(dir.path().join("out.mod.core").exists());
}

#[test]
fn compile_files_without_a_path_is_an_error() {
    let opts = CompileOptions {
        compile_files: true,
        ..quiet_options()
    };
    let driver = Driver::new(opts);
    let err = driver.compile_source("(def x 1)").unwrap_err();
    assert!(matches!(err, ClatterError::CompilePathUnset(_)), "{}", err);
}

#[test]
fn reader_conditionals_flow_through_compilation() {
    let opts = CompileOptions {
        read_cond: Some(clatter_core::reader::ReadCond::Allow),
        ..quiet_options()
    };
    let opts = opts.with_feature("clj");
    let driver = Driver::new(opts);
    let result = driver.compile_source("#?(:clj 1 :cljs 2)").unwrap();
    assert_eq!(result.value, Value::Int(1));
}
