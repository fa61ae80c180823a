use std::sync::Arc;

use clatter_core::analyzer::{Analyzer, AnalyzerOptions};
use clatter_core::ast::Form;
use clatter_core::env::Env;
use clatter_core::error::ClatterError;
use clatter_core::hir::Node;
use clatter_core::host::InMemoryHost;
use clatter_core::namespaces::new_registry_ref;
use clatter_core::protocols::new_protocols_ref;
use clatter_core::reader::Reader;
use clatter_core::value::Value;
use clatter_core::{CompileOptions, Driver};

pub fn read_all(source: &str) -> Vec<Form> {
    Reader::new(source)
        .read_all()
        .unwrap_or_else(|e| panic!("failed to read {:?}: {}", source, e))
}

pub fn read_one(source: &str) -> Form {
    Reader::new(source)
        .read_one()
        .unwrap_or_else(|e| panic!("failed to read {:?}: {}", source, e))
        .unwrap_or_else(|| panic!("no form in {:?}", source))
}

/// An analyzer over fresh registries, enough for single-form analysis tests.
pub fn analyzer() -> Analyzer {
    let registry = new_registry_ref();
    let host = Arc::new(InMemoryHost::new(registry.clone()));
    Analyzer::new(
        registry,
        new_protocols_ref(),
        host,
        AnalyzerOptions {
            no_warn_symbol_as_host_fun: true,
            ..AnalyzerOptions::default()
        },
    )
}

pub fn analyze_one(source: &str) -> Result<Node, ClatterError> {
    let form = read_one(source);
    analyzer().analyze(&form, &Env::new())
}

pub fn quiet_options() -> CompileOptions {
    CompileOptions {
        no_warn_symbol_as_host_fun: true,
        no_warn_dynamic_var_name: true,
        ..CompileOptions::default()
    }
}

pub fn eval(source: &str) -> Result<Value, ClatterError> {
    Driver::new(quiet_options())
        .compile_source(source)
        .map(|result| result.value)
}

pub fn eval_ok(source: &str) -> Value {
    eval(source).unwrap_or_else(|e| panic!("failed to eval {:?}: {}", source, e))
}
