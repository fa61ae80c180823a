pub mod analyzer;
pub mod ast;
pub mod driver;
pub mod emitter;
pub mod env;
pub mod error;
pub mod hir;
pub mod host;
pub mod ir;
pub mod module;
pub mod namespaces;
pub mod options;
pub mod protocols;
pub mod reader;
pub mod reader_tags;
pub mod value;
pub mod vars;

use std::path::Path;

use error::ClatterError;
pub use driver::{CompileResult, Driver, ModuleArtifact};
pub use options::CompileOptions;
pub use value::Value;

/// Compiles and evaluates a whole source string against a fresh driver,
/// answering the value of the last form.
pub fn eval_source(src: &str, options: Option<CompileOptions>) -> Result<Value, ClatterError> {
    let driver = Driver::new(options.unwrap_or_default());
    driver.compile_source(src).map(|result| result.value)
}

pub fn eval_file(path: &Path, options: Option<CompileOptions>) -> Result<Value, ClatterError> {
    let driver = Driver::new(options.unwrap_or_default());
    driver.compile_file(path).map(|result| result.value)
}

/// Full compile of a source string: last value plus every module artifact.
pub fn compile_source(
    src: &str,
    options: Option<CompileOptions>,
) -> Result<CompileResult, ClatterError> {
    let driver = Driver::new(options.unwrap_or_default());
    driver.compile_source(src)
}
