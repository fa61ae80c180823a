use std::cell::RefCell;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;

use crate::analyzer::{Analyzer, AnalyzerOptions};
use crate::ast::{Form, Symbol};
use crate::emitter::Emitter;
use crate::env::Env;
use crate::error::{format_warning, ClatterError, ErrorData};
use crate::host::{AssembleOptions, HostVm, InMemoryHost};
use crate::module::ModuleContext;
use crate::namespaces::{new_registry_ref, RegistryRef};
use crate::options::{CompileOptions, OutputKind};
use crate::protocols::{new_protocols_ref, ProtocolsRef};
use crate::reader::{Reader, ReaderOptions, SyntaxResolver};
use crate::value::Value;
use crate::vars;

thread_local! {
    static CURRENT_FILE: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn set_current_file(file: Option<String>) {
    CURRENT_FILE.with(|cell| *cell.borrow_mut() = file);
}

pub fn current_file() -> Option<String> {
    CURRENT_FILE.with(|cell| cell.borrow().clone())
}

/// One produced module: its bytecode, the optional textual dump, and where
/// it was written when `*compile-files*` was set.
#[derive(Clone, Debug)]
pub struct ModuleArtifact {
    pub name: String,
    pub bytecode: Vec<u8>,
    pub dump: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct CompileResult {
    /// Value of the last evaluated form.
    pub value: Value,
    pub artifacts: Vec<ModuleArtifact>,
}

/// The top-level loop: read one form, hand it to a fresh compile child,
/// await the result, move on. Namespace mutations stay ordered because the
/// loop is serial; a crashing child cannot corrupt the driver's state.
pub struct Driver {
    registry: RegistryRef,
    protocols: ProtocolsRef,
    host: Arc<dyn HostVm>,
    pub opts: CompileOptions,
}

impl Driver {
    /// A driver backed by the in-memory reference host.
    pub fn new(opts: CompileOptions) -> Self {
        let registry = new_registry_ref();
        let host = Arc::new(InMemoryHost::new(registry.clone()));
        Driver {
            registry,
            protocols: new_protocols_ref(),
            host,
            opts,
        }
    }

    pub fn with_host(opts: CompileOptions, registry: RegistryRef, host: Arc<dyn HostVm>) -> Self {
        Driver {
            registry,
            protocols: new_protocols_ref(),
            host,
            opts,
        }
    }

    pub fn registry(&self) -> RegistryRef {
        self.registry.clone()
    }

    pub fn host(&self) -> Arc<dyn HostVm> {
        self.host.clone()
    }

    pub fn compile_file(&self, path: &Path) -> Result<CompileResult, ClatterError> {
        let source = fs::read_to_string(path)
            .map_err(|e| ClatterError::io(format!("{}: {}", path.display(), e)))?;
        let mut opts = self.opts.clone();
        opts.source_name = Some(path.display().to_string());
        self.compile_source_with(&source, opts)
    }

    pub fn compile_source(&self, source: &str) -> Result<CompileResult, ClatterError> {
        self.compile_source_with(source, self.opts.clone())
    }

    fn compile_source_with(
        &self,
        source: &str,
        opts: CompileOptions,
    ) -> Result<CompileResult, ClatterError> {
        set_current_file(opts.source_name.clone());
        let reader_opts = self.reader_options(&opts);
        let mut reader = Reader::with_options(source, reader_opts);
        let mut result = CompileResult {
            value: Value::Nil,
            artifacts: Vec::new(),
        };
        while let Some(form) = reader
            .read_one()
            .map_err(|e| e.with_file(opts.source_name.clone()))?
        {
            // top-level do forms flatten so module side effects stay ordered
            for form in flatten_top_level(form) {
                let (value, artifacts) = self.compile_form(&form, &opts)?;
                result.value = value;
                result.artifacts.extend(artifacts);
            }
        }
        Ok(result)
    }

    fn reader_options(&self, opts: &CompileOptions) -> ReaderOptions {
        let mut reader_opts = ReaderOptions::default()
            .with_read_cond(opts.effective_read_cond())
            .with_resolver(Arc::new(RegistryResolver {
                registry: self.registry.clone(),
            }));
        reader_opts.file = opts.source_name.clone();
        reader_opts.features = opts.features.clone();
        reader_opts.missing_feature_nil = opts.missing_feature_nil;
        reader_opts.allow_read_eval = opts.allow_read_eval;
        if opts.allow_read_eval {
            let registry = self.registry.clone();
            let protocols = self.protocols.clone();
            let host = self.host.clone();
            let opts = opts.clone();
            reader_opts.read_eval = Some(Arc::new(move |form: &Form| {
                let value = compile_form_value(&registry, &protocols, &host, &opts, form)?;
                value.to_form(form.span)
            }));
        }
        reader_opts
    }

    /// Compiles one top-level form in a freshly spawned child task and
    /// awaits it. The child inherits the dynamic bindings snapshot and the
    /// current file; a panic comes back as an error, not a poisoned driver.
    fn compile_form(
        &self,
        form: &Form,
        opts: &CompileOptions,
    ) -> Result<(Value, Vec<ModuleArtifact>), ClatterError> {
        let (tx, rx) = bounded(1);
        let registry = self.registry.clone();
        let protocols = self.protocols.clone();
        let host = self.host.clone();
        let opts = opts.clone();
        let form = form.clone();
        let snapshot = vars::snapshot_bindings();
        let file = current_file();

        let handle = thread::spawn(move || {
            vars::install_snapshot(snapshot);
            set_current_file(file);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                compile_form_in_task(&registry, &protocols, &host, &opts, &form)
            }));
            let outcome = match outcome {
                Ok(result) => result,
                Err(payload) => Err(ClatterError::bad_form(format!(
                    "compile task panicked: {}",
                    panic_payload_message(payload)
                ))),
            };
            let _ = tx.send(outcome);
        });

        let outcome = rx
            .recv()
            .map_err(|_| ClatterError::io("compile task terminated without a result"));
        let _ = handle.join();
        let (value, artifacts, warnings) = outcome??;
        for warning in warnings {
            eprintln!("{}", warning);
        }
        Ok((value, artifacts))
    }
}

/// Runs the analyze → emit → assemble → load → eval pipeline for one form.
/// Returns the form's value, the module artifacts it produced, and any
/// analyzer warnings.
fn compile_form_in_task(
    registry: &RegistryRef,
    protocols: &ProtocolsRef,
    host: &Arc<dyn HostVm>,
    opts: &CompileOptions,
    form: &Form,
) -> Result<(Value, Vec<ModuleArtifact>, Vec<String>), ClatterError> {
    let mut analyzer = Analyzer::new(
        registry.clone(),
        protocols.clone(),
        host.clone(),
        AnalyzerOptions {
            file: opts.source_name.clone(),
            no_warn_symbol_as_host_fun: opts.no_warn_symbol_as_host_fun,
            no_warn_dynamic_var_name: opts.no_warn_dynamic_var_name,
        },
    );
    let node = analyzer.analyze(form, &Env::new())?;
    let warnings = analyzer.take_warnings();

    let mut ctx = ModuleContext::new();
    let mut emitter = Emitter::new(registry.clone(), protocols.clone(), host.clone(), &mut ctx);
    let exprs = emitter.emit(&node)?;

    let assemble_opts = AssembleOptions {
        source: opts.source_name.clone(),
        extra: opts.assembler_options.clone(),
        ..AssembleOptions::default()
    };
    let mut artifacts = Vec::new();
    let mut extra_warnings = Vec::new();
    for module in ctx.flush() {
        let bytecode = host.assemble(&module, &assemble_opts)?;
        let dump = match opts.output {
            OutputKind::Beam => None,
            OutputKind::Core | OutputKind::Asm => Some(module.to_string()),
        };
        let is_protocol = module
            .attrs
            .iter()
            .any(|(k, v)| k == "protocol" && *v == crate::ir::Literal::Bool(true));
        let path = if opts.compile_files {
            Some(write_artifact(
                opts,
                &module.name,
                is_protocol,
                &bytecode,
                dump.as_deref(),
                &mut extra_warnings,
            )?)
        } else {
            None
        };
        host.load(&module.name, &bytecode)?;
        artifacts.push(ModuleArtifact {
            name: module.name.clone(),
            bytecode,
            dump,
            path,
        });
    }

    let value = host.eval(&exprs)?;
    let mut warnings = warnings;
    warnings.extend(extra_warnings);
    Ok((value, artifacts, warnings))
}

/// Pipeline entry for read-time eval: same stages, no artifact handling.
fn compile_form_value(
    registry: &RegistryRef,
    protocols: &ProtocolsRef,
    host: &Arc<dyn HostVm>,
    opts: &CompileOptions,
    form: &Form,
) -> Result<Value, ClatterError> {
    let (value, _, _) = compile_form_in_task(registry, protocols, host, opts, form)?;
    Ok(value)
}

fn write_artifact(
    opts: &CompileOptions,
    module: &str,
    is_protocol: bool,
    bytecode: &[u8],
    dump: Option<&str>,
    warnings: &mut Vec<String>,
) -> Result<PathBuf, ClatterError> {
    let dir = if is_protocol {
        match (&opts.compile_protocols_path, &opts.compile_path) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => {
                warnings.push(format_warning(
                    opts.source_name.as_deref(),
                    None,
                    "compile-protocols-path is unset; writing protocol module to compile-path",
                ));
                dir.clone()
            }
            (None, None) => {
                return Err(ClatterError::CompilePathUnset(ErrorData::new(
                    "set a compile path before compiling protocol modules to disk",
                )))
            }
        }
    } else {
        opts.compile_path.clone().ok_or_else(|| {
            ClatterError::CompilePathUnset(ErrorData::new(
                "set a compile path before compiling to disk",
            ))
        })?
    };
    fs::create_dir_all(&dir)
        .map_err(|e| ClatterError::io(format!("{}: {}", dir.display(), e)))?;
    let path = dir.join(format!("{}.beam", module));
    fs::write(&path, bytecode)
        .map_err(|e| ClatterError::io(format!("{}: {}", path.display(), e)))?;
    if let Some(dump) = dump {
        let ext = match opts.output {
            OutputKind::Asm => "S",
            _ => "core",
        };
        let dump_path = dir.join(format!("{}.{}", module, ext));
        fs::write(&dump_path, dump)
            .map_err(|e| ClatterError::io(format!("{}: {}", dump_path.display(), e)))?;
    }
    Ok(path)
}

fn flatten_top_level(form: Form) -> Vec<Form> {
    if form.is_call_to("do") {
        if let crate::ast::FormKind::List(items) = form.kind {
            return items
                .into_iter()
                .skip(1)
                .flat_map(flatten_top_level)
                .collect();
        }
        unreachable!("is_call_to implies a list");
    }
    vec![form]
}

fn panic_payload_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic occurred".to_string()
    }
}

/// Syntax-quote and `::alias/kw` resolution against the live registry.
struct RegistryResolver {
    registry: RegistryRef,
}

impl SyntaxResolver for RegistryResolver {
    fn current_ns(&self) -> String {
        self.registry.read().unwrap().current_ns().to_string()
    }

    fn resolve_alias(&self, alias: &str) -> Option<String> {
        let registry = self.registry.read().unwrap();
        registry
            .get(registry.current_ns())
            .and_then(|ns| ns.aliases.get(alias).cloned())
    }

    fn qualify(&self, sym: &Symbol) -> Symbol {
        let registry = self.registry.read().unwrap();
        let current = registry.current_ns().to_string();
        match &sym.ns {
            Some(alias) => {
                let target = registry
                    .get(&current)
                    .and_then(|ns| ns.aliases.get(alias).cloned())
                    .unwrap_or_else(|| alias.clone());
                Symbol::qualified(target, sym.name.clone())
            }
            None => match registry.resolve(&current, sym) {
                Some(crate::namespaces::Resolution::Var(var)) => {
                    Symbol::qualified(var.ns().to_string(), var.name().to_string())
                }
                _ => Symbol::qualified(current, sym.name.clone()),
            },
        }
    }
}
