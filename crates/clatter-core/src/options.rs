use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use crate::reader::ReadCond;

pub const COMPILER_OPTIONS_ENV: &str = "CLATTER_COMPILER_OPTIONS";

/// What lands next to the bytecode when compiling to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// Bytecode only.
    Beam,
    /// Bytecode plus the textual Core IR dump.
    Core,
    /// Bytecode plus the assembler listing.
    Asm,
}

#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub source_name: Option<String>,
    /// Feature keys for reader conditionals, without the leading `:`.
    pub features: HashSet<String>,
    /// Overrides the extension-derived conditional mode when set.
    pub read_cond: Option<ReadCond>,
    pub missing_feature_nil: bool,
    /// `*compile-files*`: write bytecode to disk instead of stashing it in
    /// memory.
    pub compile_files: bool,
    pub compile_path: Option<PathBuf>,
    pub compile_protocols_path: Option<PathBuf>,
    pub output: OutputKind,
    pub assembler_options: Vec<String>,
    pub no_warn_symbol_as_host_fun: bool,
    pub no_warn_dynamic_var_name: bool,
    pub allow_read_eval: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            source_name: None,
            features: HashSet::new(),
            read_cond: None,
            missing_feature_nil: false,
            compile_files: false,
            compile_path: None,
            compile_protocols_path: None,
            output: OutputKind::Beam,
            assembler_options: compiler_options_from_env(),
            no_warn_symbol_as_host_fun: false,
            no_warn_dynamic_var_name: false,
            allow_read_eval: false,
        }
    }
}

impl CompileOptions {
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    /// Conditional mode for this compile: an explicit setting wins, then the
    /// source extension decides. `.cljc` (and a host-reserved `.clje`) allow
    /// conditionals; `.cljs` does only when the caller injected features.
    pub fn effective_read_cond(&self) -> ReadCond {
        if let Some(mode) = self.read_cond {
            return mode;
        }
        let ext = self
            .source_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .unwrap_or("");
        match ext {
            "cljc" | "clje" => ReadCond::Allow,
            "cljs" if !self.features.is_empty() => ReadCond::Allow,
            _ => ReadCond::Disallow,
        }
    }
}

/// Extra assembler options from the environment, whitespace-separated.
pub fn compiler_options_from_env() -> Vec<String> {
    match env::var(COMPILER_OPTIONS_ENV) {
        Ok(value) => value
            .split_whitespace()
            .map(|s| s.to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_picks_the_conditional_mode() {
        let mut opts = CompileOptions {
            source_name: Some("lib/thing.cljc".into()),
            ..CompileOptions::default()
        };
        assert_eq!(opts.effective_read_cond(), ReadCond::Allow);
        opts.source_name = Some("lib/thing.clj".into());
        assert_eq!(opts.effective_read_cond(), ReadCond::Disallow);
        opts.source_name = Some("lib/thing.cljs".into());
        assert_eq!(opts.effective_read_cond(), ReadCond::Disallow);
        opts.features.insert("cljs".into());
        assert_eq!(opts.effective_read_cond(), ReadCond::Allow);
    }
}
