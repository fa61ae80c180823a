use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::ast::Symbol;
use crate::vars::Var;

pub type RegistryRef = Arc<RwLock<NamespaceRegistry>>;

pub fn new_registry_ref() -> RegistryRef {
    Arc::new(RwLock::new(NamespaceRegistry::new()))
}

/// Everything a symbol can resolve to, in resolution order.
#[derive(Clone, Debug)]
pub enum Resolution {
    Var(Var),
    /// An imported host type, by fully qualified name.
    Type(String),
}

/// The process-wide namespace registry. Mutated only by the driver task
/// between top-level forms; the serial compile loop makes it single-writer.
pub struct NamespaceRegistry {
    namespaces: HashMap<String, Namespace>,
    current: String,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        let mut registry = NamespaceRegistry {
            namespaces: HashMap::new(),
            current: "user".to_string(),
        };
        registry.ensure("user");
        registry.ensure(crate::reader::CORE_NS);
        registry
    }

    pub fn current_ns(&self) -> &str {
        &self.current
    }

    pub fn set_current(&mut self, name: &str) {
        self.ensure(name);
        self.current = name.to_string();
    }

    pub fn ensure(&mut self, name: &str) -> &mut Namespace {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Namespace::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Namespace> {
        self.namespaces.get_mut(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }

    /// Interns a var in `ns`. First writer wins: a subsequent intern of the
    /// same name aliases the existing cell.
    pub fn intern(&mut self, ns: &str, name: &str) -> Var {
        self.ensure(ns).intern(name)
    }

    /// Total count of interned vars, for the namespace-monotonicity
    /// invariant.
    pub fn interned_count(&self) -> usize {
        self.namespaces.values().map(|ns| ns.interns.len()).sum()
    }

    /// Resolution order for a symbol in `ns`: locals are checked by the
    /// analyzer before this is consulted.
    pub fn resolve(&self, ns: &str, sym: &Symbol) -> Option<Resolution> {
        match &sym.ns {
            Some(qualifier) => {
                let home = self.get(ns)?;
                let target_ns = home
                    .aliases
                    .get(qualifier)
                    .cloned()
                    .unwrap_or_else(|| qualifier.clone());
                let target = self.get(&target_ns)?;
                target
                    .interns
                    .get(&sym.name)
                    .cloned()
                    .map(Resolution::Var)
            }
            None => {
                let home = self.get(ns)?;
                if let Some(var) = home.interns.get(&sym.name) {
                    return Some(Resolution::Var(var.clone()));
                }
                if let Some(var) = home.mappings.get(&sym.name) {
                    return Some(Resolution::Var(var.clone()));
                }
                if let Some(type_name) = home.imports.get(&sym.name) {
                    return Some(Resolution::Type(type_name.clone()));
                }
                None
            }
        }
    }

    /// Target module name for code compiled in `ns`.
    pub fn module_name(&self, ns: &str) -> String {
        ns.to_string()
    }
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One namespace: a scope mapping unqualified names to vars, aliases,
/// imported types, and referred macros.
pub struct Namespace {
    pub name: String,
    /// alias -> namespace name
    pub aliases: HashMap<String, String>,
    /// referred name -> var from another namespace
    pub mappings: HashMap<String, Var>,
    /// simple type name -> fully qualified host type
    pub imports: HashMap<String, String>,
    /// vars interned here
    pub interns: HashMap<String, Var>,
}

impl Namespace {
    fn new(name: &str) -> Self {
        Namespace {
            name: name.to_string(),
            aliases: HashMap::new(),
            mappings: HashMap::new(),
            imports: HashMap::new(),
            interns: HashMap::new(),
        }
    }

    pub fn intern(&mut self, name: &str) -> Var {
        if let Some(existing) = self.interns.get(name) {
            return existing.clone();
        }
        let var = Var::new(self.name.clone(), name);
        self.interns.insert(name.to_string(), var.clone());
        var
    }

    pub fn add_alias(&mut self, alias: &str, target: &str) {
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    pub fn refer(&mut self, name: &str, var: Var) {
        self.mappings.insert(name.to_string(), var);
    }

    pub fn import(&mut self, simple: &str, qualified: &str) {
        self.imports
            .insert(simple.to_string(), qualified.to_string());
    }

    pub fn referred_macros(&self) -> impl Iterator<Item = (&String, &Var)> {
        self.mappings.iter().filter(|(_, var)| var.is_macro())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_first_writer_wins() {
        let mut registry = NamespaceRegistry::new();
        let a = registry.intern("ex", "x");
        a.set_root(crate::value::Value::Int(1));
        let b = registry.intern("ex", "x");
        assert_eq!(b.root(), Some(crate::value::Value::Int(1)));
    }

    #[test]
    fn aliases_resolve_through_the_home_namespace() {
        let mut registry = NamespaceRegistry::new();
        registry.intern("other.ns", "f");
        registry.ensure("ex").add_alias("o", "other.ns");
        let sym = Symbol::parse("o/f");
        assert!(matches!(
            registry.resolve("ex", &sym),
            Some(Resolution::Var(_))
        ));
    }
}
