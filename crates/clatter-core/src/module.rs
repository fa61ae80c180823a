use std::collections::HashMap;

use crate::ir::{Expr, FunDef, FunName, Literal, Module};
use crate::reader::RT_NS;

/// Accumulates in-progress modules for one top-level compile. Created by the
/// driver, threaded through the emitter, flushed to immutable module trees
/// in insertion order, then dropped.
#[derive(Default)]
pub struct ModuleContext {
    order: Vec<String>,
    builders: HashMap<String, ModuleBuilder>,
}

impl ModuleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&mut self, name: &str) -> &mut ModuleBuilder {
        if !self.builders.contains_key(name) {
            self.order.push(name.to_string());
            self.builders
                .insert(name.to_string(), ModuleBuilder::new(name));
        }
        self.builders.get_mut(name).expect("builder just inserted")
    }

    pub fn get(&self, name: &str) -> Option<&ModuleBuilder> {
        self.builders.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Finalizes every accumulated module, in first-touch order.
    pub fn flush(self) -> Vec<Module> {
        let mut modules = Vec::with_capacity(self.order.len());
        let mut builders = self.builders;
        for name in self.order {
            if let Some(builder) = builders.remove(&name) {
                modules.push(builder.build());
            }
        }
        modules
    }
}

pub struct ModuleBuilder {
    name: String,
    is_protocol: bool,
    attrs: Vec<(String, Literal)>,
    exports: Vec<FunName>,
    funs: Vec<FunDef>,
    on_load: Vec<Expr>,
    const_count: usize,
}

impl ModuleBuilder {
    fn new(name: &str) -> Self {
        ModuleBuilder {
            name: name.to_string(),
            is_protocol: false,
            attrs: Vec::new(),
            exports: Vec::new(),
            funs: Vec::new(),
            on_load: Vec::new(),
            const_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mark_protocol(&mut self) {
        self.is_protocol = true;
    }

    pub fn is_protocol(&self) -> bool {
        self.is_protocol
    }

    /// Reopens a previously loaded module so later forms append to it. The
    /// on-load body is not carried over (it already ran); the constant count
    /// resumes from the recorded attribute.
    pub fn seed(&mut self, module: &Module) {
        self.attrs = module.attrs.clone();
        self.exports = module.exports.clone();
        self.funs = module.funs.clone();
        self.is_protocol = module
            .attrs
            .iter()
            .any(|(k, v)| k == "protocol" && *v == Literal::Bool(true));
        self.const_count = module
            .attrs
            .iter()
            .find_map(|(k, v)| match (k.as_str(), v) {
                ("consts", Literal::Int(n)) => Some(*n as usize),
                _ => None,
            })
            .unwrap_or(0);
    }

    pub fn set_attr(&mut self, key: &str, value: Literal) {
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.attrs.push((key.to_string(), value));
        }
    }

    /// Adds or replaces a function. Same name and arity replaces, which is
    /// how protocol modules are re-emitted when an extension lands.
    pub fn add_fun(&mut self, fun: FunDef, export: bool) {
        let name = FunName {
            name: fun.name.clone(),
            arity: fun.arity(),
        };
        if export && !self.exports.contains(&name) {
            self.exports.push(name);
        }
        if let Some(slot) = self
            .funs
            .iter_mut()
            .find(|f| f.name == fun.name && f.arity() == fun.arity())
        {
            *slot = fun;
        } else {
            self.funs.push(fun);
        }
    }

    pub fn append_on_load(&mut self, expr: Expr) {
        self.on_load.push(expr);
    }

    /// Lifts a non-literal constant: the construction runs once at load time
    /// and the returned slot index reads it back.
    pub fn add_constant(&mut self, init: Expr) -> usize {
        let index = self.const_count;
        self.const_count += 1;
        self.on_load.push(Expr::Call {
            module: RT_NS.to_string(),
            function: "const-put".to_string(),
            args: vec![
                Expr::Literal(Literal::String(self.name.clone())),
                Expr::Literal(Literal::Int(index as i64)),
                init,
            ],
        });
        index
    }

    /// The read side of `add_constant`.
    pub fn const_ref(&self, index: usize) -> Expr {
        Expr::Call {
            module: RT_NS.to_string(),
            function: "const-get".to_string(),
            args: vec![
                Expr::Literal(Literal::String(self.name.clone())),
                Expr::Literal(Literal::Int(index as i64)),
            ],
        }
    }

    pub fn build(mut self) -> Module {
        if self.const_count > 0 {
            self.set_attr("consts", Literal::Int(self.const_count as i64));
        }
        Module {
            name: self.name,
            attrs: self.attrs,
            exports: self.exports,
            funs: self.funs,
            on_load: self.on_load,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_and_arity_replaces() {
        let mut ctx = ModuleContext::new();
        let builder = ctx.ensure("ex");
        builder.add_fun(
            FunDef {
                name: "f".into(),
                params: vec!["x".into()],
                variadic: false,
                body: Expr::Literal(Literal::Int(1)),
            },
            true,
        );
        builder.add_fun(
            FunDef {
                name: "f".into(),
                params: vec!["x".into()],
                variadic: false,
                body: Expr::Literal(Literal::Int(2)),
            },
            true,
        );
        let modules = ctx.flush();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].funs.len(), 1);
        assert_eq!(modules[0].exports.len(), 1);
        assert_eq!(
            modules[0].funs[0].body,
            Expr::Literal(Literal::Int(2))
        );
    }

    #[test]
    fn flush_keeps_first_touch_order() {
        let mut ctx = ModuleContext::new();
        ctx.ensure("b.mod");
        ctx.ensure("a.mod");
        ctx.ensure("b.mod");
        let names: Vec<String> = ctx.flush().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["b.mod".to_string(), "a.mod".to_string()]);
    }
}
