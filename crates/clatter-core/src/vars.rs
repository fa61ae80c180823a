use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::value::Value;

/// A named mutable cell owned by its home namespace and shared by reference
/// everywhere it is referred. Lives for the whole process once interned.
#[derive(Clone)]
pub struct Var {
    inner: Arc<VarInner>,
}

struct VarInner {
    ns: String,
    name: String,
    root: RwLock<Option<Value>>,
    meta: RwLock<im::HashMap<Value, Value>>,
    is_macro: AtomicBool,
    is_dynamic: AtomicBool,
    is_private: AtomicBool,
}

impl Var {
    pub fn new(ns: impl Into<String>, name: impl Into<String>) -> Self {
        Var {
            inner: Arc::new(VarInner {
                ns: ns.into(),
                name: name.into(),
                root: RwLock::new(None),
                meta: RwLock::new(im::HashMap::new()),
                is_macro: AtomicBool::new(false),
                is_dynamic: AtomicBool::new(false),
                is_private: AtomicBool::new(false),
            }),
        }
    }

    pub fn ns(&self) -> &str {
        &self.inner.ns
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.inner.ns, self.inner.name)
    }

    pub fn root(&self) -> Option<Value> {
        self.inner.root.read().expect("var lock poisoned").clone()
    }

    /// Root assignment is last-writer-wins.
    pub fn set_root(&self, value: Value) {
        *self.inner.root.write().expect("var lock poisoned") = Some(value);
    }

    pub fn is_bound(&self) -> bool {
        self.inner.root.read().expect("var lock poisoned").is_some()
    }

    pub fn is_macro(&self) -> bool {
        self.inner.is_macro.load(Ordering::Acquire)
    }

    pub fn set_macro(&self, flag: bool) {
        self.inner.is_macro.store(flag, Ordering::Release);
    }

    pub fn is_dynamic(&self) -> bool {
        self.inner.is_dynamic.load(Ordering::Acquire)
    }

    pub fn set_dynamic(&self, flag: bool) {
        self.inner.is_dynamic.store(flag, Ordering::Release);
    }

    pub fn is_private(&self) -> bool {
        self.inner.is_private.load(Ordering::Acquire)
    }

    pub fn set_private(&self, flag: bool) {
        self.inner.is_private.store(flag, Ordering::Release);
    }

    pub fn meta(&self) -> im::HashMap<Value, Value> {
        self.inner.meta.read().expect("var lock poisoned").clone()
    }

    pub fn set_meta(&self, meta: im::HashMap<Value, Value>) {
        *self.inner.meta.write().expect("var lock poisoned") = meta;
    }

    /// The task-local dynamic binding when one is pushed, otherwise the root.
    pub fn deref(&self) -> Option<Value> {
        if self.is_dynamic() {
            let key = self.qualified_name();
            let bound = DYNAMIC_STACK.with(|cell| {
                cell.borrow()
                    .get(&key)
                    .and_then(|stack| stack.last())
                    .cloned()
            });
            if bound.is_some() {
                return bound;
            }
        }
        self.root()
    }

    /// Rebinds a dynamic var for the current task. The guard pops on drop.
    pub fn push_binding(&self, value: Value) -> DynamicGuard {
        push_bindings(&[(self.clone(), value)])
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#'{}/{}", self.inner.ns, self.inner.name)
    }
}

thread_local! {
    static DYNAMIC_STACK: RefCell<HashMap<String, Vec<Value>>> = RefCell::new(HashMap::new());
}

pub fn push_bindings(bindings: &[(Var, Value)]) -> DynamicGuard {
    DYNAMIC_STACK.with(|cell| {
        let mut map = cell.borrow_mut();
        for (var, value) in bindings {
            map.entry(var.qualified_name())
                .or_default()
                .push(value.clone());
        }
    });
    DynamicGuard {
        names: bindings
            .iter()
            .map(|(var, _)| var.qualified_name())
            .collect(),
    }
}

/// The visible top of every dynamic stack, for snapshot inheritance when a
/// compile child task spawns.
pub fn snapshot_bindings() -> Vec<(String, Value)> {
    DYNAMIC_STACK.with(|cell| {
        cell.borrow()
            .iter()
            .filter_map(|(name, stack)| stack.last().map(|v| (name.clone(), v.clone())))
            .collect()
    })
}

/// Replaces the top of the var's dynamic stack for the current task.
/// Answers false when no binding is in effect, in which case `set!` falls
/// back to the root.
pub fn set_in_current(var: &Var, value: Value) -> bool {
    DYNAMIC_STACK.with(|cell| {
        let mut map = cell.borrow_mut();
        match map.get_mut(&var.qualified_name()).and_then(|s| s.last_mut()) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    })
}

/// Installs an inherited snapshot in a fresh task. Pushes are local from here
/// on; the parent's stacks are untouched.
pub fn install_snapshot(snapshot: Vec<(String, Value)>) {
    DYNAMIC_STACK.with(|cell| {
        let mut map = cell.borrow_mut();
        for (name, value) in snapshot {
            map.entry(name).or_default().push(value);
        }
    });
}

pub struct DynamicGuard {
    names: Vec<String>,
}

impl Drop for DynamicGuard {
    fn drop(&mut self) {
        DYNAMIC_STACK.with(|cell| {
            let mut map = cell.borrow_mut();
            for name in &self.names {
                if let Some(stack) = map.get_mut(name) {
                    stack.pop();
                    if stack.is_empty() {
                        map.remove(name);
                    }
                }
            }
        });
    }
}
