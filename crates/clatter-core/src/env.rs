use im::{HashMap, Vector};

use crate::ast::Symbol;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Arg,
    Let,
    Loop,
    Catch,
}

/// One resolved local. The id is unique within a compilation session and
/// keeps shadowed bindings apart in the emitted IR.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalBinding {
    pub id: usize,
    pub name: Symbol,
    pub kind: BindingKind,
    pub is_variadic: bool,
    pub is_underscore: bool,
    /// Id of the binding this one shadows, if any.
    pub shadows: Option<usize>,
}

impl LocalBinding {
    /// Unique name carried into the Core IR.
    pub fn ir_name(&self) -> String {
        format!("{}__{}", self.name.name, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopTarget {
    pub id: usize,
    pub arity: usize,
}

impl LoopTarget {
    pub fn label(&self) -> String {
        format!("loop__{}", self.id)
    }
}

/// The lexical side of the environment: a persistent frame stack. Pushing a
/// binding copies cheaply; namespace state lives in the registry.
#[derive(Clone, Debug, Default)]
pub struct Env {
    locals: HashMap<String, LocalBinding>,
    loop_targets: Vector<LoopTarget>,
    try_depth: usize,
    tail: bool,
}

impl Env {
    pub fn new() -> Self {
        Env {
            locals: HashMap::new(),
            loop_targets: Vector::new(),
            try_depth: 0,
            tail: true,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&LocalBinding> {
        self.locals.get(name)
    }

    pub fn bind(&self, binding: LocalBinding) -> Env {
        let mut next = self.clone();
        next.locals.insert(binding.name.name.clone(), binding);
        next
    }

    pub fn shadowed_id(&self, name: &str) -> Option<usize> {
        self.locals.get(name).map(|b| b.id)
    }

    pub fn push_loop(&self, target: LoopTarget) -> Env {
        let mut next = self.clone();
        next.loop_targets.push_back(target);
        next
    }

    /// The innermost `recur` target, if any.
    pub fn current_loop(&self) -> Option<LoopTarget> {
        self.loop_targets.last().copied()
    }

    /// A `try` body hides every outer recur target.
    pub fn without_loops(&self) -> Env {
        let mut next = self.clone();
        next.loop_targets = Vector::new();
        next
    }

    pub fn enter_try(&self) -> Env {
        let mut next = self.without_loops();
        next.try_depth += 1;
        next
    }

    pub fn try_depth(&self) -> usize {
        self.try_depth
    }

    pub fn in_tail(&self) -> bool {
        self.tail
    }

    pub fn with_tail(&self, tail: bool) -> Env {
        if self.tail == tail {
            return self.clone();
        }
        let mut next = self.clone();
        next.tail = tail;
        next
    }
}
