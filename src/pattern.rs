//! Input and output patterns of a reaction, and the partial order between
//! them that the static analyzer reasons with.
//!
//! Patterns arrive pre-compiled: the host DSL (or the test author) has
//! already turned source syntax into one of the variants below. The core
//! only ever asks a pattern whether it admits a value, how specific it is,
//! and how it compares to another pattern.
//!
//! Guards and matchers run while the scheduler holds the site lock, so
//! they must be pure: no emitting, no blocking, no touching the site.

use std::fmt;
use std::sync::Arc;

use crate::value::{fmt_payload, MolData};

pub(crate) type ValuePredicate = Arc<dyn Fn(&dyn MolData) -> bool + Send + Sync>;

/// Pattern on one input position of a reaction.
#[derive(Clone)]
pub enum InputPattern {
    /// Admits any value.
    Wildcard,
    /// Binds a variable; the optional guard restricts admitted values.
    SimpleVar {
        name: String,
        guard: Option<ValuePredicate>,
    },
    /// Admits values structurally equal to the constant.
    Const(Arc<dyn MolData>),
    /// An opaque matcher. `irrefutable` promises it admits every value of
    /// the correct type.
    Other {
        matcher: ValuePredicate,
        vars: Vec<String>,
        irrefutable: bool,
    },
}

impl InputPattern {
    pub fn wildcard() -> InputPattern {
        InputPattern::Wildcard
    }

    pub fn var(name: &str) -> InputPattern {
        InputPattern::SimpleVar {
            name: name.to_owned(),
            guard: None,
        }
    }

    /// A variable with a per-molecule conditional: `c(x if x > 0)`.
    pub fn var_if<T: MolData>(
        name: &str,
        guard: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> InputPattern {
        InputPattern::SimpleVar {
            name: name.to_owned(),
            guard: Some(Arc::new(move |v: &dyn MolData| {
                v.downcast_ref::<T>().is_some_and(&guard)
            })),
        }
    }

    pub fn constant<T: MolData>(value: T) -> InputPattern {
        InputPattern::Const(Arc::new(value))
    }

    /// A refutable destructuring pattern: admits exactly the values the
    /// matcher accepts.
    pub fn matching<T: MolData>(
        vars: &[&str],
        matcher: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> InputPattern {
        InputPattern::Other {
            matcher: Arc::new(move |v: &dyn MolData| v.downcast_ref::<T>().is_some_and(&matcher)),
            vars: vars.iter().map(|v| (*v).to_owned()).collect(),
            irrefutable: false,
        }
    }

    /// An irrefutable destructuring pattern such as a tuple binding; admits
    /// every value.
    pub fn destructuring(vars: &[&str]) -> InputPattern {
        InputPattern::Other {
            matcher: Arc::new(|_| true),
            vars: vars.iter().map(|v| (*v).to_owned()).collect(),
            irrefutable: true,
        }
    }

    pub(crate) fn admits(&self, value: &dyn MolData) -> bool {
        match self {
            InputPattern::Wildcard => true,
            InputPattern::SimpleVar { guard, .. } => {
                guard.as_ref().is_none_or(|guard| guard(value))
            }
            InputPattern::Const(constant) => constant.eq_dyn(value),
            InputPattern::Other { matcher, .. } => matcher(value),
        }
    }

    /// Trivial patterns admit every value and bind nothing the matcher has
    /// to enumerate over.
    pub(crate) fn is_trivial(&self) -> bool {
        match self {
            InputPattern::Wildcard => true,
            InputPattern::SimpleVar { guard, .. } => guard.is_none(),
            InputPattern::Const(_) => false,
            InputPattern::Other { irrefutable, .. } => *irrefutable,
        }
    }

    /// Lower is more constraining. Drives `inputs_sorted`.
    pub(crate) fn specificity(&self) -> u8 {
        match self {
            InputPattern::Const(_) => 0,
            InputPattern::Other {
                irrefutable: false, ..
            } => 1,
            InputPattern::SimpleVar { guard: Some(_), .. } => 2,
            _ => 3,
        }
    }

    /// The weaker-than preorder of the analyzer: `self` is weaker than (or
    /// equal to) `other` when every value admitted by `other` is admitted
    /// by `self`, as far as this can be decided without running matchers on
    /// unknown values. Undecidable pairs report `false`.
    pub(crate) fn is_weaker_or_equal(&self, other: &InputPattern) -> bool {
        if self.is_trivial() {
            return true;
        }
        match (self, other) {
            (
                InputPattern::SimpleVar {
                    guard: Some(guard), ..
                },
                InputPattern::Const(c),
            ) => guard(&**c),
            (InputPattern::Const(a), InputPattern::Const(b)) => a.eq_dyn(&**b),
            _ => false,
        }
    }

    /// Whether this input pattern is satisfied by whatever the given output
    /// produces. Used by the livelock checks: a `Const` output has a known
    /// value, any other output is only covered by a trivial input.
    pub(crate) fn covers_output(&self, output: &OutputPattern) -> bool {
        match output {
            OutputPattern::Const(value) => self.admits(&**value),
            OutputPattern::Other => self.is_trivial(),
        }
    }
}

impl fmt::Display for InputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputPattern::Wildcard => f.write_str("_"),
            InputPattern::SimpleVar { name, guard: None } => f.write_str(name),
            InputPattern::SimpleVar {
                name,
                guard: Some(_),
            } => write!(f, "{name} if ?"),
            InputPattern::Const(value) => f.write_str(&fmt_payload(&**value)),
            InputPattern::Other { .. } => f.write_str("?"),
        }
    }
}

/// Pattern on one output position. Only the analyzer looks at these;
/// matching is never affected.
#[derive(Clone)]
pub enum OutputPattern {
    /// The reaction emits this exact value.
    Const(Arc<dyn MolData>),
    /// The emitted value is computed at run time.
    Other,
}

impl OutputPattern {
    pub fn constant<T: MolData>(value: T) -> OutputPattern {
        OutputPattern::Const(Arc::new(value))
    }

    pub fn computed() -> OutputPattern {
        OutputPattern::Other
    }
}

impl fmt::Display for OutputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPattern::Const(value) => f.write_str(&fmt_payload(&**value)),
            OutputPattern::Other => f.write_str("?"),
        }
    }
}

/// A boolean predicate over the values chosen for two or more input
/// positions of one reaction.
#[derive(Clone)]
pub struct CrossGuard {
    pub(crate) indices: Vec<usize>,
    condition: Arc<dyn Fn(&[&dyn MolData]) -> bool + Send + Sync>,
}

impl CrossGuard {
    pub fn new(
        indices: impl Into<Vec<usize>>,
        condition: impl Fn(&[&dyn MolData]) -> bool + Send + Sync + 'static,
    ) -> CrossGuard {
        CrossGuard {
            indices: indices.into(),
            condition: Arc::new(condition),
        }
    }

    pub(crate) fn eval(&self, values: &[&dyn MolData]) -> bool {
        (self.condition)(values)
    }
}

/// How much guard machinery a reaction carries; decides which matcher path
/// runs.
#[derive(Clone)]
pub enum ReactionGuard {
    /// No guard and every input pattern trivial.
    AllTrivial,
    /// No reaction-level guard, but some input pattern is nontrivial.
    Absent,
    Present {
        static_guard: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
        cross_guards: Vec<CrossGuard>,
    },
}
