use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::molecule::{MolId, MoleculeRef};
use crate::pattern::{CrossGuard, InputPattern, OutputPattern, ReactionGuard};
use crate::pool::ReactionPool;
use crate::reply::{ReplySlot, ReplyStatus};
use crate::value::{fmt_payload, MolData, MolValue};

/// One input position of a reaction: which emitter it consumes and under
/// which pattern.
pub(crate) struct InputMol {
    pub(crate) emitter: MoleculeRef,
    pub(crate) pattern: InputPattern,
}

impl fmt::Display for InputMol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.emitter, self.pattern)
    }
}

/// One declared output of a reaction. `guaranteed` outputs are emitted on
/// every successful run; the rest depend on branches inside the body.
pub(crate) struct OutputMol {
    pub(crate) emitter: MoleculeRef,
    pub(crate) pattern: OutputPattern,
    pub(crate) guaranteed: bool,
}

impl fmt::Display for OutputMol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.emitter, self.pattern)
    }
}

/// Static description of a reaction's chemistry, fully precomputed at
/// construction: sorted input order for the matcher, the set of input
/// positions that need combinatorial search, and a digest identifying the
/// declared shape.
pub struct ReactionInfo {
    pub(crate) inputs: Vec<InputMol>,
    pub(crate) outputs: Vec<OutputMol>,
    pub(crate) guard: ReactionGuard,
    pub(crate) digest: String,
    /// Input indices ordered most constraining first.
    pub(crate) inputs_sorted: Vec<usize>,
    /// Input indices that participate in a cross-guard, or share an emitter
    /// with another input when any of the repeated group is nontrivial.
    /// These positions must be enumerated; all others can take the first
    /// admissible value.
    pub(crate) cross_conditionals: BTreeSet<usize>,
}

impl ReactionInfo {
    pub(crate) fn new(
        inputs: Vec<InputMol>,
        outputs: Vec<OutputMol>,
        guard: ReactionGuard,
    ) -> ReactionInfo {
        let mut cross_conditionals = BTreeSet::new();
        if let ReactionGuard::Present { cross_guards, .. } = &guard {
            for cross in cross_guards {
                cross_conditionals.extend(cross.indices.iter().copied());
            }
        }
        let mut by_emitter: HashMap<MolId, Vec<usize>> = HashMap::new();
        for (index, input) in inputs.iter().enumerate() {
            by_emitter.entry(input.emitter.id()).or_default().push(index);
        }
        for group in by_emitter.values() {
            if group.len() > 1 && group.iter().any(|&i| !inputs[i].pattern.is_trivial()) {
                cross_conditionals.extend(group.iter().copied());
            }
        }

        let mut inputs_sorted: Vec<usize> = (0..inputs.len()).collect();
        inputs_sorted.sort_by_key(|&i| (inputs[i].pattern.specificity(), i));

        let mut info = ReactionInfo {
            inputs,
            outputs,
            guard,
            digest: String::new(),
            inputs_sorted,
            cross_conditionals,
        };
        let mut hasher = Sha256::new();
        hasher.update(info.to_string().as_bytes());
        info.digest = hex::encode(hasher.finalize());
        info
    }

    pub(crate) fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Whether matching must run the backtracking search instead of the
    /// greedy fold.
    pub(crate) fn needs_search(&self) -> bool {
        !self.cross_conditionals.is_empty() || !self.cross_guards().is_empty()
    }

    pub(crate) fn cross_guards(&self) -> &[CrossGuard] {
        match &self.guard {
            ReactionGuard::Present { cross_guards, .. } => cross_guards,
            _ => &[],
        }
    }

    pub(crate) fn static_guard_passes(&self) -> bool {
        match &self.guard {
            ReactionGuard::Present {
                static_guard: Some(guard),
                ..
            } => guard(),
            _ => true,
        }
    }

    /// Guardless in the analyzer's sense: no reaction-level guard machinery
    /// (per-molecule conditionals do not count).
    pub(crate) fn is_guardless(&self) -> bool {
        !matches!(self.guard, ReactionGuard::Present { .. })
    }

    pub(crate) fn guaranteed_outputs(&self) -> impl Iterator<Item = &OutputMol> {
        self.outputs.iter().filter(|out| out.guaranteed)
    }

    /// Multiplicity of `mol` among this reaction's inputs.
    pub(crate) fn input_multiplicity(&self, mol: MolId) -> usize {
        self.inputs
            .iter()
            .filter(|input| input.emitter.id() == mol)
            .count()
    }

    pub(crate) fn guaranteed_output_ids(&self) -> impl Iterator<Item = MolId> + '_ {
        self.guaranteed_outputs().map(|out| out.emitter.id())
    }
}

impl fmt::Display for ReactionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        if self.inputs.is_empty() {
            f.write_str("_")?;
        } else {
            for (i, input) in self.inputs.iter().enumerate() {
                if i > 0 {
                    f.write_str(" + ")?;
                }
                write!(f, "{input}")?;
            }
        }
        f.write_str(" => ")?;
        for (i, output) in self.outputs.iter().enumerate() {
            if i > 0 {
                f.write_str(" + ")?;
            }
            write!(f, "{output}")?;
        }
        f.write_str("}")
    }
}

/// Error raised from inside a reaction body. Bodies are infallible from the
/// scheduler's point of view; whatever they raise flows into the error log
/// and, for blocking inputs, into the waiter's reply slot.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct BodyError(pub String);

impl From<String> for BodyError {
    fn from(message: String) -> BodyError {
        BodyError(message)
    }
}

impl From<&str> for BodyError {
    fn from(message: &str) -> BodyError {
        BodyError(message.to_owned())
    }
}

impl From<crate::error::EmitError> for BodyError {
    fn from(err: crate::error::EmitError) -> BodyError {
        BodyError(err.to_string())
    }
}

pub(crate) type Body = dyn Fn(&ReactionInputs) -> Result<(), BodyError> + Send + Sync;

/// A reaction under construction: chemistry plus body. Passed to
/// [`site`](crate::site()) which compiles and freezes it.
///
/// Input positions are numbered in `consumes` call order; cross-guards and
/// the body refer to them by that index.
pub struct Reaction {
    inputs: Vec<InputMol>,
    outputs: Vec<OutputMol>,
    static_guard: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    cross_guards: Vec<CrossGuard>,
    body: Arc<Body>,
    pool: Option<Arc<ReactionPool>>,
    retry: bool,
}

impl Reaction {
    pub fn new(
        body: impl Fn(&ReactionInputs) -> Result<(), BodyError> + Send + Sync + 'static,
    ) -> Reaction {
        Reaction {
            inputs: Vec::new(),
            outputs: Vec::new(),
            static_guard: None,
            cross_guards: Vec::new(),
            body: Arc::new(body),
            pool: None,
            retry: false,
        }
    }

    /// Adds an input position consuming `emitter` under `pattern`.
    pub fn consumes(mut self, emitter: impl Into<MoleculeRef>, pattern: InputPattern) -> Reaction {
        self.inputs.push(InputMol {
            emitter: emitter.into(),
            pattern,
        });
        self
    }

    /// Declares a guaranteed output whose value is computed at run time.
    pub fn emits(mut self, emitter: impl Into<MoleculeRef>) -> Reaction {
        self.outputs.push(OutputMol {
            emitter: emitter.into(),
            pattern: OutputPattern::computed(),
            guaranteed: true,
        });
        self
    }

    /// Declares a guaranteed output with a statically known value.
    pub fn emits_value<T: MolData>(
        mut self,
        emitter: impl Into<MoleculeRef>,
        value: T,
    ) -> Reaction {
        self.outputs.push(OutputMol {
            emitter: emitter.into(),
            pattern: OutputPattern::constant(value),
            guaranteed: true,
        });
        self
    }

    /// Declares an output the body emits only on some branches.
    pub fn may_emit(mut self, emitter: impl Into<MoleculeRef>) -> Reaction {
        self.outputs.push(OutputMol {
            emitter: emitter.into(),
            pattern: OutputPattern::computed(),
            guaranteed: false,
        });
        self
    }

    /// A guard independent of any input values, evaluated before matching.
    pub fn with_static_guard(
        mut self,
        guard: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Reaction {
        self.static_guard = Some(Arc::new(guard));
        self
    }

    /// A guard over the values of several input positions.
    pub fn with_cross_guard(mut self, guard: CrossGuard) -> Reaction {
        self.cross_guards.push(guard);
        self
    }

    /// On body failure, re-emit the consumed inputs instead of discarding
    /// them.
    pub fn with_retry(mut self) -> Reaction {
        self.retry = true;
        self
    }

    /// Run this reaction's body on a dedicated pool instead of the site's
    /// dispatch pool.
    pub fn on_pool(mut self, pool: Arc<ReactionPool>) -> Reaction {
        self.pool = Some(pool);
        self
    }

    pub(crate) fn compile(self) -> Compiled {
        let guard = if self.static_guard.is_some() || !self.cross_guards.is_empty() {
            ReactionGuard::Present {
                static_guard: self.static_guard,
                cross_guards: self.cross_guards,
            }
        } else if self.inputs.iter().all(|input| input.pattern.is_trivial()) {
            ReactionGuard::AllTrivial
        } else {
            ReactionGuard::Absent
        };
        Compiled {
            info: ReactionInfo::new(self.inputs, self.outputs, guard),
            body: self.body,
            pool: self.pool,
            retry: self.retry,
        }
    }
}

/// A compiled reaction as owned by its site.
pub(crate) struct Compiled {
    pub(crate) info: ReactionInfo,
    pub(crate) body: Arc<Body>,
    pub(crate) pool: Option<Arc<ReactionPool>>,
    pub(crate) retry: bool,
}

impl fmt::Display for Compiled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.info, f)
    }
}

/// The chosen input values handed to a running reaction body, indexed by
/// input position.
pub struct ReactionInputs {
    pub(crate) reaction: Arc<Compiled>,
    pub(crate) values: Vec<MolValue>,
    /// Reply-protocol violations observed while the body ran; inspected by
    /// the completion hook even when the body swallows the error.
    pub(crate) violations: Mutex<Vec<String>>,
}

impl ReactionInputs {
    pub(crate) fn new(reaction: Arc<Compiled>, values: Vec<MolValue>) -> ReactionInputs {
        ReactionInputs {
            reaction,
            values,
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Borrows the value at input position `index`.
    pub fn value<T: MolData>(&self, index: usize) -> Result<&T, BodyError> {
        let value = self.values.get(index).ok_or_else(|| {
            BodyError(format!(
                "reaction {} has no input position {index}",
                self.reaction.info
            ))
        })?;
        value.downcast_ref::<T>().ok_or_else(|| {
            BodyError(format!(
                "input {index} of reaction {} has an unexpected type",
                self.reaction.info
            ))
        })
    }

    /// Clones the value at input position `index`.
    pub fn cloned<T: MolData + Clone>(&self, index: usize) -> Result<T, BodyError> {
        self.value::<T>(index).cloned()
    }

    /// Unconditional reply to the blocking molecule at `index`. A reply
    /// that arrives after the waiter timed out is silently dropped; use
    /// [`reply_checked`](Self::reply_checked) to observe that. Replying
    /// twice is a protocol violation.
    pub fn reply<R: Send + Sync + 'static>(
        &self,
        index: usize,
        value: R,
    ) -> Result<(), BodyError> {
        match self.reply_slot::<R>(index)?.reply(value) {
            ReplyStatus::Accepted | ReplyStatus::AfterTimeout => Ok(()),
            ReplyStatus::AlreadyReplied => Err(self.record_multiple_reply(index)),
        }
    }

    /// Like [`reply`](Self::reply), but reports whether the waiter was
    /// still present: `false` means it already timed out.
    pub fn reply_checked<R: Send + Sync + 'static>(
        &self,
        index: usize,
        value: R,
    ) -> Result<bool, BodyError> {
        match self.reply_slot::<R>(index)?.reply(value) {
            ReplyStatus::Accepted => Ok(true),
            ReplyStatus::AfterTimeout => Ok(false),
            ReplyStatus::AlreadyReplied => Err(self.record_multiple_reply(index)),
        }
    }

    fn reply_slot<R: Send + Sync + 'static>(
        &self,
        index: usize,
    ) -> Result<&ReplySlot<R>, BodyError> {
        let value = self.values.get(index).ok_or_else(|| {
            BodyError(format!(
                "reaction {} has no input position {index}",
                self.reaction.info
            ))
        })?;
        let slot = value.reply_slot().ok_or_else(|| {
            BodyError(format!(
                "input {} of reaction {} is not blocking",
                self.input_name(index),
                self.reaction.info
            ))
        })?;
        slot.as_any().downcast_ref::<ReplySlot<R>>().ok_or_else(|| {
            BodyError(format!(
                "input {} of reaction {} does not reply with the requested type",
                self.input_name(index),
                self.reaction.info
            ))
        })
    }

    fn record_multiple_reply(&self, index: usize) -> BodyError {
        let message = format!(
            "molecule {} received a second reply",
            self.input_name(index)
        );
        self.violations.lock().push(message.clone());
        BodyError(message)
    }

    fn input_name(&self, index: usize) -> String {
        self.reaction
            .info
            .inputs
            .get(index)
            .map_or_else(|| format!("#{index}"), |input| input.emitter.to_string())
    }

    /// `[c(2), d()]`, for error messages.
    pub(crate) fn display_values(&self) -> String {
        let rendered: Vec<String> = self
            .reaction
            .info
            .inputs
            .iter()
            .zip(&self.values)
            .map(|(input, value)| format!("{}({})", input.emitter, fmt_payload(value.payload())))
            .collect();
        format!("[{}]", rendered.join(", "))
    }

    pub(crate) fn take_violations(&self) -> Vec<String> {
        std::mem::take(&mut *self.violations.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::{blocking_molecule, molecule};

    fn noop() -> impl Fn(&ReactionInputs) -> Result<(), BodyError> + Send + Sync + 'static {
        |_| Ok(())
    }

    #[test]
    fn display_matches_declared_chemistry() {
        let a = molecule::<()>("a");
        let c = molecule::<i32>("c");
        let compiled = Reaction::new(noop())
            .consumes(&a, InputPattern::wildcard())
            .consumes(&c, InputPattern::var_if("x", |x: &i32| *x > 0))
            .emits_value(&c, 1i32)
            .emits_value(&a, ())
            .compile();
        assert_eq!(
            compiled.info.to_string(),
            "{a(_) + c(x if ?) => c(1) + a()}"
        );
    }

    #[test]
    fn static_reaction_displays_underscore() {
        let d = molecule::<String>("d");
        let compiled = Reaction::new(noop())
            .emits_value(&d, "ok".to_owned())
            .compile();
        assert_eq!(compiled.info.to_string(), "{_ => d(ok)}");
        assert_eq!(compiled.info.input_count(), 0);
    }

    #[test]
    fn inputs_sorted_puts_constants_first() {
        let c = molecule::<i32>("c");
        let g = blocking_molecule::<(), i32>("g");
        let compiled = Reaction::new(noop())
            .consumes(&g, InputPattern::wildcard())
            .consumes(&c, InputPattern::constant(0i32))
            .compile();
        assert_eq!(compiled.info.inputs_sorted, vec![1, 0]);
    }

    #[test]
    fn repeated_nontrivial_emitter_marks_cross_conditionals() {
        let a = molecule::<i32>("a");
        let all_trivial = Reaction::new(noop())
            .consumes(&a, InputPattern::var("x"))
            .consumes(&a, InputPattern::var("y"))
            .compile();
        assert!(all_trivial.info.cross_conditionals.is_empty());
        assert!(!all_trivial.info.needs_search());

        let one_guarded = Reaction::new(noop())
            .consumes(&a, InputPattern::var_if("x", |x: &i32| *x > 0))
            .consumes(&a, InputPattern::var("y"))
            .compile();
        assert_eq!(
            one_guarded.info.cross_conditionals.iter().copied().collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(one_guarded.info.needs_search());
    }

    #[test]
    fn identical_chemistry_shares_digest() {
        let a = molecule::<i32>("a");
        let one = Reaction::new(noop())
            .consumes(&a, InputPattern::var("x"))
            .compile();
        let two = Reaction::new(noop())
            .consumes(&a, InputPattern::var("x"))
            .compile();
        let other = Reaction::new(noop())
            .consumes(&a, InputPattern::constant(1i32))
            .compile();
        assert_eq!(one.info.digest, two.info.digest);
        assert_ne!(one.info.digest, other.info.digest);
    }

    #[test]
    fn guard_flag_classification() {
        let a = molecule::<i32>("a");
        let trivial = Reaction::new(noop())
            .consumes(&a, InputPattern::var("x"))
            .compile();
        assert!(matches!(trivial.info.guard, ReactionGuard::AllTrivial));

        let conditional = Reaction::new(noop())
            .consumes(&a, InputPattern::var_if("x", |x: &i32| *x > 0))
            .compile();
        assert!(matches!(conditional.info.guard, ReactionGuard::Absent));
        assert!(conditional.info.is_guardless());

        let guarded = Reaction::new(noop())
            .consumes(&a, InputPattern::var("x"))
            .with_static_guard(|| true)
            .compile();
        assert!(matches!(guarded.info.guard, ReactionGuard::Present { .. }));
        assert!(!guarded.info.is_guardless());
    }
}
