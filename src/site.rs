//! Reaction sites: each site owns a bag of pending molecules and a fixed
//! set of reactions that consume them.
//!
//! The site lock serializes every scheduling decision: bag mutation,
//! candidate matching and the atomic "remove inputs" step all run under it.
//! Reaction bodies run outside the lock, in parallel, on whichever pool the
//! reaction (or the site) designates. Completion of a body, a timed-out
//! blocking emission and every emit re-enter the scheduler.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::analyzer;
use crate::bag::MolBag;
use crate::error::{ConfigError, EmitError, ErrorLog, ReactionFailure};
use crate::matcher;
use crate::molecule::{MolId, MoleculeCore, MoleculeRef};
use crate::pool::ReactionPool;
use crate::reaction::{Compiled, Reaction, ReactionInputs};
use crate::value::{fmt_payload, MolValue};

static NEXT_SITE_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Present while a reaction body (or a seeding static reaction) runs on
    /// this thread. Carries the static molecules the reaction may still
    /// emit, each at most once.
    static RUNNING_REACTION: RefCell<Option<ReactionPermit>> = const { RefCell::new(None) };
}

struct ReactionPermit {
    site_id: usize,
    pending_statics: HashSet<MolId>,
}

fn default_dispatch_pool() -> &'static Arc<ReactionPool> {
    static POOL: OnceLock<Arc<ReactionPool>> = OnceLock::new();
    POOL.get_or_init(|| ReactionPool::new("reaction", None))
}

fn default_decision_pool() -> &'static Arc<ReactionPool> {
    static POOL: OnceLock<Arc<ReactionPool>> = OnceLock::new();
    POOL.get_or_init(|| ReactionPool::new("site scheduler", Some(2)))
}

pub(crate) struct SiteCore {
    id: usize,
    display: String,
    reactions: Vec<Arc<Compiled>>,
    static_reactions: Vec<Arc<Compiled>>,
    bag: Mutex<MolBag>,
    dispatch_pool: Arc<ReactionPool>,
    decision_pool: Arc<ReactionPool>,
    error_log: Arc<ErrorLog>,
    /// Every molecule bound to this site, for soup dumps.
    mols: HashMap<MolId, MoleculeRef>,
    static_mols: HashMap<MolId, String>,
    /// Output emitters across all reactions; checked bound on first emit.
    output_refs: Vec<MoleculeRef>,
    outputs_checked: AtomicBool,
    warnings: Vec<String>,
    /// Rotates the reaction considered first, so scheduling does not depend
    /// on declaration order when several reactions are eligible.
    rr: AtomicUsize,
}

impl SiteCore {
    pub(crate) fn display(&self) -> &str {
        &self.display
    }

    pub(crate) fn log_soup(&self) -> String {
        let bag = self.bag.lock();
        if bag.is_empty() {
            return format!("{}\nNo molecules", self.display);
        }
        let mut by_name: Vec<(String, Vec<(String, usize)>)> = Vec::new();
        for (mol, values) in bag.iter() {
            let name = self
                .mols
                .get(&mol)
                .map_or_else(|| format!("#{mol}"), |m| m.to_string());
            let mut groups: Vec<(String, usize)> = Vec::new();
            for value in values {
                let rendered = fmt_payload(value.payload());
                match groups.iter_mut().find(|(existing, _)| *existing == rendered) {
                    Some((_, count)) => *count += 1,
                    None => groups.push((rendered, 1)),
                }
            }
            groups.sort();
            by_name.push((name, groups));
        }
        by_name.sort();
        let rendered: Vec<String> = by_name
            .iter()
            .flat_map(|(name, groups)| {
                groups.iter().map(move |(value, count)| {
                    if *count == 1 {
                        format!("{name}({value})")
                    } else {
                        format!("{name}({value}) * {count}")
                    }
                })
            })
            .collect();
        format!("{}\nMolecules: {}", self.display, rendered.join(", "))
    }

    /// Called by a blocking emitter whose wait timed out: drop the molecule
    /// if no reaction consumed it yet.
    pub(crate) fn remove_timed_out(
        &self,
        mol: MolId,
        slot: &Arc<dyn crate::reply::ErasedReply>,
    ) {
        if self.bag.lock().remove_by_reply_slot(mol, slot) {
            debug!(site = %self.display, "timed-out blocking molecule removed");
        }
    }

    fn check_outputs_bound(&self) -> Result<(), EmitError> {
        if self.outputs_checked.load(Ordering::Acquire) {
            return Ok(());
        }
        let unbound: Vec<String> = self
            .output_refs
            .iter()
            .filter(|mol| !mol.is_bound())
            .map(|mol| mol.to_string())
            .collect();
        if unbound.is_empty() {
            self.outputs_checked.store(true, Ordering::Release);
            Ok(())
        } else {
            Err(EmitError::UnboundOutputs {
                site: self.display.clone(),
                molecules: unbound.join(", "),
            })
        }
    }

    /// Static molecules may only be emitted by a reaction of this site that
    /// consumed them, once per run.
    fn check_static_permit(&self, mol: &MoleculeCore, value: &MolValue) -> Result<(), EmitError> {
        let molecule = format!("{}({})", mol.name, fmt_payload(value.payload()));
        RUNNING_REACTION.with_borrow_mut(|permit| match permit {
            Some(permit) if permit.site_id == self.id => {
                if permit.pending_statics.remove(&mol.id) {
                    Ok(())
                } else {
                    Err(EmitError::StaticAlreadyEmitted {
                        site: self.display.clone(),
                        molecule,
                    })
                }
            }
            _ => Err(EmitError::StaticFromNonReaction {
                site: self.display.clone(),
                molecule,
            }),
        })
    }

    /// Queues one scheduling pass. Decisions run on the decision pool so an
    /// emit returns as soon as the value is in the bag; if that pool is
    /// already shut down the decision runs on the calling thread instead.
    fn schedule(self: &Arc<Self>) {
        let site = self.clone();
        if !self.decision_pool.submit(move || site.decide()) {
            self.decide();
        }
    }

    /// The scheduling loop: while some reaction can fire, atomically remove
    /// its chosen inputs and hand the body to a pool. Matching and removal
    /// happen under the site lock; the launch does not.
    fn decide(self: &Arc<Self>) {
        loop {
            let launch = {
                let mut bag = self.bag.lock();
                if bag.is_empty() {
                    None
                } else {
                    self.choose(&mut bag)
                }
            };
            match launch {
                Some((reaction, values)) => self.launch(reaction, values),
                None => return,
            }
        }
    }

    fn choose(&self, bag: &mut MolBag) -> Option<(Arc<Compiled>, Vec<MolValue>)> {
        let n = self.reactions.len();
        if n == 0 {
            return None;
        }
        let start = self.rr.fetch_add(1, Ordering::Relaxed) % n;
        for k in 0..n {
            let reaction = &self.reactions[(start + k) % n];
            if let Some(refs) = matcher::find_inputs(&reaction.info, bag) {
                let values = bag.take(&refs);
                debug!(site = %self.display, reaction = %reaction.info, "reaction chosen");
                return Some((reaction.clone(), values));
            }
        }
        None
    }

    fn launch(self: &Arc<Self>, reaction: Arc<Compiled>, values: Vec<MolValue>) {
        let pool = reaction.pool.as_ref().unwrap_or(&self.dispatch_pool).clone();
        let site = self.clone();
        // the payload survives a refused submission, so the consumed inputs
        // can go back into the bag instead of vanishing with the closure
        let payload = Arc::new(Mutex::new(Some(ReactionInputs::new(
            reaction.clone(),
            values,
        ))));
        let task_payload = payload.clone();
        let submitted = pool.submit(move || {
            if let Some(inputs) = task_payload.lock().take() {
                site.run_reaction(inputs);
            }
        });
        if !submitted {
            warn!(
                site = %self.display,
                reaction = %reaction.info,
                "reaction not started: pool is shut down"
            );
            if let Some(inputs) = payload.lock().take() {
                let mut bag = self.bag.lock();
                for (input, value) in reaction.info.inputs.iter().zip(&inputs.values) {
                    bag.add(input.emitter.id(), value.clone());
                }
            }
        }
    }

    /// The task wrapper around one reaction body: static-emission permit,
    /// panic containment, retry, reply bookkeeping, rescheduling.
    fn run_reaction(self: &Arc<Self>, inputs: ReactionInputs) {
        let reaction = inputs.reaction.clone();
        let pending_statics: HashSet<MolId> = reaction
            .info
            .inputs
            .iter()
            .map(|input| input.emitter.id())
            .filter(|id| self.static_mols.contains_key(id))
            .collect();
        let declared_statics = pending_statics.clone();

        let previous = RUNNING_REACTION.replace(Some(ReactionPermit {
            site_id: self.id,
            pending_statics,
        }));
        let outcome = catch_unwind(AssertUnwindSafe(|| (reaction.body)(&inputs)));
        let leftover_statics = RUNNING_REACTION
            .replace(previous)
            .map(|permit| permit.pending_statics)
            .unwrap_or_default();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(panic_message(panic)),
        };

        for violation in inputs.take_violations() {
            self.record_failure(&inputs, violation);
        }

        match failure {
            Some(message) if reaction.retry => {
                warn!(
                    site = %self.display,
                    reaction = %reaction.info,
                    "reaction failed, inputs re-emitted: {message}"
                );
                // statics the body already re-emitted must not be doubled,
                // and a blocking molecule whose waiter gave up would linger
                // in the bag forever
                let re_emitted: HashSet<MolId> = declared_statics
                    .difference(&leftover_statics)
                    .copied()
                    .collect();
                let mut bag = self.bag.lock();
                for (input, value) in reaction.info.inputs.iter().zip(&inputs.values) {
                    let id = input.emitter.id();
                    let waiter_gone = value
                        .reply_slot()
                        .is_some_and(|slot| slot.has_timed_out());
                    if !re_emitted.contains(&id) && !waiter_gone {
                        bag.add(id, value.clone());
                    }
                }
            }
            Some(message) => {
                self.record_failure(&inputs, format!("exception in reaction body: {message}"));
                for value in &inputs.values {
                    if let Some(slot) = value.reply_slot() {
                        if !slot.has_replied() {
                            slot.fail(format!(
                                "Reaction {} with inputs {} produced an exception: {message}",
                                reaction.info,
                                inputs.display_values()
                            ));
                        }
                    }
                }
            }
            None => {
                for (input, value) in reaction.info.inputs.iter().zip(&inputs.values) {
                    if let Some(slot) = value.reply_slot() {
                        if !slot.has_replied() && !slot.has_timed_out() {
                            let message = format!(
                                "Reaction {} with inputs {} finished without replying to {}",
                                reaction.info,
                                inputs.display_values(),
                                input.emitter
                            );
                            self.record_failure(&inputs, message.clone());
                            slot.fail(message);
                        }
                    }
                }
                if !leftover_statics.is_empty() {
                    let missing: Vec<&str> = leftover_statics
                        .iter()
                        .filter_map(|id| self.static_mols.get(id).map(String::as_str))
                        .collect();
                    self.record_failure(
                        &inputs,
                        format!(
                            "Reaction {} with inputs {} finished without emitting static molecules: {}",
                            reaction.info,
                            inputs.display_values(),
                            missing.join(", ")
                        ),
                    );
                }
            }
        }

        self.decide();
    }

    fn record_failure(&self, inputs: &ReactionInputs, message: String) {
        self.error_log.record(ReactionFailure {
            site: self.display.clone(),
            reaction: inputs.reaction.info.to_string(),
            inputs: inputs.display_values(),
            message,
        });
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "reaction body panicked".to_owned()
    }
}

/// Entry point used by every emitter: static protocol check, bag insertion
/// under the site lock, then a scheduling pass.
pub(crate) fn emit(
    site: &Arc<SiteCore>,
    mol: &Arc<MoleculeCore>,
    value: MolValue,
) -> Result<(), EmitError> {
    site.check_outputs_bound()?;
    let is_static = mol.is_static();
    if is_static {
        site.check_static_permit(mol, &value)?;
    }
    {
        let mut bag = site.bag.lock();
        if is_static {
            mol.set_volatile(value.clone());
        }
        bag.add(mol.id, value);
    }
    site.schedule();
    Ok(())
}

/// Constructs a reaction site from `reactions`, with `pool` as the dispatch
/// pool for reaction bodies. Shorthand for [`SiteBuilder`].
pub fn site(
    pool: &Arc<ReactionPool>,
    reactions: impl IntoIterator<Item = Reaction>,
) -> Result<SiteHandle, ConfigError> {
    SiteBuilder::new(reactions).dispatch_pool(pool).build()
}

/// Builds a reaction site: analyzes the declared chemistry, binds every
/// input emitter, then runs the static reactions once to seed the bag.
pub struct SiteBuilder {
    reactions: Vec<Reaction>,
    dispatch_pool: Option<Arc<ReactionPool>>,
    decision_pool: Option<Arc<ReactionPool>>,
    error_log: Option<Arc<ErrorLog>>,
}

impl SiteBuilder {
    pub fn new(reactions: impl IntoIterator<Item = Reaction>) -> SiteBuilder {
        SiteBuilder {
            reactions: reactions.into_iter().collect(),
            dispatch_pool: None,
            decision_pool: None,
            error_log: None,
        }
    }

    /// Pool running reaction bodies (unless a reaction designates its own).
    pub fn dispatch_pool(mut self, pool: &Arc<ReactionPool>) -> SiteBuilder {
        self.dispatch_pool = Some(pool.clone());
        self
    }

    /// Pool running scheduling decisions.
    pub fn decision_pool(mut self, pool: &Arc<ReactionPool>) -> SiteBuilder {
        self.decision_pool = Some(pool.clone());
        self
    }

    /// Sink for reaction failures; defaults to [`ErrorLog::global`].
    pub fn error_log(mut self, log: &Arc<ErrorLog>) -> SiteBuilder {
        self.error_log = Some(log.clone());
        self
    }

    pub fn build(self) -> Result<SiteHandle, ConfigError> {
        let compiled: Vec<Arc<Compiled>> = self
            .reactions
            .into_iter()
            .map(|reaction| Arc::new(reaction.compile()))
            .collect();
        let (static_reactions, reactions): (Vec<_>, Vec<_>) = compiled
            .into_iter()
            .partition(|reaction| reaction.info.input_count() == 0);

        let summaries: Vec<String> = reactions
            .iter()
            .chain(&static_reactions)
            .map(|reaction| {
                if reaction.info.inputs.is_empty() {
                    "_ => ...".to_owned()
                } else {
                    let inputs: Vec<String> = reaction
                        .info
                        .inputs
                        .iter()
                        .map(|input| input.emitter.to_string())
                        .collect();
                    format!("{} => ...", inputs.join(" + "))
                }
            })
            .collect();
        let site_display = format!("Site{{{}}}", summaries.join("; "));

        let static_mols: HashMap<MolId, String> = static_reactions
            .iter()
            .flat_map(|reaction| reaction.info.guaranteed_outputs())
            .filter(|output| !output.emitter.is_blocking())
            .map(|output| (output.emitter.id(), output.emitter.name().to_owned()))
            .collect();

        let analysis = analyzer::analyze(&reactions, &static_reactions, &static_mols);
        if !analysis.errors.is_empty() {
            return Err(ConfigError::RejectedChemistry {
                site: site_display,
                message: analysis.errors.join("; "),
            });
        }
        for warning in &analysis.warnings {
            warn!(site = %site_display, "{warning}");
        }

        // unique input emitters, in first-appearance order; these get bound
        let mut inputs: Vec<MoleculeRef> = Vec::new();
        for reaction in &reactions {
            for input in &reaction.info.inputs {
                if !inputs.contains(&input.emitter) {
                    inputs.push(input.emitter.clone());
                }
            }
        }
        let mut output_refs: Vec<MoleculeRef> = Vec::new();
        for reaction in reactions.iter().chain(&static_reactions) {
            for output in &reaction.info.outputs {
                if !output_refs.contains(&output.emitter) {
                    output_refs.push(output.emitter.clone());
                }
            }
        }

        let core = Arc::new(SiteCore {
            id: NEXT_SITE_ID.fetch_add(1, Ordering::Relaxed),
            display: site_display.clone(),
            bag: Mutex::new(MolBag::new()),
            dispatch_pool: self
                .dispatch_pool
                .unwrap_or_else(|| default_dispatch_pool().clone()),
            decision_pool: self
                .decision_pool
                .unwrap_or_else(|| default_decision_pool().clone()),
            error_log: self
                .error_log
                .unwrap_or_else(|| ErrorLog::global().clone()),
            mols: inputs.iter().map(|mol| (mol.id(), mol.clone())).collect(),
            static_mols,
            output_refs,
            outputs_checked: AtomicBool::new(false),
            warnings: analysis.warnings,
            reactions,
            static_reactions,
            rr: AtomicUsize::new(0),
        });

        let mut bound: Vec<MoleculeRef> = Vec::new();
        for (index, mol) in inputs.iter().enumerate() {
            if let Err(err) = mol.core.bind(&core, &core.display, index) {
                for already in &bound {
                    already.core.unbind();
                }
                return Err(err);
            }
            bound.push(mol.clone());
        }

        for (&id, mol) in &core.mols {
            let consuming = core
                .reactions
                .iter()
                .filter(|r| r.info.input_multiplicity(id) > 0)
                .count();
            let emitting = core
                .reactions
                .iter()
                .chain(&core.static_reactions)
                .filter(|r| r.info.outputs.iter().any(|o| o.emitter == *mol))
                .count();
            let mut stats = mol.core.stats.lock();
            stats.consuming += consuming;
            stats.emitting += emitting;
        }

        for id in core.static_mols.keys() {
            if let Some(mol) = core.mols.get(id) {
                mol.core.mark_static();
            }
        }

        seed(&core)?;

        Ok(SiteHandle { core })
    }
}

/// Runs every static reaction exactly once, on the constructing thread,
/// with a permit covering its declared static outputs.
fn seed(core: &Arc<SiteCore>) -> Result<(), ConfigError> {
    for static_reaction in &core.static_reactions {
        let pending_statics: HashSet<MolId> = static_reaction
            .info
            .guaranteed_output_ids()
            .filter(|id| core.static_mols.contains_key(id))
            .collect();
        let inputs = ReactionInputs::new(static_reaction.clone(), Vec::new());

        let previous = RUNNING_REACTION.replace(Some(ReactionPermit {
            site_id: core.id,
            pending_statics,
        }));
        let outcome = catch_unwind(AssertUnwindSafe(|| (static_reaction.body)(&inputs)));
        let leftover = RUNNING_REACTION
            .replace(previous)
            .map(|permit| permit.pending_statics)
            .unwrap_or_default();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(panic_message(panic)),
        };
        if let Some(message) = failure {
            return Err(ConfigError::SeedingFailed {
                site: core.display.clone(),
                reaction: static_reaction.info.to_string(),
                message,
            });
        }
        if !leftover.is_empty() {
            let missing: Vec<&str> = leftover
                .iter()
                .filter_map(|id| core.static_mols.get(id).map(String::as_str))
                .collect();
            return Err(ConfigError::IncompleteSeeding {
                site: core.display.clone(),
                reaction: static_reaction.info.to_string(),
                molecules: missing.join(", "),
            });
        }
    }
    Ok(())
}

/// Owner handle of a constructed site. Emitters hold only weak references
/// to their site; dropping the last handle tears the site down and its
/// emitters report unbound again.
pub struct SiteHandle {
    core: Arc<SiteCore>,
}

impl fmt::Debug for SiteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteHandle")
            .field("core", &self.core.display)
            .finish()
    }
}

impl SiteHandle {
    /// Snapshot of the bag contents, for diagnostics.
    pub fn log_soup(&self) -> String {
        self.core.log_soup()
    }

    /// Warnings the static analyzer produced at construction.
    pub fn warnings(&self) -> &[String] {
        &self.core.warnings
    }
}

impl fmt::Display for SiteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.core.display)
    }
}
