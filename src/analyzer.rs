//! Static analysis of a site's declared chemistry, run once per site before
//! any emitter is bound. Errors abort construction; warnings are logged and
//! kept on the site for inspection.
//!
//! All checks are pure functions of the reaction descriptors, so running
//! the analysis twice yields the same result.
//
// TODO: detect livelock cycles spanning several reactions; only the
// single-reaction case is checked below.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::molecule::MolId;
use crate::reaction::{Compiled, InputMol, OutputMol};

pub(crate) struct Analysis {
    pub(crate) errors: Vec<String>,
    pub(crate) warnings: Vec<String>,
}

pub(crate) fn analyze(
    reactions: &[Arc<Compiled>],
    static_reactions: &[Arc<Compiled>],
    static_mols: &HashMap<MolId, String>,
) -> Analysis {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    check_cross_guard_indices(reactions, &mut errors);
    check_identical(reactions, static_reactions, &mut warnings);
    check_shadowing(reactions, &mut errors);
    check_livelock(reactions, &mut errors, &mut warnings);
    check_deadlock(reactions, &mut warnings);
    check_static_discipline(reactions, static_reactions, static_mols, &mut errors);

    Analysis { errors, warnings }
}

fn check_cross_guard_indices(reactions: &[Arc<Compiled>], errors: &mut Vec<String>) {
    for reaction in reactions {
        let arity = reaction.info.input_count();
        for guard in reaction.info.cross_guards() {
            let distinct: HashSet<usize> = guard.indices.iter().copied().collect();
            if guard.indices.iter().any(|&i| i >= arity) || distinct.len() < 2 {
                errors.push(format!(
                    "malformed cross-guard in reaction {}: guard indices must name at least two distinct existing inputs",
                    reaction.info
                ));
            }
        }
    }
}

fn check_identical(
    reactions: &[Arc<Compiled>],
    static_reactions: &[Arc<Compiled>],
    warnings: &mut Vec<String>,
) {
    let all: Vec<&Arc<Compiled>> = reactions.iter().chain(static_reactions).collect();
    for (i, a) in all.iter().enumerate() {
        if all[..i].iter().any(|b| b.info.digest == a.info.digest) {
            warnings.push(format!(
                "Identical chemistry: reaction {} is declared more than once",
                a.info
            ));
        }
    }
}

/// Tries to map every element of `from` onto a distinct element of `to`
/// such that `admits` holds for each pair. Sizes are reaction arities, so a
/// plain backtracking search is fine.
fn injective_cover<A, B>(from: &[A], to: &[B], admits: &impl Fn(&A, &B) -> bool) -> bool {
    fn go<A, B>(
        from: &[A],
        to: &[B],
        admits: &impl Fn(&A, &B) -> bool,
        depth: usize,
        used: &mut Vec<bool>,
    ) -> bool {
        if depth == from.len() {
            return true;
        }
        for (j, candidate) in to.iter().enumerate() {
            if used[j] || !admits(&from[depth], candidate) {
                continue;
            }
            used[j] = true;
            if go(from, to, admits, depth + 1, used) {
                return true;
            }
            used[j] = false;
        }
        false
    }
    if from.len() > to.len() {
        return false;
    }
    go(from, to, admits, 0, &mut vec![false; to.len()])
}

fn input_weaker_than_input(a: &InputMol, b: &InputMol) -> bool {
    a.emitter == b.emitter && a.pattern.is_weaker_or_equal(&b.pattern)
}

fn input_covered_by_output(input: &InputMol, output: &OutputMol) -> bool {
    input.emitter == output.emitter && input.pattern.covers_output(&output.pattern)
}

fn check_shadowing(reactions: &[Arc<Compiled>], errors: &mut Vec<String>) {
    for (i, a) in reactions.iter().enumerate() {
        if !a.info.is_guardless() || a.info.inputs.is_empty() {
            continue;
        }
        for (j, b) in reactions.iter().enumerate() {
            if i == j || !b.info.is_guardless() {
                continue;
            }
            // A fires whenever B could: each input of A maps to a distinct,
            // stronger input of B on the same emitter.
            if injective_cover(&a.info.inputs, &b.info.inputs, &input_weaker_than_input) {
                errors.push(format!(
                    "Unavoidable indeterminism: reaction {} is shadowed by {}",
                    b.info, a.info
                ));
            }
        }
    }
}

fn check_livelock(reactions: &[Arc<Compiled>], errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    for reaction in reactions {
        if reaction.info.inputs.is_empty() {
            continue;
        }
        let guaranteed: Vec<&OutputMol> = reaction.info.guaranteed_outputs().collect();
        let reproduces_unconditionally = injective_cover(
            &reaction.info.inputs,
            &guaranteed,
            &|input, output: &&OutputMol| input_covered_by_output(input, output),
        );
        if reproduces_unconditionally && reaction.info.is_guardless() {
            errors.push(format!("Unavoidable livelock: reaction {}", reaction.info));
            continue;
        }
        let all_outputs: Vec<&OutputMol> = reaction.info.outputs.iter().collect();
        if injective_cover(
            &reaction.info.inputs,
            &all_outputs,
            &|input, output: &&OutputMol| input_covered_by_output(input, output),
        ) {
            warnings.push(format!("Possible livelock: reaction {}", reaction.info));
        }
    }
}

fn check_deadlock(reactions: &[Arc<Compiled>], warnings: &mut Vec<String>) {
    for consumer in reactions {
        for blocking in consumer
            .info
            .inputs
            .iter()
            .filter(|input| input.emitter.is_blocking())
        {
            for other in consumer
                .info
                .inputs
                .iter()
                .filter(|input| input.emitter != blocking.emitter)
            {
                // does any reaction emit the partner only after the
                // blocking molecule, so the blocked thread may wait on a
                // partner that is not there yet?
                for emitter_reaction in reactions {
                    let outputs = &emitter_reaction.info.outputs;
                    let blocking_pos = outputs
                        .iter()
                        .position(|out| out.emitter == blocking.emitter);
                    let other_pos = outputs.iter().position(|out| out.emitter == other.emitter);
                    if let (Some(b), Some(m)) = (blocking_pos, other_pos) {
                        if b < m {
                            warnings.push(format!(
                                "Possible deadlock: reaction {} may block on {} because {} is emitted after it by reaction {}",
                                consumer.info, blocking.emitter, other.emitter, emitter_reaction.info
                            ));
                        }
                    }
                }
            }
        }
    }

    for emitter_reaction in reactions {
        let outputs = &emitter_reaction.info.outputs;
        for (i, blocking) in outputs
            .iter()
            .enumerate()
            .filter(|(_, out)| out.emitter.is_blocking())
        {
            for later in &outputs[i + 1..] {
                let consumed_together = reactions.iter().any(|r| {
                    r.info.input_multiplicity(blocking.emitter.id()) > 0
                        && r.info.input_multiplicity(later.emitter.id()) > 0
                });
                if consumed_together {
                    warnings.push(format!(
                        "Possible deadlock: blocking molecule {} emitted by reaction {} may not receive a reply until {} is also emitted",
                        blocking.emitter, emitter_reaction.info, later.emitter
                    ));
                }
            }
        }
    }
}

fn check_static_discipline(
    reactions: &[Arc<Compiled>],
    static_reactions: &[Arc<Compiled>],
    static_mols: &HashMap<MolId, String>,
    errors: &mut Vec<String>,
) {
    for static_reaction in static_reactions {
        if !static_reaction.info.is_guardless() {
            errors.push(format!(
                "Incorrect static molecule declaration: static reaction {} must not have a guard",
                static_reaction.info
            ));
        }
        if static_reaction.info.guaranteed_outputs().next().is_none() {
            errors.push(format!(
                "Incorrect static molecule declaration: static reaction {} emits no molecules",
                static_reaction.info
            ));
        }
        for output in static_reaction.info.guaranteed_outputs() {
            if output.emitter.is_blocking() {
                errors.push(format!(
                    "Incorrect static molecule declaration: blocking molecule {} cannot be static",
                    output.emitter
                ));
            }
        }
    }

    for (&mol, name) in static_mols {
        let consumed_anywhere = reactions
            .iter()
            .any(|r| r.info.input_multiplicity(mol) > 0);
        if !consumed_anywhere {
            errors.push(format!(
                "Incorrect static molecule declaration: static molecule {name} is not consumed by any reaction"
            ));
        }
        for reaction in reactions {
            let consumed = reaction.info.input_multiplicity(mol);
            let emitted = reaction.info.guaranteed_output_ids().any(|id| id == mol);
            if consumed > 1 {
                errors.push(format!(
                    "Incorrect static molecule declaration: static molecule {name} is consumed {consumed} times by reaction {}",
                    reaction.info
                ));
            } else if consumed == 1 && !emitted {
                errors.push(format!(
                    "Incorrect static molecule declaration: static molecule {name} is consumed but not emitted by reaction {}",
                    reaction.info
                ));
            } else if consumed == 0 && emitted {
                errors.push(format!(
                    "Incorrect static molecule declaration: static molecule {name} is emitted but not consumed by reaction {}",
                    reaction.info
                ));
            }
        }
    }
}
