//! Pure assignment search: given a reaction's declared chemistry and the
//! current bag contents, find one multiset of values satisfying every input
//! pattern and every cross-guard.
//!
//! Reactions without cross constraints take the greedy path: one pass over
//! the inputs in specificity order, picking the first admissible value per
//! position. Everything else runs a backtracking search over candidate
//! values, with positions that are provably independent pinned to their
//! first available value to keep the search space small.
//!
//! The result is a pure function of `(reaction, bag)`; the caller holds the
//! site lock for the whole call, so the chosen slots stay valid until they
//! are consumed.

use std::collections::{HashMap, HashSet};

use crate::bag::{BagRef, MolBag};
use crate::molecule::MolId;
use crate::reaction::ReactionInfo;
use crate::value::MolData;

/// Finds one admissible assignment of bag slots to input positions, or
/// `None` if the reaction cannot fire. The returned refs are aligned with
/// the reaction's input order.
pub(crate) fn find_inputs(info: &ReactionInfo, bag: &MolBag) -> Option<Vec<BagRef>> {
    if info.input_count() == 0 {
        return None;
    }
    if !info.static_guard_passes() {
        return None;
    }

    // cheap multiplicity pre-check before any pattern runs
    let mut needed: HashMap<MolId, usize> = HashMap::new();
    for input in &info.inputs {
        *needed.entry(input.emitter.id()).or_insert(0) += 1;
    }
    if needed.iter().any(|(&mol, &n)| bag.count(mol) < n) {
        return None;
    }

    if info.needs_search() {
        cov_mark::hit!(backtracking_match);
        let mut chosen: Vec<Option<BagRef>> = vec![None; info.input_count()];
        let mut taken = HashSet::new();
        if !explore(info, bag, 0, &mut chosen, &mut taken) {
            return None;
        }
        Some(collect(chosen))
    } else {
        cov_mark::hit!(greedy_match);
        greedy(info, bag)
    }
}

fn greedy(info: &ReactionInfo, bag: &MolBag) -> Option<Vec<BagRef>> {
    let mut chosen: Vec<Option<BagRef>> = vec![None; info.input_count()];
    let mut taken: HashSet<(MolId, usize)> = HashSet::new();
    for &index in &info.inputs_sorted {
        let input = &info.inputs[index];
        let mol = input.emitter.id();
        let (slot, _) = bag
            .values(mol)
            .iter()
            .enumerate()
            .find(|(slot, value)| {
                !taken.contains(&(mol, *slot)) && input.pattern.admits(value.payload())
            })?;
        taken.insert((mol, slot));
        chosen[index] = Some(BagRef { mol, slot });
    }
    Some(collect(chosen))
}

fn explore(
    info: &ReactionInfo,
    bag: &MolBag,
    depth: usize,
    chosen: &mut Vec<Option<BagRef>>,
    taken: &mut HashSet<(MolId, usize)>,
) -> bool {
    if depth == info.inputs_sorted.len() {
        return cross_guards_pass(info, bag, chosen);
    }
    let index = info.inputs_sorted[depth];
    let input = &info.inputs[index];
    let mol = input.emitter.id();
    // positions outside every cross constraint admit any value, so the
    // first available choice is as good as any other
    let independent = input.pattern.is_trivial() && !info.cross_conditionals.contains(&index);
    for (slot, value) in bag.values(mol).iter().enumerate() {
        if taken.contains(&(mol, slot)) || !input.pattern.admits(value.payload()) {
            continue;
        }
        taken.insert((mol, slot));
        chosen[index] = Some(BagRef { mol, slot });
        if explore(info, bag, depth + 1, chosen, taken) {
            return true;
        }
        chosen[index] = None;
        taken.remove(&(mol, slot));
        if independent {
            return false;
        }
    }
    false
}

fn cross_guards_pass(info: &ReactionInfo, bag: &MolBag, chosen: &[Option<BagRef>]) -> bool {
    for guard in info.cross_guards() {
        let values: Vec<&dyn MolData> = guard
            .indices
            .iter()
            .map(|&index| {
                let r = chosen[index].expect("assignment is complete");
                bag.values(r.mol)[r.slot].payload()
            })
            .collect();
        if !guard.eval(&values) {
            cov_mark::hit!(cross_guard_reject);
            return false;
        }
    }
    true
}

fn collect(chosen: Vec<Option<BagRef>>) -> Vec<BagRef> {
    chosen
        .into_iter()
        .map(|r| r.expect("assignment is complete"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::{molecule, MoleculeRef};
    use crate::pattern::{CrossGuard, InputPattern};
    use crate::reaction::{Reaction, ReactionInputs};
    use crate::value::MolValue;

    fn noop(_: &ReactionInputs) -> Result<(), crate::reaction::BodyError> {
        Ok(())
    }

    fn chosen_values(info: &ReactionInfo, bag: &MolBag, refs: &[BagRef]) -> Vec<i32> {
        refs.iter()
            .map(|r| *bag.values(r.mol)[r.slot].downcast_ref::<i32>().unwrap())
            .collect()
    }

    #[test]
    fn greedy_picks_admissible_values() {
        cov_mark::check!(greedy_match);
        let c = molecule::<i32>("c");
        let d = molecule::<i32>("d");
        let id_c = MoleculeRef::from(&c).id();
        let id_d = MoleculeRef::from(&d).id();
        let reaction = Reaction::new(noop)
            .consumes(&c, InputPattern::constant(0i32))
            .consumes(&d, InputPattern::wildcard())
            .compile();

        let mut bag = MolBag::new();
        bag.add(id_c, MolValue::new(3i32));
        bag.add(id_c, MolValue::new(0i32));
        bag.add(id_d, MolValue::new(9i32));

        let refs = find_inputs(&reaction.info, &bag).expect("should match");
        assert_eq!(chosen_values(&reaction.info, &bag, &refs), vec![0, 9]);
    }

    #[test]
    fn missing_partner_fails_fast() {
        let c = molecule::<i32>("c");
        let d = molecule::<i32>("d");
        let id_c = MoleculeRef::from(&c).id();
        let reaction = Reaction::new(noop)
            .consumes(&c, InputPattern::wildcard())
            .consumes(&d, InputPattern::wildcard())
            .compile();

        let mut bag = MolBag::new();
        bag.add(id_c, MolValue::new(1i32));
        assert!(find_inputs(&reaction.info, &bag).is_none());
    }

    #[test]
    fn repeated_emitter_needs_distinct_values() {
        let a = molecule::<i32>("a");
        let id_a = MoleculeRef::from(&a).id();
        let reaction = Reaction::new(noop)
            .consumes(&a, InputPattern::var("x"))
            .consumes(&a, InputPattern::var("y"))
            .compile();

        let mut bag = MolBag::new();
        bag.add(id_a, MolValue::new(1i32));
        assert!(find_inputs(&reaction.info, &bag).is_none());

        bag.add(id_a, MolValue::new(2i32));
        let refs = find_inputs(&reaction.info, &bag).expect("two copies present");
        assert_ne!(refs[0], refs[1]);
    }

    #[test]
    fn cross_guard_forces_backtracking() {
        cov_mark::check!(backtracking_match);
        let a = molecule::<i32>("a");
        let b = molecule::<i32>("b");
        let id_a = MoleculeRef::from(&a).id();
        let id_b = MoleculeRef::from(&b).id();
        let reaction = Reaction::new(noop)
            .consumes(&a, InputPattern::var("x"))
            .consumes(&b, InputPattern::var("y"))
            .with_cross_guard(CrossGuard::new(vec![0, 1], |values| {
                let x = values[0].downcast_ref::<i32>().unwrap();
                let y = values[1].downcast_ref::<i32>().unwrap();
                x < y
            }))
            .compile();

        let mut bag = MolBag::new();
        bag.add(id_a, MolValue::new(5i32));
        bag.add(id_a, MolValue::new(1i32));
        bag.add(id_b, MolValue::new(3i32));

        let refs = find_inputs(&reaction.info, &bag).expect("a(1) + b(3) passes");
        assert_eq!(chosen_values(&reaction.info, &bag, &refs), vec![1, 3]);
    }

    #[test]
    fn cross_guard_can_reject_everything() {
        cov_mark::check!(cross_guard_reject);
        let a = molecule::<i32>("a");
        let b = molecule::<i32>("b");
        let id_a = MoleculeRef::from(&a).id();
        let id_b = MoleculeRef::from(&b).id();
        let reaction = Reaction::new(noop)
            .consumes(&a, InputPattern::var("x"))
            .consumes(&b, InputPattern::var("y"))
            .with_cross_guard(CrossGuard::new(vec![0, 1], |_| false))
            .compile();

        let mut bag = MolBag::new();
        bag.add(id_a, MolValue::new(1i32));
        bag.add(id_b, MolValue::new(2i32));
        assert!(find_inputs(&reaction.info, &bag).is_none());
    }

    #[test]
    fn static_guard_gates_matching() {
        let a = molecule::<i32>("a");
        let id_a = MoleculeRef::from(&a).id();
        let closed = Reaction::new(noop)
            .consumes(&a, InputPattern::var("x"))
            .with_static_guard(|| false)
            .compile();

        let mut bag = MolBag::new();
        bag.add(id_a, MolValue::new(1i32));
        assert!(find_inputs(&closed.info, &bag).is_none());

        let open = Reaction::new(noop)
            .consumes(&a, InputPattern::var("x"))
            .with_static_guard(|| true)
            .compile();
        assert!(find_inputs(&open.info, &bag).is_some());
    }

    #[test]
    fn matching_is_pure() {
        let a = molecule::<i32>("a");
        let id_a = MoleculeRef::from(&a).id();
        let reaction = Reaction::new(noop)
            .consumes(&a, InputPattern::var_if("x", |x: &i32| *x % 2 == 0))
            .compile();

        let mut bag = MolBag::new();
        bag.add(id_a, MolValue::new(1i32));
        bag.add(id_a, MolValue::new(4i32));

        let first = find_inputs(&reaction.info, &bag);
        let second = find_inputs(&reaction.info, &bag);
        assert_eq!(first, second);
        assert_eq!(
            chosen_values(&reaction.info, &bag, &first.unwrap()),
            vec![4]
        );
    }
}
