use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{ConfigError, EmitError};
use crate::reply::{ErasedReply, ReplyOutcome, ReplySlot};
use crate::site::{self, SiteCore};
use crate::value::{MolData, MolValue};

/// Process-unique identity of an emitter.
pub(crate) type MolId = usize;

static NEXT_MOL_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MolKind {
    NonBlocking,
    Blocking,
}

/// Where an emitter is bound. The site pointer is weak: sites own their
/// reactions, reactions hold emitters, and a strong back-pointer would close
/// the cycle.
pub(crate) struct Binding {
    pub(crate) site: Weak<SiteCore>,
    pub(crate) site_display: String,
    pub(crate) index: usize,
}

#[derive(Default)]
pub(crate) struct MolStats {
    pub(crate) consuming: usize,
    pub(crate) emitting: usize,
}

/// Shared, type-erased state of one emitter. Typed handles and reaction
/// descriptors all point at the same core.
pub(crate) struct MoleculeCore {
    pub(crate) id: MolId,
    pub(crate) name: String,
    pub(crate) kind: MolKind,
    binding: Mutex<Option<Binding>>,
    pub(crate) stats: Mutex<MolStats>,
    is_static: Mutex<bool>,
    /// Last value observed for a static molecule. Written under the site
    /// lock, read without it.
    volatile: RwLock<Option<MolValue>>,
}

impl MoleculeCore {
    fn new(name: &str, kind: MolKind) -> Arc<MoleculeCore> {
        Arc::new(MoleculeCore {
            id: NEXT_MOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            kind,
            binding: Mutex::new(None),
            stats: Mutex::new(MolStats::default()),
            is_static: Mutex::new(false),
            volatile: RwLock::new(None),
        })
    }

    /// `name` for non-blocking emitters, `name/B` for blocking ones.
    pub(crate) fn display_name(&self) -> String {
        match self.kind {
            MolKind::NonBlocking => self.name.clone(),
            MolKind::Blocking => format!("{}/B", self.name),
        }
    }

    pub(crate) fn bind(
        self: &Arc<Self>,
        site: &Arc<SiteCore>,
        site_display: &str,
        index: usize,
    ) -> Result<(), ConfigError> {
        let mut binding = self.binding.lock();
        if let Some(existing) = &*binding {
            return Err(ConfigError::MoleculeAlreadyBound {
                molecule: self.display_name(),
                site: site_display.to_owned(),
                bound_to: existing.site_display.clone(),
            });
        }
        *binding = Some(Binding {
            site: Arc::downgrade(site),
            site_display: site_display.to_owned(),
            index,
        });
        Ok(())
    }

    /// Rolls back a binding made during a site construction that failed
    /// later. Never called on a live site.
    pub(crate) fn unbind(&self) {
        *self.binding.lock() = None;
    }

    pub(crate) fn site(&self) -> Option<Arc<SiteCore>> {
        self.binding.lock().as_ref().and_then(|b| b.site.upgrade())
    }

    pub(crate) fn bound_site(&self) -> Result<Arc<SiteCore>, EmitError> {
        self.site()
            .ok_or_else(|| EmitError::Unbound(self.display_name()))
    }

    pub(crate) fn site_index(&self) -> Option<usize> {
        self.binding.lock().as_ref().map(|b| b.index)
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.site().is_some()
    }

    pub(crate) fn mark_static(&self) {
        *self.is_static.lock() = true;
    }

    pub(crate) fn is_static(&self) -> bool {
        *self.is_static.lock()
    }

    pub(crate) fn set_volatile(&self, value: MolValue) {
        *self.volatile.write() = Some(value);
    }

    pub(crate) fn volatile_read(&self) -> Option<MolValue> {
        self.volatile.read().clone()
    }
}

/// Erased emitter handle, used wherever the value type does not matter:
/// reaction descriptors, analysis, diagnostics.
#[derive(Clone)]
pub struct MoleculeRef {
    pub(crate) core: Arc<MoleculeCore>,
}

impl MoleculeRef {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_bound(&self) -> bool {
        self.core.is_bound()
    }

    pub fn is_static(&self) -> bool {
        self.core.is_static()
    }

    pub fn is_blocking(&self) -> bool {
        self.core.kind == MolKind::Blocking
    }

    /// How many reactions consume this molecule. Populated when its site is
    /// constructed.
    pub fn consuming_reaction_count(&self) -> usize {
        self.core.stats.lock().consuming
    }

    /// How many reactions list this molecule among their outputs.
    pub fn emitting_reaction_count(&self) -> usize {
        self.core.stats.lock().emitting
    }

    /// Index of this molecule in its site's input table, if bound.
    pub fn site_index(&self) -> Option<usize> {
        self.core.site_index()
    }

    pub(crate) fn id(&self) -> MolId {
        self.core.id
    }
}

impl PartialEq for MoleculeRef {
    fn eq(&self, other: &MoleculeRef) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for MoleculeRef {}

impl std::hash::Hash for MoleculeRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.core.id.hash(state)
    }
}

impl fmt::Display for MoleculeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.core.display_name())
    }
}

impl fmt::Debug for MoleculeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MoleculeRef({})", self.core.display_name())
    }
}

/// A non-blocking emitter for values of type `T`.
///
/// Created unbound; bound to exactly one reaction site when that site is
/// constructed from a reaction consuming it. Cloning shares the identity.
pub struct Molecule<T: MolData> {
    core: Arc<MoleculeCore>,
    _value: PhantomData<fn(T)>,
}

impl<T: MolData> Clone for Molecule<T> {
    fn clone(&self) -> Self {
        Molecule {
            core: self.core.clone(),
            _value: PhantomData,
        }
    }
}

/// Creates an unbound non-blocking emitter.
pub fn molecule<T: MolData>(name: &str) -> Molecule<T> {
    Molecule {
        core: MoleculeCore::new(name, MolKind::NonBlocking),
        _value: PhantomData,
    }
}

impl<T: MolData> Molecule<T> {
    /// Places one value into the bag of the owning site and wakes its
    /// scheduler.
    pub fn emit(&self, value: T) -> Result<(), EmitError> {
        let site = self.core.bound_site()?;
        site::emit(&site, &self.core, MolValue::new(value))
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_bound(&self) -> bool {
        self.core.is_bound()
    }

    pub fn is_static(&self) -> bool {
        self.core.is_static()
    }

    /// Last value this static molecule carried, read without taking the
    /// site lock. While an updating reaction runs, this may still be the
    /// value it consumed.
    pub fn volatile_value(&self) -> Result<T, EmitError>
    where
        T: Clone,
    {
        let site = self.core.bound_site()?;
        if !self.core.is_static() {
            return Err(EmitError::NotStatic {
                site: site.display().to_owned(),
                molecule: self.core.display_name(),
            });
        }
        let value = self.core.volatile_read().ok_or_else(|| EmitError::NotStatic {
            site: site.display().to_owned(),
            molecule: self.core.display_name(),
        })?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| EmitError::NotStatic {
                site: site.display().to_owned(),
                molecule: self.core.display_name(),
            })
    }

    /// Human-readable dump of the owning site's bag.
    pub fn log_soup(&self) -> Result<String, EmitError> {
        Ok(self.core.bound_site()?.log_soup())
    }
}

impl<T: MolData> From<&Molecule<T>> for MoleculeRef {
    fn from(m: &Molecule<T>) -> MoleculeRef {
        MoleculeRef {
            core: m.core.clone(),
        }
    }
}

impl<T: MolData> fmt::Display for Molecule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.core.display_name())
    }
}

/// A blocking emitter: emission parks the calling thread until a consuming
/// reaction replies with an `R`, the optional timeout elapses, or the
/// reaction fails.
pub struct BlockingMolecule<T: MolData, R: Send + Sync + 'static> {
    core: Arc<MoleculeCore>,
    _value: PhantomData<fn(T) -> R>,
}

impl<T: MolData, R: Send + Sync + 'static> Clone for BlockingMolecule<T, R> {
    fn clone(&self) -> Self {
        BlockingMolecule {
            core: self.core.clone(),
            _value: PhantomData,
        }
    }
}

/// Creates an unbound blocking emitter.
pub fn blocking_molecule<T: MolData, R: Send + Sync + 'static>(
    name: &str,
) -> BlockingMolecule<T, R> {
    BlockingMolecule {
        core: MoleculeCore::new(name, MolKind::Blocking),
        _value: PhantomData,
    }
}

impl<T: MolData, R: Send + Sync + 'static> BlockingMolecule<T, R> {
    /// Emits and blocks until a reaction replies. Fails if the consuming
    /// reaction finishes without replying or throws.
    pub fn emit(&self, value: T) -> Result<R, EmitError> {
        match self.emit_inner(value, None)? {
            Some(reply) => Ok(reply),
            None => unreachable!("untimed blocking emission cannot time out"),
        }
    }

    /// Emits and blocks for at most `timeout`. On timeout the molecule is
    /// removed from the bag if no reaction has consumed it yet, and `None`
    /// is returned.
    pub fn emit_with_timeout(&self, value: T, timeout: Duration) -> Result<Option<R>, EmitError> {
        self.emit_inner(value, Some(timeout))
    }

    fn emit_inner(&self, value: T, timeout: Option<Duration>) -> Result<Option<R>, EmitError> {
        let site = self.core.bound_site()?;
        let slot = Arc::new(ReplySlot::<R>::new());
        let erased: Arc<dyn ErasedReply> = slot.clone();
        site::emit(&site, &self.core, MolValue::with_reply(value, erased.clone()))?;
        match slot.await_reply(timeout) {
            ReplyOutcome::Replied(reply) => Ok(Some(reply)),
            ReplyOutcome::TimedOut => {
                site.remove_timed_out(self.core.id, &erased);
                Ok(None)
            }
            ReplyOutcome::Failed(reason) => Err(EmitError::ReplyFailed {
                molecule: self.core.display_name(),
                reason,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_bound(&self) -> bool {
        self.core.is_bound()
    }

    pub fn log_soup(&self) -> Result<String, EmitError> {
        Ok(self.core.bound_site()?.log_soup())
    }
}

impl<T: MolData, R: Send + Sync + 'static> From<&BlockingMolecule<T, R>> for MoleculeRef {
    fn from(m: &BlockingMolecule<T, R>) -> MoleculeRef {
        MoleculeRef {
            core: m.core.clone(),
        }
    }
}

impl<T: MolData, R: Send + Sync + 'static> fmt::Display for BlockingMolecule<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.core.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_emit_is_rejected() {
        let m = molecule::<i32>("lonely");
        match m.emit(1) {
            Err(EmitError::Unbound(name)) => assert_eq!(name, "lonely"),
            other => panic!("expected unbound error, got {other:?}"),
        }
        assert!(!m.is_bound());
    }

    #[test]
    fn display_marks_blocking() {
        let m = molecule::<()>("a");
        let b = blocking_molecule::<(), i32>("f");
        assert_eq!(m.to_string(), "a");
        assert_eq!(b.to_string(), "f/B");
        assert_eq!(MoleculeRef::from(&b).to_string(), "f/B");
    }

    #[test]
    fn refs_share_identity() {
        let m = molecule::<i32>("x");
        let r1 = MoleculeRef::from(&m);
        let r2 = MoleculeRef::from(&m.clone());
        assert_eq!(r1, r2);
        let other = molecule::<i32>("x");
        assert_ne!(r1, MoleculeRef::from(&other));
    }
}
