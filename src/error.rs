use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::error;

/// Errors raised while constructing a reaction site. These abort
/// construction synchronously; nothing is bound or seeded when they are
/// returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("In {site}: molecule {molecule} cannot be bound because it is already bound to {bound_to}")]
    MoleculeAlreadyBound {
        molecule: String,
        site: String,
        bound_to: String,
    },
    /// The static analyzer rejected the declared chemistry.
    #[error("In {site}: {message}")]
    RejectedChemistry { site: String, message: String },
    #[error("In {site}: static reaction {reaction} failed while seeding: {message}")]
    SeedingFailed {
        site: String,
        reaction: String,
        message: String,
    },
    #[error("In {site}: static reaction {reaction} finished without emitting {molecules}")]
    IncompleteSeeding {
        site: String,
        reaction: String,
        molecules: String,
    },
}

/// Errors raised by an emit call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("Molecule {0} is not bound to any reaction site")]
    Unbound(String),
    #[error("In {site}: Refusing to emit static molecule {molecule} because this thread does not run a chemical reaction")]
    StaticFromNonReaction { site: String, molecule: String },
    #[error("In {site}: Refusing to emit static molecule {molecule} because this reaction has already emitted it")]
    StaticAlreadyEmitted { site: String, molecule: String },
    #[error("In {site}: Some reactions have unbound output molecules: {molecules}")]
    UnboundOutputs { site: String, molecules: String },
    /// The consuming reaction failed or finished without replying; the
    /// reason carries the full failure message.
    #[error("Molecule {molecule} received no reply: {reason}")]
    ReplyFailed { molecule: String, reason: String },
    #[error("In {site}: volatile reader requested for non-static molecule {molecule}")]
    NotStatic { site: String, molecule: String },
}

/// A structured record of one failed reaction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionFailure {
    pub site: String,
    pub reaction: String,
    pub inputs: String,
    pub message: String,
}

/// Append-only sink for reaction failures. The scheduler never propagates
/// a body failure to the emitting thread; it lands here (and, for blocking
/// inputs, in the waiter's reply slot).
///
/// Sites use the process-wide [`ErrorLog::global`] sink unless one is
/// injected through the site builder.
#[derive(Default)]
pub struct ErrorLog {
    entries: Mutex<Vec<ReactionFailure>>,
}

impl ErrorLog {
    pub fn new() -> Arc<ErrorLog> {
        Arc::new(ErrorLog::default())
    }

    pub fn global() -> &'static Arc<ErrorLog> {
        static GLOBAL: OnceLock<Arc<ErrorLog>> = OnceLock::new();
        GLOBAL.get_or_init(ErrorLog::new)
    }

    pub(crate) fn record(&self, failure: ReactionFailure) {
        error!(
            site = %failure.site,
            reaction = %failure.reaction,
            inputs = %failure.inputs,
            "{}",
            failure.message
        );
        self.entries.lock().push(failure);
    }

    pub fn snapshot(&self) -> Vec<ReactionFailure> {
        self.entries.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_appends_and_clears() {
        let log = ErrorLog::new();
        assert!(log.is_empty());
        log.record(ReactionFailure {
            site: "Site{a => ...}".to_owned(),
            reaction: "{a(_) => }".to_owned(),
            inputs: "[a()]".to_owned(),
            message: "boom".to_owned(),
        });
        let entries = log.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "boom");
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn emit_error_messages_follow_the_contract() {
        let unbound = EmitError::Unbound("a".to_owned());
        assert_eq!(
            unbound.to_string(),
            "Molecule a is not bound to any reaction site"
        );
        let refused = EmitError::StaticFromNonReaction {
            site: "Site{c/B + d => ...; _ => ...}".to_owned(),
            molecule: "d(bad)".to_owned(),
        };
        assert_eq!(
            refused.to_string(),
            "In Site{c/B + d => ...; _ => ...}: Refusing to emit static molecule d(bad) \
             because this thread does not run a chemical reaction"
        );
    }
}
