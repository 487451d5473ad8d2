use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::reply::ErasedReply;

/// Payload types carried by molecules.
///
/// Blanket-implemented for every `'static` value that is sendable,
/// debug-printable and comparable. The trait erases the concrete type while
/// keeping dynamic equality, which the bag needs for `count(e, v)` and the
/// matcher needs for constant patterns.
pub trait MolData: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn MolData) -> bool;
}

impl<T: Any + Send + Sync + fmt::Debug + PartialEq> MolData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn MolData) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

impl dyn MolData {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// One message in a site's bag: the payload plus, for blocking emitters, the
/// reply slot of the waiting caller. Immutable once constructed; cloning is
/// cheap (both halves are reference counted).
#[derive(Clone)]
pub struct MolValue {
    payload: Arc<dyn MolData>,
    reply: Option<Arc<dyn ErasedReply>>,
}

impl MolValue {
    pub fn new<T: MolData>(payload: T) -> MolValue {
        MolValue {
            payload: Arc::new(payload),
            reply: None,
        }
    }

    pub(crate) fn with_reply<T: MolData>(payload: T, reply: Arc<dyn ErasedReply>) -> MolValue {
        MolValue {
            payload: Arc::new(payload),
            reply: Some(reply),
        }
    }

    pub fn payload(&self) -> &dyn MolData {
        &*self.payload
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    pub fn payload_eq(&self, other: &dyn MolData) -> bool {
        self.payload.eq_dyn(other)
    }

    pub(crate) fn reply_slot(&self) -> Option<&Arc<dyn ErasedReply>> {
        self.reply.as_ref()
    }

    /// Whether this value and `other` wrap the same reply slot. Used to find
    /// a timed-out blocking molecule in the bag without comparing payloads.
    pub(crate) fn same_reply_slot(&self, slot: &Arc<dyn ErasedReply>) -> bool {
        self.reply
            .as_ref()
            .is_some_and(|own| Arc::ptr_eq(own, slot))
    }
}

/// Renders a payload the way soup dumps and error messages show it: the
/// `Debug` form with string quotes stripped and the unit value elided, so
/// `d("ok")` prints as `d(ok)` and `a(())` as `a()`.
pub(crate) fn fmt_payload(value: &dyn MolData) -> String {
    let rendered = format!("{value:?}");
    if rendered == "()" {
        return String::new();
    }
    if rendered.len() >= 2 && rendered.starts_with('"') && rendered.ends_with('"') {
        return rendered[1..rendered.len() - 1].to_owned();
    }
    rendered
}

impl fmt::Display for MolValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&fmt_payload(&*self.payload))
    }
}

impl fmt::Debug for MolValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MolValue({:?})", self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_equality() {
        let a = MolValue::new(5i32);
        assert!(a.payload_eq(&5i32));
        assert!(!a.payload_eq(&6i32));
        // a different type never compares equal, even with the same debug form
        assert!(!a.payload_eq(&5i64));
    }

    #[test]
    fn payload_rendering() {
        assert_eq!(fmt_payload(&5i32), "5");
        assert_eq!(fmt_payload(&"ok".to_owned()), "ok");
        assert_eq!(fmt_payload(&()), "");
        assert_eq!(fmt_payload(&(1, 2)), "(1, 2)");
    }

    #[test]
    fn downcast() {
        let v = MolValue::new("text".to_owned());
        assert_eq!(v.downcast_ref::<String>().unwrap(), "text");
        assert!(v.downcast_ref::<i32>().is_none());
    }
}
