//! Single-assignment cells recording per-transport initialization results.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::err::{Error, Result};

/// The state of one requested transport.
///
/// A slot starts out `Pending` and moves to exactly one of the other
/// states when the transport's stdout reports on it (or conspicuously
/// fails to).  Once terminal, a slot never changes again.
#[derive(Debug, Clone)]
pub(crate) enum Slot<T> {
    /// The transport has not been reported on yet.
    Pending,
    /// The transport initialized; carries its endpoint description.
    Ready(T),
    /// The transport failed to initialize; carries the error message.
    Failed(String),
    /// Initialization finished without mentioning this transport.
    Ignored,
}

/// The set of per-transport slots owned by one adapter.
///
/// Only the stdout-reading task resolves slots; API callers read them.
/// That single-writer rule is what makes "at most one transition" easy
/// to keep.
pub(crate) struct TransportMap<T> {
    /// All slots, keyed by transport name.
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone> TransportMap<T> {
    /// Create a map with a pending slot for every name in `names`.
    pub(crate) fn new<I>(names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let slots = names.into_iter().map(|n| (n, Slot::Pending)).collect();
        TransportMap {
            slots: Mutex::new(slots),
        }
    }

    /// Move the slot for `name` into the terminal state `value`.
    ///
    /// Reports on transports we never asked about are protocol
    /// violations.  A second report on an already-terminal slot is
    /// logged and otherwise ignored.
    pub(crate) fn resolve(&self, name: &str, value: Slot<T>) -> Result<()> {
        debug_assert!(!matches!(value, Slot::Pending));
        let mut slots = self.slots.lock().expect("poisoned lock");
        match slots.get_mut(name) {
            None => Err(Error::Protocol(format!(
                "PT reported on unrequested transport {:?}",
                name
            ))),
            Some(slot @ Slot::Pending) => {
                *slot = value;
                Ok(())
            }
            Some(_) => {
                warn!("PT reported on transport {:?} more than once", name);
                Ok(())
            }
        }
    }

    /// Mark every still-pending slot as ignored.
    ///
    /// Called when the `*METHODS DONE` line arrives.
    pub(crate) fn finish_pending(&self) {
        let mut slots = self.slots.lock().expect("poisoned lock");
        for slot in slots.values_mut() {
            if matches!(slot, Slot::Pending) {
                *slot = Slot::Ignored;
            }
        }
    }

    /// Look up the result for `name`.
    pub(crate) fn get(&self, name: &str) -> Result<T> {
        let slots = self.slots.lock().expect("poisoned lock");
        match slots.get(name) {
            None => Err(Error::NoSuchTransport(name.to_string())),
            Some(Slot::Pending) => Err(Error::TransportPending(name.to_string())),
            Some(Slot::Ready(value)) => Ok(value.clone()),
            Some(Slot::Failed(message)) => Err(Error::TransportFailed {
                name: name.to_string(),
                message: message.clone(),
            }),
            Some(Slot::Ignored) => Err(Error::TransportIgnored(name.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn map(names: &[&str]) -> TransportMap<u32> {
        TransportMap::new(names.iter().map(|n| n.to_string()))
    }

    #[test]
    fn transitions_are_single_assignment() {
        let m = map(&["obfs4"]);
        assert!(matches!(m.get("obfs4"), Err(Error::TransportPending(_))));

        m.resolve("obfs4", Slot::Ready(1)).unwrap();
        assert_eq!(m.get("obfs4").unwrap(), 1);

        // A second report must not clobber the first.
        m.resolve("obfs4", Slot::Failed("nope".into())).unwrap();
        assert_eq!(m.get("obfs4").unwrap(), 1);
    }

    #[test]
    fn unknown_transport_is_protocol_error() {
        let m = map(&["obfs4"]);
        assert!(matches!(
            m.resolve("meek", Slot::Ready(2)),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(m.get("meek"), Err(Error::NoSuchTransport(_))));
    }

    #[test]
    fn pending_becomes_ignored() {
        let m = map(&["a", "b"]);
        m.resolve("a", Slot::Ready(7)).unwrap();
        m.finish_pending();
        assert_eq!(m.get("a").unwrap(), 7);
        assert!(matches!(m.get("b"), Err(Error::TransportIgnored(_))));
    }

    #[test]
    fn failure_carries_message() {
        let m = map(&["obfs4"]);
        m.resolve("obfs4", Slot::Failed("no such transport".into()))
            .unwrap();
        match m.get("obfs4") {
            Err(Error::TransportFailed { name, message }) => {
                assert_eq!(name, "obfs4");
                assert_eq!(message, "no such transport");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
