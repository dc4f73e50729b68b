//! Frontend registry.
//!
//! Mirrors a C frontend registry header's two-level socket↔proxy /
//! session-id↔socket index, and the session-drop callback fired for every
//! session under a proxy that gets unregistered.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

pub type SocketId = u64;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("socket is already registered as a proxy")]
    SocketInUse,
    #[error("no proxy registered for this socket")]
    UnknownProxy,
    #[error("session id is already registered")]
    SessionInUse,
    #[error("no session with this id")]
    UnknownSession,
}

struct ProxyRecord {
    uuid: String,
    sessions: HashSet<String>,
}

/// Two-level index: socket→proxy and session-id→socket.
pub struct FrontendRegistry {
    proxies: HashMap<SocketId, ProxyRecord>,
    session_to_socket: HashMap<String, SocketId>,
    on_session_drop: Option<Box<dyn FnMut(&str) + Send>>,
}

impl Default for FrontendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontendRegistry {
    pub fn new() -> Self {
        FrontendRegistry {
            proxies: HashMap::new(),
            session_to_socket: HashMap::new(),
            on_session_drop: None,
        }
    }

    pub fn set_on_session_drop(&mut self, cb: impl FnMut(&str) + Send + 'static) {
        self.on_session_drop = Some(Box::new(cb));
    }

    pub fn register_proxy(&mut self, socket: SocketId, uuid: impl Into<String>) -> Result<(), RegistryError> {
        if self.proxies.contains_key(&socket) {
            return Err(RegistryError::SocketInUse);
        }
        self.proxies.insert(socket, ProxyRecord { uuid: uuid.into(), sessions: HashSet::new() });
        Ok(())
    }

    /// Tear down every session under `socket`, firing the session-drop
    /// callback for each, in no particular order.
    pub fn unregister_proxy(&mut self, socket: SocketId) -> Result<(), RegistryError> {
        let record = self.proxies.remove(&socket).ok_or(RegistryError::UnknownProxy)?;
        for session in &record.sessions {
            self.session_to_socket.remove(session);
            if let Some(cb) = &mut self.on_session_drop {
                cb(session);
            }
        }
        Ok(())
    }

    pub fn register_session(&mut self, socket: SocketId, session: impl Into<String>) -> Result<(), RegistryError> {
        let session = session.into();
        if self.session_to_socket.contains_key(&session) {
            return Err(RegistryError::SessionInUse);
        }
        let record = self.proxies.get_mut(&socket).ok_or(RegistryError::UnknownProxy)?;
        record.sessions.insert(session.clone());
        self.session_to_socket.insert(session, socket);
        Ok(())
    }

    pub fn unregister_session(&mut self, session: &str) -> Result<(), RegistryError> {
        let socket = self.session_to_socket.remove(session).ok_or(RegistryError::UnknownSession)?;
        if let Some(record) = self.proxies.get_mut(&socket) {
            record.sessions.remove(session);
        }
        Ok(())
    }

    pub fn get_proxy_socket(&self, session: &str) -> Option<SocketId> {
        self.session_to_socket.get(session).copied()
    }

    pub fn load(&self, socket: SocketId) -> Option<usize> {
        self.proxies.get(&socket).map(|r| r.sessions.len())
    }

    pub fn proxy_uuid(&self, socket: SocketId) -> Option<&str> {
        self.proxies.get(&socket).map(|r| r.uuid.as_str())
    }

    /// The one session under `socket`, if it has exactly one. Used to route
    /// a proxy's bare, session-less push notification (it names no session
    /// of its own) without guessing across a proxy serving several calls.
    pub fn single_session_of(&self, socket: SocketId) -> Option<&str> {
        let record = self.proxies.get(&socket)?;
        if record.sessions.len() == 1 {
            record.sessions.iter().next().map(|s| s.as_str())
        } else {
            None
        }
    }

    /// The registered proxy with the smallest load; ties broken by lowest
    /// socket handle. `None` if no proxy is registered.
    pub fn select_proxy(&self) -> Option<SocketId> {
        self.proxies
            .iter()
            .map(|(&socket, record)| (record.sessions.len(), socket))
            .min()
            .map(|(_, socket)| socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_proxy_on_empty_registry_returns_none() {
        let registry = FrontendRegistry::new();
        assert_eq!(registry.select_proxy(), None);
    }

    #[test]
    fn select_proxy_picks_smallest_load_breaking_ties_by_socket() {
        let mut registry = FrontendRegistry::new();
        registry.register_proxy(2, "p2").unwrap();
        registry.register_proxy(1, "p1").unwrap();
        assert_eq!(registry.select_proxy(), Some(1));

        registry.register_session(1, "s-1").unwrap();
        assert_eq!(registry.select_proxy(), Some(2));
    }

    #[test]
    fn unregister_proxy_drops_every_session_and_notifies() {
        use std::sync::{Arc, Mutex};

        let dropped = Arc::new(Mutex::new(Vec::new()));
        let dropped2 = dropped.clone();
        let mut registry = FrontendRegistry::new();
        registry.set_on_session_drop(move |s| dropped2.lock().unwrap().push(s.to_string()));
        registry.register_proxy(1, "p1").unwrap();
        registry.register_session(1, "s-1").unwrap();
        registry.register_session(1, "s-2").unwrap();

        registry.unregister_proxy(1).unwrap();

        let mut seen = dropped.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["s-1".to_string(), "s-2".to_string()]);
        assert_eq!(registry.get_proxy_socket("s-1"), None);
        assert_eq!(registry.select_proxy(), None);
    }

    #[test]
    fn load_equals_session_count_invariant() {
        let mut registry = FrontendRegistry::new();
        registry.register_proxy(1, "p1").unwrap();
        registry.register_session(1, "s-1").unwrap();
        registry.register_session(1, "s-2").unwrap();
        assert_eq!(registry.load(1), Some(2));
        registry.unregister_session("s-1").unwrap();
        assert_eq!(registry.load(1), Some(1));
    }

    #[test]
    fn single_session_of_is_none_when_zero_or_many_sessions() {
        let mut registry = FrontendRegistry::new();
        registry.register_proxy(1, "p1").unwrap();
        assert_eq!(registry.single_session_of(1), None);
        registry.register_session(1, "s-1").unwrap();
        assert_eq!(registry.single_session_of(1), Some("s-1"));
        registry.register_session(1, "s-2").unwrap();
        assert_eq!(registry.single_session_of(1), None);
    }

    #[test]
    fn duplicate_session_id_is_rejected() {
        let mut registry = FrontendRegistry::new();
        registry.register_proxy(1, "p1").unwrap();
        registry.register_session(1, "s-1").unwrap();
        assert_eq!(registry.register_session(1, "s-1"), Err(RegistryError::SessionInUse));
    }
}
