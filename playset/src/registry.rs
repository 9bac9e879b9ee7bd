//! An explicit playset registry, passed by the server to whatever code wires
//! up playsets at startup (§4.H, §9).
//!
//! The reference relay server's games register themselves into a single
//! ambient ("global") table built at compile time. §9 calls that pattern out
//! explicitly and asks for an owned, explicit registry instead — so this is a
//! plain struct the top-level server constructs and holds, not a `static`.

use crate::Playset;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps playset name -> playset implementation.
#[derive(Default)]
pub struct PlaysetRegistry {
    playsets: HashMap<String, Arc<dyn Playset>>,
}

impl PlaysetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a playset under its own [`Playset::name`]. Overwrites any
    /// prior registration under the same name (last registration wins).
    pub fn register(&mut self, playset: Arc<dyn Playset>) {
        self.playsets.insert(playset.name().to_string(), playset);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Playset>> {
        self.playsets.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.playsets.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandEvent, ConnectEvent, ControllerInput, DisconnectEvent};
    use serde_json::Value;

    struct Stub(&'static str);
    impl Playset for Stub {
        fn name(&self) -> &str {
            self.0
        }
        fn advance(
            &self,
            _state: &mut Value,
            _connects: &[ConnectEvent],
            _commands: &[CommandEvent],
            _inputs: &[ControllerInput],
            _disconnects: &[DisconnectEvent],
        ) {
        }
        fn initial_state(&self) -> Value {
            Value::Null
        }
    }

    #[test]
    fn registers_and_looks_up_by_name() {
        let mut registry = PlaysetRegistry::new();
        registry.register(Arc::new(Stub("testgame1")));
        assert!(registry.get("testgame1").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn later_registration_overwrites_earlier_same_name() {
        let mut registry = PlaysetRegistry::new();
        registry.register(Arc::new(Stub("dup")));
        registry.register(Arc::new(Stub("dup")));
        assert_eq!(registry.names(), vec!["dup"]);
    }
}
