//! Role selection: stable assignment of a named role to one server.
//!
//! A fresh decision hashes the role name onto the server list. Once made,
//! a decision is persisted in `other-selectors.json` and always wins over
//! the hash, so adding servers never moves a role. Removing the file is
//! the only way to reset them.

use crate::error::{Error, Result};
use crate::types::ServerRecord;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key in a module's output that carries selector decisions
pub const SELECTOR_KEY: &str = "selector";

/// Config name of the persisted decisions (`other-selectors.json`)
pub const SELECTORS_CONFIG: &str = "selectors.json";

/// Role name to server name
pub type Selections = BTreeMap<String, String>;

/// Outcome of picking a server for a role
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Choice<'s> {
    /// An earlier decision was found
    Persisted(&'s ServerRecord),
    /// A new decision, to be recorded
    Fresh(&'s ServerRecord),
}

impl<'s> Choice<'s> {
    pub fn server(&self) -> &'s ServerRecord {
        match self {
            Self::Persisted(server) | Self::Fresh(server) => server,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

/// Index of the server a fresh decision lands on: the sum of the role's
/// UTF-8 bytes, modulo the server count
pub fn hash_index(role: &str, count: usize) -> usize {
    role.bytes().map(usize::from).sum::<usize>() % count
}

/// Pick the server for `role`, preferring a persisted decision
pub fn choose<'s>(
    role: &str,
    servers: &'s [ServerRecord],
    persisted: &Selections,
) -> Result<Choice<'s>> {
    if servers.is_empty() {
        return Err(Error::NoServers { role: role.into() });
    }

    if let Some(name) = persisted.get(role) {
        return servers
            .iter()
            .find(|s| &s.name == name)
            .map(Choice::Persisted)
            .ok_or_else(|| Error::Selector {
                role: role.into(),
                message: format!(
                    "{name} was selected earlier but is no longer in the inventory; \
                     remove the entry from other-selectors.json to choose again"
                ),
            });
    }

    Ok(Choice::Fresh(&servers[hash_index(role, servers.len())]))
}

/// Return data announcing a fresh decision
pub fn decision_data(role: &str, server: &str) -> Value {
    let mut decision = Map::new();
    decision.insert(role.to_string(), Value::String(server.to_string()));
    let mut data = Map::new();
    data.insert(SELECTOR_KEY.to_string(), Value::Object(decision));
    Value::Object(data)
}

/// Selector decisions carried by a module output, if any
pub fn decisions_in(output: &Value) -> Selections {
    output
        .get(SELECTOR_KEY)
        .and_then(Value::as_object)
        .map(|decisions| {
            decisions
                .iter()
                .filter_map(|(role, server)| {
                    server.as_str().map(|s| (role.clone(), s.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn servers(names: &[&str]) -> Vec<ServerRecord> {
        names.iter().map(|n| ServerRecord::named(*n)).collect()
    }

    #[test]
    fn test_hash_index() {
        // 'a' + 'b' = 97 + 98
        assert_eq!(hash_index("ab", 2), 195 % 2);
        assert_eq!(hash_index("ab", 1), 0);
        assert_eq!(hash_index("", 3), 0);
    }

    #[test]
    fn test_fresh_choice_is_deterministic() {
        let pool = servers(&["foo", "bar", "baz"]);
        let first = choose("db", &pool, &Selections::new()).unwrap();
        let second = choose("db", &pool, &Selections::new()).unwrap();
        assert!(first.is_fresh());
        assert_eq!(first.server().name, second.server().name);
        assert_eq!(first.server().name, pool[hash_index("db", 3)].name);
    }

    #[test]
    fn test_persisted_choice_survives_inventory_growth() {
        let small = servers(&["foo", "bar"]);
        let picked = choose("db", &small, &Selections::new())
            .unwrap()
            .server()
            .name
            .clone();

        let mut persisted = Selections::new();
        persisted.insert("db".into(), picked.clone());

        let grown = servers(&["foo", "bar", "baz", "qux", "quux"]);
        let again = choose("db", &grown, &persisted).unwrap();
        assert!(!again.is_fresh());
        assert_eq!(again.server().name, picked);
    }

    #[test]
    fn test_persisted_server_removed() {
        let mut persisted = Selections::new();
        persisted.insert("db".into(), "gone".into());
        let err = choose("db", &servers(&["foo"]), &persisted).unwrap_err();
        assert!(err.to_string().contains("gone was selected earlier"));
    }

    #[test]
    fn test_no_servers() {
        let err = choose("db", &[], &Selections::new()).unwrap_err();
        assert!(matches!(err, Error::NoServers { .. }));
    }

    #[test]
    fn test_decisions_in_output() {
        let output = json!({"selector": {"db": "foo", "bad": 3}, "other": 1});
        let decisions = decisions_in(&output);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions["db"], "foo");

        assert!(decisions_in(&json!({"x": 1})).is_empty());
        assert!(decisions_in(&Value::Null).is_empty());
        assert_eq!(decisions_in(&decision_data("db", "bar"))["db"], "bar");
    }
}
