// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Catalog files are flat JSON arrays of records, loaded whole at startup.
//! A catalog that fails to load is a fatal startup error, never a runtime one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::{CharacterId, SystemId};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not read catalog file: {0}")]
    Read(#[from] std::io::Error),
    #[error("could not parse catalog file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A star system. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct System {
    pub system_id: SystemId,
    pub name: String,
    pub neighbours: BTreeSet<SystemId>,
}

/// A character. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Character {
    pub character_id: CharacterId,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct AccountRecord {
    username: String,
    character_id: CharacterId,
}

/// Load the universe graph from `universe.json`, keyed by system id.
pub fn load_universe(path: &Path) -> Result<BTreeMap<SystemId, System>, CatalogError> {
    let raw = std::fs::read_to_string(path)?;
    let records: Vec<System> = serde_json::from_str(&raw)?;
    let universe: BTreeMap<_, _> = records.into_iter().map(|s| (s.system_id, s)).collect();
    info!(systems = universe.len(), path = %path.display(), "universe catalog loaded");
    Ok(universe)
}

/// Load the character roster from `characters.json`, keyed by character id.
pub fn load_characters(path: &Path) -> Result<HashMap<CharacterId, Character>, CatalogError> {
    let raw = std::fs::read_to_string(path)?;
    let records: Vec<Character> = serde_json::from_str(&raw)?;
    let characters: HashMap<_, _> = records.into_iter().map(|c| (c.character_id, c)).collect();
    info!(characters = characters.len(), path = %path.display(), "character catalog loaded");
    Ok(characters)
}

/// Load the account directory from `accounts.json`: username to character id.
pub fn load_accounts(path: &Path) -> Result<HashMap<String, CharacterId>, CatalogError> {
    let raw = std::fs::read_to_string(path)?;
    let records: Vec<AccountRecord> = serde_json::from_str(&raw)?;
    let accounts: HashMap<_, _> = records
        .into_iter()
        .map(|a| (a.username, a.character_id))
        .collect();
    info!(accounts = accounts.len(), path = %path.display(), "account catalog loaded");
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    fn write_catalog(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn universe_round_trip() {
        let file = write_catalog(
            r#"[
                {"system_id": 1, "name": "Alpha", "neighbours": [2]},
                {"system_id": 2, "name": "Beta", "neighbours": [1]}
            ]"#,
        );
        let universe = load_universe(file.path()).unwrap();
        assert_eq!(universe.len(), 2);
        assert_eq!(universe[&1].name, "Alpha");
        assert_eq!(universe[&1].neighbours, BTreeSet::from([2]));
        assert_eq!(universe[&2].neighbours, BTreeSet::from([1]));
    }

    #[test]
    fn accounts_map_usernames() {
        let file = write_catalog(r#"[{"username": "userone", "character_id": 1001}]"#);
        let accounts = load_accounts(file.path()).unwrap();
        assert_eq!(accounts.get("userone"), Some(&1001));
        assert_eq!(accounts.get("usertwo"), None);
    }

    #[test]
    fn characters_keyed_by_id() {
        let file = write_catalog(
            r#"[
                {"character_id": 1001, "name": "Pilot1"},
                {"character_id": 1002, "name": "Pilot2"}
            ]"#,
        );
        let characters = load_characters(file.path()).unwrap();
        assert_eq!(characters[&1001].name, "Pilot1");
        assert_eq!(characters[&1002].name, "Pilot2");
    }

    #[test]
    fn malformed_catalog_is_an_error() {
        let file = write_catalog(r#"{"not": "an array"}"#);
        assert!(load_universe(file.path()).is_err());
    }

    #[test]
    fn missing_catalog_is_an_error() {
        assert!(load_accounts(Path::new("/nonexistent/accounts.json")).is_err());
    }
}
