use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::model::election::{Election, ElectionState};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Failed to read election file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse election file: {0}")]
    Parse(#[from] rocket::serde::json::serde_json::Error),
    #[error("Duplicate election id `{0}`")]
    Duplicate(String),
}

/// Read-only source of election metadata.
#[rocket::async_trait]
pub trait ElectionDirectory: Send + Sync {
    async fn get(&self, election_id: &str) -> Option<Election>;
}

/// Election metadata held in memory, optionally loaded from a JSON file
/// containing an array of elections.
#[derive(Clone, Default)]
pub struct MemElections {
    elections: Arc<RwLock<HashMap<String, Election>>>,
}

impl MemElections {
    pub fn new(elections: impl IntoIterator<Item = Election>) -> Result<Self, DirectoryError> {
        let mut map = HashMap::new();
        for election in elections {
            if map.contains_key(&election.id) {
                return Err(DirectoryError::Duplicate(election.id));
            }
            map.insert(election.id.clone(), election);
        }
        Ok(Self {
            elections: Arc::new(RwLock::new(map)),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let contents = std::fs::read_to_string(path)?;
        let elections: Vec<Election> = rocket::serde::json::from_str(&contents)?;
        Self::new(elections)
    }

    /// Move an election to a new lifecycle state. Returns false if unknown.
    pub fn set_state(&self, election_id: &str, state: ElectionState) -> bool {
        match self
            .elections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(election_id)
        {
            Some(election) => {
                election.state = state;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.elections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[rocket::async_trait]
impl ElectionDirectory for MemElections {
    async fn get(&self, election_id: &str) -> Option<Election> {
        self.elections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(election_id)
            .cloned()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[rocket::async_test]
    async fn lookup_and_update() {
        let elections = MemElections::example();
        assert_eq!(elections.len(), 3);
        assert_eq!(
            elections.get("E1").await.map(|e| e.state),
            Some(ElectionState::Open)
        );
        assert!(elections.get("E9").await.is_none());

        assert!(elections.set_state("E1", ElectionState::Closed));
        assert_eq!(
            elections.get("E1").await.map(|e| e.state),
            Some(ElectionState::Closed)
        );
        assert!(!elections.set_state("E9", ElectionState::Closed));
    }

    #[test]
    fn duplicates_rejected() {
        let result = MemElections::new([Election::current_example(), Election::current_example()]);
        assert!(matches!(result, Err(DirectoryError::Duplicate(id)) if id == "E1"));
    }

    #[test]
    fn load_from_json() {
        let path = std::env::temp_dir().join(format!("elections-{}.json", rand::random::<u32>()));
        let json =
            rocket::serde::json::to_string(&vec![Election::current_example()]).unwrap();
        std::fs::write(&path, json).unwrap();
        let elections = MemElections::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(elections.len(), 1);
    }
}
