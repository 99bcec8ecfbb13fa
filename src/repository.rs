use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sled::Db;
use tracing::debug;

use crate::error::{Error, Result};
use crate::share::Share;

/// Defines the Data Access Object (DAO) trait for share bundles.
///
/// A bundle is the list of shares one party holds for one computation, keyed by computation id.
/// Implementations must be safe to share between the listener task and anything else on the
/// node.
pub trait ShareBundleDao: Send + Sync {
    /// Stores (or replaces) the bundle for `computation_id`.
    fn insert(&self, computation_id: &str, shares: &[Share]) -> Result<()>;

    /// Retrieves the bundle for `computation_id`, or `None` if nothing is stored.
    fn get(&self, computation_id: &str) -> Result<Option<Vec<Share>>>;

    fn get_all(&self) -> Result<Vec<(String, Vec<Share>)>>;

    /// Deletes the bundle for `computation_id`. Deleting a missing id is not an error.
    fn delete(&self, computation_id: &str) -> Result<()>;
}

/// A `ShareBundleDao` implementation using Sled, an embedded database.
///
/// Bundles are stored as JSON so the on-disk format stays readable.
pub struct SledShareBundleDao {
    db: Db,
}

impl SledShareBundleDao {
    /// Opens (or creates) the sled database at `db_path`.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use smpcnet::repository::SledShareBundleDao;
    ///
    /// let dao = SledShareBundleDao::new("path/to/db").unwrap();
    /// ```
    pub fn new(db_path: &str) -> Result<Self> {
        let db = sled::open(db_path)?;
        Ok(SledShareBundleDao { db })
    }
}

impl ShareBundleDao for SledShareBundleDao {
    fn insert(&self, computation_id: &str, shares: &[Share]) -> Result<()> {
        let serialized =
            serde_json::to_vec(shares).map_err(|err| Error::Storage(err.to_string()))?;
        self.db.insert(computation_id, serialized)?;
        self.db.flush()?;
        Ok(())
    }

    fn get(&self, computation_id: &str) -> Result<Option<Vec<Share>>> {
        match self.db.get(computation_id)? {
            Some(found) => {
                let shares =
                    serde_json::from_slice(&found).map_err(|err| Error::Storage(err.to_string()))?;
                Ok(Some(shares))
            }
            None => Ok(None),
        }
    }

    fn get_all(&self) -> Result<Vec<(String, Vec<Share>)>> {
        let mut entries = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            let shares: Vec<Share> =
                serde_json::from_slice(&value).map_err(|err| Error::Storage(err.to_string()))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|err| Error::Storage(err.to_string()))?;
            entries.push((key, shares));
        }
        Ok(entries)
    }

    fn delete(&self, computation_id: &str) -> Result<()> {
        self.db.remove(computation_id)?;
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory `ShareBundleDao`; the default when no database path is configured.
#[derive(Default)]
pub struct HashMapShareBundleDao {
    map: Mutex<HashMap<String, Vec<Share>>>,
}

impl HashMapShareBundleDao {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Share>>>> {
        self.map
            .lock()
            .map_err(|_| Error::Storage("share map lock poisoned".to_string()))
    }
}

impl ShareBundleDao for HashMapShareBundleDao {
    fn insert(&self, computation_id: &str, shares: &[Share]) -> Result<()> {
        self.lock()?
            .insert(computation_id.to_string(), shares.to_vec());
        Ok(())
    }

    fn get(&self, computation_id: &str) -> Result<Option<Vec<Share>>> {
        Ok(self.lock()?.get(computation_id).cloned())
    }

    fn get_all(&self) -> Result<Vec<(String, Vec<Share>)>> {
        Ok(self
            .lock()?
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn delete(&self, computation_id: &str) -> Result<()> {
        self.lock()?.remove(computation_id);
        Ok(())
    }
}

/// Creates a DAO: sled when a path is given, otherwise an in-memory map.
pub fn dao(db_path: Option<&str>) -> Result<Arc<dyn ShareBundleDao>> {
    let dao: Arc<dyn ShareBundleDao> = match db_path {
        Some(path) => {
            debug!("Using Sled DB at {}", path);
            Arc::new(SledShareBundleDao::new(path)?)
        }
        None => {
            debug!("Using HashMap DB");
            Arc::new(HashMapShareBundleDao::default())
        }
    };
    Ok(dao)
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use super::*;

    fn bundle(party_id: u32) -> Vec<Share> {
        vec![
            Share::new(BigUint::from(10u32), party_id, 1),
            Share::new(BigUint::from(20u32), party_id, 2),
        ]
    }

    fn exercise(dao: &dyn ShareBundleDao) {
        dao.insert("alpha", &bundle(1)).unwrap();
        dao.insert("beta", &bundle(1)[..1]).unwrap();
        assert_eq!(dao.get("alpha").unwrap(), Some(bundle(1)));
        assert_eq!(dao.get("beta").unwrap().map(|b| b.len()), Some(1));
        assert_eq!(dao.get("gamma").unwrap(), None);

        let mut all = dao.get_all().unwrap();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "alpha");

        dao.delete("alpha").unwrap();
        assert_eq!(dao.get("alpha").unwrap(), None);
        assert!(dao.get("beta").unwrap().is_some());
        dao.delete("alpha").unwrap();
    }

    #[test]
    fn test_hashmap_dao() {
        exercise(&HashMapShareBundleDao::default());
    }

    #[test]
    fn test_sled_dao() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.db");
        let dao = SledShareBundleDao::new(path.to_str().unwrap()).unwrap();
        exercise(&dao);
    }

    #[test]
    fn test_dao_selection() {
        let memory = dao(None).unwrap();
        exercise(memory.as_ref());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selected.db");
        let sled = dao(path.to_str()).unwrap();
        sled.insert("persisted", &bundle(2)).unwrap();
        assert_eq!(sled.get("persisted").unwrap(), Some(bundle(2)));
        assert!(path.exists());
    }
}
