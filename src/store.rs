use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attendance::Subject;
use crate::payment::Transaction;
use crate::uploads::PyqEntry;

const DB_FILE: &str = "db.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize database: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    Poisoned,
}

/// A registered application user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,

    #[serde(default, alias = "name")]
    pub full_name: String,

    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub college: Option<String>,

    /// Argon2 PHC string; `None` for accounts created through Google
    #[serde(default)]
    pub password_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_id: Option<String>,

    #[serde(default)]
    pub subjects: Vec<Subject>,

    /// Browser push subscription, stored as sent by the client
    #[serde(default)]
    pub push_subscription: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
}

/// Whole on-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Db {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub pyqs: Vec<PyqEntry>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Db {
    pub fn user(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn user_mut(&mut self, id: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        self.users.iter().find(|u| u.email.eq_ignore_ascii_case(email))
    }

    /// Sign-in lookup: the identifier may be either an e-mail or a phone number
    pub fn user_by_login(&self, email_or_phone: &str) -> Option<&User> {
        self.users.iter().find(|u| {
            u.email.eq_ignore_ascii_case(email_or_phone)
                || u.phone.as_deref() == Some(email_or_phone)
        })
    }

    pub fn user_by_google_id_mut(&mut self, google_id: &str) -> Option<&mut User> {
        self.users
            .iter_mut()
            .find(|u| u.google_id.as_deref() == Some(google_id))
    }

    /// True if the e-mail, or the phone when given, already belongs to someone
    pub fn identity_taken(&self, email: &str, phone: Option<&str>) -> bool {
        self.users.iter().any(|u| {
            u.email.eq_ignore_ascii_case(email)
                || matches!((phone, u.phone.as_deref()), (Some(p), Some(q)) if p == q)
        })
    }

    pub fn transaction_mut(&mut self, merchant_transaction_id: &str) -> Option<&mut Transaction> {
        self.transactions
            .iter_mut()
            .find(|t| t.merchant_transaction_id == merchant_transaction_id)
    }
}

/// JSON-file database
///
/// Every access goes through one mutex. Writes go to a sibling temp file that
/// is renamed over `db.json`, so a crash mid-write leaves the old document.
pub struct Database {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Database {
    /// Open (creating if needed) `db.json` inside `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let db = Database {
            path: dir.join(DB_FILE),
            lock: Mutex::new(()),
        };
        if !db.path.exists() {
            db.persist(&Db::default())?;
        }
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Db, StoreError> {
        let contents = fs::read_to_string(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn persist(&self, db: &Db) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(db)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Run a read-only query against the current document
    pub fn read<T, E>(&self, f: impl FnOnce(&Db) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let db = self.load()?;
        f(&db)
    }

    /// Run a mutation; the document is saved only if `f` succeeds
    pub fn write<T, E>(&self, f: impl FnOnce(&mut Db) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut db = self.load()?;
        let out = f(&mut db)?;
        self.persist(&db)?;
        Ok(out)
    }
}
