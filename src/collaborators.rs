//! Read-only adapters over the product database.
//!
//! The scheduler does not own membership or selection data; it reads the
//! product's SQLite database (tables `pack_members(pack_id, user_id)` and
//! `selections(user_id, day)`) through the collaborator traits.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::Membership;
use nudge_scheduler::SelectionLedger;
use rusqlite::{Connection, OpenFlags};

/// Product database opened read-only.
pub struct ProductDb {
    conn: Mutex<Connection>,
}

impl ProductDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| NudgeError::Database(format!("Product DB open: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| NudgeError::Database("product DB lock poisoned".into()))
    }
}

#[async_trait]
impl Membership for ProductDb {
    async fn members_of(&self, pack_ids: &[String]) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT user_id FROM pack_members WHERE pack_id = ?1")
            .map_err(|e| NudgeError::Database(format!("Pack query: {e}")))?;

        let mut members = Vec::new();
        for pack_id in pack_ids {
            let rows = stmt
                .query_map([pack_id], |row| row.get::<_, String>(0))
                .map_err(|e| NudgeError::Database(format!("Pack query: {e}")))?;
            for row in rows {
                members.push(row.map_err(|e| NudgeError::Database(format!("Pack query: {e}")))?);
            }
        }
        Ok(members)
    }
}

#[async_trait]
impl SelectionLedger for ProductDb {
    async fn unselected_on(&self, user_ids: &[String], day: NaiveDate) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT user_id FROM selections WHERE day = ?1")
            .map_err(|e| NudgeError::Database(format!("Selection query: {e}")))?;
        let rows = stmt
            .query_map([day.to_string()], |row| row.get::<_, String>(0))
            .map_err(|e| NudgeError::Database(format!("Selection query: {e}")))?;

        let mut selected = HashSet::new();
        for row in rows {
            selected
                .insert(row.map_err(|e| NudgeError::Database(format!("Selection query: {e}")))?);
        }
        Ok(user_ids
            .iter()
            .filter(|id| !selected.contains(*id))
            .cloned()
            .collect())
    }
}

/// Fallback when no product database is configured: packs resolve to no
/// members and every targeted user counts as unselected.
pub struct NoProductData;

#[async_trait]
impl Membership for NoProductData {
    async fn members_of(&self, _pack_ids: &[String]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl SelectionLedger for NoProductData {
    async fn unselected_on(&self, user_ids: &[String], _day: NaiveDate) -> Result<Vec<String>> {
        Ok(user_ids.to_vec())
    }
}
