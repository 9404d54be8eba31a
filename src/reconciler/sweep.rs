//! Mark-and-sweep convergence against a declarative row store.
//!
//! Desired state arrives as groups of rows that belong together (a switch
//! and its ports, a router and its router ports). Rows already present are
//! tagged with the current generation marker instead of being rewritten.
//! Groups that are only partly present are destroyed and recreated whole.
//! A final sweep destroys every row that does not carry the marker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::MarkerHasher;
use crate::error::{Result, StoreError};

/// External-ids key holding the generation marker.
pub const MARKER_KEY: &str = "stratus-generation";

/// Row tables of the declarative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    /// Logical switch.
    LogicalSwitch,
    /// Named logical switch port.
    SwitchPort,
    /// Logical router.
    LogicalRouter,
    /// Logical router port.
    RouterPort,
    /// Access control rule.
    Acl,
}

impl RowKind {
    /// Rows whose name is unique within the table, so a lookup by name
    /// finds an outdated version of a desired row.
    #[must_use]
    pub const fn falls_back_to_name(self) -> bool {
        matches!(self, Self::SwitchPort)
    }
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LogicalSwitch => "logical_switch",
            Self::SwitchPort => "switch_port",
            Self::LogicalRouter => "logical_router",
            Self::RouterPort => "router_port",
            Self::Acl => "acl",
        };
        write!(f, "{s}")
    }
}

/// A row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Store-assigned identifier.
    pub uuid: String,
    /// Table.
    pub kind: RowKind,
    /// Row name; may be empty for anonymous rows.
    pub name: String,
    /// Column values.
    pub columns: BTreeMap<String, String>,
    /// Bookkeeping key/values, including the generation marker.
    pub external_ids: BTreeMap<String, String>,
}

impl Row {
    /// The generation marker carried by the row, if any.
    #[must_use]
    pub fn marker(&self) -> Option<&str> {
        self.external_ids.get(MARKER_KEY).map(String::as_str)
    }
}

/// A row as described by desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredRow {
    /// Table.
    pub kind: RowKind,
    /// Row name; empty means "any".
    pub name: String,
    /// Column values; empty values mean "any".
    pub columns: BTreeMap<String, String>,
}

impl DesiredRow {
    /// Creates a desired row with no column constraints.
    #[must_use]
    pub fn new(kind: RowKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            columns: BTreeMap::new(),
        }
    }

    /// Adds a column constraint.
    #[must_use]
    pub fn column(mut self, key: &str, value: &str) -> Self {
        self.columns.insert(key.to_string(), value.to_string());
        self
    }

    /// Returns true if every non-empty field of `self` equals the row's.
    #[must_use]
    pub fn matches_non_zeros(&self, row: &Row) -> bool {
        self.kind == row.kind
            && (self.name.is_empty() || self.name == row.name)
            && self
                .columns
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .all(|(k, v)| row.columns.get(k) == Some(v))
    }
}

/// Operations the convergence pass needs from a declarative store.
#[async_trait]
pub trait DeclarativeStore: Send + Sync {
    /// First row matching every non-empty field of `desired`.
    async fn find_one_match_non_zeros(&self, desired: &DesiredRow) -> Result<Option<Row>>;

    /// Row of `kind` named `name`.
    async fn find_by_name(&self, kind: RowKind, name: &str) -> Result<Option<Row>>;

    /// Tags a row with a generation marker.
    async fn set_marker(&self, uuid: &str, marker: &str) -> Result<()>;

    /// Destroys rows; unknown identifiers are ignored.
    async fn destroy(&self, uuids: &[String]) -> Result<()>;

    /// Creates a row tagged with `marker`.
    async fn create(&self, desired: &DesiredRow, marker: &str) -> Result<Row>;

    /// All rows.
    async fn rows(&self) -> Result<Vec<Row>>;
}

/// In-process declarative store.
#[derive(Debug, Default)]
pub struct MemoryDeclarativeStore {
    rows: RwLock<BTreeMap<String, Row>>,
}

impl MemoryDeclarativeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an untagged row, as if created by some other writer.
    pub async fn seed(&self, desired: &DesiredRow) -> Row {
        let row = Row {
            uuid: uuid::Uuid::new_v4().to_string(),
            kind: desired.kind,
            name: desired.name.clone(),
            columns: desired.columns.clone(),
            external_ids: BTreeMap::new(),
        };
        self.rows.write().await.insert(row.uuid.clone(), row.clone());
        row
    }
}

#[async_trait]
impl DeclarativeStore for MemoryDeclarativeStore {
    async fn find_one_match_non_zeros(&self, desired: &DesiredRow) -> Result<Option<Row>> {
        let rows = self.rows.read().await;
        Ok(rows.values().find(|r| desired.matches_non_zeros(r)).cloned())
    }

    async fn find_by_name(&self, kind: RowKind, name: &str) -> Result<Option<Row>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .find(|r| r.kind == kind && r.name == name)
            .cloned())
    }

    async fn set_marker(&self, uuid: &str, marker: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(uuid)
            .ok_or_else(|| StoreError::not_found("row", uuid))?;
        row.external_ids
            .insert(MARKER_KEY.to_string(), marker.to_string());
        Ok(())
    }

    async fn destroy(&self, uuids: &[String]) -> Result<()> {
        let mut rows = self.rows.write().await;
        for uuid in uuids {
            rows.remove(uuid);
        }
        Ok(())
    }

    async fn create(&self, desired: &DesiredRow, marker: &str) -> Result<Row> {
        let row = Row {
            uuid: uuid::Uuid::new_v4().to_string(),
            kind: desired.kind,
            name: desired.name.clone(),
            columns: desired.columns.clone(),
            external_ids: BTreeMap::from([(MARKER_KEY.to_string(), marker.to_string())]),
        };
        self.rows.write().await.insert(row.uuid.clone(), row.clone());
        Ok(row)
    }

    async fn rows(&self) -> Result<Vec<Row>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }
}

/// Result of marking one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkOutcome {
    /// Every desired row was found.
    pub all_found: bool,
    /// Rows to destroy before the group is recreated; empty when complete.
    pub destroy: Vec<String>,
}

/// Marks the rows of one group that already exist.
///
/// Found rows are marked even when the group is incomplete so that a sweep
/// running before the group is recreated leaves them alone. For kinds that
/// fall back to name lookup, an existing row with the desired name but
/// different content is scheduled for destruction.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn mark_rows(
    store: &dyn DeclarativeStore,
    marker: &str,
    desired: &[DesiredRow],
) -> Result<MarkOutcome> {
    let mut found = Vec::with_capacity(desired.len());
    let mut outdated = Vec::new();

    for row in desired {
        if let Some(existing) = store.find_one_match_non_zeros(row).await? {
            found.push(existing.uuid);
        } else if row.kind.falls_back_to_name() && !row.name.is_empty() {
            if let Some(existing) = store.find_by_name(row.kind, &row.name).await? {
                debug!(kind = %row.kind, name = %row.name, "Outdated row");
                outdated.push(existing.uuid);
            }
        }
    }

    for uuid in &found {
        store.set_marker(uuid, marker).await?;
    }

    if found.len() == desired.len() {
        return Ok(MarkOutcome {
            all_found: true,
            destroy: Vec::new(),
        });
    }

    found.extend(outdated);
    Ok(MarkOutcome {
        all_found: false,
        destroy: found,
    })
}

/// Destroys every row not tagged with `marker`; returns their identifiers.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn sweep(store: &dyn DeclarativeStore, marker: &str) -> Result<Vec<String>> {
    let stale: Vec<String> = store
        .rows()
        .await?
        .into_iter()
        .filter(|r| r.marker() != Some(marker))
        .map(|r| r.uuid)
        .collect();
    if !stale.is_empty() {
        store.destroy(&stale).await?;
    }
    Ok(stale)
}

/// Summary of a convergence pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvergeReport {
    /// Generation marker of this pass.
    pub marker: String,
    /// Groups already fully present.
    pub complete: usize,
    /// Groups destroyed and recreated.
    pub recreated: usize,
    /// Rows created.
    pub created: usize,
    /// Rows destroyed by the sweep.
    pub swept: usize,
}

impl fmt::Display for ConvergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generation {}: {} complete, {} recreated ({} rows), {} swept",
            self.marker, self.complete, self.recreated, self.created, self.swept
        )
    }
}

/// Converges the store onto `groups`.
///
/// # Errors
///
/// Returns an error if the store fails; rows already marked stay marked
/// and the next pass resumes from there.
pub async fn converge(
    store: &dyn DeclarativeStore,
    groups: &[Vec<DesiredRow>],
) -> Result<ConvergeReport> {
    let marker = MarkerHasher::new().marker(groups);
    let mut report = ConvergeReport {
        marker: marker.clone(),
        ..ConvergeReport::default()
    };

    for group in groups {
        let outcome = mark_rows(store, &marker, group).await?;
        if outcome.all_found {
            report.complete += 1;
            continue;
        }
        if !outcome.destroy.is_empty() {
            store.destroy(&outcome.destroy).await?;
        }
        for row in group {
            store.create(row, &marker).await?;
            report.created += 1;
        }
        report.recreated += 1;
    }

    report.swept = sweep(store, &marker).await?.len();
    info!("Converged {report}");
    Ok(report)
}
