//! Work sessions: immutable notes plus advisory file claims.
//!
//! File claims are leases, not mutexes: overlapping claims on a path all
//! succeed, and the overlap is reported back so agents can coordinate.

use std::sync::Arc;

use pd_db::{decode_json_opt, encode_json_opt, now_ms, Database};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::Row;
use tracing::{info, instrument};

use crate::{
    activity::{ActivitySink, NewActivity},
    error::{CoreError, CoreResult, ErrorCode},
    events::{EventKind, EventSink},
};

const QUICK_NOTE_PURPOSE: &str = "Quick notes";
const DEFAULT_NOTE_KIND: &str = "note";
const DEFAULT_CLEANUP_AGE_MS: i64 = 7 * 86_400_000;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_ABANDONED: &str = "abandoned";
pub const STATUS_PAUSED: &str = "paused";

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub agent_id: Option<String>,
    pub metadata: Option<Value>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<String>,
    pub agent_id: Option<String>,
    pub include_notes: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub purpose: String,
    pub agent_id: Option<String>,
    pub status: String,
    pub metadata: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<SessionNote>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNote {
    pub id: i64,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileClaim {
    pub file_path: String,
    pub claimed_at: i64,
    pub released_at: Option<i64>,
}

/// An overlapping active claim held by some other session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConflict {
    pub file_path: String,
    pub session_id: String,
    pub purpose: String,
    pub agent_id: Option<String>,
    pub claimed_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub session: SessionInfo,
    pub conflicts: Vec<FileConflict>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndOutcome {
    pub session: SessionInfo,
    pub released_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickNoteOutcome {
    pub session_id: String,
    pub note_id: i64,
    pub created_session: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimFilesOutcome {
    pub claimed: Vec<String>,
    pub conflicts: Vec<FileConflict>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: SessionInfo,
    pub notes: Vec<SessionNote>,
    pub files: Vec<FileClaim>,
}

pub struct Sessions {
    db: Database,
    activity: Arc<dyn ActivitySink>,
    events: Arc<dyn EventSink>,
}

impl Sessions {
    pub fn new(db: Database, activity: Arc<dyn ActivitySink>, events: Arc<dyn EventSink>) -> Self {
        Self {
            db,
            activity,
            events,
        }
    }

    /// Opens a session, optionally claiming an initial file set. Conflicts
    /// with other sessions' claims are reported but never block the start.
    #[instrument(skip(self, opts))]
    pub async fn start(&self, purpose: &str, opts: StartOptions) -> CoreResult<StartOutcome> {
        if purpose.trim().is_empty() {
            return Err(CoreError::validation("session purpose is required"));
        }

        let id = new_session_id();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO sessions (id, purpose, agent_id, status, metadata, created_at, updated_at)
             VALUES (?, ?, ?, 'active', ?, ?, ?)",
        )
        .bind(&id)
        .bind(purpose)
        .bind(&opts.agent_id)
        .bind(encode_json_opt(opts.metadata.as_ref()))
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        let conflicts = if opts.files.is_empty() {
            Vec::new()
        } else {
            self.claim_files(&id, &opts.files).await?.conflicts
        };

        self.activity
            .record(EventKind::SessionStart, NewActivity {
                agent_id: opts.agent_id.clone(),
                target_id: Some(id.clone()),
                details: Some(purpose.to_owned()),
                ..NewActivity::default()
            })
            .await;
        self.events
            .emit(
                EventKind::SessionStart,
                json!({ "sessionId": &id, "purpose": purpose }),
                Some(id.as_str()),
            )
            .await;

        info!(session = %id, "session started");
        let session = self.fetch_required(&id).await?;
        Ok(StartOutcome { session, conflicts })
    }

    /// Appends an immutable note. Notes have no update or delete; they only
    /// leave with their session.
    pub async fn add_note(
        &self,
        session_id: &str,
        content: &str,
        kind: Option<&str>,
    ) -> CoreResult<SessionNote> {
        if content.trim().is_empty() {
            return Err(CoreError::validation("note content is required"));
        }
        self.fetch_required(session_id).await?;

        let now = now_ms();
        let kind = kind.unwrap_or(DEFAULT_NOTE_KIND);
        let result = sqlx::query(
            "INSERT INTO session_notes (session_id, content, kind, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(content)
        .bind(kind)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(self.db.pool())
            .await?;

        self.activity
            .record(EventKind::SessionNote, NewActivity {
                target_id: Some(session_id.to_owned()),
                ..NewActivity::default()
            })
            .await;

        Ok(SessionNote {
            id: result.last_insert_rowid(),
            content: content.to_owned(),
            kind: kind.to_owned(),
            created_at: now,
        })
    }

    /// Appends to the caller's active session, creating a `Quick notes`
    /// session first when none exists.
    pub async fn quick_note(
        &self,
        content: &str,
        agent_id: Option<&str>,
        kind: Option<&str>,
    ) -> CoreResult<QuickNoteOutcome> {
        let existing = match agent_id {
            Some(agent) => sqlx::query_scalar::<_, String>(
                "SELECT id FROM sessions WHERE status = 'active' AND agent_id = ?
                 ORDER BY updated_at DESC LIMIT 1",
            )
            .bind(agent)
            .fetch_optional(self.db.pool())
            .await?,
            None => None,
        };

        let (session_id, created_session) = match existing {
            Some(id) => (id, false),
            None => {
                let outcome = self
                    .start(QUICK_NOTE_PURPOSE, StartOptions {
                        agent_id: agent_id.map(str::to_owned),
                        ..StartOptions::default()
                    })
                    .await?;
                (outcome.session.id, true)
            }
        };

        let note = self.add_note(&session_id, content, kind).await?;
        Ok(QuickNoteOutcome {
            session_id,
            note_id: note.id,
            created_session,
        })
    }

    /// Terminates a session, releasing every active file claim it holds.
    /// Re-ending an already-terminal session is a no-op success.
    #[instrument(skip(self, note))]
    pub async fn end(
        &self,
        session_id: &str,
        status: &str,
        note: Option<&str>,
    ) -> CoreResult<EndOutcome> {
        if !matches!(status, STATUS_COMPLETED | STATUS_ABANDONED) {
            return Err(CoreError::validation(format!(
                "terminal status must be '{STATUS_COMPLETED}' or '{STATUS_ABANDONED}', got '{status}'"
            )));
        }
        let session = self.fetch_required(session_id).await?;
        if is_terminal(&session.status) {
            return Ok(EndOutcome {
                session,
                released_files: Vec::new(),
            });
        }

        if let Some(note) = note {
            self.add_note(session_id, note, Some("handoff")).await?;
        }

        let now = now_ms();
        sqlx::query(
            "UPDATE sessions SET status = ?, updated_at = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(now)
        .bind(session_id)
        .execute(self.db.pool())
        .await?;

        let released_files = self.release_all_files(session_id, now).await?;

        self.activity
            .record(EventKind::SessionEnd, NewActivity {
                target_id: Some(session_id.to_owned()),
                details: Some(status.to_owned()),
                ..NewActivity::default()
            })
            .await;
        self.events
            .emit(
                EventKind::SessionEnd,
                json!({ "sessionId": session_id, "status": status }),
                Some(session_id),
            )
            .await;

        let session = self.fetch_required(session_id).await?;
        Ok(EndOutcome {
            session,
            released_files,
        })
    }

    /// `end` with `abandoned` and no handoff note.
    pub async fn abandon(&self, session_id: &str) -> CoreResult<EndOutcome> {
        self.end(session_id, STATUS_ABANDONED, None).await
    }

    /// Pauses or resumes without touching file claims or `completed_at`.
    pub async fn set_status(&self, session_id: &str, status: &str) -> CoreResult<SessionInfo> {
        if !matches!(status, STATUS_ACTIVE | STATUS_PAUSED) {
            return Err(CoreError::validation(format!(
                "status must be '{STATUS_ACTIVE}' or '{STATUS_PAUSED}', got '{status}'"
            )));
        }
        self.fetch_required(session_id).await?;
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(now_ms())
            .bind(session_id)
            .execute(self.db.pool())
            .await?;
        self.fetch_required(session_id).await
    }

    /// Claims paths for the session. Advisory: the claim succeeds even when
    /// other sessions hold the same paths; those overlaps come back as
    /// conflicts.
    #[instrument(skip(self, paths))]
    pub async fn claim_files(
        &self,
        session_id: &str,
        paths: &[String],
    ) -> CoreResult<ClaimFilesOutcome> {
        self.fetch_required(session_id).await?;

        let now = now_ms();
        let mut claimed = Vec::with_capacity(paths.len());
        let mut conflicts = Vec::new();

        for path in paths {
            conflicts.extend(self.conflicts_for(path, Some(session_id)).await?);

            // Re-claiming an active own path keeps its original claimed_at;
            // a previously released row becomes a fresh claim.
            sqlx::query(
                "INSERT INTO file_claims (session_id, file_path, claimed_at, released_at)
                 VALUES (?, ?, ?, NULL)
                 ON CONFLICT(session_id, file_path) DO UPDATE SET
                   claimed_at = CASE WHEN file_claims.released_at IS NULL
                                     THEN file_claims.claimed_at
                                     ELSE excluded.claimed_at END,
                   released_at = NULL",
            )
            .bind(session_id)
            .bind(path)
            .bind(now)
            .execute(self.db.pool())
            .await?;
            claimed.push(path.clone());

            self.activity
                .record(EventKind::FileClaim, NewActivity {
                    target_id: Some(session_id.to_owned()),
                    details: Some(path.clone()),
                    ..NewActivity::default()
                })
                .await;
        }

        if !conflicts.is_empty() {
            self.events
                .emit(
                    EventKind::FileClaim,
                    json!({ "sessionId": session_id, "conflicts": conflicts.len() }),
                    Some(session_id),
                )
                .await;
        }

        Ok(ClaimFilesOutcome { claimed, conflicts })
    }

    /// Releases the session's own active claims on the given paths; claims
    /// held by other sessions are untouched.
    pub async fn release_files(
        &self,
        session_id: &str,
        paths: &[String],
    ) -> CoreResult<Vec<String>> {
        self.fetch_required(session_id).await?;

        let now = now_ms();
        let mut released = Vec::new();
        for path in paths {
            let updated = sqlx::query(
                "UPDATE file_claims SET released_at = ?
                 WHERE session_id = ? AND file_path = ? AND released_at IS NULL",
            )
            .bind(now)
            .bind(session_id)
            .bind(path)
            .execute(self.db.pool())
            .await?;
            if updated.rows_affected() > 0 {
                released.push(path.clone());
                self.activity
                    .record(EventKind::FileRelease, NewActivity {
                        target_id: Some(session_id.to_owned()),
                        details: Some(path.clone()),
                        ..NewActivity::default()
                    })
                    .await;
            }
        }
        Ok(released)
    }

    /// Every active claim on the given paths, across all sessions.
    pub async fn get_file_conflicts(&self, paths: &[String]) -> CoreResult<Vec<FileConflict>> {
        let mut conflicts = Vec::new();
        for path in paths {
            conflicts.extend(self.conflicts_for(path, None).await?);
        }
        Ok(conflicts)
    }

    /// Sessions ordered by recency, optionally filtered and with notes.
    pub async fn list(&self, filter: SessionFilter) -> CoreResult<Vec<SessionInfo>> {
        let limit = filter.limit.unwrap_or(50).clamp(1, 500);
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM sessions");
        let mut has_where = false;
        if let Some(status) = &filter.status {
            builder.push(" WHERE status = ").push_bind(status.clone());
            has_where = true;
        }
        if let Some(agent) = &filter.agent_id {
            builder.push(if has_where { " AND " } else { " WHERE " });
            builder.push("agent_id = ").push_bind(agent.clone());
        }
        builder.push(" ORDER BY updated_at DESC LIMIT ").push_bind(limit);

        let rows = builder.build().fetch_all(self.db.pool()).await?;
        let mut sessions: Vec<SessionInfo> =
            rows.into_iter().map(map_session).collect::<CoreResult<_>>()?;

        if filter.include_notes {
            for session in &mut sessions {
                session.notes = Some(self.notes_for(&session.id).await?);
            }
        }
        Ok(sessions)
    }

    /// One session with its full note and file history.
    pub async fn get(&self, session_id: &str) -> CoreResult<SessionDetail> {
        let session = self.fetch_required(session_id).await?;
        let notes = self.notes_for(session_id).await?;
        let rows = sqlx::query(
            "SELECT file_path, claimed_at, released_at FROM file_claims
             WHERE session_id = ? ORDER BY claimed_at ASC",
        )
        .bind(session_id)
        .fetch_all(self.db.pool())
        .await?;
        let files = rows
            .into_iter()
            .map(|row| {
                Ok(FileClaim {
                    file_path: row.try_get("file_path").map_err(CoreError::from)?,
                    claimed_at: row.try_get("claimed_at").map_err(CoreError::from)?,
                    released_at: row.try_get("released_at").map_err(CoreError::from)?,
                })
            })
            .collect::<CoreResult<_>>()?;

        Ok(SessionDetail {
            session,
            notes,
            files,
        })
    }

    /// Deletes the session; notes and claims cascade. Idempotent.
    pub async fn remove(&self, session_id: &str) -> CoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    /// Deletes old terminal sessions (or the one given status); children go
    /// with them via cascade.
    pub async fn cleanup(&self, older_than_ms: Option<i64>, status: Option<&str>) -> CoreResult<i64> {
        let cutoff = now_ms() - older_than_ms.unwrap_or(DEFAULT_CLEANUP_AGE_MS);
        let cleaned = match status {
            Some(status) => {
                sqlx::query("DELETE FROM sessions WHERE status = ? AND updated_at < ?")
                    .bind(status)
                    .bind(cutoff)
                    .execute(self.db.pool())
                    .await?
                    .rows_affected()
            }
            None => {
                sqlx::query(
                    "DELETE FROM sessions
                     WHERE status IN ('completed', 'abandoned') AND updated_at < ?",
                )
                .bind(cutoff)
                .execute(self.db.pool())
                .await?
                .rows_affected()
            }
        };
        Ok(cleaned as i64)
    }

    async fn conflicts_for(
        &self,
        path: &str,
        exclude_session: Option<&str>,
    ) -> CoreResult<Vec<FileConflict>> {
        let mut sql = String::from(
            "SELECT fc.file_path, fc.session_id, fc.claimed_at, s.purpose, s.agent_id
             FROM file_claims fc JOIN sessions s ON s.id = fc.session_id
             WHERE fc.file_path = ? AND fc.released_at IS NULL",
        );
        if exclude_session.is_some() {
            sql.push_str(" AND fc.session_id != ?");
        }

        let mut query = sqlx::query(&sql).bind(path);
        if let Some(session) = exclude_session {
            query = query.bind(session);
        }
        let rows = query.fetch_all(self.db.pool()).await?;
        rows.into_iter()
            .map(|row| {
                Ok(FileConflict {
                    file_path: row.try_get("file_path").map_err(CoreError::from)?,
                    session_id: row.try_get("session_id").map_err(CoreError::from)?,
                    purpose: row.try_get("purpose").map_err(CoreError::from)?,
                    agent_id: row.try_get("agent_id").map_err(CoreError::from)?,
                    claimed_at: row.try_get("claimed_at").map_err(CoreError::from)?,
                })
            })
            .collect()
    }

    async fn release_all_files(&self, session_id: &str, now: i64) -> CoreResult<Vec<String>> {
        let released = sqlx::query(
            "UPDATE file_claims SET released_at = ?
             WHERE session_id = ? AND released_at IS NULL
             RETURNING file_path",
        )
        .bind(now)
        .bind(session_id)
        .fetch_all(self.db.pool())
        .await?;
        released
            .into_iter()
            .map(|row| row.try_get("file_path").map_err(CoreError::from))
            .collect()
    }

    async fn notes_for(&self, session_id: &str) -> CoreResult<Vec<SessionNote>> {
        let rows = sqlx::query(
            "SELECT id, content, kind, created_at FROM session_notes
             WHERE session_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(SessionNote {
                    id: row.try_get("id").map_err(CoreError::from)?,
                    content: row.try_get("content").map_err(CoreError::from)?,
                    kind: row.try_get("kind").map_err(CoreError::from)?,
                    created_at: row.try_get("created_at").map_err(CoreError::from)?,
                })
            })
            .collect()
    }

    async fn fetch_required(&self, session_id: &str) -> CoreResult<SessionInfo> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(self.db.pool())
            .await?;
        match row {
            Some(row) => map_session(row),
            None => Err(CoreError::new(
                ErrorCode::SessionNotFound,
                format!("session '{session_id}' does not exist"),
            )),
        }
    }
}

fn is_terminal(status: &str) -> bool {
    matches!(status, STATUS_COMPLETED | STATUS_ABANDONED)
}

fn new_session_id() -> String {
    format!("session-{:08x}", rand::thread_rng().gen::<u32>())
}

fn map_session(row: sqlx::sqlite::SqliteRow) -> CoreResult<SessionInfo> {
    Ok(SessionInfo {
        id: row.try_get("id").map_err(CoreError::from)?,
        purpose: row.try_get("purpose").map_err(CoreError::from)?,
        agent_id: row.try_get("agent_id").map_err(CoreError::from)?,
        status: row.try_get("status").map_err(CoreError::from)?,
        metadata: decode_json_opt(row.try_get("metadata").map_err(CoreError::from)?),
        created_at: row.try_get("created_at").map_err(CoreError::from)?,
        updated_at: row.try_get("updated_at").map_err(CoreError::from)?,
        completed_at: row.try_get("completed_at").map_err(CoreError::from)?,
        notes: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sessions_fixture;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn start_generates_ids_and_requires_purpose() {
        let sessions = sessions_fixture().await;
        let out = sessions.start("work", StartOptions::default()).await.unwrap();
        assert!(out.session.id.starts_with("session-"));
        assert_eq!(out.session.id.len(), "session-".len() + 8);
        assert_eq!(out.session.status, STATUS_ACTIVE);
        assert!(out.conflicts.is_empty());

        let err = sessions.start("  ", StartOptions::default()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn overlapping_claims_coexist_and_report_conflicts() {
        let sessions = sessions_fixture().await;
        let first = sessions
            .start("work", StartOptions {
                files: paths(&["a.ts"]),
                ..StartOptions::default()
            })
            .await
            .unwrap();
        assert!(first.conflicts.is_empty());

        let second = sessions
            .start("other", StartOptions {
                files: paths(&["a.ts", "b.ts"]),
                ..StartOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].session_id, first.session.id);
        assert_eq!(second.conflicts[0].file_path, "a.ts");

        let all = sessions.get_file_conflicts(&paths(&["a.ts"])).await.unwrap();
        assert_eq!(all.len(), 2);

        // Ending the first session frees its claim.
        let ended = sessions
            .end(&first.session.id, STATUS_COMPLETED, None)
            .await
            .unwrap();
        assert_eq!(ended.released_files, vec!["a.ts".to_owned()]);

        let all = sessions.get_file_conflicts(&paths(&["a.ts"])).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session_id, second.session.id);
    }

    #[tokio::test]
    async fn reclaiming_an_active_path_keeps_claimed_at() {
        let sessions = sessions_fixture().await;
        let session = sessions
            .start("work", StartOptions {
                files: paths(&["x.rs"]),
                ..StartOptions::default()
            })
            .await
            .unwrap()
            .session;

        let before = sessions.get(&session.id).await.unwrap().files[0].claimed_at;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let again = sessions.claim_files(&session.id, &paths(&["x.rs"])).await.unwrap();
        assert!(again.conflicts.is_empty());

        let after = sessions.get(&session.id).await.unwrap().files[0].claimed_at;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn release_files_only_touches_own_claims() {
        let sessions = sessions_fixture().await;
        let one = sessions
            .start("one", StartOptions {
                files: paths(&["shared.ts"]),
                ..StartOptions::default()
            })
            .await
            .unwrap()
            .session;
        let two = sessions
            .start("two", StartOptions {
                files: paths(&["shared.ts"]),
                ..StartOptions::default()
            })
            .await
            .unwrap()
            .session;

        // Session two releasing a path session one holds is a no-op for one.
        let released = sessions
            .release_files(&two.id, &paths(&["shared.ts", "unclaimed.ts"]))
            .await
            .unwrap();
        assert_eq!(released, vec!["shared.ts".to_owned()]);

        let conflicts = sessions
            .get_file_conflicts(&paths(&["shared.ts"]))
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].session_id, one.id);
    }

    #[tokio::test]
    async fn notes_are_append_only_and_ordered() {
        let sessions = sessions_fixture().await;
        let session = sessions.start("work", StartOptions::default()).await.unwrap().session;

        sessions.add_note(&session.id, "first", None).await.unwrap();
        sessions
            .add_note(&session.id, "second", Some("decision"))
            .await
            .unwrap();

        let detail = sessions.get(&session.id).await.unwrap();
        assert_eq!(detail.notes.len(), 2);
        assert_eq!(detail.notes[0].content, "first");
        assert_eq!(detail.notes[0].kind, "note");
        assert_eq!(detail.notes[1].kind, "decision");

        let err = sessions
            .add_note("session-missing", "x", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn quick_note_reuses_the_active_session() {
        let sessions = sessions_fixture().await;

        let first = sessions.quick_note("hello", Some("a1"), None).await.unwrap();
        assert!(first.created_session);

        let second = sessions.quick_note("again", Some("a1"), None).await.unwrap();
        assert!(!second.created_session);
        assert_eq!(second.session_id, first.session_id);

        // A different agent gets its own session.
        let other = sessions.quick_note("hi", Some("a2"), None).await.unwrap();
        assert!(other.created_session);
        assert_ne!(other.session_id, first.session_id);
    }

    #[tokio::test]
    async fn ending_twice_is_a_no_op() {
        let sessions = sessions_fixture().await;
        let session = sessions.start("work", StartOptions::default()).await.unwrap().session;

        let first = sessions
            .end(&session.id, STATUS_COMPLETED, Some("handing off"))
            .await
            .unwrap();
        assert_eq!(first.session.status, STATUS_COMPLETED);
        assert!(first.session.completed_at.is_some());

        let second = sessions
            .end(&session.id, STATUS_ABANDONED, None)
            .await
            .unwrap();
        assert_eq!(second.session.status, STATUS_COMPLETED);
        assert!(second.released_files.is_empty());

        // The handoff note is there.
        let detail = sessions.get(&session.id).await.unwrap();
        assert_eq!(detail.notes.len(), 1);
        assert_eq!(detail.notes[0].kind, "handoff");
    }

    #[tokio::test]
    async fn abandon_releases_claims_without_a_note() {
        let sessions = sessions_fixture().await;
        let session = sessions
            .start("work", StartOptions {
                files: paths(&["a.ts"]),
                ..StartOptions::default()
            })
            .await
            .unwrap()
            .session;

        let out = sessions.abandon(&session.id).await.unwrap();
        assert_eq!(out.session.status, STATUS_ABANDONED);
        assert_eq!(out.released_files, vec!["a.ts".to_owned()]);
        assert!(sessions.get(&session.id).await.unwrap().notes.is_empty());
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let sessions = sessions_fixture().await;
        let session = sessions.start("work", StartOptions::default()).await.unwrap().session;

        let paused = sessions.set_status(&session.id, STATUS_PAUSED).await.unwrap();
        assert_eq!(paused.status, STATUS_PAUSED);
        assert!(paused.completed_at.is_none());

        let resumed = sessions.set_status(&session.id, STATUS_ACTIVE).await.unwrap();
        assert_eq!(resumed.status, STATUS_ACTIVE);
    }

    #[tokio::test]
    async fn remove_cascades_children() {
        let sessions = sessions_fixture().await;
        let session = sessions
            .start("work", StartOptions {
                files: paths(&["a.ts"]),
                ..StartOptions::default()
            })
            .await
            .unwrap()
            .session;
        sessions.add_note(&session.id, "note", None).await.unwrap();

        assert!(sessions.remove(&session.id).await.unwrap());
        assert!(!sessions.remove(&session.id).await.unwrap());

        let conflicts = sessions.get_file_conflicts(&paths(&["a.ts"])).await.unwrap();
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_old_terminal_sessions() {
        let sessions = sessions_fixture().await;
        let session = sessions.start("work", StartOptions::default()).await.unwrap().session;
        sessions.end(&session.id, STATUS_COMPLETED, None).await.unwrap();

        // Nothing is old enough with the default window.
        assert_eq!(sessions.cleanup(None, None).await.unwrap(), 0);
        // A zero-width window sweeps it.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(sessions.cleanup(Some(0), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let sessions = sessions_fixture().await;
        let a = sessions
            .start("a", StartOptions {
                agent_id: Some("agent-1".into()),
                ..StartOptions::default()
            })
            .await
            .unwrap()
            .session;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = sessions.start("b", StartOptions::default()).await.unwrap().session;
        sessions.end(&b.id, STATUS_ABANDONED, None).await.unwrap();

        let active = sessions
            .list(SessionFilter {
                status: Some(STATUS_ACTIVE.into()),
                ..SessionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let mine = sessions
            .list(SessionFilter {
                agent_id: Some("agent-1".into()),
                include_notes: true,
                ..SessionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert!(mine[0].notes.is_some());
    }
}
