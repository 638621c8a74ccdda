//! Relational projection store: an embedded sqlite database holding
//! materialized views of agents, sessions, messages, threads, groups,
//! read-markers, subscriptions, and the raw `events` table keyed by
//! sequence. A single `Connection` wrapped in a `Mutex`, with `PRAGMA`
//! setup at open time; schema evolution goes through `migrations.rs`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Error;
use crate::models::{
    Agent, AgentKind, FilterType, Group, GroupMember, Message, ReadMarker, Scope, Session,
    Subscription, Thread,
};

/// A degenerate but legal reader/writer split: one connection behind one
/// mutex. rusqlite's `Connection` is `!Sync`, so every access serializes
/// through the same lock regardless; concurrent writers still serialize
/// correctly. Recorded as an Open Question resolution in DESIGN.md.
pub struct Store {
    conn: Mutex<Connection>,
    migrating: AtomicBool,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        crate::migrations::run(&mut conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            migrating: AtomicBool::new(false),
        })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        crate::migrations::run(&mut conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            migrating: AtomicBool::new(false),
        })
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::SeqCst)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- events ---------------------------------------------------------

    pub fn max_sequence(&self) -> Result<u64, Error> {
        let conn = self.conn();
        let seq: Option<i64> = conn.query_row("SELECT MAX(sequence) FROM events", [], |r| r.get(0))?;
        Ok(seq.unwrap_or(0).max(0) as u64)
    }

    pub fn event_exists(&self, event_id: &str) -> Result<bool, Error> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE event_id = ?1",
            params![event_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// `INSERT OR IGNORE` on `event_id`, keeping re-ingest idempotent.
    /// Returns whether a row was actually inserted.
    pub fn insert_event_row(
        &self,
        event_id: &str,
        sequence: u64,
        type_: &str,
        timestamp: &str,
        origin_daemon: &str,
        event_json: &str,
    ) -> Result<bool, Error> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO events (event_id, sequence, type, timestamp, origin_daemon, event_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![event_id, sequence as i64, type_, timestamp, origin_daemon, event_json],
        )?;
        Ok(changed > 0)
    }

    pub fn event_origin(&self, event_id: &str) -> Result<Option<String>, Error> {
        let conn = self.conn();
        conn.query_row(
            "SELECT origin_daemon FROM events WHERE event_id = ?1",
            params![event_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Missing sequence ranges per origin, for the sync-ingest gap report.
    pub fn gap_report(&self) -> Result<Vec<(String, std::ops::Range<u64>)>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT origin_daemon, sequence FROM events ORDER BY origin_daemon, sequence",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut gaps = Vec::new();
        let mut last: Option<(String, i64)> = None;
        for (origin, seq) in rows {
            if let Some((ref last_origin, last_seq)) = last {
                if last_origin == &origin && seq > last_seq + 1 {
                    gaps.push((origin.clone(), (last_seq as u64 + 1)..(seq as u64)));
                }
            }
            last = Some((origin, seq));
        }
        Ok(gaps)
    }

    // --- agents -----------------------------------------------------------

    pub fn upsert_agent(&self, agent: &Agent) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO agents (agent_id, kind, role, module, display, registered_at, last_seen_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(agent_id) DO UPDATE SET
               role = excluded.role,
               module = excluded.module,
               display = excluded.display,
               last_seen_at = excluded.last_seen_at",
            params![
                agent.agent_id,
                kind_str(agent.kind),
                agent.role,
                agent.module,
                agent.display,
                agent.registered_at,
                agent.last_seen_at,
                agent.deleted_at,
            ],
        )?;
        Ok(())
    }

    pub fn touch_agent_last_seen(&self, agent_id: &str, at: &str) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "UPDATE agents SET last_seen_at = ?2 WHERE agent_id = ?1",
            params![agent_id, at],
        )?;
        Ok(())
    }

    pub fn delete_agent(&self, agent_id: &str, at: &str) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "UPDATE agents SET deleted_at = ?2 WHERE agent_id = ?1",
            params![agent_id, at],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, Error> {
        let conn = self.conn();
        conn.query_row(
            "SELECT agent_id, kind, role, module, display, registered_at, last_seen_at, deleted_at
             FROM agents WHERE agent_id = ?1",
            params![agent_id],
            row_to_agent,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_agents(&self, role: Option<&str>, module: Option<&str>) -> Result<Vec<Agent>, Error> {
        let conn = self.conn();
        let mut sql = "SELECT agent_id, kind, role, module, display, registered_at, last_seen_at, deleted_at
                        FROM agents WHERE deleted_at IS NULL"
            .to_string();
        let mut filter_params: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(r) = role {
            sql.push_str(" AND role = ?");
            filter_params.push(r);
        }
        if let Some(m) = module {
            sql.push_str(" AND module = ?");
            filter_params.push(m);
        }
        sql.push_str(" ORDER BY registered_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(filter_params.as_slice(), row_to_agent)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Live roster of `agent_id`s for a role, used by dispatch's role
    /// expansion. Only non-deleted agents count.
    pub fn agent_ids_with_role(&self, role: &str) -> Result<Vec<String>, Error> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT agent_id FROM agents WHERE role = ?1 AND deleted_at IS NULL")?;
        let rows = stmt
            .query_map(params![role], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // --- sessions -----------------------------------------------------------

    pub fn insert_session(&self, session: &Session) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (session_id, agent_id, started_at, ended_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.session_id,
                session.agent_id,
                session.started_at,
                session.ended_at,
                session.active as i64
            ],
        )?;
        Ok(())
    }

    pub fn end_session(&self, session_id: &str, ended_at: &str) -> Result<bool, Error> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE sessions SET active = 0, ended_at = ?2 WHERE session_id = ?1 AND active = 1",
            params![session_id, ended_at],
        )?;
        Ok(changed > 0)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, Error> {
        let conn = self.conn();
        conn.query_row(
            "SELECT session_id, agent_id, started_at, ended_at, active FROM sessions WHERE session_id = ?1",
            params![session_id],
            row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_sessions(&self, agent_id: Option<&str>, active_only: bool) -> Result<Vec<Session>, Error> {
        let conn = self.conn();
        let mut sql = "SELECT session_id, agent_id, started_at, ended_at, active FROM sessions WHERE 1=1".to_string();
        let mut filter_params: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(a) = agent_id {
            sql.push_str(" AND agent_id = ?");
            filter_params.push(a);
        }
        if active_only {
            sql.push_str(" AND active = 1");
        }
        sql.push_str(" ORDER BY started_at DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(filter_params.as_slice(), row_to_session)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // --- threads -----------------------------------------------------------

    pub fn insert_thread(&self, thread: &Thread) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO threads (thread_id, title, created_at, created_by, message_count, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                thread.thread_id,
                thread.title,
                thread.created_at,
                thread.created_by,
                thread.message_count,
                thread.last_message_at
            ],
        )?;
        Ok(())
    }

    pub fn thread_exists(&self, thread_id: &str) -> Result<bool, Error> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE thread_id = ?1",
            params![thread_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn touch_thread(&self, thread_id: &str, at: &str) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "UPDATE threads SET message_count = message_count + 1, last_message_at = ?2 WHERE thread_id = ?1",
            params![thread_id, at],
        )?;
        Ok(())
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, Error> {
        let conn = self.conn();
        conn.query_row(
            "SELECT thread_id, title, created_at, created_by, message_count, last_message_at
             FROM threads WHERE thread_id = ?1",
            params![thread_id],
            row_to_thread,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_threads(&self) -> Result<Vec<Thread>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT thread_id, title, created_at, created_by, message_count, last_message_at
             FROM threads ORDER BY last_message_at DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_thread)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Unread count for a viewer within one thread: messages in that thread
    /// with a pending (`read_at IS NULL`) read-marker for that viewer.
    pub fn unread_count_for_viewer_in_thread(&self, viewer_id: &str, thread_id: &str) -> Result<i64, Error> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM read_markers rm
             JOIN messages m ON m.message_id = rm.message_id
             WHERE rm.viewer_id = ?1 AND m.thread_id = ?2 AND rm.read_at IS NULL",
            params![viewer_id, thread_id],
            |r| r.get(0),
        )
        .map_err(Error::from)
    }

    // --- messages -----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(&self, message: &Message, sequence: u64) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (message_id, thread_id, agent_id, session_id, created_at, updated_at,
                                    deleted_at, format, content, structured, scopes, refs, mentions,
                                    reply_to, disclosed, authored_by, sequence)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                message.message_id,
                message.thread_id,
                message.agent_id,
                message.session_id,
                message.created_at,
                message.updated_at,
                message.deleted_at,
                message.format,
                message.content,
                message.structured.as_ref().map(|v| v.to_string()),
                serde_json::to_string(&message.scopes).unwrap_or_default(),
                serde_json::to_string(&message.refs).unwrap_or_default(),
                serde_json::to_string(&message.mentions).unwrap_or_default(),
                message.reply_to,
                message.disclosed as i64,
                message.authored_by,
                sequence as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>, Error> {
        let conn = self.conn();
        conn.query_row(
            "SELECT message_id, thread_id, agent_id, session_id, created_at, updated_at, deleted_at,
                    format, content, structured, scopes, refs, mentions, reply_to, disclosed, authored_by
             FROM messages WHERE message_id = ?1",
            params![message_id],
            row_to_message,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn edit_message(
        &self,
        message_id: &str,
        content: &str,
        structured: Option<&Value>,
        at: &str,
    ) -> Result<bool, Error> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE messages SET content = ?2, structured = ?3, updated_at = ?4
             WHERE message_id = ?1 AND deleted_at IS NULL",
            params![
                message_id,
                content,
                structured.map(|v| v.to_string()),
                at
            ],
        )?;
        Ok(changed > 0)
    }

    /// Sets `deleted_at`. Queries blank the body themselves; the row stays.
    pub fn soft_delete_message(&self, message_id: &str, at: &str) -> Result<bool, Error> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE messages SET deleted_at = ?2 WHERE message_id = ?1 AND deleted_at IS NULL",
            params![message_id, at],
        )?;
        Ok(changed > 0)
    }

    pub fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, Error> {
        let conn = self.conn();
        let mut sql = "SELECT message_id, thread_id, agent_id, session_id, created_at, updated_at, deleted_at,
                              format, content, structured, scopes, refs, mentions, reply_to, disclosed, authored_by
                       FROM messages WHERE 1=1"
            .to_string();
        let mut filter_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(t) = &filter.thread_id {
            sql.push_str(" AND thread_id = ?");
            filter_params.push(Box::new(t.clone()));
        }
        if let Some(a) = &filter.author_id {
            sql.push_str(" AND agent_id = ?");
            filter_params.push(Box::new(a.clone()));
        }
        if let Some(m) = &filter.mention {
            sql.push_str(" AND mentions LIKE ?");
            filter_params.push(Box::new(format!("%\"{m}\"%")));
        }
        if let Some((t, v)) = &filter.scope {
            sql.push_str(" AND scopes LIKE ?");
            filter_params.push(Box::new(format!("%\"type\":\"{t}\",\"value\":\"{v}\"%")));
        }
        if let Some((t, v)) = &filter.ref_ {
            sql.push_str(" AND refs LIKE ?");
            filter_params.push(Box::new(format!("%\"type\":\"{t}\",\"value\":\"{v}\"%")));
        }
        if let Some(after) = filter.after_sequence {
            sql.push_str(" AND sequence > ?");
            filter_params.push(Box::new(after as i64));
        }

        let order = if filter.sort_order_desc { "DESC" } else { "ASC" };
        sql.push_str(&format!(" ORDER BY sequence {order} LIMIT ?"));
        filter_params.push(Box::new(filter.page_size as i64));
        let offset = filter.page.saturating_sub(1) * filter.page_size;
        sql.push_str(" OFFSET ?");
        filter_params.push(Box::new(offset as i64));

        let refs: Vec<&dyn rusqlite::ToSql> = filter_params.iter().map(|b| b.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(refs.as_slice(), row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Backfills `thread_id` on a message that predates the thread it now
    /// belongs to (the parent of a reply chain's first reply).
    pub fn set_message_thread_id(&self, message_id: &str, thread_id: &str) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "UPDATE messages SET thread_id = ?2 WHERE message_id = ?1",
            params![message_id, thread_id],
        )?;
        Ok(())
    }

    pub fn message_sequence(&self, message_id: &str) -> Result<Option<u64>, Error> {
        let conn = self.conn();
        conn.query_row(
            "SELECT sequence FROM messages WHERE message_id = ?1",
            params![message_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map(|opt| opt.map(|v| v as u64))
        .map_err(Error::from)
    }

    // --- groups -----------------------------------------------------------

    pub fn insert_group(&self, group: &Group) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO groups (group_id, name, description, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![group.group_id, group.name, group.description, group.created_at, group.created_by],
        )?;
        Ok(())
    }

    pub fn delete_group(&self, name: &str) -> Result<bool, Error> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM groups WHERE name = ?1", params![name])?;
        Ok(changed > 0)
    }

    pub fn get_group_by_name(&self, name: &str) -> Result<Option<Group>, Error> {
        let conn = self.conn();
        let base: Option<(String, String, Option<String>, String, String)> = conn
            .query_row(
                "SELECT group_id, name, description, created_at, created_by FROM groups WHERE name = ?1",
                params![name],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        let Some((group_id, name, description, created_at, created_by)) = base else {
            return Ok(None);
        };
        let members = self.list_group_members(&group_id)?;
        Ok(Some(Group {
            group_id,
            name,
            description,
            created_at,
            created_by,
            members,
        }))
    }

    pub fn list_group_members(&self, group_id: &str) -> Result<Vec<GroupMember>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT group_id, member_type, member_value, added_at, added_by FROM group_members WHERE group_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![group_id], |r| {
                let member_type: String = r.get(1)?;
                Ok(GroupMember {
                    group_id: r.get(0)?,
                    member_type: if member_type == "role" {
                        crate::models::MemberType::Role
                    } else {
                        crate::models::MemberType::Agent
                    },
                    member_value: r.get(2)?,
                    added_at: r.get(3)?,
                    added_by: r.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn list_groups(&self) -> Result<Vec<Group>, Error> {
        let conn = self.conn();
        let names: Vec<String> = {
            let mut stmt = conn.prepare("SELECT name FROM groups ORDER BY created_at ASC")?;
            stmt.query_map([], |r| r.get(0))?.filter_map(|r| r.ok()).collect()
        };
        drop(conn);
        names
            .into_iter()
            .filter_map(|n| self.get_group_by_name(&n).transpose())
            .collect()
    }

    pub fn add_group_member(&self, member: &GroupMember) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, member_type, member_value, added_at, added_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                member.group_id,
                member_type_str(member.member_type),
                member.member_value,
                member.added_at,
                member.added_by
            ],
        )?;
        Ok(())
    }

    pub fn remove_group_member(&self, group_id: &str, member_value: &str) -> Result<bool, Error> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND member_value = ?2",
            params![group_id, member_value],
        )?;
        Ok(changed > 0)
    }

    // --- read markers -----------------------------------------------------------

    /// `INSERT OR IGNORE` stub row with `read_at = NULL`, one per recipient.
    pub fn insert_read_marker_stub(&self, viewer_id: &str, message_id: &str) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO read_markers (viewer_id, message_id, read_at) VALUES (?1, ?2, NULL)",
            params![viewer_id, message_id],
        )?;
        Ok(())
    }

    /// Idempotent: marking an already-read message again is a no-op.
    pub fn mark_read(&self, viewer_id: &str, message_id: &str, at: &str) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "UPDATE read_markers SET read_at = ?3 WHERE viewer_id = ?1 AND message_id = ?2 AND read_at IS NULL",
            params![viewer_id, message_id, at],
        )?;
        Ok(())
    }

    pub fn has_read_marker(&self, viewer_id: &str, message_id: &str) -> Result<bool, Error> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM read_markers WHERE viewer_id = ?1 AND message_id = ?2",
            params![viewer_id, message_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_read_markers_for_message(&self, message_id: &str) -> Result<Vec<ReadMarker>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT viewer_id, message_id, read_at FROM read_markers WHERE message_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![message_id], |r| {
                Ok(ReadMarker {
                    viewer_id: r.get(0)?,
                    message_id: r.get(1)?,
                    read_at: r.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// `message_id`s with a pending (`read_at IS NULL`) read-marker for
    /// `viewer_id` — i.e. messages the viewer was an actual recipient of and
    /// has not yet read. Distinct from "no read-marker row at all", which
    /// also covers messages the viewer was never addressed to.
    pub fn pending_message_ids_for_viewer(&self, viewer_id: &str) -> Result<Vec<String>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT message_id FROM read_markers WHERE viewer_id = ?1 AND read_at IS NULL",
        )?;
        let rows = stmt
            .query_map(params![viewer_id], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// `message_id`s with any read-marker row for `viewer_id`, read or not
    /// -- i.e. messages the viewer was an actual dispatch recipient of,
    /// used by `message.list?for_agent=` which (unlike `unread_for_agent`)
    /// doesn't care whether the viewer has read them yet.
    pub fn recipient_message_ids_for_viewer(&self, viewer_id: &str) -> Result<Vec<String>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT message_id FROM read_markers WHERE viewer_id = ?1")?;
        let rows = stmt
            .query_map(params![viewer_id], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn unread_count_for_agent(&self, agent_id: &str) -> Result<i64, Error> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM read_markers WHERE viewer_id = ?1 AND read_at IS NULL",
            params![agent_id],
            |r| r.get(0),
        )
        .map_err(Error::from)
    }

    // --- subscriptions -----------------------------------------------------------

    pub fn insert_subscription(&self, sub: &Subscription) -> Result<(), Error> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO subscriptions (subscription_id, session_id, filter_type, scope_type, scope_value, mention, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sub.subscription_id,
                sub.session_id,
                filter_type_str(sub.filter_type),
                sub.scope_type,
                sub.scope_value,
                sub.mention,
                sub.created_at
            ],
        )?;
        Ok(())
    }

    pub fn delete_subscription(&self, subscription_id: &str) -> Result<bool, Error> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM subscriptions WHERE subscription_id = ?1",
            params![subscription_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_subscriptions_for_session(&self, session_id: &str) -> Result<usize, Error> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM subscriptions WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(changed)
    }

    pub fn list_subscriptions(&self, session_id: &str) -> Result<Vec<Subscription>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT subscription_id, session_id, filter_type, scope_type, scope_value, mention, created_at
             FROM subscriptions WHERE session_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![session_id], row_to_subscription)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// All sessions with subscriptions matching a given scope, used by
    /// dispatch's scope-expansion path.
    pub fn sessions_subscribed_to_scope(&self, scope_type: &str, scope_value: &str) -> Result<Vec<String>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT session_id FROM subscriptions
             WHERE filter_type = 'scope' AND scope_type = ?1 AND scope_value = ?2",
        )?;
        let rows = stmt
            .query_map(params![scope_type, scope_value], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn sessions_subscribed_to_all(&self) -> Result<Vec<String>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT session_id FROM subscriptions WHERE filter_type = 'all'")?;
        let rows = stmt.query_map([], |r| r.get(0))?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    /// Agents with a session in the same filter set as `reply scope`
    /// expansion: every agent who has previously sent/received a message in
    /// this thread, found by scanning thread messages' authors.
    pub fn thread_participant_agent_ids(&self, thread_id: &str) -> Result<Vec<String>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT agent_id FROM messages WHERE thread_id = ?1")?;
        let rows = stmt
            .query_map(params![thread_id], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[derive(Debug, Default)]
pub struct MessageFilter {
    pub thread_id: Option<String>,
    pub author_id: Option<String>,
    pub mention: Option<String>,
    /// `(type, value)`, matched against the stored `scopes` JSON the same
    /// best-effort way `mention` matches `mentions` -- a `LIKE` over the
    /// serialized array rather than a side table.
    pub scope: Option<(String, String)>,
    pub ref_: Option<(String, String)>,
    pub after_sequence: Option<u64>,
    pub page_size: u32,
    pub page: u32,
    pub sort_order_desc: bool,
}

impl MessageFilter {
    pub fn new() -> Self {
        MessageFilter {
            page_size: 50,
            page: 1,
            ..Default::default()
        }
    }
}

fn kind_str(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Agent => "agent",
        AgentKind::User => "user",
    }
}

fn member_type_str(member_type: crate::models::MemberType) -> &'static str {
    match member_type {
        crate::models::MemberType::Agent => "agent",
        crate::models::MemberType::Role => "role",
    }
}

fn filter_type_str(filter_type: FilterType) -> &'static str {
    match filter_type {
        FilterType::Scope => "scope",
        FilterType::Mention => "mention",
        FilterType::All => "all",
    }
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<Agent> {
    let kind: String = row.get(1)?;
    Ok(Agent {
        agent_id: row.get(0)?,
        kind: if kind == "user" { AgentKind::User } else { AgentKind::Agent },
        role: row.get(2)?,
        module: row.get(3)?,
        display: row.get(4)?,
        registered_at: row.get(5)?,
        last_seen_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        agent_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
    })
}

fn row_to_thread(row: &rusqlite::Row) -> rusqlite::Result<Thread> {
    Ok(Thread {
        thread_id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        created_by: row.get(3)?,
        message_count: row.get(4)?,
        last_message_at: row.get(5)?,
        unread_count: None,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let structured: Option<String> = row.get(9)?;
    let scopes: String = row.get(10)?;
    let refs: String = row.get(11)?;
    let mentions: String = row.get(12)?;
    let deleted_at: Option<String> = row.get(6)?;

    let content: String = row.get(8)?;
    let (content, structured) = if deleted_at.is_some() {
        (String::new(), None)
    } else {
        (content, structured.and_then(|s| serde_json::from_str::<Value>(&s).ok()))
    };

    Ok(Message {
        message_id: row.get(0)?,
        thread_id: row.get(1)?,
        agent_id: row.get(2)?,
        session_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        deleted_at,
        format: row.get(7)?,
        content,
        structured,
        scopes: serde_json::from_str::<Vec<Scope>>(&scopes).unwrap_or_default(),
        refs: serde_json::from_str::<Vec<Scope>>(&refs).unwrap_or_default(),
        mentions: serde_json::from_str::<Vec<String>>(&mentions).unwrap_or_default(),
        reply_to: row.get(13)?,
        disclosed: row.get::<_, i64>(14)? != 0,
        authored_by: row.get(15)?,
    })
}

fn row_to_subscription(row: &rusqlite::Row) -> rusqlite::Result<Subscription> {
    let filter_type: String = row.get(2)?;
    Ok(Subscription {
        subscription_id: row.get(0)?,
        session_id: row.get(1)?,
        filter_type: match filter_type.as_str() {
            "scope" => FilterType::Scope,
            "mention" => FilterType::Mention,
            _ => FilterType::All,
        },
        scope_type: row.get(3)?,
        scope_value: row.get(4)?,
        mention: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_event_row_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let inserted_first = store
            .insert_event_row("evt_1", 1, "agent.register", "t", "d_1", "{}")
            .unwrap();
        let inserted_second = store
            .insert_event_row("evt_1", 1, "agent.register", "t", "d_1", "{}")
            .unwrap();
        assert!(inserted_first);
        assert!(!inserted_second);
        assert_eq!(store.max_sequence().unwrap(), 1);
    }

    #[test]
    fn gap_report_finds_missing_sequence_within_an_origin() {
        let store = Store::open_in_memory().unwrap();
        store.insert_event_row("evt_1", 1, "t", "x", "d_1", "{}").unwrap();
        store.insert_event_row("evt_3", 3, "t", "x", "d_1", "{}").unwrap();
        let gaps = store.gap_report().unwrap();
        assert_eq!(gaps, vec![("d_1".to_string(), 2..3)]);
    }

    #[test]
    fn everyone_group_seed_is_left_to_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_group_by_name("everyone").unwrap().is_none());
    }
}
