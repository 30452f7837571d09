//! Reminders stored in SQLite.
//!
//! A reminder is due on a calendar `date` (`YYYY-MM-DD`) at a wall-clock
//! `time` (`HH:MM`). Listings are ordered by date, then time, then id.
//! The same functions back the `/reminders` routes and the
//! `add_reminder` / `list_reminders` tools.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

pub const PRIORITIES: &[&str] = &["high", "medium", "low"];

#[derive(Debug, Error)]
pub enum ReminderError {
    #[error("{0}")]
    Invalid(String),

    #[error("Reminder {0} not found")]
    NotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Reminder {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub date: String,
    pub time: String,
    pub priority: String,
    pub category: String,
    pub completed: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewReminder {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub date: String,
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default = "default_category")]
    pub category: String,
}

impl NewReminder {
    pub fn new(title: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            date: date.into(),
            time: default_time(),
            priority: default_priority(),
            category: default_category(),
        }
    }
}

fn default_time() -> String {
    "09:00".to_string()
}
fn default_priority() -> String {
    "medium".to_string()
}
fn default_category() -> String {
    "general".to_string()
}

/// Partial update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReminderUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub priority: Option<String>,
    pub category: Option<String>,
    pub completed: Option<bool>,
}

/// Reminders sharing one due date.
#[derive(Debug, Clone, Serialize)]
pub struct RemindersByDate {
    pub date: String,
    pub reminders: Vec<Reminder>,
}

const COLUMNS: &str =
    "id, title, description, date, time, priority, category, completed, created_at";

fn from_row(row: &SqliteRow) -> Reminder {
    Reminder {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        date: row.get("date"),
        time: row.get("time"),
        priority: row.get("priority"),
        category: row.get("category"),
        completed: row.get::<i64, _>("completed") != 0,
        created_at: row.get("created_at"),
    }
}

fn check_fields(title: &str, date: &str, time: &str, priority: &str) -> Result<(), ReminderError> {
    if title.trim().is_empty() {
        return Err(ReminderError::Invalid("title must not be empty".to_string()));
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| ReminderError::Invalid(format!("date must be YYYY-MM-DD, got '{}'", date)))?;
    NaiveTime::parse_from_str(time, "%H:%M")
        .map_err(|_| ReminderError::Invalid(format!("time must be HH:MM, got '{}'", time)))?;
    if !PRIORITIES.contains(&priority) {
        return Err(ReminderError::Invalid(format!(
            "priority must be one of high, medium, low, got '{}'",
            priority
        )));
    }
    Ok(())
}

pub async fn create(pool: &SqlitePool, new: NewReminder) -> Result<Reminder, ReminderError> {
    let title = new.title.trim();
    check_fields(title, &new.date, &new.time, &new.priority)?;

    let created_at = chrono::Utc::now().timestamp();
    let id = sqlx::query(
        "INSERT INTO reminders (title, description, date, time, priority, category, completed, created_at)
         VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(title)
    .bind(&new.description)
    .bind(&new.date)
    .bind(&new.time)
    .bind(&new.priority)
    .bind(&new.category)
    .bind(created_at)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(Reminder {
        id,
        title: title.to_string(),
        description: new.description,
        date: new.date,
        time: new.time,
        priority: new.priority,
        category: new.category,
        completed: false,
        created_at,
    })
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Reminder, ReminderError> {
    let row = sqlx::query(&format!("SELECT {} FROM reminders WHERE id = ?", COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).ok_or(ReminderError::NotFound(id))
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Reminder>, ReminderError> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM reminders ORDER BY date ASC, time ASC, id ASC",
        COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

/// Reminders with the given completion state, grouped by date in
/// ascending date order.
pub async fn grouped(pool: &SqlitePool, completed: bool) -> Result<Vec<RemindersByDate>, ReminderError> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM reminders WHERE completed = ? ORDER BY date ASC, time ASC, id ASC",
        COLUMNS
    ))
    .bind(completed as i64)
    .fetch_all(pool)
    .await?;

    let mut groups: Vec<RemindersByDate> = Vec::new();
    for reminder in rows.iter().map(from_row) {
        match groups.last_mut() {
            Some(group) if group.date == reminder.date => group.reminders.push(reminder),
            _ => groups.push(RemindersByDate {
                date: reminder.date.clone(),
                reminders: vec![reminder],
            }),
        }
    }
    Ok(groups)
}

/// Open reminders due between `today` and `today + days`, inclusive.
pub async fn upcoming(
    pool: &SqlitePool,
    today: NaiveDate,
    days: u32,
) -> Result<Vec<Reminder>, ReminderError> {
    let until = today + chrono::Duration::days(i64::from(days));
    let rows = sqlx::query(&format!(
        "SELECT {} FROM reminders
         WHERE completed = 0 AND date >= ? AND date <= ?
         ORDER BY date ASC, time ASC, id ASC",
        COLUMNS
    ))
    .bind(today.format("%Y-%m-%d").to_string())
    .bind(until.format("%Y-%m-%d").to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

/// Case-insensitive substring match on title or description.
pub async fn search(pool: &SqlitePool, query: &str) -> Result<Vec<Reminder>, ReminderError> {
    let pattern = format!("%{}%", query.trim().to_lowercase());
    let rows = sqlx::query(&format!(
        "SELECT {} FROM reminders
         WHERE lower(title) LIKE ? OR lower(description) LIKE ?
         ORDER BY date ASC, time ASC, id ASC",
        COLUMNS
    ))
    .bind(&pattern)
    .bind(&pattern)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

pub async fn update(
    pool: &SqlitePool,
    id: i64,
    changes: ReminderUpdate,
) -> Result<Reminder, ReminderError> {
    let mut reminder = get(pool, id).await?;
    if let Some(title) = changes.title {
        reminder.title = title.trim().to_string();
    }
    if let Some(description) = changes.description {
        reminder.description = description;
    }
    if let Some(date) = changes.date {
        reminder.date = date;
    }
    if let Some(time) = changes.time {
        reminder.time = time;
    }
    if let Some(priority) = changes.priority {
        reminder.priority = priority;
    }
    if let Some(category) = changes.category {
        reminder.category = category;
    }
    if let Some(completed) = changes.completed {
        reminder.completed = completed;
    }
    check_fields(&reminder.title, &reminder.date, &reminder.time, &reminder.priority)?;

    sqlx::query(
        "UPDATE reminders
         SET title = ?, description = ?, date = ?, time = ?, priority = ?, category = ?, completed = ?
         WHERE id = ?",
    )
    .bind(&reminder.title)
    .bind(&reminder.description)
    .bind(&reminder.date)
    .bind(&reminder.time)
    .bind(&reminder.priority)
    .bind(&reminder.category)
    .bind(reminder.completed as i64)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(reminder)
}

pub async fn complete(pool: &SqlitePool, id: i64) -> Result<Reminder, ReminderError> {
    update(
        pool,
        id,
        ReminderUpdate {
            completed: Some(true),
            ..ReminderUpdate::default()
        },
    )
    .await
}

/// Delete reminder `id`, returning it as it was.
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<Reminder, ReminderError> {
    let reminder = get(pool, id).await?;
    sqlx::query("DELETE FROM reminders WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(reminder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn pool(dir: &TempDir) -> SqlitePool {
        let mut cfg = Config::minimal();
        cfg.db.path = dir.path().join("relay.sqlite");
        crate::db::open(&cfg).await.unwrap()
    }

    fn at(title: &str, date: &str, time: &str) -> NewReminder {
        NewReminder {
            time: time.to_string(),
            ..NewReminder::new(title, date)
        }
    }

    #[tokio::test]
    async fn create_fills_defaults_and_lists_in_due_order() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;

        let late = create(&pool, at("file taxes", "2026-04-15", "17:00")).await.unwrap();
        let early = create(&pool, at("call bank", "2026-04-15", "08:30")).await.unwrap();
        create(&pool, NewReminder::new("dentist", "2026-03-02")).await.unwrap();

        assert_eq!(late.priority, "medium");
        assert_eq!(late.category, "general");
        assert!(!late.completed);

        let all = list_all(&pool).await.unwrap();
        let titles: Vec<&str> = all.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["dentist", "call bank", "file taxes"]);
        assert_eq!(get(&pool, early.id).await.unwrap(), early);
    }

    #[tokio::test]
    async fn invalid_fields_are_rejected() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;

        for bad in [
            NewReminder::new("  ", "2026-01-01"),
            NewReminder::new("x", "next friday"),
            at("x", "2026-01-01", "9am"),
            NewReminder {
                priority: "urgent".to_string(),
                ..NewReminder::new("x", "2026-01-01")
            },
        ] {
            let err = create(&pool, bad).await.unwrap_err();
            assert!(matches!(err, ReminderError::Invalid(_)), "{:?}", err);
        }
        assert!(list_all(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn grouping_splits_by_date_and_status() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;

        create(&pool, NewReminder::new("a", "2026-05-01")).await.unwrap();
        create(&pool, NewReminder::new("b", "2026-05-01")).await.unwrap();
        let c = create(&pool, NewReminder::new("c", "2026-05-03")).await.unwrap();
        let d = create(&pool, NewReminder::new("d", "2026-05-02")).await.unwrap();
        complete(&pool, d.id).await.unwrap();

        let open = grouped(&pool, false).await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].date, "2026-05-01");
        assert_eq!(open[0].reminders.len(), 2);
        assert_eq!(open[1].reminders[0].id, c.id);

        let done = grouped(&pool, true).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].reminders[0].title, "d");
        assert!(done[0].reminders[0].completed);
    }

    #[tokio::test]
    async fn update_merges_and_validates() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let r = create(&pool, NewReminder::new("draft", "2026-06-01")).await.unwrap();

        let updated = update(
            &pool,
            r.id,
            ReminderUpdate {
                title: Some("final".to_string()),
                priority: Some("high".to_string()),
                ..ReminderUpdate::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.title, "final");
        assert_eq!(updated.priority, "high");
        assert_eq!(updated.date, "2026-06-01");

        let err = update(
            &pool,
            r.id,
            ReminderUpdate {
                date: Some("June".to_string()),
                ..ReminderUpdate::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReminderError::Invalid(_)));
        assert_eq!(get(&pool, r.id).await.unwrap().date, "2026-06-01");
    }

    #[tokio::test]
    async fn delete_and_missing_ids() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let r = create(&pool, NewReminder::new("gone", "2026-06-01")).await.unwrap();

        assert_eq!(delete(&pool, r.id).await.unwrap().title, "gone");
        assert!(matches!(delete(&pool, r.id).await, Err(ReminderError::NotFound(_))));
        assert!(matches!(complete(&pool, 999).await, Err(ReminderError::NotFound(999))));
    }

    #[tokio::test]
    async fn upcoming_window_and_search() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let today = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();

        create(&pool, NewReminder::new("past", "2026-06-30")).await.unwrap();
        create(&pool, NewReminder::new("Renew passport", "2026-07-01")).await.unwrap();
        create(&pool, NewReminder::new("trip", "2026-07-08")).await.unwrap();
        create(&pool, NewReminder::new("later", "2026-07-09")).await.unwrap();

        let soon = upcoming(&pool, today, 7).await.unwrap();
        let titles: Vec<&str> = soon.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Renew passport", "trip"]);

        let found = search(&pool, "PASSPORT").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].date, "2026-07-01");
    }
}
