//! Metadata repository: a rusqlite-backed store for projects, their workflow
//! step records, and their file references.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::errors::ProjectDataAccessError;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub subject: String,
    pub target_length: i64,
    pub status: String,
    pub config: Value,
    pub output_summary: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowStepRecord {
    pub id: i64,
    pub project_id: String,
    pub step_number: i64,
    pub step_name: String,
    pub status: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub input_data: Value,
    pub output_data: Value,
    pub error_message: Option<String>,
    pub retry_count: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FileReferenceRecord {
    pub id: i64,
    pub project_id: String,
    pub file_type: String,
    pub file_category: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: Option<String>,
    pub metadata: Value,
    pub is_temporary: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProjectStatus {
    pub project: ProjectRecord,
    pub steps: Vec<WorkflowStepRecord>,
    pub files: Vec<FileReferenceRecord>,
}

fn access_error(operation: &str, err: impl std::fmt::Display) -> ProjectDataAccessError {
    ProjectDataAccessError {
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

pub struct ProjectRepository {
    conn: Connection,
}

impl ProjectRepository {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open metadata database")?;
        let repo = Self { conn };
        repo.init()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory metadata database")?;
        let repo = Self { conn };
        repo.init()?;
        Ok(repo)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;").context("failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    subject TEXT NOT NULL,
                    target_length INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'created',
                    config_json TEXT NOT NULL DEFAULT '{}',
                    output_summary_json TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    step_number INTEGER NOT NULL,
                    step_name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'running', 'completed', 'failed', 'skipped', 'cancelled')),
                    started_at TEXT,
                    completed_at TEXT,
                    input_data_json TEXT NOT NULL DEFAULT '{}',
                    output_data_json TEXT NOT NULL DEFAULT '{}',
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(project_id, step_name)
                );

                CREATE TABLE IF NOT EXISTS project_files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    file_type TEXT NOT NULL
                        CHECK (file_type IN ('audio', 'video', 'image', 'script', 'metadata', 'temp', 'final', 'backup', 'original')),
                    file_category TEXT NOT NULL DEFAULT '',
                    file_path TEXT NOT NULL,
                    file_name TEXT NOT NULL,
                    file_size INTEGER NOT NULL DEFAULT 0,
                    mime_type TEXT,
                    metadata_json TEXT NOT NULL DEFAULT '{}',
                    is_temporary INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_workflow_steps_project ON workflow_steps(project_id);
                CREATE INDEX IF NOT EXISTS idx_project_files_project ON project_files(project_id);
                ",
            )
            .context("failed to run metadata repository migrations")?;
        Ok(())
    }

    pub fn create_project(&self, id: &str, subject: &str, target_length: i64, config: Option<Value>, status: Option<&str>) -> Result<bool> {
        if self.get_project(id)?.is_some() {
            return Err(access_error("create_project", format!("project '{id}' already exists")).into());
        }
        let config = config.unwrap_or_else(|| Value::Object(Default::default()));
        self.conn
            .execute(
                "INSERT INTO projects (id, subject, target_length, status, config_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, subject, target_length, status.unwrap_or("created"), config.to_string()],
            )
            .map_err(|e| access_error("create_project", e))?;
        Ok(true)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, subject, target_length, status, config_json, output_summary_json, created_at, updated_at FROM projects WHERE id = ?1")
            .map_err(|e| access_error("get_project", e))?;
        let mut rows = stmt
            .query_map(params![id], project_from_row)
            .map_err(|e| access_error("get_project", e))?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(|e| access_error("get_project", e))?)),
            None => Ok(None),
        }
    }

    /// Updates whitelisted project fields. `config`/`output_summary`, when
    /// present, are re-serialized under their `*_json` columns.
    pub fn update_project(&self, id: &str, subject: Option<&str>, target_length: Option<i64>, status: Option<&str>, config: Option<&Value>, output_summary: Option<&Value>) -> Result<()> {
        if self.get_project(id)?.is_none() {
            return Err(access_error("update_project", format!("project '{id}' not found")).into());
        }
        if let Some(subject) = subject {
            self.conn
                .execute("UPDATE projects SET subject = ?1, updated_at = datetime('now') WHERE id = ?2", params![subject, id])
                .map_err(|e| access_error("update_project", e))?;
        }
        if let Some(target_length) = target_length {
            self.conn
                .execute("UPDATE projects SET target_length = ?1, updated_at = datetime('now') WHERE id = ?2", params![target_length, id])
                .map_err(|e| access_error("update_project", e))?;
        }
        if let Some(status) = status {
            self.conn
                .execute("UPDATE projects SET status = ?1, updated_at = datetime('now') WHERE id = ?2", params![status, id])
                .map_err(|e| access_error("update_project", e))?;
        }
        if let Some(config) = config {
            self.conn
                .execute("UPDATE projects SET config_json = ?1, updated_at = datetime('now') WHERE id = ?2", params![config.to_string(), id])
                .map_err(|e| access_error("update_project", e))?;
        }
        if let Some(output_summary) = output_summary {
            self.conn
                .execute(
                    "UPDATE projects SET output_summary_json = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![output_summary.to_string(), id],
                )
                .map_err(|e| access_error("update_project", e))?;
        }
        Ok(())
    }

    pub fn delete_project(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .map_err(|e| access_error("delete_project", e))?;
        Ok(count > 0)
    }

    pub fn create_workflow_step(&self, project_id: &str, step_number: i64, step_name: &str, status: Option<&str>, input_data: Option<&Value>) -> Result<i64> {
        let input_data = match input_data {
            Some(value) if value.is_object() => value.clone(),
            Some(_) => return Err(access_error("create_workflow_step", "Invalid data format: input_data must be a map").into()),
            None => Value::Object(Default::default()),
        };
        self.conn
            .execute(
                "INSERT INTO workflow_steps (project_id, step_number, step_name, status, input_data_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![project_id, step_number, step_name, status.unwrap_or("pending"), input_data.to_string()],
            )
            .map_err(|e| access_error("create_workflow_step", e))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_workflow_step(&self, project_id: &str, step_name: &str) -> Result<Option<WorkflowStepRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, step_number, step_name, status, started_at, completed_at, input_data_json, output_data_json, error_message, retry_count
                 FROM workflow_steps WHERE project_id = ?1 AND step_name = ?2",
            )
            .map_err(|e| access_error("get_workflow_step", e))?;
        let mut rows = stmt
            .query_map(params![project_id, step_name], step_from_row)
            .map_err(|e| access_error("get_workflow_step", e))?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(|e| access_error("get_workflow_step", e))?)),
            None => Ok(None),
        }
    }

    pub fn update_workflow_step_status(&self, project_id: &str, step_name: &str, status: &str, error: Option<&str>) -> Result<()> {
        let is_terminal = matches!(status, "completed" | "failed" | "skipped" | "cancelled");
        if status == "running" {
            self.conn
                .execute(
                    "UPDATE workflow_steps SET status = ?1, error_message = ?2, started_at = datetime('now') WHERE project_id = ?3 AND step_name = ?4",
                    params![status, error, project_id, step_name],
                )
                .map_err(|e| access_error("update_workflow_step_status", e))?;
        } else if is_terminal {
            self.conn
                .execute(
                    "UPDATE workflow_steps SET status = ?1, error_message = ?2, completed_at = datetime('now') WHERE project_id = ?3 AND step_name = ?4",
                    params![status, error, project_id, step_name],
                )
                .map_err(|e| access_error("update_workflow_step_status", e))?;
        } else {
            self.conn
                .execute(
                    "UPDATE workflow_steps SET status = ?1, error_message = ?2 WHERE project_id = ?3 AND step_name = ?4",
                    params![status, error, project_id, step_name],
                )
                .map_err(|e| access_error("update_workflow_step_status", e))?;
        }
        Ok(())
    }

    pub fn save_step_result(&self, project_id: &str, step_name: &str, output_data: &Value, status: Option<&str>) -> Result<()> {
        let status = status.unwrap_or("completed");
        self.conn
            .execute(
                "UPDATE workflow_steps SET status = ?1, output_data_json = ?2, completed_at = datetime('now') WHERE project_id = ?3 AND step_name = ?4",
                params![status, output_data.to_string(), project_id, step_name],
            )
            .map_err(|e| access_error("save_step_result", e))?;
        Ok(())
    }

    pub fn get_workflow_steps(&self, project_id: &str) -> Result<Vec<WorkflowStepRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, step_number, step_name, status, started_at, completed_at, input_data_json, output_data_json, error_message, retry_count
                 FROM workflow_steps WHERE project_id = ?1 ORDER BY step_number",
            )
            .map_err(|e| access_error("get_workflow_steps", e))?;
        let rows = stmt.query_map(params![project_id], step_from_row).map_err(|e| access_error("get_workflow_steps", e))?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.map_err(|e| access_error("get_workflow_steps", e))?);
        }
        Ok(steps)
    }

    /// Resolves the previous step's `output_data` under the hard-coded
    /// production step order, a convenience for the Yukkuri pipeline
    /// specifically; generic callers should assemble merged input themselves.
    pub fn get_step_input(&self, project_id: &str, step_order: &[&str], step_name: &str) -> Result<Value> {
        let position = step_order.iter().position(|s| *s == step_name);
        match position {
            Some(0) | None => Ok(Value::Object(Default::default())),
            Some(index) => {
                let previous = step_order[index - 1];
                match self.get_workflow_step(project_id, previous)? {
                    Some(record) => Ok(record.output_data),
                    None => Ok(Value::Object(Default::default())),
                }
            }
        }
    }

    pub fn register_file_reference(
        &self,
        project_id: &str,
        file_type: &str,
        file_category: &str,
        file_path: &str,
        file_name: &str,
        file_size: i64,
        mime_type: Option<&str>,
        metadata: Option<&Value>,
        is_temporary: bool,
    ) -> Result<i64> {
        let metadata = metadata.cloned().unwrap_or_else(|| Value::Object(Default::default()));
        self.conn
            .execute(
                "INSERT INTO project_files (project_id, file_type, file_category, file_path, file_name, file_size, mime_type, metadata_json, is_temporary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![project_id, file_type, file_category, file_path, file_name, file_size, mime_type, metadata.to_string(), is_temporary as i64],
            )
            .map_err(|e| access_error("register_file_reference", e))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn delete_file_reference(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM project_files WHERE id = ?1", params![id])
            .map_err(|e| access_error("delete_file_reference", e))?;
        Ok(count > 0)
    }

    pub fn get_file_reference(&self, id: i64) -> Result<Option<FileReferenceRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, file_type, file_category, file_path, file_name, file_size, mime_type, metadata_json, is_temporary, created_at
                 FROM project_files WHERE id = ?1",
            )
            .map_err(|e| access_error("get_file_reference", e))?;
        let mut rows = stmt.query_map(params![id], file_from_row).map_err(|e| access_error("get_file_reference", e))?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(|e| access_error("get_file_reference", e))?)),
            None => Ok(None),
        }
    }

    pub fn get_files_by_query(&self, project_id: &str, file_type: Option<&str>, file_category: Option<&str>, is_temporary: Option<bool>) -> Result<Vec<FileReferenceRecord>> {
        let sql = "SELECT id, project_id, file_type, file_category, file_path, file_name, file_size, mime_type, metadata_json, is_temporary, created_at
             FROM project_files
             WHERE project_id = ?1
               AND (?2 IS NULL OR file_type = ?2)
               AND (?3 IS NULL OR file_category = ?3)
               AND (?4 IS NULL OR is_temporary = ?4)
             ORDER BY created_at";

        let mut stmt = self.conn.prepare(sql).map_err(|e| access_error("get_files_by_query", e))?;
        let rows = stmt
            .query_map(params![project_id, file_type, file_category, is_temporary.map(|b| b as i64)], file_from_row)
            .map_err(|e| access_error("get_files_by_query", e))?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(|e| access_error("get_files_by_query", e))?);
        }
        Ok(files)
    }

    pub fn update_file_metadata(&self, id: i64, file_path: Option<&str>, file_size: Option<i64>, metadata: Option<&Value>) -> Result<()> {
        if let Some(file_path) = file_path {
            self.conn
                .execute("UPDATE project_files SET file_path = ?1 WHERE id = ?2", params![file_path, id])
                .map_err(|e| access_error("update_file_metadata", e))?;
        }
        if let Some(file_size) = file_size {
            self.conn
                .execute("UPDATE project_files SET file_size = ?1 WHERE id = ?2", params![file_size, id])
                .map_err(|e| access_error("update_file_metadata", e))?;
        }
        if let Some(metadata) = metadata {
            self.conn
                .execute("UPDATE project_files SET metadata_json = ?1 WHERE id = ?2", params![metadata.to_string(), id])
                .map_err(|e| access_error("update_file_metadata", e))?;
        }
        Ok(())
    }

    pub fn get_project_status(&self, project_id: &str) -> Result<Option<ProjectStatus>> {
        let project = match self.get_project(project_id)? {
            Some(project) => project,
            None => return Ok(None),
        };
        let steps = self.get_workflow_steps(project_id)?;
        let files = self.get_files_by_query(project_id, None, None, None)?;
        Ok(Some(ProjectStatus { project, steps, files }))
    }
}

fn project_from_row(row: &rusqlite::Row) -> rusqlite::Result<ProjectRecord> {
    let config_json: String = row.get(4)?;
    let output_summary_json: String = row.get(5)?;
    Ok(ProjectRecord {
        id: row.get(0)?,
        subject: row.get(1)?,
        target_length: row.get(2)?,
        status: row.get(3)?,
        config: serde_json::from_str(&config_json).unwrap_or(Value::Null),
        output_summary: serde_json::from_str(&output_summary_json).unwrap_or(Value::Null),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn step_from_row(row: &rusqlite::Row) -> rusqlite::Result<WorkflowStepRecord> {
    let input_data_json: String = row.get(7)?;
    let output_data_json: String = row.get(8)?;
    Ok(WorkflowStepRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        step_number: row.get(2)?,
        step_name: row.get(3)?,
        status: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        input_data: serde_json::from_str(&input_data_json).unwrap_or(Value::Null),
        output_data: serde_json::from_str(&output_data_json).unwrap_or(Value::Null),
        error_message: row.get(9)?,
        retry_count: row.get(10)?,
    })
}

fn file_from_row(row: &rusqlite::Row) -> rusqlite::Result<FileReferenceRecord> {
    let metadata_json: String = row.get(8)?;
    let is_temporary: i64 = row.get(9)?;
    Ok(FileReferenceRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        file_type: row.get(2)?,
        file_category: row.get(3)?,
        file_path: row.get(4)?,
        file_name: row.get(5)?,
        file_size: row.get(6)?,
        mime_type: row.get(7)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
        is_temporary: is_temporary != 0,
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_and_get_project_round_trips() -> Result<()> {
        let repo = ProjectRepository::open_in_memory()?;
        repo.create_project("proj-1", "a video about cats", 600, None, None)?;
        let project = repo.get_project("proj-1")?.expect("project should exist");
        assert_eq!(project.subject, "a video about cats");
        assert_eq!(project.target_length, 600);
        assert_eq!(project.status, "created");
        Ok(())
    }

    #[test]
    fn create_project_rejects_duplicate_id() -> Result<()> {
        let repo = ProjectRepository::open_in_memory()?;
        repo.create_project("proj-1", "subject", 60, None, None)?;
        let err = repo.create_project("proj-1", "subject", 60, None, None).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        Ok(())
    }

    #[test]
    fn update_project_rejects_missing_id() {
        let repo = ProjectRepository::open_in_memory().unwrap();
        let err = repo.update_project("ghost", Some("x"), None, None, None, None).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn workflow_step_lifecycle_stamps_timestamps() -> Result<()> {
        let repo = ProjectRepository::open_in_memory()?;
        repo.create_project("proj-1", "subject", 60, None, None)?;
        repo.create_workflow_step("proj-1", 1, "script", None, None)?;
        repo.update_workflow_step_status("proj-1", "script", "running", None)?;
        let running = repo.get_workflow_step("proj-1", "script")?.unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        repo.save_step_result("proj-1", "script", &json!({"text": "hello"}), None)?;
        let done = repo.get_workflow_step("proj-1", "script")?.unwrap();
        assert_eq!(done.status, "completed");
        assert!(done.completed_at.is_some());
        assert_eq!(done.output_data["text"], "hello");
        Ok(())
    }

    #[test]
    fn create_workflow_step_rejects_non_map_input() {
        let repo = ProjectRepository::open_in_memory().unwrap();
        repo.create_project("proj-1", "subject", 60, None, None).unwrap();
        let err = repo
            .create_workflow_step("proj-1", 1, "script", None, Some(&json!("not a map")))
            .unwrap_err();
        assert!(err.to_string().contains("Invalid data format"));
    }

    #[test]
    fn delete_project_cascades_to_steps_and_files() -> Result<()> {
        let repo = ProjectRepository::open_in_memory()?;
        repo.create_project("proj-1", "subject", 60, None, None)?;
        repo.create_workflow_step("proj-1", 1, "script", None, None)?;
        repo.register_file_reference("proj-1", "script", "draft", "files/scripts/a.txt", "a.txt", 10, None, None, false)?;

        assert!(repo.delete_project("proj-1")?);
        assert!(repo.get_workflow_step("proj-1", "script")?.is_none());
        assert!(repo.get_files_by_query("proj-1", None, None, None)?.is_empty());
        Ok(())
    }

    #[test]
    fn get_project_status_joins_steps_and_files() -> Result<()> {
        let repo = ProjectRepository::open_in_memory()?;
        repo.create_project("proj-1", "subject", 60, None, None)?;
        repo.create_workflow_step("proj-1", 1, "script", None, None)?;
        repo.register_file_reference("proj-1", "script", "draft", "files/scripts/a.txt", "a.txt", 10, None, None, false)?;

        let status = repo.get_project_status("proj-1")?.unwrap();
        assert_eq!(status.steps.len(), 1);
        assert_eq!(status.files.len(), 1);
        Ok(())
    }

    #[test]
    fn get_step_input_resolves_previous_step_output() -> Result<()> {
        let repo = ProjectRepository::open_in_memory()?;
        repo.create_project("proj-1", "subject", 60, None, None)?;
        repo.create_workflow_step("proj-1", 1, "script", None, None)?;
        repo.create_workflow_step("proj-1", 2, "audio", None, None)?;
        repo.save_step_result("proj-1", "script", &json!({"text": "hi"}), None)?;

        let order = ["script", "audio"];
        let input = repo.get_step_input("proj-1", &order, "audio")?;
        assert_eq!(input["text"], "hi");
        Ok(())
    }
}
