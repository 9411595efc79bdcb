//! Data integration: reconciles the metadata repository against the
//! filesystem, and layers project-level backup/restore across both.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::filesystem::FileSystemManager;
use crate::repository::ProjectRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    MetadataToFiles,
    FilesToMetadata,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: String,
    pub kind: String,
    pub repository_side: Value,
    pub filesystem_side: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub files_added: usize,
    pub files_updated: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            status: SyncStatus::Success,
            files_added: 0,
            files_updated: 0,
            conflicts: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn merge(mut self, other: SyncReport) -> Self {
        self.files_added += other.files_added;
        self.files_updated += other.files_updated;
        self.conflicts.extend(other.conflicts);
        self.errors.extend(other.errors);
        self
    }

    fn finalize(mut self) -> Self {
        let made_progress = self.files_added > 0 || self.files_updated > 0;
        self.status = match (made_progress, self.errors.is_empty()) {
            (_, true) => SyncStatus::Success,
            (true, false) => SyncStatus::Partial,
            (false, false) => SyncStatus::Failed,
        };
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub status: String,
    pub total_files: usize,
    pub consistent_files: usize,
    pub inconsistencies: Vec<ConflictRecord>,
    pub orphaned_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReport {
    pub status: String,
    pub references_dropped: usize,
    pub files_registered: usize,
}

fn infer_file_type(path: &str) -> &'static str {
    let lowered = path.to_ascii_lowercase();
    if lowered.ends_with(".json") || lowered.ends_with(".txt") {
        "script"
    } else if lowered.ends_with(".wav") || lowered.ends_with(".mp3") {
        "audio"
    } else if lowered.ends_with(".mp4") || lowered.ends_with(".avi") {
        "video"
    } else if lowered.ends_with(".png") || lowered.ends_with(".jpg") || lowered.ends_with(".jpeg") {
        "image"
    } else {
        "metadata"
    }
}

fn infer_file_category(path: &str) -> &'static str {
    if path.contains("/temp/") || path.starts_with("temp/") {
        "temp"
    } else if path.contains("/final/") || path.starts_with("final/") {
        "output"
    } else if path.contains("/original/") || path.starts_with("original/") {
        "input"
    } else {
        "intermediate"
    }
}

/// Reconciler and backup/restore layer sitting above the repository and
/// filesystem. Per-project operation locks serialize concurrent sync/repair
/// attempts against the same project.
pub struct DataIntegrationManager {
    repository: Arc<ProjectRepository>,
    filesystem: Arc<FileSystemManager>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DataIntegrationManager {
    pub fn new(repository: Arc<ProjectRepository>, filesystem: Arc<FileSystemManager>) -> Self {
        Self {
            repository,
            filesystem,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(project_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn relative_paths_on_disk(&self, project_id: &str) -> Result<HashSet<String>> {
        let project_dir = self.filesystem.get_project_directory(project_id)?;
        let mut set = HashSet::new();
        for path in self.filesystem.walk_files(project_id)? {
            if let Ok(relative) = path.strip_prefix(&project_dir) {
                set.insert(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(set)
    }

    pub async fn sync_files_to_metadata(&self, project_id: &str) -> Result<SyncReport> {
        let guard = self.lock_for(project_id).await;
        let _permit = guard.lock().await;
        self.sync_files_to_metadata_inner(project_id)
    }

    fn sync_files_to_metadata_inner(&self, project_id: &str) -> Result<SyncReport> {
        let mut report = SyncReport::new(SyncDirection::FilesToMetadata);
        let known = self.repository.get_files_by_query(project_id, None, None, None)?;
        let known_paths: HashMap<String, crate::repository::FileReferenceRecord> = known.into_iter().map(|f| (f.file_path.clone(), f)).collect();

        for relative in self.relative_paths_on_disk(project_id)? {
            let file_path = self.filesystem.get_project_file_path(project_id, &relative)?;
            let size = std::fs::metadata(&file_path).map(|m| m.len() as i64).unwrap_or(0);

            match known_paths.get(&relative) {
                None => {
                    let file_type = infer_file_type(&relative);
                    let file_category = infer_file_category(&relative);
                    let file_name = file_path.file_name().and_then(|n| n.to_str()).unwrap_or(&relative).to_string();
                    match self
                        .repository
                        .register_file_reference(project_id, file_type, file_category, &relative, &file_name, size, None, None, false)
                    {
                        Ok(_) => report.files_added += 1,
                        Err(err) => report.errors.push(err.to_string()),
                    }
                }
                Some(existing) if existing.file_size != size => {
                    self.repository.update_file_metadata(existing.id, None, Some(size), None)?;
                    report.files_updated += 1;
                    report.conflicts.push(ConflictRecord {
                        path: relative.clone(),
                        kind: "size_mismatch".to_string(),
                        repository_side: json!({"file_size": existing.file_size}),
                        filesystem_side: json!({"file_size": size}),
                    });
                }
                Some(_) => {}
            }
        }

        Ok(report.finalize())
    }

    pub async fn sync_metadata_to_files(&self, project_id: &str) -> Result<SyncReport> {
        let guard = self.lock_for(project_id).await;
        let _permit = guard.lock().await;
        self.sync_metadata_to_files_inner(project_id)
    }

    fn sync_metadata_to_files_inner(&self, project_id: &str) -> Result<SyncReport> {
        let mut report = SyncReport::new(SyncDirection::MetadataToFiles);
        for reference in self.repository.get_files_by_query(project_id, None, None, None)? {
            let file_path = self.filesystem.get_project_file_path(project_id, &reference.file_path)?;
            if !file_path.exists() {
                if reference.file_category == "output" {
                    let skeleton = if reference.file_type == "script" { "{}" } else { "" };
                    match self.filesystem.create_file(project_id, &reference.file_path, skeleton) {
                        Ok(_) => report.files_added += 1,
                        Err(err) => report.errors.push(err.to_string()),
                    }
                }
                continue;
            }

            let on_disk_size = std::fs::metadata(&file_path).map(|m| m.len() as i64).unwrap_or(0);
            if on_disk_size != reference.file_size {
                report.conflicts.push(ConflictRecord {
                    path: reference.file_path.clone(),
                    kind: "size_mismatch".to_string(),
                    repository_side: json!({"file_size": reference.file_size}),
                    filesystem_side: json!({"file_size": on_disk_size}),
                });
            }
        }
        Ok(report.finalize())
    }

    pub async fn sync_bidirectional(&self, project_id: &str) -> Result<SyncReport> {
        let guard = self.lock_for(project_id).await;
        let _permit = guard.lock().await;
        let files_to_metadata = self.sync_files_to_metadata_inner(project_id)?;
        let metadata_to_files = self.sync_metadata_to_files_inner(project_id)?;
        let merged = SyncReport::new(SyncDirection::Bidirectional).merge(files_to_metadata).merge(metadata_to_files);
        Ok(merged.finalize())
    }

    pub fn check_integrity(&self, project_id: &str) -> Result<IntegrityReport> {
        let known = self.repository.get_files_by_query(project_id, None, None, None)?;
        let on_disk = self.relative_paths_on_disk(project_id)?;

        let mut inconsistencies = Vec::new();
        let mut consistent = 0;
        let known_paths: HashSet<String> = known.iter().map(|f| f.file_path.clone()).collect();

        for reference in &known {
            if !on_disk.contains(&reference.file_path) {
                inconsistencies.push(ConflictRecord {
                    path: reference.file_path.clone(),
                    kind: "missing_file".to_string(),
                    repository_side: json!({"file_size": reference.file_size}),
                    filesystem_side: Value::Null,
                });
                continue;
            }
            let file_path = self.filesystem.get_project_file_path(project_id, &reference.file_path)?;
            let actual_size = std::fs::metadata(&file_path).map(|m| m.len() as i64).unwrap_or(0);
            if actual_size != reference.file_size {
                inconsistencies.push(ConflictRecord {
                    path: reference.file_path.clone(),
                    kind: "size_mismatch".to_string(),
                    repository_side: json!({"file_size": reference.file_size}),
                    filesystem_side: json!({"file_size": actual_size}),
                });
                continue;
            }
            consistent += 1;
        }

        let orphaned_files: Vec<String> = on_disk.difference(&known_paths).cloned().collect();

        let status = if inconsistencies.is_empty() && orphaned_files.is_empty() { "success" } else { "inconsistent" };

        Ok(IntegrityReport {
            status: status.to_string(),
            total_files: known.len(),
            consistent_files: consistent,
            inconsistencies,
            orphaned_files,
        })
    }

    pub fn auto_repair_integrity(&self, project_id: &str) -> Result<RepairReport> {
        let report = self.check_integrity(project_id)?;
        if report.inconsistencies.is_empty() && report.orphaned_files.is_empty() {
            return Ok(RepairReport {
                status: "no_repair_needed".to_string(),
                references_dropped: 0,
                files_registered: 0,
            });
        }

        let mut dropped = 0;
        for inconsistency in &report.inconsistencies {
            if inconsistency.kind == "missing_file" {
                if let Some(record) = self.repository.get_files_by_query(project_id, None, None, None)?.into_iter().find(|f| f.file_path == inconsistency.path) {
                    self.drop_reference(record.id)?;
                    dropped += 1;
                }
            }
        }

        let mut registered = 0;
        for path in &report.orphaned_files {
            let file_path = self.filesystem.get_project_file_path(project_id, path)?;
            let size = std::fs::metadata(&file_path).map(|m| m.len() as i64).unwrap_or(0);
            let file_type = infer_file_type(path);
            let file_category = infer_file_category(path);
            let file_name = file_path.file_name().and_then(|n| n.to_str()).unwrap_or(path).to_string();
            self.repository
                .register_file_reference(project_id, file_type, file_category, path, &file_name, size, None, None, false)?;
            registered += 1;
        }

        let status = if dropped + registered == report.inconsistencies.len() + report.orphaned_files.len() {
            "completed"
        } else if dropped + registered > 0 {
            "partial"
        } else {
            "failed"
        };

        Ok(RepairReport {
            status: status.to_string(),
            references_dropped: dropped,
            files_registered: registered,
        })
    }

    fn drop_reference(&self, file_id: i64) -> Result<()> {
        self.repository.delete_file_reference(file_id)?;
        Ok(())
    }

    pub fn create_project_backup(&self, project_id: &str, backup_path: &Path) -> Result<()> {
        if backup_path.extension().and_then(|e| e.to_str()) != Some("zip") {
            bail!("Failed to restore from backup: backup path must end with .zip");
        }
        if let Some(parent) = backup_path.parent() {
            std::fs::create_dir_all(parent).context("backup parent directory is not writable")?;
        }

        let project = self.repository.get_project(project_id)?.context("project not found for backup")?;
        let project_data = json!({
            "title": project.subject,
            "description": project.subject,
            "status": project.status,
            "target_length_minutes": project.target_length,
        });

        let file_metadata: HashMap<String, (String, String)> = self
            .repository
            .get_files_by_query(project_id, None, None, None)?
            .into_iter()
            .map(|f| (f.file_path, (f.file_type, f.file_category)))
            .collect();

        let produced = self.filesystem.create_project_backup(project_id, "full", &project_data, None, &file_metadata)?;
        std::fs::rename(&produced, backup_path).context("failed to move generated backup archive to requested path")?;
        Ok(())
    }

    pub fn restore_project_from_backup(&self, backup_path: &Path, target_project_id: Option<&str>) -> Result<()> {
        let target = target_project_id.unwrap_or("restored-project");
        let report = self
            .filesystem
            .restore_project_from_backup(backup_path, target)
            .with_context(|| format!("Failed to restore from backup: {}", backup_path.display()))?;

        if self.repository.get_project(target)?.is_none() {
            let project_data = report.project_data();
            let subject = project_data.get("title").and_then(Value::as_str).unwrap_or("restored project");
            let target_length = project_data.get("target_length_minutes").and_then(Value::as_i64).unwrap_or(0);
            let status = project_data.get("status").and_then(Value::as_str).unwrap_or("restored");
            self.repository.create_project(target, subject, target_length, None, Some(status))?;
        }

        let recorded: HashMap<String, (String, String)> = report
            .file_entries()
            .iter()
            .filter_map(|entry| Some((entry.path.clone(), (entry.file_type.clone()?, entry.file_category.clone()?))))
            .collect();

        for path in self.relative_paths_on_disk(target)? {
            let file_path = self.filesystem.get_project_file_path(target, &path)?;
            let size = std::fs::metadata(&file_path).map(|m| m.len() as i64).unwrap_or(0);
            let (file_type, file_category) = match recorded.get(&path) {
                Some((t, c)) => (t.as_str(), c.as_str()),
                None => (infer_file_type(&path), infer_file_category(&path)),
            };
            let file_name = file_path.file_name().and_then(|n| n.to_str()).unwrap_or(&path).to_string();
            self.repository
                .register_file_reference(target, file_type, file_category, &path, &file_name, size, None, None, false)?;
        }

        let _ = report.files_restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (DataIntegrationManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(ProjectRepository::open_in_memory().unwrap());
        let filesystem = Arc::new(FileSystemManager::new(dir.path()));
        (DataIntegrationManager::new(repository, filesystem), dir)
    }

    #[tokio::test]
    async fn sync_files_to_metadata_registers_unknown_files() {
        let (manager, _dir) = manager();
        manager.repository.create_project("p1", "subject", 60, None, None).unwrap();
        manager.filesystem.create_project_directory("p1").unwrap();
        manager.filesystem.create_file("p1", "files/scripts/a.json", "{}").unwrap();

        let report = manager.sync_files_to_metadata("p1").await.unwrap();
        assert_eq!(report.files_added, 1);
        assert_eq!(report.status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn integrity_flags_missing_and_orphaned_files() {
        let (manager, _dir) = manager();
        manager.repository.create_project("p1", "subject", 60, None, None).unwrap();
        manager.filesystem.create_project_directory("p1").unwrap();
        manager
            .repository
            .register_file_reference("p1", "audio", "output", "files/audio/missing.wav", "missing.wav", 1024, None, None, false)
            .unwrap();
        manager.filesystem.create_file("p1", "files/scripts/orphaned.txt", "hi").unwrap();

        let report = manager.check_integrity("p1").unwrap();
        assert_eq!(report.status, "inconsistent");
        assert_eq!(report.inconsistencies.len(), 1);
        assert_eq!(report.inconsistencies[0].kind, "missing_file");
        assert_eq!(report.orphaned_files.len(), 1);
    }

    #[tokio::test]
    async fn auto_repair_registers_orphans_and_reports_completed() {
        let (manager, _dir) = manager();
        manager.repository.create_project("p1", "subject", 60, None, None).unwrap();
        manager.filesystem.create_project_directory("p1").unwrap();
        manager.filesystem.create_file("p1", "files/scripts/orphaned.txt", "hi").unwrap();

        let repair = manager.auto_repair_integrity("p1").unwrap();
        assert_eq!(repair.status, "completed");
        assert_eq!(repair.files_registered, 1);

        let after = manager.check_integrity("p1").unwrap();
        assert_eq!(after.status, "success");
    }

    #[tokio::test]
    async fn backup_then_restore_preserves_project_files() {
        let (manager, dir) = manager();
        manager.repository.create_project("p1", "a demo subject", 120, None, None).unwrap();
        manager.filesystem.create_project_directory("p1").unwrap();
        manager.filesystem.create_file("p1", "files/scripts/a.txt", "hello").unwrap();
        manager.sync_files_to_metadata("p1").await.unwrap();

        let backup_path = dir.path().join("out.zip");
        manager.create_project_backup("p1", &backup_path).unwrap();
        assert!(backup_path.exists());

        manager.restore_project_from_backup(&backup_path, Some("p1-restored")).unwrap();
        let restored_content = manager.filesystem.read_file("p1-restored", "files/scripts/a.txt").unwrap();
        assert_eq!(restored_content, "hello");

        let restored_project = manager.repository.get_project("p1-restored").unwrap().unwrap();
        assert_eq!(restored_project.subject, "a demo subject");
        assert_eq!(restored_project.target_length, 120);

        let restored_files = manager.repository.get_files_by_query("p1-restored", None, None, None).unwrap();
        let restored_file = restored_files.iter().find(|f| f.file_path == "files/scripts/a.txt").unwrap();
        assert_eq!(restored_file.file_type, "script");
    }

    #[tokio::test]
    async fn restore_fails_loudly_when_backup_info_is_missing() {
        let (manager, dir) = manager();
        let bad_path = dir.path().join("bad.zip");
        let file = std::fs::File::create(&bad_path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("some_file.txt", zip::write::SimpleFileOptions::default()).unwrap();
        use std::io::Write;
        zip.write_all(b"x").unwrap();
        zip.finish().unwrap();

        let err = manager.restore_project_from_backup(&bad_path, Some("p1-restored")).unwrap_err();
        assert!(err.to_string().contains("Failed to restore from backup"));
    }

    #[tokio::test]
    async fn backup_path_must_end_with_zip() {
        let (manager, dir) = manager();
        manager.repository.create_project("p1", "subject", 60, None, None).unwrap();
        manager.filesystem.create_project_directory("p1").unwrap();
        let bad_path = dir.path().join("out.tar");
        let err = manager.create_project_backup("p1", &bad_path).unwrap_err();
        assert!(err.to_string().contains(".zip"));
    }

    #[tokio::test]
    async fn sync_bidirectional_merges_both_directions() {
        let (manager, _dir) = manager();
        manager.repository.create_project("p1", "subject", 60, None, None).unwrap();
        manager.filesystem.create_project_directory("p1").unwrap();
        manager.filesystem.create_file("p1", "files/scripts/a.txt", "hi").unwrap();

        let report = manager.sync_bidirectional("p1").await.unwrap();
        assert_eq!(report.direction, SyncDirection::Bidirectional);
        assert_eq!(report.files_added, 1);
    }
}
