//! Session state for one workflow run
//!
//! Holds everything produced by completed stages. Only the stage sequencer
//! mutates it; everyone else reads clones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{
    Acquisition, DestinationFolder, PlatformResult, PlatformUploadRequest, StorageResult,
    VideoMetadata,
};

/// Position of the workflow in the stage pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    MetadataReady,
    Acquiring,
    Acquired,
    FoldersListed,
    StorageUploading,
    StorageComplete,
    PlatformFormOpen,
    PlatformUploading,
    PlatformComplete,
}

impl Stage {
    /// Whether a request for this stage is outstanding
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Stage::Acquiring | Stage::StorageUploading | Stage::PlatformUploading
        )
    }

    /// The operation whose request this stage waits on
    pub fn in_flight_kind(self) -> Option<StageKind> {
        match self {
            Stage::Acquiring => Some(StageKind::Acquisition),
            Stage::StorageUploading => Some(StageKind::Storage),
            Stage::PlatformUploading => Some(StageKind::Platform),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::MetadataReady => "metadata ready",
            Stage::Acquiring => "acquiring",
            Stage::Acquired => "acquired",
            Stage::FoldersListed => "folders listed",
            Stage::StorageUploading => "storage uploading",
            Stage::StorageComplete => "storage complete",
            Stage::PlatformFormOpen => "platform form open",
            Stage::PlatformUploading => "platform uploading",
            Stage::PlatformComplete => "platform complete",
        };
        f.write_str(name)
    }
}

/// The triggerable operations, one request slot each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Metadata,
    Acquisition,
    Folders,
    Storage,
    Platform,
    Retrieve,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Metadata => "metadata",
            StageKind::Acquisition => "acquisition",
            StageKind::Folders => "folder listing",
            StageKind::Storage => "storage upload",
            StageKind::Platform => "platform upload",
            StageKind::Retrieve => "file retrieval",
        };
        f.write_str(name)
    }
}

/// Accumulated outputs of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Unique run ID, renewed whenever a new reference starts a workflow
    pub id: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run was last updated
    pub updated_at: DateTime<Utc>,
    /// Current pipeline position
    pub stage: Stage,
    pub source_reference: Option<String>,
    pub metadata: Option<VideoMetadata>,
    pub acquisition: Option<Acquisition>,
    pub destination_folders: Option<Vec<DestinationFolder>>,
    pub selected_folder_id: Option<String>,
    pub storage_result: Option<StorageResult>,
    pub platform_upload_request: Option<PlatformUploadRequest>,
    pub platform_result: Option<PlatformResult>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Create an empty session
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
            stage: Stage::Idle,
            source_reference: None,
            metadata: None,
            acquisition: None,
            destination_folders: None,
            selected_folder_id: None,
            storage_result: None,
            platform_upload_request: None,
            platform_result: None,
        }
    }

    /// Start a brand-new workflow for `reference`
    ///
    /// Every video-specific field is dropped. The folder listing describes
    /// the storage account rather than the video, so it survives.
    pub fn begin(&mut self, reference: &str) {
        let folders = self.destination_folders.take();
        *self = Self::new();
        self.source_reference = Some(reference.to_string());
        self.destination_folders = folders;
    }

    /// Whether `reference` belongs to the current run
    pub fn is_current_reference(&self, reference: &str) -> bool {
        self.source_reference.as_deref() == Some(reference)
    }

    /// Move to a pipeline position
    pub fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.updated_at = Utc::now();
    }

    /// Furthest stage backed by recorded outputs
    pub fn settled_stage(&self) -> Stage {
        if self.platform_result.is_some() {
            Stage::PlatformComplete
        } else if self.storage_result.is_some() {
            Stage::StorageComplete
        } else if self.acquisition.is_some() && self.destination_folders.is_some() {
            Stage::FoldersListed
        } else if self.acquisition.is_some() {
            Stage::Acquired
        } else if self.metadata.is_some() {
            Stage::MetadataReady
        } else {
            Stage::Idle
        }
    }

    /// Stage to fall back to if an operation started now fails
    ///
    /// Another stage's request may still be running; its in-flight stage
    /// is never a valid place to return to.
    pub fn entry_stage(&self) -> Stage {
        if self.stage.is_in_flight() {
            self.settled_stage()
        } else {
            self.stage
        }
    }

    /// Record fetched metadata; a different reference starts a new run
    ///
    /// Returns true when a new run was started.
    pub fn record_metadata(&mut self, reference: &str, metadata: VideoMetadata) -> bool {
        let restarted = !self.is_current_reference(reference);
        if restarted {
            self.begin(reference);
        }
        self.metadata = Some(metadata);
        if self.stage == Stage::Idle {
            self.stage = Stage::MetadataReady;
        }
        self.updated_at = Utc::now();
        restarted
    }

    /// Record a completed acquisition
    pub fn record_acquisition(&mut self, acquisition: Acquisition) {
        self.acquisition = Some(acquisition);
        self.enter(Stage::Acquired);
    }

    /// Replace the folder listing
    ///
    /// A folder that a completed storage upload went into is kept even if
    /// the provider stopped listing it, so the stored result stays
    /// explainable.
    pub fn record_folders(&mut self, mut folders: Vec<DestinationFolder>) {
        if self.storage_result.is_some() {
            if let Some(selected) = self.selected_folder_id.as_deref() {
                let listed = folders.iter().any(|f| f.folder_id == selected);
                let previous = self
                    .destination_folders
                    .as_ref()
                    .and_then(|list| list.iter().find(|f| f.folder_id == selected))
                    .cloned();
                if let (false, Some(previous)) = (listed, previous) {
                    warn!(
                        "Folder {} no longer listed, keeping it for the stored upload",
                        previous.folder_id
                    );
                    folders.push(previous);
                }
            }
        } else if let Some(selected) = self.selected_folder_id.as_deref() {
            if !folders.iter().any(|f| f.folder_id == selected) {
                self.selected_folder_id = None;
            }
        }

        self.destination_folders = Some(folders);
        if self.stage == Stage::Acquired {
            self.stage = Stage::FoldersListed;
        }
        self.updated_at = Utc::now();
    }

    /// Whether `folder_id` is in the current listing
    pub fn has_folder(&self, folder_id: &str) -> bool {
        self.destination_folders
            .as_ref()
            .map(|list| list.iter().any(|f| f.folder_id == folder_id))
            .unwrap_or(false)
    }

    /// Look up a listed folder
    pub fn folder(&self, folder_id: &str) -> Option<&DestinationFolder> {
        self.destination_folders
            .as_ref()
            .and_then(|list| list.iter().find(|f| f.folder_id == folder_id))
    }

    /// Record the user's folder choice
    pub fn select_folder(&mut self, folder_id: &str) {
        self.selected_folder_id = Some(folder_id.to_string());
        self.updated_at = Utc::now();
    }

    /// Record a completed storage upload
    pub fn record_storage(&mut self, result: StorageResult) {
        self.storage_result = Some(result);
        self.enter(Stage::StorageComplete);
    }

    /// Record the platform fields the user submitted
    pub fn record_platform_request(&mut self, request: PlatformUploadRequest) {
        self.platform_upload_request = Some(request);
        self.updated_at = Utc::now();
    }

    /// Record a completed platform upload
    pub fn record_platform(&mut self, result: PlatformResult) {
        self.platform_result = Some(result);
        self.enter(Stage::PlatformComplete);
    }

    /// Check the cross-field invariants, returning the first violation
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.acquisition.is_some() && self.source_reference.is_none() {
            return Err("acquisition recorded without a source reference".into());
        }
        if self.storage_result.is_some() {
            if self.acquisition.is_none() {
                return Err("storage result recorded without an acquisition".into());
            }
            match self.selected_folder_id.as_deref() {
                Some(id) if self.has_folder(id) => {}
                _ => return Err("storage result recorded without a listed folder".into()),
            }
        }
        if self.platform_result.is_some() && self.acquisition.is_none() {
            return Err("platform result recorded without an acquisition".into());
        }
        Ok(())
    }

    /// Get summary of workflow progress
    pub fn summary(&self) -> String {
        let mark = |done: bool| if done { "✅" } else { "⬜" };
        let mut lines = vec![
            format!("Run: {}", self.id),
            format!("Stage: {}", self.stage),
            format!(
                "Reference: {}",
                self.source_reference.as_deref().unwrap_or("-")
            ),
            String::new(),
        ];

        lines.push(format!(
            "  {} metadata{}",
            mark(self.metadata.is_some()),
            self.metadata
                .as_ref()
                .map(|m| format!(": {} ({})", m.title, m.formatted_duration()))
                .unwrap_or_default()
        ));
        lines.push(format!(
            "  {} acquisition{}",
            mark(self.acquisition.is_some()),
            self.acquisition
                .as_ref()
                .map(|a| format!(": {}", a.file_handle))
                .unwrap_or_default()
        ));
        lines.push(format!(
            "  {} storage{}",
            mark(self.storage_result.is_some()),
            self.storage_result
                .as_ref()
                .map(|r| format!(": {}", r.remote_file_id))
                .unwrap_or_default()
        ));
        lines.push(format!(
            "  {} platform{}",
            mark(self.platform_result.is_some()),
            self.platform_result
                .as_ref()
                .map(|r| format!(": {}", r.remote_video_id))
                .unwrap_or_default()
        ));

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(title: &str) -> VideoMetadata {
        VideoMetadata {
            title: title.to_string(),
            duration_seconds: Some(125),
            uploader_name: "X".to_string(),
            thumbnail_url: "http://img".to_string(),
        }
    }

    fn acquisition() -> Acquisition {
        Acquisition {
            file_handle: "f1".to_string(),
            item_id: "abc123".to_string(),
            title: "Test".to_string(),
        }
    }

    fn folder(id: &str) -> DestinationFolder {
        DestinationFolder {
            folder_id: id.to_string(),
            folder_name: format!("Folder {}", id),
        }
    }

    #[test]
    fn test_new_session_is_empty() {
        let state = SessionState::new();
        assert_eq!(state.stage, Stage::Idle);
        assert!(state.source_reference.is_none());
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_metadata_moves_to_ready() {
        let mut state = SessionState::new();
        assert!(state.record_metadata("abc123", metadata("Test")));
        assert_eq!(state.stage, Stage::MetadataReady);
        assert_eq!(state.source_reference.as_deref(), Some("abc123"));

        // Same reference refreshes metadata without restarting
        let id = state.id.clone();
        assert!(!state.record_metadata("abc123", metadata("Renamed")));
        assert_eq!(state.id, id);
        assert_eq!(state.metadata.as_ref().unwrap().title, "Renamed");
    }

    #[test]
    fn test_new_reference_resets_downstream() {
        let mut state = SessionState::new();
        state.record_metadata("abc123", metadata("Test"));
        state.record_acquisition(acquisition());
        state.record_folders(vec![folder("F1")]);
        state.select_folder("F1");
        state.record_storage(StorageResult {
            remote_file_id: "R1".into(),
        });
        let old_id = state.id.clone();

        assert!(state.record_metadata("xyz789", metadata("Other")));
        assert_ne!(state.id, old_id);
        assert_eq!(state.stage, Stage::MetadataReady);
        assert!(state.acquisition.is_none());
        assert!(state.storage_result.is_none());
        assert!(state.selected_folder_id.is_none());
        assert!(state.has_folder("F1"));
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_folders_advance_only_from_acquired() {
        let mut state = SessionState::new();
        state.record_folders(vec![folder("F1")]);
        assert_eq!(state.stage, Stage::Idle);

        state.record_metadata("abc123", metadata("Test"));
        state.record_acquisition(acquisition());
        state.record_folders(vec![]);
        assert_eq!(state.stage, Stage::FoldersListed);
        assert_eq!(state.destination_folders.as_ref().map(Vec::len), Some(0));
    }

    #[test]
    fn test_relisting_keeps_folder_of_stored_upload() {
        let mut state = SessionState::new();
        state.record_metadata("abc123", metadata("Test"));
        state.record_acquisition(acquisition());
        state.record_folders(vec![folder("F1"), folder("F2")]);
        state.select_folder("F1");
        state.record_storage(StorageResult {
            remote_file_id: "R1".into(),
        });

        state.record_folders(vec![folder("F2")]);
        assert!(state.has_folder("F1"));
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_relisting_drops_stale_selection() {
        let mut state = SessionState::new();
        state.record_folders(vec![folder("F1")]);
        state.select_folder("F1");
        state.record_folders(vec![folder("F2")]);
        assert!(state.selected_folder_id.is_none());
    }

    #[test]
    fn test_invariant_violations_are_reported() {
        let mut state = SessionState::new();
        state.acquisition = Some(acquisition());
        assert!(state.check_invariants().is_err());

        let mut state = SessionState::new();
        state.record_metadata("abc123", metadata("Test"));
        state.record_acquisition(acquisition());
        state.storage_result = Some(StorageResult {
            remote_file_id: "R1".into(),
        });
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_entry_stage_skips_other_in_flight_stage() {
        let mut state = SessionState::new();
        state.record_metadata("abc123", metadata("Test"));
        state.record_acquisition(acquisition());
        state.record_folders(vec![folder("F1")]);
        assert_eq!(state.entry_stage(), Stage::FoldersListed);

        // Storage upload running; a platform upload starting now must not
        // fall back onto StorageUploading
        state.enter(Stage::StorageUploading);
        assert_eq!(state.entry_stage(), Stage::FoldersListed);

        state.record_storage(StorageResult {
            remote_file_id: "R1".into(),
        });
        state.enter(Stage::PlatformUploading);
        assert_eq!(state.entry_stage(), Stage::StorageComplete);
    }

    #[test]
    fn test_settled_stage_follows_recorded_outputs() {
        let mut state = SessionState::new();
        assert_eq!(state.settled_stage(), Stage::Idle);

        state.record_metadata("abc123", metadata("Test"));
        state.enter(Stage::Acquiring);
        assert_eq!(state.settled_stage(), Stage::MetadataReady);

        state.record_acquisition(acquisition());
        assert_eq!(state.settled_stage(), Stage::Acquired);

        state.record_platform(PlatformResult {
            remote_video_id: "V1".into(),
        });
        assert_eq!(state.settled_stage(), Stage::PlatformComplete);
    }

    #[test]
    fn test_in_flight_kind() {
        assert_eq!(
            Stage::StorageUploading.in_flight_kind(),
            Some(StageKind::Storage)
        );
        assert_eq!(
            Stage::PlatformUploading.in_flight_kind(),
            Some(StageKind::Platform)
        );
        assert_eq!(Stage::PlatformFormOpen.in_flight_kind(), None);
    }

    #[test]
    fn test_summary_mentions_stage() {
        let mut state = SessionState::new();
        state.record_metadata("abc123", metadata("Test"));
        let summary = state.summary();
        assert!(summary.contains("metadata ready"));
        assert!(summary.contains("Test (2:05)"));
    }
}
