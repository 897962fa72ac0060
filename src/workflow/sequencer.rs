//! Stage sequencer
//!
//! Runs the relay pipeline one user-triggered operation at a time:
//! - Validates preconditions locally before any request goes out
//! - Issues exactly one backend request per operation
//! - Mutates the session only when that request succeeds
//! - Publishes every failure to the error channel
//! - Drives the synthetic progress of long-running stages

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::error_channel::ErrorChannel;
use super::progress::{ProgressStage, ProgressSynthesizer};
use super::recovery::{Navigator, ReauthPrompt, RecoveryFlow, RecoveryOutcome};
use super::session::{SessionState, Stage, StageKind};
use crate::backend::{
    Acquisition, Backend, DestinationFolder, PlatformResult, PlatformUploadDraft, StorageResult,
    VideoMetadata,
};
use crate::{Config, Error, ErrorKind, Result};

/// Which triggers the user can fire right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlStates {
    pub metadata: bool,
    pub acquisition: bool,
    pub folders: bool,
    pub storage: bool,
    pub platform: bool,
    pub save: bool,
}

/// Releases a stage's in-flight slot when dropped
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<StageKind>>,
    kind: StageKind,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.kind);
    }
}

/// Drives one relay session
pub struct StageSequencer {
    backend: Arc<dyn Backend>,
    config: Config,
    session: Mutex<SessionState>,
    in_flight: Mutex<HashSet<StageKind>>,
    errors: ErrorChannel,
    progress: ProgressSynthesizer,
    recovery: RecoveryFlow,
    signed_out: AtomicBool,
}

impl StageSequencer {
    /// Create a sequencer with an empty session
    pub fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        prompt: Arc<dyn ReauthPrompt>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        info!("Relay session using backend {}", backend.name());
        Self {
            progress: ProgressSynthesizer::new(config.progress.clone()),
            recovery: RecoveryFlow::new(prompt, navigator),
            backend,
            config,
            session: Mutex::new(SessionState::new()),
            in_flight: Mutex::new(HashSet::new()),
            errors: ErrorChannel::new(),
            signed_out: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight_set(&self) -> MutexGuard<'_, HashSet<StageKind>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the in-flight slot for `kind`, rejecting re-entry
    fn claim(&self, kind: StageKind) -> Result<FlightGuard<'_>> {
        if self.signed_out.load(Ordering::SeqCst) {
            return Err(Error::SessionEnded);
        }
        if !self.in_flight_set().insert(kind) {
            debug!("Ignoring {} trigger while one is in flight", kind);
            return Err(Error::StageBusy(kind));
        }
        Ok(FlightGuard {
            in_flight: &self.in_flight,
            kind,
        })
    }

    /// Publish a failure and hand it back to the caller
    fn report<T>(&self, kind: StageKind, err: Error) -> Result<T> {
        let message = match (kind, err.kind()) {
            (_, ErrorKind::Validation) | (_, ErrorKind::AuthorizationExpired) => err.to_string(),
            // The platform's own wording is shown as-is
            (StageKind::Platform, ErrorKind::Backend) => err.to_string(),
            _ => format!("{}: {}", failure_prefix(kind), err),
        };
        self.errors.publish(message);
        Err(err)
    }

    fn verify(&self, state: &SessionState) {
        if let Err(violation) = state.check_invariants() {
            error!("Session invariant violated: {}", violation);
        }
    }

    /// Resolve a reference to metadata
    ///
    /// A reference other than the current one starts a new workflow run.
    pub async fn request_metadata(&self, reference: &str) -> Result<VideoMetadata> {
        let _guard = self.claim(StageKind::Metadata)?;
        let reference = reference.trim();
        if reference.is_empty() {
            return self.report(
                StageKind::Metadata,
                Error::validation("Please enter a video reference"),
            );
        }

        info!("Fetching metadata for {}", reference);
        match self.backend.fetch_metadata(reference).await {
            Ok(metadata) => {
                let restarted = {
                    let mut state = self.state();
                    let restarted = state.record_metadata(reference, metadata.clone());
                    self.verify(&state);
                    restarted
                };
                if restarted {
                    self.progress.reset_all();
                    info!("Started new run for {}", reference);
                }
                Ok(metadata)
            }
            Err(e) => self.report(StageKind::Metadata, e),
        }
    }

    /// Ask the backend to acquire the video behind `reference`
    pub async fn initiate_acquisition(&self, reference: &str) -> Result<Acquisition> {
        let _guard = self.claim(StageKind::Acquisition)?;
        let reference = reference.trim();

        let (entry, run_id) = {
            let mut state = self.state();
            if reference.is_empty() {
                drop(state);
                return self.report(
                    StageKind::Acquisition,
                    Error::validation("Please enter a video reference"),
                );
            }
            if state.metadata.is_none() || !state.is_current_reference(reference) {
                drop(state);
                return self.report(
                    StageKind::Acquisition,
                    Error::validation("Please fetch the video info before downloading"),
                );
            }
            let entry = state.entry_stage();
            state.enter(Stage::Acquiring);
            (entry, state.id.clone())
        };

        self.progress.start(ProgressStage::Acquisition);
        info!("Acquiring {}", reference);

        match self.backend.initiate_acquisition(reference).await {
            Ok(acquisition) => {
                {
                    let mut state = self.state();
                    if state.id != run_id {
                        drop(state);
                        return self.discard(StageKind::Acquisition, ProgressStage::Acquisition);
                    }
                    state.record_acquisition(acquisition.clone());
                    self.verify(&state);
                }
                self.progress.complete(ProgressStage::Acquisition);
                info!("Acquired {} as {}", reference, acquisition.file_handle);
                Ok(acquisition)
            }
            Err(e) => {
                self.restore(&run_id, Stage::Acquiring, entry);
                self.progress.cancel(ProgressStage::Acquisition);
                self.report(StageKind::Acquisition, e)
            }
        }
    }

    /// Fetch the storage provider's folder listing
    pub async fn list_destination_folders(&self) -> Result<Vec<DestinationFolder>> {
        let _guard = self.claim(StageKind::Folders)?;

        match self.backend.list_folders().await {
            Ok(folders) => {
                info!("Listed {} destination folders", folders.len());
                let mut state = self.state();
                state.record_folders(folders);
                self.verify(&state);
                Ok(state.destination_folders.clone().unwrap_or_default())
            }
            Err(e) => self.report(StageKind::Folders, e),
        }
    }

    /// Upload the acquired file into a listed folder
    pub async fn upload_to_storage(&self, folder_id: &str) -> Result<StorageResult> {
        let _guard = self.claim(StageKind::Storage)?;
        let folder_id = folder_id.trim();

        let (acquisition, entry, run_id) = {
            let mut state = self.state();
            if folder_id.is_empty() {
                drop(state);
                return self.report(
                    StageKind::Storage,
                    Error::validation("Please select a destination folder"),
                );
            }
            let Some(acquisition) = state.acquisition.clone() else {
                drop(state);
                return self.report(
                    StageKind::Storage,
                    Error::validation("Please download a video first"),
                );
            };
            if !state.has_folder(folder_id) {
                drop(state);
                return self.report(
                    StageKind::Storage,
                    Error::validation(format!("Folder {} is not in the folder list", folder_id)),
                );
            }
            state.select_folder(folder_id);
            let entry = state.entry_stage();
            state.enter(Stage::StorageUploading);
            (acquisition, entry, state.id.clone())
        };

        self.progress.start(ProgressStage::StorageUpload);
        info!("Uploading {} to folder {}", acquisition.file_handle, folder_id);

        match self.backend.upload_to_storage(&acquisition, folder_id).await {
            Ok(result) => {
                {
                    let mut state = self.state();
                    if state.id != run_id {
                        drop(state);
                        return self.discard(StageKind::Storage, ProgressStage::StorageUpload);
                    }
                    state.record_storage(result.clone());
                    self.verify(&state);
                }
                self.progress.complete(ProgressStage::StorageUpload);
                info!(
                    "Stored as {}",
                    self.config.links.storage_link(&result.remote_file_id)
                );
                Ok(result)
            }
            Err(e) => {
                self.restore(&run_id, Stage::StorageUploading, entry);
                self.progress.cancel(ProgressStage::StorageUpload);
                self.report(StageKind::Storage, e)
            }
        }
    }

    /// Open the platform form, returning fields prefilled from the session
    pub fn open_platform_form(&self) -> Result<PlatformUploadDraft> {
        let _guard = self.claim(StageKind::Platform)?;
        let mut state = self.state();

        if state.acquisition.is_none() {
            drop(state);
            return self.report(
                StageKind::Platform,
                Error::validation("Please download the video first before uploading to the platform"),
            );
        }

        let title = state
            .acquisition
            .as_ref()
            .map(|a| a.title.as_str())
            .filter(|t| !t.trim().is_empty())
            .or_else(|| state.metadata.as_ref().map(|m| m.title.as_str()))
            .map(str::to_string);
        let reference = state.source_reference.clone().unwrap_or_default();
        let description = self
            .config
            .platform
            .description_template
            .replace("{reference}", &reference);

        let pending = state
            .stage
            .in_flight_kind()
            .map(|kind| self.is_in_flight(kind))
            .unwrap_or(false);
        if !pending {
            state.enter(Stage::PlatformFormOpen);
        }

        Ok(PlatformUploadDraft {
            title,
            description: Some(description),
            tags: None,
            privacy_level: None,
        })
    }

    /// Upload the acquired file to the sharing platform
    ///
    /// An expired grant starts the recovery flow exactly once; the error is
    /// still returned so the caller can tell the upload did not happen.
    pub async fn upload_to_platform(&self, draft: PlatformUploadDraft) -> Result<PlatformResult> {
        let _guard = self.claim(StageKind::Platform)?;

        let (acquisition, request, entry, run_id) = {
            let mut state = self.state();
            let Some(acquisition) = state.acquisition.clone() else {
                drop(state);
                return self.report(
                    StageKind::Platform,
                    Error::validation("No video file available for upload"),
                );
            };
            let request = draft.resolve(
                &self.config.platform.default_title,
                &self.config.platform.default_privacy,
            );
            state.record_platform_request(request.clone());
            let entry = state.entry_stage();
            state.enter(Stage::PlatformUploading);
            (acquisition, request, entry, state.id.clone())
        };

        self.progress.start(ProgressStage::PlatformUpload);
        info!(
            "Uploading {} to the platform as {:?} ({})",
            acquisition.file_handle, request.title, request.privacy_level
        );

        match self.backend.upload_to_platform(&acquisition, &request).await {
            Ok(result) => {
                {
                    let mut state = self.state();
                    if state.id != run_id {
                        drop(state);
                        return self.discard(StageKind::Platform, ProgressStage::PlatformUpload);
                    }
                    state.record_platform(result.clone());
                    self.verify(&state);
                }
                self.progress.complete(ProgressStage::PlatformUpload);
                info!(
                    "Published as {}",
                    self.config.links.platform_link(&result.remote_video_id)
                );
                Ok(result)
            }
            Err(e) => {
                self.restore(&run_id, Stage::PlatformUploading, entry);
                self.progress.cancel(ProgressStage::PlatformUpload);

                if let Error::AuthorizationExpired { message } = &e {
                    self.errors.publish(message.clone());
                    let end_session_url = self.backend.end_session_url();
                    match self.recovery.run(message, &end_session_url).await {
                        Ok(RecoveryOutcome::SignedOut { .. }) => {
                            self.signed_out.store(true, Ordering::SeqCst);
                        }
                        Ok(RecoveryOutcome::Declined) => {}
                        Err(prompt_err) => warn!("Recovery prompt failed: {}", prompt_err),
                    }
                    return Err(e);
                }

                self.report(StageKind::Platform, e)
            }
        }
    }

    /// Copy the acquired file into `dir`, named after its title
    pub async fn save_to_device(&self, dir: &Path) -> Result<PathBuf> {
        let _guard = self.claim(StageKind::Retrieve)?;

        let Some(acquisition) = self.state().acquisition.clone() else {
            return self.report(
                StageKind::Retrieve,
                Error::validation("Please download a video first"),
            );
        };

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            return self.report(StageKind::Retrieve, e.into());
        }

        // Bytes land in a sibling first; an existing file is only replaced
        // once the retrieval has fully succeeded
        let name = local_file_name(&acquisition);
        let dest = dir.join(&name);
        let partial = dir.join(format!("{}.part", name));

        let retrieved = self
            .backend
            .retrieve_file(&acquisition.file_handle, &partial)
            .await;
        let saved = match retrieved {
            Ok(bytes) => tokio::fs::rename(&partial, &dest)
                .await
                .map(|_| bytes)
                .map_err(Error::from),
            Err(e) => Err(e),
        };

        match saved {
            Ok(bytes) => {
                info!("Saved {} bytes to {}", bytes, dest.display());
                Ok(dest)
            }
            Err(e) => {
                if tokio::fs::remove_file(&partial).await.is_ok() {
                    debug!("Removed partial file {}", partial.display());
                }
                self.report(StageKind::Retrieve, e)
            }
        }
    }

    /// Send the user to the sign-in page; re-opens an ended session
    pub async fn begin_authorization(&self) -> Result<String> {
        let url = self.backend.begin_auth_url();
        self.recovery.navigator().navigate(&url).await?;
        self.signed_out.store(false, Ordering::SeqCst);
        Ok(url)
    }

    /// Sign out explicitly
    pub async fn end_session(&self) -> Result<String> {
        let url = self.backend.end_session_url();
        self.recovery.navigator().navigate(&url).await?;
        self.signed_out.store(true, Ordering::SeqCst);
        Ok(url)
    }

    /// Put the stage back unless something else moved it meanwhile
    fn restore(&self, run_id: &str, during: Stage, entry: Stage) {
        let mut state = self.state();
        if state.id == run_id && state.stage == during {
            state.enter(entry);
        }
    }

    fn discard<T>(&self, kind: StageKind, progress: ProgressStage) -> Result<T> {
        warn!("Discarding {} result from a previous run", kind);
        self.progress.cancel(progress);
        Err(Error::Superseded(kind))
    }

    /// Snapshot of the session
    pub fn session(&self) -> SessionState {
        self.state().clone()
    }

    pub fn stage(&self) -> Stage {
        self.state().stage
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn progress(&self) -> &ProgressSynthesizer {
        &self.progress
    }

    pub fn is_signed_out(&self) -> bool {
        self.signed_out.load(Ordering::SeqCst)
    }

    pub fn is_in_flight(&self, kind: StageKind) -> bool {
        self.in_flight_set().contains(&kind)
    }

    /// Link to the stored file, once there is one
    pub fn storage_link(&self) -> Option<String> {
        self.state()
            .storage_result
            .as_ref()
            .map(|r| self.config.links.storage_link(&r.remote_file_id))
    }

    /// Link to the published video, once there is one
    pub fn platform_link(&self) -> Option<String> {
        self.state()
            .platform_result
            .as_ref()
            .map(|r| self.config.links.platform_link(&r.remote_video_id))
    }

    /// Which triggers are currently enabled
    pub fn controls(&self) -> ControlStates {
        if self.is_signed_out() {
            return ControlStates::default();
        }
        let busy = self.in_flight_set().clone();
        let state = self.state();
        let acquired = state.acquisition.is_some();
        let has_folders = state
            .destination_folders
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);

        ControlStates {
            metadata: !busy.contains(&StageKind::Metadata),
            acquisition: !busy.contains(&StageKind::Acquisition) && state.metadata.is_some(),
            folders: !busy.contains(&StageKind::Folders),
            storage: !busy.contains(&StageKind::Storage) && acquired && has_folders,
            platform: !busy.contains(&StageKind::Platform) && acquired,
            save: !busy.contains(&StageKind::Retrieve) && acquired,
        }
    }
}

fn failure_prefix(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Metadata => "Error fetching video info",
        StageKind::Acquisition => "Download error",
        StageKind::Folders => "Error loading folders",
        StageKind::Storage => "Upload error",
        StageKind::Platform => "Platform upload error",
        StageKind::Retrieve => "Error downloading file",
    }
}

/// Local file name for an acquisition
///
/// Uses the title, else the item id, with path separators and other unsafe
/// characters replaced. The result is always a single path component.
fn local_file_name(acquisition: &Acquisition) -> String {
    let stem = file_stem(&acquisition.title)
        .or_else(|| file_stem(&acquisition.item_id))
        .unwrap_or_else(|| "video".to_string());
    format!("{}.mp4", stem)
}

fn file_stem(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}
