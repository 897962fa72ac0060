//! Relay workflow
//!
//! One session moves a video through a fixed set of stages:
//!
//! - **Metadata**: resolve a reference to title, duration and uploader
//! - **Acquisition**: have the backend fetch the file
//! - **Folders**: list storage destinations
//! - **Storage**: upload into the chosen folder
//! - **Platform**: optionally publish to the sharing platform
//!
//! Around the sequencer sit the session state it owns, a single-slot error
//! channel, synthetic progress for the slow stages, and the reauthorization
//! recovery flow.
//!
//! ## Running a Session
//!
//! ```bash
//! # Whole pipeline into one folder, then publish
//! vidrelay run https://youtu.be/abc123 --folder F1 --platform
//!
//! # Only look at the metadata
//! vidrelay info https://youtu.be/abc123
//! ```

pub mod error_channel;
pub mod progress;
pub mod recovery;
pub mod sequencer;
pub mod session;

pub use error_channel::{ErrorChannel, ErrorNotice};
pub use progress::{ProgressSnapshot, ProgressStage, ProgressSynthesizer, TimerState};
pub use recovery::{
    CliPrompt, FixedPrompt, Navigator, PrintNavigator, ReauthPrompt, RecoveryFlow,
    RecoveryOutcome,
};
pub use sequencer::{ControlStates, StageSequencer};
pub use session::{SessionState, Stage, StageKind};
