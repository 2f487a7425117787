//! Live reconstruction of local assistant sessions.
//!
//! The [`tailer`] follows rolling JSONL transcripts with per-consumer-group
//! offsets and inode rotation detection; [`transcript`] turns transcript
//! lines into session metadata; [`process`] inspects the process table; the
//! [`monitor`] correlates all three into [`SessionSnapshot`]s and fans out
//! refresh callbacks.
//!
//! [`SessionSnapshot`]: sb_domain::SessionSnapshot

pub mod codex;
pub mod monitor;
pub mod process;
pub mod tailer;
pub mod transcript;

pub use monitor::{HookSessionEvent, SessionMonitor};
pub use tailer::{JsonlTailer, OffsetStore, PollOutcome};
pub use transcript::TranscriptExtractor;
