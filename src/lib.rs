//! Sortbot shared core library.
//!
//! Two arms share a table: a worker arm places objects into containers, a vision arm
//! re-observes the scene afterwards. This crate provides:
//! - [`similarity`] and [`assignment`]: turning region crops and object names into a
//!   one-to-one, confidence-scored assignment.
//! - [`calibration`]: pixel → 6D pose lookup and pixel → container classification.
//! - [`command`] and [`dispatch`]: the worker command grammar and the ack-per-line socket
//!   protocol (plus the vision arm's `home`/`bins` channel).
//! - [`controller`]: the placement run and its single verify-then-retry pass.
//!
//! Segmentation, embeddings, language planning and cameras are collaborators behind
//! async traits ([`Segmenter`], [`MatchScorer`]/[`Embedder`], [`TaskPlanner`], [`Camera`]).

pub mod assignment;
pub mod calibration;
pub mod command;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod facts;
pub mod perception;
pub mod planner;
pub mod similarity;

pub use assignment::{Assignment, AssignmentSolver, GreedySolver, HungarianSolver, Match, SolverKind};
pub use calibration::{CalibrationStore, CalibrationTable, ReferenceSlot, SlotSet};
pub use command::{CommandLine, MotionCommand};
pub use config::{Endpoint, RunConfig};
pub use controller::{Collaborators, RunOutcome, SortingController, VerificationOutcome, VerificationRecord};
pub use error::{CoreError, Result};
pub use facts::{ImageData, ObservedRegion, Pixel, Pose6D, TaskObject};
pub use perception::{Camera, Segment, Segmenter};
pub use planner::TaskPlanner;
pub use similarity::{Embedder, EmbeddingScorer, MatchScorer, SimilarityMatrix};

// Re-export so callers can hand a temporary database to `CalibrationStore::from_db`
// without declaring a direct dependency on `sled`.
pub use sled;

/// Default on-disk calibration store location (Sled).
pub const DEFAULT_STORE_PATH: &str = "sortbot_calibration";
