//! Scene observation: capture → segment → score → assign.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::assignment::{Assignment, AssignmentSolver, Match};
use crate::error::Result;
use crate::facts::{ImageData, ObservedRegion, Pixel, TaskObject};
use crate::similarity::{build_similarity_matrix, MatchScorer};

/// Frame source for whichever viewpoint the vision robot currently holds.
#[async_trait]
pub trait Camera: Send + Sync {
    async fn capture(&self) -> Result<ImageData>;
}

/// A segmented region as returned by the segmentation backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub crop: ImageData,
    pub center: Pixel,
}

#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(&self, frame: &ImageData) -> Result<Vec<Segment>>;
}

/// Regions seen in one capture and how the task objects were matched to them.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObservation {
    pub regions: Vec<ObservedRegion>,
    pub assignment: Assignment,
}

impl SceneObservation {
    pub fn empty(objects: usize) -> Self {
        Self {
            regions: Vec::new(),
            assignment: Assignment::unmatched(objects),
        }
    }

    /// The matched region's center and confidence for `object`, if it matched.
    pub fn matched_center(&self, object: usize) -> Option<(Pixel, f32)> {
        let Match { region, confidence } = self.assignment.get(object);
        let region = self.regions.get(region?)?;
        Some((region.center, confidence))
    }
}

/// The observation pipeline, wired to its collaborators.
pub struct Perception<'a> {
    pub camera: &'a dyn Camera,
    pub segmenter: &'a dyn Segmenter,
    pub scorer: &'a dyn MatchScorer,
    pub solver: &'a dyn AssignmentSolver,
    pub query_template: &'a str,
}

impl Perception<'_> {
    /// Captures and segments the current view.
    ///
    /// Capture or segmentation failure is logged and yields no regions.
    pub async fn capture_regions(&self) -> Vec<ObservedRegion> {
        let frame = match self.camera.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "capture failed; treating scene as empty");
                return Vec::new();
            }
        };
        let segments = match self.segmenter.segment(&frame).await {
            Ok(segments) => segments,
            Err(e) => {
                warn!(error = %e, "segmentation failed; treating scene as empty");
                return Vec::new();
            }
        };

        segments
            .into_iter()
            .enumerate()
            .map(|(id, seg)| ObservedRegion {
                id,
                center: seg.center,
                crop: seg.crop,
            })
            .collect()
    }

    /// Observes the current view and assigns `objects` to its regions.
    pub async fn observe(&self, objects: &[TaskObject]) -> SceneObservation {
        let regions = self.capture_regions().await;
        if regions.is_empty() {
            info!("no regions observed");
            return SceneObservation::empty(objects.len());
        }

        let scores =
            build_similarity_matrix(self.scorer, self.query_template, objects, &regions).await;
        let assignment = self.solver.solve(&scores);
        info!(
            regions = regions.len(),
            matched = assignment.matched_count(),
            solver = self.solver.name(),
            "scene observed"
        );

        SceneObservation {
            regions,
            assignment,
        }
    }
}
