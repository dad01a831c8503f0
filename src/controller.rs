//! Dual-robot run: initial placement, then one verification pass with at most one retry.
//!
//! ```text
//! TableObserve -> BinObserve -> Judge -> Done
//!                                    \-> RetryDispatch -> Done
//! ```
//!
//! Collaborator failures inside the observation phases degrade to zero confidence; a
//! failed judge counts as a "no". There is never a second verification cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::assignment::AssignmentSolver;
use crate::calibration::{CalibrationTable, ReferenceSlot, SlotSet};
use crate::command::audit_plan;
use crate::config::RunConfig;
use crate::dispatch::{dispatch_plan, send_vision_command, DispatchReport, LinkSettings, VisionCommand};
use crate::error::Result;
use crate::facts::{Pose6D, TaskObject};
use crate::perception::{Camera, Perception, Segmenter};
use crate::planner::{
    designated_container, filter_task_objects, is_affirmative, task_details, TaskPlanner,
};
use crate::similarity::MatchScorer;

/// External services the controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub camera: Arc<dyn Camera>,
    pub segmenter: Arc<dyn Segmenter>,
    pub scorer: Arc<dyn MatchScorer>,
    pub planner: Arc<dyn TaskPlanner>,
}

/// Verification state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    TableObserve,
    BinObserve,
    Judge,
    RetryDispatch,
    Done,
}

impl Phase {
    /// Next phase. `affirmative` only matters when leaving `Judge`.
    pub fn next(self, affirmative: bool) -> Phase {
        match self {
            Phase::TableObserve => Phase::BinObserve,
            Phase::BinObserve => Phase::Judge,
            Phase::Judge if affirmative => Phase::Done,
            Phase::Judge => Phase::RetryDispatch,
            Phase::RetryDispatch | Phase::Done => Phase::Done,
        }
    }
}

/// What one verification pass saw for one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationRecord {
    pub table_confidence: f32,
    pub table_pose: Option<Pose6D>,
    pub bin_confidence: f32,
    pub bin_pose: Option<Pose6D>,
    /// Container the bin-view match was classified into.
    pub bin_slot: Option<String>,
}

impl VerificationRecord {
    /// The per-object rule shown to the judge: stronger in the bin view means "in bin".
    pub fn in_container(&self) -> bool {
        self.bin_confidence > self.table_confidence
    }

    /// Objects that did not demonstrably move into a container.
    pub fn needs_retry(&self, bin_threshold: f32) -> bool {
        self.bin_confidence <= self.table_confidence || self.bin_confidence < bin_threshold
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Affirmative(String),
    Negative(String),
    /// The judge could not be reached; handled like `Negative`.
    Unavailable(String),
}

impl Verdict {
    pub fn from_reply(reply: String) -> Self {
        if is_affirmative(&reply) {
            Verdict::Affirmative(reply)
        } else {
            Verdict::Negative(reply)
        }
    }

    pub fn is_affirmative(&self) -> bool {
        matches!(self, Verdict::Affirmative(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryStatus {
    Dispatched(DispatchReport),
    /// No table pose was observed, so there is nowhere to pick from.
    NoTablePose,
    PlannerFailed(String),
    DispatchFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    pub object: String,
    pub status: RetryStatus,
}

/// Result of the single verification pass.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    pub container: String,
    pub records: Vec<(TaskObject, VerificationRecord)>,
    pub verdict: Verdict,
    pub retries: Vec<RetryAttempt>,
    /// Phases in the order they ran, ending with `Done`.
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The task named nothing but containers (or extraction failed).
    NoTaskObjects,
    /// No task object could be matched on the table; nothing was sent.
    NothingMatched,
    /// The placement plan was stopped by the cancel flag; verification skipped.
    Cancelled(DispatchReport),
    Verified {
        placement: DispatchReport,
        verification: VerificationOutcome,
    },
}

/// Orchestrates the worker and vision robots for one task at a time.
pub struct SortingController {
    config: Arc<RunConfig>,
    calibration: Arc<CalibrationTable>,
    slots: Arc<SlotSet>,
    collaborators: Collaborators,
    solver: Box<dyn AssignmentSolver>,
    link: LinkSettings,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for SortingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortingController")
            .field("worker", &self.config.network.worker.address())
            .field("vision", &self.config.network.vision.address())
            .field("calibration_entries", &self.calibration.len())
            .field("containers", &self.slots.len())
            .field("solver", &self.solver.name())
            .finish()
    }
}

impl SortingController {
    pub fn new(
        config: RunConfig,
        calibration: CalibrationTable,
        slots: SlotSet,
        collaborators: Collaborators,
    ) -> Self {
        let link = LinkSettings::from(&config.network);
        let solver = config.solver.solver();
        Self {
            config: Arc::new(config),
            calibration: Arc::new(calibration),
            slots: Arc::new(slots),
            collaborators,
            solver,
            link,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting this flag stops any dispatch before its next command.
    ///
    /// The flag only applies to the run in progress: [`SortingController::run`] clears it
    /// when it starts.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn perception(&self) -> Perception<'_> {
        Perception {
            camera: self.collaborators.camera.as_ref(),
            segmenter: self.collaborators.segmenter.as_ref(),
            scorer: self.collaborators.scorer.as_ref(),
            solver: self.solver.as_ref(),
            query_template: &self.config.query_template,
        }
    }

    async fn move_vision(&self, command: VisionCommand) -> bool {
        let endpoint = self.config.network.vision.address();
        match send_vision_command(&endpoint, &self.link, command).await {
            Ok(()) => true,
            Err(e) => {
                warn!(command = command.as_str(), error = %e, "vision robot move failed");
                false
            }
        }
    }

    async fn dispatch(&self, lines: &[String], known: &[(String, Pose6D)]) -> Result<DispatchReport> {
        let audit = audit_plan(lines, known, self.config.verification.pose_tolerance);
        let endpoint = self.config.network.worker.address();
        dispatch_plan(&endpoint, &self.link, audit, Some(self.cancel.as_ref())).await
    }

    fn container_poses(&self) -> impl Iterator<Item = (String, Pose6D)> + '_ {
        self.slots.iter().map(|slot| (slot.name.clone(), slot.pose))
    }

    /// Full run: extract objects, place them, verify once, retry once if needed.
    #[instrument(skip(self), fields(worker = %self.config.network.worker.address()))]
    pub async fn run(&self, task: &str) -> Result<RunOutcome> {
        if self.cancel.swap(false, Ordering::SeqCst) {
            info!("clearing cancel flag left by a previous run");
        }
        self.move_vision(VisionCommand::Home).await;

        let names = match self.collaborators.planner.extract_objects(task).await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "object extraction failed");
                Vec::new()
            }
        };
        let objects = filter_task_objects(names, &self.slots, &self.config.container_keyword);
        if objects.is_empty() {
            info!("no task objects to handle");
            return Ok(RunOutcome::NoTaskObjects);
        }
        info!(objects = ?objects.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(), "task objects");

        let container = designated_container(task, &self.slots);

        let Some(placement) = self.execute_placement(task, &objects).await? else {
            return Ok(RunOutcome::NothingMatched);
        };
        if placement.cancelled {
            return Ok(RunOutcome::Cancelled(placement));
        }

        let verification = self.verify(task, &objects, container).await;
        Ok(RunOutcome::Verified {
            placement,
            verification,
        })
    }

    /// Observes the table, resolves a pose per matched object and dispatches the planner's
    /// placement plan. Returns `None` when no object matched.
    pub async fn execute_placement(
        &self,
        task: &str,
        objects: &[TaskObject],
    ) -> Result<Option<DispatchReport>> {
        info!("observing table for placement");
        let scene = self.perception().observe(objects).await;

        let mut known = Vec::with_capacity(objects.len() + self.slots.len());
        for (idx, object) in objects.iter().enumerate() {
            let pose = scene
                .matched_center(idx)
                .and_then(|(center, _)| self.calibration.nearest(&center).copied());
            match pose {
                Some(pose) => {
                    info!(object = %object.name, %pose, "resolved object pose");
                    known.push((object.name.clone(), pose));
                }
                None => warn!(object = %object.name, "object not found on table; leaving it out"),
            }
        }
        if known.is_empty() {
            warn!("no task object matched; nothing to place");
            return Ok(None);
        }
        known.extend(self.container_poses());

        let details = task_details(task, &known);
        let lines = self
            .collaborators
            .planner
            .plan_instructions(&details)
            .await?;
        info!(lines = lines.len(), "placement plan received");

        self.dispatch(&lines, &known).await.map(Some)
    }

    /// Runs the verification state machine once.
    pub async fn verify(
        &self,
        task: &str,
        objects: &[TaskObject],
        container: &ReferenceSlot,
    ) -> VerificationOutcome {
        let mut records = vec![VerificationRecord::default(); objects.len()];
        let mut verdict = Verdict::Unavailable("not judged".to_string());
        let mut retries = Vec::new();
        let mut phases = Vec::new();
        let mut phase = Phase::TableObserve;

        loop {
            phases.push(phase);
            info!(?phase, "verification phase");
            match phase {
                Phase::TableObserve => self.observe_table(objects, &mut records).await,
                Phase::BinObserve => self.observe_bins(objects, &mut records).await,
                Phase::Judge => {
                    verdict = self.judge(task, objects, &records).await;
                }
                Phase::RetryDispatch => {
                    retries = self.retry(objects, &records, container).await;
                }
                Phase::Done => break,
            }
            phase = phase.next(verdict.is_affirmative());
        }

        VerificationOutcome {
            container: container.name.clone(),
            records: objects.iter().cloned().zip(records).collect(),
            verdict,
            retries,
            phases,
        }
    }

    async fn observe_table(&self, objects: &[TaskObject], records: &mut [VerificationRecord]) {
        if !self.move_vision(VisionCommand::Home).await {
            return;
        }
        let scene = self.perception().observe(objects).await;
        for (idx, record) in records.iter_mut().enumerate() {
            if let Some((center, confidence)) = scene.matched_center(idx) {
                record.table_confidence = confidence;
                record.table_pose = self.calibration.nearest(&center).copied();
            }
        }
        info!(confidences = ?records.iter().map(|r| r.table_confidence).collect::<Vec<_>>(), "table view");
    }

    async fn observe_bins(&self, objects: &[TaskObject], records: &mut [VerificationRecord]) {
        if !self.move_vision(VisionCommand::Bins).await {
            return;
        }
        let threshold = self.config.verification.bin_threshold;
        let scene = self.perception().observe(objects).await;
        for (idx, record) in records.iter_mut().enumerate() {
            let Some((center, confidence)) = scene.matched_center(idx) else {
                continue;
            };
            record.bin_confidence = confidence;
            if confidence >= threshold {
                let slot = self.slots.classify(&center);
                record.bin_pose = Some(slot.pose);
                record.bin_slot = Some(slot.name.clone());
            }
        }
        info!(confidences = ?records.iter().map(|r| r.bin_confidence).collect::<Vec<_>>(), "bin view");
    }

    async fn judge(
        &self,
        task: &str,
        objects: &[TaskObject],
        records: &[VerificationRecord],
    ) -> Verdict {
        let prompt = verification_prompt(task, objects, records, &self.slots);
        match self.collaborators.planner.judge(&prompt).await {
            Ok(reply) => {
                info!(%reply, "judge replied");
                Verdict::from_reply(reply)
            }
            Err(e) => {
                warn!(error = %e, "judge unavailable; treating as not verified");
                Verdict::Unavailable(e.to_string())
            }
        }
    }

    async fn retry(
        &self,
        objects: &[TaskObject],
        records: &[VerificationRecord],
        container: &ReferenceSlot,
    ) -> Vec<RetryAttempt> {
        let threshold = self.config.verification.bin_threshold;
        let mut attempts = Vec::new();

        for (object, record) in objects.iter().zip(records) {
            if !record.needs_retry(threshold) {
                continue;
            }
            let Some(pick) = record.table_pose else {
                warn!(object = %object.name, "cannot retry without a table pose; skipping");
                attempts.push(RetryAttempt {
                    object: object.name.clone(),
                    status: RetryStatus::NoTablePose,
                });
                continue;
            };

            let known = vec![
                (object.name.clone(), pick),
                (container.name.clone(), container.pose),
            ];
            let request = retry_request(&object.name, &pick, container);
            info!(object = %object.name, %request, "planning retry");

            let status = match self
                .collaborators
                .planner
                .plan_instructions(&task_details(&request, &known))
                .await
            {
                Err(e) => {
                    warn!(object = %object.name, error = %e, "retry planning failed");
                    RetryStatus::PlannerFailed(e.to_string())
                }
                Ok(lines) => {
                    // Park the vision arm out of the worker's way first.
                    self.move_vision(VisionCommand::Home).await;
                    match self.dispatch(&lines, &known).await {
                        Ok(report) => RetryStatus::Dispatched(report),
                        Err(e) => {
                            warn!(object = %object.name, error = %e, "retry dispatch failed");
                            RetryStatus::DispatchFailed(e.to_string())
                        }
                    }
                }
            };
            attempts.push(RetryAttempt {
                object: object.name.clone(),
                status,
            });
        }

        if attempts.is_empty() {
            info!("no clear misplaced objects to retry");
        }
        attempts
    }
}

/// Builds the judge prompt from one verification pass.
pub fn verification_prompt(
    task: &str,
    objects: &[TaskObject],
    records: &[VerificationRecord],
    slots: &SlotSet,
) -> String {
    let mut lines = vec![format!("Original task:\n\"{task}\"\n"), "Table-view observations:".to_string()];

    for (object, record) in objects.iter().zip(records) {
        lines.push(match &record.table_pose {
            Some(pose) => format!(
                "  - {object}: table_confidence = {:.2}; pose = {pose}",
                record.table_confidence
            ),
            None => format!(
                "  - {object}: table_confidence = {:.2} (not detected on table)",
                record.table_confidence
            ),
        });
    }
    lines.push(String::new());

    lines.push("Bin-view observations:".to_string());
    for (object, record) in objects.iter().zip(records) {
        lines.push(match (&record.bin_pose, &record.bin_slot) {
            (Some(pose), Some(slot)) => format!(
                "  - {object}: bin_confidence = {:.2}; pose = {pose} ({slot})",
                record.bin_confidence
            ),
            (Some(pose), None) => format!(
                "  - {object}: bin_confidence = {:.2}; pose = {pose}",
                record.bin_confidence
            ),
            _ => format!(
                "  - {object}: bin_confidence = {:.2} (not detected in bin)",
                record.bin_confidence
            ),
        });
    }
    lines.push(String::new());

    lines.push("Known bin coordinates (for reference):".to_string());
    for slot in slots.iter() {
        lines.push(format!("  - {}: {}", slot.name, slot.pose));
    }
    lines.push(String::new());

    lines.push("Per-object comparison (using the exact numbers above):".to_string());
    for (object, record) in objects.iter().zip(records) {
        let (op, place) = if record.in_container() {
            (">", "in the bin")
        } else {
            ("<=", "on the table")
        };
        lines.push(format!(
            "  - {object}: table_confidence = {t:.2}, bin_confidence = {b:.2} -> since {b:.2} {op} {t:.2}, {object} is {place}.",
            t = record.table_confidence,
            b = record.bin_confidence,
        ));
    }
    lines.push(String::new());

    lines.push(
        "Also note: if any object's reported bin-view pose is within 0.2 units of one of the \
         known bin coordinates above, treat that object as being in that bin."
            .to_string(),
    );
    lines.push(String::new());
    lines.push(
        "Using the information, the explicit comparisons, and the rules above, determine whether \
         each object has been placed correctly according to the original task. If all objects \
         ended up in the correct bin, respond with \"Yes, the task is complete.\" If any object \
         remains on the table or is in the wrong bin, respond with \"No,\" followed by a brief \
         explanation naming which object(s) remain or are misplaced and how to retry. Do not \
         include raw numeric poses in your response. Treat each object independently."
            .to_string(),
    );

    lines.join("\n")
}

/// Task text for a single-object retry plan.
pub fn retry_request(object: &str, pick: &Pose6D, container: &ReferenceSlot) -> String {
    let place = &container.pose;
    format!(
        "Pick up the {object} from ({:.2}, {:.2}, {:.2}; {:.2}, {:.2}, {:.2}) \
         and place it into the {} ({:.2}, {:.2}, {:.2}; {:.2}, {:.2}, {:.2}).",
        pick.position.x,
        pick.position.y,
        pick.position.z,
        pick.roll(),
        pick.pitch(),
        pick.yaw(),
        container.name,
        place.position.x,
        place.position.y,
        place.position.z,
        place.roll(),
        place.pitch(),
        place.yaw(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::Pixel;

    fn bins() -> SlotSet {
        SlotSet::new(vec![
            ReferenceSlot {
                name: "Green Bin".to_string(),
                pixel: Pixel::new(0.0, 0.0),
                pose: Pose6D::new(172.8, -226.4, 107.4, 93.9, -0.83, 47.41),
            },
            ReferenceSlot {
                name: "Blue Bin".to_string(),
                pixel: Pixel::new(10.0, 0.0),
                pose: Pose6D::new(166.7, -273.3, 108.2, 73.14, -1.83, 12.7),
            },
        ])
        .expect("slots")
    }

    fn record(table: f32, bin: f32) -> VerificationRecord {
        VerificationRecord {
            table_confidence: table,
            bin_confidence: bin,
            ..VerificationRecord::default()
        }
    }

    #[test]
    fn weaker_bin_view_is_retried() {
        let r = record(0.6, 0.2);
        assert!(r.needs_retry(0.1));
        assert!(!r.in_container());
    }

    #[test]
    fn stronger_bin_view_is_in_bin() {
        let r = record(0.1, 0.9);
        assert!(!r.needs_retry(0.1));
        assert!(r.in_container());
    }

    #[test]
    fn bin_view_below_threshold_is_retried() {
        assert!(record(0.0, 0.05).needs_retry(0.1));
    }

    #[test]
    fn phases_cap_at_one_retry() {
        let mut phase = Phase::TableObserve;
        let mut seen = vec![phase];
        while phase != Phase::Done {
            phase = phase.next(false);
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                Phase::TableObserve,
                Phase::BinObserve,
                Phase::Judge,
                Phase::RetryDispatch,
                Phase::Done
            ]
        );
        assert_eq!(Phase::Judge.next(true), Phase::Done);
        assert_eq!(Phase::Done.next(false), Phase::Done);
    }

    #[test]
    fn prompt_spells_out_comparisons() {
        let objects = vec![TaskObject::new("lemon"), TaskObject::new("red block")];
        let mut in_bin = record(0.1, 0.9);
        in_bin.bin_pose = Some(bins().default_slot().pose);
        in_bin.bin_slot = Some("Green Bin".to_string());
        let records = vec![record(0.6, 0.2), in_bin];

        let prompt = verification_prompt("put everything in the green bin", &objects, &records, &bins());
        assert!(prompt.starts_with("Original task:\n\"put everything in the green bin\""));
        assert!(prompt.contains("  - lemon: table_confidence = 0.60 (not detected on table)"));
        assert!(prompt.contains("since 0.20 <= 0.60, lemon is on the table."));
        assert!(prompt.contains("since 0.90 > 0.10, red block is in the bin."));
        assert!(prompt.contains("(Green Bin)"));
        assert!(prompt.contains("  - Blue Bin: (X=166.70, Y=-273.30, Z=108.20; roll=73.14, pitch=-1.83, yaw=12.70)"));
    }

    #[test]
    fn retry_request_names_both_poses() {
        let slots = bins();
        let text = retry_request(
            "lemon",
            &Pose6D::new(81.3, -310.6, 100.0, 74.31, 0.13, -5.22),
            slots.default_slot(),
        );
        assert_eq!(
            text,
            "Pick up the lemon from (81.30, -310.60, 100.00; 74.31, 0.13, -5.22) \
             and place it into the Green Bin (172.80, -226.40, 107.40; 93.90, -0.83, 47.41)."
        );
    }

    #[test]
    fn verdict_from_reply() {
        assert!(Verdict::from_reply("yes, done".to_string()).is_affirmative());
        assert!(!Verdict::from_reply("No, lemon remains".to_string()).is_affirmative());
        assert!(!Verdict::Unavailable("timeout".to_string()).is_affirmative());
    }
}
