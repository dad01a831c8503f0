//! Language-model planner contract and the text it consumes.

use async_trait::async_trait;

use crate::calibration::{ReferenceSlot, SlotSet};
use crate::error::Result;
use crate::facts::{Pose6D, TaskObject};

/// The external planner/judge.
///
/// Implementations own prompting and transport; the core only formats inputs and
/// validates outputs.
#[async_trait]
pub trait TaskPlanner: Send + Sync {
    /// Object names mentioned in a task description.
    async fn extract_objects(&self, task: &str) -> Result<Vec<String>>;

    /// Ordered motion-primitive lines for the given task details.
    async fn plan_instructions(&self, task_details: &str) -> Result<Vec<String>>;

    /// Free-text verdict on a verification prompt.
    async fn judge(&self, prompt: &str) -> Result<String>;
}

/// Grammar rules a planner implementation should send along with the task details.
pub const INSTRUCTION_RULES: &str = "\
Given the following task, generate a list of robot commands according to the formats below. \
Each command must strictly follow the given format without any extra numbering, punctuation, \
or commentary. To pick something up you must move to it first.

Requirements:
1. For a move command, output exactly six numerical values (x, y, z, roll, pitch, yaw) in the format:
   move(x, y, z, roll, pitch, yaw)
2. Whenever you move to a specific object's position, INCLUDING THE BIN, you must fill in that \
object's roll, pitch, and yaw. Never re-use the roll/pitch/yaw from a previous move.
3. For a pick_up command, output exactly three numerical values (x, y, z) in the format:
   pick_up(x, y, z)
4. For a place command, output exactly three numerical values (x, y, z) in the format:
   place(x, y, z)

Return only the commands, one per line, with no extra text or numbering.";

/// Full instruction prompt: rules followed by the task details.
pub fn instruction_prompt(task_details: &str) -> String {
    format!("{INSTRUCTION_RULES}\n\nTask Details:\n{task_details}")
}

/// Formats a task and its object poses for the planner.
pub fn task_details(task: &str, objects: &[(String, Pose6D)]) -> String {
    let mut details = format!("Task: {task}\n\n");
    for (name, pose) in objects {
        details.push_str(&format!(
            "{name}:\nPosition: {}  {}  {}\nOrientation: {}  {}  {}  # Roll, Pitch, Yaw\n\n",
            pose.position.x,
            pose.position.y,
            pose.position.z,
            pose.roll(),
            pose.pitch(),
            pose.yaw()
        ));
    }
    details
}

/// Drops names that refer to containers: those containing `container_keyword` or equal to a
/// configured container name (both case-insensitive). Blank names are dropped too.
pub fn filter_task_objects(
    names: Vec<String>,
    slots: &SlotSet,
    container_keyword: &str,
) -> Vec<TaskObject> {
    let keyword = container_keyword.trim().to_lowercase();
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .filter(|n| keyword.is_empty() || !n.to_lowercase().contains(&keyword))
        .filter(|n| slots.by_name(n).is_none())
        .map(TaskObject::new)
        .collect()
}

/// The container the task asks for: the first one named in the task text, else the default.
pub fn designated_container<'a>(task: &str, slots: &'a SlotSet) -> &'a ReferenceSlot {
    let task = task.to_lowercase();
    slots
        .iter()
        .find(|slot| task.contains(&slot.name.to_lowercase()))
        .unwrap_or_else(|| slots.default_slot())
}

/// A judge reply counts as success only if it starts with "yes".
pub fn is_affirmative(reply: &str) -> bool {
    reply.trim().to_lowercase().starts_with("yes")
}
