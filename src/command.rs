//! Worker-robot command grammar.
//!
//! Planner output is free text; only lines that normalise into one of
//! `move(x,y,z,roll,pitch,yaw)`, `pick_up(x,y,z)` or `place(x,y,z)` are ever sent.

use std::fmt;

use tracing::warn;

use crate::error::{CoreError, Result};
use crate::facts::Pose6D;

/// A validated motion primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    Move(Pose6D),
    PickUp { x: f32, y: f32, z: f32 },
    Place { x: f32, y: f32, z: f32 },
}

impl MotionCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            MotionCommand::Move(_) => "move",
            MotionCommand::PickUp { .. } => "pick_up",
            MotionCommand::Place { .. } => "place",
        }
    }
}

/// A normalised command line together with its parsed form.
///
/// `text` is what goes on the wire; numbers keep the planner's own spelling.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    pub text: String,
    pub command: MotionCommand,
}

impl CommandLine {
    /// Normalises and validates one planner line.
    pub fn parse(raw: &str) -> Result<Self> {
        let text = normalize_line(raw);
        let command = parse_normalized(&text)?;
        Ok(Self { text, command })
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Strips a leading ordinal (`1.` / `2)`), collapses whitespace, and removes spaces
/// next to parentheses and commas.
pub fn normalize_line(raw: &str) -> String {
    let trimmed = strip_ordinal(raw.trim());

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");

    let chars: Vec<char> = collapsed.chars().collect();
    let mut out = String::with_capacity(collapsed.len());
    for (idx, &c) in chars.iter().enumerate() {
        if c == ' ' {
            let prev_tight = out.ends_with(['(', ')', ',']);
            let next_tight = matches!(chars.get(idx + 1), Some('(' | ')' | ','));
            if prev_tight || next_tight {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn strip_ordinal(line: &str) -> &str {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return line;
    }
    match line[digits..].strip_prefix(['.', ')']) {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

fn parse_normalized(line: &str) -> Result<MotionCommand> {
    let Some(open) = line.find('(') else {
        return Err(CoreError::malformed(line, "missing '('"));
    };
    let verb = &line[..open];
    let arity = match verb {
        "move" => 6,
        "pick_up" | "place" => 3,
        other => {
            return Err(CoreError::malformed(
                line,
                format!("unknown verb '{other}' (expected move, pick_up or place)"),
            ))
        }
    };

    let Some(args) = line[open + 1..].strip_suffix(')') else {
        return Err(CoreError::malformed(line, "missing closing ')'"));
    };

    let values = args
        .split(',')
        .map(|a| {
            a.parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| CoreError::malformed(line, format!("'{a}' is not a number")))
        })
        .collect::<Result<Vec<f32>>>()?;

    if values.len() != arity {
        return Err(CoreError::malformed(
            line,
            format!("{verb} takes {arity} values, got {}", values.len()),
        ));
    }

    Ok(match verb {
        "move" => MotionCommand::Move(Pose6D::new(
            values[0], values[1], values[2], values[3], values[4], values[5],
        )),
        "pick_up" => MotionCommand::PickUp {
            x: values[0],
            y: values[1],
            z: values[2],
        },
        _ => MotionCommand::Place {
            x: values[0],
            y: values[1],
            z: values[2],
        },
    })
}

/// A line the audit or the grammar refused.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub line: String,
    pub reason: String,
}

/// Result of checking a whole planner response before anything is sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanAudit {
    pub accepted: Vec<CommandLine>,
    pub rejected: Vec<Rejection>,
}

/// Validates every planner line, skipping (and logging) the ones that fail.
///
/// Blank lines are ignored. When `known_poses` is given, a `move` landing within
/// `tolerance` of a known object's position must carry that object's orientation.
pub fn audit_plan(
    lines: &[String],
    known_poses: &[(String, Pose6D)],
    tolerance: f32,
) -> PlanAudit {
    let mut audit = PlanAudit::default();

    for raw in lines {
        if raw.trim().is_empty() {
            continue;
        }
        let checked = CommandLine::parse(raw)
            .and_then(|cmd| check_orientation(cmd, known_poses, tolerance));
        match checked {
            Ok(cmd) => audit.accepted.push(cmd),
            Err(CoreError::MalformedCommand { line, reason }) => {
                warn!(%line, %reason, "rejected planner line");
                audit.rejected.push(Rejection { line, reason });
            }
            Err(other) => {
                warn!(line = %raw, error = %other, "rejected planner line");
                audit.rejected.push(Rejection {
                    line: raw.clone(),
                    reason: other.to_string(),
                });
            }
        }
    }

    audit
}

fn check_orientation(
    cmd: CommandLine,
    known_poses: &[(String, Pose6D)],
    tolerance: f32,
) -> Result<CommandLine> {
    let MotionCommand::Move(target) = cmd.command else {
        return Ok(cmd);
    };

    let owner = known_poses
        .iter()
        .filter(|(_, pose)| (pose.position - target.position).norm() <= tolerance)
        .min_by(|(_, a), (_, b)| {
            let da = (a.position - target.position).norm();
            let db = (b.position - target.position).norm();
            da.total_cmp(&db)
        });

    if let Some((name, pose)) = owner {
        if (pose.orientation - target.orientation).norm() > tolerance {
            return Err(CoreError::malformed(
                cmd.text,
                format!(
                    "move to {name} must use its orientation ({:.2}, {:.2}, {:.2})",
                    pose.roll(),
                    pose.pitch(),
                    pose.yaw()
                ),
            ));
        }
    }
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_is_stripped() {
        let cmd = CommandLine::parse("1. move(1,2,3,4,5,6)").expect("valid");
        assert_eq!(cmd.text, "move(1,2,3,4,5,6)");
        assert_eq!(
            cmd.command,
            MotionCommand::Move(Pose6D::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0))
        );
    }

    #[test]
    fn whitespace_is_tightened() {
        assert_eq!(
            normalize_line("  2)   pick_up ( 81.3 ,  -310.6,100 )  "),
            "pick_up(81.3,-310.6,100)"
        );
        assert_eq!(
            normalize_line("move(172.8, -226.4, 107.4, 93.9, -0.83, 47.41)"),
            "move(172.8,-226.4,107.4,93.9,-0.83,47.41)"
        );
    }

    #[test]
    fn unknown_verb_is_rejected() {
        let err = CommandLine::parse("rotate(1,2,3)").unwrap_err();
        assert!(matches!(err, CoreError::MalformedCommand { .. }));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        assert!(CommandLine::parse("move(1,2,3)").is_err());
        assert!(CommandLine::parse("place(1,2,3,4)").is_err());
        assert!(CommandLine::parse("pick_up(1,2,x)").is_err());
        assert!(CommandLine::parse("place(1,2,3").is_err());
    }

    #[test]
    fn numbers_keep_planner_spelling() {
        let cmd = CommandLine::parse("place(172.80, -226.40, 107.40)").expect("valid");
        assert_eq!(cmd.to_string(), "place(172.80,-226.40,107.40)");
        assert_eq!(cmd.command.verb(), "place");
    }

    #[test]
    fn audit_skips_bad_lines_and_continues() {
        let lines = vec![
            "1. move(1,2,3,4,5,6)".to_string(),
            String::new(),
            "Here are the commands:".to_string(),
            "pick_up(1,2,3)".to_string(),
        ];
        let audit = audit_plan(&lines, &[], 0.5);
        assert_eq!(audit.accepted.len(), 2);
        assert_eq!(audit.rejected.len(), 1);
        assert_eq!(audit.accepted[1].text, "pick_up(1,2,3)");
    }

    #[test]
    fn audit_rejects_borrowed_orientation() {
        let known = vec![
            (
                "red block".to_string(),
                Pose6D::new(81.3, -310.6, 100.0, 74.31, 0.13, -5.22),
            ),
            (
                "Green Bin".to_string(),
                Pose6D::new(172.8, -226.4, 107.4, 93.9, -0.83, 47.41),
            ),
        ];
        let lines = vec![
            "move(81.3, -310.6, 100.0, 74.31, 0.13, -5.22)".to_string(),
            "move(172.8, -226.4, 107.4, 74.31, 0.13, -5.22)".to_string(),
            "move(172.8, -226.4, 107.4, 93.9, -0.83, 47.41)".to_string(),
        ];
        let audit = audit_plan(&lines, &known, 0.5);
        assert_eq!(audit.accepted.len(), 2);
        assert_eq!(audit.rejected.len(), 1);
        assert!(audit.rejected[0].reason.contains("Green Bin"));
    }
}
