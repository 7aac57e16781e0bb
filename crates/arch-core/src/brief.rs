//! The human-editable project brief (`BRIEF.md`, spec §6): five
//! markdown sections -- Goal, Done When, Constraints, Current Status,
//! Decisions Log. The kernel only ever rewrites two of them:
//! `update_brief` replaces *Current Status* wholesale and appends one
//! dated row to *Decisions Log*; everything else is read-only from the
//! kernel's point of view, edited by the human between runs.

use std::path::Path;

use chrono::Utc;

use crate::error::WorktreeError;

pub const SECTION_CURRENT_STATUS: &str = "Current Status";
pub const SECTION_DECISIONS_LOG: &str = "Decisions Log";

const DEFAULT_BRIEF: &str = "# Project Brief\n\n\
## Goal\n\n\
## Done When\n\n\
## Constraints\n\n\
## Current Status\n\n\
## Decisions Log\n\n";

/// The section a bus-tool `update_brief` call may target. Closed set:
/// the spec names exactly these two as kernel-writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BriefSection {
    CurrentStatus,
    DecisionsLog,
}

impl BriefSection {
    pub fn heading(&self) -> &'static str {
        match self {
            BriefSection::CurrentStatus => SECTION_CURRENT_STATUS,
            BriefSection::DecisionsLog => SECTION_DECISIONS_LOG,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current_status" => Some(BriefSection::CurrentStatus),
            "decisions_log" => Some(BriefSection::DecisionsLog),
            _ => None,
        }
    }
}

fn read_or_default(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|_| DEFAULT_BRIEF.to_string())
}

/// Read the full brief file, creating a skeleton one if it doesn't
/// exist yet (a fresh project's first `get_project_context` call should
/// never fail just because nobody has written `BRIEF.md` yet).
pub fn read(path: &Path) -> String {
    read_or_default(path)
}

/// Byte range of a `## {heading}` section's body: from just after the
/// heading line to just before the next `## ` heading, or end of file.
fn section_bounds(text: &str, heading: &str) -> Option<(usize, usize)> {
    let marker = format!("## {heading}");
    let start_of_heading = text.find(&marker)?;
    let body_start = text[start_of_heading..]
        .find('\n')
        .map(|i| start_of_heading + i + 1)?;

    let rest = &text[body_start..];
    let body_end = rest
        .find("\n## ")
        .map(|i| body_start + i + 1)
        .unwrap_or(text.len());

    Some((body_start, body_end))
}

/// Replace a section's body wholesale. If the heading is missing (a
/// hand-edited file that dropped it), the section is appended at the
/// end rather than failing the call.
pub fn replace_section(path: &Path, heading: &str, content: &str) -> Result<(), WorktreeError> {
    let text = read_or_default(path);
    let new_text = match section_bounds(&text, heading) {
        Some((start, end)) => format!("{}{}\n\n{}", &text[..start], content.trim_end(), &text[end..]),
        None => format!("{text}\n## {heading}\n\n{}\n\n", content.trim_end()),
    };
    write(path, &new_text)
}

/// Append one dated row to a section (the Decisions Log shape): insert
/// immediately after the heading so the newest entry reads first.
pub fn append_row(path: &Path, heading: &str, content: &str) -> Result<(), WorktreeError> {
    let text = read_or_default(path);
    let row = format!("- {}: {}", Utc::now().to_rfc3339(), content.trim());
    let new_text = match section_bounds(&text, heading) {
        Some((start, _end)) => format!("{}{}\n{}", &text[..start], row, &text[start..]),
        None => format!("{text}\n## {heading}\n\n{row}\n\n"),
    };
    write(path, &new_text)
}

fn write(path: &Path, text: &str) -> Result<(), WorktreeError> {
    std::fs::write(path, text).map_err(WorktreeError::GitCommand)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_current_status_is_a_full_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BRIEF.md");
        std::fs::write(&path, DEFAULT_BRIEF).unwrap();

        replace_section(&path, SECTION_CURRENT_STATUS, "halfway through the migration").unwrap();
        let text = read(&path);
        assert!(text.contains("halfway through the migration"));
        assert!(text.contains("## Decisions Log"));

        replace_section(&path, SECTION_CURRENT_STATUS, "done").unwrap();
        let text2 = read(&path);
        assert!(!text2.contains("halfway through the migration"));
        assert!(text2.contains("done"));
    }

    #[test]
    fn append_row_adds_one_dated_entry_without_clobbering_prior_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BRIEF.md");
        std::fs::write(&path, DEFAULT_BRIEF).unwrap();

        append_row(&path, SECTION_DECISIONS_LOG, "chose postgres over sqlite").unwrap();
        append_row(&path, SECTION_DECISIONS_LOG, "moved to trunk-based development").unwrap();

        let text = read(&path);
        assert!(text.contains("chose postgres over sqlite"));
        assert!(text.contains("moved to trunk-based development"));
        // both rows present, newest first
        let postgres_idx = text.find("chose postgres").unwrap();
        let trunk_idx = text.find("moved to trunk-based").unwrap();
        assert!(trunk_idx < postgres_idx);
    }

    #[test]
    fn missing_file_yields_default_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BRIEF.md");
        let text = read(&path);
        assert!(text.contains("## Goal"));
        assert!(text.contains("## Current Status"));
    }

    #[test]
    fn section_parse_rejects_unknown_names() {
        assert_eq!(BriefSection::parse("current_status"), Some(BriefSection::CurrentStatus));
        assert_eq!(BriefSection::parse("decisions_log"), Some(BriefSection::DecisionsLog));
        assert_eq!(BriefSection::parse("scope"), None);
    }
}
