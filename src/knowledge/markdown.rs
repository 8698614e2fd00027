//! Knowledge document file format
//!
//! Round-trips documents between the structured form and a Markdown file
//! with a YAML-like front matter block:
//!
//! ```text
//! ---
//! id: K001
//! title: "..."
//! type: wiring
//! ...
//! ---
//!
//! # K001: <title>
//!
//! ## K001.1: <part title>
//! <one-paragraph summary>
//!
//! <content…>
//! ```
//!
//! Front-matter values for `title` are double-quoted with `\"` and `\\`
//! escapes; every other value is written bare. Parsing is line-oriented and
//! tolerant: unknown keys are ignored, a missing optional key is `None`.

use crate::error::{AssistError, Result};
use crate::knowledge::models::{
    Knowledge, KnowledgePart, KnowledgeStatus, KnowledgeType, RemoteOrigin,
};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn part_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^##\s+(K\w+\.\d+):\s+(.+)$").unwrap())
}

/// Render a document to its on-disk Markdown form.
pub fn render_knowledge_md(doc: &Knowledge) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("id: {}\n", doc.id));
    out.push_str(&format!("title: {}\n", quote(&doc.title)));
    out.push_str(&format!("type: {}\n", doc.knowledge_type));
    out.push_str(&format!("project: {}\n", doc.project));
    out.push_str(&format!("status: {}\n", doc.status));
    out.push_str(&format!("createdAt: {}\n", render_instant(&doc.created_at)));
    out.push_str(&format!("updatedAt: {}\n", render_instant(&doc.updated_at)));
    if let Some(session) = &doc.source_session_id {
        out.push_str(&format!("sourceSessionId: {}\n", session));
    }
    if let Some(agent) = &doc.source_agent_id {
        out.push_str(&format!("sourceAgentId: {}\n", agent));
    }
    if let Some(ts) = &doc.source_timestamp {
        out.push_str(&format!("sourceTimestamp: {}\n", ts));
    }
    if let Some(origin) = &doc.origin {
        out.push_str("origin: remote\n");
        out.push_str(&format!("machineId: {}\n", origin.machine_id));
        out.push_str(&format!("machineHostname: {}\n", origin.machine_hostname));
        out.push_str(&format!("machineOS: {}\n", origin.machine_os));
    }
    out.push_str("---\n\n");

    out.push_str(&format!("# {}: {}\n", doc.id, doc.title));

    for part in &doc.parts {
        out.push('\n');
        out.push_str(&format!("## {}: {}\n", part.part_id, part.title));
        out.push_str(&part.summary);
        out.push('\n');
        if !part.content.trim().is_empty() {
            out.push('\n');
            out.push_str(part.content.trim_end());
            out.push('\n');
        }
    }

    out
}

/// Parse an on-disk Markdown document back into structured form.
pub fn parse_knowledge_md(md: &str) -> Result<Knowledge> {
    let (front, body) = split_front_matter(md)?;
    let fields = parse_front_matter(&front);

    let id = fields
        .get("id")
        .cloned()
        .ok_or_else(|| AssistError::Parse("front matter missing id".to_string()))?;
    let title = fields
        .get("title")
        .cloned()
        .ok_or_else(|| AssistError::Parse("front matter missing title".to_string()))?;

    let origin = if fields.get("origin").map(String::as_str) == Some("remote") {
        Some(RemoteOrigin {
            machine_id: fields.get("machineId").cloned().unwrap_or_default(),
            machine_hostname: fields.get("machineHostname").cloned().unwrap_or_default(),
            machine_os: fields.get("machineOS").cloned().unwrap_or_default(),
        })
    } else {
        None
    };

    let mut doc = Knowledge {
        id,
        title,
        knowledge_type: fields
            .get("type")
            .map(|s| KnowledgeType::from(s.as_str()))
            .unwrap_or(KnowledgeType::Wiring),
        project: fields.get("project").cloned().unwrap_or_default(),
        status: fields
            .get("status")
            .map(|s| KnowledgeStatus::from(s.as_str()))
            .unwrap_or(KnowledgeStatus::Active),
        created_at: parse_instant(fields.get("createdAt"))?,
        updated_at: parse_instant(fields.get("updatedAt"))?,
        source_session_id: fields.get("sourceSessionId").cloned(),
        source_agent_id: fields.get("sourceAgentId").cloned(),
        source_timestamp: fields.get("sourceTimestamp").cloned(),
        parts: parse_parts(&body),
        origin,
    };
    doc.renumber_parts();
    Ok(doc)
}

fn render_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_instant(value: Option<&String>) -> Result<DateTime<Utc>> {
    match value {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| AssistError::Parse(format!("bad timestamp {:?}: {}", raw, e))),
        None => Ok(Utc::now()),
    }
}

fn split_front_matter(md: &str) -> Result<(String, String)> {
    let mut lines = md.lines();
    if lines.next().map(str::trim) != Some("---") {
        return Err(AssistError::Parse(
            "document does not start with front matter".to_string(),
        ));
    }

    let mut front = Vec::new();
    while let Some(line) = lines.next() {
        if line.trim() == "---" {
            let body: Vec<&str> = lines.collect();
            return Ok((front.join("\n"), body.join("\n")));
        }
        front.push(line);
    }
    Err(AssistError::Parse(
        "unterminated front matter block".to_string(),
    ))
}

fn parse_front_matter(front: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in front.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        fields.insert(key.to_string(), unquote(value.trim()));
    }
    fields
}

fn parse_parts(body: &str) -> Vec<KnowledgePart> {
    let mut parts: Vec<(String, String, Vec<String>)> = Vec::new();

    for line in body.lines() {
        if let Some(caps) = part_heading_re().captures(line) {
            parts.push((caps[1].to_string(), caps[2].to_string(), Vec::new()));
        } else if let Some((_, _, lines)) = parts.last_mut() {
            lines.push(line.to_string());
        }
    }

    parts
        .into_iter()
        .map(|(part_id, title, lines)| {
            let (summary, content) = split_summary(&lines);
            KnowledgePart {
                part_id,
                title,
                summary,
                content,
            }
        })
        .collect()
}

/// The first non-empty paragraph is the summary; everything after the next
/// blank line is content.
fn split_summary(lines: &[String]) -> (String, String) {
    let mut summary = Vec::new();
    let mut content = Vec::new();
    let mut state = SummaryState::Leading;

    for line in lines {
        match state {
            SummaryState::Leading => {
                if !line.trim().is_empty() {
                    summary.push(line.clone());
                    state = SummaryState::Summary;
                }
            }
            SummaryState::Summary => {
                if line.trim().is_empty() {
                    state = SummaryState::Content;
                } else {
                    summary.push(line.clone());
                }
            }
            SummaryState::Content => content.push(line.clone()),
        }
    }

    (
        summary.join("\n").trim().to_string(),
        content.join("\n").trim().to_string(),
    )
}

enum SummaryState {
    Leading,
    Summary,
    Content,
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
