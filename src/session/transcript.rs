//! Session transcript parsing
//!
//! Transcripts are append-only JSONL files written by the coding assistant,
//! one per session, with sub-agent transcripts under an adjacent
//! `{sessionId}/subagents/` directory. Parsing is line-oriented and
//! skip-on-error: a malformed line never fails the file.

use crate::pricing::TokenUsage;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// One line of a transcript, with only the fields this crate reads.
/// Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub message: Option<MessageBody>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, rename = "forkedFromSessionId")]
    pub forked_from_session_id: Option<String>,
    #[serde(default, rename = "forkPointUuid")]
    pub fork_point_uuid: Option<String>,
    /// Present on `system`/`init` records.
    #[serde(default)]
    pub model: Option<String>,
    /// Present on `result` records; overrides recomputed cost.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub usage: Option<RecordUsage>,
}

/// Message content is either a plain string or a block array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(default, rename = "type")]
    pub block_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RecordUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

impl RecordUsage {
    pub fn to_tokens(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
            cache_creation_tokens: self.cache_creation_input_tokens.unwrap_or(0),
            cache_read_tokens: self.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

impl MessageContent {
    /// Flatten to plain text: the string itself, or the concatenated `text`
    /// blocks of an array.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type.as_deref() == Some("text"))
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// True when the content carries any tool-result block (a synthetic
    /// reply, not something the user typed).
    pub fn is_tool_reply(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .any(|b| b.block_type.as_deref() == Some("tool_result")),
        }
    }
}

/// Task list item extracted from the session's latest todo update.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TaskItem {
    pub content: String,
    pub status: String,
}

/// A sub-agent launch announced by the parent transcript.
#[derive(Debug, Clone)]
pub struct TaskLaunch {
    pub description: String,
    pub prompt: String,
    pub agent_type: String,
}

/// Parse result for one transcript file (sub-agents excluded; the cache
/// joins them in).
#[derive(Debug, Default)]
pub struct ParsedTranscript {
    pub user_prompts: Vec<String>,
    pub task_list: Vec<TaskItem>,
    pub task_launches: Vec<TaskLaunch>,
    pub usage_by_model: HashMap<String, TokenUsage>,
    pub turn_count: u64,
    pub model: Option<String>,
    pub total_cost_override: Option<f64>,
    pub cwd: Option<String>,
    pub forked_from_session_id: Option<String>,
    pub fork_point_uuid: Option<String>,
    pub last_timestamp: Option<String>,
}

/// Decide whether a user record is something the user actually typed.
///
/// The filter is a pure predicate on the text shape: synthetic replies carry
/// tool results, angle-bracketed command wrappers, caveat banners, or
/// interruption markers. Position in the file plays no part.
pub fn is_real_user_prompt(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('<') {
        return false;
    }
    if trimmed.starts_with("Caveat:") {
        return false;
    }
    if trimmed.starts_with("[Request interrupted") {
        return false;
    }
    true
}

fn parse_line(line: &str) -> Option<SessionRecord> {
    match serde_json::from_str::<SessionRecord>(line) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!("Skipping malformed transcript line: {}", e);
            None
        }
    }
}

/// Parse a full transcript file. Unreadable files return `None`; malformed
/// lines are skipped.
pub async fn parse_transcript(path: &Path) -> Option<ParsedTranscript> {
    let file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            debug!("Cannot open transcript {:?}: {}", path, e);
            return None;
        }
    };

    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut parsed = ParsedTranscript::default();

    while let Some(line) = lines.next_line().await.ok()? {
        let Some(record) = parse_line(&line) else {
            continue;
        };

        if parsed.cwd.is_none() {
            parsed.cwd = record.cwd.clone();
        }
        if record.timestamp.is_some() {
            parsed.last_timestamp = record.timestamp.clone();
        }
        if parsed.forked_from_session_id.is_none() {
            parsed.forked_from_session_id = record.forked_from_session_id.clone();
            parsed.fork_point_uuid = record.fork_point_uuid.clone();
        }

        match record.record_type.as_str() {
            "user" => {
                parsed.turn_count += 1;
                if let Some(content) = record.message.as_ref().and_then(|m| m.content.as_ref()) {
                    if !content.is_tool_reply() {
                        let text = content.as_text();
                        if is_real_user_prompt(&text) {
                            parsed.user_prompts.push(text);
                        }
                    }
                }
            }
            "assistant" => {
                if let Some(message) = record.message.as_ref() {
                    if let (Some(model), Some(usage)) = (&message.model, &message.usage) {
                        parsed
                            .usage_by_model
                            .entry(model.clone())
                            .or_default()
                            .add(&usage.to_tokens());
                    }
                    collect_tool_uses(message, &mut parsed);
                }
            }
            "system" => {
                if record.subtype.as_deref() == Some("init") && parsed.model.is_none() {
                    parsed.model = record.model.clone();
                }
            }
            "result" => {
                if record.total_cost_usd.is_some() {
                    parsed.total_cost_override = record.total_cost_usd;
                }
            }
            _ => {}
        }
    }

    // Transcripts predating init records: fall back to the first model seen
    // on an assistant message.
    if parsed.model.is_none() {
        parsed.model = parsed.usage_by_model.keys().next().cloned();
    }

    Some(parsed)
}

fn collect_tool_uses(message: &MessageBody, parsed: &mut ParsedTranscript) {
    let Some(MessageContent::Blocks(blocks)) = &message.content else {
        return;
    };
    for block in blocks {
        if block.block_type.as_deref() != Some("tool_use") {
            continue;
        }
        match block.name.as_deref() {
            Some("TodoWrite") => {
                if let Some(todos) = block.input.as_ref().and_then(|i| i.get("todos")) {
                    if let Some(items) = todos.as_array() {
                        // The last TodoWrite wins; it carries the whole list.
                        parsed.task_list = items
                            .iter()
                            .filter_map(|item| {
                                Some(TaskItem {
                                    content: item.get("content")?.as_str()?.to_string(),
                                    status: item
                                        .get("status")
                                        .and_then(|s| s.as_str())
                                        .unwrap_or("pending")
                                        .to_string(),
                                })
                            })
                            .collect();
                    }
                }
            }
            Some("Task") => {
                if let Some(input) = &block.input {
                    parsed.task_launches.push(TaskLaunch {
                        description: input
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        prompt: input
                            .get("prompt")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        agent_type: input
                            .get("subagent_type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("general")
                            .to_string(),
                    });
                }
            }
            _ => {}
        }
    }
}

/// Summary of one sub-agent run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentSummary {
    pub agent_id: String,
    pub agent_type: String,
    pub prompt: String,
    pub result: Option<String>,
    pub description: String,
    pub status: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Parse one `subagents/{agentId}.jsonl` file.
///
/// The first user record is the prompt; the last assistant text is the
/// result. A `result` record (or a trailing assistant message) marks the run
/// completed. Type and description come from the matching `Task` launch in
/// the parent transcript when one exists.
pub async fn parse_subagent(
    path: &Path,
    agent_id: &str,
    launches: &[TaskLaunch],
) -> Option<SubagentSummary> {
    let file = fs::File::open(path).await.ok()?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let mut prompt: Option<String> = None;
    let mut last_assistant_text: Option<String> = None;
    let mut saw_result = false;
    let mut started_at: Option<String> = None;
    let mut completed_at: Option<String> = None;

    while let Some(line) = lines.next_line().await.ok()? {
        let Some(record) = parse_line(&line) else {
            continue;
        };

        if started_at.is_none() {
            started_at = record.timestamp.clone();
        }
        if record.timestamp.is_some() {
            completed_at = record.timestamp.clone();
        }

        match record.record_type.as_str() {
            "user" => {
                if prompt.is_none() {
                    if let Some(content) = record.message.as_ref().and_then(|m| m.content.as_ref())
                    {
                        if !content.is_tool_reply() {
                            prompt = Some(content.as_text());
                        }
                    }
                }
            }
            "assistant" => {
                if let Some(content) = record.message.as_ref().and_then(|m| m.content.as_ref()) {
                    let text = content.as_text();
                    if !text.trim().is_empty() {
                        last_assistant_text = Some(text);
                    }
                }
            }
            "result" => {
                saw_result = true;
            }
            _ => {}
        }
    }

    let prompt = prompt.unwrap_or_default();
    let launch = launches.iter().find(|l| l.prompt == prompt);

    // Description stays empty when the launch carried none; title derivation
    // downstream falls back to the prompt in that case.
    let description = launch.map(|l| l.description.clone()).unwrap_or_default();

    let status = if saw_result || last_assistant_text.is_some() {
        "completed".to_string()
    } else {
        "running".to_string()
    };

    Some(SubagentSummary {
        agent_id: agent_id.to_string(),
        agent_type: launch
            .map(|l| l.agent_type.clone())
            .unwrap_or_else(|| "general".to_string()),
        prompt,
        result: last_assistant_text,
        description,
        status,
        started_at,
        completed_at,
    })
}
