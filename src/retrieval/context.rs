//! Context suggester
//!
//! Assembles the prompt-injection payload served to the assistant's
//! prompt-submit hook: a compact block of knowledge and milestone lines
//! under the per-user item budgets, plus the source part ids so the hook
//! can attribute what it injected. Any internal failure degrades to an
//! empty context; the hook must never block a prompt.

use crate::config::Settings;
use crate::paths::encode_project_path;
use crate::retrieval::{MilestoneSearchResult, RetrievalEngine};
use crate::session::SessionCache;
use crate::vector::VectorStore;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const SUMMARY_LINE_LIMIT: usize = 120;
const MILESTONE_TITLE_LIMIT: usize = 80;
const SUBSTANTIAL_PROMPT_MIN: usize = 15;

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSuggestion {
    pub context: String,
    pub tokens: usize,
    pub sources: Vec<String>,
}

pub struct ContextSuggester {
    engine: Arc<RetrievalEngine>,
    vectors: Arc<VectorStore>,
    sessions: Arc<SessionCache>,
    settings_path: PathBuf,
    projects_dir: PathBuf,
}

impl ContextSuggester {
    pub fn new(
        engine: Arc<RetrievalEngine>,
        vectors: Arc<VectorStore>,
        sessions: Arc<SessionCache>,
        settings_path: PathBuf,
        projects_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            vectors,
            sessions,
            settings_path,
            projects_dir,
        }
    }

    /// Suggest context for a prompt. Never fails: internal errors yield an
    /// empty suggestion.
    pub async fn suggest(
        &self,
        prompt: &str,
        _session_id: Option<&str>,
        project: Option<&str>,
    ) -> ContextSuggestion {
        match self.try_suggest(prompt, project).await {
            Ok(suggestion) => suggestion,
            Err(e) => {
                debug!("Context suggestion failed, returning empty: {}", e);
                ContextSuggestion::default()
            }
        }
    }

    async fn try_suggest(
        &self,
        prompt: &str,
        project: Option<&str>,
    ) -> anyhow::Result<ContextSuggestion> {
        let settings = Settings::load(&self.settings_path);

        let knowledge_count = if settings.context_inject_knowledge {
            settings.context_inject_knowledge_count
        } else {
            0
        };
        let milestone_count = if settings.context_inject_milestones {
            settings.context_inject_milestone_count
        } else {
            0
        };
        if knowledge_count == 0 && milestone_count == 0 {
            return Ok(ContextSuggestion::default());
        }

        if self.vectors.content_row_count().await? == 0 {
            return Ok(ContextSuggestion::default());
        }

        let mut lines: Vec<String> = Vec::new();
        let mut sources: Vec<String> = Vec::new();

        if knowledge_count > 0 {
            let hits = self
                .engine
                .search_knowledge(prompt, Some(knowledge_count), None, project)
                .await?;
            for hit in hits {
                let part_id = if hit.part_id.is_empty() {
                    hit.knowledge_id.clone()
                } else {
                    hit.part_id.clone()
                };
                lines.push(format!(
                    "- [{}] ({}) {} → {}: {}",
                    part_id,
                    time_ago(&hit.timestamp),
                    hit.knowledge_title,
                    hit.part_title,
                    truncate(&hit.text, SUMMARY_LINE_LIMIT),
                ));
                sources.push(part_id);
            }
        }

        if milestone_count > 0 {
            let hits = self
                .engine
                .search_milestones(prompt, Some(milestone_count), project)
                .await?;
            for hit in &hits {
                let milestone_id = format!("{}:{}", hit.session_id, hit.milestone_index);
                let marker = if hit.phase == 1 { " [P1]" } else { "" };
                let title = self.milestone_title(hit).await;
                lines.push(format!(
                    "- [{}] {}{}: {}",
                    milestone_id,
                    time_ago(&hit.timestamp),
                    marker,
                    title,
                ));
            }
        }

        if lines.is_empty() {
            return Ok(ContextSuggestion::default());
        }

        let mut context = String::from(
            "Relevant context from previous sessions in this project:\n\n",
        );
        context.push_str(&lines.join("\n"));
        context.push_str(
            "\n\nUse the knowledge MCP tools (knowledge_get, knowledge_search) to pull the full text of any entry by its id.\n",
        );

        let tokens = context.len().div_ceil(4);
        Ok(ContextSuggestion {
            context,
            tokens,
            sources,
        })
    }

    /// Milestone display title. Phase-1 milestones carry no LLM title, so
    /// synthesize one from the session's first substantial user prompt,
    /// falling back to the row text.
    async fn milestone_title(&self, hit: &MilestoneSearchResult) -> String {
        if hit.phase != 1 && !hit.text.trim().is_empty() {
            return truncate(hit.text.trim(), MILESTONE_TITLE_LIMIT);
        }

        let transcript = self
            .projects_dir
            .join(encode_project_path(&hit.project_path))
            .join(format!("{}.jsonl", hit.session_id));
        if let Some(entry) = self.sessions.get(&transcript).await {
            if let Some(prompt) = entry
                .user_prompts
                .iter()
                .find(|p| p.trim().chars().count() > SUBSTANTIAL_PROMPT_MIN)
            {
                return truncate(prompt.trim(), MILESTONE_TITLE_LIMIT);
            }
            if !entry.task_list.is_empty() {
                return truncate(
                    &format!("{} tasks worked", entry.task_list.len()),
                    MILESTONE_TITLE_LIMIT,
                );
            }
        }

        if hit.text.trim().is_empty() {
            "session activity".to_string()
        } else {
            truncate(hit.text.trim(), MILESTONE_TITLE_LIMIT)
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{}…", cut.trim_end())
    }
}

/// Compact relative-time rendering for context lines.
fn time_ago(timestamp: &str) -> String {
    let Ok(instant) = DateTime::parse_from_rfc3339(timestamp) else {
        return "recently".to_string();
    };
    let elapsed = Utc::now().signed_duration_since(instant.with_timezone(&Utc));

    if elapsed.num_minutes() < 1 {
        "just now".to_string()
    } else if elapsed.num_hours() < 1 {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed.num_days() < 1 {
        format!("{}h ago", elapsed.num_hours())
    } else if elapsed.num_days() < 30 {
        format!("{}d ago", elapsed.num_days())
    } else {
        format!("{}mo ago", elapsed.num_days() / 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_adds_ellipsis() {
        assert_eq!(truncate("short", 10), "short");
        let long = "word ".repeat(40);
        let cut = truncate(&long, 20);
        assert!(cut.ends_with('…'));
        assert!(cut.chars().count() <= 21);
    }

    #[test]
    fn test_time_ago_buckets() {
        let now = Utc::now();
        let hour = (now - chrono::Duration::hours(3)).to_rfc3339();
        assert_eq!(time_ago(&hour), "3h ago");
        let days = (now - chrono::Duration::days(4)).to_rfc3339();
        assert_eq!(time_ago(&days), "4d ago");
        assert_eq!(time_ago("garbage"), "recently");
    }

    #[test]
    fn test_token_estimate_is_len_over_four() {
        let context = "x".repeat(101);
        assert_eq!(context.len().div_ceil(4), 26);
    }
}
