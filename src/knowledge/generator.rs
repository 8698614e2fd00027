//! Knowledge generator
//!
//! Turns completed explore sub-agent transcripts into knowledge documents by
//! carving the agent's Markdown result into titled sections. Extraction is
//! fence-aware (headings inside code blocks are invisible), picks the
//! heading level that best segments the text, folds fragments into their
//! neighbours, and classifies the document from a keyword table.

use crate::error::{AssistError, Result};
use crate::knowledge::models::{Knowledge, KnowledgeType};
use crate::knowledge::store::{KnowledgePatch, KnowledgeStore, NewKnowledge, NewPart};
use crate::session::{SessionCache, SubagentSummary};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Results shorter than this are rejected outright.
const MIN_RESULT_LEN: usize = 200;
/// Pre-heading text shorter than this is not worth an Overview section.
const MIN_OVERVIEW_LEN: usize = 100;
/// Sections shorter than this fold into their successor.
const MIN_SECTION_LEN: usize = 50;
const MAX_TITLE_LEN: usize = 120;

/// First-line patterns that mark a result as junk. Matching is a
/// case-insensitive substring test; the list grows via settings.
const DEFAULT_JUNK_PATTERNS: &[&str] = &[
    "agent launched",
    "task completed",
    "no results",
    "no relevant results",
    "tool use was rejected",
    "unable to complete",
    "request interrupted",
];

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorStatus {
    pub running: bool,
    pub project: Option<String>,
    pub generated: usize,
    pub errors: Vec<String>,
    pub stopped: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAllResult {
    pub generated: usize,
    pub errors: Vec<String>,
    pub stopped: bool,
}

pub struct KnowledgeGenerator {
    store: Arc<KnowledgeStore>,
    sessions: Arc<SessionCache>,
    junk_patterns: Vec<String>,
    stop_requested: AtomicBool,
    status: Mutex<GeneratorStatus>,
}

impl KnowledgeGenerator {
    pub fn new(
        store: Arc<KnowledgeStore>,
        sessions: Arc<SessionCache>,
        extra_junk_patterns: Vec<String>,
    ) -> Self {
        let mut junk_patterns: Vec<String> = DEFAULT_JUNK_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        junk_patterns.extend(extra_junk_patterns);
        Self {
            store,
            sessions,
            junk_patterns,
            stop_requested: AtomicBool::new(false),
            status: Mutex::new(GeneratorStatus::default()),
        }
    }

    pub fn status(&self) -> GeneratorStatus {
        self.status.lock().clone()
    }

    /// Ask a running batch to stop after the current document.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Generate one document from a completed explore sub-agent. Dedup is
    /// enforced by the store and surfaces the existing document's id.
    pub async fn generate(
        &self,
        agent: &SubagentSummary,
        session_id: &str,
        project: &str,
    ) -> Result<Arc<Knowledge>> {
        let result = agent
            .result
            .as_deref()
            .ok_or_else(|| AssistError::InvalidRequest("sub-agent has no result".into()))?;
        self.quality_gate(result)?;

        let title = derive_title(&agent.description, &agent.prompt);
        let sections = extract_sections(result);
        let knowledge_type = detect_type(&title, &sections);

        let doc = self
            .store
            .create(NewKnowledge {
                title,
                knowledge_type,
                project: project.to_string(),
                parts: sections
                    .into_iter()
                    .map(|s| NewPart {
                        title: s.title,
                        summary: s.summary,
                        content: s.content,
                    })
                    .collect(),
                source_session_id: Some(session_id.to_string()),
                source_agent_id: Some(agent.agent_id.clone()),
                source_timestamp: agent.completed_at.clone(),
            })
            .await?;

        info!("Generated knowledge {} from agent {}", doc.id, agent.agent_id);
        Ok(doc)
    }

    /// Re-run extraction against the current transcript, preserving the
    /// document's id and renumbering its parts.
    pub async fn regenerate(&self, id: &str, agent: &SubagentSummary) -> Result<Arc<Knowledge>> {
        let result = agent
            .result
            .as_deref()
            .ok_or_else(|| AssistError::InvalidRequest("sub-agent has no result".into()))?;
        self.quality_gate(result)?;

        let title = derive_title(&agent.description, &agent.prompt);
        let sections = extract_sections(result);
        let knowledge_type = detect_type(&title, &sections);

        self.store
            .update(
                id,
                None,
                KnowledgePatch {
                    title: Some(title),
                    knowledge_type: Some(knowledge_type),
                    parts: Some(
                        sections
                            .into_iter()
                            .map(|s| NewPart {
                                title: s.title,
                                summary: s.summary,
                                content: s.content,
                            })
                            .collect(),
                    ),
                    ..Default::default()
                },
            )
            .await
    }

    /// Generate documents for every eligible explore sub-agent in a project
    /// directory, strictly sequentially, honoring the stop flag between
    /// documents. Candidates that already have a document are skipped.
    pub async fn generate_all(&self, project_dir: &Path, project: &str) -> GenerateAllResult {
        self.stop_requested.store(false, Ordering::SeqCst);
        {
            let mut status = self.status.lock();
            *status = GeneratorStatus {
                running: true,
                project: Some(project.to_string()),
                ..Default::default()
            };
        }

        let mut generated = 0usize;
        let mut errors = Vec::new();
        let mut stopped = false;

        'outer: for (session_id, agent) in self.explore_candidates(project_dir).await {
            if self.stop_requested.load(Ordering::SeqCst) {
                stopped = true;
                break 'outer;
            }
            if self.store.find_by_agent_id(&agent.agent_id).await.is_some() {
                debug!("Skipping already-generated agent {}", agent.agent_id);
                continue;
            }
            match self.generate(&agent, &session_id, project).await {
                Ok(_) => {
                    generated += 1;
                    self.status.lock().generated = generated;
                }
                Err(AssistError::Duplicate { existing_id }) => {
                    debug!("Agent {} already distilled as {}", agent.agent_id, existing_id);
                }
                Err(AssistError::InvalidRequest(reason)) => {
                    debug!("Skipping agent {}: {}", agent.agent_id, reason);
                }
                Err(e) => {
                    warn!("Generation failed for agent {}: {}", agent.agent_id, e);
                    let message = format!("{}: {}", agent.agent_id, e);
                    errors.push(message.clone());
                    self.status.lock().errors.push(message);
                }
            }
        }

        {
            let mut status = self.status.lock();
            status.running = false;
            status.stopped = stopped;
        }
        GenerateAllResult {
            generated,
            errors,
            stopped,
        }
    }

    async fn explore_candidates(&self, project_dir: &Path) -> Vec<(String, SubagentSummary)> {
        let mut candidates = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(project_dir).await else {
            return candidates;
        };
        while let Ok(Some(file)) = dir.next_entry().await {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(entry) = self.sessions.get(&path).await else {
                continue;
            };
            for agent in &entry.subagents {
                if agent.agent_type.eq_ignore_ascii_case("explore")
                    && agent.status == "completed"
                    && agent.result.is_some()
                {
                    candidates.push((entry.session_id.clone(), agent.clone()));
                }
            }
        }
        candidates
    }

    fn quality_gate(&self, result: &str) -> Result<()> {
        if result.len() < MIN_RESULT_LEN {
            return Err(AssistError::InvalidRequest(format!(
                "result too short ({} < {} chars)",
                result.len(),
                MIN_RESULT_LEN
            )));
        }
        let first_line = result
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_lowercase();
        for pattern in &self.junk_patterns {
            if first_line.contains(&pattern.to_lowercase()) {
                return Err(AssistError::InvalidRequest(format!(
                    "result matches junk pattern {:?}",
                    pattern
                )));
            }
        }
        Ok(())
    }
}

/// Prefer the launch description when it reads like a title; otherwise
/// distill the prompt's first line.
pub fn derive_title(description: &str, prompt: &str) -> String {
    let description = description.trim();
    if (5..=MAX_TITLE_LEN).contains(&description.chars().count()) {
        return description.to_string();
    }

    let mut line = prompt.lines().next().unwrap_or_default().trim().to_string();

    const POLITENESS: &[&str] = &[
        "please ",
        "can you ",
        "could you ",
        "would you ",
        "i need to ",
        "i want to ",
        "i need you to ",
        "help me ",
    ];
    const INTENT: &[&str] = &[
        "research ",
        "investigate ",
        "explore ",
        "find out ",
        "figure out ",
        "analyze ",
        "look into ",
        "examine ",
        "study ",
        "understand ",
        "determine ",
    ];

    let mut stripped = true;
    while stripped {
        stripped = false;
        let lower = line.to_lowercase();
        for prefix in POLITENESS.iter().chain(INTENT.iter()) {
            if lower.starts_with(prefix) {
                line = line[prefix.len()..].trim_start().to_string();
                stripped = true;
                break;
            }
        }
    }

    let mut chars = line.chars();
    let mut title: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => return "Untitled exploration".to_string(),
    };
    while title.ends_with('.') {
        title.pop();
    }
    if title.chars().count() > MAX_TITLE_LEN {
        title = title.chars().take(MAX_TITLE_LEN).collect();
    }
    title
}

/// One extracted section, post summary/content split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub title: String,
    pub summary: String,
    pub content: String,
}

/// Carve a Markdown result into sections per the level-choice rule.
pub fn extract_sections(result: &str) -> Vec<Section> {
    let lines: Vec<&str> = result.lines().collect();

    // Fence map: a line is invisible to heading detection when inside a
    // fenced code block. Fence delimiters themselves toggle.
    let mut in_fence = vec![false; lines.len()];
    let mut open = false;
    for (i, line) in lines.iter().enumerate() {
        if line.trim_start().starts_with("```") {
            open = !open;
            in_fence[i] = true;
        } else {
            in_fence[i] = open;
        }
    }

    let h2: Vec<usize> = heading_lines(&lines, &in_fence, "## ");
    let h3: Vec<usize> = heading_lines(&lines, &in_fence, "### ");

    let chosen: &[usize] = if h3.len() >= 3 && h3.len() >= 2 * h2.len() {
        &h3
    } else if h2.len() >= 2 {
        &h2
    } else if h3.len() >= 2 {
        &h3
    } else if !h2.is_empty() || !h3.is_empty() {
        if h2.len() >= h3.len() {
            &h2
        } else {
            &h3
        }
    } else {
        &[]
    };

    if chosen.is_empty() {
        return vec![make_section("Overview".to_string(), result)];
    }

    let mut raw: Vec<(String, String)> = Vec::new();

    let preamble: String = lines[..chosen[0]].join("\n");
    if preamble.trim().len() > MIN_OVERVIEW_LEN {
        raw.push(("Overview".to_string(), preamble.trim().to_string()));
    }

    for (idx, &start) in chosen.iter().enumerate() {
        let end = chosen.get(idx + 1).copied().unwrap_or(lines.len());
        let title = clean_heading(lines[start].trim_start_matches('#').trim());
        let body = lines[start + 1..end].join("\n").trim().to_string();
        raw.push((title, body));
    }

    // Fold fragments forward: a short section becomes a bold lead-in of its
    // successor.
    let mut folded: Vec<(String, String)> = Vec::new();
    let mut carry: Option<(String, String)> = None;
    for (title, body) in raw {
        let (title, body) = match carry.take() {
            Some((prev_title, prev_body)) => {
                let mut merged = format!("**{}**", prev_title);
                if !prev_body.is_empty() {
                    merged.push('\n');
                    merged.push_str(&prev_body);
                }
                merged.push_str("\n\n");
                merged.push_str(&body);
                (title, merged)
            }
            None => (title, body),
        };
        if body.trim().len() < MIN_SECTION_LEN {
            carry = Some((title, body.trim().to_string()));
        } else {
            folded.push((title, body));
        }
    }
    if let Some((title, body)) = carry {
        folded.push((title, body));
    }

    folded
        .into_iter()
        .map(|(title, body)| make_section(title, &body))
        .collect()
}

fn heading_lines(lines: &[&str], in_fence: &[bool], prefix: &str) -> Vec<usize> {
    lines
        .iter()
        .enumerate()
        .filter(|(i, line)| !in_fence[*i] && line.starts_with(prefix))
        .map(|(i, _)| i)
        .collect()
}

/// Split a section body into summary (first non-empty paragraph) and content.
fn make_section(title: String, body: &str) -> Section {
    let mut summary = Vec::new();
    let mut content = Vec::new();
    let mut seen_text = false;
    let mut in_content = false;

    for line in body.lines() {
        if in_content {
            content.push(line);
        } else if line.trim().is_empty() {
            if seen_text {
                in_content = true;
            }
        } else {
            summary.push(line);
            seen_text = true;
        }
    }

    Section {
        title,
        summary: summary.join("\n").trim().to_string(),
        content: content.join("\n").trim().to_string(),
    }
}

/// Strip bold markers, backticks, and Markdown link syntax from a heading.
fn clean_heading(heading: &str) -> String {
    let no_bold = heading.replace("**", "").replace('`', "");
    let link_re = regex::Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap();
    link_re.replace_all(&no_bold, "$1").trim().to_string()
}

/// Keyword table, in tie-break order. The type whose keywords occur most
/// often across the title, part titles, and summaries wins.
const TYPE_KEYWORDS: &[(KnowledgeType, &[&str])] = &[
    (
        KnowledgeType::Algorithm,
        &[
            "algorithm", "complexity", "heuristic", "scoring", "ranking", "sort", "search",
            "traversal",
        ],
    ),
    (
        KnowledgeType::Contract,
        &[
            "api", "contract", "endpoint", "interface", "request", "response", "guarantee",
            "protocol",
        ],
    ),
    (
        KnowledgeType::Schema,
        &[
            "schema", "table", "column", "field", "record", "database", "json", "format",
        ],
    ),
    (
        KnowledgeType::Wiring,
        &[
            "module", "component", "wiring", "dependency", "imports", "structure", "layout",
            "initializes",
        ],
    ),
    (
        KnowledgeType::Invariant,
        &[
            "invariant", "must", "always", "never", "constraint", "assert", "enforce",
        ],
    ),
    (
        KnowledgeType::Flow,
        &[
            "flow", "sequence", "pipeline", "lifecycle", "step", "stage", "then",
        ],
    ),
];

/// Score the document text against the keyword table. Highest score wins;
/// ties resolve by table order; all-zero falls back to wiring.
pub fn detect_type(title: &str, sections: &[Section]) -> KnowledgeType {
    let mut haystack = title.to_lowercase();
    for section in sections {
        haystack.push(' ');
        haystack.push_str(&section.title.to_lowercase());
        haystack.push(' ');
        haystack.push_str(&section.summary.to_lowercase());
    }

    let mut best = KnowledgeType::Wiring;
    let mut best_score = 0usize;
    for (kind, keywords) in TYPE_KEYWORDS {
        let score: usize = keywords
            .iter()
            .map(|kw| haystack.matches(kw).count())
            .sum();
        if score > best_score {
            best_score = score;
            best = *kind;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::RateTable;
    use tempfile::tempdir;

    fn explore_agent(result: &str) -> SubagentSummary {
        SubagentSummary {
            agent_id: "agent-1".to_string(),
            agent_type: "Explore".to_string(),
            prompt: "Research how the scheduler handles preemption".to_string(),
            result: Some(result.to_string()),
            description: String::new(),
            status: "completed".to_string(),
            started_at: Some("2026-01-01T10:00:00Z".to_string()),
            completed_at: Some("2026-01-01T10:05:00Z".to_string()),
        }
    }

    fn long_body(label: &str) -> String {
        format!(
            "{} paragraph with enough words to clear the minimum section length comfortably.",
            label
        )
    }

    async fn generator() -> (KnowledgeGenerator, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            KnowledgeStore::open(dir.path().join("knowledge"))
                .await
                .unwrap(),
        );
        let sessions = Arc::new(SessionCache::new(RateTable::default()));
        (KnowledgeGenerator::new(store, sessions, vec![]), dir)
    }

    #[test]
    fn test_derive_title_prefers_description() {
        assert_eq!(
            derive_title("Scheduler preemption notes", "irrelevant"),
            "Scheduler preemption notes"
        );
        // Too short a description falls through to the prompt.
        assert_eq!(
            derive_title("ok", "please research how the scheduler handles preemption."),
            "How the scheduler handles preemption"
        );
    }

    #[test]
    fn test_derive_title_strips_stacked_prefixes() {
        assert_eq!(
            derive_title("", "Can you investigate the cache eviction policy"),
            "The cache eviction policy"
        );
    }

    #[test]
    fn test_derive_title_truncates() {
        let long = format!("research {}", "x".repeat(300));
        assert_eq!(derive_title("", &long).chars().count(), MAX_TITLE_LEN);
    }

    #[test]
    fn test_extract_sections_basic_h2() {
        let md = format!(
            "## Overview\n{}\n\n## Policy\n{}\n",
            long_body("First"),
            long_body("Second")
        );
        let sections = extract_sections(&md);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Overview");
        assert_eq!(sections[1].title, "Policy");
    }

    #[test]
    fn test_level_choice_prefers_h3_when_dominant() {
        let md = format!(
            "## Only\n\n### A\n{}\n\n### B\n{}\n\n### C\n{}\n",
            long_body("A"),
            long_body("B"),
            long_body("C")
        );
        // 3 h3s ≥ 3 and ≥ 2 × 1 h2 → h3 wins.
        let sections = extract_sections(&md);
        let titles: Vec<&str> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_level_choice_sticks_with_h2_otherwise() {
        let md = format!(
            "## One\n{}\n\n### Sub\n{}\n\n## Two\n{}\n",
            long_body("One"),
            long_body("Sub"),
            long_body("Two")
        );
        let sections = extract_sections(&md);
        let titles: Vec<&str> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["One", "Two"]);
    }

    #[test]
    fn test_headings_inside_fences_are_ignored() {
        let md = format!(
            "## Real\n{}\n\n```\n## Fake\n### Also fake\n```\n\n## AlsoReal\n{}\n",
            long_body("Real"),
            long_body("Also")
        );
        let sections = extract_sections(&md);
        let titles: Vec<&str> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Real", "AlsoReal"]);
    }

    #[test]
    fn test_preamble_becomes_overview() {
        let md = format!(
            "{}\n\n## First\n{}\n\n## Second\n{}\n",
            long_body("Leading context that exceeds the overview threshold easily"),
            long_body("One"),
            long_body("Two")
        );
        let sections = extract_sections(&md);
        assert_eq!(sections[0].title, "Overview");
        assert_eq!(sections.len(), 3);
    }

    #[test]
    fn test_short_section_folds_forward() {
        let md = format!(
            "## Tiny\nshort.\n\n## Big\n{}\n",
            long_body("The successor")
        );
        let sections = extract_sections(&md);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Big");
        assert!(sections[0].summary.contains("**Tiny**"));
    }

    #[test]
    fn test_no_headings_yields_single_overview() {
        let sections = extract_sections("Just a flat explanation with no headings at all.");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Overview");
    }

    #[test]
    fn test_clean_heading() {
        assert_eq!(clean_heading("**Bold** `code`"), "Bold code");
        assert_eq!(clean_heading("[Link](https://x.test) rest"), "Link rest");
    }

    #[test]
    fn test_detect_type_scores_keywords() {
        let sections = vec![Section {
            title: "Endpoint contract".to_string(),
            summary: "The api request and response guarantee.".to_string(),
            content: String::new(),
        }];
        assert_eq!(detect_type("Service interface", &sections), KnowledgeType::Contract);
        assert_eq!(detect_type("Nothing matches here", &[]), KnowledgeType::Wiring);
    }

    #[tokio::test]
    async fn test_generate_round_trip() {
        let (generator, _dir) = generator().await;
        let result = format!(
            "## Overview\n{}\n\n## Policy\n{}\n",
            long_body("Preemption"),
            long_body("Deadline")
        );
        let agent = explore_agent(&result);

        let doc = generator.generate(&agent, "sess-1", "/work/repo").await.unwrap();
        assert_eq!(doc.title, "How the scheduler handles preemption");
        assert_eq!(doc.parts.len(), 2);
        assert_eq!(doc.parts[0].part_id, format!("{}.1", doc.id));
        assert_eq!(doc.source_agent_id.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn test_generate_twice_is_duplicate() {
        let (generator, _dir) = generator().await;
        let result = format!("## A\n{}\n\n## B\n{}\n", long_body("A"), long_body("B"));
        let agent = explore_agent(&result);

        let first = generator.generate(&agent, "sess-1", "/p").await.unwrap();
        match generator.generate(&agent, "sess-1", "/p").await {
            Err(AssistError::Duplicate { existing_id }) => assert_eq!(existing_id, first.id),
            other => panic!("expected duplicate, got {:?}", other.map(|d| d.id.clone())),
        }
    }

    #[tokio::test]
    async fn test_quality_gate_rejects_short_and_junk() {
        let (generator, _dir) = generator().await;

        let short = explore_agent("too short");
        assert!(matches!(
            generator.generate(&short, "s", "/p").await,
            Err(AssistError::InvalidRequest(_))
        ));

        let junk_body = format!("Tool use was rejected by the user.\n\n{}", "x".repeat(300));
        let junk = explore_agent(&junk_body);
        assert!(matches!(
            generator.generate(&junk, "s", "/p").await,
            Err(AssistError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_boundary_result_length() {
        let (generator, _dir) = generator().await;
        // Exactly one char below the floor fails.
        let below = explore_agent(&"y".repeat(MIN_RESULT_LEN - 1));
        assert!(generator.generate(&below, "s", "/p").await.is_err());

        let at = explore_agent(&"y".repeat(MIN_RESULT_LEN));
        assert!(generator.generate(&at, "s2", "/p2").await.is_ok());
    }

    #[tokio::test]
    async fn test_regenerate_preserves_id() {
        let (generator, _dir) = generator().await;
        let result = format!("## A\n{}\n\n## B\n{}\n", long_body("A"), long_body("B"));
        let agent = explore_agent(&result);
        let doc = generator.generate(&agent, "sess-1", "/p").await.unwrap();

        let mut updated_agent = agent.clone();
        updated_agent.result = Some(format!(
            "## A\n{}\n\n## B\n{}\n\n## C\n{}\n",
            long_body("A"),
            long_body("B"),
            long_body("C")
        ));
        let regenerated = generator.regenerate(&doc.id, &updated_agent).await.unwrap();
        assert_eq!(regenerated.id, doc.id);
        assert_eq!(regenerated.parts.len(), 3);
        assert_eq!(regenerated.parts[2].part_id, format!("{}.3", doc.id));
    }

    #[tokio::test]
    async fn test_generate_all_stop_flag() {
        let (generator, _dir) = generator().await;
        generator.request_stop();
        let project = tempdir().unwrap();
        let result = generator.generate_all(project.path(), "/p").await;
        // Flag is reset at batch start, so an empty project just completes.
        assert_eq!(result.generated, 0);
        assert!(!result.stopped);
    }
}
