//! Prompt templates for the three inference kinds.
//!
//! Templates live in markdown files (`summarize.md`, `classify.md`,
//! `score.md`) so they can be edited without a rebuild. The template is the
//! last fenced code block of the file; failing that, the text after a
//! `## Template` heading; failing that, the whole file. Missing files fall
//! back to the built-in defaults below.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::pipeline::types::InferenceKind;

const SUMMARIZE_SYSTEM: &str =
    "You are a helpful assistant that summarizes newsletters professionally.";

const SUMMARIZE_TEMPLATE: &str = "\
Summarize this newsletter in exactly 3 bullet points. Focus on the most important and actionable information.

Subject: {subject}

Newsletter content:
{content}

Instructions:
- Provide exactly 3 bullet points
- Each bullet should be concise but informative
- Focus on key insights, tools, or news
- Avoid marketing language and fluff

Format your response as:
• [First bullet point]
• [Second bullet point]
• [Third bullet point]

Category: [Choose one: News, Tool, or Opinion]
Links: [The most relevant links mentioned in the content, separated by commas. Leave empty if none.]";

const CLASSIFY_SYSTEM: &str =
    "You classify newsletters. Respond with only one word: News, Tool, or Opinion.";

const CLASSIFY_TEMPLATE: &str = "\
Classify this newsletter content into one of these categories:

- News: Industry updates, company announcements, market changes, new product launches
- Tool: Software, apps, resources, tutorials, how-to guides, productivity tips
- Opinion: Commentary, analysis, predictions, thought leadership, personal insights

Subject: {subject}

Content:
{content}

Respond with only the category name: News, Tool, or Opinion";

const SCORE_SYSTEM: &str = "You are an expert at rating newsletter importance for tech professionals. Respond with only a number from 1-5.";

const SCORE_TEMPLATE: &str = "\
Rate the importance of this newsletter for a tech audience on a scale from 1 to 5.

5 = major industry news or a must-read resource
4 = highly relevant and actionable
3 = useful background
2 = marginal interest
1 = promotional or irrelevant

Subject: {subject}

Summary:
{summary}

Content:
{content}

Respond with only a number from 1 to 5.";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)\n```").expect("valid regex"));

static TEMPLATE_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)## Template\s*\n(.*)").expect("valid regex"));

/// One kind's prompt plus its request parameters.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub kind: InferenceKind,
    pub system: String,
    pub template: String,
    /// Content is cut to this many chars before rendering.
    pub max_content_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl PromptTemplate {
    /// Built-in template for a kind.
    pub fn builtin(kind: InferenceKind) -> Self {
        match kind {
            InferenceKind::Summarize => Self {
                kind,
                system: SUMMARIZE_SYSTEM.into(),
                template: SUMMARIZE_TEMPLATE.into(),
                max_content_chars: 3000,
                max_tokens: 500,
                temperature: 0.3,
            },
            InferenceKind::Classify => Self {
                kind,
                system: CLASSIFY_SYSTEM.into(),
                template: CLASSIFY_TEMPLATE.into(),
                max_content_chars: 2000,
                max_tokens: 10,
                temperature: 0.1,
            },
            InferenceKind::Score => Self {
                kind,
                system: SCORE_SYSTEM.into(),
                template: SCORE_TEMPLATE.into(),
                max_content_chars: 2000,
                max_tokens: 10,
                temperature: 0.1,
            },
        }
    }

    /// File name the template is loaded from.
    pub fn file_name(kind: InferenceKind) -> String {
        format!("{}.md", kind.as_str())
    }

    /// Fill `{name}` placeholders. `content` is truncated first; unknown
    /// placeholders are left untouched.
    pub fn render(&self, vars: &PromptVars<'_>) -> String {
        let content = truncate_chars(vars.content, self.max_content_chars);
        let mut values: HashMap<&str, &str> = HashMap::new();
        values.insert("subject", vars.subject);
        values.insert("sender", vars.sender);
        values.insert("content", content);
        values.insert("summary", vars.summary.unwrap_or(""));

        PLACEHOLDER_RE
            .replace_all(&self.template, |caps: &Captures<'_>| {
                values
                    .get(&caps[1])
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

/// Values available to templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptVars<'a> {
    pub subject: &'a str,
    pub sender: &'a str,
    pub content: &'a str,
    /// Summary bullets, once the summarize call has run.
    pub summary: Option<&'a str>,
}

/// The three templates used by the gateway.
#[derive(Debug, Clone)]
pub struct PromptSet {
    summarize: PromptTemplate,
    classify: PromptTemplate,
    score: PromptTemplate,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PromptSet {
    pub fn builtin() -> Self {
        Self {
            summarize: PromptTemplate::builtin(InferenceKind::Summarize),
            classify: PromptTemplate::builtin(InferenceKind::Classify),
            score: PromptTemplate::builtin(InferenceKind::Score),
        }
    }

    /// Load templates from `dir`, using built-ins for missing files.
    pub fn load(dir: &Path) -> Result<Self, PipelineError> {
        let mut set = Self::builtin();
        for kind in InferenceKind::ALL {
            let path = dir.join(PromptTemplate::file_name(kind));
            match std::fs::read_to_string(&path) {
                Ok(markdown) => {
                    let template = extract_template(&markdown);
                    if template.is_empty() {
                        return Err(PipelineError::Prompt(format!(
                            "{} contains no template",
                            path.display()
                        )));
                    }
                    info!(kind = %kind, path = %path.display(), "Loaded prompt template");
                    set.get_mut(kind).template = template;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(kind = %kind, "No prompt file, using built-in template");
                }
                Err(e) => {
                    return Err(PipelineError::Prompt(format!(
                        "failed to read {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(set)
    }

    pub fn get(&self, kind: InferenceKind) -> &PromptTemplate {
        match kind {
            InferenceKind::Summarize => &self.summarize,
            InferenceKind::Classify => &self.classify,
            InferenceKind::Score => &self.score,
        }
    }

    pub fn get_mut(&mut self, kind: InferenceKind) -> &mut PromptTemplate {
        match kind {
            InferenceKind::Summarize => &mut self.summarize,
            InferenceKind::Classify => &mut self.classify,
            InferenceKind::Score => &mut self.score,
        }
    }
}

/// Pull the template out of a prompt markdown file.
pub fn extract_template(markdown: &str) -> String {
    if let Some(last) = FENCED_RE.captures_iter(markdown).last() {
        return last[1].trim().to_string();
    }
    if let Some(caps) = TEMPLATE_HEADING_RE.captures(markdown) {
        return caps[1].trim().to_string();
    }
    markdown.trim().to_string()
}

/// Cut `s` to at most `max` chars on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
