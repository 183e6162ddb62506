use crate::config::{QualityRules, RewriterConfig};
use crate::generator::{GenerationRequest, TextGenerator};
use crate::types::{PipelineError, Result, RewriteResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MAX_TITLE_CHARS: usize = 60;
pub const MAX_EXCERPT_CHARS: usize = 200;
pub const MAX_META_CHARS: usize = 160;

/// Used when the generator omits its confidence or reports garbage. Below
/// the default publish threshold, so such articles are held for review.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

pub const CATEGORIES: [&str; 6] = ["news", "culture", "sport", "economy", "society", "politics"];

/// What the rewriter needs from a scraped article.
#[derive(Debug, Clone)]
pub struct RewriteInput<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub slug: &'a str,
    pub category_hint: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRewrite {
    title: Option<String>,
    #[serde(alias = "meta_description")]
    meta_description: Option<String>,
    #[serde(alias = "body")]
    content: Option<String>,
    excerpt: Option<String>,
    keywords: Option<Value>,
    category: Option<String>,
    #[serde(alias = "confidenceScore", alias = "confidence_score")]
    confidence: Option<Value>,
}

pub struct ContentRewriter {
    generator: Arc<dyn TextGenerator>,
    config: RewriterConfig,
    temperature: f32,
    max_tokens: u32,
}

impl ContentRewriter {
    pub fn new(generator: Arc<dyn TextGenerator>, config: RewriterConfig) -> Self {
        Self { generator, config, temperature: 0.7, max_tokens: 2500 }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub async fn rewrite(&self, input: &RewriteInput<'_>) -> Result<RewriteResult> {
        let request = GenerationRequest {
            system: self.system_prompt(),
            prompt: self.user_prompt(input),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            json_output: true,
        };

        debug!("Rewriting {} with {}", input.slug, self.generator.name());
        let generated = self.generator.generate(&request).await?;
        let mut result = parse_rewrite(&generated.text, input)?;
        result.tokens_used = generated.tokens_used;

        info!(
            tokens = ?result.tokens_used,
            "Rewrote {} ({} chars, confidence {:.2})",
            input.slug,
            result.body.len(),
            result.confidence_score
        );
        Ok(result)
    }

    /// [`quality_issues`] under this rewriter's configured rules.
    pub fn quality_issues(&self, result: &RewriteResult) -> Vec<String> {
        quality_issues(result, &self.config.quality)
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a senior editor writing for {context}. You rewrite news items in {language} \
             into original, well-structured articles.\n\
             Rules:\n\
             - Never invent facts, names, places, figures or quotes that are not in the source. \
               If you cannot verify something, leave it out.\n\
             - When giving examples, prefer real, checkable ones over generic ones.\n\
             - Structure the body in Markdown with `##` and `###` headings. Never use a single `#` \
               heading: the title is displayed separately.\n\
             - The body must be 600 to 1000 words.\n\
             - Reply with a single JSON object and nothing else.",
            context = self.config.site_context,
            language = self.config.language,
        )
    }

    fn user_prompt(&self, input: &RewriteInput<'_>) -> String {
        let source: String = input.body.chars().take(self.config.max_source_chars).collect();
        format!(
            "Source title: {title}\n\n\
             Source text:\n{source}\n\n\
             Return JSON with these fields:\n\
             - \"title\": a new headline of at most {max_title} characters\n\
             - \"metaDescription\": a search snippet of at most {max_meta} characters\n\
             - \"content\": the article body in Markdown\n\
             - \"excerpt\": a summary of at most {max_excerpt} characters\n\
             - \"keywords\": 3 to 8 keywords\n\
             - \"category\": one of {categories} (suggested: {hint})\n\
             - \"confidence\": a number between 0 and 1 rating how faithful and publishable the result is",
            title = input.title,
            source = source,
            max_title = MAX_TITLE_CHARS,
            max_meta = MAX_META_CHARS,
            max_excerpt = MAX_EXCERPT_CHARS,
            categories = CATEGORIES.join(", "),
            hint = input.category_hint,
        )
    }
}

/// Turn raw generator output into a complete result, or fail as a whole.
pub fn parse_rewrite(raw: &str, input: &RewriteInput<'_>) -> Result<RewriteResult> {
    let json = strip_code_fence(raw);
    if json.is_empty() {
        return Err(PipelineError::InvalidOutput("empty generation".to_string()));
    }

    let parsed: RawRewrite = serde_json::from_str(json)
        .map_err(|e| PipelineError::InvalidOutput(format!("not a rewrite object: {}", e)))?;

    let body = normalize_markdown(parsed.content.as_deref().unwrap_or(""));
    if body.is_empty() {
        return Err(PipelineError::InvalidOutput("rewrite has no body".to_string()));
    }
    let plain = plain_text(&body);

    let title = non_empty(parsed.title)
        .map(|t| t.trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            warn!("Rewrite of {} has no title, keeping the source title", input.slug);
            input.title.trim().to_string()
        });

    let excerpt = non_empty(parsed.excerpt).unwrap_or_else(|| plain.clone());
    let meta_description = non_empty(parsed.meta_description).unwrap_or_else(|| plain.clone());

    Ok(RewriteResult {
        title: truncate_at_word(&title, MAX_TITLE_CHARS),
        body,
        excerpt: truncate_at_word(&excerpt, MAX_EXCERPT_CHARS),
        meta_description: truncate_at_word(&meta_description, MAX_META_CHARS),
        keywords: keywords_from(parsed.keywords.as_ref()),
        category: category_from(parsed.category.as_deref(), input.category_hint),
        confidence_score: confidence_from(parsed.confidence.as_ref()),
        tokens_used: None,
    })
}

/// Demote top-level headings, collapse blank-line runs, trim.
/// Setext headings (a paragraph underlined with `===` or `---`) become
/// `##` headings. Fenced code blocks are copied through untouched.
pub fn normalize_markdown(body: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut in_fence = false;
    let mut previous_blank = true;
    // index in `lines` where the paragraph being read started
    let mut paragraph_start: Option<usize> = None;

    for line in body.replace("\r\n", "\n").lines() {
        let trimmed = line.trim_start();

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            lines.push(line.to_string());
            previous_blank = false;
            paragraph_start = None;
            continue;
        }
        if in_fence {
            lines.push(line.to_string());
            continue;
        }

        if line.trim().is_empty() {
            if !previous_blank {
                lines.push(String::new());
            }
            previous_blank = true;
            paragraph_start = None;
            continue;
        }
        previous_blank = false;

        if let Some(start) = paragraph_start.filter(|_| is_setext_underline(line)) {
            let text = lines.split_off(start).iter().map(|l| l.trim()).collect::<Vec<_>>().join(" ");
            lines.push(format!("## {}", text));
            paragraph_start = None;
            continue;
        }

        if trimmed.starts_with("# ") || trimmed == "#" {
            lines.push(format!("#{}", trimmed.trim_end()));
            paragraph_start = None;
        } else {
            if paragraph_start.is_none() && starts_paragraph(trimmed) {
                paragraph_start = Some(lines.len());
            } else if !starts_paragraph(trimmed) {
                paragraph_start = None;
            }
            lines.push(line.trim_end().to_string());
        }
    }

    lines.join("\n").trim().to_string()
}

/// `===` or `---` on its own line, indented by at most three spaces.
fn is_setext_underline(line: &str) -> bool {
    let indent = line.len() - line.trim_start_matches(' ').len();
    let marker = line.trim();
    if indent > 3 || marker.is_empty() {
        return false;
    }
    let all = |c: char| marker.chars().all(|m| m == c);
    all('=') || (all('-') && marker.len() >= 2)
}

/// Plain text, as opposed to a heading, quote, list item, rule or table row.
fn starts_paragraph(trimmed: &str) -> bool {
    let list_marker = ["- ", "* ", "+ "].iter().any(|m| trimmed.starts_with(m));
    let ordered = trimmed
        .split_once(". ")
        .map_or(false, |(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    let rule = trimmed.len() >= 3 && trimmed.chars().all(|c| c == '-' || c == '*' || c == '_' || c == ' ');
    !(trimmed.starts_with('#') || trimmed.starts_with('>') || trimmed.starts_with('|') || list_marker || ordered || rule)
}

/// Reasons `result` falls short of `rules`. Empty when it may be published.
pub fn quality_issues(result: &RewriteResult, rules: &QualityRules) -> Vec<String> {
    let mut issues = Vec::new();

    let body_chars = result.body.chars().count();
    if body_chars < rules.min_body_chars {
        issues.push(format!("body has {} chars, needs {}", body_chars, rules.min_body_chars));
    }
    let excerpt_chars = result.excerpt.chars().count();
    if excerpt_chars < rules.min_excerpt_chars {
        issues.push(format!("excerpt has {} chars, needs {}", excerpt_chars, rules.min_excerpt_chars));
    }
    if result.keywords.len() < rules.min_keywords {
        issues.push(format!("{} keywords, needs {}", result.keywords.len(), rules.min_keywords));
    }
    if !rules.required_terms.is_empty() {
        let body = result.body.to_lowercase();
        if !rules.required_terms.iter().any(|t| body.contains(&t.to_lowercase())) {
            issues.push(format!("body mentions none of {}", rules.required_terms.join(", ")));
        }
    }
    issues
}

/// Clamp into [0, 1]; fall back when missing or not a finite number.
pub fn confidence_from(value: Option<&Value>) -> f64 {
    let score = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse::<f64>().ok().map(|v| {
            if s.trim().ends_with('%') {
                v / 100.0
            } else {
                v
            }
        }),
        _ => None,
    };

    match score {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => FALLBACK_CONFIDENCE,
    }
}

fn keywords_from(value: Option<&Value>) -> BTreeSet<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

fn category_from(category: Option<&str>, hint: &str) -> String {
    category
        .map(|c| c.trim().to_lowercase())
        .filter(|c| CATEGORIES.contains(&c.as_str()))
        .unwrap_or_else(|| hint.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.split_once('\n').map_or("", |(_, body)| body);
            rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
        }
        None => trimmed,
    }
}

/// Markdown body flattened to one line of prose.
fn plain_text(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut chars = markdown.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            // `](target)` of a link: drop the target
            ']' if chars.peek() == Some(&'(') => {
                for skipped in chars.by_ref() {
                    if skipped == ')' {
                        break;
                    }
                }
            }
            '#' | '*' | '_' | '`' | '[' | ']' | '>' => {}
            _ => out.push(c),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// At most `max_chars` characters, cut at a word boundary when one is
/// reasonably close, with an ellipsis when shortened.
pub fn truncate_at_word(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let budget = max_chars.saturating_sub(1);
    let head: String = text.chars().take(budget).collect();
    let cut = match head.rfind(char::is_whitespace) {
        Some(pos) if pos >= head.len() / 2 => &head[..pos],
        _ => head.as_str(),
    };
    let cut = cut.trim_end_matches(|c: char| c.is_whitespace() || ",;:-".contains(c));
    format!("{}…", cut)
}
