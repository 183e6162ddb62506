use crate::types::{CandidateEntry, ParsedFeed, PipelineError, Result};
use feed_rs::model::{Entry, MediaContent};
use feed_rs::parser;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use url::Url;

/// Where a lead image was found on an entry. Tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    MediaContent,
    MediaThumbnail,
    Enclosure,
    HtmlBody,
}

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "avif"];

/// Attributes feed-rs does not keep apart: it files RSS `<enclosure>`
/// elements as media content and drops `medium` from `<media:content>`.
/// Both are recovered from the raw document, keyed by URL.
#[derive(Debug, Default)]
struct RawMedia {
    enclosures: HashSet<String>,
    mediums: HashMap<String, String>,
}

pub struct FeedParser {
    seen_guids: HashSet<String>,
    seen_urls: HashSet<String>,
    img_patterns: Vec<Regex>,
    enclosure_tag: Regex,
    media_content_tag: Regex,
    url_attr: Regex,
    medium_attr: Regex,
    raw_media: RawMedia,
}

impl FeedParser {
    pub fn new() -> Result<Self> {
        let img_patterns = [
            r#"(?i)<img[^>]+src\s*=\s*["']([^"']+)["']"#,
            r#"(?i)<img[^>]+src\s*=\s*([^\s>"']+)"#,
            r#"(?i)src\s*=\s*["']([^"']+\.(?:jpg|jpeg|png|gif|webp)[^"']*)["']"#,
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(|e| PipelineError::Parse(e.to_string())))
        .collect::<Result<Vec<_>>>()?;
        let compile = |pattern: &str| Regex::new(pattern).map_err(|e| PipelineError::Parse(e.to_string()));

        Ok(Self {
            seen_guids: HashSet::new(),
            seen_urls: HashSet::new(),
            img_patterns,
            enclosure_tag: compile(r#"(?is)<enclosure\b[^>]*>"#)?,
            media_content_tag: compile(r#"(?is)<media:content\b[^>]*>"#)?,
            url_attr: compile(r#"(?i)\burl\s*=\s*["']([^"']+)["']"#)?,
            medium_attr: compile(r#"(?i)\bmedium\s*=\s*["']([^"']+)["']"#)?,
            raw_media: RawMedia::default(),
        })
    }

    pub fn parse_feed(&mut self, content: &str) -> Result<ParsedFeed> {
        debug!("Parsing feed content ({} bytes)", content.len());

        let feed = parser::parse(content.as_bytes())
            .map_err(|e| PipelineError::Parse(format!("Failed to parse feed: {}", e)))?;
        self.raw_media = self.scan_raw_media(content);

        let title = feed.title.map(|t| t.content);
        let description = feed.description.map(|d| d.content);

        let entries: Vec<CandidateEntry> = feed
            .entries
            .into_iter()
            .filter_map(|entry| self.parse_entry(entry))
            .collect();

        info!("Parsed feed with {} entries", entries.len());

        Ok(ParsedFeed { title, description, entries })
    }

    fn parse_entry(&mut self, entry: Entry) -> Option<CandidateEntry> {
        let link = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
            .or_else(|| entry.links.first())
            .map(|l| l.href.trim().to_string())
            .filter(|href| !href.is_empty());

        let Some(link) = link else {
            debug!("Dropping entry without link: {}", entry.id);
            return None;
        };

        let guid = if !entry.id.is_empty() { Some(entry.id.clone()) } else { None };

        if let Some(ref guid) = guid {
            if !self.seen_guids.insert(guid.clone()) {
                debug!("Skipping duplicate entry with GUID: {}", guid);
                return None;
            }
        }

        if !self.seen_urls.insert(link.clone()) {
            debug!("Skipping duplicate entry with URL: {}", link);
            return None;
        }

        let image_url = self.extract_image(&entry, &link).map(|(url, source)| {
            debug!("Image for {} found via {:?}", link, source);
            url
        });

        let title = entry
            .title
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        Some(CandidateEntry {
            guid,
            title,
            link,
            description: entry.summary.map(|s| s.content),
            content: entry.content.and_then(|c| c.body),
            published_at: entry.published.or(entry.updated),
            image_url,
        })
    }

    fn scan_raw_media(&self, content: &str) -> RawMedia {
        let url_of = |tag: &str| {
            self.url_attr
                .captures(tag)
                .and_then(|caps| caps.get(1))
                .and_then(|m| normalize_url(&html_escape::decode_html_entities(m.as_str())))
        };

        let enclosures = self
            .enclosure_tag
            .find_iter(content)
            .filter_map(|tag| url_of(tag.as_str()))
            .collect();
        let mediums = self
            .media_content_tag
            .find_iter(content)
            .filter_map(|tag| {
                let medium = self.medium_attr.captures(tag.as_str())?.get(1)?.as_str().trim().to_lowercase();
                Some((url_of(tag.as_str())?, medium))
            })
            .collect();

        RawMedia { enclosures, mediums }
    }

    fn is_enclosure(&self, content: &MediaContent) -> bool {
        content.url.as_ref().map_or(false, |u| self.raw_media.enclosures.contains(u.as_str()))
    }

    /// A declared image type wins. Untyped content counts when its
    /// `medium` is image, or when it has no medium and an image extension.
    fn is_image_content(&self, content: &MediaContent) -> bool {
        if let Some(content_type) = &content.content_type {
            return is_image_type(&content_type.to_string());
        }
        let Some(url) = &content.url else {
            return false;
        };
        match self.raw_media.mediums.get(url.as_str()) {
            Some(medium) => medium == "image",
            None => has_image_extension(url.path()),
        }
    }

    /// First image found, in [`ImageSource`] order.
    pub fn extract_image(&self, entry: &Entry, base: &str) -> Option<(String, ImageSource)> {
        let media_content = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|c| !self.is_enclosure(c) && self.is_image_content(c))
            .filter_map(|c| c.url.as_ref())
            .find_map(|u| absolutize(u.as_str(), base));
        if let Some(url) = media_content {
            return Some((url, ImageSource::MediaContent));
        }

        let thumbnail = entry
            .media
            .iter()
            .flat_map(|m| m.thumbnails.iter())
            .find_map(|t| absolutize(&t.image.uri, base));
        if let Some(url) = thumbnail {
            return Some((url, ImageSource::MediaThumbnail));
        }

        let rss_enclosure = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|c| self.is_enclosure(c) && self.is_image_content(c))
            .filter_map(|c| c.url.as_ref())
            .find_map(|u| absolutize(u.as_str(), base));
        let enclosure = rss_enclosure.or_else(|| {
            entry
                .links
                .iter()
                .filter(|l| l.rel.as_deref() == Some("enclosure"))
                .filter(|l| l.media_type.as_deref().map_or(false, is_image_type))
                .find_map(|l| absolutize(&l.href, base))
        });
        if let Some(url) = enclosure {
            return Some((url, ImageSource::Enclosure));
        }

        let bodies = [
            entry.content.as_ref().and_then(|c| c.body.as_deref()),
            entry.summary.as_ref().map(|s| s.content.as_str()),
        ];
        bodies
            .into_iter()
            .flatten()
            .find_map(|html| self.scan_html(html, base))
            .map(|url| (url, ImageSource::HtmlBody))
    }

    /// First `<img src>`-like URL in an HTML fragment.
    pub fn scan_html(&self, html: &str, base: &str) -> Option<String> {
        self.img_patterns.iter().find_map(|pattern| {
            pattern
                .captures_iter(html)
                .filter_map(|caps| caps.get(1))
                .find_map(|m| absolutize(&html_escape::decode_html_entities(m.as_str()), base))
        })
    }
}

/// Visible text of an HTML fragment, whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    let decoded = html_escape::decode_html_entities(&out);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_image_type(content_type: &str) -> bool {
    content_type.trim().to_ascii_lowercase().starts_with("image/")
}

fn has_image_extension(path: &str) -> bool {
    path.rsplit_once('.')
        .map_or(false, |(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// The form `Url` serializes to, so raw attributes compare equal to
/// what feed-rs parsed.
fn normalize_url(raw: &str) -> Option<String> {
    Url::parse(raw.trim()).ok().map(|u| u.to_string())
}

/// Resolve `raw` to an absolute http(s) URL, relative to `base`.
fn absolutize(raw: &str, base: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let resolved = if let Some(rest) = raw.strip_prefix("//") {
        Url::parse(&format!("https://{}", rest)).ok()
    } else {
        match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(base).ok().and_then(|b| b.join(raw).ok())
            }
            Err(_) => None,
        }
    }?;

    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}
