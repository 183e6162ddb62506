//! Title to URL-safe identifier.

use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const MAX_SLUG_LEN: usize = 100;
pub const MAX_DATED_SLUG_LEN: usize = 50;

const FALLBACK_SLUG: &str = "article";

/// Slugify `title`, appending `disambiguator` when given.
///
/// The base is capped at 100 characters, or 50 when a disambiguator is
/// present. Never returns an empty string.
pub fn slug(title: &str, disambiguator: Option<&str>) -> String {
    match disambiguator.map(|d| normalize(d, MAX_SLUG_LEN)).filter(|d| !d.is_empty()) {
        Some(suffix) => {
            let base = normalize(title, MAX_DATED_SLUG_LEN);
            if base.is_empty() {
                suffix
            } else {
                format!("{}-{}", base, suffix)
            }
        }
        None => {
            let base = normalize(title, MAX_SLUG_LEN);
            if base.is_empty() {
                FALLBACK_SLUG.to_string()
            } else {
                base
            }
        }
    }
}

/// Slug for an article, falling back to the source URL when the title has
/// nothing slug-worthy in it.
pub fn slug_for_source(title: &str, source_url: &str, disambiguator: Option<&str>) -> String {
    let from_title = normalize(title, MAX_SLUG_LEN);
    let base = if !from_title.is_empty() {
        title.to_string()
    } else {
        let segment = last_path_segment(source_url);
        if !normalize(&segment, MAX_SLUG_LEN).is_empty() {
            segment
        } else {
            short_hash(source_url)
        }
    };
    slug(&base, disambiguator)
}

/// First eight hex characters of the SHA-256 of `input`.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

fn normalize(input: &str, max_len: usize) -> String {
    let folded: String = input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    let mut out = String::with_capacity(folded.len());
    let mut pending_hyphen = false;
    for c in folded.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    // ASCII only from here on, so byte truncation is safe.
    out.truncate(max_len);
    out.trim_end_matches('-').to_string()
}

fn last_path_segment(source_url: &str) -> String {
    url::Url::parse(source_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .map(|segment| {
            // drop a file extension such as `.html`
            match segment.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                _ => segment,
            }
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_diacritics_and_punctuation() {
        assert_eq!(slug("Fête des Lumières à Lyon !", None), "fete-des-lumieres-a-lyon");
        assert_eq!(slug("  --Hello,   World--  ", None), "hello-world");
        assert_eq!(slug("Ça coûte 3€ l'œuf", None), "ca-coute-3-l-uf");
    }

    #[test]
    fn is_deterministic() {
        let t = "Le Grand Débat: quelle suite ?";
        assert_eq!(slug(t, None), slug(t, None));
        assert_eq!(slug(t, Some("2024-05-01")), slug(t, Some("2024-05-01")));
    }

    #[test]
    fn never_empty() {
        for title in ["", "!!!", "東京タワー", "—", "   "] {
            let s = slug(title, None);
            assert!(!s.is_empty(), "empty slug for {:?}", title);
        }
        assert_eq!(slug("???", None), "article");
        assert_eq!(slug("???", Some("2024-01-02")), "2024-01-02");
    }

    #[test]
    fn truncates_without_trailing_hyphen() {
        let title = "word ".repeat(60);
        let s = slug(&title, None);
        assert!(s.len() <= MAX_SLUG_LEN);
        assert!(!s.ends_with('-'));

        let dated = slug(&title, Some("2024-03-09"));
        assert!(dated.ends_with("-2024-03-09"));
        let base = dated.trim_end_matches("-2024-03-09");
        assert!(base.len() <= MAX_DATED_SLUG_LEN);
        assert!(!base.ends_with('-'));
    }

    #[test]
    fn source_fallbacks() {
        assert_eq!(
            slug_for_source("!!!", "https://news.example/local/metro-line-b-extension.html", None),
            "metro-line-b-extension"
        );
        let hashed = slug_for_source("!!!", "https://news.example/", None);
        assert_eq!(hashed, short_hash("https://news.example/"));
        assert_eq!(slug_for_source("Real title", "https://x/a", None), "real-title");
    }

    #[test]
    fn short_hash_is_eight_hex_chars() {
        let h = short_hash("https://x/a");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, short_hash("https://x/a"));
    }
}
