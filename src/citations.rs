use crate::specs::gemini::{GroundingChunk, GroundingMetadata, Segment};
use crate::specs::openai::SearchResult;
use crate::types::Citation;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CITATIONS_TYPE: &str = "citations";

lazy_static! {
    static ref URL_PATTERN: Regex = match Regex::new(r"https?://[^\s)]+") {
        Ok(re) => re,
        Err(e) => panic!("invalid url pattern: {}", e),
    };
    // An existing `[[n]](url)` link is matched first so it is never linked twice.
    static ref MARKER_PATTERN: Regex = match Regex::new(r"\[\[\d+\]\]\([^)]*\)|\[(\d+)\]") {
        Ok(re) => re,
        Err(e) => panic!("invalid marker pattern: {}", e),
    };
}

/// The normalized trailer line every relay uses to announce sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CitationRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub grounding_metadata: GroundingMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_mapping: Option<Vec<SegmentMapping>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMapping {
    #[serde(default)]
    pub segment: Option<Segment>,
    #[serde(default)]
    pub citation_indices: Vec<usize>,
}

impl CitationRecord {
    fn new(grounding_metadata: GroundingMetadata, segment_mapping: Option<Vec<SegmentMapping>>) -> Self {
        Self {
            kind: CITATIONS_TYPE.to_string(),
            grounding_metadata,
            segment_mapping,
        }
    }

    /// Gemini: the vendor metadata as-is, plus segment mapping from its supports.
    pub fn from_grounding(meta: &GroundingMetadata) -> Self {
        let mapping = meta
            .grounding_supports
            .iter()
            .map(|s| SegmentMapping {
                segment: s.segment.clone(),
                citation_indices: s.grounding_chunk_indices.clone(),
            })
            .collect();
        Self::new(meta.clone(), Some(mapping))
    }

    /// Perplexity: citation URLs zipped positionally with search result titles.
    pub fn from_urls(urls: &[String], results: &[SearchResult]) -> Self {
        let chunks = urls
            .iter()
            .enumerate()
            .map(|(i, url)| GroundingChunk::web(url.clone(), title_at(results, i)))
            .collect();
        Self::new(
            GroundingMetadata {
                grounding_chunks: chunks,
                ..Default::default()
            },
            None,
        )
    }

    /// Cerebras: every URL mentioned in the visible answer, in order of appearance.
    pub fn from_text(text: &str) -> Option<Self> {
        let urls = harvest_urls(text);
        if urls.is_empty() {
            return None;
        }
        let chunks = urls
            .iter()
            .enumerate()
            .map(|(i, url)| GroundingChunk::web(url.clone(), format!("Source {}", i + 1)))
            .collect();
        Some(Self::new(
            GroundingMetadata {
                grounding_chunks: chunks,
                ..Default::default()
            },
            None,
        ))
    }

    pub fn has_segment_mapping(&self) -> bool {
        match &self.segment_mapping {
            Some(m) => !m.is_empty(),
            None => false,
        }
    }
}

fn title_at(results: &[SearchResult], i: usize) -> String {
    match results.get(i).and_then(|r| r.title.as_deref()) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => format!("Source {}", i + 1),
    }
}

pub fn harvest_urls(text: &str) -> Vec<String> {
    URL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Numbered citations for the sources in `meta`. Entries with neither a URI
/// nor a title carry nothing to show and are dropped before numbering.
pub fn citations_from_grounding(meta: &GroundingMetadata) -> Vec<Citation> {
    meta.grounding_chunks
        .iter()
        .filter_map(|c| c.web.as_ref())
        .filter(|w| has_text(&w.uri) || has_text(&w.title))
        .enumerate()
        .map(|(i, w)| {
            let url = match &w.uri {
                Some(u) => u.clone(),
                None => String::new(),
            };
            Citation::numbered(i, url, w.title.as_deref())
        })
        .collect()
}

fn has_text(s: &Option<String>) -> bool {
    match s {
        Some(s) => !s.is_empty(),
        None => false,
    }
}

pub fn suggestions_from_grounding(meta: &GroundingMetadata) -> Vec<String> {
    meta.web_search_queries.clone()
}

pub fn zip_citations(urls: &[String], results: &[SearchResult]) -> Vec<Citation> {
    urls.iter()
        .enumerate()
        .map(|(i, url)| {
            let title = title_at(results, i);
            Citation::numbered(i, url.clone(), Some(title.as_str()))
        })
        .collect()
}

/// Turns `[n]` markers into markdown links to the matching citation.
pub fn insert_inline_links(text: &str, citations: &[Citation]) -> String {
    if citations.is_empty() {
        return text.to_string();
    }
    MARKER_PATTERN
        .replace_all(text, |caps: &regex::Captures| {
            let whole = match caps.get(0) {
                Some(m) => m.as_str(),
                None => "",
            };
            if caps.get(1).is_none() {
                return whole.to_string();
            }
            match citations.iter().find(|c| c.text == whole && !c.url.is_empty()) {
                Some(c) => format!("[{}]({})", whole, c.url),
                None => whole.to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::gemini::WebSource;

    fn result(title: &str) -> SearchResult {
        SearchResult {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_perplexity_zip_falls_back_to_numbered_titles() {
        let urls = vec!["https://a".to_string(), "https://b".to_string()];
        let record = CitationRecord::from_urls(&urls, &[result("A")]);
        let chunks = &record.grounding_metadata.grounding_chunks;
        assert_eq!(chunks.len(), 2);
        let titles: Vec<_> = chunks
            .iter()
            .filter_map(|c| c.web.as_ref().and_then(|w| w.title.clone()))
            .collect();
        assert_eq!(titles, vec!["A", "Source 2"]);

        let v = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => panic!("{}", e),
        };
        assert_eq!(v["type"], "citations");
        assert!(v.get("segmentMapping").is_none());
    }

    #[test]
    fn test_grounding_filter_renumbers_after_drop() {
        let meta = GroundingMetadata {
            grounding_chunks: vec![
                GroundingChunk::web("https://a", "A"),
                GroundingChunk {
                    web: Some(WebSource::default()),
                },
                GroundingChunk { web: None },
                GroundingChunk {
                    web: Some(WebSource {
                        uri: Some("https://c".into()),
                        title: None,
                    }),
                },
            ],
            web_search_queries: vec!["q1".into()],
            ..Default::default()
        };
        let cites = citations_from_grounding(&meta);
        assert_eq!(cites.len(), 2);
        assert_eq!(cites[1].text, "[2]");
        assert_eq!(cites[1].title, "Source 2");
        assert_eq!(cites[1].index, Some(1));
        assert_eq!(suggestions_from_grounding(&meta), vec!["q1"]);
    }

    #[test]
    fn test_inline_links_are_not_doubled() {
        let cites = vec![Citation::numbered(0, "https://a", Some("A"))];
        let once = insert_inline_links("Aging is rising [1] and [2].", &cites);
        assert_eq!(once, "Aging is rising [[1]](https://a) and [2].");
        let twice = insert_inline_links(&once, &cites);
        assert_eq!(twice, once);
    }

    #[test]
    fn test_harvest_stops_at_paren_and_space() {
        let text = "See (https://a.org/x) and http://b.net/y z";
        assert_eq!(harvest_urls(text), vec!["https://a.org/x", "http://b.net/y"]);
        assert!(CitationRecord::from_text("no links here").is_none());
    }

    #[test]
    fn test_gemini_record_maps_supports() {
        let raw = r#"{"groundingChunks":[{"web":{"uri":"https://a","title":"A"}}],
            "groundingSupports":[{"segment":{"startIndex":0,"endIndex":5,"text":"hello"},"groundingChunkIndices":[0]}]}"#;
        let meta: GroundingMetadata = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => panic!("{}", e),
        };
        let record = CitationRecord::from_grounding(&meta);
        assert!(record.has_segment_mapping());
        let v = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => panic!("{}", e),
        };
        assert_eq!(v["segmentMapping"][0]["citationIndices"][0], 0);
        assert_eq!(v["segmentMapping"][0]["segment"]["text"], "hello");
    }
}
