// SPDX-License-Identifier: MIT OR Apache-2.0

//! TF-IDF retrieval over tool descriptors.
//!
//! The document for each tool is the concatenation of its name, description,
//! and input property names. Retrieval keeps the LM's tool window small and
//! starves hallucinated tool names of oxygen. Dense embeddings would slot in
//! behind the same interface if a deployment ever needs them.

use crate::schema::ToolSpec;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use twd_types::RiskLevel;

/// A tool matching a query, with its similarity score.
#[derive(Debug, Clone)]
pub struct CapabilityHit {
    /// The matching tool.
    pub tool: ToolSpec,
    /// Cosine similarity in `(0, 1]`.
    pub score: f32,
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "will", "with",
];

fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
        .collect();

    let mut terms: Vec<String> = words.iter().map(|w| (*w).to_string()).collect();
    // 1-2-grams: bigrams capture phrases like "emergency stop".
    for pair in words.windows(2) {
        terms.push(format!("{} {}", pair[0], pair[1]));
    }
    terms
}

fn term_counts(terms: &[String]) -> HashMap<&str, f32> {
    let mut counts: HashMap<&str, f32> = HashMap::new();
    for term in terms {
        *counts.entry(term.as_str()).or_default() += 1.0;
    }
    counts
}

/// Bag-of-words TF-IDF index over tool descriptors.
#[derive(Debug, Default)]
pub struct CapabilityIndex {
    tools: Vec<ToolSpec>,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f32>,
    rows: Vec<Vec<(usize, f32)>>,
}

impl CapabilityIndex {
    /// Build an index over the given tools.
    #[must_use]
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        let mut index = Self::default();
        index.set_tools(tools);
        index
    }

    fn document_for(tool: &ToolSpec) -> String {
        let param_names: Vec<&str> = tool
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|p| p.keys().map(String::as_str).collect())
            .unwrap_or_default();
        format!("{} {} {}", tool.name, tool.description, param_names.join(" "))
    }

    /// Add tools and rebuild the index.
    pub fn add_tools(&mut self, tools: Vec<ToolSpec>) {
        self.tools.extend(tools);
        self.reindex();
    }

    /// Replace all tools and rebuild the index.
    pub fn set_tools(&mut self, tools: Vec<ToolSpec>) {
        self.tools = tools;
        self.reindex();
    }

    fn reindex(&mut self) {
        self.vocabulary.clear();
        self.idf.clear();
        self.rows.clear();
        if self.tools.is_empty() {
            return;
        }

        let documents: Vec<Vec<String>> = self
            .tools
            .iter()
            .map(|t| tokenize(&Self::document_for(t)))
            .collect();

        // Document frequencies over the unique terms of each document.
        let mut document_frequency: HashMap<&str, f32> = HashMap::new();
        for terms in &documents {
            let unique: BTreeSet<&str> = terms.iter().map(String::as_str).collect();
            for term in unique {
                *document_frequency.entry(term).or_default() += 1.0;
            }
        }

        let n = self.tools.len() as f32;
        let mut vocabulary = HashMap::new();
        let mut idf = Vec::new();
        let mut sorted_terms: Vec<&&str> = document_frequency.keys().collect();
        sorted_terms.sort_unstable();
        for term in sorted_terms {
            let df = document_frequency[*term];
            vocabulary.insert((*term).to_string(), idf.len());
            // Smoothed idf, as in the usual text-retrieval formulation.
            idf.push(((1.0 + n) / (1.0 + df)).ln() + 1.0);
        }

        let rows = documents
            .iter()
            .map(|terms| {
                let mut row: Vec<(usize, f32)> = term_counts(terms)
                    .into_iter()
                    .filter_map(|(term, count)| {
                        vocabulary.get(term).map(|&i| (i, count * idf[i]))
                    })
                    .collect();
                l2_normalize(&mut row);
                row.sort_unstable_by_key(|(i, _)| *i);
                row
            })
            .collect();

        self.vocabulary = vocabulary;
        self.idf = idf;
        self.rows = rows;
        debug!(tool_count = self.tools.len(), "capability index rebuilt");
    }

    /// Rank tools against a query, dropping zero-similarity hits.
    #[must_use]
    pub fn search(&self, query: &str, top_k: usize) -> Vec<CapabilityHit> {
        if self.tools.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let terms = tokenize(query);
        let mut query_vec: Vec<(usize, f32)> = term_counts(&terms)
            .into_iter()
            .filter_map(|(term, count)| {
                self.vocabulary.get(term).map(|&i| (i, count * self.idf[i]))
            })
            .collect();
        if query_vec.is_empty() {
            return Vec::new();
        }
        l2_normalize(&mut query_vec);
        query_vec.sort_unstable_by_key(|(i, _)| *i);

        let mut scored: Vec<(usize, f32)> = self
            .rows
            .iter()
            .enumerate()
            .map(|(doc, row)| (doc, sparse_dot(&query_vec, row)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        scored
            .into_iter()
            .map(|(doc, score)| CapabilityHit {
                tool: self.tools[doc].clone(),
                score,
            })
            .collect()
    }

    /// Exact-name lookup.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// All tools with the given risk level.
    #[must_use]
    pub fn get_by_risk_level(&self, risk: RiskLevel) -> Vec<&ToolSpec> {
        self.tools.iter().filter(|t| t.risk == risk).collect()
    }

    /// All tools from one submodel.
    #[must_use]
    pub fn get_by_submodel(&self, submodel_id: &str) -> Vec<&ToolSpec> {
        self.tools
            .iter()
            .filter(|t| t.submodel_id == submodel_id)
            .collect()
    }

    /// All indexed tools.
    #[must_use]
    pub fn all_tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    /// Number of indexed tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn l2_normalize(row: &mut [(usize, f32)]) {
    let norm = row.iter().map(|(_, v)| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for (_, v) in row.iter_mut() {
            *v /= norm;
        }
    }
}

fn sparse_dot(a: &[(usize, f32)], b: &[(usize, f32)]) -> f32 {
    let mut sum = 0.0;
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                sum += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    sum
}

/// Index variant that always includes a configured set of tools.
///
/// Priority tools are prepended with full score, deduplicated against the
/// ranked hits, and the merged list is truncated to `top_k`.
#[derive(Debug, Default)]
pub struct PriorityIndex {
    inner: CapabilityIndex,
    always_include: BTreeSet<String>,
}

impl PriorityIndex {
    /// Build a priority index.
    #[must_use]
    pub fn new(tools: Vec<ToolSpec>, always_include: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: CapabilityIndex::new(tools),
            always_include: always_include.into_iter().collect(),
        }
    }

    /// The wrapped plain index.
    #[must_use]
    pub fn inner(&self) -> &CapabilityIndex {
        &self.inner
    }

    /// Replace all tools and rebuild.
    pub fn set_tools(&mut self, tools: Vec<ToolSpec>) {
        self.inner.set_tools(tools);
    }

    /// Exact-name lookup.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&ToolSpec> {
        self.inner.get_by_name(name)
    }

    /// Search with the always-include set prepended.
    #[must_use]
    pub fn search(&self, query: &str, top_k: usize) -> Vec<CapabilityHit> {
        let mut hits: Vec<CapabilityHit> = self
            .inner
            .all_tools()
            .iter()
            .filter(|t| self.always_include.contains(&t.name))
            .map(|t| CapabilityHit {
                tool: t.clone(),
                score: 1.0,
            })
            .collect();
        let seen: BTreeSet<String> = hits.iter().map(|h| h.tool.name.clone()).collect();
        for hit in self.inner.search(query, top_k) {
            if !seen.contains(&hit.tool.name) {
                hits.push(hit);
            }
        }
        hits.truncate(top_k);
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: &str, params: &[&str]) -> ToolSpec {
        let mut properties = serde_json::Map::new();
        for p in params {
            properties.insert((*p).to_string(), json!({"type": "number"}));
        }
        ToolSpec {
            name: name.into(),
            description: description.into(),
            input_schema: json!({"type": "object", "properties": properties}),
            submodel_id: "urn:sm:pump".into(),
            operation_path: name.into(),
            risk: RiskLevel::Low,
            delegation_url: None,
        }
    }

    fn pump_tools() -> Vec<ToolSpec> {
        vec![
            tool("StartPump", "Start the feed pump", &[]),
            tool("StopPump", "Stop the feed pump", &[]),
            tool("SetSpeed", "Set the pump speed in RPM", &["RPM"]),
            tool("ReadTemperature", "Read the current temperature sensor", &[]),
            tool("EmergencyStop", "Emergency stop for the whole line", &[]),
        ]
    }

    #[test]
    fn relevant_tool_ranks_first() {
        let index = CapabilityIndex::new(pump_tools());
        let hits = index.search("set the speed to 1200 rpm", 3);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].tool.name, "SetSpeed");
    }

    #[test]
    fn bigrams_catch_phrases() {
        let index = CapabilityIndex::new(pump_tools());
        let hits = index.search("emergency stop now", 3);
        assert_eq!(hits[0].tool.name, "EmergencyStop");
    }

    #[test]
    fn unknown_query_terms_return_nothing() {
        let index = CapabilityIndex::new(pump_tools());
        assert!(index.search("quaternion eigenvalues", 5).is_empty());
    }

    #[test]
    fn zero_similarity_hits_are_dropped() {
        let index = CapabilityIndex::new(pump_tools());
        let hits = index.search("temperature", 10);
        assert!(hits.iter().all(|h| h.score > 0.0));
        assert!(hits.len() < pump_tools().len());
    }

    #[test]
    fn top_k_bounds_the_result() {
        let index = CapabilityIndex::new(pump_tools());
        let hits = index.search("pump speed temperature stop start", 2);
        assert!(hits.len() <= 2);
    }

    #[test]
    fn lookup_filters() {
        let mut tools = pump_tools();
        tools[4].risk = RiskLevel::Critical;
        let index = CapabilityIndex::new(tools);
        assert!(index.get_by_name("SetSpeed").is_some());
        assert!(index.get_by_name("Missing").is_none());
        assert_eq!(index.get_by_risk_level(RiskLevel::Critical).len(), 1);
        assert_eq!(index.get_by_submodel("urn:sm:pump").len(), 5);
        assert_eq!(index.get_by_submodel("urn:sm:other").len(), 0);
    }

    #[test]
    fn empty_index_searches_to_nothing() {
        let index = CapabilityIndex::new(Vec::new());
        assert!(index.search("anything", 5).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn priority_tools_are_always_present_and_deduplicated() {
        let index = PriorityIndex::new(pump_tools(), ["EmergencyStop".to_string()]);
        let hits = index.search("set pump speed", 3);
        assert_eq!(hits[0].tool.name, "EmergencyStop");
        assert_eq!(hits[0].score, 1.0);
        let names: Vec<&str> = hits.iter().map(|h| h.tool.name.as_str()).collect();
        assert_eq!(
            names.iter().filter(|n| **n == "EmergencyStop").count(),
            1
        );
        assert!(names.contains(&"SetSpeed"));
        assert!(hits.len() <= 3);
    }

    #[test]
    fn reindex_after_set_tools() {
        let mut index = CapabilityIndex::new(pump_tools());
        index.set_tools(vec![tool("OpenValve", "Open the inlet valve", &[])]);
        assert_eq!(index.len(), 1);
        let hits = index.search("open the valve", 3);
        assert_eq!(hits[0].tool.name, "OpenValve");
    }
}
