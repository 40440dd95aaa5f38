//! Planner and evidence digest: the metadata-first MCP side tools.
//!
//! The planner scores candidate packets on metadata alone (name, tags,
//! kind, capabilities, entrypoints, description) and only spends probe
//! queries when the metadata scores cannot separate the leaders. Output is
//! deterministic for identical inputs: every ordering falls back to the
//! candidate URI.

use std::collections::BTreeSet;

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::oci::{PacketRef, RegistryClient};
use crate::retrieval::engine::RetrievalEngine;

/// How far down the ranking probe queries may reach.
const MAX_PROBES: usize = 3;

/// Intent classification: metadata-sufficient or retrieval-needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentClass {
    Lookup,
    Query,
}

impl IntentClass {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentClass::Lookup => "lookup",
            IntentClass::Query => "query",
        }
    }
}

/// One scored candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub uri: String,
    pub metadata_score: u32,
    pub probe_score: Option<f32>,
}

/// The planner's decision.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub intent: IntentClass,
    pub selected: String,
    pub fallbacks: Vec<String>,
    pub scores: Vec<CandidateScore>,
}

/// Deduplicated, truncated evidence for an intent.
#[derive(Debug, Clone)]
pub struct EvidenceDigest {
    pub snippets: Vec<EvidenceSnippet>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceSnippet {
    pub path: String,
    pub snippet: String,
    pub score: f32,
}

impl<C: RegistryClient, E: Embedder> RetrievalEngine<C, E> {
    /// Choose a packet for an intent from a candidate list.
    ///
    /// Metadata-only scoring ranks all candidates; a probe query runs only
    /// against the top tied candidates, and only for retrieval intents.
    pub async fn plan_from_intent(
        &self,
        intent: &str,
        candidates: &[PacketRef],
    ) -> Result<PlanOutcome> {
        if candidates.is_empty() {
            return Err(crate::error::CpmError::Retrieval(
                "planner needs at least one candidate".to_string(),
            ));
        }

        let intent_class = classify_intent(intent);
        let tokens = tokenize(intent);

        let mut scores = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let lookup = self.resolver().lookup_metadata(candidate).await?;
            let metadata_score = score_metadata(&tokens, &lookup.metadata);
            scores.push(CandidateScore {
                uri: candidate.to_uri(),
                metadata_score,
                probe_score: None,
            });
        }
        scores.sort_by(|a, b| {
            b.metadata_score
                .cmp(&a.metadata_score)
                .then_with(|| a.uri.cmp(&b.uri))
        });

        // Probe only when the metadata scores cannot separate the leaders.
        let top_score = scores[0].metadata_score;
        let tied: Vec<usize> = scores
            .iter()
            .enumerate()
            .filter(|(_, s)| s.metadata_score == top_score)
            .map(|(i, _)| i)
            .take(MAX_PROBES)
            .collect();

        if intent_class == IntentClass::Query && tied.len() > 1 {
            for &i in &tied {
                let candidate = candidates
                    .iter()
                    .find(|c| c.to_uri() == scores[i].uri)
                    .cloned();
                if let Some(candidate) = candidate {
                    let result = self.query(&candidate, intent, 3).await?;
                    let best = result
                        .results
                        .first()
                        .map(|hit| hit.score)
                        .unwrap_or(f32::MIN);
                    scores[i].probe_score = Some(best);
                }
            }
            scores.sort_by(|a, b| {
                b.metadata_score
                    .cmp(&a.metadata_score)
                    .then_with(|| {
                        let pa = a.probe_score.unwrap_or(f32::MIN);
                        let pb = b.probe_score.unwrap_or(f32::MIN);
                        pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.uri.cmp(&b.uri))
            });
        }

        let selected = scores[0].uri.clone();
        let fallbacks = scores.iter().skip(1).map(|s| s.uri.clone()).collect();
        Ok(PlanOutcome {
            intent: intent_class,
            selected,
            fallbacks,
            scores,
        })
    }

    /// Run a query and compress the hits into a deduplicated, bounded
    /// evidence digest.
    pub async fn evidence_digest(
        &self,
        packet_ref: &PacketRef,
        q: &str,
        k: usize,
        max_chars: usize,
    ) -> Result<EvidenceDigest> {
        let result = self.query(packet_ref, q, k).await?;

        let mut seen = BTreeSet::new();
        let mut snippets = Vec::new();
        let mut budget = max_chars;
        let mut truncated = false;
        for hit in &result.results {
            let key = (hit.path.clone(), hit.snippet.clone());
            if !seen.insert(key) {
                continue;
            }
            if hit.snippet.len() > budget {
                truncated = true;
                break;
            }
            budget -= hit.snippet.len();
            snippets.push(EvidenceSnippet {
                path: hit.path.clone(),
                snippet: hit.snippet.clone(),
                score: hit.score,
            });
        }

        let files: BTreeSet<&str> = snippets.iter().map(|s| s.path.as_str()).collect();
        let summary = format!(
            "{} snippet(s) from {} file(s) in {}{}",
            snippets.len(),
            files.len(),
            result.pinned_uri,
            if truncated { " (truncated)" } else { "" }
        );

        Ok(EvidenceDigest { snippets, summary })
    }
}

/// Interrogative or retrieval-flavored intents need a query; bare noun
/// phrases are satisfied by metadata.
fn classify_intent(intent: &str) -> IntentClass {
    let lower = intent.to_lowercase();
    const QUERY_MARKERS: &[&str] = &[
        "how", "why", "what", "when", "where", "which", "explain", "find", "search", "show",
        "example", "?",
    ];
    if QUERY_MARKERS.iter().any(|m| lower.contains(m)) {
        IntentClass::Query
    } else {
        IntentClass::Lookup
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(String::from)
        .collect()
}

/// Metadata-only feature score: name hits weigh most, then kind, tags,
/// capabilities, then entrypoints and description words.
fn score_metadata(tokens: &[String], metadata: &crate::oci::PacketMetadata) -> u32 {
    let mut score = 0u32;
    let packet = &metadata.packet;

    let name_tokens = tokenize(&packet.name);
    let description_tokens = packet
        .description
        .as_deref()
        .map(tokenize)
        .unwrap_or_default();

    for token in tokens {
        if name_tokens.contains(token) {
            score += 3;
        }
        if packet.kind.as_deref().is_some_and(|k| k.eq_ignore_ascii_case(token)) {
            score += 2;
        }
        if packet
            .tags
            .as_ref()
            .is_some_and(|tags| tags.iter().any(|t| t.eq_ignore_ascii_case(token)))
        {
            score += 2;
        }
        if packet
            .capabilities
            .as_ref()
            .is_some_and(|caps| caps.iter().any(|c| tokenize(c).contains(token)))
        {
            score += 2;
        }
        if packet
            .entrypoints
            .as_ref()
            .is_some_and(|eps| eps.iter().any(|e| tokenize(e).contains(token)))
        {
            score += 1;
        }
        if description_tokens.contains(token) {
            score += 1;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CpmRoot;
    use crate::config::{RegistryConfig, TrustConfig};
    use crate::oci::resolver::testing::{sample_metadata, FakeRegistry};
    use crate::oci::Resolver;
    use crate::retrieval::engine::testing::{make_chunk, publish_packet, HashEmbedder};
    use tempfile::TempDir;

    fn engine<'a>(
        registry: &'a FakeRegistry,
        temp: &TempDir,
    ) -> RetrievalEngine<&'a FakeRegistry, HashEmbedder> {
        let resolver = Resolver::new(
            registry,
            CpmRoot::new(temp.path()),
            RegistryConfig::default(),
            TrustConfig::default(),
        );
        RetrievalEngine::new(resolver, HashEmbedder { dim: 16 })
    }

    fn named_metadata(name: &str, tags: &[&str]) -> crate::oci::PacketMetadata {
        let mut metadata = sample_metadata(name);
        metadata.packet.tags = Some(tags.iter().map(|t| t.to_string()).collect());
        metadata
    }

    fn r(name: &str) -> PacketRef {
        PacketRef::parse(&format!("oci://reg.example.com/team/{}:1.0.0", name)).unwrap()
    }

    #[test]
    fn test_classify_intent() {
        assert_eq!(classify_intent("how do I configure retries?"), IntentClass::Query);
        assert_eq!(classify_intent("find the flush interval docs"), IntentClass::Query);
        assert_eq!(classify_intent("billing-service packet"), IntentClass::Lookup);
    }

    #[test]
    fn test_score_metadata_weights() {
        let metadata = named_metadata("billing", &["payments", "docs"]);
        let tokens = tokenize("billing payments");
        let score = score_metadata(&tokens, &metadata);
        // name (3) + tag payments (2)
        assert_eq!(score, 5);

        let weaker = score_metadata(&tokenize("payments"), &metadata);
        assert!(weaker < score);
    }

    #[tokio::test]
    async fn test_planner_selects_by_metadata() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        publish_packet(
            &registry,
            "1.0.0",
            &named_metadata("billing", &["payments"]),
            &[make_chunk("a.md:0", "a.md", "invoice handling")],
            &embedder,
            true,
        );
        // Publish under distinct names by re-tagging: separate repos share
        // the fake registry's tag namespace, so use distinct tags.
        let registry2 = FakeRegistry::new();
        publish_packet(
            &registry2,
            "1.0.0",
            &named_metadata("shipping", &["logistics"]),
            &[make_chunk("a.md:0", "a.md", "parcel routing")],
            &embedder,
            true,
        );

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp);
        let outcome = engine
            .plan_from_intent("billing payments packet", &[r("billing")])
            .await
            .unwrap();
        assert_eq!(outcome.intent, IntentClass::Lookup);
        assert!(outcome.selected.contains("billing"));
        assert!(outcome.fallbacks.is_empty());
    }

    #[tokio::test]
    async fn test_planner_probes_only_on_ties_and_is_deterministic() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };

        // Two candidates with identical metadata scores for the intent.
        publish_packet(
            &registry,
            "alpha",
            &named_metadata("packet-alpha", &["shared"]),
            &[make_chunk("a.md:0", "a.md", "how do I tune the retry budget")],
            &embedder,
            true,
        );
        publish_packet(
            &registry,
            "beta",
            &named_metadata("packet-beta", &["shared"]),
            &[make_chunk("a.md:0", "a.md", "completely different topic")],
            &embedder,
            true,
        );

        let alpha = PacketRef::parse("oci://reg.example.com/team/demo:alpha").unwrap();
        let beta = PacketRef::parse("oci://reg.example.com/team/demo:beta").unwrap();

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp);
        let candidates = vec![alpha.clone(), beta.clone()];

        let outcome = engine
            .plan_from_intent("how do I tune the retry budget", &candidates)
            .await
            .unwrap();
        assert_eq!(outcome.intent, IntentClass::Query);
        // The packet whose content matches the intent wins the probe.
        assert_eq!(outcome.selected, alpha.to_uri());
        assert_eq!(outcome.fallbacks, vec![beta.to_uri()]);
        assert!(outcome.scores[0].probe_score.is_some());

        // Identical inputs, identical plan.
        let again = engine
            .plan_from_intent("how do I tune the retry budget", &candidates)
            .await
            .unwrap();
        assert_eq!(again.selected, outcome.selected);
        assert_eq!(again.fallbacks, outcome.fallbacks);
    }

    #[tokio::test]
    async fn test_lookup_intent_never_probes() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        publish_packet(
            &registry,
            "alpha",
            &named_metadata("packet-alpha", &["shared"]),
            &[make_chunk("a.md:0", "a.md", "body")],
            &embedder,
            true,
        );
        publish_packet(
            &registry,
            "beta",
            &named_metadata("packet-beta", &["shared"]),
            &[make_chunk("a.md:0", "a.md", "body")],
            &embedder,
            true,
        );

        let alpha = PacketRef::parse("oci://reg.example.com/team/demo:alpha").unwrap();
        let beta = PacketRef::parse("oci://reg.example.com/team/demo:beta").unwrap();

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp);
        let outcome = engine
            .plan_from_intent("shared packet listing", &[alpha, beta])
            .await
            .unwrap();
        assert_eq!(outcome.intent, IntentClass::Lookup);
        assert!(outcome.scores.iter().all(|s| s.probe_score.is_none()));
        // Tie resolved by ascending URI.
        assert!(outcome.selected < outcome.fallbacks[0]);
    }

    #[tokio::test]
    async fn test_evidence_digest_dedupes_and_truncates() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        let chunks = vec![
            make_chunk("a.md:0", "a.md", "retry budget details"),
            make_chunk("a.md:1", "a.md", "retry budget details"),
            make_chunk("b.md:0", "b.md", "flush interval"),
        ];
        publish_packet(&registry, "1.0.0", &sample_metadata("demo"), &chunks, &embedder, true);

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp);
        let packet_ref = PacketRef::parse("oci://reg.example.com/team/demo:1.0.0").unwrap();

        let digest = engine
            .evidence_digest(&packet_ref, "retry budget details", 3, 1200)
            .await
            .unwrap();
        // The duplicate (path, snippet) pair collapses to one.
        assert_eq!(digest.snippets.len(), 2);
        assert!(digest.summary.contains("2 snippet(s)"));

        // A tiny budget truncates.
        let digest = engine
            .evidence_digest(&packet_ref, "retry budget details", 3, 10)
            .await
            .unwrap();
        assert!(digest.snippets.is_empty());
        assert!(digest.summary.contains("truncated"));
    }
}
