use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::embeddings::Embedder;
use crate::error::{CpmError, Result};
use crate::mcp::types::{Tool, ToolsCallResult};
use crate::oci::{PacketRef, RegistryClient};
use crate::retrieval::RetrievalEngine;

/// k is clamped to this range at the MCP boundary.
const K_MIN: usize = 1;
const K_MAX: usize = 20;

/// Get all tool definitions for tools/list
pub fn get_tool_definitions() -> Vec<Tool> {
    vec![
        Tool {
            name: "cpm_query".to_string(),
            description: "Semantic search over a context packet pinned by digest or alias"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ref": {
                        "type": "string",
                        "description": "Packet reference: oci://host/repo/name@sha256:<digest>, :alias, or name@version against the default registry"
                    },
                    "q": {
                        "type": "string",
                        "description": "Query text",
                        "minLength": 1
                    },
                    "k": {
                        "type": "integer",
                        "description": "Number of results to return",
                        "default": 5,
                        "minimum": 1,
                        "maximum": 20
                    }
                },
                "required": ["ref", "q"]
            }),
        },
        Tool {
            name: "cpm_lookup".to_string(),
            description: "Metadata-only lookup of a packet (no payload download)".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ref": {
                        "type": "string",
                        "description": "Packet reference to resolve and describe"
                    }
                },
                "required": ["ref"]
            }),
        },
        Tool {
            name: "cpm_plan".to_string(),
            description: "Pick the best packet for an intent from candidate refs, metadata-first with probe queries on ties".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "intent": {
                        "type": "string",
                        "description": "What the caller wants to find or do"
                    },
                    "candidates": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Candidate packet references",
                        "minItems": 1
                    }
                },
                "required": ["intent", "candidates"]
            }),
        },
        Tool {
            name: "cpm_evidence".to_string(),
            description: "Query a packet and return deduplicated snippets bounded by max_chars"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ref": {
                        "type": "string",
                        "description": "Packet reference"
                    },
                    "q": {
                        "type": "string",
                        "description": "Query text"
                    },
                    "k": {
                        "type": "integer",
                        "default": 5,
                        "minimum": 1,
                        "maximum": 20
                    },
                    "max_chars": {
                        "type": "integer",
                        "description": "Budget for concatenated snippets",
                        "default": 1200
                    }
                },
                "required": ["ref", "q"]
            }),
        },
    ]
}

#[derive(Deserialize)]
struct QueryArgs {
    #[serde(rename = "ref")]
    packet_ref: String,
    q: String,
    #[serde(default = "default_k")]
    k: usize,
}

#[derive(Deserialize)]
struct LookupArgs {
    #[serde(rename = "ref")]
    packet_ref: String,
}

#[derive(Deserialize)]
struct PlanArgs {
    intent: String,
    candidates: Vec<String>,
}

#[derive(Deserialize)]
struct EvidenceArgs {
    #[serde(rename = "ref")]
    packet_ref: String,
    q: String,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default = "default_max_chars")]
    max_chars: usize,
}

fn default_k() -> usize {
    5
}

fn default_max_chars() -> usize {
    1200
}

/// Dispatch one tools/call to its handler.
pub async fn handle_tool_call<C: RegistryClient, E: Embedder>(
    engine: &RetrievalEngine<C, E>,
    config: &Config,
    name: &str,
    arguments: &Value,
) -> Result<ToolsCallResult> {
    match name {
        "cpm_query" => handle_query(engine, config, arguments).await,
        "cpm_lookup" => handle_lookup(engine, config, arguments).await,
        "cpm_plan" => handle_plan(engine, config, arguments).await,
        "cpm_evidence" => handle_evidence(engine, config, arguments).await,
        other => Err(CpmError::McpProtocol(format!("unknown tool: {}", other))),
    }
}

fn parse_args<'de, T: Deserialize<'de>>(arguments: &'de Value) -> Result<T> {
    T::deserialize(arguments)
        .map_err(|e| CpmError::McpProtocol(format!("invalid tool arguments: {}", e)))
}

fn resolve_ref(config: &Config, input: &str) -> Result<PacketRef> {
    PacketRef::resolve_input(input, config.registry.default.as_deref())
}

async fn handle_query<C: RegistryClient, E: Embedder>(
    engine: &RetrievalEngine<C, E>,
    config: &Config,
    arguments: &Value,
) -> Result<ToolsCallResult> {
    let args: QueryArgs = parse_args(arguments)?;
    let packet_ref = resolve_ref(config, &args.packet_ref)?;
    let k = args.k.clamp(K_MIN, K_MAX);

    let result = engine.query(&packet_ref, &args.q, k).await?;
    let body = json!({
        "cache_hit": result.cache_hit,
        "pinned_uri": result.pinned_uri,
        "digest": result.digest,
        "results": result.results.iter().map(|hit| json!({
            "score": hit.score,
            "path": hit.path,
            "start": hit.start,
            "end": hit.end,
            "snippet": hit.snippet,
        })).collect::<Vec<_>>(),
    });
    Ok(ToolsCallResult::text(serde_json::to_string_pretty(&body).unwrap_or_default()))
}

async fn handle_lookup<C: RegistryClient, E: Embedder>(
    engine: &RetrievalEngine<C, E>,
    config: &Config,
    arguments: &Value,
) -> Result<ToolsCallResult> {
    let args: LookupArgs = parse_args(arguments)?;
    let packet_ref = resolve_ref(config, &args.packet_ref)?;

    let result = engine.resolver().lookup_metadata(&packet_ref).await?;
    let body = json!({
        "digest": result.digest,
        "pinned_uri": result.pinned_uri,
        "metadata": result.metadata,
    });
    Ok(ToolsCallResult::text(serde_json::to_string_pretty(&body).unwrap_or_default()))
}

async fn handle_plan<C: RegistryClient, E: Embedder>(
    engine: &RetrievalEngine<C, E>,
    config: &Config,
    arguments: &Value,
) -> Result<ToolsCallResult> {
    let args: PlanArgs = parse_args(arguments)?;
    let candidates: Vec<PacketRef> = args
        .candidates
        .iter()
        .map(|c| resolve_ref(config, c))
        .collect::<Result<_>>()?;

    let outcome = engine.plan_from_intent(&args.intent, &candidates).await?;
    let body = json!({
        "intent": outcome.intent.as_str(),
        "selected": outcome.selected,
        "fallbacks": outcome.fallbacks,
        "scores": outcome.scores.iter().map(|s| json!({
            "uri": s.uri,
            "metadata_score": s.metadata_score,
            "probe_score": s.probe_score,
        })).collect::<Vec<_>>(),
    });
    Ok(ToolsCallResult::text(serde_json::to_string_pretty(&body).unwrap_or_default()))
}

async fn handle_evidence<C: RegistryClient, E: Embedder>(
    engine: &RetrievalEngine<C, E>,
    config: &Config,
    arguments: &Value,
) -> Result<ToolsCallResult> {
    let args: EvidenceArgs = parse_args(arguments)?;
    let packet_ref = resolve_ref(config, &args.packet_ref)?;
    let k = args.k.clamp(K_MIN, K_MAX);

    let digest = engine
        .evidence_digest(&packet_ref, &args.q, k, args.max_chars)
        .await?;
    let body = json!({
        "summary": digest.summary,
        "snippets": digest.snippets.iter().map(|s| json!({
            "path": s.path,
            "snippet": s.snippet,
            "score": s.score,
        })).collect::<Vec<_>>(),
    });
    Ok(ToolsCallResult::text(serde_json::to_string_pretty(&body).unwrap_or_default()))
}
