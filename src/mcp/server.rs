use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};

use crate::config::Config;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::mcp::tools;
use crate::mcp::types::*;
use crate::oci::RegistryClient;
use crate::retrieval::RetrievalEngine;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP server over stdio: JSON-RPC 2.0, one request per line.
pub struct McpServer<C: RegistryClient, E: Embedder> {
    engine: RetrievalEngine<C, E>,
    config: Config,
}

impl<C: RegistryClient, E: Embedder> McpServer<C, E> {
    pub fn new(engine: RetrievalEngine<C, E>, config: Config) -> Self {
        Self { engine, config }
    }

    /// Process one MCP JSON-RPC request.
    ///
    /// Returns `Ok(None)` for notifications (no response goes back) and
    /// `Ok(Some(response))` otherwise. Handler failures become JSON-RPC
    /// error responses rather than transport errors.
    pub async fn process_mcp_request(
        &self,
        request: JsonRpcRequest,
        initialized: &mut bool,
    ) -> Result<Option<JsonRpcResponse>> {
        let id = match &request.id {
            Some(id) => id.clone(),
            None => {
                if request.method == "notifications/initialized" {
                    *initialized = true;
                }
                return Ok(None);
            }
        };

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(&id),
            "tools/list" => self.handle_tools_list(&id),
            "tools/call" => self.handle_tools_call(&id, &request.params).await,
            "shutdown" => Ok(ok_response(&id, Value::Null)),
            _ => Ok(error_response(
                &id,
                error_codes::METHOD_NOT_FOUND,
                &format!("Unknown method: {}", request.method),
            )),
        };

        match response {
            Ok(resp) => Ok(Some(resp)),
            Err(e) => Ok(Some(error_response(
                &id,
                error_codes::INTERNAL_ERROR,
                &format!("Internal error: {}", e),
            ))),
        }
    }

    fn handle_initialize(&self, id: &JsonRpcId) -> Result<JsonRpcResponse> {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({"tools": {}}),
            server_info: ServerInfo {
                name: "cpm".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        Ok(ok_response(id, serde_json::to_value(result).unwrap_or(Value::Null)))
    }

    fn handle_tools_list(&self, id: &JsonRpcId) -> Result<JsonRpcResponse> {
        let result = ToolsListResult {
            tools: tools::get_tool_definitions(),
        };
        Ok(ok_response(id, serde_json::to_value(result).unwrap_or(Value::Null)))
    }

    async fn handle_tools_call(
        &self,
        id: &JsonRpcId,
        params: &Option<Value>,
    ) -> Result<JsonRpcResponse> {
        let params: ToolsCallParams = match params {
            Some(p) => serde_json::from_value(p.clone()).map_err(|e| {
                crate::error::CpmError::McpProtocol(format!("invalid tools/call params: {}", e))
            })?,
            None => {
                return Ok(error_response(
                    id,
                    error_codes::INVALID_PARAMS,
                    "tools/call requires params",
                ));
            }
        };

        // Tool failures are reported inside the result payload so the
        // client can read the reason; protocol stays intact.
        let result = match tools::handle_tool_call(
            &self.engine,
            &self.config,
            &params.name,
            &params.arguments,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                log::warn!("tool {} failed: {}", params.name, e);
                ToolsCallResult::error(e.to_string())
            }
        };

        Ok(ok_response(id, serde_json::to_value(result).unwrap_or(Value::Null)))
    }

    /// Run the server: read JSON-RPC from stdin, write responses to stdout.
    /// Logs go to stderr per the MCP convention.
    pub async fn run(&mut self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut reader = AsyncBufReader::new(stdin);
        let mut stdout = tokio::io::stdout();
        let mut initialized = false;

        log::info!("cpm MCP server ready (stdio)");
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("unparseable request: {}", e);
                    let response = JsonRpcResponse {
                        jsonrpc: "2.0".to_string(),
                        id: Value::Null,
                        payload: JsonRpcResponsePayload::Error {
                            error: JsonRpcError {
                                code: error_codes::PARSE_ERROR,
                                message: format!("Parse error: {}", e),
                                data: None,
                            },
                        },
                    };
                    write_response(&mut stdout, &response).await?;
                    continue;
                }
            };

            let shutdown = request.method == "shutdown";
            if let Some(response) = self.process_mcp_request(request, &mut initialized).await? {
                write_response(&mut stdout, &response).await?;
            }
            if shutdown {
                break;
            }
        }
        Ok(())
    }
}

fn ok_response(id: &JsonRpcId, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: id.clone().into(),
        payload: JsonRpcResponsePayload::Result { result },
    }
}

fn error_response(id: &JsonRpcId, code: i32, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: id.clone().into(),
        payload: JsonRpcResponsePayload::Error {
            error: JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            },
        },
    }
}

async fn write_response(
    stdout: &mut tokio::io::Stdout,
    response: &JsonRpcResponse,
) -> Result<()> {
    let json = serde_json::to_string(response)
        .map_err(|e| crate::error::CpmError::McpProtocol(format!("serialize response: {}", e)))?;
    stdout.write_all(json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
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

    fn server<'a>(
        registry: &'a FakeRegistry,
        temp: &TempDir,
    ) -> McpServer<&'a FakeRegistry, HashEmbedder> {
        let resolver = Resolver::new(
            registry,
            CpmRoot::new(temp.path()),
            RegistryConfig::default(),
            TrustConfig::default(),
        );
        let engine = RetrievalEngine::new(resolver, HashEmbedder { dim: 16 });
        let mut config = Config::default();
        config.registry.default = Some("oci://reg.example.com/team".to_string());
        McpServer::new(engine, config)
    }

    fn request(raw: &str) -> JsonRpcRequest {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_tools_list() {
        let registry = FakeRegistry::new();
        let temp = TempDir::new().unwrap();
        let server = server(&registry, &temp);
        let mut initialized = false;

        let response = server
            .process_mcp_request(
                request(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#),
                &mut initialized,
            )
            .await
            .unwrap()
            .unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"]["serverInfo"]["name"], "cpm");

        let response = server
            .process_mcp_request(
                request(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#),
                &mut initialized,
            )
            .await
            .unwrap()
            .unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"]["tools"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_notification_returns_none() {
        let registry = FakeRegistry::new();
        let temp = TempDir::new().unwrap();
        let server = server(&registry, &temp);
        let mut initialized = false;

        let response = server
            .process_mcp_request(
                request(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#),
                &mut initialized,
            )
            .await
            .unwrap();
        assert!(response.is_none());
        assert!(initialized);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = FakeRegistry::new();
        let temp = TempDir::new().unwrap();
        let server = server(&registry, &temp);
        let mut initialized = false;

        let response = server
            .process_mcp_request(
                request(r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#),
                &mut initialized,
            )
            .await
            .unwrap()
            .unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tools_call_end_to_end() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        publish_packet(
            &registry,
            "1.0.0",
            &sample_metadata("demo"),
            &[make_chunk("a.md:0", "a.md", "retry budget details")],
            &embedder,
            true,
        );

        let temp = TempDir::new().unwrap();
        let server = server(&registry, &temp);
        let mut initialized = false;

        let raw = r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"cpm_query","arguments":{"ref":"demo:1.0.0","q":"retry budget details","k":1}}}"#;
        let response = server
            .process_mcp_request(request(raw), &mut initialized)
            .await
            .unwrap()
            .unwrap();
        let json = serde_json::to_value(&response).unwrap();
        let text = json["result"]["content"][0]["text"].as_str().unwrap();
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["results"][0]["path"], "a.md");
    }

    #[tokio::test]
    async fn test_tool_failure_is_in_band() {
        let registry = FakeRegistry::new();
        let temp = TempDir::new().unwrap();
        let server = server(&registry, &temp);
        let mut initialized = false;

        // Packet does not exist in the fake registry.
        let raw = r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"cpm_query","arguments":{"ref":"ghost:1.0.0","q":"anything"}}}"#;
        let response = server
            .process_mcp_request(request(raw), &mut initialized)
            .await
            .unwrap()
            .unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"]["isError"], serde_json::json!(null));
        assert_eq!(json["result"]["is_error"], true);
    }
}
