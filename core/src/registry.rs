//! Registry of tool providers and their live sessions.
//!
//! Specs are registered up front; sessions are expensive (child processes,
//! remote handshakes) and started lazily on first use, then cached. A
//! transport error poisons the session: the caller reports it here and the
//! next call builds a fresh one. Startup is serialized per provider name so
//! concurrent first calls never spawn two children.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tracing::info;
use tracing::warn;

use pybox_provider_client::DEFAULT_CONNECT_TIMEOUT;
use pybox_provider_client::ProviderClient;
use pybox_provider_client::ProviderError;
use pybox_provider_client::ProviderSpec;
use pybox_wire::CallToolResult;
use pybox_wire::ToolDecl;

use crate::ExecutorErr;
use crate::Result;
use crate::vars;

/// One live provider connection plus its declared tools.
pub struct ProviderSession {
    pub name: String,
    /// Monotonically increasing across the registry; a discard only takes
    /// effect if the generation still matches, so a stale failure report
    /// cannot tear down a newer session.
    pub generation: u64,
    tools: HashMap<String, ToolDecl>,
    client: ProviderClient,
}

impl std::fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSession")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .finish()
    }
}

impl ProviderSession {
    pub fn tool(&self, name: &str) -> Option<&ToolDecl> {
        self.tools.get(name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolDecl> {
        self.tools.values()
    }

    /// Sorted by tool name, for deterministic downstream artifacts.
    pub fn tools_sorted(&self) -> Vec<&ToolDecl> {
        let mut tools: Vec<&ToolDecl> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn invoke(
        &self,
        tool: &str,
        args: Option<Value>,
    ) -> std::result::Result<CallToolResult, ProviderError> {
        self.client.call_tool(tool, args).await
    }
}

struct ProviderEntry {
    spec: ProviderSpec,
    /// Also the per-name startup lock: holding it while connecting keeps a
    /// second first-call waiting instead of double-spawning.
    state: tokio::sync::Mutex<Option<Arc<ProviderSession>>>,
}

pub struct ProviderRegistry {
    connect_timeout: Duration,
    entries: Mutex<HashMap<String, Arc<ProviderEntry>>>,
    generation: AtomicU64,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl ProviderRegistry {
    pub fn new(connect_timeout: Duration) -> Self {
        ProviderRegistry {
            connect_timeout,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Adds or replaces a provider spec. A session built from the old spec
    /// is torn down; the next call starts fresh.
    pub async fn register(&self, name: &str, spec: ProviderSpec) {
        let old = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.insert(
                name.to_string(),
                Arc::new(ProviderEntry { spec, state: tokio::sync::Mutex::new(None) }),
            )
        };
        if let Some(old) = old {
            let mut state = old.state.lock().await;
            teardown(state.take());
        }
        info!(provider = name, "provider registered");
    }

    /// Removes a provider. An in-flight call keeps its session alive until
    /// it completes; nothing new is created afterwards.
    pub async fn deregister(&self, name: &str) {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(name)
        };
        if let Some(entry) = removed {
            let mut state = entry.state.lock().await;
            teardown(state.take());
            info!(provider = name, "provider deregistered");
        }
    }

    pub fn registered_names(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the cached session for `name`, starting one if necessary.
    pub async fn session_for(&self, name: &str) -> Result<Arc<ProviderSession>> {
        let entry = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .get(name)
                .cloned()
                .ok_or_else(|| ExecutorErr::UnknownProvider(name.to_string()))?
        };

        let mut state = entry.state.lock().await;
        if let Some(session) = state.as_ref() {
            return Ok(session.clone());
        }

        let spec = self.resolve_spec(name, &entry.spec)?;
        let client = ProviderClient::connect(&spec, self.connect_timeout)
            .await
            .map_err(|e| ExecutorErr::Provider { provider: name.to_string(), message: e.to_string() })?;
        let listed = client
            .list_tools()
            .await
            .map_err(|e| ExecutorErr::Provider { provider: name.to_string(), message: e.to_string() })?;

        let mut tools = HashMap::with_capacity(listed.tools.len());
        for tool in listed.tools {
            if tools.contains_key(&tool.name) {
                warn!(provider = name, tool = %tool.name, "skipping duplicated tool");
                continue;
            }
            tools.insert(tool.name.clone(), tool);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(provider = name, generation, tool_count = tools.len(), "provider session started");

        let session = Arc::new(ProviderSession {
            name: name.to_string(),
            generation,
            tools,
            client,
        });
        *state = Some(session.clone());
        Ok(session)
    }

    /// Drops the cached session if it is still the one the caller saw fail.
    pub async fn discard(&self, name: &str, generation: u64) {
        let entry = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.get(name).cloned()
        };
        let Some(entry) = entry else { return };
        let mut state = entry.state.lock().await;
        if state.as_ref().is_some_and(|s| s.generation == generation) {
            warn!(provider = name, generation, "discarding failed provider session");
            teardown(state.take());
        }
    }

    /// Tears down every live session. Registered specs stay.
    pub async fn close_all(&self) {
        let entries: Vec<Arc<ProviderEntry>> = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.values().cloned().collect()
        };
        for entry in entries {
            let mut state = entry.state.lock().await;
            teardown(state.take());
        }
    }

    /// Applies `${VAR}` substitution from the process environment to the
    /// spec's env/headers. Unresolved references abort the startup.
    fn resolve_spec(&self, name: &str, spec: &ProviderSpec) -> Result<ProviderSpec> {
        match spec {
            ProviderSpec::Stdio { command, args, env } => {
                let outcome = vars::replace_from_process_env(env);
                if !outcome.missing_variables.is_empty() {
                    return Err(ExecutorErr::UnresolvedEnv {
                        provider: name.to_string(),
                        missing: outcome.missing_variables.into_iter().collect(),
                    });
                }
                Ok(ProviderSpec::Stdio {
                    command: command.clone(),
                    args: args.clone(),
                    env: outcome.replaced,
                })
            }
            ProviderSpec::Streamable { url, headers, mode } => {
                let outcome = vars::replace_from_process_env(headers);
                if !outcome.missing_variables.is_empty() {
                    return Err(ExecutorErr::UnresolvedEnv {
                        provider: name.to_string(),
                        missing: outcome.missing_variables.into_iter().collect(),
                    });
                }
                Ok(ProviderSpec::Streamable {
                    url: url.clone(),
                    headers: outcome.replaced,
                    mode: *mode,
                })
            }
        }
    }
}

/// Explicitly closes the session when this was the last reference;
/// otherwise in-flight holders finish first and the drop glue cleans up.
fn teardown(session: Option<Arc<ProviderSession>>) {
    let Some(session) = session else { return };
    tokio::spawn(async move {
        if let Ok(mut session) = Arc::try_unwrap(session) {
            session.client.close().await;
        }
    });
}
