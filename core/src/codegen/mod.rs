//! Materializes typed Python tool modules into the kernel's workspace.
//!
//! Layout under the workspace root:
//!
//! ```text
//! tools/__init__.py            package marker
//! tools/_preamble.py           tool service address + bearer secret (0600)
//! tools/<provider>/__init__.py aggregator listing the generated modules
//! tools/<provider>/<tool>.py   one module per tool
//! ```
//!
//! Writes go through a temp file in the target directory and are renamed
//! into place, so the kernel (which shares this filesystem) never imports a
//! half-written module. Modules whose tool disappeared are removed.

mod python;

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::info;

use pybox_wire::ToolDecl;

use crate::ExecutorErr;
use crate::Result;

pub use python::sanitize_name;
pub use python::tool_module_source;

/// Writes the shared preamble: service address, bearer secret, and the
/// `invoke_tool` / `ToolCallError` shims every generated module imports.
/// Rewritten whenever the secret rotates.
pub fn write_preamble(workspace: &Path, base_url: &str, secret: &str) -> Result<()> {
    let tools_dir = workspace.join("tools");
    fs::create_dir_all(&tools_dir).map_err(|e| ExecutorErr::workspace(&tools_dir, e))?;
    ensure_package_marker(&tools_dir)?;

    let source = preamble_source(base_url, secret);
    let path = tools_dir.join("_preamble.py");
    write_atomic(&path, &source)?;

    // The preamble holds the bearer secret; keep it to the owner.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| ExecutorErr::workspace(&path, e))?;
    }

    debug!(path = %path.display(), "preamble written");
    Ok(())
}

/// Generates (or regenerates) the module tree for one provider and returns
/// the generated module names. Idempotent: identical tool lists produce
/// byte-identical files.
pub fn generate_provider(
    workspace: &Path,
    provider: &str,
    tools: &[&ToolDecl],
) -> Result<Vec<String>> {
    let provider_module = sanitize_name(provider);
    let provider_dir = workspace.join("tools").join(&provider_module);
    fs::create_dir_all(&provider_dir).map_err(|e| ExecutorErr::workspace(&provider_dir, e))?;

    let mut modules = Vec::with_capacity(tools.len());
    for tool in tools {
        let module_name = sanitize_name(&tool.name);
        let source = tool_module_source(provider, tool);
        write_atomic(&provider_dir.join(format!("{module_name}.py")), &source)?;
        modules.push(module_name);
    }
    modules.sort();
    modules.dedup();

    write_atomic(
        &provider_dir.join("__init__.py"),
        &aggregator_source(provider, &modules),
    )?;
    remove_stale_modules(&provider_dir, &modules)?;

    info!(provider, module_count = modules.len(), "tool modules generated");
    Ok(modules)
}

fn ensure_package_marker(tools_dir: &Path) -> Result<()> {
    let marker = tools_dir.join("__init__.py");
    if !marker.exists() {
        write_atomic(&marker, "")?;
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ExecutorErr::workspace(path, std::io::Error::other("no parent directory")))?;
    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ExecutorErr::workspace(dir, e))?;
    fs::write(tmp.path(), contents).map_err(|e| ExecutorErr::workspace(tmp.path().to_path_buf(), e))?;
    tmp.persist(path)
        .map_err(|e| ExecutorErr::workspace(path, e.error))?;
    Ok(())
}

fn remove_stale_modules(provider_dir: &Path, modules: &[String]) -> Result<()> {
    let entries = fs::read_dir(provider_dir).map_err(|e| ExecutorErr::workspace(provider_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ExecutorErr::workspace(provider_dir, e))?;
        let path: PathBuf = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        if path.extension().and_then(|e| e.to_str()) != Some("py") || stem == "__init__" {
            continue;
        }
        if !modules.iter().any(|m| m == stem) {
            debug!(path = %path.display(), "removing stale tool module");
            fs::remove_file(&path).map_err(|e| ExecutorErr::workspace(&path, e))?;
        }
    }
    Ok(())
}

fn aggregator_source(provider: &str, modules: &[String]) -> String {
    let mut src = String::new();
    let _ = writeln!(
        src,
        "\"\"\"Generated tool modules for provider `{provider}`.\"\"\"\n"
    );
    for module in modules {
        let _ = writeln!(src, "from . import {module}");
    }
    src.push('\n');
    let quoted: Vec<String> = modules.iter().map(|m| format!("\"{m}\"")).collect();
    let _ = writeln!(src, "__all__ = [{}]", quoted.join(", "));
    src
}

fn preamble_source(base_url: &str, secret: &str) -> String {
    format!(
        r#""""Connection parameters and client shim for the session's tool service.

Written by the coordinator at session start and on every reset. Holds this
session's bearer secret; never copy it out of the workspace.
"""

import json
import urllib.request

TOOL_SERVICE_URL = "{base_url}"
TOOL_SERVICE_SECRET = "{secret}"


class ToolCallError(Exception):
    """Raised when a tool call is rejected, times out, or fails."""

    def __init__(self, kind: str, message: str):
        super().__init__(f"{{kind}}: {{message}}")
        self.kind = kind
        self.message = message


def invoke_tool(provider: str, tool: str, args):
    body = json.dumps({{"provider": provider, "tool": tool, "args": args}}).encode("utf-8")
    request = urllib.request.Request(
        TOOL_SERVICE_URL + "/run",
        data=body,
        headers={{
            "Authorization": "Bearer " + TOOL_SERVICE_SECRET,
            "Content-Type": "application/json",
        }},
        method="POST",
    )
    with urllib.request.urlopen(request) as response:
        payload = json.loads(response.read().decode("utf-8"))
    if not payload.get("ok"):
        error = payload.get("error") or {{}}
        raise ToolCallError(error.get("kind", "internal_error"), error.get("message", ""))
    return payload.get("result")
"#
    )
}
