//! MCP tool-call server over stdio.
//!
//! JSON-RPC 2.0, one message per line. stdout carries protocol frames only;
//! all logging goes to stderr. The bridge is started on the first tool call
//! and shut down when stdin closes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use pob_bridge::bridge::FramedLineReader;
use pob_bridge::{Bridge, BridgeConfig, BridgeError, JsonMap};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const JSONRPC_VERSION: &str = "2.0";

const INSTRUCTIONS: &str = "Tools for creating, modifying, and analyzing Path of Exile 2 builds \
                            using the Path of Building calculation engine";

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct McpRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpRpcError>,
}

impl McpResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: McpRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpRpcError {
    pub code: i32,
    pub message: String,
}

impl McpRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(-32600, format!("Invalid request: {detail}"))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(-32602, detail)
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(-32603, detail)
    }
}

mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

// ---------------------------------------------------------------------------
// Tool catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgType {
    Integer,
    String,
    StringList,
    /// String, number or boolean.
    Scalar,
}

#[derive(Debug, Clone)]
struct ArgSpec {
    name: &'static str,
    ty: ArgType,
    description: &'static str,
    required: bool,
    default: Option<Value>,
}

fn required(name: &'static str, ty: ArgType, description: &'static str) -> ArgSpec {
    ArgSpec {
        name,
        ty,
        description,
        required: true,
        default: None,
    }
}

fn optional(name: &'static str, ty: ArgType, description: &'static str, default: Option<Value>) -> ArgSpec {
    ArgSpec {
        name,
        ty,
        description,
        required: false,
        default,
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    name: &'static str,
    description: &'static str,
    args: Vec<ArgSpec>,
}

impl ToolSpec {
    fn new(name: &'static str, description: &'static str, args: Vec<ArgSpec>) -> Self {
        Self {
            name,
            description,
            args,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn input_schema(&self) -> Value {
        let mut properties = JsonMap::new();
        let mut required = Vec::new();
        for arg in &self.args {
            let mut prop = match arg.ty {
                ArgType::Integer => json!({ "type": "integer" }),
                ArgType::String => json!({ "type": "string" }),
                ArgType::StringList => json!({ "type": "array", "items": { "type": "string" } }),
                ArgType::Scalar => json!({ "type": ["string", "number", "boolean"] }),
            };
            prop["description"] = Value::String(arg.description.to_string());
            if let Some(default) = &arg.default {
                prop["default"] = default.clone();
            }
            properties.insert(arg.name.to_string(), prop);
            if arg.required {
                required.push(arg.name);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema(),
        })
    }
}

/// Every tool the server exposes.
pub fn catalog() -> Vec<ToolSpec> {
    use ArgType::*;

    let sub_path = || optional("sub_path", String, "Subdirectory within the builds folder", Some(json!("")));

    vec![
        // Build
        ToolSpec::new(
            "new_build",
            "Create a new empty build. This resets all skills, items, and tree allocations.",
            vec![],
        ),
        ToolSpec::new(
            "load_build_xml",
            "Load a build from its XML representation.",
            vec![
                required("xml", String, "The full build XML content, as exported from Path of Building"),
                optional("name", String, "A name for the build", Some(json!("Imported Build"))),
            ],
        ),
        ToolSpec::new(
            "get_build_info",
            "Get current build information including class, level, and ascendancy.",
            vec![],
        ),
        ToolSpec::new(
            "export_build_xml",
            "Export the current build as XML that can be shared or imported into Path of Building.",
            vec![],
        ),
        // Tree
        ToolSpec::new(
            "alloc_node",
            "Allocate a passive tree node by its ID, along with any nodes on the path to it.",
            vec![required("node_id", Integer, "Numeric ID of the passive tree node")],
        ),
        ToolSpec::new(
            "dealloc_node",
            "Deallocate a passive tree node. Dependent nodes are also deallocated.",
            vec![required("node_id", Integer, "Numeric ID of the passive tree node")],
        ),
        ToolSpec::new(
            "get_allocated_nodes",
            "List all currently allocated passive tree nodes.",
            vec![],
        ),
        ToolSpec::new(
            "search_nodes",
            "Search for passive tree nodes by name.",
            vec![
                required("query", String, "Text to search for in node names (case-insensitive)"),
                optional("max_results", Integer, "Maximum number of results", Some(json!(30))),
            ],
        ),
        ToolSpec::new(
            "get_node_info",
            "Get detailed information about a specific passive tree node.",
            vec![required("node_id", Integer, "Numeric ID of the passive tree node")],
        ),
        // Items
        ToolSpec::new("list_items", "List all items currently in the build.", vec![]),
        ToolSpec::new(
            "get_item_details",
            "Get full data for an item in the build: base stats, quality, mods and slot.",
            vec![required("item_id", Integer, "ID of the item (from list_items)")],
        ),
        ToolSpec::new(
            "search_base_items",
            "Search for item base types (e.g. \"Greathelm\", \"Staff\").",
            vec![
                required("query", String, "Text to search for in base item names (case-insensitive)"),
                optional("item_type", String, "Filter by item type, e.g. \"Helmet\"", None),
                optional("max_results", Integer, "Maximum number of results", Some(json!(50))),
            ],
        ),
        ToolSpec::new(
            "get_base_item_types",
            "List all available item base type categories (e.g. Helmet, Staff, Amulet).",
            vec![],
        ),
        ToolSpec::new(
            "get_base_item_details",
            "Get detailed information about a specific base item.",
            vec![required("name", String, "Exact name of the base item, e.g. \"Rusted Greathelm\"")],
        ),
        ToolSpec::new(
            "search_unique_items",
            "Search for unique items by name or base type.",
            vec![
                required("query", String, "Text to search for in unique item names (case-insensitive)"),
                optional("item_type", String, "Filter by item type, e.g. \"helmet\"", None),
                optional("max_results", Integer, "Maximum number of results", Some(json!(50))),
            ],
        ),
        ToolSpec::new(
            "get_unique_item_details",
            "Get detailed information about a specific unique item.",
            vec![required("name", String, "Exact name of the unique item")],
        ),
        ToolSpec::new(
            "add_item",
            "Add an item to the build from its in-game copy-paste text.",
            vec![
                required("item_raw", String, "Item text in the game's copy-paste format"),
                optional("slot", String, "Equipment slot to equip it to, e.g. \"Ring 1\"", None),
            ],
        ),
        ToolSpec::new(
            "equip_item",
            "Equip an existing item to a specific equipment slot.",
            vec![
                required("item_id", Integer, "ID of the item (from list_items)"),
                required("slot", String, "Equipment slot name, e.g. \"Body Armour\""),
            ],
        ),
        ToolSpec::new(
            "list_slots",
            "List all equipment slots and what is equipped in them.",
            vec![],
        ),
        // Skills
        ToolSpec::new("list_skills", "List all skill gem groups in the build.", vec![]),
        ToolSpec::new(
            "add_skill",
            "Add a skill gem group in paste format: an optional \"Label: ...\" line, then \
             one \"GemName level/quality [count]\" line per gem.",
            vec![required("skill_text", String, "Skill group in paste format")],
        ),
        ToolSpec::new(
            "set_main_skill",
            "Set which skill gem group is the main skill for DPS calculations.",
            vec![required("index", Integer, "1-based index of the skill group (from list_skills)")],
        ),
        // Calculations
        ToolSpec::new(
            "get_stats",
            "Get calculated build statistics (DPS, life, resistances, ...). Without keys, \
             returns a curated set of important stats.",
            vec![optional("keys", StringList, "Specific stat keys, e.g. [\"TotalDPS\", \"Life\"]", None)],
        ),
        ToolSpec::new(
            "get_full_stats",
            "Get the complete calculation output. This can be very large.",
            vec![],
        ),
        ToolSpec::new(
            "get_stat",
            "Get a single stat value from the full calculation output.",
            vec![required("key", String, "Stat key name, e.g. \"TotalDPS\"")],
        ),
        ToolSpec::new(
            "get_stats_list",
            "Get several stat values from the calculation output in one call.",
            vec![required("keys", StringList, "Stat key names")],
        ),
        // Config
        ToolSpec::new(
            "set_config",
            "Set a configuration option for the build (enemy type, conditions, ...).",
            vec![
                required("key", String, "Configuration key, e.g. \"enemyIsBoss\""),
                required("value", Scalar, "Value to set"),
            ],
        ),
        ToolSpec::new(
            "set_custom_mods",
            "Set custom modifiers on the build, one modifier per line.",
            vec![required("mods", String, "Custom modifier text, one modifier per line")],
        ),
        // Files
        ToolSpec::new(
            "list_builds",
            "List saved builds with their metadata.",
            vec![sub_path()],
        ),
        ToolSpec::new(
            "load_build_file",
            "Load a build from its file path.",
            vec![required("path", String, "Full path to the build .xml file")],
        ),
        ToolSpec::new("save_build", "Save the current build to its existing file.", vec![]),
        ToolSpec::new(
            "save_build_as",
            "Save the current build to a new file.",
            vec![
                required("name", String, "Name for the new build file, without .xml"),
                sub_path(),
            ],
        ),
        ToolSpec::new(
            "delete_build_file",
            "Delete a build file.",
            vec![required("path", String, "Full path to the build .xml file")],
        ),
        ToolSpec::new(
            "create_builds_folder",
            "Create a subfolder in the builds directory.",
            vec![required("name", String, "Name for the new folder"), sub_path()],
        ),
        ToolSpec::new(
            "rename_build_file",
            "Rename a build file.",
            vec![
                required("old_path", String, "Full path to the current build file"),
                required("new_name", String, "New name for the file, without .xml"),
            ],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tool arguments
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ToolError {
    /// Bad or missing argument; reported as a JSON-RPC error.
    InvalidArgument(String),
    /// The bridge failed; reported as a tool result with `isError`.
    Bridge(BridgeError),
}

impl From<BridgeError> for ToolError {
    fn from(err: BridgeError) -> Self {
        Self::Bridge(err)
    }
}

struct Args<'a>(&'a JsonMap);

impl<'a> Args<'a> {
    fn present(&self, key: &str) -> Option<&'a Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn missing(key: &str) -> ToolError {
        ToolError::InvalidArgument(format!("missing required argument '{key}'"))
    }

    fn wrong_type(key: &str, expected: &str) -> ToolError {
        ToolError::InvalidArgument(format!("argument '{key}' must be {expected}"))
    }

    fn opt_str(&self, key: &str) -> Result<Option<&'a str>, ToolError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(Self::wrong_type(key, "a string")),
        }
    }

    fn str(&self, key: &str) -> Result<&'a str, ToolError> {
        self.opt_str(key)?.ok_or_else(|| Self::missing(key))
    }

    fn str_or(&self, key: &str, default: &'a str) -> Result<&'a str, ToolError> {
        Ok(self.opt_str(key)?.unwrap_or(default))
    }

    fn opt_int(&self, key: &str) -> Result<Option<i64>, ToolError> {
        match self.present(key) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| Self::wrong_type(key, "an integer")),
        }
    }

    fn int(&self, key: &str) -> Result<i64, ToolError> {
        self.opt_int(key)?.ok_or_else(|| Self::missing(key))
    }

    fn int_or(&self, key: &str, default: i64) -> Result<i64, ToolError> {
        Ok(self.opt_int(key)?.unwrap_or(default))
    }

    fn opt_str_list(&self, key: &str) -> Result<Option<Vec<String>>, ToolError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
                .map(Some)
                .ok_or_else(|| Self::wrong_type(key, "a list of strings")),
            Some(_) => Err(Self::wrong_type(key, "a list of strings")),
        }
    }

    fn str_list(&self, key: &str) -> Result<Vec<String>, ToolError> {
        self.opt_str_list(key)?.ok_or_else(|| Self::missing(key))
    }

    fn scalar(&self, key: &str) -> Result<&'a Value, ToolError> {
        match self.present(key) {
            None => Err(Self::missing(key)),
            Some(v @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => Ok(v),
            Some(_) => Err(Self::wrong_type(key, "a string, number or boolean")),
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn pretty_map(map: &JsonMap) -> String {
    serde_json::to_string_pretty(map).unwrap_or_default()
}

/// Strings unquoted, everything else as JSON.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_or(result: &JsonMap, key: &str, fallback: &str) -> String {
    result
        .get(key)
        .filter(|v| !v.is_null())
        .map(plain)
        .unwrap_or_else(|| fallback.to_string())
}

fn is_truthy(value: Option<&Value>) -> bool {
    value.is_some_and(pob_bridge::bridge::envelope::is_truthy)
}

/// Pretty-print `result[key]` as a list, or `empty` when it is missing or empty.
fn list_or(result: &JsonMap, key: &str, empty: &str) -> String {
    match result.get(key) {
        Some(Value::Array(items)) if !items.is_empty() => pretty(&Value::Array(items.clone())),
        Some(Value::Object(map)) if !map.is_empty() => pretty_map(map),
        _ => empty.to_string(),
    }
}

fn format_stat(key: &str, result: &JsonMap) -> String {
    if !is_truthy(result.get("found")) {
        return format!("Stat '{key}' not found.");
    }
    let value = result.get("value").unwrap_or(&Value::Null);
    if result.get("type").and_then(Value::as_str) == Some("table") {
        let table = if value.is_object() { value.clone() } else { json!({}) };
        return format!(
            "{key} (table with {} entries): {}",
            text_or(result, "table_size", "?"),
            pretty(&table)
        );
    }
    format!("{key}: {}", plain(value))
}

fn format_stats_list(result: &JsonMap) -> String {
    let mut output = vec![format!(
        "Retrieved {}/{} stats:\n",
        text_or(result, "found_count", "0"),
        text_or(result, "count", "0")
    )];

    if let Some(Value::Object(found)) = result.get("found") {
        for (key, data) in found {
            let value = data.get("value").unwrap_or(&Value::Null);
            if data.get("type").and_then(Value::as_str) == Some("table") {
                let table = if value.is_object() { value.clone() } else { json!({}) };
                output.push(format!("{key} (table): {}", pretty(&table)));
            } else {
                output.push(format!("{key}: {}", plain(value)));
            }
        }
    }

    let not_found: Vec<String> = match result.get("not_found") {
        Some(Value::Array(keys)) => keys.iter().map(plain).collect(),
        _ => Vec::new(),
    };
    if !not_found.is_empty() {
        output.push(format!("\nNot found: {}", not_found.join(", ")));
    }
    output.join("\n")
}

fn format_builds(result: &JsonMap) -> String {
    let empty = Vec::new();
    let as_list = |key: &str| match result.get(key) {
        Some(Value::Array(items)) => items,
        _ => &empty,
    };
    let folders = as_list("folders");
    let builds = as_list("builds");

    let mut output = Vec::new();
    if !folders.is_empty() {
        output.push("Folders:".to_string());
        for folder in folders {
            output.push(format!("  📁 {}", folder.get("name").map(plain).unwrap_or_default()));
        }
        output.push(String::new());
    }

    if builds.is_empty() {
        output.push("No builds found.".to_string());
    } else {
        output.push("Builds:".to_string());
        for build in builds {
            let text = |key: &str| build.get(key).filter(|v| !v.is_null()).map(plain);
            let mut class_info = String::new();
            if let Some(class) = text("className").filter(|c| !c.is_empty()) {
                class_info = format!(" ({class}");
                if let Some(ascend) = text("ascendClassName").filter(|a| !a.is_empty()) {
                    class_info.push_str(&format!(" / {ascend}"));
                }
                class_info.push_str(&format!(", Level {})", text("level").unwrap_or_default()));
            }
            output.push(format!("  📄 {}{class_info}", text("name").unwrap_or_default()));
        }
    }
    output.join("\n")
}

/// `repr`-style rendering for config values: strings quoted.
fn quoted(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tool execution
// ---------------------------------------------------------------------------

fn params(value: Value) -> Option<JsonMap> {
    match value {
        Value::Object(map) if !map.is_empty() => Some(map),
        _ => None,
    }
}

async fn call(bridge: &Bridge, command: &str, value: Value) -> Result<JsonMap, ToolError> {
    Ok(bridge.call(command, params(value)).await?)
}

/// Run one tool and render its text result.
async fn run_tool(bridge: &Bridge, name: &str, args: &Args<'_>) -> Result<String, ToolError> {
    let text = match name {
        // Build
        "new_build" => {
            call(bridge, "new_build", Value::Null).await?;
            "New build created successfully.".to_string()
        }
        "load_build_xml" => {
            let xml = args.str("xml")?;
            let name = args.str_or("name", "Imported Build")?;
            call(bridge, "load_build_xml", json!({ "xml": xml, "name": name })).await?;
            let info = call(bridge, "get_build_info", Value::Null).await?;
            format!("Build loaded: {}\n{}", text_or(&info, "buildName", name), pretty_map(&info))
        }
        "get_build_info" => pretty_map(&call(bridge, "get_build_info", Value::Null).await?),
        "export_build_xml" => {
            let result = call(bridge, "get_build_xml", Value::Null).await?;
            text_or(&result, "xml", "")
        }

        // Tree
        "alloc_node" => {
            let node_id = args.int("node_id")?;
            let result = call(bridge, "alloc_node", json!({ "node_id": node_id })).await?;
            if is_truthy(result.get("already_allocated")) {
                format!("Node {node_id} was already allocated.")
            } else {
                format!("Node {node_id} allocated successfully.")
            }
        }
        "dealloc_node" => {
            let node_id = args.int("node_id")?;
            let result = call(bridge, "dealloc_node", json!({ "node_id": node_id })).await?;
            if is_truthy(result.get("already_deallocated")) {
                format!("Node {node_id} was already deallocated.")
            } else {
                format!("Node {node_id} deallocated successfully.")
            }
        }
        "get_allocated_nodes" => {
            let result = call(bridge, "list_alloc_nodes", Value::Null).await?;
            list_or(&result, "nodes", "No nodes are currently allocated.")
        }
        "search_nodes" => {
            let query = args.str("query")?;
            let max_results = args.int_or("max_results", 30)?;
            let result = call(
                bridge,
                "search_nodes",
                json!({ "query": query, "max_results": max_results }),
            )
            .await?;
            list_or(&result, "nodes", &format!("No nodes found matching '{query}'."))
        }
        "get_node_info" => {
            let node_id = args.int("node_id")?;
            pretty_map(&call(bridge, "get_node_info", json!({ "node_id": node_id })).await?)
        }

        // Items
        "list_items" => {
            let result = call(bridge, "list_items", Value::Null).await?;
            list_or(&result, "items", "No items in the build.")
        }
        "get_item_details" => {
            let item_id = args.int("item_id")?;
            pretty_map(&call(bridge, "get_item_details", json!({ "item_id": item_id })).await?)
        }
        "search_base_items" | "search_unique_items" => {
            let query = args.str("query")?;
            let max_results = args.int_or("max_results", 50)?;
            let mut p = json!({ "query": query, "max_results": max_results });
            if let Some(item_type) = args.opt_str("item_type")?.filter(|t| !t.is_empty()) {
                p["type"] = json!(item_type);
            }
            let result = call(bridge, name, p).await?;
            if name == "search_base_items" {
                list_or(&result, "items", &format!("No base items found matching '{query}'."))
            } else {
                list_or(&result, "uniques", &format!("No unique items found matching '{query}'."))
            }
        }
        "get_base_item_types" => {
            let result = call(bridge, "get_base_item_types", Value::Null).await?;
            list_or(&result, "types", "No item types found.")
        }
        "get_base_item_details" | "get_unique_item_details" => {
            let item = args.str("name")?;
            pretty_map(&call(bridge, name, json!({ "name": item })).await?)
        }
        "add_item" => {
            let item_raw = args.str("item_raw")?;
            let slot = args.opt_str("slot")?.filter(|s| !s.is_empty());
            let mut p = json!({ "item_raw": item_raw });
            if let Some(slot) = slot {
                p["slot"] = json!(slot);
            }
            let result = call(bridge, "add_item", p).await?;
            let mut msg = format!("Item added (ID: {}).", text_or(&result, "item_id", "?"));
            if let Some(slot) = slot {
                msg.push_str(&format!(" Equipped to {slot}."));
            }
            msg
        }
        "equip_item" => {
            let item_id = args.int("item_id")?;
            let slot = args.str("slot")?;
            call(bridge, "equip_item", json!({ "item_id": item_id, "slot": slot })).await?;
            format!("Item {item_id} equipped to {slot}.")
        }
        "list_slots" => {
            let result = call(bridge, "list_slots", Value::Null).await?;
            pretty(result.get("slots").unwrap_or(&json!([])))
        }

        // Skills
        "list_skills" => {
            let result = call(bridge, "list_skills", Value::Null).await?;
            list_or(&result, "skills", "No skills in the build.")
        }
        "add_skill" => {
            let skill_text = args.str("skill_text")?;
            let result = call(bridge, "add_skill", json!({ "skill_text": skill_text })).await?;
            format!(
                "Skill group added at index {} with {} gems.",
                text_or(&result, "index", "?"),
                text_or(&result, "gem_count", "?")
            )
        }
        "set_main_skill" => {
            let index = args.int("index")?;
            if index < 1 {
                return Err(ToolError::InvalidArgument("argument 'index' must be at least 1".into()));
            }
            call(bridge, "set_main_skill", json!({ "index": index })).await?;
            format!("Main skill set to group {index}.")
        }

        // Calculations
        "get_stats" => {
            let keys = args.opt_str_list("keys")?.filter(|k| !k.is_empty());
            let p = match keys {
                Some(keys) => json!({ "stats": keys }),
                None => Value::Null,
            };
            pretty_map(&call(bridge, "get_output", p).await?)
        }
        "get_full_stats" => pretty_map(&call(bridge, "get_full_output", Value::Null).await?),
        "get_stat" => {
            let key = args.str("key")?;
            format_stat(key, &call(bridge, "get_stat", json!({ "key": key })).await?)
        }
        "get_stats_list" => {
            let keys = args.str_list("keys")?;
            format_stats_list(&call(bridge, "get_stats_list", json!({ "keys": keys })).await?)
        }

        // Config
        "set_config" => {
            let key = args.str("key")?;
            let value = args.scalar("value")?;
            call(bridge, "set_config", json!({ "key": key, "value": value })).await?;
            format!("Config '{key}' set to {}.", quoted(value))
        }
        "set_custom_mods" => {
            let mods = args.str("mods")?;
            call(bridge, "set_custom_mods", json!({ "mods": mods })).await?;
            "Custom mods applied.".to_string()
        }

        // Files
        "list_builds" => {
            let sub_path = args.str_or("sub_path", "")?;
            format_builds(&call(bridge, "list_builds", json!({ "sub_path": sub_path })).await?)
        }
        "load_build_file" => {
            let path = args.str("path")?;
            call(bridge, "load_build_file", json!({ "path": path })).await?;
            let info = call(bridge, "get_build_info", Value::Null).await?;
            format!(
                "Build loaded: {}\nClass: {} (Level {})",
                text_or(&info, "buildName", "Unknown"),
                text_or(&info, "className", "Unknown"),
                text_or(&info, "level", "Unknown")
            )
        }
        "save_build" => {
            call(bridge, "save_build", Value::Null).await?;
            "Build saved successfully.".to_string()
        }
        "save_build_as" => {
            let file_name = args.str("name")?;
            let sub_path = args.str_or("sub_path", "")?;
            let result = call(
                bridge,
                "save_build_as",
                json!({ "name": file_name, "sub_path": sub_path }),
            )
            .await?;
            format!("Build saved as: {}", text_or(&result, "path", "Unknown"))
        }
        "delete_build_file" => {
            let path = args.str("path")?;
            call(bridge, "delete_build_file", json!({ "path": path })).await?;
            format!("Build file deleted: {path}")
        }
        "create_builds_folder" => {
            let folder = args.str("name")?;
            let sub_path = args.str_or("sub_path", "")?;
            let result = call(
                bridge,
                "create_folder",
                json!({ "name": folder, "sub_path": sub_path }),
            )
            .await?;
            format!("Folder created: {}", text_or(&result, "path", "Unknown"))
        }
        "rename_build_file" => {
            let old_path = args.str("old_path")?;
            let new_name = args.str("new_name")?;
            let result = call(
                bridge,
                "rename_build_file",
                json!({ "old_path": old_path, "new_name": new_name }),
            )
            .await?;
            format!("Build renamed to: {}", text_or(&result, "new_path", "Unknown"))
        }

        other => {
            return Err(ToolError::InvalidArgument(format!("Unknown tool: {other}")));
        }
    };
    Ok(text)
}

fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Tool-call server state: the bridge plus the tool catalog.
pub struct McpServer<'a> {
    bridge: &'a Bridge,
    tools: Vec<ToolSpec>,
}

impl<'a> McpServer<'a> {
    pub fn new(bridge: &'a Bridge) -> Self {
        Self {
            bridge,
            tools: catalog(),
        }
    }

    /// Handle one incoming line. Returns `None` for notifications.
    pub async fn handle_message(&self, line: &str) -> Option<McpResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "unparseable MCP message");
                return Some(McpResponse::error(Value::Null, McpRpcError::parse_error()));
            }
        };
        let id_hint = value.get("id").cloned().unwrap_or(Value::Null);
        let request: McpRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return Some(McpResponse::error(id_hint, McpRpcError::invalid_request(e)));
            }
        };

        let Some(id) = request.id else {
            self.handle_notification(&request.method);
            return None;
        };

        let outcome = match request.method.as_str() {
            methods::INITIALIZE => Ok(self.initialize_result()),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(json!({
                "tools": self.tools.iter().map(ToolSpec::to_json).collect::<Vec<_>>(),
            })),
            methods::TOOLS_CALL => self.handle_tool_call(request.params).await,
            other => Err(McpRpcError::method_not_found(other)),
        };
        Some(match outcome {
            Ok(result) => McpResponse::success(id, result),
            Err(error) => McpResponse::error(id, error),
        })
    }

    fn handle_notification(&self, method: &str) {
        match method {
            methods::INITIALIZED => info!("MCP client initialized"),
            methods::CANCELLED => debug!("ignoring cancellation; tool calls are not interruptible"),
            other => debug!(method = other, "ignoring unknown notification"),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": "pob-server",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "instructions": INSTRUCTIONS,
        })
    }

    async fn handle_tool_call(&self, params: Option<Value>) -> Result<Value, McpRpcError> {
        let params = params.unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err(McpRpcError::invalid_params("tools/call requires a tool 'name'"));
        };
        if !self.tools.iter().any(|tool| tool.name() == name) {
            return Err(McpRpcError::invalid_params(format!("Unknown tool: {name}")));
        }
        let empty = JsonMap::new();
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(McpRpcError::invalid_params("tool 'arguments' must be an object"));
            }
        };

        if let Err(e) = self.bridge.ensure_running().await {
            warn!(tool = name, error = %e, "bridge unavailable");
            return Ok(tool_result(format!("Error: {e}"), true));
        }

        debug!(tool = name, "calling tool");
        match run_tool(self.bridge, name, &Args(arguments)).await {
            Ok(text) => Ok(tool_result(text, false)),
            Err(ToolError::InvalidArgument(msg)) => Err(McpRpcError::invalid_params(msg)),
            Err(ToolError::Bridge(e)) => {
                warn!(tool = name, error = %e, "tool call failed");
                Ok(tool_result(format!("Error: {e}"), true))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve MCP on this process's stdio, then shut the bridge down.
pub async fn run_mcp(config: BridgeConfig) -> Result<()> {
    let bridge = Bridge::new(config);
    info!("starting MCP server on stdio");
    let result = serve_stdio(&bridge, tokio::io::stdin(), tokio::io::stdout()).await;
    let report = bridge.shutdown().await;
    debug!(?report, "bridge shutdown report");
    result
}

/// Read requests from `input` until it closes, writing responses to `output`.
pub async fn serve_stdio<R, W>(bridge: &Bridge, input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let server = McpServer::new(bridge);
    let mut lines = FramedLineReader::new(BufReader::new(input));

    while let Some(line) = lines.next_line().await.context("failed to read MCP input")? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(response) = server.handle_message(&line).await else {
            continue;
        };
        let mut frame = match serde_json::to_string(&response) {
            Ok(frame) => frame,
            Err(e) => serde_json::to_string(&McpResponse::error(
                response.id.clone(),
                McpRpcError::internal_error(e.to_string()),
            ))
            .context("failed to encode MCP error response")?,
        };
        frame.push('\n');
        output
            .write_all(frame.as_bytes())
            .await
            .context("failed to write MCP response")?;
        output.flush().await.context("failed to flush MCP response")?;
    }

    info!("MCP input closed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
