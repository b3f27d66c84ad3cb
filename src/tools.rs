//! Tool registry: the fixed catalog of calendar tools exposed for discovery
//! and dispatch.
//!
//! Built once at startup and never mutated, so it is shared behind an `Arc`
//! without locking. Declaration order is the order returned by `list_tools`.

use serde_json::{json, Map, Value};

/// Scalar type accepted for a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

impl ToolDefinition {
    fn new(name: &'static str, description: &'static str, params: Vec<ParamSpec>) -> Self {
        Self { name, description, params }
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.iter().filter(|p| p.required)
    }

    /// Required parameters absent from `params`. A JSON `null` counts as absent.
    pub fn missing_params(&self, params: &Map<String, Value>) -> Vec<&'static str> {
        self.required_params()
            .filter(|p| params.get(p.name).is_none_or(Value::is_null))
            .map(|p| p.name)
            .collect()
    }

    /// Discovery record: `{name, description, parameters: {p: {type, description, required}}}`.
    pub fn to_descriptor(&self) -> Value {
        let parameters: Map<String, Value> = self
            .params
            .iter()
            .map(|p| {
                (
                    p.name.to_string(),
                    json!({
                        "type": p.kind.as_str(),
                        "description": p.description,
                        "required": p.required,
                    }),
                )
            })
            .collect();
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": parameters,
        })
    }

    /// JSON Schema form used by the MCP `tools/list` response.
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| {
                (
                    p.name.to_string(),
                    json!({ "type": p.kind.as_str(), "description": p.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self.required_params().map(|p| p.name).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn param(name: &'static str, kind: ParamKind, description: &'static str) -> ParamSpec {
    ParamSpec { name, kind, description, required: false }
}

fn required(name: &'static str, kind: ParamKind, description: &'static str) -> ParamSpec {
    ParamSpec { name, kind, description, required: true }
}

#[derive(Debug)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    /// The reference catalog of eight calendar tools.
    pub fn builtin() -> Self {
        use ParamKind::{Integer, String as Str};

        let calendar_id = || param("calendarId", Str, "Calendar id (defaults to the primary calendar)");

        let tools = vec![
            ToolDefinition::new(
                "list-calendars",
                "List all calendars visible to the authorized account.",
                vec![],
            ),
            ToolDefinition::new(
                "get-calendar",
                "Fetch one calendar by id.",
                vec![required("calendarId", Str, "Calendar id")],
            ),
            ToolDefinition::new(
                "list-events",
                "List events in a time window, recurring events expanded, ordered by start time.",
                vec![
                    calendar_id(),
                    param("timeMin", Str, "Window start (RFC 3339, defaults to start of the reference year)"),
                    param("timeMax", Str, "Window end (RFC 3339, defaults to end of the reference year)"),
                    param("maxResults", Integer, "Maximum number of events (default 10)"),
                ],
            ),
            ToolDefinition::new(
                "get-event",
                "Fetch one event by id.",
                vec![required("eventId", Str, "Event id"), calendar_id()],
            ),
            ToolDefinition::new(
                "create-event",
                "Create a timed event.",
                vec![
                    required("summary", Str, "Event title"),
                    required("start", Str, "Start instant (RFC 3339)"),
                    required("end", Str, "End instant (RFC 3339)"),
                    param("description", Str, "Free-text event description"),
                    calendar_id(),
                ],
            ),
            ToolDefinition::new(
                "update-event",
                "Update the title, start or end of an existing event; omitted fields are left unchanged.",
                vec![
                    required("eventId", Str, "Event id"),
                    param("summary", Str, "New event title"),
                    param("start", Str, "New start instant (RFC 3339)"),
                    param("end", Str, "New end instant (RFC 3339)"),
                    calendar_id(),
                ],
            ),
            ToolDefinition::new(
                "delete-event",
                "Delete an event by id.",
                vec![required("eventId", Str, "Event id"), calendar_id()],
            ),
            ToolDefinition::new(
                "list-colors",
                "Fetch the color palette available for calendars and events.",
                vec![],
            ),
        ];

        Self { tools }
    }

    pub fn list_tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn resolve(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn descriptors(&self) -> Vec<Value> {
        self.tools.iter().map(ToolDefinition::to_descriptor).collect()
    }
}
