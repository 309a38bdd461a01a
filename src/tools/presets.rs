//! Ready-made tool collections.

use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{parse_args, FunctionTool, ToolCollection};
use crate::engine::NodeError;
use crate::node::NodeConfig;

#[derive(Debug, Deserialize)]
struct BinaryArgs {
    a: f64,
    b: f64,
}

fn binary_schema(description_a: &str, description_b: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "a": {"type": "number", "description": description_a},
            "b": {"type": "number", "description": description_b}
        },
        "required": ["a", "b"]
    })
}

/// Integral results render without a trailing `.0`.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn binary_tool(
    name: &str,
    description: &str,
    op: fn(f64, f64) -> Result<f64, NodeError>,
) -> FunctionTool {
    FunctionTool::new(
        NodeConfig::new(name).description(description),
        move |args: Map<String, Value>| async move {
            let args: BinaryArgs = parse_args(args)?;
            let result = op(args.a, args.b)?;
            if !result.is_finite() {
                return Err(NodeError::invalid_argument(format!(
                    "result of {} and {} is not a finite number",
                    args.a, args.b
                )));
            }
            Ok(number(result))
        },
    )
    .with_schema(binary_schema("First operand", "Second operand"))
}

/// `add`, `subtract`, `multiply`, `divide`, `power`.
pub fn math_tools() -> ToolCollection {
    ToolCollection::new("math_tools")
        .with_tool(Arc::new(binary_tool("add", "Add two numbers", |a, b| Ok(a + b))))
        .with_tool(Arc::new(binary_tool(
            "subtract",
            "Subtract b from a",
            |a, b| Ok(a - b),
        )))
        .with_tool(Arc::new(binary_tool(
            "multiply",
            "Multiply two numbers",
            |a, b| Ok(a * b),
        )))
        .with_tool(Arc::new(binary_tool("divide", "Divide a by b", |a, b| {
            if b == 0.0 {
                Err(NodeError::invalid_argument("division by zero"))
            } else {
                Ok(a / b)
            }
        })))
        .with_tool(Arc::new(binary_tool(
            "power",
            "Raise a to the power b",
            |a, b| Ok(a.powf(b)),
        )))
}

#[derive(Debug, Deserialize)]
struct NowArgs {
    /// Offset from UTC in hours
    #[serde(default)]
    utc_offset_hours: i32,
}

#[derive(Debug, Deserialize)]
struct DaysBetweenArgs {
    start: String,
    end: String,
}

fn parse_date(raw: &str) -> Result<NaiveDate, NodeError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| NodeError::invalid_argument(format!("expected YYYY-MM-DD, got {:?}: {}", raw, e)))
}

/// `current_time`, `days_between`.
pub fn time_tools() -> ToolCollection {
    let current_time = FunctionTool::new(
        NodeConfig::new("current_time")
            .description("Current date and time, optionally shifted to a UTC offset"),
        |args| async move {
            let args: NowArgs = parse_args(args)?;
            let offset = FixedOffset::east_opt(args.utc_offset_hours * 3600).ok_or_else(|| {
                NodeError::invalid_argument(format!("invalid UTC offset: {}", args.utc_offset_hours))
            })?;
            let now = Utc::now().with_timezone(&offset);
            Ok(json!(now.format("%Y-%m-%d %H:%M:%S %:z").to_string()))
        },
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "utc_offset_hours": {"type": "integer", "description": "Offset from UTC in hours (default 0)"}
        }
    }));

    let days_between = FunctionTool::new(
        NodeConfig::new("days_between").description("Number of days from start to end"),
        |args| async move {
            let args: DaysBetweenArgs = parse_args(args)?;
            let start = parse_date(&args.start)?;
            let end = parse_date(&args.end)?;
            Ok(json!((end - start).num_days()))
        },
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "start": {"type": "string", "description": "Start date, YYYY-MM-DD"},
            "end": {"type": "string", "description": "End date, YYYY-MM-DD"}
        },
        "required": ["start", "end"]
    }));

    ToolCollection::new("time_tools")
        .with_tool(Arc::new(current_time))
        .with_tool(Arc::new(days_between))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::ErrorKind;
    use crate::envelope::{Category, NodeState, Request};
    use crate::registry::MeshBuilder;
    use crate::testing::args;

    async fn run(tool: &str, arguments: Value) -> crate::envelope::Response {
        let mesh = MeshBuilder::new(Config::default())
            .provider(Arc::new(math_tools()))
            .provider(Arc::new(time_tools()))
            .build()
            .await
            .unwrap();
        mesh.invoke(Request::root(tool, Category::Tool, args(arguments)))
            .await
    }

    #[tokio::test]
    async fn test_math_tools() {
        assert_eq!(run("add", json!({"a": 2, "b": 2})).await.output, json!(4));
        assert_eq!(run("divide", json!({"a": 1, "b": 4})).await.output, json!(0.25));
        assert_eq!(run("power", json!({"a": 2, "b": 10})).await.output, json!(1024));
    }

    #[tokio::test]
    async fn test_divide_by_zero_fails_without_retry() {
        let response = run("divide", json!({"a": 1, "b": 0})).await;
        assert_eq!(response.state, NodeState::Failed);
        assert_eq!(response.attempts, 1);
        assert_eq!(response.error_kind(), Some(ErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn test_power_overflow_is_rejected() {
        let response = run("power", json!({"a": 10, "b": 400})).await;
        assert_eq!(response.state, NodeState::Failed);
        assert_eq!(response.attempts, 1);
        assert_eq!(response.error_kind(), Some(ErrorKind::InvalidArgument));
        assert_ne!(response.output, Value::Null);
    }

    #[tokio::test]
    async fn test_days_between() {
        let response = run("days_between", json!({"start": "2024-02-27", "end": "2024-03-01"})).await;
        assert_eq!(response.output, json!(3));
    }

    #[tokio::test]
    async fn test_current_time_has_offset() {
        let response = run("current_time", json!({"utc_offset_hours": 8})).await;
        assert!(response.text().ends_with("+08:00"));
    }
}
