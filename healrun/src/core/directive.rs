//! Validation of model replies into typed [`ActionDirective`]s.
//!
//! Each parser accepts exactly one directive kind. A reply that is missing a
//! field or carries an unsupported value is rejected as a whole with an
//! [`ExtractionError`]; callers recover by re-prompting.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;

use super::extract::{extract_command_list, extract_fields, extract_root, fields_of};
use super::json_repair::parse_json_reply;
use super::types::{ActionDirective, Guidance, GuidanceAction, StepAction, StepResult, WriteFile};

static ANSWER_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    compile_schema(include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../schemas/reply/answer.v1.schema.json"
    )))
});

static STEP_RESULT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    compile_schema(include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../schemas/reply/step_result.v1.schema.json"
    )))
});

fn compile_schema(raw: &str) -> Validator {
    let schema: Value = serde_json::from_str(raw).unwrap();
    jsonschema::validator_for(&schema).unwrap()
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("reply contains no usable <{0}> block")]
    NoBlock(&'static str),
    #[error("reply is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("reply failed schema validation: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("reply is missing `{0}`")]
    MissingField(&'static str),
    #[error("`{field}` has unsupported value {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("command list is empty")]
    EmptyCommandList,
}

/// The directive kinds a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Answer,
    CommandList,
    Guidance,
    WriteFile,
    StepResult,
}

/// Parse `reply` as the requested kind.
pub fn parse_directive(kind: DirectiveKind, reply: &str) -> Result<ActionDirective, ExtractionError> {
    Ok(match kind {
        DirectiveKind::Answer => ActionDirective::Answer {
            text: parse_answer(reply)?,
        },
        DirectiveKind::CommandList => ActionDirective::CommandList {
            commands: parse_command_list(reply)?,
        },
        DirectiveKind::Guidance => ActionDirective::Guidance(parse_guidance(reply)?),
        DirectiveKind::WriteFile => ActionDirective::WriteFile(parse_write_file(reply)?),
        DirectiveKind::StepResult => ActionDirective::StepResult(parse_step_result(reply)?),
    })
}

fn check_schema(validator: &Validator, value: &Value) -> Result<(), ExtractionError> {
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(ExtractionError::Schema(messages))
    }
}

/// A JSON object `{"response": ..., "action": "answer"}`, or a
/// `<root><response>` block when the reply carries no JSON.
pub fn parse_answer(reply: &str) -> Result<String, ExtractionError> {
    let value = match parse_json_reply(reply) {
        Ok(value) => value,
        Err(err) => {
            let fields = extract_fields(reply);
            return match fields.get("response").map(|r| r.trim()) {
                Some(response) if !response.is_empty() => Ok(response.to_string()),
                _ => Err(ExtractionError::InvalidJson(err)),
            };
        }
    };
    check_schema(&ANSWER_VALIDATOR, &value)?;
    let response = value["response"].as_str().unwrap_or_default().trim();
    if response.is_empty() {
        return Err(ExtractionError::MissingField("response"));
    }
    Ok(response.to_string())
}

/// Every `<command>` of the reply block. At least one non-empty command is required.
pub fn parse_command_list(reply: &str) -> Result<Vec<String>, ExtractionError> {
    if extract_root(reply).is_none() {
        return Err(ExtractionError::NoBlock("commands"));
    }
    let commands = extract_command_list(reply);
    if commands.is_empty() {
        return Err(ExtractionError::EmptyCommandList);
    }
    if let Some(blank) = commands.iter().position(|command| command.is_empty()) {
        return Err(ExtractionError::InvalidValue {
            field: "command",
            value: format!("<empty entry {blank}>"),
        });
    }
    Ok(commands)
}

/// Remediation advice: `action` is `command` or `patch`, `response` explains
/// it, and `command` is required for the command action.
///
/// Markup replies are preferred; a flat JSON object with the same keys is
/// accepted too.
pub fn parse_guidance(reply: &str) -> Result<Guidance, ExtractionError> {
    let fields = reply_fields(reply)?;
    let action = required_field(&fields, "action")?.to_ascii_lowercase();
    let response = required_field(&fields, "response")?.to_string();
    let action = match action.as_str() {
        "command" => GuidanceAction::Command {
            command: required_field(&fields, "command")?.to_string(),
        },
        "patch" => GuidanceAction::Patch,
        _ => {
            return Err(ExtractionError::InvalidValue {
                field: "action",
                value: action,
            });
        }
    };
    Ok(Guidance { action, response })
}

/// A single file: `fileName` plus `content`, from markup or JSON.
pub fn parse_write_file(reply: &str) -> Result<WriteFile, ExtractionError> {
    let fields = reply_fields(reply)?;
    write_file_from(&fields)
}

/// Every `<file>` child of a `<files>` block, in document order.
pub fn parse_write_files(reply: &str) -> Result<Vec<WriteFile>, ExtractionError> {
    let root = extract_root(reply).ok_or(ExtractionError::NoBlock("files"))?;
    let files = root
        .children_named("file")
        .map(|file| write_file_from(&fields_of(file)))
        .collect::<Result<Vec<_>, _>>()?;
    if files.is_empty() {
        return Err(ExtractionError::MissingField("file"));
    }
    Ok(files)
}

fn write_file_from(fields: &BTreeMap<String, String>) -> Result<WriteFile, ExtractionError> {
    let file_name = required_field(fields, "fileName")?.to_string();
    let content = fields
        .get("content")
        .ok_or(ExtractionError::MissingField("content"))?;
    Ok(WriteFile {
        file_name,
        content: content.strip_prefix('\n').unwrap_or(content).to_string(),
    })
}

/// One agent step, validated against the step-result schema.
pub fn parse_step_result(reply: &str) -> Result<StepResult, ExtractionError> {
    let value = parse_json_reply(reply)?;
    check_schema(&STEP_RESULT_VALIDATOR, &value)?;
    let step: StepResult = serde_json::from_value(value)?;
    if step.action == StepAction::WriteFile && step.file_name.trim().is_empty() {
        return Err(ExtractionError::MissingField("fileName"));
    }
    Ok(step)
}

/// Child fields of the reply's tagged block, or the string members of a JSON
/// object when the reply has no block.
fn reply_fields(reply: &str) -> Result<BTreeMap<String, String>, ExtractionError> {
    if let Some(root) = extract_root(reply) {
        return Ok(fields_of(&root));
    }
    match parse_json_reply(reply) {
        Ok(Value::Object(map)) => Ok(map
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::String(text) => Some((key, text)),
                _ => None,
            })
            .collect()),
        _ => Err(ExtractionError::NoBlock("root")),
    }
}

fn required_field<'a>(
    fields: &'a BTreeMap<String, String>,
    name: &'static str,
) -> Result<&'a str, ExtractionError> {
    match fields.get(name).map(|value| value.trim()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ExtractionError::MissingField(name)),
    }
}
