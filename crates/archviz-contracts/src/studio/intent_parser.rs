use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, FLOAT_COMMANDS, INTEGER_COMMANDS, MODELS_COMMAND, NO_ARG_COMMANDS,
    RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS, TOGGLE_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    fn invalid(raw: &str, message: String) -> Self {
        let mut intent = Self::new("invalid", raw);
        intent
            .command_args
            .insert("error".to_string(), Value::String(message));
        intent
    }
}

fn find_spec<'a>(command: &str, specs: &'a [CommandSpec]) -> Option<&'a CommandSpec> {
    specs.iter().find(|spec| spec.command == command)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

fn parse_model_list(arg: &str) -> Vec<String> {
    arg.replace(',', " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn parse_toggle(arg: &str) -> Option<bool> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent
                    .command_args
                    .insert(spec.key.to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(spec) = find_spec(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent.command_args.insert(
                    spec.key.to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(spec) = find_spec(&command, INTEGER_COMMANDS) {
                let Ok(value) = arg.parse::<u64>() else {
                    return Intent::invalid(
                        text,
                        format!("/{command} expects a whole number, got '{arg}'"),
                    );
                };
                let mut intent = Intent::new(spec.action, text);
                intent
                    .settings_update
                    .insert(spec.key.to_string(), Value::Number(value.into()));
                return intent;
            }

            if let Some(spec) = find_spec(&command, FLOAT_COMMANDS) {
                let parsed = arg
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64);
                let Some(value) = parsed else {
                    return Intent::invalid(
                        text,
                        format!("/{command} expects a number, got '{arg}'"),
                    );
                };
                let mut intent = Intent::new(spec.action, text);
                intent
                    .settings_update
                    .insert(spec.key.to_string(), Value::Number(value));
                return intent;
            }

            if let Some(spec) = find_spec(&command, TOGGLE_COMMANDS) {
                let Some(value) = parse_toggle(arg) else {
                    return Intent::invalid(
                        text,
                        format!("/{command} expects on or off, got '{arg}'"),
                    );
                };
                let mut intent = Intent::new(spec.action, text);
                intent
                    .settings_update
                    .insert(spec.key.to_string(), Value::Bool(value));
                return intent;
            }

            if command == MODELS_COMMAND.command {
                let mut intent = Intent::new(MODELS_COMMAND.action, text);
                intent.command_args.insert(
                    MODELS_COMMAND.key.to_string(),
                    Value::Array(
                        parse_model_list(arg)
                            .into_iter()
                            .map(Value::String)
                            .collect(),
                    ),
                );
                return intent;
            }

            if NO_ARG_COMMANDS.iter().any(|value| *value == command) {
                return Intent::new(&command, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("edit_prompt", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
