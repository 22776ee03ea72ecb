//! Folds condition, hit count and log message into one action script.

use crate::errors::BreakpointError;

use super::BreakpointOptions;

/// Builds the action script block body for a breakpoint.
///
/// Returns `None` when the breakpoint should simply stop. `next_counter`
/// supplies a session-unique suffix for the hit counter variable and is only
/// called when a hit count is present.
pub(crate) fn build_action(
    options: &BreakpointOptions,
    next_counter: impl FnOnce() -> u64,
) -> Result<Option<String>, BreakpointError> {
    let hit_count = non_blank(options.hit_condition.as_deref())
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| BreakpointError::InvalidHitCount {
                    value: value.to_owned(),
                })
        })
        .transpose()?;
    let condition = non_blank(options.condition.as_deref());
    let log_message = options
        .log_message
        .as_deref()
        .filter(|message| !message.trim().is_empty());

    if hit_count.is_none() && condition.is_none() && log_message.is_none() {
        return Ok(None);
    }

    let mut body = match log_message {
        Some(message) => format!(
            "Microsoft.PowerShell.Utility\\Write-Host \"{}\"",
            interpolate_log_message(message)
        ),
        None => String::from("break"),
    };
    if let Some(count) = hit_count {
        let counter = next_counter();
        body = format!(
            "if (++$global:__psEditBreakHitCounter{counter} -eq {count}) {{ {body} }}"
        );
    }
    if let Some(condition) = condition {
        body = format!("if ({condition}) {{ {body} }}");
    }
    Ok(Some(body))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Turns `{expr}` into `$(expr)` inside a double-quoted string and escapes
/// everything else. An unmatched brace is kept literally.
pub(crate) fn interpolate_log_message(message: &str) -> String {
    let mut output = String::with_capacity(message.len() + 8);
    let mut rest = message;
    while let Some(open) = rest.find('{') {
        push_escaped(&mut output, &rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                output.push_str("$(");
                output.push_str(&after[..close]);
                output.push(')');
                rest = &after[close + 1..];
            }
            None => {
                output.push('{');
                rest = after;
            }
        }
    }
    push_escaped(&mut output, rest);
    output
}

fn push_escaped(output: &mut String, text: &str) {
    for character in text.chars() {
        if matches!(character, '`' | '"' | '$') {
            output.push('`');
        }
        output.push(character);
    }
}
