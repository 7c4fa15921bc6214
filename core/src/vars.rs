//! `${VAR}` substitution for provider spec environment values.
//!
//! Values in a provider spec's `env` and `headers` maps may reference
//! variables of the coordinator's own environment. Substitution happens at
//! session-start time; references that resolve to nothing are collected and
//! reported as a startup error rather than silently passed through.

use std::collections::BTreeSet;
use std::collections::HashMap;

/// Outcome of one substitution pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub replaced: HashMap<String, String>,
    pub replaced_variables: BTreeSet<String>,
    pub missing_variables: BTreeSet<String>,
}

/// Replaces `${NAME}` references in every value of `template` with entries
/// from `variables`. Unknown references are left in place and recorded in
/// `missing_variables`.
pub fn replace_variables(
    template: &HashMap<String, String>,
    variables: &HashMap<String, String>,
) -> ReplaceOutcome {
    let mut outcome = ReplaceOutcome::default();
    for (key, value) in template {
        let replaced = replace_in_str(value, variables, &mut outcome);
        outcome.replaced.insert(key.clone(), replaced);
    }
    outcome
}

/// Substitution against the coordinator's process environment.
pub fn replace_from_process_env(template: &HashMap<String, String>) -> ReplaceOutcome {
    let env: HashMap<String, String> = std::env::vars().collect();
    replace_variables(template, &env)
}

fn replace_in_str(
    value: &str,
    variables: &HashMap<String, String>,
    outcome: &mut ReplaceOutcome,
) -> String {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_var_name(&after[..end]) => {
                let name = &after[..end];
                match variables.get(name) {
                    Some(replacement) => {
                        result.push_str(replacement);
                        outcome.replaced_variables.insert(name.to_string());
                    }
                    None => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                        outcome.missing_variables.insert(name.to_string());
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                // Not a well-formed reference; emit literally and move on.
                result.push_str("${");
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
