//! `${VAR}` / `${VAR:-default}` expansion over a raw config document (spec
//! §6: "Environment-variable overrides using `${VAR}` expansion"), applied
//! to the text before `serde_yaml` ever sees it so every string leaf in the
//! document is eligible, not just fields the config schema special-cases.

use std::borrow::Cow;

use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("static pattern"));

/// Replaces every `${VAR}` or `${VAR:-default}` occurrence in `input` with
/// the named environment variable's value, or the default if the variable
/// is unset. A reference to an unset variable with no default is left as an
/// empty string rather than erroring, matching the forgiving substitution
/// shells themselves perform for unset variables.
pub fn expand(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;
    for caps in PLACEHOLDER.captures_iter(input) {
        let whole = caps.get(0).expect("group 0 always matches");
        out.push_str(&input[last_end..whole.start()]);
        let name = &caps[1];
        let default = caps.get(3).map(|m| m.as_str());
        let value: Cow<str> = match lookup(name) {
            Some(v) => Cow::Owned(v),
            None => Cow::Borrowed(default.unwrap_or("")),
        };
        out.push_str(&value);
        last_end = whole.end();
    }
    out.push_str(&input[last_end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_set_variable() {
        let out = expand_with("port: ${PORT}", |name| (name == "PORT").then(|| "9090".to_string()));
        assert_eq!(out, "port: 9090");
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        let out = expand_with("host: ${HOST:-localhost}", |_| None);
        assert_eq!(out, "host: localhost");
    }

    #[test]
    fn unset_without_default_becomes_empty() {
        let out = expand_with("token: ${TOKEN}", |_| None);
        assert_eq!(out, "token: ");
    }

    #[test]
    fn leaves_non_placeholder_text_untouched() {
        let out = expand_with("plain: value, not ${A}, ${B:-ok}", |name| (name == "A").then(|| "x".to_string()));
        assert_eq!(out, "plain: value, not x, ok");
    }
}
