//! Agent stdout parser.
//!
//! With `--output-format json` the agent prints one JSON object with the
//! final text, session id, token usage and cost. Anything that is not such an
//! object is kept verbatim; a parse failure is never an error.

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub text: String,
    pub session_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub cost_usd: Option<f64>,
}

pub fn parse_output(stdout: &str) -> ParsedOutput {
    let raw = || ParsedOutput {
        text: stdout.to_string(),
        ..ParsedOutput::default()
    };
    let Ok(Value::Object(json)) = serde_json::from_str::<Value>(stdout) else {
        return raw();
    };

    let text = match json.get("result") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => stdout.to_string(),
    };
    let session_id = json
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let tokens_used = json.get("usage").filter(|u| u.is_object()).map(|usage| {
        let count = |key: &str| usage.get(key).and_then(Value::as_i64).unwrap_or(0);
        count("input_tokens") + count("output_tokens")
    });
    // newer agent builds report total_cost_usd
    let cost_usd = json
        .get("cost_usd")
        .or_else(|| json.get("total_cost_usd"))
        .and_then(Value::as_f64);

    ParsedOutput {
        text,
        session_id,
        tokens_used,
        cost_usd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn full_result_object() {
        let parsed = parse_output(
            r#"{"result":"done","session_id":"abc","usage":{"input_tokens":10,"output_tokens":5},"cost_usd":0.0123}"#,
        );
        assert_eq!(
            parsed,
            ParsedOutput {
                text: "done".into(),
                session_id: Some("abc".into()),
                tokens_used: Some(15),
                cost_usd: Some(0.0123),
            }
        );
    }

    #[rstest]
    #[case::plain_text("hello world")]
    #[case::empty("")]
    #[case::truncated_json(r#"{"result": "do"#)]
    #[case::json_array("[1, 2, 3]")]
    fn non_object_output_is_kept_raw(#[case] stdout: &str) {
        let parsed = parse_output(stdout);
        assert_eq!(parsed.text, stdout);
        assert_eq!(parsed.session_id, None);
        assert_eq!(parsed.tokens_used, None);
        assert_eq!(parsed.cost_usd, None);
    }

    #[test]
    fn object_without_result_keeps_raw_stdout() {
        let stdout = r#"{"session_id":"s1","is_error":true}"#;
        let parsed = parse_output(stdout);
        assert_eq!(parsed.text, stdout);
        assert_eq!(parsed.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn missing_usage_addends_count_as_zero() {
        let parsed = parse_output(r#"{"result":"x","usage":{"output_tokens":7}}"#);
        assert_eq!(parsed.tokens_used, Some(7));
        assert_eq!(parse_output(r#"{"result":"x"}"#).tokens_used, None);
    }

    #[test]
    fn total_cost_is_accepted() {
        let parsed = parse_output(r#"{"result":"x","total_cost_usd":1.5}"#);
        assert_eq!(parsed.cost_usd, Some(1.5));
    }

    #[test]
    fn surrounding_whitespace_is_fine() {
        let parsed = parse_output("\n  {\"result\":\"ok\"}\n");
        assert_eq!(parsed.text, "ok");
    }
}
