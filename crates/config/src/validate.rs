//! Configuration validation engine.
//!
//! Validates configuration files against the known schema, detects
//! unknown/misspelled fields and reports limit combinations the outbox
//! cannot honor.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use {secrecy::ExposeSecret, serde_json::Value};

use crate::{env_subst::substitute_env, schema::HeraldConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "limits",
    /// "telegram", "sources", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "outbox.split_len"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

/// Expected shape of the configuration.
enum KnownKeys {
    /// A struct with fixed field names.
    Struct(HashMap<&'static str, KnownKeys>),
    /// An array of typed items.
    Array(Box<KnownKeys>),
    /// Scalar value, stop recursion.
    Leaf,
}

/// Build the schema map mirroring every field in `schema.rs`.
fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Struct};

    let leaves = |keys: &[&'static str]| Struct(keys.iter().map(|k| (*k, Leaf)).collect());

    let postgres = Struct(HashMap::from([
        ("chat_id", Leaf),
        ("channel", Leaf),
        ("install_triggers", Leaf),
        (
            "databases",
            Array(Box::new(leaves(&["url", "database", "thread_id"]))),
        ),
    ]));

    let mongo = Struct(HashMap::from([
        ("chat_id", Leaf),
        (
            "databases",
            Array(Box::new(leaves(&["uri", "database", "thread_id"]))),
        ),
    ]));

    Struct(HashMap::from([
        (
            "telegram",
            leaves(&[
                "token",
                "dry_run",
                "request_timeout_secs",
                "retry_after_max_retries",
                "plain_text_fallback",
            ]),
        ),
        (
            "outbox",
            leaves(&[
                "combine_threshold",
                "split_len",
                "transport_cap",
                "min_send_interval_ms",
                "rate_limit_scope",
                "tick_interval_ms",
                "open_fence",
                "close_fence",
                "enqueue_wait_retries",
                "enqueue_wait_step_ms",
                "flush_timeout_secs",
            ]),
        ),
        ("redaction", leaves(&["max_field_len"])),
        ("audit", leaves(&["backend", "database_url"])),
        ("metrics", leaves(&["enabled", "listen"])),
        (
            "sources",
            Struct(HashMap::from([
                ("postgres", Array(Box::new(postgres))),
                ("mongo", Array(Box::new(mongo))),
                (
                    "kafka",
                    leaves(&[
                        "brokers",
                        "group_id",
                        "client_id",
                        "chat_id",
                        "thread_id",
                        "exclude_topics",
                        "from_beginning",
                    ]),
                ),
            ])),
        ),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

/// Levenshtein edit distance between two strings, in chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let b_len = b_chars.len();
    if a.is_empty() {
        return b_len;
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(content) => {
            let ext = actual_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("toml");
            validate_str(&content, ext)
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate a TOML string without touching the file system.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    validate_str(toml_str, "toml")
}

/// Validate config text in the format named by `extension`.
#[must_use]
pub fn validate_str(raw: &str, extension: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();
    let raw = substitute_env(raw);

    // 1. Syntax
    let value = match parse_value(&raw, extension) {
        Ok(v) => v,
        Err(message) => {
            diagnostics.push(Diagnostic::new(Severity::Error, "syntax", "", message));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    // 2. Unknown fields
    check_unknown_fields(&value, &build_schema_map(), "", &mut diagnostics);

    // 3. Types, then semantics on a config that deserializes
    match serde_json::from_value::<HeraldConfig>(value) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn parse_value(raw: &str, extension: &str) -> Result<Value, String> {
    match extension {
        "toml" => {
            let v: toml::Value =
                toml::from_str(raw).map_err(|e| format!("TOML syntax error: {e}"))?;
            serde_json::to_value(v).map_err(|e| e.to_string())
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value =
                serde_yaml::from_str(raw).map_err(|e| format!("YAML syntax error: {e}"))?;
            serde_json::to_value(v).map_err(|e| e.to_string())
        },
        "json" => serde_json::from_str(raw).map_err(|e| format!("JSON syntax error: {e}")),
        other => Err(format!("unsupported config format: .{other}")),
    }
}

/// Walk the value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (Value::Object(table), KnownKeys::Struct(fields)) => {
            let known_keys: Vec<&str> = fields.keys().copied().collect();
            for (key, child_value) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                    continue;
                }
                let level = if prefix.is_empty() {
                    " at top level"
                } else {
                    ""
                };
                let message = match suggest(key, &known_keys, 3) {
                    Some(s) => format!("unknown field{level} (did you mean \"{s}\"?)"),
                    None => format!("unknown field{level}"),
                };
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "unknown-field",
                    path,
                    message,
                ));
            }
        },
        (Value::Array(arr), KnownKeys::Array(item_schema)) => {
            for (i, item) in arr.iter().enumerate() {
                let path = format!("{prefix}[{i}]");
                check_unknown_fields(item, item_schema, &path, diagnostics);
            }
        },
        // Leaf or type mismatch, type errors are caught later.
        _ => {},
    }
}

/// Run semantic checks on a successfully parsed config.
fn check_semantics(config: &HeraldConfig, diagnostics: &mut Vec<Diagnostic>) {
    let outbox = &config.outbox;
    let open = outbox.open_fence.chars().count();
    let close = outbox.close_fence.chars().count();

    if outbox.split_len == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "limits",
            "outbox.split_len",
            "split_len must be greater than zero",
        ));
    }
    if open + close >= outbox.transport_cap {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "limits",
            "outbox.transport_cap",
            format!(
                "fences ({} chars) leave no room for text under transport_cap {}",
                open + close,
                outbox.transport_cap
            ),
        ));
    } else if outbox.split_len + close > outbox.transport_cap {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "limits",
            "outbox.split_len",
            format!(
                "split_len {} plus close_fence exceeds transport_cap {}; fragments will be \
                 shortened to fit",
                outbox.split_len, outbox.transport_cap
            ),
        ));
    }
    if outbox.combine_threshold > outbox.split_len {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "limits",
            "outbox.combine_threshold",
            "combine_threshold above split_len makes coalesced entries split on send",
        ));
    }
    if outbox.min_send_interval_ms == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "limits",
            "outbox.min_send_interval_ms",
            "no minimum send interval; Telegram will rate-limit bursts",
        ));
    }
    if outbox.tick_interval_ms == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "limits",
            "outbox.tick_interval_ms",
            "tick_interval_ms must be greater than zero",
        ));
    }

    if !config.telegram.dry_run && config.telegram.token.expose_secret().trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "telegram",
            "telegram.token",
            "bot token is empty (set it or enable dry_run)",
        ));
    }

    check_sources(config, diagnostics);
}

fn check_sources(config: &HeraldConfig, diagnostics: &mut Vec<Diagnostic>) {
    let sources = &config.sources;
    if sources.is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "sources",
            "sources",
            "no sources configured; nothing will be relayed",
        ));
    }

    for (i, pg) in sources.postgres.iter().enumerate() {
        let path = format!("sources.postgres[{i}]");
        check_chat_id(&pg.chat_id, &path, diagnostics);
        if !is_pg_identifier(&pg.channel) {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "sources",
                format!("{path}.channel"),
                format!("\"{}\" is not a valid LISTEN channel name", pg.channel),
            ));
        }
        if pg.databases.is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "sources",
                format!("{path}.databases"),
                "no databases listed",
            ));
        }
    }

    for (i, mongo) in sources.mongo.iter().enumerate() {
        let path = format!("sources.mongo[{i}]");
        check_chat_id(&mongo.chat_id, &path, diagnostics);
        if mongo.databases.is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "sources",
                format!("{path}.databases"),
                "no databases listed",
            ));
        }
    }

    if let Some(kafka) = &sources.kafka {
        check_chat_id(&kafka.chat_id, "sources.kafka", diagnostics);
        if kafka.brokers.is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "sources",
                "sources.kafka.brokers",
                "at least one broker is required",
            ));
        }
    }
}

fn check_chat_id(chat_id: &str, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    if chat_id.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "sources",
            format!("{path}.chat_id"),
            "chat_id is empty",
        ));
    }
}

/// Unquoted Postgres identifier: ASCII letter or `_`, then letters, digits or `_`.
#[must_use]
pub fn is_pg_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    const MINIMAL: &str = r#"
[telegram]
token = "123:abc"

[[sources.postgres]]
chat_id = -100
[[sources.postgres.databases]]
url = "postgres://localhost/app"
database = "app"
"#;

    fn find<'a>(result: &'a ValidationResult, category: &str, path: &str) -> Option<&'a Diagnostic> {
        result
            .diagnostics
            .iter()
            .find(|d| d.category == category && d.path == path)
    }

    #[rstest]
    #[case("hello", "hello", 0)]
    #[case("", "abc", 3)]
    #[case("abc", "", 3)]
    #[case("outbox", "outbx", 1)]
    #[case("split_len", "split_lne", 2)]
    #[case("żółw", "zółw", 1)]
    fn levenshtein_distances(#[case] a: &str, #[case] b: &str, #[case] expected: usize) {
        assert_eq!(levenshtein(a, b), expected);
    }

    #[test]
    fn minimal_config_is_clean() {
        let result = validate_toml_str(MINIMAL);
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        assert_eq!(result.count(Severity::Warning), 0, "{:?}", result.diagnostics);
    }

    #[test]
    fn unknown_top_level_key_with_suggestion() {
        let result = validate_toml_str("outbx = 1\n");
        let d = find(&result, "unknown-field", "outbx").expect("unknown-field diagnostic");
        assert_eq!(d.severity, Severity::Error);
        assert!(d.message.contains("\"outbox\""), "{}", d.message);
        assert!(d.message.contains("top level"));
    }

    #[test]
    fn unknown_nested_key_in_array_item() {
        let toml = r#"
[[sources.postgres]]
chat_id = 1
chanel = "x"
"#;
        let result = validate_toml_str(toml);
        let d = find(&result, "unknown-field", "sources.postgres[0].chanel").expect("diagnostic");
        assert!(d.message.contains("channel"));
    }

    #[test]
    fn syntax_error_stops_early() {
        let result = validate_toml_str("[outbox\n");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn type_error_is_reported() {
        let result = validate_toml_str("[outbox]\nsplit_len = \"big\"\n");
        assert!(result.diagnostics.iter().any(|d| d.category == "type-error"));
    }

    #[test]
    fn empty_token_without_dry_run_is_error() {
        let result = validate_toml_str("[outbox]\n");
        assert!(find(&result, "telegram", "telegram.token").is_some());

        let result = validate_toml_str("[telegram]\ndry_run = true\n");
        assert!(find(&result, "telegram", "telegram.token").is_none());
    }

    #[test]
    fn fences_larger_than_cap_is_error() {
        let toml = format!("{MINIMAL}\n[outbox]\ntransport_cap = 8\n");
        let result = validate_toml_str(&toml);
        let d = find(&result, "limits", "outbox.transport_cap").expect("diagnostic");
        assert_eq!(d.severity, Severity::Error);
    }

    #[test]
    fn combine_threshold_above_split_warns() {
        let toml = format!("{MINIMAL}\n[outbox]\ncombine_threshold = 5000\n");
        let result = validate_toml_str(&toml);
        let d = find(&result, "limits", "outbox.combine_threshold").expect("diagnostic");
        assert_eq!(d.severity, Severity::Warning);
    }

    #[rstest]
    #[case("tbl_changes", true)]
    #[case("_x1", true)]
    #[case("1abc", false)]
    #[case("tbl-changes", false)]
    #[case("", false)]
    fn pg_channel_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(is_pg_identifier(name), ok);
    }

    #[test]
    fn no_sources_warns() {
        let result = validate_toml_str("[telegram]\ntoken = \"t\"\n");
        let d = find(&result, "sources", "sources").expect("diagnostic");
        assert_eq!(d.severity, Severity::Warning);
    }

    #[test]
    fn kafka_without_brokers_is_error() {
        let toml = "[telegram]\ntoken = \"t\"\n[sources.kafka]\nbrokers = []\nchat_id = 5\n";
        let result = validate_toml_str(toml);
        assert!(find(&result, "sources", "sources.kafka.brokers").is_some());
    }

    #[test]
    fn yaml_is_validated_too() {
        let yaml = "telegram:\n  dry_run: true\n  tokn: x\n";
        let result = validate_str(yaml, "yaml");
        assert!(find(&result, "unknown-field", "telegram.tokn").is_some());
    }

    #[test]
    fn validate_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let result = validate(Some(&path));
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
        assert!(!result.has_errors());
    }
}
