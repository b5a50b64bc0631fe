//! `herald doctor`: config validation and environment checks.
//!
//! Runs a series of checks and prints a structured report with `[ok]`,
//! `[warn]`, `[fail]`, `[skip]`, or `[info]` status indicators per item.

use std::path::Path;

use {
    anyhow::Result,
    herald_config::{
        AuditBackend, HeraldConfig,
        validate::{self, Diagnostic, Severity},
    },
    herald_outbox::{OutboxLimits, SqliteAuditSink},
    herald_telegram::TelegramTransport,
    secrecy::ExposeSecret,
};

// ── ANSI helpers ────────────────────────────────────────────────────────────

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Warn,
    Fail,
    Skip,
    Info,
}

impl Status {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Info => "info",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Ok => GREEN,
            Self::Warn => YELLOW,
            Self::Fail => RED,
            Self::Skip => DIM,
            Self::Info => CYAN,
        }
    }

    fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Error => Self::Fail,
            Severity::Warning => Self::Warn,
            Severity::Info => Self::Info,
        }
    }
}

struct CheckItem {
    status: Status,
    message: String,
}

struct Section {
    title: String,
    items: Vec<CheckItem>,
}

impl Section {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, status: Status, message: impl Into<String>) {
        self.items.push(CheckItem {
            status,
            message: message.into(),
        });
    }

    fn push_diagnostic(&mut self, d: &Diagnostic) {
        let msg = if d.path.is_empty() {
            d.message.clone()
        } else {
            format!("{}: {}", d.path, d.message)
        };
        self.push(Status::from_severity(d.severity), msg);
    }
}

// ── Printing ────────────────────────────────────────────────────────────────

fn print_report(sections: &[Section]) -> (usize, usize) {
    let mut errors = 0usize;
    let mut warnings = 0usize;

    for section in sections {
        eprintln!("{BOLD}{}{RESET}", section.title);
        for item in &section.items {
            let color = item.status.color();
            let label = item.status.label();
            eprintln!("  [{color}{label}{RESET}]  {}", item.message);
            match item.status {
                Status::Fail => errors += 1,
                Status::Warn => warnings += 1,
                _ => {},
            }
        }
        eprintln!();
    }

    (errors, warnings)
}

// ── Entry point ─────────────────────────────────────────────────────────────

pub async fn handle_doctor(config_path: Option<&Path>) -> Result<()> {
    eprintln!("{BOLD}herald doctor{RESET}");
    eprintln!("{BOLD}============={RESET}\n");

    let mut sections = Vec::new();

    // 1. Config validation
    sections.push(check_config(config_path));

    // Load config for subsequent checks (best-effort)
    let config = match config_path {
        Some(path) => herald_config::load_config(path).unwrap_or_default(),
        None => herald_config::discover_and_load(),
    };

    // 2. Telegram
    sections.push(check_telegram(&config).await);

    // 3. Outbox limits
    sections.push(check_outbox(&config));

    // 4. Sources
    sections.push(check_sources(&config));

    // 5. Audit log
    sections.push(check_audit(&config).await);

    let (errors, warnings) = print_report(&sections);

    eprintln!("{BOLD}Summary:{RESET} {errors} error(s), {warnings} warning(s)");

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}

// ── 1. Config validation ────────────────────────────────────────────────────

fn check_config(config_path: Option<&Path>) -> Section {
    let result = validate::validate(config_path);
    let label = result
        .config_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "default config".into());
    let mut section = Section::new(format!("Config ({label})"));

    let syntax: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.category == "syntax")
        .collect();
    if !syntax.is_empty() {
        for d in syntax {
            section.push(Status::Fail, format!("Syntax: {}", d.message));
        }
        // Nothing else is meaningful without a parse.
        return section;
    }
    if result.config_path.is_some() {
        section.push(Status::Ok, "Syntax valid");
    }

    let unknown_fields: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.category == "unknown-field")
        .collect();
    if unknown_fields.is_empty() {
        section.push(Status::Ok, "All fields recognized");
    } else {
        for d in unknown_fields {
            section.push_diagnostic(d);
        }
    }

    let type_errors: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.category == "type-error")
        .collect();
    if type_errors.is_empty() {
        section.push(Status::Ok, "No type errors");
    } else {
        for d in type_errors {
            section.push(Status::Fail, d.message.clone());
        }
    }

    for d in result.diagnostics.iter().filter(|d| {
        !matches!(d.category, "syntax" | "unknown-field" | "type-error")
    }) {
        section.push_diagnostic(d);
    }

    section
}

// ── 2. Telegram ─────────────────────────────────────────────────────────────

async fn check_telegram(config: &HeraldConfig) -> Section {
    let mut section = Section::new("Telegram");

    if config.telegram.dry_run {
        section.push(Status::Info, "dry_run enabled: messages are only logged");
        return section;
    }
    if config.telegram.token.expose_secret().trim().is_empty() {
        section.push(Status::Fail, "No bot token configured");
        return section;
    }

    match TelegramTransport::new(&config.telegram) {
        Ok(transport) => match transport.verify().await {
            Ok(username) => section.push(Status::Ok, format!("Token valid (@{username})")),
            Err(e) => section.push(Status::Fail, format!("getMe failed: {e}")),
        },
        Err(e) => section.push(Status::Fail, format!("Cannot build client: {e}")),
    }

    section
}

// ── 3. Outbox limits ────────────────────────────────────────────────────────

fn check_outbox(config: &HeraldConfig) -> Section {
    let mut section = Section::new("Outbox");

    match OutboxLimits::from_config(&config.outbox) {
        Ok(limits) => {
            section.push(
                Status::Ok,
                format!(
                    "Fragments of at most {} chars, cap {}",
                    limits.split_len, limits.transport_cap
                ),
            );
            section.push(
                Status::Info,
                format!(
                    "Coalesce below {} chars, one send per {} ms ({:?} scope)",
                    limits.combine_threshold,
                    limits.min_send_interval.as_millis(),
                    limits.rate_limit_scope
                ),
            );
        },
        Err(e) => section.push(Status::Fail, e.to_string()),
    }

    section
}

// ── 4. Sources ──────────────────────────────────────────────────────────────

fn check_sources(config: &HeraldConfig) -> Section {
    let mut section = Section::new("Sources");
    let sources = &config.sources;

    if sources.is_empty() {
        section.push(Status::Warn, "No sources configured");
        return section;
    }

    for pg in &sources.postgres {
        section.push(
            Status::Ok,
            format!(
                "postgres -> {}: {} database(s) on channel {}",
                pg.chat_id,
                pg.databases.len(),
                pg.channel
            ),
        );
    }

    for mongo in &sources.mongo {
        let status = if cfg!(feature = "mongo") {
            Status::Ok
        } else {
            Status::Fail
        };
        let suffix = if cfg!(feature = "mongo") {
            ""
        } else {
            " (not compiled in, rebuild with --features mongo)"
        };
        section.push(
            status,
            format!(
                "mongo -> {}: {} database(s){suffix}",
                mongo.chat_id,
                mongo.databases.len()
            ),
        );
    }

    if let Some(kafka) = &sources.kafka {
        let (status, suffix) = if cfg!(feature = "kafka") {
            (Status::Ok, "")
        } else {
            (Status::Fail, " (not compiled in, rebuild with --features kafka)")
        };
        section.push(
            status,
            format!(
                "kafka -> {}: {} broker(s), {} excluded topic(s){suffix}",
                kafka.chat_id,
                kafka.brokers.len(),
                kafka.exclude_topics.len()
            ),
        );
    }

    section
}

// ── 5. Audit log ────────────────────────────────────────────────────────────

async fn check_audit(config: &HeraldConfig) -> Section {
    let mut section = Section::new("Audit");

    match config.audit.backend {
        AuditBackend::Off => section.push(Status::Skip, "Audit disabled"),
        AuditBackend::Tracing => section.push(Status::Info, "Audit events go to the log"),
        AuditBackend::Sqlite => match SqliteAuditSink::connect(&config.audit.database_url).await {
            Ok(sink) => match sink.recent(1).await {
                Ok(_) => section.push(
                    Status::Ok,
                    format!("{} accessible", config.audit.database_url),
                ),
                Err(e) => section.push(Status::Fail, format!("Audit query failed: {e}")),
            },
            Err(e) => section.push(Status::Fail, format!("Cannot open audit database: {e}")),
        },
    }

    section
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    #[test]
    fn status_labels() {
        assert_eq!(Status::Ok.label(), "ok");
        assert_eq!(Status::Warn.label(), "warn");
        assert_eq!(Status::Fail.label(), "fail");
        assert_eq!(Status::Skip.label(), "skip");
        assert_eq!(Status::Info.label(), "info");
    }

    #[test]
    fn print_report_counts_errors_and_warnings() {
        let mut section = Section::new("test");
        section.push(Status::Ok, "fine");
        section.push(Status::Warn, "caution");
        section.push(Status::Warn, "caution2");
        section.push(Status::Fail, "broken");
        section.push(Status::Info, "note");

        let (errors, warnings) = print_report(&[section]);
        assert_eq!(errors, 1);
        assert_eq!(warnings, 2);
    }

    #[test]
    fn default_config_has_no_sources() {
        let section = check_sources(&HeraldConfig::default());
        assert_eq!(section.items.len(), 1);
        assert_eq!(section.items[0].status, Status::Warn);
    }

    #[test]
    fn default_outbox_limits_are_ok() {
        let section = check_outbox(&HeraldConfig::default());
        assert_eq!(section.items[0].status, Status::Ok);
        assert!(section.items[0].message.contains("4090"));
    }

    #[test]
    fn config_errors_are_reported() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[outbox]\nsplit_len = 0\n[telegram]\ndry_run = true").unwrap();

        let section = check_config(Some(file.path()));
        assert!(
            section
                .items
                .iter()
                .any(|i| i.status == Status::Fail && i.message.contains("split_len"))
        );
    }

    #[tokio::test]
    async fn dry_run_skips_token_check() {
        let mut config = HeraldConfig::default();
        config.telegram.dry_run = true;
        let section = check_telegram(&config).await;
        assert_eq!(section.items[0].status, Status::Info);
    }
}
