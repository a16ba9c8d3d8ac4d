//! Executors backed by external commands, used by the `backfill-api` binary.
//!
//! A command template is split on whitespace into a program and its
//! arguments; `{date}` and `{district}` are substituted per unit. No shell is
//! involved. Exit status conventions:
//!
//! | exit | meaning |
//! |------|---------|
//! | 0    | unit done; each non-empty stdout line is an artifact id |
//! | 75   | source throttled us (`EX_TEMPFAIL`); retryable, rate limited |
//! | else | permanent unit failure carrying the stderr tail |

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{Days, NaiveDate};
use tokio::process::Command;
use tracing::debug;

use super::{AnalyticsGenerator, ExecutorError, SnapshotCollector, UnitFailure};

const EX_TEMPFAIL: i32 = 75;
const STDERR_TAIL: usize = 512;
const ANALYTICS_DIR: &str = "analytics";

/// Parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Result<Self, ExecutorError> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ExecutorError::Enumeration("empty command template".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn render(&self, date: NaiveDate, district: Option<&str>) -> Vec<String> {
        let date = date.format("%Y-%m-%d").to_string();
        let district = district.unwrap_or("");
        self.args
            .iter()
            .map(|a| a.replace("{date}", &date).replace("{district}", district))
            .collect()
    }

    /// Run the command for one unit.
    pub async fn run(
        &self,
        date: NaiveDate,
        district: Option<&str>,
    ) -> Result<Vec<String>, UnitFailure> {
        let args = self.render(date, district);
        debug!(program = %self.program, ?args, "running unit command");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| UnitFailure::fatal(format!("failed to spawn {}: {e}", self.program)))?;

        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Some(EX_TEMPFAIL) => Err(UnitFailure::rate_limited(format!(
                "{} reported throttling: {}",
                self.program,
                stderr_tail(&output.stderr)
            ))),
            code => Err(UnitFailure::fatal(format!(
                "{} exited with {}: {}",
                self.program,
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr_tail(&output.stderr)
            ))),
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL - 1)
        .map_or(0, |(i, _)| i);
    text[start..].to_string()
}

fn snapshot_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(date.format("%Y-%m-%d").to_string())
}

/// Collects snapshots by running a command per date.
#[derive(Debug, Clone)]
pub struct CommandCollector {
    template: CommandTemplate,
    snapshot_dir: PathBuf,
    history_days: Option<u32>,
}

impl CommandCollector {
    pub fn new(template: CommandTemplate, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            template,
            snapshot_dir: snapshot_dir.into(),
            history_days: None,
        }
    }

    /// Bound how far back the source serves data.
    pub fn with_history_days(mut self, days: Option<u32>) -> Self {
        self.history_days = days;
        self
    }
}

#[async_trait::async_trait]
impl SnapshotCollector for CommandCollector {
    async fn collect(&self, date: NaiveDate) -> Result<Vec<String>, UnitFailure> {
        self.template.run(date, None).await
    }

    async fn snapshot_exists(&self, date: NaiveDate) -> Result<bool, UnitFailure> {
        tokio::fs::try_exists(snapshot_path(&self.snapshot_dir, date))
            .await
            .map_err(|e| UnitFailure::retryable(format!("cannot inspect snapshot dir: {e}")))
    }

    fn earliest_available(&self, today: NaiveDate) -> Option<NaiveDate> {
        self.history_days
            .and_then(|days| today.checked_sub_days(Days::new(u64::from(days))))
    }
}

/// Generates analytics by running a command per snapshot (and district).
#[derive(Debug, Clone)]
pub struct CommandAnalytics {
    template: CommandTemplate,
    snapshot_dir: PathBuf,
}

impl CommandAnalytics {
    pub fn new(template: CommandTemplate, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            template,
            snapshot_dir: snapshot_dir.into(),
        }
    }
}

#[async_trait::async_trait]
impl AnalyticsGenerator for CommandAnalytics {
    async fn snapshot_dates(&self) -> Result<Vec<NaiveDate>, ExecutorError> {
        list_snapshot_dates(&self.snapshot_dir).await
    }

    async fn generate(
        &self,
        date: NaiveDate,
        district: Option<&str>,
    ) -> Result<Vec<String>, UnitFailure> {
        self.template.run(date, district).await
    }

    async fn analytics_exist(
        &self,
        date: NaiveDate,
        district: Option<&str>,
    ) -> Result<bool, UnitFailure> {
        let mut path = snapshot_path(&self.snapshot_dir, date).join(ANALYTICS_DIR);
        if let Some(d) = district {
            path = path.join(d);
        }
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| UnitFailure::retryable(format!("cannot inspect snapshot dir: {e}")))
    }
}

/// Dates of the `YYYY-MM-DD` entries under `dir`, ascending. A missing
/// directory means no snapshots yet.
pub async fn list_snapshot_dates(dir: &Path) -> Result<Vec<NaiveDate>, ExecutorError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ExecutorError::Enumeration(format!(
                "cannot list {}: {e}",
                dir.display()
            )));
        }
    };

    let mut dates = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name();
                if let Some(date) = name
                    .to_str()
                    .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())
                {
                    dates.push(date);
                }
            }
            Ok(None) => break,
            Err(e) => {
                return Err(ExecutorError::Enumeration(format!(
                    "cannot list {}: {e}",
                    dir.display()
                )));
            }
        }
    }
    dates.sort();
    Ok(dates)
}
