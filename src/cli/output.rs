//! Output formatting for CLI commands.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::cli::args::{ChatSearchArgs, OutputFormat};
use crate::context::UserId;
use crate::index::version::IndexHealth;
use crate::search::query::SearchResult;
use crate::user_config::UserConfigRecord;

/// Result of an `index` or `rebuild` run.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexingSummary {
    pub user_id: UserId,
    pub indexed: usize,
    pub skipped: usize,
    pub rotations: usize,
    pub batches: usize,
    pub duration_ms: u64,
    pub messages_per_second: f64,
}

/// Result of a search.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResults {
    pub user_id: UserId,
    pub query: String,
    pub hits: Vec<SearchResult>,
    pub duration_ms: u64,
}

/// A user's config record, or why there is none.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigOutput {
    pub user_id: UserId,
    pub status: ConfigStatus,
    pub record: Option<UserConfigRecord>,
}

/// Whether a config record was present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    /// The config document did not exist and was created empty.
    Created,
    /// The document exists without a record for this user.
    Missing,
    Found,
    Updated,
}

/// Result of a free-space check.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpaceCheckOutput {
    pub path: Option<String>,
    pub ok: bool,
    pub free_bytes: Option<u64>,
    pub error: Option<String>,
}

/// Result of a wipe.
#[derive(Debug, Serialize, Deserialize)]
pub struct WipeOutput {
    pub user_id: UserId,
}

/// Types with a human-readable rendering.
pub trait HumanOutput {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Output a result in the format selected on the command line.
pub fn output_result<T>(message: &str, result: &T, args: &ChatSearchArgs) -> anyhow::Result<()>
where
    T: Serialize + HumanOutput,
{
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.output_format {
        OutputFormat::Human => output_human(&mut out, message, result, args)?,
        OutputFormat::Json => output_json(&mut out, result, args)?,
    }
    Ok(())
}

fn output_human<T: HumanOutput>(
    out: &mut dyn Write,
    message: &str,
    result: &T,
    args: &ChatSearchArgs,
) -> io::Result<()> {
    if args.verbosity() > 1 {
        writeln!(out, "{message}")?;
        writeln!(out)?;
    }
    result.write_human(out)
}

fn output_json<T: Serialize>(
    out: &mut dyn Write,
    result: &T,
    args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    writeln!(out, "{json}")?;
    Ok(())
}

impl HumanOutput for IndexingSummary {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "User {}:", self.user_id)?;
        writeln!(out, "  Indexed:   {}", self.indexed)?;
        writeln!(out, "  Skipped:   {}", self.skipped)?;
        writeln!(out, "  Rotations: {}", self.rotations)?;
        writeln!(out, "  Batches:   {}", self.batches)?;
        writeln!(
            out,
            "  Took {}ms ({:.1} messages/s)",
            self.duration_ms, self.messages_per_second
        )
    }
}

impl HumanOutput for SearchResults {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.hits.is_empty() {
            writeln!(out, "No messages match {:?}", self.query)?;
            return Ok(());
        }

        writeln!(out, "Search Results:")?;
        writeln!(out, "═══════════════")?;
        for (i, hit) in self.hits.iter().enumerate() {
            writeln!(
                out,
                "{:>3}. {} (seq {}, segment {}, score {:.3})",
                i + 1,
                hit.message_id,
                hit.seq,
                hit.segment_id,
                hit.score
            )?;
        }
        writeln!(out)?;
        writeln!(out, "Total hits: {}", self.hits.len())?;
        writeln!(out, "Search time: {}ms", self.duration_ms)
    }
}

impl HumanOutput for ConfigOutput {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        match (&self.status, &self.record) {
            (ConfigStatus::Created, _) => {
                writeln!(out, "No config file yet; created an empty one")
            }
            (_, None) => writeln!(out, "No config record for user {}", self.user_id),
            (status, Some(record)) => {
                if *status == ConfigStatus::Updated {
                    writeln!(out, "Updated config of user {}", record.user_id)?;
                } else {
                    writeln!(out, "Config of user {}", record.user_id)?;
                }
                writeln!(out, "  Rotation id:   {}", record.rotation_id)?;
                writeln!(out, "  Version:       {}", record.version)?;
                writeln!(out, "  Language:      {}", record.language)?;
                writeln!(out, "  Index version: {}", record.index_version)
            }
        }
    }
}

impl HumanOutput for SpaceCheckOutput {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        let path = self.path.as_deref().unwrap_or("<none>");
        match (self.ok, self.free_bytes) {
            (true, Some(free)) => {
                writeln!(out, "{path}: OK, {} free", format_bytes(free))
            }
            (true, None) => writeln!(out, "{path}: OK"),
            (false, _) => writeln!(
                out,
                "{path}: FAILED, {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

impl HumanOutput for IndexHealth {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Index of user {}:", self.user_id)?;
        writeln!(out, "  State:          {:?}", self.state)?;
        writeln!(
            out,
            "  Index version:  {} (expected {})",
            self.index_version.as_deref().unwrap_or("-"),
            self.schema_version
        )?;
        writeln!(out, "  Rotation id:    {}", self.rotation_id)?;
        writeln!(out, "  Segments:       {}", self.segment_count)?;
        writeln!(out, "  Messages:       {}", self.message_count)
    }
}

impl HumanOutput for WipeOutput {
    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Wiped index and config of user {}", self.user_id)
    }
}

/// Format bytes in human-readable format.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::version::IndexState;

    fn render<T: HumanOutput>(value: &T) -> String {
        let mut buf = Vec::new();
        value.write_human(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(300 * 1024 * 1024), "300.0 MB");
        assert_eq!(format_bytes(1073741824), "1.0 GB");
    }

    #[test]
    fn test_search_results_human() {
        let results = SearchResults {
            user_id: 7,
            query: "lunch".to_string(),
            hits: vec![SearchResult {
                message_id: "m3".to_string(),
                seq: 3,
                segment_id: 1,
                score: 1.5,
            }],
            duration_ms: 2,
        };
        let text = render(&results);
        assert!(text.contains("1. m3 (seq 3, segment 1, score 1.500)"));
        assert!(text.contains("Total hits: 1"));

        let empty = SearchResults {
            hits: Vec::new(),
            ..results
        };
        assert!(render(&empty).contains("No messages match"));
    }

    #[test]
    fn test_config_output_human() {
        let missing = ConfigOutput {
            user_id: 7,
            status: ConfigStatus::Missing,
            record: None,
        };
        assert_eq!(render(&missing), "No config record for user 7\n");

        let created = ConfigOutput {
            user_id: 7,
            status: ConfigStatus::Created,
            record: None,
        };
        assert!(render(&created).contains("created an empty one"));
    }

    #[test]
    fn test_space_check_human() {
        let failed = SpaceCheckOutput {
            path: None,
            ok: false,
            free_bytes: None,
            error: Some("Please provide path".to_string()),
        };
        assert_eq!(render(&failed), "<none>: FAILED, Please provide path\n");
    }

    #[test]
    fn test_health_human_and_json() {
        let health = IndexHealth {
            user_id: 7,
            state: IndexState::Current,
            index_version: Some("v1".to_string()),
            rotation_id: 2,
            segment_count: 3,
            message_count: 10,
            schema_version: "v1".to_string(),
        };
        assert!(render(&health).contains("State:          Current"));

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["rotationId"], 2);
    }
}
