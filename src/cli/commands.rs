//! Command implementations for the chatsearch CLI.
//!
//! Every command goes through a supervised worker, the same way an embedding
//! host would use the library.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, bail};
use log::{debug, info, warn};

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::SearchConfig;
use crate::core::SearchCoreFactory;
use crate::index::message::Message;
use crate::index::writer::IndexReport;
use crate::search::query::SearchQuery;
use crate::supervisor::{SearchClient, Supervisor};
use crate::user_config::{ConfigLookup, UserConfigPatch};

/// Execute a CLI command.
pub fn execute_command(args: ChatSearchArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        let client = Supervisor::spawn(
            SearchCoreFactory::new(config.clone()),
            config.supervisor.clone(),
        );
        let outcome = run(&client, &config, &args).await;
        client.shutdown().await;
        outcome
    })
}

/// Build the effective configuration from the file and overrides.
pub fn load_config(args: &ChatSearchArgs) -> anyhow::Result<SearchConfig> {
    let mut config = match &args.config {
        Some(path) => SearchConfig::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => SearchConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.paths.user_data_dir = dir.clone();
    }
    config.validate()?;
    debug!(
        "Using data directory {}",
        config.paths.user_data_dir.display()
    );
    Ok(config)
}

async fn run(
    client: &SearchClient,
    config: &SearchConfig,
    args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    match &args.command {
        Command::Index(index_args) => index_messages(client, index_args, args).await,
        Command::Search(search_args) => search_messages(client, search_args, args).await,
        Command::Config(ConfigCommand::Get(user)) => get_config(client, user, args).await,
        Command::Config(ConfigCommand::Set(set)) => set_config(client, set, args).await,
        Command::CheckSpace(space_args) => check_space(client, config, space_args, args).await,
        Command::Health(user) => show_health(client, user, args).await,
        Command::Rebuild(rebuild_args) => rebuild_index(client, rebuild_args, args).await,
        Command::Wipe(user) => wipe_user(client, user, args).await,
    }
}

/// Index messages in batches.
async fn index_messages(
    client: &SearchClient,
    index_args: &IndexArgs,
    cli_args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    if index_args.batch_size == 0 {
        bail!("batch size must be greater than zero");
    }
    let messages = read_messages(&index_args.messages_file)?;
    info!(
        "Indexing {} messages for user {}",
        messages.len(),
        index_args.user_id
    );

    let start_time = Instant::now();
    let mut total = IndexReport::default();
    let mut batches = 0;
    for chunk in messages.chunks(index_args.batch_size) {
        let report = client
            .index_batch(index_args.user_id, chunk.to_vec())
            .await
            .with_context(|| format!("batch {} failed", batches + 1))?;
        total.indexed += report.indexed;
        total.skipped += report.skipped;
        total.rotations += report.rotations;
        batches += 1;
        debug!("Batch {batches}: {report:?}");
    }

    output_result(
        "Messages indexed",
        &summary(index_args.user_id, total, batches, start_time),
        cli_args,
    )
}

/// Replace the index with one built from the file.
async fn rebuild_index(
    client: &SearchClient,
    rebuild_args: &IndexArgs,
    cli_args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    let messages = read_messages(&rebuild_args.messages_file)?;
    let start_time = Instant::now();
    let report = client
        .rebuild(rebuild_args.user_id, messages)
        .await
        .context("rebuild failed")?;

    output_result(
        "Index rebuilt",
        &summary(rebuild_args.user_id, report, 1, start_time),
        cli_args,
    )
}

async fn search_messages(
    client: &SearchClient,
    search_args: &SearchArgs,
    cli_args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    let mut query = SearchQuery::new(search_args.query.clone())
        .with_range(search_args.from, search_args.to);
    if let Some(sender) = &search_args.sender {
        query = query.with_sender(sender.clone());
    }
    if let Some(limit) = search_args.limit {
        query = query.with_limit(limit);
    }

    let start_time = Instant::now();
    let hits = client.search(search_args.user_id, query).await?;

    output_result(
        "Search finished",
        &SearchResults {
            user_id: search_args.user_id,
            query: search_args.query.clone(),
            hits,
            duration_ms: start_time.elapsed().as_millis() as u64,
        },
        cli_args,
    )
}

async fn get_config(
    client: &SearchClient,
    user: &UserArgs,
    cli_args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    let output = match client.get_user_config(user.user_id).await? {
        ConfigLookup::NoConfigFile => ConfigOutput {
            user_id: user.user_id,
            status: ConfigStatus::Created,
            record: None,
        },
        ConfigLookup::NoRecord => ConfigOutput {
            user_id: user.user_id,
            status: ConfigStatus::Missing,
            record: None,
        },
        ConfigLookup::Found(record) => ConfigOutput {
            user_id: user.user_id,
            status: ConfigStatus::Found,
            record: Some(record),
        },
    };
    output_result("User config", &output, cli_args)
}

async fn set_config(
    client: &SearchClient,
    set: &ConfigSetArgs,
    cli_args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    let mut patch = UserConfigPatch::new();
    if let Some(rotation_id) = set.rotation_id {
        patch = patch.rotation_id(rotation_id);
    }
    if let Some(version) = set.version {
        patch = patch.version(version);
    }
    if let Some(language) = &set.language {
        patch = patch.language(language.clone());
    }

    let record = client.update_user_config(set.user_id, patch).await?;
    output_result(
        "User config updated",
        &ConfigOutput {
            user_id: set.user_id,
            status: ConfigStatus::Updated,
            record: Some(record),
        },
        cli_args,
    )
}

async fn check_space(
    client: &SearchClient,
    config: &SearchConfig,
    space_args: &CheckSpaceArgs,
    cli_args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    let path = space_args
        .path
        .clone()
        .unwrap_or_else(|| config.paths.user_data_dir.clone());
    let check = client.check_free_space(Some(path.clone())).await?;
    if !check.ok {
        warn!("Free-space check on {} failed", path.display());
    }

    output_result(
        "Free-space check",
        &SpaceCheckOutput {
            path: Some(path.display().to_string()),
            ok: check.ok,
            free_bytes: check.free_bytes,
            error: check.error.map(|e| e.to_string()),
        },
        cli_args,
    )
}

async fn show_health(
    client: &SearchClient,
    user: &UserArgs,
    cli_args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    let health = client.health(user.user_id).await?;
    output_result("Index health", &health, cli_args)
}

async fn wipe_user(
    client: &SearchClient,
    user: &UserArgs,
    cli_args: &ChatSearchArgs,
) -> anyhow::Result<()> {
    client.wipe_user(user.user_id).await?;
    output_result(
        "User wiped",
        &WipeOutput {
            user_id: user.user_id,
        },
        cli_args,
    )
}

fn summary(
    user_id: crate::context::UserId,
    report: IndexReport,
    batches: usize,
    start_time: Instant,
) -> IndexingSummary {
    let duration = start_time.elapsed();
    IndexingSummary {
        user_id,
        indexed: report.indexed,
        skipped: report.skipped,
        rotations: report.rotations,
        batches,
        duration_ms: duration.as_millis() as u64,
        messages_per_second: if duration.as_secs_f64() > 0.0 {
            report.indexed as f64 / duration.as_secs_f64()
        } else {
            0.0
        },
    }
}

/// Read messages from a JSONL file. Blank lines are ignored; lines that do
/// not parse are logged and skipped.
pub fn read_messages(path: &Path) -> anyhow::Result<Vec<Message>> {
    let file =
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut messages = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("cannot read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Skipping line {} of {}: {e}", line_num + 1, path.display()),
        }
    }
    Ok(messages)
}
