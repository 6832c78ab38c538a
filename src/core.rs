//! The in-worker search core.
//!
//! [`SearchCore`] wires the config store, version manager, index writers and
//! query engine to one [`SearchContext`] and executes [`Command`]s. It is the
//! [`CommandHandler`] the supervisor's worker runs; a restarted worker builds a
//! new core, sweeps leftovers of the previous one and re-reads everything
//! from disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::analysis::analyzer::MessageAnalyzer;
use crate::config::SearchConfig;
use crate::context::{SearchContext, UserId, validate_user_id};
use crate::disk::DiskCheck;
use crate::error::{ChatSearchError, Result};
use crate::index::directory::{FileIndexDirectory, IndexDirectory};
use crate::index::message::Message;
use crate::index::version::{IndexHealth, IndexState, SweepReport, VersionManager};
use crate::index::writer::{IndexReport, IndexWriter};
use crate::search::engine::QueryEngine;
use crate::search::query::{SearchQuery, SearchResult};
use crate::storage::Storage;
use crate::storage::file::FileStorage;
use crate::supervisor::protocol::{Command, Response};
use crate::supervisor::worker::{CommandHandler, WorkerFactory};
use crate::user_config::{ConfigLookup, UserConfigPatch, UserConfigRecord, UserConfigStore};

/// Executes search commands against on-disk state.
#[derive(Debug)]
pub struct SearchCore {
    ctx: SearchContext,
    config_store: UserConfigStore,
    versions: VersionManager,
    engine: QueryEngine,
    writers: HashMap<UserId, Arc<IndexWriter>>,
}

impl SearchCore {
    /// Open the core over the directories named in `config`.
    pub fn open(config: SearchConfig) -> Result<Self> {
        let ctx = SearchContext::new(config)?;
        let config_storage: Arc<dyn Storage> = Arc::new(FileStorage::new(ctx.user_data_dir())?);
        let directory: Arc<dyn IndexDirectory> = Arc::new(FileIndexDirectory::new(ctx.index_root()));
        let core = Self::new(ctx, config_storage, directory);

        match core.sweep() {
            Ok(report) if report.recovered > 0 || report.removed_files > 0 => info!(
                "Startup sweep over {} users: {} rebuilds rolled back, {} files removed",
                report.users, report.recovered, report.removed_files
            ),
            Ok(_) => {}
            Err(e) => warn!("Startup sweep failed: {e}"),
        }
        Ok(core)
    }

    /// Build a core over explicit storage backends.
    pub fn new(
        ctx: SearchContext,
        config_storage: Arc<dyn Storage>,
        directory: Arc<dyn IndexDirectory>,
    ) -> Self {
        SearchCore {
            config_store: UserConfigStore::new(&ctx, config_storage),
            versions: VersionManager::new(&ctx, directory),
            engine: QueryEngine::new(&ctx),
            writers: HashMap::new(),
            ctx,
        }
    }

    pub fn context(&self) -> &SearchContext {
        &self.ctx
    }

    pub fn config_store(&self) -> &UserConfigStore {
        &self.config_store
    }

    pub fn get_user_config(&self, user_id: UserId) -> Result<ConfigLookup> {
        self.config_store.get_user_config(user_id)
    }

    pub fn update_user_config(
        &mut self,
        user_id: UserId,
        patch: UserConfigPatch,
    ) -> Result<UserConfigRecord> {
        let language_changed = patch.language.is_some();
        let record = self.config_store.update_user_config(user_id, patch)?;

        // The analyzer is chosen per language when a writer is opened.
        if language_changed
            && self
                .writers
                .get(&user_id)
                .is_some_and(|writer| writer.analyzer().language() != record.language)
        {
            self.writers.remove(&user_id);
        }
        Ok(record)
    }

    pub fn check_free_space(&self, path: Option<&Path>) -> DiskCheck {
        self.ctx.guard().check_free_space(path)
    }

    /// Index a batch, rebuilding first if the index is stale.
    pub fn index_batch(&mut self, user_id: UserId, messages: Vec<Message>) -> Result<IndexReport> {
        validate_user_id(user_id)?;
        self.ctx.guard().preflight(self.ctx.index_root())?;

        if self.settled_state(user_id)? == IndexState::Stale {
            info!("Index of user {user_id} is stale, rebuilding from the incoming batch");
            return self.rebuild(user_id, messages);
        }

        let writer = self.writer(user_id)?;
        writer.index_batch(messages, &self.config_store)
    }

    /// Run `query` against the user's index.
    pub fn search(&mut self, user_id: UserId, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        validate_user_id(user_id)?;
        if query.text.trim().is_empty() {
            return Ok(Vec::new());
        }

        match self.settled_state(user_id)? {
            IndexState::NoIndex => Ok(Vec::new()),
            IndexState::Stale => {
                let found = self
                    .versions
                    .load_manifest(user_id)?
                    .map(|m| m.index_version)
                    .unwrap_or_default();
                Err(ChatSearchError::version_mismatch(
                    found,
                    self.versions.schema_version(),
                ))
            }
            IndexState::Current | IndexState::Rebuilding => {
                let writer = self.writer(user_id)?;
                self.engine
                    .search(&writer.snapshot(), writer.analyzer(), query)
            }
        }
    }

    /// Replace the user's index with one built from `backfill`.
    pub fn rebuild(&mut self, user_id: UserId, backfill: Vec<Message>) -> Result<IndexReport> {
        validate_user_id(user_id)?;
        self.writers.remove(&user_id);
        let analyzer = self.analyzer_for(user_id)?;
        self.versions
            .rebuild(user_id, backfill, &analyzer, &self.config_store)
    }

    pub fn wipe_user(&mut self, user_id: UserId) -> Result<()> {
        validate_user_id(user_id)?;
        self.writers.remove(&user_id);
        self.versions.wipe(user_id, &self.config_store)
    }

    pub fn health(&self, user_id: UserId) -> Result<IndexHealth> {
        self.versions.health(user_id)
    }

    /// Clean up leftovers of earlier workers across all users.
    pub fn sweep(&self) -> Result<SweepReport> {
        self.versions.sweep()
    }

    // A rebuild marker seen here belongs to a worker that died mid-rebuild.
    fn settled_state(&mut self, user_id: UserId) -> Result<IndexState> {
        match self.versions.state(user_id)? {
            IndexState::Rebuilding => {
                self.writers.remove(&user_id);
                self.versions.recover(user_id)
            }
            state => Ok(state),
        }
    }

    fn writer(&mut self, user_id: UserId) -> Result<Arc<IndexWriter>> {
        if let Some(writer) = self.writers.get(&user_id) {
            return Ok(writer.clone());
        }

        let storage = self.versions.directory().open(user_id)?;
        let analyzer = self.analyzer_for(user_id)?;
        let writer = Arc::new(IndexWriter::open(
            &self.ctx,
            user_id,
            storage,
            analyzer,
            &self.config_store,
        )?);
        debug!("Opened index writer for user {user_id}");
        self.writers.insert(user_id, writer.clone());
        Ok(writer)
    }

    fn analyzer_for(&self, user_id: UserId) -> Result<MessageAnalyzer> {
        let language = self
            .config_store
            .find_user(user_id)?
            .map(|record| record.language)
            .filter(|language| !language.is_empty())
            .unwrap_or_else(|| self.ctx.default_language().to_string());
        MessageAnalyzer::new(
            &language,
            self.ctx.config().search.token_pattern.as_deref(),
        )
    }
}

impl CommandHandler for SearchCore {
    fn handle(&mut self, command: Command) -> Result<Response> {
        match command {
            Command::IndexBatch { user_id, messages } => {
                self.index_batch(user_id, messages).map(Response::Indexed)
            }
            Command::Search { user_id, query } => {
                self.search(user_id, &query).map(Response::Results)
            }
            Command::GetUserConfig { user_id } => {
                self.get_user_config(user_id).map(Response::UserConfig)
            }
            Command::UpdateUserConfig { user_id, patch } => self
                .update_user_config(user_id, patch)
                .map(Response::UserConfigUpdated),
            Command::CheckFreeSpace { path } => {
                Ok(Response::FreeSpace(self.check_free_space(path.as_deref())))
            }
            Command::Rebuild { user_id, backfill } => {
                self.rebuild(user_id, backfill).map(Response::Rebuilt)
            }
            Command::WipeUser { user_id } => self.wipe_user(user_id).map(|()| Response::Wiped),
            Command::Health { user_id } => self.health(user_id).map(Response::Health),
        }
    }
}

/// Builds a [`SearchCore`] for every worker start.
#[derive(Debug, Clone)]
pub struct SearchCoreFactory {
    config: SearchConfig,
}

impl SearchCoreFactory {
    pub fn new(config: SearchConfig) -> Self {
        SearchCoreFactory { config }
    }
}

impl WorkerFactory for SearchCoreFactory {
    fn create(&self) -> Result<Box<dyn CommandHandler>> {
        Ok(Box::new(SearchCore::open(self.config.clone())?))
    }
}
