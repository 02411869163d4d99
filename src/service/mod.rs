//! `BridgeEngine`: owns the store, the session manager and the background tasks,
//! and hands out the command / read surfaces.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::blockchain::bridge::{
    BridgeTxn, ChainSessionManager, CommandApi, DismissedSet, MessageStateResolver, ReadApi,
    RewardReader, SessionInputs, StatusPoller, TransactionStore, TxDraft, UpsertOutcome,
};
use crate::blockchain::network::NetworkRegistry;
use crate::blockchain::traits::{MessageStateSource, ProviderFactory, RewardClaimer};
use crate::core::config::EngineConfig;
use crate::core::errors::BridgeError;
use crate::storage::{spawn_persistence, BridgeStorage};

/// External collaborators the engine is built from.
pub struct EngineDeps {
    pub provider_factory: Arc<dyn ProviderFactory>,
    pub message_source: Arc<dyn MessageStateSource>,
    pub reward_claimer: Option<Arc<dyn RewardClaimer>>,
    pub storage: Option<Arc<BridgeStorage>>,
}

pub struct BridgeEngine {
    registry: Arc<NetworkRegistry>,
    store: Arc<TransactionStore>,
    sessions: ChainSessionManager,
    poller: Arc<StatusPoller>,
    commands: CommandApi,
    read: ReadApi,
    rewards: RewardReader,
    storage: Option<Arc<BridgeStorage>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeEngine {
    pub fn new(config: &EngineConfig, deps: EngineDeps) -> Self {
        let registry = Arc::new(NetworkRegistry::with_overrides(&config.networks));
        let store = Arc::new(TransactionStore::new());
        let sessions = ChainSessionManager::new(
            registry.clone(),
            deps.provider_factory,
            config.provider.infura_project_id.clone(),
        );
        let poller = Arc::new(StatusPoller::new(
            store.clone(),
            sessions.clone(),
            MessageStateResolver::new(deps.message_source),
            config.poller.clone(),
        ));
        let dismissed = DismissedSet::default();
        let commands =
            CommandApi::new(store.clone(), registry.clone(), dismissed.clone(), poller.refresh_handle());
        let read = ReadApi::new(store.clone(), registry.clone(), dismissed);
        let rewards = RewardReader::new(deps.reward_claimer, sessions.clone());

        Self {
            registry,
            store,
            sessions,
            poller,
            commands,
            read,
            rewards,
            storage: deps.storage,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Loads persisted records into the store. Returns how many were loaded.
    pub async fn load(&self) -> Result<usize, BridgeError> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let loaded = self.store.load(storage.load_all().await?);
        info!(loaded, "Restored bridge transactions");
        Ok(loaded)
    }

    /// Loads persisted state, then starts write-through persistence and the poller.
    pub async fn start(&self) -> Result<usize, BridgeError> {
        let loaded = self.load().await?;
        let mut tasks = self.tasks.lock();
        if let Some(storage) = &self.storage {
            tasks.push(spawn_persistence(storage.clone(), self.store.clone(), self.cancel.child_token()));
        }
        tasks.push(tokio::spawn(self.poller.clone().run(self.cancel.child_token())));
        info!(networks = self.registry.len(), "Bridge engine started");
        Ok(loaded)
    }

    /// Forwards a wallet connection change to the session manager.
    pub fn on_wallet_changed(&self, inputs: SessionInputs) {
        // The resolution task logs its own outcome.
        drop(self.sessions.set_inputs(inputs));
    }

    /// Submits a draft and writes the result through to storage before returning.
    pub async fn submit(&self, draft: TxDraft) -> Result<UpsertOutcome, BridgeError> {
        let key = {
            let tx = draft.clone().into_record(&self.registry)?;
            tx.key()
        };
        let outcome = self.commands.submit(draft)?;
        if let (Some(storage), UpsertOutcome::Inserted | UpsertOutcome::Updated) = (&self.storage, outcome) {
            if let Some(tx) = self.store.get_key(&key) {
                storage.save(&tx).await?;
            }
        }
        Ok(outcome)
    }

    /// Removes an account's history from the store and from disk.
    pub async fn clear_history(&self, account: &str) -> Result<Vec<BridgeTxn>, BridgeError> {
        let removed = self.commands.clear_history(account);
        if let Some(storage) = &self.storage {
            storage.delete_by_account(account).await?;
        }
        Ok(removed)
    }

    pub fn commands(&self) -> &CommandApi {
        &self.commands
    }

    pub fn read(&self) -> &ReadApi {
        &self.read
    }

    pub fn rewards(&self) -> &RewardReader {
        &self.rewards
    }

    pub fn sessions(&self) -> &ChainSessionManager {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<NetworkRegistry> {
        &self.registry
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the background tasks and waits for them; queued persistence is flushed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Bridge engine stopped");
    }
}
