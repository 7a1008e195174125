//! Process-wide owner of accounts and the collaborators they share.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountMode, SessionRecord, Shared};
use crate::config::SessionConfig;
use crate::connector::ConnectParams;
use crate::error::{InvalidParameterError, SessionError, StorageError};
use crate::handlers::Capabilities;
use crate::pipe::Pipes;
use crate::presence::{Presence, PresenceController};
use crate::storage::{ScopedStorage, Storage};
use crate::transport::{DefaultTransportFactory, TransportFactory};

/// Root key listing the uids of every account, for [`SessionContext::restore_accounts`].
const ACCOUNTS_KEY: &str = "accounts";

type AccountMap = Arc<Mutex<HashMap<String, Account>>>;

pub struct SessionContext {
    shared: Shared,
    root: ScopedStorage,
    accounts: AccountMap,
}

impl SessionContext {
    pub fn new(config: SessionConfig, storage: Arc<dyn Storage>) -> Self {
        let factory = Arc::new(DefaultTransportFactory::new(config.clone()));
        Self::with_factory(config, storage, factory)
    }

    pub fn with_factory(config: SessionConfig, storage: Arc<dyn Storage>, factory: Arc<dyn TransportFactory>) -> Self {
        let capabilities = Arc::new(Capabilities::new(config.caps_node.clone()));
        Self {
            root: ScopedStorage::new(storage.clone(), ""),
            shared: Shared {
                backend: storage,
                presence: Arc::new(PresenceController::new()),
                config,
                factory,
                pipes: Arc::new(Pipes::new()),
                capabilities,
            },
            accounts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.shared.backend
    }

    pub fn presence(&self) -> &PresenceController {
        &self.shared.presence
    }

    /// Message pipes shared by every account.
    pub fn pipes(&self) -> &Pipes {
        &self.shared.pipes
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.shared.capabilities
    }

    fn resolve(&self, mode: AccountMode) -> Result<ConnectParams, SessionError> {
        let params = match mode {
            AccountMode::Login { url, jid, password } => ConnectParams::login(&url, &jid, &password)?,
            AccountMode::Attach { url, jid, sid, rid } => ConnectParams::attach(&url, &jid, &sid, rid)?,
            AccountMode::Restore { uid } => {
                let record = SessionRecord::load(&self.shared.backend, &uid)
                    .ok_or_else(|| InvalidParameterError::new(format!("no stored session for {}", uid)))?;
                ConnectParams::attach(&record.url, &record.jid, &record.sid, record.rid)?
            }
        };
        Ok(params)
    }

    /// Create an account. It is not connected yet; call [`Account::connect`].
    pub fn create_account(&self, mode: AccountMode) -> Result<Account, SessionError> {
        let params = self.resolve(mode)?;
        let uid = params.jid().bare();

        let mut accounts = self.accounts.lock();
        if accounts.contains_key(&uid) {
            return Err(SessionError::DuplicateAccount(uid));
        }
        let account = Account::new(params, self.shared.clone())?;

        let map = Arc::downgrade(&self.accounts);
        let root = self.root.clone();
        account.hooks().removed.subscribe(move |uid: &String| forget(&map, &root, uid));

        accounts.insert(uid.clone(), account.clone());
        persist_uids(&self.root, &accounts)?;
        info!(jid = %uid, "Account added");
        Ok(account)
    }

    pub fn account(&self, uid: &str) -> Option<Account> {
        self.accounts.lock().get(uid).cloned()
    }

    /// Accounts ordered by uid.
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.lock().values().cloned().collect();
        accounts.sort_by(|a, b| a.uid().cmp(b.uid()));
        accounts
    }

    /// Destroy an account. Returns false when `uid` is unknown.
    pub fn remove_account(&self, uid: &str) -> bool {
        let Some(account) = self.account(uid) else {
            return false;
        };
        account.destroy();
        true
    }

    /// Recreate every account that has a persisted session. Accounts that cannot
    /// be restored are dropped from the stored list.
    pub fn restore_accounts(&self) -> Vec<Account> {
        let uids: Vec<String> = self.root.get_as(ACCOUNTS_KEY).unwrap_or_default();
        let mut restored = Vec::new();
        for uid in uids {
            if self.account(&uid).is_some() {
                continue;
            }
            match self.create_account(AccountMode::Restore { uid: uid.clone() }) {
                Ok(account) => restored.push(account),
                Err(e) => warn!(jid = %uid, error = %e, "Could not restore account"),
            }
        }
        if let Err(e) = persist_uids(&self.root, &self.accounts.lock()) {
            warn!(error = %e, "Failed to persist account list");
        }
        info!(count = restored.len(), "Accounts restored");
        restored
    }

    /// Move every account to `target`. Going offline announces unavailability
    /// and tears the accounts down.
    pub fn set_presence(&self, target: Presence) {
        let presence = &self.shared.presence;
        presence.set_target(target);
        let accounts = self.accounts();

        if target.is_offline() {
            for account in accounts {
                if let Err(e) = account.connection().send_unavailable(None) {
                    debug!(jid = %account.uid(), error = %e, "Could not announce unavailability");
                }
                account.destroy();
            }
            presence.set_current(Presence::Offline);
            return;
        }

        for account in accounts.iter().filter(|a| a.status().is_established()) {
            if let Err(e) = account.broadcast_presence() {
                warn!(jid = %account.uid(), error = %e, "Presence broadcast failed");
            }
        }
    }

    /// Persist the session token of every account.
    pub fn save_sessions(&self) {
        for account in self.accounts() {
            account.save_session();
        }
    }
}

fn persist_uids(root: &ScopedStorage, accounts: &HashMap<String, Account>) -> Result<(), StorageError> {
    let mut uids: Vec<&String> = accounts.keys().collect();
    uids.sort();
    root.set_as(ACCOUNTS_KEY, &uids)
}

fn forget(map: &Weak<Mutex<HashMap<String, Account>>>, root: &ScopedStorage, uid: &str) {
    let Some(map) = map.upgrade() else {
        return;
    };
    let mut accounts = map.lock();
    if accounts.remove(uid).is_some() {
        if let Err(e) = persist_uids(root, &accounts) {
            warn!(error = %e, "Failed to persist account list");
        }
        info!(jid = %uid, "Account removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectionStatus;
    use crate::storage::MemoryStorage;
    use crate::transport::mock::{MockFactory, Script};
    use crate::transport::Transport;

    const URL: &str = "https://example.com/http-bind";

    fn context(backend: Arc<dyn Storage>) -> (Arc<MockFactory>, SessionContext) {
        let factory = Arc::new(MockFactory::new(Script {
            respond: true,
            ..Script::default()
        }));
        let context = SessionContext::with_factory(SessionConfig::default(), backend, factory.clone());
        (factory, context)
    }

    fn login(jid: &str) -> AccountMode {
        AccountMode::Login {
            url: URL.to_string(),
            jid: jid.to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let (_, context) = context(Arc::new(MemoryStorage::new()));
        context.create_account(login("alice@example.com")).unwrap();

        let err = context.create_account(login("alice@example.com/laptop")).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateAccount(uid) if uid == "alice@example.com"));
        assert_eq!(context.accounts().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_mode_fails_fast() {
        let (factory, context) = context(Arc::new(MemoryStorage::new()));
        let err = context
            .create_account(AccountMode::Login {
                url: String::new(),
                jid: "alice@example.com".to_string(),
                password: "secret".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidParameter(_)));

        let err = context
            .create_account(AccountMode::Restore {
                uid: "nobody@example.com".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidParameter(_)));
        assert_eq!(factory.creations(), 0);
    }

    #[tokio::test]
    async fn test_remove_account_forgets_it() {
        let backend: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (_, context) = context(backend.clone());
        context.create_account(login("alice@example.com")).unwrap();
        context.create_account(login("bob@example.com")).unwrap();

        assert!(context.remove_account("alice@example.com"));
        assert!(!context.remove_account("alice@example.com"));
        assert!(context.account("alice@example.com").is_none());

        let listed: Vec<String> = ScopedStorage::new(backend, "").get_as(ACCOUNTS_KEY).unwrap();
        assert_eq!(listed, vec!["bob@example.com"]);
    }

    #[tokio::test]
    async fn test_restore_attaches_to_saved_session() {
        let backend: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let (_, context) = context(backend.clone());
            let account = context
                .create_account(AccountMode::Attach {
                    url: URL.to_string(),
                    jid: "alice@example.com/web".to_string(),
                    sid: "abc".to_string(),
                    rid: 42,
                })
                .unwrap();
            account.connect().await.unwrap();
            account.connection().close();
        }

        let (factory, context) = context(backend);
        let restored = context.restore_accounts();
        assert_eq!(restored.len(), 1);

        let account = &restored[0];
        assert_eq!(account.session_id(), "abc");
        account.connect().await.unwrap();
        assert_eq!(account.status(), ConnectionStatus::Attached);
        assert_eq!(factory.last().unwrap().session_token().unwrap().sid, "abc");
    }

    #[tokio::test]
    async fn test_offline_presence_tears_down_accounts() {
        let (factory, context) = context(Arc::new(MemoryStorage::new()));
        let account = context.create_account(login("alice@example.com")).unwrap();
        account.connect().await.unwrap();
        assert_eq!(context.presence().current(), Presence::Online);

        context.set_presence(Presence::Away);
        let transport = factory.last().unwrap();
        let presences = transport.sent_named("presence");
        assert_eq!(presences.last().unwrap().child_text("show").as_deref(), Some("away"));
        assert_eq!(context.presence().current(), Presence::Away);

        context.set_presence(Presence::Offline);
        let last = transport.sent_named("presence").pop().unwrap();
        assert_eq!(last.get_attr("type"), Some("unavailable"));
        assert!(account.is_destroyed());
        assert!(context.accounts().is_empty());
        assert_eq!(context.presence().current(), Presence::Offline);
    }
}
