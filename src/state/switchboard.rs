//! The Switchboard - central shared state for the server.
//!
//! Acts as the dependency container the handlers work against: the
//! persistence adapter, the plugin registries (immutable after
//! construction), the session store, the topic hub and the user cache.

use crate::auth::{AuthRegistry, BasicAuth, TokenAuth};
use crate::config::Config;
use crate::error::StoreError;
use crate::metrics;
use crate::plugins::{AccountHook, LogAccountHook};
use crate::push::{LogPusher, Pusher};
use crate::state::access::AccessMode;
use crate::state::cache::UserCache;
use crate::state::hub::Hub;
use crate::state::session::SessionStore;
use crate::state::uid::{TopicCat, UidGenerator};
use crate::store::UserPersistence;
use crate::validate::{EmailValidator, TelValidator, ValidatorRegistry};
use chrono::Duration;
use std::sync::Arc;
use tracing::warn;

/// Central shared state container.
pub struct Switchboard {
    pub config: Config,
    pub store: Arc<dyn UserPersistence>,
    pub auth: AuthRegistry,
    pub validators: ValidatorRegistry,
    pub sessions: Arc<SessionStore>,
    pub hub: Arc<Hub>,
    pub cache: UserCache,
    pub uid_gen: UidGenerator,
    pub hooks: Vec<Arc<dyn AccountHook>>,
}

impl Switchboard {
    /// Build the runtime from configuration and an opened store.
    pub fn new(config: Config, store: Arc<dyn UserPersistence>) -> Result<Arc<Switchboard>, StoreError> {
        metrics::init();

        let mut auth = AuthRegistry::new();
        let basic_lifetime = if config.auth.basic.lifetime_secs > 0 {
            Some(Duration::seconds(config.auth.basic.lifetime_secs))
        } else {
            None
        };
        auth.register(Arc::new(BasicAuth::new(Arc::clone(&store), basic_lifetime)));
        auth.register(Arc::new(TokenAuth::new(
            config.auth.token.key.as_bytes(),
            Duration::seconds(config.auth.token.lifetime_secs),
        )?));
        for (logical, real) in &config.auth.aliases {
            auth.alias(logical, real);
        }

        let mut validators = ValidatorRegistry::new();
        for (name, block) in &config.validator {
            let validator: Arc<dyn crate::validate::Validator> = match name.as_str() {
                "email" => Arc::new(EmailValidator::new(
                    Arc::clone(&store),
                    block.max_retries,
                    block.debug_response.clone(),
                )),
                "tel" => Arc::new(TelValidator::new(
                    Arc::clone(&store),
                    block.max_retries,
                    block.debug_response.clone(),
                )),
                other => {
                    warn!(validator = %other, "unknown validator in config, skipping");
                    continue;
                }
            };
            validators.register(validator, block.add_to_tags);
            for level in &block.required {
                if let Some(level) = crate::auth::AuthLevel::parse(level) {
                    validators.require(level, name);
                }
            }
        }

        let pusher: Arc<dyn Pusher> = Arc::new(LogPusher);
        let sessions = Arc::new(SessionStore::new());
        let (cache, _cache_handle) = UserCache::spawn(Arc::clone(&store), pusher);
        let (hub, _hub_handle) = Hub::spawn(Arc::clone(&store), Arc::clone(&sessions), cache.clone());

        Ok(Arc::new(Switchboard {
            config,
            store,
            auth,
            validators,
            sessions,
            hub,
            cache,
            uid_gen: UidGenerator::new(),
            hooks: vec![Arc::new(LogAccountHook) as Arc<dyn AccountHook>],
        }))
    }

    /// Default access granted on new subscriptions to a topic of this
    /// category, for authenticated or anonymous subscribers.
    pub fn default_access(&self, cat: TopicCat, authenticated: bool) -> AccessMode {
        match (cat, authenticated) {
            (TopicCat::P2P, true) => AccessMode::C_P2P,
            (TopicCat::P2P, false) => AccessMode::NONE,
            (TopicCat::Grp, true) => AccessMode::C_PUBLIC,
            (TopicCat::Grp, false) => AccessMode::C_READONLY,
            (_, _) => AccessMode::NONE,
        }
    }

    /// Notify the plugin hooks of an account change.
    pub fn plugin_account(&self, user: &crate::store::types::User, action: crate::plugins::AccountAction) {
        for hook in &self.hooks {
            hook.account(user, action);
        }
    }

    /// Stop the background actors: topics first, then the cache updater.
    pub async fn shutdown(&self) {
        self.hub.shutdown().await;
        self.cache.shutdown().await;
    }
}
