//! Factory for replications.

use crate::auth::{
    AccessTokenAuthorizer, AssertionAuthorizer, Authorizer, CredentialRegistry,
    ACCESS_TOKEN_QUERY_PARAMETER, ASSERTION_QUERY_PARAMETER, EMAIL_QUERY_PARAMETER,
};
use crate::config::ReplicationConfig;
use crate::error::ReplicationResult;
use crate::scheduler::Scheduler;
use crate::session::{Replication, ReplicationStrategy, SessionParts};
use crate::store::LocalStore;
use crate::transport::Transport;
use docsync_protocol::RemoteUrl;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static LAST_SESSION_LABEL: AtomicU64 = AtomicU64::new(0);

/// Next session label (`repl001`, `repl002`, ...). Unique within the
/// process, whichever manager the session belongs to.
pub(crate) fn next_session_label() -> String {
    let n = LAST_SESSION_LABEL.fetch_add(1, Ordering::SeqCst) + 1;
    format!("repl{n:03}")
}

/// Creates replications that share a scheduler, a transport and
/// credentials.
pub struct ReplicationManager {
    scheduler: Arc<dyn Scheduler>,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialRegistry>,
}

impl ReplicationManager {
    /// Creates a manager.
    pub fn new(scheduler: Arc<dyn Scheduler>, transport: Arc<dyn Transport>) -> Self {
        Self {
            scheduler,
            transport,
            credentials: Arc::new(CredentialRegistry::new()),
        }
    }

    /// The credential registry shared by this manager's authorizers.
    pub fn credentials(&self) -> &Arc<CredentialRegistry> {
        &self.credentials
    }

    /// Creates a replication with the authorizer implied by the URL's
    /// query parameters, if any.
    ///
    /// Fails if the remote URL is malformed. The query string is not part
    /// of the replication's remote URL.
    pub fn replication(
        &self,
        config: ReplicationConfig,
        store: &Arc<dyn LocalStore>,
        strategy: Arc<dyn ReplicationStrategy>,
    ) -> ReplicationResult<Replication> {
        let remote = RemoteUrl::parse(&config.remote_url)?;
        let authorizer = self.authorizer_from_query(&remote);
        Ok(self.build(config, remote, store, strategy, authorizer))
    }

    /// Creates a replication that logs in with `authorizer`.
    pub fn replication_with_authorizer(
        &self,
        config: ReplicationConfig,
        store: &Arc<dyn LocalStore>,
        strategy: Arc<dyn ReplicationStrategy>,
        authorizer: Arc<dyn Authorizer>,
    ) -> ReplicationResult<Replication> {
        let remote = RemoteUrl::parse(&config.remote_url)?;
        Ok(self.build(config, remote, store, strategy, Some(authorizer)))
    }

    fn build(
        &self,
        config: ReplicationConfig,
        remote: RemoteUrl,
        store: &Arc<dyn LocalStore>,
        strategy: Arc<dyn ReplicationStrategy>,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Replication {
        debug!(remote = %remote, direction = %config.direction, "creating replication");
        Replication::new(SessionParts {
            config,
            remote,
            scheduler: Arc::clone(&self.scheduler),
            transport: Arc::clone(&self.transport),
            authorizer,
            strategy,
            store: Arc::downgrade(store),
        })
    }

    fn authorizer_from_query(&self, remote: &RemoteUrl) -> Option<Arc<dyn Authorizer>> {
        if let Some(assertion) = remote.query_param(ASSERTION_QUERY_PARAMETER) {
            return match self.credentials.register_assertion(assertion) {
                Ok(email) => Some(Arc::new(AssertionAuthorizer::new(
                    email,
                    Arc::clone(&self.credentials),
                ))),
                Err(err) => {
                    warn!(error = %err, "ignoring unusable identity assertion");
                    None
                }
            };
        }

        let token = remote.query_param(ACCESS_TOKEN_QUERY_PARAMETER)?;
        let Some(email) = remote.query_param(EMAIL_QUERY_PARAMETER) else {
            warn!("access token given without an email, ignoring it");
            return None;
        };
        self.credentials.register_access_token(token, email, remote);
        Some(Arc::new(AccessTokenAuthorizer::new(
            email,
            Arc::clone(&self.credentials),
        )))
    }
}
