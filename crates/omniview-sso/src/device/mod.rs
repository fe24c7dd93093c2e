//! Pending OAuth device authorisation flows.
//!
//! A flow starts when a connection needs an SSO token that is not cached.
//! The user is shown a code and a verification URL while the caller polls
//! [`PendingDeviceAuthFlows::poll`] on its own schedule. Polls that arrive
//! before the server-mandated interval has elapsed are answered locally, so
//! the OIDC service only ever sees compliant traffic. A granted token is
//! written to the [`TokenCache`] and the flow is forgotten.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::cache::{SsoToken, TokenCache, TokenCacheError};

const DEVICE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::device");

/// Interval used when the service does not name one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Added to the interval each time the service answers `slow_down`.
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// OIDC client credentials used to run device flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    /// Registered client ID.
    pub client_id: String,
    /// Registered client secret.
    pub client_secret: String,
    /// When the registration must be renewed.
    pub expires_at: OffsetDateTime,
}

/// The service's answer to a device authorisation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthorization {
    /// Opaque code used when polling for the token.
    pub device_code: String,
    /// Code the user types on the verification page.
    pub user_code: String,
    /// Page where the user approves the request.
    pub verification_uri: String,
    /// Verification page with the user code pre-filled.
    pub verification_uri_complete: Option<String>,
    /// Lifetime of the device code.
    pub expires_in: Duration,
    /// Minimum spacing between polls. Zero means unspecified.
    pub interval: Duration,
}

/// Token material returned once the user approves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Bearer token.
    pub access_token: String,
    /// Refresh token, when the client may refresh.
    pub refresh_token: Option<String>,
    /// Lifetime of the access token.
    pub expires_in: Duration,
}

/// Result of one token request against the OIDC service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPoll {
    /// The user has not acted yet.
    Pending,
    /// The caller is polling too often.
    SlowDown,
    /// The user approved.
    Granted(TokenGrant),
    /// The user rejected the request.
    Denied,
}

/// Client for the SSO OIDC endpoints.
pub trait DeviceAuthorizer: Send + Sync {
    /// Registers a public client in `region`.
    ///
    /// # Errors
    ///
    /// [`DeviceAuthError::Service`] when the service rejects the request.
    fn register_client(&self, region: &str) -> Result<ClientRegistration, DeviceAuthError>;

    /// Starts a device authorisation for `start_url`.
    ///
    /// # Errors
    ///
    /// [`DeviceAuthError::Service`] when the service rejects the request.
    fn start_device_authorization(
        &self,
        registration: &ClientRegistration,
        region: &str,
        start_url: &str,
    ) -> Result<DeviceAuthorization, DeviceAuthError>;

    /// Asks whether the user has approved `device_code`.
    ///
    /// # Errors
    ///
    /// [`DeviceAuthError::Service`] for transport or protocol failures.
    fn create_token(
        &self,
        registration: &ClientRegistration,
        region: &str,
        device_code: &str,
    ) -> Result<TokenPoll, DeviceAuthError>;
}

/// Errors raised while running a device flow.
#[derive(Debug, Error)]
pub enum DeviceAuthError {
    /// The OIDC service failed or rejected a request.
    #[error("SSO service request failed: {0}")]
    Service(String),
    /// No flow is pending for the connection.
    #[error("no device authorisation is pending for connection '{connection}'")]
    NoPendingFlow {
        /// Connection that was polled.
        connection: String,
    },
    /// The device code expired before the user approved.
    #[error("device authorisation for connection '{connection}' expired")]
    Expired {
        /// Connection whose flow expired.
        connection: String,
    },
    /// The user rejected the request.
    #[error("device authorisation for connection '{connection}' was denied")]
    Denied {
        /// Connection whose flow was denied.
        connection: String,
    },
    /// The granted token could not be cached.
    #[error(transparent)]
    Cache(#[from] TokenCacheError),
}

/// Identifies the flow to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthRequest {
    /// Connection the token is for; also the flow key.
    pub connection_id: String,
    /// SSO session name; selects the cache file.
    pub session: String,
    /// Portal URL.
    pub start_url: String,
    /// OIDC region.
    pub region: String,
}

/// What to show the user while a flow is pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthPrompt {
    /// Code to type on the verification page.
    pub user_code: String,
    /// Verification page.
    pub verification_uri: String,
    /// Verification page with the code pre-filled.
    pub verification_uri_complete: Option<String>,
    /// Time left before the code expires, measured when the flow began.
    pub expires_in: Duration,
}

/// Outcome of a successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not approved yet; poll again after `retry_after`.
    Pending {
        /// Earliest useful time for the next poll.
        retry_after: Duration,
    },
    /// Approved; the token is cached.
    Authorized(SsoToken),
}

#[derive(Debug)]
struct PendingFlow {
    session: String,
    start_url: String,
    region: String,
    registration: ClientRegistration,
    device_code: String,
    prompt: DeviceAuthPrompt,
    deadline: Instant,
    interval: Duration,
    next_poll: Instant,
}

/// In-flight device flows keyed by connection ID.
pub struct PendingDeviceAuthFlows {
    flows: DashMap<String, PendingFlow>,
    cache: TokenCache,
    authorizer: Arc<dyn DeviceAuthorizer>,
}

impl PendingDeviceAuthFlows {
    /// Flows that persist granted tokens in `cache`.
    #[must_use]
    pub fn new(cache: TokenCache, authorizer: Arc<dyn DeviceAuthorizer>) -> Self {
        Self {
            flows: DashMap::new(),
            cache,
            authorizer,
        }
    }

    /// Cache receiving granted tokens.
    #[must_use]
    pub const fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Starts a flow now. See [`Self::begin_at`].
    ///
    /// # Errors
    ///
    /// As for [`Self::begin_at`].
    pub fn begin(&self, request: DeviceAuthRequest) -> Result<DeviceAuthPrompt, DeviceAuthError> {
        self.begin_at(request, Instant::now())
    }

    /// Starts a flow for `request.connection_id`, replacing any flow already
    /// pending for it.
    ///
    /// A client registration still valid in the session's cached token is
    /// reused; otherwise a new client is registered.
    ///
    /// # Errors
    ///
    /// [`DeviceAuthError::Service`] when registration or authorisation fails.
    pub fn begin_at(
        &self,
        request: DeviceAuthRequest,
        now: Instant,
    ) -> Result<DeviceAuthPrompt, DeviceAuthError> {
        let registration = match self.cached_registration(&request.session) {
            Some(registration) => registration,
            None => self.authorizer.register_client(&request.region)?,
        };
        let authorization = self.authorizer.start_device_authorization(
            &registration,
            &request.region,
            &request.start_url,
        )?;
        let interval = if authorization.interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            authorization.interval
        };
        let prompt = DeviceAuthPrompt {
            user_code: authorization.user_code,
            verification_uri: authorization.verification_uri,
            verification_uri_complete: authorization.verification_uri_complete,
            expires_in: authorization.expires_in,
        };
        info!(
            target: DEVICE_TARGET,
            connection = %request.connection_id,
            session = %request.session,
            verification_uri = %prompt.verification_uri,
            "device authorisation started"
        );
        let flow = PendingFlow {
            session: request.session,
            start_url: request.start_url,
            region: request.region,
            registration,
            device_code: authorization.device_code,
            prompt: prompt.clone(),
            deadline: now + authorization.expires_in,
            interval,
            next_poll: now + interval,
        };
        drop(self.flows.insert(request.connection_id, flow));
        Ok(prompt)
    }

    /// Polls the flow for `connection_id` now. See [`Self::poll_at`].
    ///
    /// # Errors
    ///
    /// As for [`Self::poll_at`].
    pub fn poll(&self, connection_id: &str) -> Result<PollOutcome, DeviceAuthError> {
        self.poll_at(connection_id, Instant::now())
    }

    /// Advances the flow for `connection_id`.
    ///
    /// Polls earlier than the flow's interval return
    /// [`PollOutcome::Pending`] without contacting the service. A `slow_down`
    /// answer widens the interval by [`SLOW_DOWN_STEP`]. Completed, denied
    /// and expired flows are removed.
    ///
    /// # Errors
    ///
    /// [`DeviceAuthError::NoPendingFlow`], [`DeviceAuthError::Expired`],
    /// [`DeviceAuthError::Denied`], [`DeviceAuthError::Cache`] when the
    /// granted token cannot be stored, or the authorizer's error. Service
    /// errors leave the flow pending.
    pub fn poll_at(&self, connection_id: &str, now: Instant) -> Result<PollOutcome, DeviceAuthError> {
        let (registration, region, device_code) = {
            let Some(mut flow) = self.flows.get_mut(connection_id) else {
                return Err(no_pending(connection_id));
            };
            if now >= flow.deadline {
                drop(flow);
                drop(self.flows.remove(connection_id));
                warn!(target: DEVICE_TARGET, connection = connection_id, "device authorisation expired");
                return Err(DeviceAuthError::Expired {
                    connection: connection_id.to_owned(),
                });
            }
            if now < flow.next_poll {
                return Ok(PollOutcome::Pending {
                    retry_after: flow.next_poll.saturating_duration_since(now),
                });
            }
            // Claim this slot before releasing the shard lock.
            flow.next_poll = now + flow.interval;
            (
                flow.registration.clone(),
                flow.region.clone(),
                flow.device_code.clone(),
            )
        };

        match self
            .authorizer
            .create_token(&registration, &region, &device_code)?
        {
            TokenPoll::Pending => Ok(self.pending(connection_id, now)),
            TokenPoll::SlowDown => {
                if let Some(mut flow) = self.flows.get_mut(connection_id) {
                    flow.interval += SLOW_DOWN_STEP;
                    flow.next_poll = now + flow.interval;
                }
                Ok(self.pending(connection_id, now))
            }
            TokenPoll::Denied => {
                drop(self.flows.remove(connection_id));
                warn!(target: DEVICE_TARGET, connection = connection_id, "device authorisation denied");
                Err(DeviceAuthError::Denied {
                    connection: connection_id.to_owned(),
                })
            }
            TokenPoll::Granted(grant) => {
                let Some((_, flow)) = self.flows.remove(connection_id) else {
                    return Err(no_pending(connection_id));
                };
                let token = SsoToken {
                    start_url: flow.start_url,
                    region: flow.region,
                    access_token: grant.access_token,
                    expires_at: OffsetDateTime::now_utc() + grant.expires_in,
                    client_id: Some(flow.registration.client_id),
                    client_secret: Some(flow.registration.client_secret),
                    refresh_token: grant.refresh_token,
                    registration_expires_at: Some(flow.registration.expires_at),
                };
                self.cache.save(&flow.session, &token)?;
                info!(
                    target: DEVICE_TARGET,
                    connection = connection_id,
                    session = %flow.session,
                    "device authorisation completed"
                );
                Ok(PollOutcome::Authorized(token))
            }
        }
    }

    /// Prompt for the flow pending on `connection_id`.
    #[must_use]
    pub fn prompt(&self, connection_id: &str) -> Option<DeviceAuthPrompt> {
        self.flows
            .get(connection_id)
            .map(|flow| flow.prompt.clone())
    }

    /// Whether a flow is pending for `connection_id`.
    #[must_use]
    pub fn is_pending(&self, connection_id: &str) -> bool {
        self.flows.contains_key(connection_id)
    }

    /// Abandons the flow for `connection_id`. Returns whether one existed.
    #[must_use = "false means nothing was pending"]
    pub fn cancel(&self, connection_id: &str) -> bool {
        self.flows.remove(connection_id).is_some()
    }

    /// Drops every flow whose device code has expired at `now` and returns
    /// how many were dropped.
    #[must_use]
    pub fn prune_expired(&self, now: Instant) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, flow| flow.deadline > now);
        before.saturating_sub(self.flows.len())
    }

    /// Number of pending flows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether no flow is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    fn pending(&self, connection_id: &str, now: Instant) -> PollOutcome {
        let retry_after = self
            .flows
            .get(connection_id)
            .map_or(DEFAULT_POLL_INTERVAL, |flow| {
                flow.next_poll.saturating_duration_since(now)
            });
        PollOutcome::Pending { retry_after }
    }

    fn cached_registration(&self, session: &str) -> Option<ClientRegistration> {
        let token = match self.cache.load(session) {
            Ok(token) => token?,
            Err(error) => {
                warn!(target: DEVICE_TARGET, session, %error, "ignoring unreadable cached token");
                return None;
            }
        };
        if !token.registration_valid_at(OffsetDateTime::now_utc()) {
            return None;
        }
        Some(ClientRegistration {
            client_id: token.client_id?,
            client_secret: token.client_secret?,
            expires_at: token.registration_expires_at?,
        })
    }
}

fn no_pending(connection_id: &str) -> DeviceAuthError {
    DeviceAuthError::NoPendingFlow {
        connection: connection_id.to_owned(),
    }
}

#[cfg(test)]
mod tests;
