//! SSO credentials for Omniview connections.
//!
//! [`TokenCache`] persists access tokens in the same on-disk layout as the
//! AWS CLI, so a session signed in from either tool is visible to the other.
//! [`PendingDeviceAuthFlows`] tracks in-flight OAuth device authorisations
//! per connection and turns a completed flow into a cached token.

pub mod cache;
pub mod device;

pub use cache::{SsoToken, TokenCache, TokenCacheError, cache_key};
pub use device::{
    ClientRegistration, DeviceAuthError, DeviceAuthPrompt, DeviceAuthRequest, DeviceAuthorization,
    DeviceAuthorizer, PendingDeviceAuthFlows, PollOutcome, TokenGrant, TokenPoll,
};
