//! Logon credential callbacks.

use async_trait::async_trait;
use sowlink_message::AckReason;

use crate::error::Result;

/// Supplies the credential sent on logon.
///
/// The session calls [`Authenticator::authenticate`] before the first
/// logon attempt on each connection, [`Authenticator::retry`] whenever the
/// server asks for another attempt, and [`Authenticator::completed`] once
/// the logon is settled.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Credential for a first logon attempt.
    async fn authenticate(&self, user_id: Option<&str>, password: Option<&str>)
    -> Result<Option<String>>;

    /// Credential for a retried logon attempt.
    async fn retry(&self, user_id: Option<&str>, password: Option<&str>) -> Result<Option<String>>;

    /// The logon finished, with `reason` set if it failed.
    fn completed(&self, _user_id: Option<&str>, _reason: Option<&AckReason>) {}
}

/// Sends the configured password unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAuthenticator;

#[async_trait]
impl Authenticator for DefaultAuthenticator {
    async fn authenticate(
        &self,
        _user_id: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(password.map(ToString::to_string))
    }

    async fn retry(
        &self,
        _user_id: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(password.map(ToString::to_string))
    }
}
