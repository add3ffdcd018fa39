//! Authentication and authorization interface.
//!
//! The engine treats both as external collaborators: CONNECT (and v5
//! AUTH continuation) goes through `authenticate`, and every publish,
//! delivery and subscribe goes through `acl_check`. The default
//! provider allows everything.

use embermq_core::packet::QoS;

/// What an ACL check is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Deliver a message to this client.
    Read,
    /// Accept a message published by this client.
    Write,
    /// Accept a subscription from this client.
    Subscribe,
}

/// Outcome of an authentication step.
#[derive(Debug, Clone)]
pub enum AuthResult {
    Allow,
    /// v5 extended auth: send an AUTH packet with this data and wait
    /// for the client's next AUTH.
    Continue(Vec<u8>),
    Deny,
    /// The requested authentication method is not available.
    NotSupported,
}

/// Everything a provider may inspect when authenticating.
#[derive(Debug)]
pub struct AuthContext<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    /// v5 extended authentication method, when the client requested one.
    pub auth_method: Option<&'a str>,
    pub auth_data: Option<&'a [u8]>,
}

/// Authentication and ACL hooks.
pub trait AuthProvider {
    fn authenticate(&mut self, ctx: &AuthContext<'_>) -> AuthResult;

    /// May `client_id` perform `access` on `topic`?
    fn acl_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        access: Access,
    ) -> bool;
}

/// Default provider: anonymous access, no ACL.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AuthProvider for AllowAll {
    fn authenticate(&mut self, ctx: &AuthContext<'_>) -> AuthResult {
        if ctx.auth_method.is_some() {
            // No extended auth mechanisms are wired in by default.
            AuthResult::NotSupported
        } else {
            AuthResult::Allow
        }
    }

    fn acl_check(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _payload: &[u8],
        _qos: QoS,
        _retain: bool,
        _access: Access,
    ) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let mut auth = AllowAll;
        let ctx = AuthContext {
            client_id: "c",
            username: None,
            password: None,
            auth_method: None,
            auth_data: None,
        };
        assert!(matches!(auth.authenticate(&ctx), AuthResult::Allow));
        assert!(auth.acl_check("c", None, "t", b"", QoS::AtMostOnce, false, Access::Write));
    }

    #[test]
    fn test_extended_auth_not_supported_by_default() {
        let mut auth = AllowAll;
        let ctx = AuthContext {
            client_id: "c",
            username: None,
            password: None,
            auth_method: Some("SCRAM-SHA-256"),
            auth_data: None,
        };
        assert!(matches!(auth.authenticate(&ctx), AuthResult::NotSupported));
    }
}
