//! Authentication module.
//!
//! This module implements the two sign-in paths Perch supports:
//! - Federated WebID-OIDC: issuer discovery from an identity URL,
//!   dynamic client registration per issuer, authorization-code flow
//! - Local password accounts (Argon2id hashing)
//!
//! Both paths bind the verified identity onto the same session model.

pub mod accounts;
pub mod discovery;
pub mod flow;
pub mod provider;
pub mod registry;
pub mod session;

use thiserror::Error;

pub use accounts::{LocalAccount, NewAccount, PasswordAccountStore};
pub use discovery::IssuerDiscovery;
pub use flow::{AuthFlowController, FederatedIdentity, Workflow};
pub use provider::{ClientRecord, ProviderMetadata, RegistrationProtocol};
pub use registry::{normalize_issuer, trusted_client_record, ClientRegistry};
pub use session::{Session, SessionBinder, SessionStore};

/// Authentication-related errors.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Issuer discovery failed: {0}")]
    Discovery(String),

    #[error("Client registration failed: {0}")]
    Registration(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Federated sign-in is disabled")]
    FederatedAuthDisabled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl From<crate::db::DatabaseError> for AuthError {
    fn from(err: crate::db::DatabaseError) -> Self {
        AuthError::Storage(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::TokenExchange(err.to_string())
    }
}
