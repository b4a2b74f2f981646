//! Per-request authorization for storage-service calls.
//!
//! Every outbound storage request is authorized by a trusted local server
//! before it is sent: either it signs an AWS SigV4 string-to-sign, or it
//! returns a time-limited capability URI (Azure SAS). The
//! [`SignatureBroker`] deduplicates concurrent requests that carry the same
//! [`RequestId`] and never caches a grant past the call it was issued for.

pub mod broker;
pub mod canonical;
pub mod endpoint;
pub mod error;
pub mod request;
pub mod sas;
pub mod v4;

pub use broker::{SignatureBroker, SigningServer};
pub use endpoint::SignatureEndpoint;
pub use error::AuthorizationError;
pub use request::{
    AuthorizationGrant, AuthorizationRequest, CanonicalTarget, ContentDescriptor, Credential,
    Operation, RequestId,
};
pub use sas::SasRequester;
pub use v4::V4Signer;
