//! SSRF protection for every outbound dial
//!
//! [`Policy`] decides whether a literal address may be dialed; the client
//! factory wires the policy into DNS resolution so that hostnames resolving to
//! private ranges never reach a socket.

mod client;
mod policy;

pub use client::{
    find_guardian_error, guarded_client, guarded_redirect_policy, ClientOptions, GuardedResolver, MAX_REDIRECTS,
};
pub use policy::{Policy, DEFAULT_BLOCKED_CIDRS};
