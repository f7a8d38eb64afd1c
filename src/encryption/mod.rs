//! Encryption of values stored at rest

mod client;

pub use client::EncryptionClient;
