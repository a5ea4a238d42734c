mod error;
pub use error::Error;

mod config;
pub use config::*;

mod crypto;
pub use crypto::*;

mod identity;
pub use identity::*;

mod keystore;
pub use keystore::*;

mod channel;
pub use channel::*;

mod protocol;
pub use protocol::*;

mod server;
pub use server::*;

mod client;
pub use client::*;

mod chat;
pub use chat::*;
