pub mod cancel;
pub mod checksum;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod naming;
pub mod output;
pub mod portal;
pub mod sync;
pub mod verify;
