//! Common functionality shared by the Rotor installer and its tools.

pub mod bootenv;
pub mod command;
pub mod disk;
pub mod mounts;
pub mod stream_hasher;
