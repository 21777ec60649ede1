//! Local filesystem concerns of a restore.

pub mod ownership;
