//! Helpers for reading `/sys`.

pub mod block;
