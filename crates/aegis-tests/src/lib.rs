//! Integration tests for the Aegis control plane live in `tests/`.
//!
//! This crate intentionally has no library code; it exists so the
//! cross-crate scenarios build against every engine at once.

#![forbid(unsafe_code)]
