//! Integration tests for `Eventline`
//!
//! This crate contains end-to-end scenarios combining the core library with
//! the in-memory adapter: configuration resolution and merging, stream
//! fan-out and consumer groups, throttling, redelivery and the app runtime.

// This is a test-only crate
#![cfg(test)]
