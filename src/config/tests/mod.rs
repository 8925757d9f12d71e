//! Unit tests for botbox configuration types.
//!
//! - [`helpers`] - Shared fixtures and helper functions
//! - [`types_tests`] - Defaults and TOML deserialisation
//! - [`validation`] - `AppConfig::validate` tests
//! - [`layer_precedence_tests`] - `MergeComposer` layer precedence tests

mod helpers;
