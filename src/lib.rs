//! Sandboxed multi-runtime supervisor for user scripts.
//!
//! `botbox` runs untrusted JavaScript and Python "bots" inside a proot guest
//! built from an Alpine minirootfs. The host keeps sole control of the
//! guest: it provisions the filesystem, pins interpreter versions, starts
//! each bot behind a generated wrapper, and brokers everything the bot may
//! ask of the outside world through a loopback JSON-lines bridge.
//!
//! # Architecture
//!
//! The [`supervisor`] decides when a bot runs. Before the first start it
//! asks the [`environment`] gate to [`rootfs`]-provision the guest and let
//! the [`runtime`] manager install and pin interpreters. The [`sandbox`]
//! executor then launches the bot under proot, and the [`bridge`] routes
//! messages between the bot's wrapper and the [`host`] collaborators.
//!
//! # Modules
//!
//! - [`api`]: One orchestration function per CLI command
//! - [`bridge`]: Loopback TCP bridge and its wire protocol
//! - [`config`]: Configuration system with layered precedence (CLI > env > file > defaults)
//! - [`environment`]: One-time guest initialisation
//! - [`error`]: Semantic error types for the application
//! - [`host`]: Tenant registry, workspaces, error log and host effects
//! - [`retry`]: Bounded retry with fixed backoff
//! - [`rootfs`]: Guest filesystem provisioning
//! - [`runtime`]: Interpreter installation and Node.js version pinning
//! - [`sandbox`]: proot invocation and process lifecycle
//! - [`supervisor`]: Per-tenant start and stop policy

pub mod api;
pub mod bridge;
pub mod config;
pub mod environment;
pub mod error;
pub mod host;
pub mod retry;
pub mod rootfs;
pub mod runtime;
pub mod sandbox;
pub mod supervisor;
