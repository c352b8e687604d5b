// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Omnibridge connects an editor to an OmniSharp-style code-analysis server.
//!
//! It manages the server connection lifecycle, builds requests from editor
//! state, and turns the server's event stream into log, error and trace
//! streams that editor features can subscribe to independently.

/// Command-line interface utilities.
pub mod cli;
/// Analysis-server client: lifecycle, requests and derived streams.
pub mod client;
/// Configuration loading.
pub mod config;
/// Subscription ownership and teardown.
pub mod disposable;
/// Host editor abstractions.
pub mod editor;
/// Git working copy observation.
pub mod git;
/// Solution and project discovery.
pub mod project;
/// Transports to the analysis server.
pub mod transport;
