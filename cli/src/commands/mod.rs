// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the MIG scheduler CLI

pub mod action;
pub mod config;
pub mod key;
pub mod run;

pub use self::action::ActionCommand;
pub use self::config::ConfigCommand;
pub use self::key::KeyCommand;
