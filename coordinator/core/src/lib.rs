// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! MIG Scheduler Core
//!
//! Coordinator of a fleet of investigation agents. Signed actions arrive in
//! a file spool, are authorized against a weighted ACL, expanded into one
//! command per target agent and published on the message broker. Returned
//! commands are aggregated back into the action until it lands.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, coordinator tasks and their infrastructure

pub mod application;
pub mod domain;
pub mod infrastructure;
