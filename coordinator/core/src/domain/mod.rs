// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Entities, value objects and repository contracts of the coordinator.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Action/command lifecycle, fleet agents, investigators and
//!   weighted ACL authorization, free of any I/O

pub mod acl;
pub mod action;
pub mod agent;
pub mod command;
pub mod events;
pub mod id;
pub mod investigator;
pub mod repository;
pub mod scheduler_config;
pub mod signature;
