// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application Layer
//!
//! The coordinator's tasks and the pipelines between them.

pub mod aggregator;
pub mod batch;
pub mod collector;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod janitor;
pub mod listeners;
pub mod repository_factory;
pub mod runtime;

pub use context::{Channels, CoordinatorContext, SchedulerKey, Whitelist};
pub use error::{CoordinatorError, ErrorKind};
pub use repository_factory::Repositories;
pub use runtime::CoordinatorRuntime;
