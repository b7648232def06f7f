// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordinator Error - Application Layer
//!
//! Every unit of work (one spool file, one action, one periodic pass) returns
//! a [`CoordinatorError`]. The task loop that owns the unit logs it and moves
//! on; [`ErrorKind`] decides what happens next.
//!
//! | Kind | Raised by | Task loop reaction |
//! |------|-----------|--------------------|
//! | `Syntax` | malformed action, command or heartbeat | route to invalid / quarantine |
//! | `Crypto` | bad signature, duplicate signer, weight too low | route to invalid |
//! | `TransientInfra` | store, spool or broker unavailable | retry next cycle |
//! | `ResourceRace` | conditional update lost to a peer | log only |
//! | `Fatal` | delivery path out of publish retries | terminate the process |

use thiserror::Error;

use crate::domain::acl::AclError;
use crate::domain::action::ActionError;
use crate::domain::agent::AgentError;
use crate::domain::command::CommandError;
use crate::domain::repository::RepositoryError;
use crate::domain::signature::SignatureError;
use crate::infrastructure::broker::BrokerError;
use crate::infrastructure::spool::SpoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Crypto,
    TransientInfra,
    ResourceRace,
    Fatal,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("action error: {0}")]
    Action(#[from] ActionError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("authorization denied: {0}")]
    Acl(#[from] AclError),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} was already moved by another coordinator")]
    ResourceRace(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Action(_)
            | CoordinatorError::Command(_)
            | CoordinatorError::Agent(_)
            | CoordinatorError::Serialization(_) => ErrorKind::Syntax,
            CoordinatorError::Acl(_) => ErrorKind::Crypto,
            CoordinatorError::Signature(SignatureError::Canonical(_)) => ErrorKind::Syntax,
            CoordinatorError::Signature(_) => ErrorKind::Crypto,
            CoordinatorError::Spool(SpoolError::Corrupt(_)) => ErrorKind::Syntax,
            CoordinatorError::Spool(SpoolError::Serialization(_)) => ErrorKind::Syntax,
            CoordinatorError::Repository(_)
            | CoordinatorError::Spool(_)
            | CoordinatorError::Broker(_) => ErrorKind::TransientInfra,
            CoordinatorError::ResourceRace(_) => ErrorKind::ResourceRace,
            CoordinatorError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Errors that condemn the unit of work itself rather than the
    /// environment it ran in.
    pub fn is_permanent(&self) -> bool {
        matches!(self.kind(), ErrorKind::Syntax | ErrorKind::Crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = CoordinatorError::from(ActionError::Syntax("no name".into()));
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.is_permanent());

        let err = CoordinatorError::from(AclError::NoPermission("pkg".into()));
        assert_eq!(err.kind(), ErrorKind::Crypto);

        let err = CoordinatorError::from(RepositoryError::Database("down".into()));
        assert_eq!(err.kind(), ErrorKind::TransientInfra);
        assert!(!err.is_permanent());

        let err = CoordinatorError::from(BrokerError::ChannelClosed);
        assert_eq!(err.kind(), ErrorKind::TransientInfra);

        assert_eq!(
            CoordinatorError::ResourceRace("action 1".into()).kind(),
            ErrorKind::ResourceRace
        );
        assert_eq!(CoordinatorError::Fatal("x".into()).kind(), ErrorKind::Fatal);
    }
}
