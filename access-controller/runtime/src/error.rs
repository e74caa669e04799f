use crate::{
    certificates::IssueError,
    k8s::{duration, http_proxy::UnexpectedStructure, status::ConditionState},
};

/// Errors raised while reconciling a resource.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: String, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("unsupported access type")]
    UnsupportedAccessType,

    #[error(transparent)]
    UnexpectedStructure(#[from] UnexpectedStructure),

    #[error("invalid duration setting: {0}")]
    InvalidDuration(#[from] duration::ParseError),

    #[error("certificate {0:?} exists but is not controlled by skupper")]
    NotControlled(String),

    #[error("secret exists but is not controlled by skupper")]
    SecretNotControlled,

    #[error("CA {0:?} not found")]
    CaNotFound(String),

    #[error("Gateway base domain not yet resolved")]
    GatewayUnresolved,

    #[error(transparent)]
    Issue(#[from] IssueError),

    #[error("{}", join(.0))]
    Joined(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

// === impl Error ===

impl Error {
    /// Combines errors, returning `None` when there are none.
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Option<Self> {
        let mut errors = errors.into_iter().collect::<Vec<_>>();
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Joined(errors)),
        }
    }

    /// Returns true if trying again later may succeed.
    ///
    /// Validation and ownership problems are recorded in status and left for
    /// the next change to the resource. Missing dependencies are replayed
    /// when the dependency itself changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) | Self::Conflict { .. } | Self::AlreadyExists { .. } => true,
            Self::Joined(errors) => errors.iter().any(Self::is_retryable),
            Self::UnsupportedAccessType
            | Self::UnexpectedStructure(_)
            | Self::InvalidDuration(_)
            | Self::NotControlled(_)
            | Self::SecretNotControlled
            | Self::CaNotFound(_)
            | Self::GatewayUnresolved
            | Self::Issue(_) => false,
        }
    }

    /// Returns true if the error only reflects a dependency that has not
    /// been satisfied yet.
    pub fn is_pending(&self) -> bool {
        match self {
            Self::CaNotFound(_) | Self::GatewayUnresolved => true,
            Self::Joined(errors) => errors.iter().all(Self::is_pending),
            _ => false,
        }
    }

    /// The condition recorded in status for this error.
    pub fn condition(&self) -> ConditionState {
        if self.is_pending() {
            ConditionState::pending(self)
        } else {
            ConditionState::error(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::status::StatusType;

    #[test]
    fn joins_messages_with_newlines() {
        assert!(Error::join(vec![]).is_none());

        let single = Error::join(vec![Error::GatewayUnresolved]).unwrap();
        assert!(matches!(single, Error::GatewayUnresolved));

        let joined = Error::join(vec![
            Error::UnsupportedAccessType,
            Error::CaNotFound("test/skupper-site-ca".to_string()),
        ])
        .unwrap();
        assert_eq!(
            joined.to_string(),
            "unsupported access type\nCA \"test/skupper-site-ca\" not found"
        );
    }

    #[test]
    fn classifies_errors() {
        assert!(Error::Conflict {
            kind: "Certificate".to_string(),
            key: "test/a".to_string()
        }
        .is_retryable());
        assert!(!Error::SecretNotControlled.is_retryable());
        assert!(!Error::NotControlled("a".to_string()).is_retryable());
        assert!(Error::Joined(vec![
            Error::UnsupportedAccessType,
            Error::AlreadyExists {
                kind: "Service".to_string(),
                key: "test/a".to_string()
            },
        ])
        .is_retryable());

        assert_eq!(
            Error::GatewayUnresolved.condition().reason,
            StatusType::Pending
        );
        assert_eq!(
            Error::Joined(vec![Error::GatewayUnresolved, Error::UnsupportedAccessType])
                .condition()
                .reason,
            StatusType::Error
        );
    }
}
