use azure_core::error::{Error, ErrorKind};

/// Failure modes of a CLI-backed credential.
///
/// Kinds for which [`is_credential_unavailable`](Self::is_credential_unavailable)
/// returns `true` mean the token could not be obtained through this mechanism
/// at all; callers chaining multiple credentials should fall back to the next
/// one. The remaining kinds are terminal: either the caller's input was
/// invalid or the CLI itself rejected the request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CliCredentialError {
    /// The executable is absent from `PATH`, or the shell reported it
    /// unrecognized while running it.
    #[error("{0}")]
    CliNotFound(String),

    /// The tool ran but reports no authenticated session.
    #[error("{0}")]
    NotLoggedIn(String),

    /// The subprocess timed out or could not be waited on.
    #[error("{0}")]
    ProcessUnavailable(String),

    /// The shell interpreter itself could not be started.
    #[error("failed to execute '{shell}'")]
    ProcessSpawnFailed {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    /// The caller supplied invalid input, such as an empty scope list.
    #[error("{0}")]
    InvalidRequest(String),

    /// The requested tenant is malformed or not permitted by the
    /// credential's configuration.
    #[error("{0}")]
    InvalidTenant(String),

    /// The tool exited non-zero for a reason other than the above. The
    /// message is the tool's sanitized stderr.
    #[error("{0}")]
    AuthenticationFailed(String),

    /// The tool exited zero but its output could not be parsed into a
    /// token. The message embeds a sanitized copy of that output.
    #[error("{0}")]
    UnexpectedOutput(String),

    /// A platform environment variable required to pick the working
    /// directory is missing.
    #[error("{0}")]
    EnvironmentMisconfigured(String),
}

impl CliCredentialError {
    /// `true` when the failure means "no token is obtainable through this
    /// CLI", as opposed to a rejected or malformed request.
    #[must_use]
    pub fn is_credential_unavailable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidRequest(_)
                | Self::InvalidTenant(_)
                | Self::AuthenticationFailed(_)
                | Self::UnexpectedOutput(_)
        )
    }
}

impl From<CliCredentialError> for Error {
    fn from(error: CliCredentialError) -> Self {
        Self::new(ErrorKind::Credential, error)
    }
}
