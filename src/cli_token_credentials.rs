//! Shared machinery for credentials that obtain tokens by running a local
//! CLI tool. Each concrete tool is described by a [`ToolProfile`]; the
//! acquisition flow itself (tenant resolution, command construction,
//! subprocess execution, output parsing) is written once here.

use crate::{
    error::CliCredentialError,
    process::{CommandRunner, ExecContext, safe_working_dir},
    tenant::resolve_tenant,
};
use azure_core::{
    credentials::{AccessToken, Secret},
    error::{Error, ErrorKind},
};
use futures::channel::oneshot;
use regex::Regex;
use serde::Deserialize;
use std::{sync::Arc, thread, time::Duration};
use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};
use tracing::debug;

/// How a tool expects scopes on its command line.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ScopeArg {
    /// A single scope, passed as a bare resource with any `/.default`
    /// suffix stripped.
    Resource(&'static str),
    /// One flag instance per scope.
    PerScope(&'static str),
}

/// Static description of one CLI tool: how to invoke it, how to read its
/// output, and how to recognize its failure messages. The stderr phrases are
/// the ones the tools print in their default (English) locale; localized
/// output will fall through to [`CliCredentialError::AuthenticationFailed`].
#[derive(Debug)]
pub(crate) struct ToolProfile {
    pub(crate) display_name: &'static str,
    pub(crate) executable: &'static str,
    pub(crate) base_command: &'static str,
    pub(crate) scope_arg: ScopeArg,
    pub(crate) tenant_flag: &'static str,
    pub(crate) token_field: &'static str,
    pub(crate) no_color_env: &'static str,
    pub(crate) not_found_message: &'static str,
    pub(crate) not_logged_in_message: &'static str,
    pub(crate) not_recognized_prefix: &'static str,
    pub(crate) login_hints: &'static [&'static str],
    pub(crate) parse_token: fn(&str) -> Option<AccessToken>,
}

pub(crate) static AZURE_CLI: ToolProfile = ToolProfile {
    display_name: "Azure CLI",
    executable: "az",
    base_command: "az account get-access-token --output json",
    scope_arg: ScopeArg::Resource("--resource"),
    tenant_flag: "--tenant",
    token_field: "accessToken",
    no_color_env: "AZURE_CORE_NO_COLOR",
    not_found_message: "Azure CLI not found on path",
    not_logged_in_message: "Please run 'az login' to set up an account",
    not_recognized_prefix: "'az' is not recognized",
    login_hints: &["az login", "az account set"],
    parse_token: parse_az_cli_token,
};

pub(crate) static AZURE_DEV_CLI: ToolProfile = ToolProfile {
    display_name: "Azure Developer CLI",
    executable: "azd",
    base_command: "azd auth token --output json",
    scope_arg: ScopeArg::PerScope("--scope"),
    tenant_flag: "--tenant-id",
    token_field: "token",
    no_color_env: "NO_COLOR",
    not_found_message: "Azure Developer CLI could not be found; visit https://aka.ms/azure-dev \
                        to install it, then authenticate with 'azd auth login'",
    not_logged_in_message: "Please run 'azd auth login' from a command prompt to authenticate \
                            before using this credential",
    not_recognized_prefix: "'azd' is not recognized",
    login_hints: &["not logged in, run `azd auth login` to login"],
    parse_token: parse_azd_token,
};

impl ToolProfile {
    /// Build the full shell command for `scopes`, appending the tenant flag
    /// when a tenant was resolved.
    pub(crate) fn build_command(
        &self,
        scopes: &[&str],
        tenant: Option<&str>,
    ) -> Result<String, CliCredentialError> {
        if scopes.is_empty() {
            return Err(CliCredentialError::InvalidRequest(
                "at least one scope is required to request a token".into(),
            ));
        }
        let mut command = self.base_command.to_string();
        match self.scope_arg {
            ScopeArg::Resource(flag) => match scopes {
                [scope] => {
                    let resource = scope.strip_suffix("/.default").unwrap_or(scope);
                    command.push_str(&format!(" {flag} {resource}"));
                }
                _ => {
                    return Err(CliCredentialError::InvalidRequest(format!(
                        "{} requires exactly one scope per token request",
                        self.display_name
                    )));
                }
            },
            ScopeArg::PerScope(flag) => {
                for scope in scopes {
                    command.push_str(&format!(" {flag} {scope}"));
                }
            }
        }
        if let Some(tenant) = tenant {
            command.push_str(&format!(" {} {tenant}", self.tenant_flag));
        }
        Ok(command)
    }

    /// Redact the token field from tool output before it can reach an error
    /// message or a log line. The pattern also covers a value left
    /// unterminated by truncated output.
    pub(crate) fn sanitize_output(&self, output: &str) -> String {
        let pattern = format!("\"{}\": \"(.*?)(\"|$)", self.token_field);
        Regex::new(&pattern).map_or_else(
            |_| "**** (output withheld)".to_string(),
            |redact| redact.replace_all(output, "****").into_owned(),
        )
    }

    /// Map a non-zero exit to an error kind. Exit 127 and the shell's "not
    /// recognized" phrase mean the executable vanished after the path
    /// pre-check passed.
    pub(crate) fn classify_failure(
        &self,
        code: Option<i32>,
        stderr: &str,
    ) -> CliCredentialError {
        if code == Some(127) || stderr.starts_with(self.not_recognized_prefix) {
            return CliCredentialError::CliNotFound(self.not_found_message.to_string());
        }
        if self.login_hints.iter().any(|hint| stderr.contains(hint)) {
            return CliCredentialError::NotLoggedIn(self.not_logged_in_message.to_string());
        }
        if stderr.is_empty() {
            CliCredentialError::AuthenticationFailed(format!(
                "failed to invoke {}",
                self.display_name
            ))
        } else {
            CliCredentialError::AuthenticationFailed(self.sanitize_output(stderr))
        }
    }
}

// `az account get-access-token` prints expiresOn as a naive timestamp in the
// machine's local timezone, with fractional seconds.
const AZ_EXPIRES_ON: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");

// `azd auth token` prints expiresOn as ISO-8601 UTC with whole seconds.
const AZD_EXPIRES_ON: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// The local offset when it can be determined, UTC otherwise (the offset is
/// indeterminate on some platforms once the process is multi-threaded).
pub(crate) fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}

fn truncate_to_seconds(datetime: OffsetDateTime) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(datetime.unix_timestamp()).ok()
}

#[derive(Debug, Deserialize)]
struct AzCliTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expiresOn")]
    expires_on: String,
}

fn parse_az_cli_token(output: &str) -> Option<AccessToken> {
    let response: AzCliTokenResponse = serde_json::from_str(output).ok()?;
    let expires = PrimitiveDateTime::parse(&response.expires_on, AZ_EXPIRES_ON).ok()?;
    let expires_on = truncate_to_seconds(expires.assume_offset(local_offset()))?;
    Some(AccessToken {
        token: Secret::new(response.access_token),
        expires_on,
    })
}

#[derive(Debug, Deserialize)]
struct AzdTokenResponse {
    token: String,
    #[serde(rename = "expiresOn")]
    expires_on: String,
}

fn parse_azd_token(output: &str) -> Option<AccessToken> {
    let response: AzdTokenResponse = serde_json::from_str(output).ok()?;
    let expires = PrimitiveDateTime::parse(&response.expires_on, AZD_EXPIRES_ON).ok()?;
    let expires_on = truncate_to_seconds(expires.assume_utc())?;
    Some(AccessToken {
        token: Secret::new(response.token),
        expires_on,
    })
}

/// The acquisition flow shared by all CLI credentials. Holds only immutable
/// configuration; every [`get_token`](Self::get_token) call is independent
/// and spawns its own subprocess, so concurrent use needs no coordination.
#[derive(Debug, Clone)]
pub(crate) struct CliTokenCredential {
    profile: &'static ToolProfile,
    tenant_id: Option<String>,
    additionally_allowed_tenants: Vec<String>,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl CliTokenCredential {
    pub(crate) fn new(
        profile: &'static ToolProfile,
        tenant_id: Option<String>,
        additionally_allowed_tenants: Vec<String>,
        timeout: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            profile,
            tenant_id,
            additionally_allowed_tenants,
            timeout,
            runner,
        }
    }

    /// Request a token for `scopes`, blocking until the tool responds or the
    /// configured timeout elapses. No retries and no caching: each call maps
    /// to exactly one CLI invocation.
    pub(crate) fn get_token(
        &self,
        scopes: &[&str],
        tenant_override: Option<&str>,
    ) -> Result<AccessToken, CliCredentialError> {
        let tenant = resolve_tenant(
            self.tenant_id.as_deref(),
            tenant_override,
            &self.additionally_allowed_tenants,
        )?;
        let command = self.profile.build_command(scopes, tenant.as_deref())?;

        // Checking the path first avoids spawning a shell that is doomed to
        // fail; exit 127 is still classified below in case the tool vanishes
        // between this check and the exec.
        if !self.runner.find_executable(self.profile.executable) {
            debug!(
                "{} executable not found on the path",
                self.profile.display_name
            );
            return Err(CliCredentialError::CliNotFound(
                self.profile.not_found_message.to_string(),
            ));
        }

        let context = ExecContext {
            working_dir: safe_working_dir()?,
            env: vec![(self.profile.no_color_env.to_string(), "true".to_string())],
            timeout: self.timeout,
        };
        debug!(command = %command, "requesting a token from {}", self.profile.display_name);
        let output = self.runner.run(&command, &context)?;

        if !output.success() {
            let error = self.profile.classify_failure(output.code, &output.stderr);
            debug!(%error, "{} token request failed", self.profile.display_name);
            return Err(error);
        }

        match (self.profile.parse_token)(&output.stdout) {
            Some(token) => {
                debug!("{} token request succeeded", self.profile.display_name);
                Ok(token)
            }
            None => Err(CliCredentialError::UnexpectedOutput(format!(
                "unexpected output from {}: '{}'",
                self.profile.display_name,
                self.profile.sanitize_output(&output.stdout)
            ))),
        }
    }
}

/// Run the blocking acquisition flow on a dedicated thread so async callers
/// never block their executor. Runtime-agnostic: the result comes back over
/// a oneshot channel rather than through any particular runtime's `spawn`.
pub(crate) async fn acquire_on_worker(
    credential: CliTokenCredential,
    scopes: Vec<String>,
    tenant_override: Option<String>,
) -> azure_core::Result<AccessToken> {
    let (sender, receiver) = oneshot::channel();
    thread::spawn(move || {
        let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
        let _ = sender.send(credential.get_token(&scopes, tenant_override.as_deref()));
    });
    match receiver.await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::with_message(
            ErrorKind::Credential,
            "token acquisition thread exited before returning a result",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AZ_EXPIRES_ON, AZURE_CLI, AZURE_DEV_CLI, CliTokenCredential, local_offset,
        parse_az_cli_token, parse_azd_token,
    };
    use crate::{error::CliCredentialError, process::testing::FakeRunner};
    use std::{sync::Arc, time::Duration};
    use time::{PrimitiveDateTime, macros::datetime};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn az_credential(
        tenant_id: Option<&str>,
        allowed: &[&str],
        runner: Arc<FakeRunner>,
    ) -> CliTokenCredential {
        CliTokenCredential::new(
            &AZURE_CLI,
            tenant_id.map(ToOwned::to_owned),
            allowed.iter().map(ToString::to_string).collect(),
            TIMEOUT,
            runner,
        )
    }

    fn local_epoch(expires_on: &str) -> i64 {
        PrimitiveDateTime::parse(expires_on, AZ_EXPIRES_ON)
            .unwrap()
            .assume_offset(local_offset())
            .unix_timestamp()
    }

    #[test]
    fn builds_a_resource_command_from_one_scope() {
        let command = AZURE_CLI
            .build_command(&["https://management.azure.com/.default"], None)
            .unwrap();
        assert_eq!(
            command,
            "az account get-access-token --output json --resource https://management.azure.com"
        );
    }

    #[test]
    fn appends_the_tenant_flag() {
        let command = AZURE_CLI
            .build_command(&["https://vault.azure.net/.default"], Some("T2"))
            .unwrap();
        assert!(command.ends_with("--resource https://vault.azure.net --tenant T2"));
    }

    #[test]
    fn rejects_empty_and_multiple_scopes_for_the_resource_style() {
        assert!(matches!(
            AZURE_CLI.build_command(&[], None),
            Err(CliCredentialError::InvalidRequest(_))
        ));
        assert!(matches!(
            AZURE_CLI.build_command(&["scope-one", "scope-two"], None),
            Err(CliCredentialError::InvalidRequest(_))
        ));
    }

    #[test]
    fn repeats_the_scope_flag_for_azd() {
        let command = AZURE_DEV_CLI
            .build_command(&["scope-one", "scope-two"], Some("T1"))
            .unwrap();
        assert_eq!(
            command,
            "azd auth token --output json --scope scope-one --scope scope-two --tenant-id T1"
        );
    }

    #[test]
    fn parses_az_cli_output_to_local_epoch_seconds() {
        let output = r#"{"accessToken": "abc123", "expiresOn": "2030-01-01 00:00:00.000000", "tokenType": "Bearer"}"#;
        let token = parse_az_cli_token(output).unwrap();
        assert_eq!(token.token.secret(), "abc123");
        assert_eq!(
            token.expires_on.unix_timestamp(),
            local_epoch("2030-01-01 00:00:00.000000")
        );
    }

    #[test]
    fn truncates_fractional_seconds() {
        let output =
            r#"{"accessToken": "abc123", "expiresOn": "2030-01-01 00:00:05.999999"}"#;
        let token = parse_az_cli_token(output).unwrap();
        assert_eq!(
            token.expires_on.unix_timestamp(),
            local_epoch("2030-01-01 00:00:05.000000")
        );
    }

    #[test]
    fn parses_azd_output_as_utc() {
        let output = r#"{"token": "xyz789", "expiresOn": "2030-01-01T00:00:00Z"}"#;
        let token = parse_azd_token(output).unwrap();
        assert_eq!(token.token.secret(), "xyz789");
        assert_eq!(
            token.expires_on.unix_timestamp(),
            datetime!(2030-01-01 00:00:00 UTC).unix_timestamp()
        );
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(parse_az_cli_token("not json").is_none());
        assert!(parse_az_cli_token(r#"{"expiresOn": "2030-01-01 00:00:00.000000"}"#).is_none());
        assert!(parse_az_cli_token(r#"{"accessToken": "abc123"}"#).is_none());
        assert!(
            parse_az_cli_token(r#"{"accessToken": "abc123", "expiresOn": "bad-date"}"#).is_none()
        );
        // azd's timestamp format is not accepted for az and vice versa
        assert!(
            parse_az_cli_token(r#"{"accessToken": "a", "expiresOn": "2030-01-01T00:00:00Z"}"#)
                .is_none()
        );
        assert!(parse_azd_token(r#"{"token": "a", "expiresOn": "2030-01-01 00:00:00.000000"}"#)
            .is_none());
    }

    #[test]
    fn sanitizes_tokens_out_of_output() {
        let output = r#"{"accessToken": "secretabc", "expiresOn": "bad-date"}"#;
        let sanitized = AZURE_CLI.sanitize_output(output);
        assert!(sanitized.contains("****"));
        assert!(!sanitized.contains("secretabc"));

        // a value left unterminated by truncated output is still redacted
        let truncated = r#"{"accessToken": "secretabc"#;
        let sanitized = AZURE_CLI.sanitize_output(truncated);
        assert!(!sanitized.contains("secretabc"));

        let azd_output = r#"{"token": "secretxyz", "expiresOn": "nope"}"#;
        let sanitized = AZURE_DEV_CLI.sanitize_output(azd_output);
        assert!(!sanitized.contains("secretxyz"));
    }

    #[test]
    fn classifies_exit_127_as_cli_not_found() {
        let error = AZURE_CLI.classify_failure(Some(127), "");
        assert!(matches!(error, CliCredentialError::CliNotFound(_)));
    }

    #[test]
    fn classifies_the_not_recognized_phrase_as_cli_not_found() {
        let stderr = "'az' is not recognized as an internal or external command";
        let error = AZURE_CLI.classify_failure(Some(1), stderr);
        assert!(matches!(error, CliCredentialError::CliNotFound(_)));
    }

    #[test]
    fn classifies_login_hints_as_not_logged_in() {
        let error = AZURE_CLI.classify_failure(Some(1), "ERROR: Please run 'az login' first");
        assert!(matches!(error, CliCredentialError::NotLoggedIn(_)));

        let error = AZURE_DEV_CLI
            .classify_failure(Some(1), "not logged in, run `azd auth login` to login");
        assert!(matches!(error, CliCredentialError::NotLoggedIn(_)));
    }

    #[test]
    fn other_failures_propagate_sanitized_stderr() {
        let stderr = r#"request denied: {"accessToken": "secretabc"}"#;
        let error = AZURE_CLI.classify_failure(Some(1), stderr);
        let CliCredentialError::AuthenticationFailed(message) = error else {
            panic!("expected AuthenticationFailed, got {error:?}");
        };
        assert!(message.contains("request denied"));
        assert!(!message.contains("secretabc"));

        let error = AZURE_CLI.classify_failure(Some(1), "");
        assert!(matches!(
            error,
            CliCredentialError::AuthenticationFailed(message) if message.contains("failed to invoke")
        ));
    }

    #[test]
    fn acquires_a_token_end_to_end() {
        let runner = Arc::new(FakeRunner::succeeding(
            r#"{"accessToken": "abc123", "expiresOn": "2030-01-01 00:00:00.000000"}"#,
        ));
        let credential = az_credential(None, &[], runner.clone());
        let token = credential
            .get_token(&["https://management.azure.com/.default"], None)
            .unwrap();
        assert_eq!(token.token.secret(), "abc123");
        assert_eq!(
            token.expires_on.unix_timestamp(),
            local_epoch("2030-01-01 00:00:00.000000")
        );
        assert_eq!(runner.run_count(), 1);
        assert_eq!(
            runner.last_command().unwrap(),
            "az account get-access-token --output json --resource https://management.azure.com"
        );
    }

    #[test]
    fn empty_scopes_fail_without_spawning() {
        let runner = Arc::new(FakeRunner::succeeding("{}"));
        let credential = az_credential(None, &[], runner.clone());
        let error = credential.get_token(&[], None).unwrap_err();
        assert!(matches!(error, CliCredentialError::InvalidRequest(_)));
        assert_eq!(runner.run_count(), 0);
    }

    #[test]
    fn missing_executable_fails_without_spawning() {
        let runner = Arc::new(FakeRunner::missing());
        let credential = az_credential(None, &[], runner.clone());
        let error = credential.get_token(&["scope"], None).unwrap_err();
        assert!(matches!(error, CliCredentialError::CliNotFound(_)));
        assert_eq!(runner.run_count(), 0);
    }

    #[test]
    fn disallowed_tenants_fail_without_spawning() {
        let runner = Arc::new(FakeRunner::succeeding("{}"));
        let credential = az_credential(Some("T1"), &["T2"], runner.clone());
        let error = credential.get_token(&["scope"], Some("T3")).unwrap_err();
        assert!(matches!(error, CliCredentialError::InvalidTenant(_)));
        assert_eq!(runner.run_count(), 0);
    }

    #[test]
    fn allowed_tenant_overrides_reach_the_command_line() {
        let runner = Arc::new(FakeRunner::succeeding(
            r#"{"accessToken": "abc123", "expiresOn": "2030-01-01 00:00:00.000000"}"#,
        ));
        let credential = az_credential(Some("T1"), &["T2"], runner.clone());
        credential.get_token(&["scope"], Some("T2")).unwrap();
        assert!(runner.last_command().unwrap().ends_with("--tenant T2"));
    }

    #[test]
    fn wildcard_allow_list_permits_any_override() {
        let runner = Arc::new(FakeRunner::succeeding(
            r#"{"accessToken": "abc123", "expiresOn": "2030-01-01 00:00:00.000000"}"#,
        ));
        let credential = az_credential(Some("T1"), &["*"], runner.clone());
        credential.get_token(&["scope"], Some("T3")).unwrap();
        assert!(runner.last_command().unwrap().ends_with("--tenant T3"));
    }

    #[test]
    fn exit_127_after_the_precheck_is_still_cli_not_found() {
        let runner = Arc::new(FakeRunner::failing(127, "/bin/sh: az: command not found"));
        let credential = az_credential(None, &[], runner);
        let error = credential.get_token(&["scope"], None).unwrap_err();
        assert!(matches!(error, CliCredentialError::CliNotFound(_)));
    }

    #[test]
    fn unparseable_output_is_reported_without_the_token() {
        let runner = Arc::new(FakeRunner::succeeding(
            r#"{"accessToken": "secretabc", "expiresOn": "bad-date"}"#,
        ));
        let credential = az_credential(None, &[], runner);
        let error = credential.get_token(&["scope"], None).unwrap_err();
        let CliCredentialError::UnexpectedOutput(message) = error else {
            panic!("expected UnexpectedOutput, got {error:?}");
        };
        assert!(message.contains("****"));
        assert!(!message.contains("secretabc"));
    }
}
