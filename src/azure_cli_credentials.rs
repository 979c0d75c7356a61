use crate::{
    cli_token_credentials::{AZURE_CLI, CliTokenCredential, acquire_on_worker},
    error::CliCredentialError,
    process::SystemCommandRunner,
    tenant::validate_tenant_id,
};
use azure_core::credentials::{AccessToken, TokenCredential, TokenRequestOptions};
use std::{sync::Arc, time::Duration};

/// Options for [`AzureCliCredential::new`].
#[derive(Debug, Clone)]
pub struct AzureCliCredentialOptions {
    /// Tenant to request tokens for. `None` uses the identity currently
    /// logged in to the Azure CLI.
    pub tenant_id: Option<String>,
    /// Tenants, in addition to `tenant_id`, the credential may acquire
    /// tokens for. Add `"*"` to allow any tenant the account can access.
    pub additionally_allowed_tenants: Vec<String>,
    /// How long to wait for the Azure CLI process to respond.
    pub process_timeout: Duration,
}

impl Default for AzureCliCredentialOptions {
    fn default() -> Self {
        Self {
            tenant_id: None,
            additionally_allowed_tenants: Vec::new(),
            process_timeout: Duration::from_secs(10),
        }
    }
}

/// Authenticates by requesting a token from the Azure CLI.
///
/// Requires a prior `az login`; the token is issued for the CLI's currently
/// logged in identity. Tokens are never cached here, so callers invoking
/// [`get_token`](TokenCredential::get_token) directly must layer their own
/// caching on top.
#[derive(Debug)]
pub struct AzureCliCredential {
    inner: CliTokenCredential,
}

impl AzureCliCredential {
    /// Create a new `AzureCliCredential` with the specified options.
    pub fn new(options: Option<AzureCliCredentialOptions>) -> azure_core::Result<Arc<Self>> {
        let options = options.unwrap_or_default();
        if let Some(tenant_id) = options.tenant_id.as_deref() {
            validate_tenant_id(tenant_id)?;
        }
        Ok(Arc::new(Self {
            inner: CliTokenCredential::new(
                &AZURE_CLI,
                options.tenant_id,
                options.additionally_allowed_tenants,
                options.process_timeout,
                Arc::new(SystemCommandRunner),
            ),
        }))
    }

    #[cfg(test)]
    fn with_runner(
        options: AzureCliCredentialOptions,
        runner: Arc<dyn crate::process::CommandRunner>,
    ) -> Self {
        Self {
            inner: CliTokenCredential::new(
                &AZURE_CLI,
                options.tenant_id,
                options.additionally_allowed_tenants,
                options.process_timeout,
                runner,
            ),
        }
    }

    /// Blocking variant of [`get_token`](TokenCredential::get_token), with an
    /// optional per-call tenant override. Blocks the calling thread for at
    /// most the configured process timeout.
    pub fn get_token_sync(
        &self,
        scopes: &[&str],
        tenant_id: Option<&str>,
    ) -> Result<AccessToken, CliCredentialError> {
        self.inner.get_token(scopes, tenant_id)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl TokenCredential for AzureCliCredential {
    async fn get_token(
        &self,
        scopes: &[&str],
        _options: Option<TokenRequestOptions<'_>>,
    ) -> azure_core::Result<AccessToken> {
        let scopes = scopes.iter().map(ToString::to_string).collect();
        acquire_on_worker(self.inner.clone(), scopes, None).await
    }
}
