use crate::error::CliCredentialError;

/// Tenants may restrict token acquisition; `"*"` in the allow-list permits
/// any tenant the logged-in account can access.
pub(crate) const WILDCARD_TENANT: &str = "*";

/// Tenant ids are GUIDs or verified domain names; anything else is rejected
/// before it can reach a command line.
pub(crate) fn validate_tenant_id(tenant_id: &str) -> Result<(), CliCredentialError> {
    if tenant_id.is_empty()
        || !tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(CliCredentialError::InvalidTenant(format!(
            "invalid tenant id {tenant_id:?}: expected alphanumeric characters, '.', and '-' only"
        )));
    }
    Ok(())
}

/// Determine the tenant to request a token for, or `None` to use the CLI's
/// current context.
///
/// A caller-supplied tenant that differs from the configured default must
/// appear in `additionally_allowed_tenants` (or the list must contain the
/// wildcard); when no default is configured, any requested tenant is
/// accepted.
pub(crate) fn resolve_tenant(
    default_tenant: Option<&str>,
    requested: Option<&str>,
    additionally_allowed_tenants: &[String],
) -> Result<Option<String>, CliCredentialError> {
    let default_tenant = default_tenant.filter(|tenant| !tenant.is_empty());
    let resolved = match (default_tenant, requested) {
        (default, None) => default,
        (None, Some(requested)) => Some(requested),
        (Some(default), Some(requested)) if default == requested => Some(default),
        (Some(_), Some(requested)) => {
            if additionally_allowed_tenants
                .iter()
                .any(|allowed| allowed == WILDCARD_TENANT || allowed == requested)
            {
                Some(requested)
            } else {
                return Err(CliCredentialError::InvalidTenant(format!(
                    "the current credential is not configured to acquire tokens for tenant \
                     {requested:?}; to enable this, add the tenant (or the wildcard \"*\") to \
                     additionally_allowed_tenants when building the credential"
                )));
            }
        }
    };
    resolved
        .map(|tenant| validate_tenant_id(tenant).map(|()| tenant.to_owned()))
        .transpose()
}
