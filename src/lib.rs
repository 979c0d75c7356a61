//! # Azure CLI Credentials
//!
//! `azure-cli-credentials` provides unofficial [`azure_core`] token
//! credentials that authenticate by shelling out to locally installed Azure
//! command-line tools.
//!
//! Both credentials run the tool as a subprocess from an OS-controlled
//! working directory, parse its JSON output into an
//! [`AccessToken`](azure_core::credentials::AccessToken), and redact token
//! values from any output that ends up in an error message. They never cache
//! tokens and never retry; callers needing either must layer it on top.
//!
//! ## Modules
//!
//! - `azure_cli_credentials`: Authenticates via the [Azure CLI](https://learn.microsoft.com/cli/azure/) (`az`), using the identity from a prior `az login`.
//! - `azure_developer_cli_credentials`: Authenticates via the [Azure Developer CLI](https://aka.ms/azure-dev) (`azd`), using the identity from a prior `azd auth login`.
//! - `error`: The error taxonomy shared by both credentials, distinguishing "credential unavailable" failures from rejected requests.
//!

#![forbid(unsafe_code)]
#![deny(clippy::indexing_slicing, clippy::manual_assert)]
#![cfg_attr(
    not(test),
    deny(clippy::panic, clippy::expect_used, clippy::unwrap_used)
)]

pub mod azure_cli_credentials;
pub mod azure_developer_cli_credentials;
pub mod error;

mod cli_token_credentials;
mod process;
mod tenant;
