use std::sync::Arc;
use std::time::Duration;

use permaudit::http::reqwest_transport::ReqwestTransport;
use permaudit::{AuditError, GraphQlClient, RateGovernor};

use crate::config::Config;

/// Per-request timeout; a stalled request becomes a retryable transport error.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build a GraphQL client from the resolved credential and configuration.
pub(crate) fn build_client(config: &Config) -> Result<GraphQlClient, Box<dyn std::error::Error>> {
    let (token, source) = config.github_token().ok_or_else(|| {
        AuditError::auth(
            "no GitHub token found; set GITHUB_PAT or GITHUB_TOKEN, or [github] token in the config file",
        )
    })?;
    tracing::info!(source = %source, "Using GitHub credential");

    let transport = ReqwestTransport::with_timeout(REQUEST_TIMEOUT)?;
    let governor = RateGovernor::new(config.rate_limit.governor_config());

    let mut client = GraphQlClient::new(Arc::new(transport), token, governor);
    if let Some(ref endpoint) = config.github.endpoint {
        tracing::debug!(endpoint = %endpoint, "Using custom GraphQL endpoint");
        client = client.with_endpoint(endpoint.clone());
    }

    Ok(client)
}
