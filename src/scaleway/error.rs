//! Classification of Scaleway error responses.

use scaleway_rs::ScalewayApiError;

use crate::error::ProviderError;
use crate::http::HttpResponse;

const AUTH_ERROR_TYPES: [&str; 3] = ["denied_authentication", "authentication", "permissions_denied"];

/// Passes successful responses through and maps Scaleway's typed error
/// bodies onto the shared taxonomy. `resource` names what was being
/// accessed, for `NotFound` messages.
///
/// Throttling and 5xx responses never reach this point: the executor has
/// already retried them and surfaced `RateLimited` or `Transient`.
pub(crate) fn classify(resource: &str, response: HttpResponse) -> Result<HttpResponse, ProviderError> {
    if response.is_success() {
        return Ok(response);
    }
    let Ok(ScalewayApiError { message, etype, .. }) =
        serde_json::from_slice::<ScalewayApiError>(&response.body)
    else {
        return response.error_for_status(resource);
    };
    let status = response.status;
    Err(match (status, etype.as_str()) {
        (401 | 403, _) => ProviderError::Authentication {
            status,
            message,
        },
        (_, kind) if AUTH_ERROR_TYPES.contains(&kind) => ProviderError::Authentication {
            status,
            message,
        },
        (404, _) | (_, "not_found") => ProviderError::not_found(resource),
        (_, kind) => ProviderError::Api {
            status,
            message: format!("{kind}: {message}"),
        },
    })
}
