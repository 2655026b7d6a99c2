//! VirtFusion REST payloads.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// State VirtFusion reports once a build has finished.
pub(super) const BUILD_COMPLETE: &str = "complete";

#[derive(Debug, Deserialize)]
pub(super) struct Envelope<T> {
    pub(super) data: T,
}

/// One page of a paginated listing. Unpaginated responses carry no page
/// metadata and count as the only page.
#[derive(Debug, Deserialize)]
pub(super) struct Page<T> {
    pub(super) data: T,
    #[serde(default)]
    current_page: Option<u32>,
    #[serde(default)]
    last_page: Option<u32>,
}

impl<T> Page<T> {
    pub(super) const fn has_more(&self) -> bool {
        matches!(
            (self.current_page, self.last_page),
            (Some(current), Some(last)) if current < last
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateServerRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) package_id: Option<u64>,
    pub(super) user_id: u64,
    pub(super) hypervisor_id: u64,
    pub(super) ipv4: u32,
    pub(super) storage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) cores: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BuildServerRequest<'a> {
    pub(super) operating_system_id: u64,
    pub(super) name: &'a str,
    pub(super) hostname: &'a str,
    pub(super) ssh_keys: Vec<u64>,
    pub(super) email: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKey {
    pub(super) id: u64,
    pub(super) name: String,
}

/// Server record as returned by the server and listing endpoints.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ServerRecord {
    pub(super) id: u64,
    #[serde(default)]
    pub(super) name: String,
    #[serde(default)]
    pub(super) hypervisor_id: Option<u64>,
    #[serde(default)]
    pub(super) state: String,
    #[serde(default)]
    network: Option<Network>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Network {
    #[serde(default)]
    interfaces: Vec<Interface>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Interface {
    #[serde(default)]
    ipv4: Vec<Address>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Address {
    address: String,
}

impl ServerRecord {
    /// First IPv4 address on the first interface.
    pub(super) fn primary_ipv4(&self) -> Option<IpAddr> {
        self.network
            .as_ref()?
            .interfaces
            .first()?
            .ipv4
            .first()
            .and_then(|entry| entry.address.parse::<Ipv4Addr>().ok())
            .map(IpAddr::V4)
    }

    /// Address of a finished build, if any.
    pub(super) fn ready_address(&self) -> Option<IpAddr> {
        if self.state != BUILD_COMPLETE {
            return None;
        }
        self.primary_ipv4()
    }

    pub(super) fn describe_state(&self) -> String {
        if self.state.is_empty() {
            String::from("unknown")
        } else {
            self.state.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> ServerRecord {
        serde_json::from_value(value).unwrap_or_else(|err| panic!("record should decode: {err}"))
    }

    #[test]
    fn complete_servers_report_their_first_address() {
        let server = record(json!({
            "id": 7,
            "name": "web-0",
            "hypervisorId": 3,
            "state": "complete",
            "network": {"interfaces": [{"ipv4": [{"address": "192.0.2.1"}, {"address": "192.0.2.50"}]}]}
        }));
        assert_eq!(server.ready_address(), Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))));
        assert_eq!(server.hypervisor_id, Some(3));
    }

    #[test]
    fn building_servers_are_not_ready() {
        let server = record(json!({
            "id": 7,
            "state": "building",
            "network": {"interfaces": [{"ipv4": [{"address": "192.0.2.1"}]}]}
        }));
        assert_eq!(server.ready_address(), None);
        assert_eq!(server.describe_state(), "building");
    }

    #[test]
    fn sparse_records_decode() {
        let server = record(json!({"id": 9}));
        assert_eq!(server.primary_ipv4(), None);
        assert_eq!(server.describe_state(), "unknown");
    }

    #[test]
    fn pages_report_whether_more_follow() {
        let first: Page<Vec<ServerRecord>> = serde_json::from_value(json!({
            "current_page": 1, "last_page": 3, "data": [{"id": 1}]
        }))
        .unwrap_or_else(|err| panic!("page should decode: {err}"));
        let last: Page<Vec<ServerRecord>> = serde_json::from_value(json!({
            "current_page": 3, "last_page": 3, "data": [{"id": 9}]
        }))
        .unwrap_or_else(|err| panic!("page should decode: {err}"));
        let bare: Page<Vec<ServerRecord>> = serde_json::from_value(json!({"data": []}))
            .unwrap_or_else(|err| panic!("page should decode: {err}"));

        assert!(first.has_more());
        assert!(!last.has_more());
        assert!(!bare.has_more());
    }

    #[test]
    fn create_request_omits_unset_shape() {
        let body = serde_json::to_value(CreateServerRequest {
            package_id: Some(4),
            user_id: 42,
            hypervisor_id: 1,
            ipv4: 1,
            storage: 30,
            memory: None,
            cores: None,
        })
        .unwrap_or_else(|err| panic!("request should encode: {err}"));
        assert_eq!(
            body,
            json!({"packageId": 4, "userId": 42, "hypervisorId": 1, "ipv4": 1, "storage": 30})
        );
    }
}
