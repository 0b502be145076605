// src/backend/jsonrpc.rs

//! JSON-RPC client for the opsi configuration service

use super::{Backend, InstalledProduct, ProductInfo, PropertyDefaults, TransferSlot};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Slot type registered for updater transfers
const TRANSFER_SLOT_TYPE: &str = "opsi_package_updater";

/// Package installation may unpack large archives
const INSTALL_TIMEOUT: Duration = Duration::from_secs(3600);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    class: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyState {
    property_id: String,
    #[serde(default)]
    values: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductObject {
    #[serde(rename = "type", default)]
    product_type: String,
    #[serde(default)]
    setup_script: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientToDepot {
    client_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductOnClient {
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct SlotResponse {
    slot_id: String,
    #[serde(default)]
    retention: Option<f64>,
}

/// Backend reached over JSON-RPC
pub struct JsonRpcBackend {
    client: Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl JsonRpcBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_cert)
            .user_agent(crate::config::DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create backend client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        self.call_with_timeout(method, params, REQUEST_TIMEOUT)
    }

    fn call_with_timeout<T: DeserializeOwned>(&self, method: &str, params: Value, timeout: Duration) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!("JSON-RPC request {}: {}", id, body);

        let mut request = self.client.post(&self.url).json(&body).timeout(timeout);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request
            .send()
            .map_err(|e| Error::BackendError(format!("{method} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::BackendError(format!("{method} failed: HTTP {status}")));
        }

        let response: RpcResponse = response
            .json()
            .map_err(|e| Error::BackendError(format!("{method}: invalid response: {e}")))?;

        if let Some(error) = response.error.filter(|e| !e.is_null()) {
            let message = match serde_json::from_value::<RpcError>(error.clone()) {
                Ok(RpcError { message: Some(message), class }) => match class {
                    Some(class) => format!("{class}: {message}"),
                    None => message,
                },
                _ => error.to_string(),
            };
            return Err(Error::BackendError(format!("{method} failed: {message}")));
        }

        serde_json::from_value(response.result)
            .map_err(|e| Error::BackendError(format!("{method}: unexpected result: {e}")))
    }
}

impl Backend for JsonRpcBackend {
    fn installed_products(&self, depot_id: &str) -> Result<Vec<InstalledProduct>> {
        self.call(
            "productOnDepot_getObjects",
            json!([[], {"depotId": depot_id}]),
        )
    }

    fn install_package(
        &self,
        package: &Path,
        property_defaults: &PropertyDefaults,
        temp_dir: Option<&Path>,
    ) -> Result<()> {
        debug!("Installing package {} on depot", package.display());
        let defaults: Value = if property_defaults.is_empty() {
            Value::Null
        } else {
            json!(property_defaults.0)
        };
        let _: Value = self.call_with_timeout(
            "depot_installPackage",
            json!([
                package.to_string_lossy(),
                true,
                defaults,
                temp_dir.map(|p| p.to_string_lossy().into_owned()),
            ]),
            INSTALL_TIMEOUT,
        )?;
        Ok(())
    }

    fn uninstall_package(&self, depot_id: &str, product_id: &str) -> Result<()> {
        debug!("Uninstalling {} from depot {}", product_id, depot_id);
        let _: Value = self.call_with_timeout(
            "depot_uninstallPackage",
            json!([product_id, true, true]),
            INSTALL_TIMEOUT,
        )?;
        Ok(())
    }

    fn product_property_defaults(&self, product_id: &str, object_id: &str) -> Result<PropertyDefaults> {
        let states: Vec<PropertyState> = self.call(
            "productPropertyState_getObjects",
            json!([[], {"productId": product_id, "objectId": object_id}]),
        )?;
        Ok(PropertyDefaults(
            states
                .into_iter()
                .map(|s| (s.property_id, s.values))
                .collect::<BTreeMap<_, _>>(),
        ))
    }

    fn product_info(&self, depot_id: &str, product_id: &str) -> Result<Option<ProductInfo>> {
        let on_depot: Vec<InstalledProduct> = self.call(
            "productOnDepot_getObjects",
            json!([[], {"depotId": depot_id, "productId": product_id}]),
        )?;
        let Some(installed) = on_depot.into_iter().next() else {
            return Ok(None);
        };

        let products: Vec<ProductObject> = self.call(
            "product_getObjects",
            json!([[], {
                "id": product_id,
                "productVersion": installed.product_version,
                "packageVersion": installed.package_version,
            }]),
        )?;

        Ok(products.into_iter().next().map(|p| ProductInfo {
            product_type: p.product_type,
            has_setup_script: p.setup_script.is_some_and(|s| !s.trim().is_empty()),
        }))
    }

    fn clients_for_depot(&self, depot_id: &str) -> Result<Vec<String>> {
        let mappings: Vec<ClientToDepot> = self.call(
            "configState_getClientToDepotserver",
            json!([[depot_id]]),
        )?;
        Ok(mappings.into_iter().map(|m| m.client_id).collect())
    }

    fn clients_with_product_installed(&self, product_id: &str, client_ids: &[String]) -> Result<Vec<String>> {
        if client_ids.is_empty() {
            return Ok(Vec::new());
        }
        let products: Vec<ProductOnClient> = self.call(
            "productOnClient_getObjects",
            json!([["clientId"], {
                "productId": product_id,
                "clientId": client_ids,
                "installationStatus": "installed",
            }]),
        )?;
        Ok(products.into_iter().map(|p| p.client_id).collect())
    }

    fn set_product_action_request(&self, product_id: &str, client_id: &str, action: &str) -> Result<()> {
        let _: Value = self.call(
            "setProductActionRequest",
            json!([product_id, client_id, action]),
        )?;
        Ok(())
    }

    fn mark_product_cache_outdated(&self, depot_id: &str) -> Result<()> {
        let _: Value = self.call(
            "config_createBool",
            json!([
                format!("opsiconfd.{depot_id}.product.cache.outdated"),
                "",
                [true],
            ]),
        )?;
        Ok(())
    }

    fn power_on_hosts(&self, host_ids: &[String]) -> Result<()> {
        let _: Value = self.call("hostControl_start", json!([host_ids]))?;
        Ok(())
    }

    fn acquire_transfer_slot(
        &self,
        depot_id: &str,
        host_id: &str,
        slot_id: Option<&str>,
    ) -> Result<TransferSlot> {
        let slot: SlotResponse = self.call(
            "depot_acquireTransferSlot",
            json!([depot_id, host_id, slot_id, TRANSFER_SLOT_TYPE]),
        )?;
        Ok(TransferSlot {
            slot_id: slot.slot_id,
            retention: slot.retention,
        })
    }

    fn release_transfer_slot(&self, depot_id: &str, host_id: &str, slot_id: &str) -> Result<()> {
        let _: Value = self.call(
            "depot_releaseTransferSlot",
            json!([depot_id, host_id, slot_id, TRANSFER_SLOT_TYPE]),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn backend(server: &MockServer) -> JsonRpcBackend {
        JsonRpcBackend::new(&BackendConfig {
            url: server.url("/rpc"),
            username: Some("admin".into()),
            password: Some("secret".into()),
            depot_id: Some("depot.example".into()),
            verify_cert: false,
        })
        .unwrap()
    }

    #[test]
    fn test_installed_products() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/rpc")
                .header_exists("authorization")
                .body_contains("\"method\":\"productOnDepot_getObjects\"");
            then.status(200).json_body(json!({
                "id": 1,
                "result": [{
                    "productId": "hwaudit",
                    "productVersion": "4.2.0.0",
                    "packageVersion": "1",
                    "depotId": "depot.example"
                }],
                "error": null
            }));
        });

        let products = backend(&server).installed_products("depot.example").unwrap();
        mock.assert();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].version().to_string(), "4.2.0.0-1");
    }

    #[test]
    fn test_rpc_error_is_reported() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/rpc");
            then.status(200).json_body(json!({
                "id": 1,
                "result": null,
                "error": {"class": "BackendPermissionDeniedError", "message": "denied"}
            }));
        });

        let err = backend(&server).mark_product_cache_outdated("depot.example").unwrap_err();
        assert!(err.to_string().contains("BackendPermissionDeniedError: denied"));
    }

    #[test]
    fn test_power_on_hosts() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/rpc")
                .body_contains("\"method\":\"hostControl_start\"")
                .body_contains("client1.example");
            then.status(200).json_body(json!({"id": 1, "result": {}, "error": null}));
        });

        backend(&server)
            .power_on_hosts(&["client1.example".to_string()])
            .unwrap();
        mock.assert();
    }

    #[test]
    fn test_acquire_transfer_slot() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/rpc")
                .body_contains("depot_acquireTransferSlot")
                .body_contains(TRANSFER_SLOT_TYPE);
            then.status(200).json_body(json!({
                "id": 1,
                "result": {"slot_id": "abc", "retention": 60.0},
                "error": null
            }));
        });

        let slot = backend(&server)
            .acquire_transfer_slot("peer.example", "depot.example", None)
            .unwrap();
        assert_eq!(slot.slot_id, "abc");
        assert_eq!(slot.retention, Some(60.0));
    }
}
