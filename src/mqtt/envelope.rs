//! Thing-model JSON envelope: the wire structure published upstream for
//! property/event batches, and the reply envelope for service/property-set
//! calls.
//!
//! Grounded on `original_source/mqttProtocol/tools.go`
//! (`GatewayBatchReqBuilder`), `mqttProtocol/commonModel.go`,
//! `mqttProtocol/propertyModel.go` and `mqttProtocol/serviceCallModel.go` for
//! the exact field names/shapes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SysInfo {
    pub ack: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyNode {
    pub value: Value,
    pub time: i64,
}

impl PropertyNode {
    pub fn now(value: Value) -> Self {
        Self {
            value,
            time: now_unix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventNode {
    pub value: Value,
    pub time: i64,
}

impl EventNode {
    pub fn now(value: Value) -> Self {
        Self {
            value,
            time: now_unix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "productKey")]
    pub product_key: String,
    #[serde(rename = "deviceKey")]
    pub device_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubDevice {
    pub identity: Identity,
    pub properties: HashMap<String, PropertyNode>,
    pub events: HashMap<String, EventNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayBatchParams {
    pub properties: HashMap<String, PropertyNode>,
    pub events: HashMap<String, EventNode>,
    #[serde(rename = "subDevices")]
    pub sub_devices: Vec<SubDevice>,
}

/// The envelope published on property/event topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayBatchReq {
    pub id: String,
    pub version: String,
    pub sys: SysInfo,
    pub method: String,
    pub params: GatewayBatchParams,
}

/// Method string used for every property/event batch publish, gateway
/// heartbeat included.
pub const METHOD_PROPERTY_PACK_POST: &str = "thing.event.property.pack.post";

pub struct GatewayBatchReqBuilder {
    req: GatewayBatchReq,
}

impl Default for GatewayBatchReqBuilder {
    fn default() -> Self {
        Self {
            req: GatewayBatchReq {
                id: String::new(),
                version: "1.0".to_string(),
                sys: SysInfo::default(),
                method: METHOD_PROPERTY_PACK_POST.to_string(),
                params: GatewayBatchParams {
                    properties: HashMap::new(),
                    events: HashMap::new(),
                    sub_devices: Vec::new(),
                },
            },
        }
    }
}

impl GatewayBatchReqBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.req.id = id.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.req.version = version.into();
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.req.method = method.into();
        self
    }

    pub fn add_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.req
            .params
            .properties
            .insert(key.into(), PropertyNode::now(value));
        self
    }

    pub fn add_event(mut self, key: impl Into<String>, value: Value) -> Self {
        self.req
            .params
            .events
            .insert(key.into(), EventNode::now(value));
        self
    }

    pub fn add_sub_device(mut self, sub_device: SubDevice) -> Self {
        self.req.params.sub_devices.push(sub_device);
        self
    }

    pub fn build(self) -> GatewayBatchReq {
        self.req
    }
}

/// A single sub-device's property batch, built from a decoder's
/// `PropertieDataList`/`EventDataList` payload (see `dispatcher.rs` and
/// `events.rs`'s built-in `push_attribute_data_to_mqtt` handler).
pub fn build_sub_device(
    product_key: &str,
    device_key: &str,
    properties: Value,
    events: Value,
) -> SubDevice {
    let properties = properties
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), PropertyNode::now(v.clone())))
                .collect()
        })
        .unwrap_or_default();

    let events = events
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), EventNode::now(v.clone())))
                .collect()
        })
        .unwrap_or_default();

    SubDevice {
        identity: Identity {
            product_key: product_key.to_string(),
            device_key: device_key.to_string(),
        },
        properties,
        events,
    }
}

/// Inbound service/property-set request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCallRequest {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    pub method: String,
}

/// Reply envelope published on `<topic>_reply`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceCallOutputRes {
    pub id: String,
    pub code: i32,
    pub message: String,
    pub version: String,
    pub data: Value,
}

impl ServiceCallOutputRes {
    pub fn success(message_id: impl Into<String>, data: Value) -> Self {
        Self {
            id: message_id.into(),
            code: 200,
            message: "success".to_string(),
            version: "1.0".to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_produces_expected_wire_shape() {
        let sub = build_sub_device("PK", "D1", json!({"temp": 25}), json!({}));
        let req = GatewayBatchReqBuilder::new()
            .id("abc")
            .version("1.0")
            .method(METHOD_PROPERTY_PACK_POST)
            .add_sub_device(sub)
            .build();

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["method"], "thing.event.property.pack.post");
        assert_eq!(
            value["params"]["subDevices"][0]["identity"]["deviceKey"],
            "D1"
        );
        assert_eq!(
            value["params"]["subDevices"][0]["properties"]["temp"]["value"],
            25
        );
    }

    #[test]
    fn reply_envelope_matches_reply_topic_law() {
        let res = ServiceCallOutputRes::success("m-7", json!({"ok": true}));
        let value = serde_json::to_value(&res).unwrap();
        assert_eq!(value["id"], "m-7");
        assert_eq!(value["code"], 200);
        assert_eq!(value["message"], "success");
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["data"]["ok"], true);
    }
}
