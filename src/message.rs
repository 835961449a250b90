use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rabbitmq::broker::{Delivery, PublishFields};

/// One unit of data moving through a queue.
///
/// Fields are private: the id is fixed at creation (either freshly generated
/// or copied from an inbound delivery) and never changes afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Payload", with = "payload_base64")]
    payload: Vec<u8>,
    #[serde(rename = "ContentType")]
    content_type: String,
    #[serde(rename = "CorrelationID")]
    correlation_id: String,
    #[serde(rename = "AppID")]
    app_id: String,
}

impl Message {
    /// Creates a new Message with a generated UUID.
    pub fn create(
        correlation_id: impl Into<String>,
        app_id: impl Into<String>,
        kind: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload: payload.into(),
            content_type: content_type.into(),
            correlation_id: correlation_id.into(),
            app_id: app_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// The JSON rendering used for logging and external consumers.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        Message {
            id: delivery.message_id,
            kind: delivery.kind,
            payload: delivery.body,
            content_type: delivery.content_type,
            correlation_id: delivery.correlation_id,
            app_id: delivery.app_id,
        }
    }
}

impl From<&Message> for PublishFields {
    fn from(message: &Message) -> Self {
        PublishFields {
            message_id: message.id.clone(),
            kind: message.kind.clone(),
            content_type: message.content_type.clone(),
            correlation_id: message.correlation_id.clone(),
            app_id: message.app_id.clone(),
            body: message.payload.clone(),
        }
    }
}

// Byte payloads travel as standard base64 strings in JSON.
mod payload_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}
