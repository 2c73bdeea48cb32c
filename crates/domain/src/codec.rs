//! Mapping between domain events and stored records.

use serde_json::{Map, Value};

use crate::aggregate::DomainEvent;
use crate::error::{DomainError, Result};

/// Per-type serialization adapter used by repositories.
///
/// `encode` yields the persisted `(event_type, payload)` pair; `decode` must
/// accept every pair `encode` has ever produced for the type.
pub trait EventCodec<E: DomainEvent>: Send + Sync + 'static {
    fn encode(&self, event: &E) -> Result<(&'static str, Value)>;

    /// Fails with `Schema` when the record does not map onto `E`.
    fn decode(&self, event_type: &str, payload: &Value) -> Result<E>;
}

/// JSON codec for adjacently tagged event enums.
///
/// Expects `#[serde(tag = "type", content = "data")]`: the tag is stored as
/// `event_type` and the content as `payload`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

const TAG: &str = "type";
const CONTENT: &str = "data";

impl<E: DomainEvent> EventCodec<E> for JsonCodec {
    fn encode(&self, event: &E) -> Result<(&'static str, Value)> {
        let event_type = event.event_type();
        let payload = match serde_json::to_value(event)? {
            Value::Object(mut fields) => {
                if let Some(tag) = fields.get(TAG)
                    && tag.as_str() != Some(event_type)
                {
                    return Err(DomainError::Schema {
                        event_type: event_type.to_string(),
                        reason: format!("serialized tag {tag} does not match event_type()"),
                    });
                }
                fields.remove(CONTENT).unwrap_or(Value::Null)
            }
            other => other,
        };
        Ok((event_type, payload))
    }

    fn decode(&self, event_type: &str, payload: &Value) -> Result<E> {
        let mut tagged = Map::with_capacity(2);
        tagged.insert(TAG.to_string(), Value::String(event_type.to_string()));
        if !payload.is_null() {
            tagged.insert(CONTENT.to_string(), payload.clone());
        }

        serde_json::from_value(Value::Object(tagged)).map_err(|e| DomainError::Schema {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum PetEvent {
        PetRegistered { name: String, species: String },
        PetArchived,
    }

    impl DomainEvent for PetEvent {
        fn event_type(&self) -> &'static str {
            match self {
                PetEvent::PetRegistered { .. } => "PetRegistered",
                PetEvent::PetArchived => "PetArchived",
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum Mislabeled {
        Real,
    }

    impl DomainEvent for Mislabeled {
        fn event_type(&self) -> &'static str {
            "Fake"
        }
    }

    #[test]
    fn encode_splits_tag_and_payload() {
        let event = PetEvent::PetRegistered {
            name: "Rex".into(),
            species: "dog".into(),
        };
        let (event_type, payload) = JsonCodec.encode(&event).unwrap();
        assert_eq!(event_type, "PetRegistered");
        assert_eq!(payload, json!({"name": "Rex", "species": "dog"}));
    }

    #[test]
    fn unit_variant_has_null_payload() {
        let (event_type, payload) = JsonCodec.encode(&PetEvent::PetArchived).unwrap();
        assert_eq!(event_type, "PetArchived");
        assert!(payload.is_null());

        let decoded: PetEvent = JsonCodec.decode(event_type, &payload).unwrap();
        assert_eq!(decoded, PetEvent::PetArchived);
    }

    #[test]
    fn decode_stored_record() {
        let decoded: PetEvent = JsonCodec
            .decode("PetRegistered", &json!({"name": "Tom", "species": "cat"}))
            .unwrap();
        assert_eq!(
            decoded,
            PetEvent::PetRegistered {
                name: "Tom".into(),
                species: "cat".into()
            }
        );
    }

    #[test]
    fn unknown_event_type_is_schema_error() {
        let result: Result<PetEvent> = JsonCodec.decode("PetTeleported", &json!({}));
        match result {
            Err(DomainError::Schema { event_type, .. }) => assert_eq!(event_type, "PetTeleported"),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_schema_error() {
        let result: Result<PetEvent> = JsonCodec.decode("PetRegistered", &json!({"name": 7}));
        assert!(matches!(result, Err(DomainError::Schema { .. })));
    }

    #[test]
    fn tag_mismatch_is_rejected_on_encode() {
        let result = JsonCodec.encode(&Mislabeled::Real);
        assert!(matches!(result, Err(DomainError::Schema { .. })));
    }
}
