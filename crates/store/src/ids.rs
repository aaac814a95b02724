use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StoreResult};

// One macro for every ID wrapper keeps their shapes identical, so serialized
// payloads and sqlite rows can round-trip any of them the same way.
macro_rules! define_store_id {
    ($name:ident, $id_kind:literal) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mints a fresh, time-ordered identifier.
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StoreResult<Self> {
                Uuid::parse_str(raw)
                    .map(Self)
                    .context(InvalidIdSnafu {
                        stage: "parse-store-id",
                        id_kind: $id_kind,
                        raw: raw.to_string(),
                    })
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(raw: Uuid) -> Self {
                Self(raw)
            }
        }
    };
}

define_store_id!(ConversationId, "conversation-id");
define_store_id!(MessageId, "message-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_round_trip_through_display_and_parse() {
        let id = ConversationId::generate();
        let parsed = ConversationId::parse(&id.to_string()).expect("round-trip parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn malformed_id_is_rejected() {
        let error = MessageId::parse("not-a-uuid").expect_err("must reject");
        assert!(error.to_string().contains("message-id"));
    }
}
