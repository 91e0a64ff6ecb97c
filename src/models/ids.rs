use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, From, Display, Deref, FromStr, utoipa::ToSchema,
        )]
        #[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
        #[cfg_attr(feature = "postgres-store", sqlx(transparent))]
        #[schema(value_type = Uuid)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

opaque_id!(MessageId);
opaque_id!(WorkspaceId);
opaque_id!(PoolId);
