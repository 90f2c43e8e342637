//! Identifier newtypes shared by every marketplace payload

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Wrap a raw backend id
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// The raw backend id
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(
    /// Id of a marketplace user
    UserId
);

id_type!(
    /// Id of a direct message
    MessageId
);

id_type!(
    /// Id of a friend request, message request or worker invitation record
    RequestId
);

id_type!(
    /// Id of a dealership
    DealershipId
);
