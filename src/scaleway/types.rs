//! Newtypes for Scaleway server values to avoid stringly-typed code.

use std::ops::Deref;

macro_rules! newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, Hash, PartialEq)]
        pub struct $name(String);

        impl $name {
            /// Returns the wrapped value.
            #[must_use]
            pub const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

newtype!(
    /// Scaleway server UUID.
    ServerId
);
newtype!(
    /// Availability zone such as `fr-par-1`.
    Zone
);
newtype!(
    /// Server state as reported by the Instances API.
    ServerState
);
newtype!(
    /// Server action name such as `poweron` or `terminate`.
    Action
);

impl ServerState {
    /// Returns `true` once the server has booted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.as_str() == "running"
    }
}

impl Action {
    /// Boots a stopped server.
    #[must_use]
    pub fn power_on() -> Self {
        Self::from("poweron")
    }

    /// Deletes a running server together with its volumes.
    #[must_use]
    pub fn terminate() -> Self {
        Self::from("terminate")
    }
}
