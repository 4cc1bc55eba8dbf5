//! Network range policy.

/// Which address ranges the proxy may connect to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Policy {
    /// Only public addresses. Loopback, link-local, private, unspecified
    /// and cloud metadata endpoints are refused, as is the `localhost` name.
    #[default]
    PublicOnly,

    /// No range filtering at all. Deny and allow lists still apply.
    ///
    /// Only meant for tests that proxy to a server on the loopback interface.
    AllowAll,
}

impl Policy {
    /// Policy matching the `no_ip_filtering` configuration flag.
    pub fn from_no_ip_filtering(disabled: bool) -> Self {
        if disabled {
            Self::AllowAll
        } else {
            Self::PublicOnly
        }
    }

    /// Whether addresses and hostnames are checked against the blocklists.
    pub fn filters_ranges(self) -> bool {
        self == Self::PublicOnly
    }
}
