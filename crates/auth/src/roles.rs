use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use tackroom_core::DomainError;

/// Role of an authenticated principal.
///
/// Variants are declared in privilege order, so `Ord` ranks them:
/// `User < Fitter < Factory < Admin < Supervisor`.
///
/// The numeric codes stored in the database are a separate mapping
/// ([`Role::code`] / [`Role::from_code`]) and do not follow privilege order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Fitter,
    Factory,
    Admin,
    Supervisor,
}

impl Role {
    /// Role assumed when nothing else is known (cleared context, unset variable).
    pub const DEFAULT: Role = Role::User;

    pub const ALL: [Role; 5] = [
        Role::User,
        Role::Fitter,
        Role::Factory,
        Role::Admin,
        Role::Supervisor,
    ];

    /// Database-facing numeric code.
    pub const fn code(self) -> i16 {
        match self {
            Role::Admin => 1,
            Role::User => 2,
            Role::Fitter => 3,
            Role::Factory => 4,
            Role::Supervisor => 5,
        }
    }

    pub const fn from_code(code: i16) -> Option<Role> {
        match code {
            1 => Some(Role::Admin),
            2 => Some(Role::User),
            3 => Some(Role::Fitter),
            4 => Some(Role::Factory),
            5 => Some(Role::Supervisor),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Fitter => "FITTER",
            Role::Factory => "FACTORY",
            Role::Admin => "ADMIN",
            Role::Supervisor => "SUPERVISOR",
        }
    }

    /// Whether this role is at least as privileged as `other`.
    pub fn at_least(self, other: Role) -> bool {
        self >= other
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown role '{s}'")))
    }
}

impl TryFrom<i16> for Role {
    type Error = DomainError;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        Role::from_code(code).ok_or(DomainError::UnknownRoleCode(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn user_is_code_two_and_default() {
        assert_eq!(Role::User.code(), 2);
        assert_eq!(Role::default(), Role::User);
    }

    #[test]
    fn privilege_order_puts_supervisor_on_top() {
        let mut roles = Role::ALL.to_vec();
        roles.sort();
        assert_eq!(roles.last(), Some(&Role::Supervisor));
        assert!(Role::Admin < Role::Supervisor);
        assert!(Role::User < Role::Fitter);
        assert!(Role::Admin.at_least(Role::Factory));
        assert!(!Role::Fitter.at_least(Role::Factory));
    }

    #[test]
    fn codes_are_unique() {
        let mut codes: Vec<i16> = Role::ALL.iter().map(|r| r.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), Role::ALL.len());
    }

    #[test]
    fn parses_case_insensitively_and_serializes_upper() {
        assert_eq!("factory".parse::<Role>().unwrap(), Role::Factory);
        assert!("owner".parse::<Role>().is_err());
        assert_eq!(serde_json::to_string(&Role::Supervisor).unwrap(), "\"SUPERVISOR\"");
    }

    proptest! {
        /// Every code either maps to a role whose code is itself, or to nothing.
        #[test]
        fn code_mapping_is_a_bijection(code in any::<i16>()) {
            match Role::from_code(code) {
                Some(role) => prop_assert_eq!(role.code(), code),
                None => prop_assert!(Role::ALL.iter().all(|r| r.code() != code)),
            }
        }
    }
}
