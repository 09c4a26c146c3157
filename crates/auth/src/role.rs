#![forbid(unsafe_code)]

//! Role bitmasks.
//!
//! A role is a `u32`: the high 16 bits are `category << 8 | subcategory`,
//! the low 16 bits are a function mask. A held role covers a required role
//! when both name the same category/subcategory and the held functions are
//! a superset of the required ones.

use std::fmt;

pub const FN_LIST: u16 = 0x01;
pub const FN_READ: u16 = 0x02;
pub const FN_CREATE: u16 = 0x04;
pub const FN_UPDATE: u16 = 0x08;
pub const FN_DELETE: u16 = 0x10;
pub const FN_READ_LIST: u16 = 0x20;
pub const FN_ALL: u16 = FN_LIST | FN_READ | FN_CREATE | FN_UPDATE | FN_DELETE | FN_READ_LIST;

pub const CATEGORY_ORG: u8 = 0x01;
pub const CATEGORY_STORE: u8 = 0x03;

pub const ORG_PROFILE: u16 = category_sub(CATEGORY_ORG, 0x01);
pub const ORG_ROLES: u16 = category_sub(CATEGORY_ORG, 0x02);
pub const ORG_INVITES: u16 = category_sub(CATEGORY_ORG, 0x03);
pub const ORG_STORES: u16 = category_sub(CATEGORY_ORG, 0x04);

pub const STORE_PROFILE: u16 = category_sub(CATEGORY_STORE, 0x01);
pub const STORE_INVITES: u16 = category_sub(CATEGORY_STORE, 0x03);
pub const STORE_ACCESS: u16 = category_sub(CATEGORY_STORE, 0x06);
pub const STORE_ENTRIES: u16 = category_sub(CATEGORY_STORE, 0x07);

pub const ROLES_MANAGER: Role = Role::new(ORG_ROLES, FN_UPDATE);
pub const INVITES_MANAGER: Role = Role::new(ORG_INVITES, FN_CREATE);

/// Granted to organization invitees when the invitation names no roles.
pub const ORG_BASELINE: [Role; 2] = [
    Role::new(ORG_PROFILE, FN_LIST | FN_READ),
    Role::new(ORG_STORES, FN_LIST),
];

/// Granted to store invitees when the invitation names no roles.
/// Encodes as `50724865,50790403`.
pub const STORE_BASELINE: [Role; 2] = [
    Role::new(STORE_ACCESS, FN_LIST),
    Role::new(STORE_ENTRIES, FN_LIST | FN_READ),
];

/// Held by organization creators and anyone toggled to admin.
pub const ORG_ADMIN: [Role; 4] = [
    Role::new(ORG_PROFILE, FN_ALL),
    Role::new(ORG_ROLES, FN_ALL),
    Role::new(ORG_INVITES, FN_ALL),
    Role::new(ORG_STORES, FN_ALL),
];

/// Held by store creators.
pub const STORE_ADMIN: [Role; 4] = [
    Role::new(STORE_PROFILE, FN_ALL),
    Role::new(STORE_INVITES, FN_ALL),
    Role::new(STORE_ACCESS, FN_ALL),
    Role::new(STORE_ENTRIES, FN_ALL),
];

#[must_use]
pub const fn category_sub(category: u8, subcategory: u8) -> u16 {
    ((category as u16) << 8) | subcategory as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Role(u32);

impl Role {
    #[must_use]
    pub const fn new(category_sub: u16, functions: u16) -> Self {
        Self(((category_sub as u32) << 16) | functions as u32)
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn category_sub(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[must_use]
    pub const fn category(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[must_use]
    pub const fn functions(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    #[must_use]
    pub const fn covers(self, required: Role) -> bool {
        self.category_sub() == required.category_sub()
            && (self.functions() & required.functions()) == required.functions()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseRoleError {
    #[error("invalid role value {0:?}")]
    InvalidValue(String),
}

/// An unordered set of held or required roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet(Vec<Role>);

impl RoleSet {
    #[must_use]
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        let mut set = Self::default();
        for role in roles {
            set.insert(role);
        }
        set
    }

    /// Decimal integers separated by commas; blanks are ignored.
    pub fn parse_csv(raw: &str) -> Result<Self, ParseRoleError> {
        let mut roles = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let bits = part
                .parse::<u32>()
                .map_err(|_| ParseRoleError::InvalidValue(part.to_owned()))?;
            roles.push(Role::from_bits(bits));
        }
        Ok(Self::new(roles))
    }

    #[must_use]
    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn insert(&mut self, role: Role) {
        if !self.0.contains(&role) {
            self.0.push(role);
        }
    }

    #[must_use]
    pub fn roles(&self) -> &[Role] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn covers(&self, required: Role) -> bool {
        self.0.iter().any(|held| held.covers(required))
    }

    /// Every required role is covered by some held role.
    #[must_use]
    pub fn satisfies(&self, required: &[Role]) -> bool {
        required.iter().all(|role| self.covers(*role))
    }

    #[must_use]
    pub fn all_in_category(&self, category: u8) -> bool {
        self.0.iter().all(|role| role.category() == category)
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<T: IntoIterator<Item = Role>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_baseline_matches_documented_integers() {
        let baseline = RoleSet::new(STORE_BASELINE);
        assert_eq!(baseline.to_csv(), "50724865,50790403");
        assert_eq!(
            RoleSet::parse_csv("50724865,50790403").expect("parse"),
            baseline
        );
    }

    #[test]
    fn role_fields_round_trip() {
        let role = Role::new(ORG_INVITES, FN_CREATE | FN_LIST);
        assert_eq!(role.category(), CATEGORY_ORG);
        assert_eq!(role.category_sub(), 0x0103);
        assert_eq!(role.functions(), FN_CREATE | FN_LIST);
        assert_eq!(role.bits(), 0x0103_0005);
    }

    #[test]
    fn check_requires_same_category_and_superset_functions() {
        let held = RoleSet::new([Role::new(STORE_ENTRIES, FN_LIST | FN_READ)]);
        assert!(held.satisfies(&[Role::new(STORE_ENTRIES, FN_READ)]));
        assert!(held.satisfies(&[Role::new(STORE_ENTRIES, FN_LIST | FN_READ)]));
        assert!(!held.satisfies(&[Role::new(STORE_ENTRIES, FN_UPDATE)]));
        assert!(!held.satisfies(&[Role::new(STORE_ACCESS, FN_LIST)]));
        assert!(held.satisfies(&[]));
    }

    #[test]
    fn check_matches_quantified_definition() {
        let functions = [0, FN_LIST, FN_READ, FN_LIST | FN_READ, FN_ALL];
        let cats = [ORG_ROLES, STORE_ENTRIES];
        for held_cat in cats {
            for held_fn in functions {
                for req_cat in cats {
                    for req_fn in functions {
                        let held = RoleSet::new([Role::new(held_cat, held_fn)]);
                        let required = [Role::new(req_cat, req_fn)];
                        let expected = held_cat == req_cat && (held_fn & req_fn) == req_fn;
                        assert_eq!(held.satisfies(&required), expected);
                    }
                }
            }
        }
    }

    #[test]
    fn parse_csv_tolerates_blanks_and_rejects_garbage() {
        assert!(RoleSet::parse_csv("").expect("empty").is_empty());
        assert_eq!(RoleSet::parse_csv(" 1 , ,2").expect("spaced").roles().len(), 2);
        assert_eq!(
            RoleSet::parse_csv("1,x"),
            Err(ParseRoleError::InvalidValue("x".to_owned()))
        );
        assert!(RoleSet::parse_csv("-1").is_err());
    }

    #[test]
    fn duplicate_roles_collapse() {
        let set = RoleSet::new([ROLES_MANAGER, ROLES_MANAGER, INVITES_MANAGER]);
        assert_eq!(set.roles().len(), 2);
    }

    #[test]
    fn admin_sets_cover_managers() {
        let admin = RoleSet::new(ORG_ADMIN);
        assert!(admin.covers(ROLES_MANAGER));
        assert!(admin.covers(INVITES_MANAGER));
        assert!(admin.all_in_category(CATEGORY_ORG));
        assert!(!RoleSet::new(ORG_BASELINE).covers(ROLES_MANAGER));
        assert!(RoleSet::new(STORE_ADMIN).all_in_category(CATEGORY_STORE));
    }
}
