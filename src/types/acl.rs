use std::fmt;

/// Describes the ability of a user to perform a certain action.
///
/// Permissions can be mixed together like integers with `|` and `&`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Permission(u32);

impl Permission {
    /// No permissions are set (server could have been configured without ACL support).
    pub const NONE: Permission = Permission(0b00000);

    /// You can access the data of a node and can list its children.
    pub const READ: Permission = Permission(0b00001);

    /// You can set the data of a node.
    pub const WRITE: Permission = Permission(0b00010);

    /// You can create a child node.
    pub const CREATE: Permission = Permission(0b00100);

    /// You can delete a child node (but not necessarily this one).
    pub const DELETE: Permission = Permission(0b01000);

    /// You can alter permissions on this node.
    pub const ADMIN: Permission = Permission(0b10000);

    /// You can do anything.
    pub const ALL: Permission = Permission(0b11111);

    /// Extract a permission value from raw bits.
    pub(crate) fn from_raw(code: u32) -> Permission {
        Permission(code)
    }

    pub(crate) fn code(self) -> u32 {
        self.0
    }

    /// Check that all `permissions` are set.
    ///
    /// ```
    /// use saber::Permission;
    ///
    /// (Permission::READ | Permission::WRITE).can(Permission::WRITE); // -> true
    /// Permission::ADMIN.can(Permission::CREATE); // -> false
    /// ```
    pub fn can(self, permissions: Permission) -> bool {
        (self & permissions) == permissions
    }
}

impl std::ops::BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Permission::from_raw(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permission::from_raw(self.0 | rhs.0)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == Permission::ALL {
            return f.write_str("ALL");
        }
        if *self == Permission::NONE {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in [
            (Permission::READ, "READ"),
            (Permission::WRITE, "WRITE"),
            (Permission::CREATE, "CREATE"),
            (Permission::DELETE, "DELETE"),
            (Permission::ADMIN, "ADMIN"),
        ] {
            if self.can(bit) {
                if !first {
                    f.write_str("|")?;
                }
                first = false;
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// An access-control list entry: a set of permissions granted to an
/// identity under some authentication scheme.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Acl {
    /// The permissions associated with this ACL.
    pub perms: Permission,
    /// The authentication scheme this list is used for. The most common
    /// scheme is `"auth"`, which allows any authenticated user to do
    /// anything (see [`Acl::creator_all`]).
    pub scheme: String,
    /// The user under the `scheme` that this ACL applies to.
    pub id: String,
}

impl Acl {
    /// This ACL gives the creators authentication id's all permissions.
    pub fn creator_all() -> &'static [Acl] {
        &*ACL_CREATOR_ALL
    }

    /// This is a completely open ACL.
    pub fn open_unsafe() -> &'static [Acl] {
        &*ACL_OPEN_UNSAFE
    }

    /// This ACL gives the world the ability to read.
    pub fn read_unsafe() -> &'static [Acl] {
        &*ACL_READ_UNSAFE
    }

    fn new(permissions: Permission, scheme: &str, id: &str) -> Acl {
        Acl {
            perms: permissions,
            scheme: scheme.to_string(),
            id: id.to_string(),
        }
    }
}

lazy_static::lazy_static! {
    static ref ACL_CREATOR_ALL: [Acl; 1] = [Acl::new(Permission::ALL, "auth", "")];
    static ref ACL_OPEN_UNSAFE: [Acl; 1] = [Acl::new(Permission::ALL, "world", "anyone")];
    static ref ACL_READ_UNSAFE: [Acl; 1] = [Acl::new(Permission::READ, "world", "anyone")];
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}:{}, {})", self.scheme, self.id, self.perms)
    }
}

/// An identity a requester authenticated as, matched against [`Acl`]
/// entries by the server's permission checks.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Id {
    /// The authentication scheme (e.g. `"world"`).
    pub scheme: String,
    /// The identity under that scheme (e.g. `"anyone"`).
    pub id: String,
}

impl Id {
    /// The identity every requester holds, whether authenticated or not.
    pub fn anyone() -> Id {
        Id {
            scheme: "world".to_string(),
            id: "anyone".to_string(),
        }
    }
}
