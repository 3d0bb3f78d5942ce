//! Host record types.
//!
//! A host record holds one remote endpoint and its login secret. The
//! secret is plaintext in memory; it only reaches disk through the vault.

use std::fmt;

use uuid::Uuid;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default group tag for new hosts.
pub const DEFAULT_GROUP: &str = "default";

/// Stable identity of a host record.
///
/// Generated once at construction and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(Uuid);

impl HostId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }

    /// Returns the first eight characters, for compact display.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A saved remote host.
#[derive(Clone, PartialEq, Eq)]
pub struct HostRecord {
    id: HostId,
    /// Hostname or IP address.
    pub address: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Login name.
    pub login: String,
    /// Login secret, plaintext in memory.
    pub secret: String,
    /// Display name; never empty.
    label: String,
    /// Free-text group tag.
    pub group: String,
    /// Free-text description.
    pub description: String,
}

impl HostRecord {
    /// Creates a host with a fresh id, default port and group, and the
    /// address as label.
    #[must_use]
    pub fn new(address: impl Into<String>, login: impl Into<String>, secret: impl Into<String>) -> Self {
        let address = address.into();
        assert!(!address.is_empty(), "address must not be empty");

        Self {
            id: HostId::generate(),
            label: address.clone(),
            address,
            port: DEFAULT_PORT,
            login: login.into(),
            secret: secret.into(),
            group: DEFAULT_GROUP.to_string(),
            description: String::new(),
        }
    }

    /// Rebuilds a record with a known id (used when loading from disk).
    pub(crate) fn restore(id: HostId, address: String, label: String) -> Self {
        let label = if label.trim().is_empty() {
            address.clone()
        } else {
            label
        };

        Self {
            id,
            address,
            port: DEFAULT_PORT,
            login: String::new(),
            secret: String::new(),
            label,
            group: DEFAULT_GROUP.to_string(),
            description: String::new(),
        }
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        assert!(port > 0, "port must be greater than 0");
        self.port = port;
        self
    }

    /// Sets the label; an empty label keeps the address.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.set_label(label.into());
        self
    }

    /// Sets the group tag.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Returns the record's id.
    #[must_use]
    pub fn id(&self) -> HostId {
        self.id
    }

    /// Returns the display label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sets the label, falling back to the address when empty.
    pub fn set_label(&mut self, label: String) {
        self.label = if label.trim().is_empty() {
            self.address.clone()
        } else {
            label
        };
    }

    /// Returns `address` or `address:port` for non-default ports.
    #[must_use]
    pub fn connection_string(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Returns `label (login@address:port)`.
    #[must_use]
    pub fn display(&self) -> String {
        format!(
            "{} ({}@{}:{})",
            self.label, self.login, self.address, self.port
        )
    }

    /// Returns true if label, address or description contains `query`,
    /// ignoring case. `query` must already be lowercase.
    pub(crate) fn matches_lowercase(&self, query: &str) -> bool {
        self.label.to_lowercase().contains(query)
            || self.address.to_lowercase().contains(query)
            || self.description.to_lowercase().contains(query)
    }

    /// Validates and applies a set of changes.
    ///
    /// Either every change applies or none does.
    pub fn apply(&mut self, changes: &[HostChange]) -> Result<(), ChangeError> {
        for change in changes {
            change.validate()?;
        }

        for change in changes {
            match change {
                HostChange::Address(address) => {
                    let follow = self.label == self.address;
                    self.address.clone_from(address);
                    if follow {
                        self.label.clone_from(address);
                    }
                }
                HostChange::Port(port) => self.port = *port,
                HostChange::Login(login) => self.login.clone_from(login),
                HostChange::Secret(secret) => self.secret.clone_from(secret),
                HostChange::Label(label) => self.set_label(label.clone()),
                HostChange::Group(group) => self.group.clone_from(group),
                HostChange::Description(text) => self.description.clone_from(text),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRecord")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("secret", &"<redacted>")
            .field("group", &self.group)
            .field("description", &self.description)
            .finish()
    }
}

impl fmt::Display for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// One typed update to a host record.
#[derive(Clone, PartialEq, Eq)]
pub enum HostChange {
    /// New address.
    Address(String),
    /// New port.
    Port(u16),
    /// New login.
    Login(String),
    /// New secret.
    Secret(String),
    /// New label; empty resets to the address.
    Label(String),
    /// New group tag.
    Group(String),
    /// New description.
    Description(String),
}

impl HostChange {
    /// Parses a `field=value` pair (CLI form).
    pub fn parse(field: &str, value: &str) -> Result<Self, ChangeError> {
        let change = match field.trim().to_lowercase().as_str() {
            "address" | "host" | "hostname" => Self::Address(value.to_string()),
            "port" => Self::Port(
                value
                    .trim()
                    .parse()
                    .map_err(|_| ChangeError::InvalidPort(value.to_string()))?,
            ),
            "login" | "user" | "username" => Self::Login(value.to_string()),
            "secret" | "password" => Self::Secret(value.to_string()),
            "label" | "name" => Self::Label(value.to_string()),
            "group" => Self::Group(value.to_string()),
            "description" | "desc" => Self::Description(value.to_string()),
            other => return Err(ChangeError::UnknownField(other.to_string())),
        };
        change.validate()?;
        Ok(change)
    }

    /// Checks the new value.
    pub fn validate(&self) -> Result<(), ChangeError> {
        match self {
            Self::Address(address) if address.trim().is_empty() => Err(ChangeError::EmptyAddress),
            Self::Port(0) => Err(ChangeError::InvalidPort("0".to_string())),
            _ => Ok(()),
        }
    }

    /// Returns the field name this change targets.
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::Address(_) => "address",
            Self::Port(_) => "port",
            Self::Login(_) => "login",
            Self::Secret(_) => "secret",
            Self::Label(_) => "label",
            Self::Group(_) => "group",
            Self::Description(_) => "description",
        }
    }
}

impl fmt::Debug for HostChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("Secret(<redacted>)"),
            Self::Address(v) => f.debug_tuple("Address").field(v).finish(),
            Self::Port(v) => f.debug_tuple("Port").field(v).finish(),
            Self::Login(v) => f.debug_tuple("Login").field(v).finish(),
            Self::Label(v) => f.debug_tuple("Label").field(v).finish(),
            Self::Group(v) => f.debug_tuple("Group").field(v).finish(),
            Self::Description(v) => f.debug_tuple("Description").field(v).finish(),
        }
    }
}

/// Rejected host change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeError {
    /// Address would become empty.
    #[error("address must not be empty")]
    EmptyAddress,
    /// Port is zero or not a number.
    #[error("invalid port: {0}")]
    InvalidPort(String),
    /// Field name not recognized.
    #[error("unknown host field: {0}")]
    UnknownField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let host = HostRecord::new("10.0.0.5", "root", "pw");

        assert_eq!(host.label(), "10.0.0.5");
        assert_eq!(host.port, DEFAULT_PORT);
        assert_eq!(host.group, DEFAULT_GROUP);
        assert!(host.description.is_empty());
    }

    #[test]
    fn test_ids_unique() {
        let a = HostRecord::new("h", "u", "p");
        let b = HostRecord::new("h", "u", "p");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_empty_label_falls_back() {
        let host = HostRecord::new("db.local", "u", "p").with_label("  ");
        assert_eq!(host.label(), "db.local");
    }

    #[test]
    fn test_connection_string() {
        let host = HostRecord::new("web", "u", "p");
        assert_eq!(host.connection_string(), "web");
        assert_eq!(host.with_port(2222).connection_string(), "web:2222");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let host = HostRecord::new("web", "u", "topsecret");
        let text = format!("{:?}", host);
        assert!(!text.contains("topsecret"));
        assert!(text.contains("<redacted>"));
        assert!(!format!("{:?}", HostChange::Secret("topsecret".into())).contains("topsecret"));
    }

    #[test]
    fn test_apply_changes() {
        let mut host = HostRecord::new("old", "u", "p");
        host.apply(&[
            HostChange::Address("new".into()),
            HostChange::Port(2200),
            HostChange::Group("prod".into()),
        ])
        .unwrap();

        assert_eq!(host.address, "new");
        assert_eq!(host.label(), "new", "default label follows address");
        assert_eq!(host.port, 2200);
        assert_eq!(host.group, "prod");
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let mut host = HostRecord::new("keep", "u", "p");
        let before = host.clone();

        let err = host
            .apply(&[HostChange::Login("x".into()), HostChange::Port(0)])
            .unwrap_err();
        assert!(matches!(err, ChangeError::InvalidPort(_)));
        assert_eq!(host, before);
    }

    #[test]
    fn test_parse_change() {
        assert_eq!(
            HostChange::parse("port", "2022").unwrap(),
            HostChange::Port(2022)
        );
        assert_eq!(
            HostChange::parse("name", "Web").unwrap(),
            HostChange::Label("Web".into())
        );
        assert!(HostChange::parse("port", "abc").is_err());
        assert!(HostChange::parse("address", "").is_err());
        assert!(matches!(
            HostChange::parse("colour", "red"),
            Err(ChangeError::UnknownField(_))
        ));
    }
}
