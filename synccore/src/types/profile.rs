use serde::{Deserialize, Serialize};

/// The closed set of participant kinds that can author a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    #[default]
    Tenant,
    Manager,
    Owner,
    Staff,
    System,
}

impl SenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderKind::Tenant => "tenant",
            SenderKind::Manager => "manager",
            SenderKind::Owner => "owner",
            SenderKind::Staff => "staff",
            SenderKind::System => "system",
        }
    }
}

impl std::fmt::Display for SenderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Denormalized sender snapshot embedded in a message at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SenderProfile {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl SenderProfile {
    pub fn new(
        id: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Stand-in profile used when the real one cannot be resolved.
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first_name: "Unknown".to_string(),
            last_name: String::new(),
            email: None,
        }
    }

    pub fn display_name(&self) -> String {
        match (self.first_name.trim(), self.last_name.trim()) {
            ("", "") => self.id.clone(),
            (first, "") => first.to_string(),
            ("", last) => last.to_string(),
            (first, last) => format!("{first} {last}"),
        }
    }
}

/// The signed-in user on whose behalf the client syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: String,
    pub kind: SenderKind,
    pub profile: SenderProfile,
}

impl Viewer {
    pub fn new(profile: SenderProfile, kind: SenderKind) -> Self {
        Self {
            id: profile.id.clone(),
            kind,
            profile,
        }
    }
}
