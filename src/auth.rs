use std::collections::HashSet;

use crate::config::Config;
use crate::error::TrackerError;
use crate::identity::Account;
use crate::store::RemoteStore;
use crate::surface::PopupAction;

pub const CAP_LOCATION_REPORT: &str = "location.report";
pub const CAP_INCIDENTS_REPORT: &str = "incidents.report";
pub const CAP_INCIDENTS_RESOLVE: &str = "incidents.resolve";
pub const CAP_ROSTER_VIEW: &str = "roster.view";

const MEMBER_CAPABILITIES: &[&str] = &[CAP_LOCATION_REPORT, CAP_INCIDENTS_REPORT];
const ADMIN_CAPABILITIES: &[&str] = &[CAP_INCIDENTS_RESOLVE, CAP_ROSTER_VIEW];

pub fn canonicalize_role(role: &str) -> String {
    let trimmed = role.trim().to_lowercase();
    match trimmed.as_str() {
        "admin" | "administrator" => "admin".to_string(),
        "operator" | "control" => "operator".to_string(),
        "view" | "viewer" | "readonly" | "read-only" | "read_only" => "view".to_string(),
        other => other.to_string(),
    }
}

/// The authenticated identity. Admin status and capabilities are derived once,
/// at construction, and passed explicitly to whatever needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub is_super_admin: bool,
    pub capabilities: HashSet<String>,
}

impl Principal {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        email: Option<String>,
        is_admin: bool,
        is_super_admin: bool,
    ) -> Self {
        let is_admin = is_admin || is_super_admin;
        let mut capabilities: HashSet<String> =
            MEMBER_CAPABILITIES.iter().map(|cap| cap.to_string()).collect();
        if is_admin {
            capabilities.extend(ADMIN_CAPABILITIES.iter().map(|cap| cap.to_string()));
        }
        Self {
            id: id.into(),
            display_name: display_name.into(),
            email,
            is_admin,
            is_super_admin,
            capabilities,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn resolve_capability(&self) -> Option<ResolveCapability> {
        self.has_capability(CAP_INCIDENTS_RESOLVE)
            .then_some(ResolveCapability { _private: () })
    }
}

/// Proof that the holder may resolve incidents; the only way to build a
/// resolve action for a marker popup.
#[derive(Debug, Clone)]
pub struct ResolveCapability {
    _private: (),
}

impl ResolveCapability {
    pub fn action_for(&self, incident_id: &str) -> PopupAction {
        PopupAction::ResolveIncident {
            incident_id: incident_id.to_string(),
        }
    }
}

pub fn require_capabilities(principal: &Principal, caps: &[&str]) -> Result<(), TrackerError> {
    let missing: Vec<&str> = caps
        .iter()
        .copied()
        .filter(|cap| !principal.has_capability(cap))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TrackerError::PermissionDenied(missing.join(", ")))
    }
}

/// Builds the principal for a freshly authenticated account. A profile that
/// cannot be read leaves the principal without admin rights.
pub async fn resolve_principal<S: RemoteStore>(
    store: &S,
    config: &Config,
    account: &Account,
) -> Principal {
    let is_super_admin = config
        .super_admin_id
        .as_deref()
        .map(|id| id == account.uid)
        .unwrap_or(false);

    let profile = match store
        .read_document(&config.users_collection, &account.uid)
        .await
    {
        Ok(profile) => profile,
        Err(err) => {
            tracing::warn!(user_id = %account.uid, error = %err, "failed to read user profile; assuming member role");
            None
        }
    };

    let profile_admin = profile
        .as_ref()
        .map(|doc| {
            doc.get_bool("isAdmin").unwrap_or(false)
                || doc
                    .get_str("role")
                    .map(|role| canonicalize_role(role) == "admin")
                    .unwrap_or(false)
        })
        .unwrap_or(false);

    let display_name = account
        .display_name
        .clone()
        .or_else(|| {
            profile
                .as_ref()
                .and_then(|doc| doc.get_str("displayName"))
                .map(str::to_string)
        })
        .or_else(|| {
            account
                .email
                .split_once('@')
                .map(|(local, _)| local.to_string())
                .filter(|local| !local.is_empty())
        })
        .unwrap_or_else(|| account.uid.clone());

    let principal = Principal::new(
        account.uid.clone(),
        display_name,
        Some(account.email.clone()),
        profile_admin,
        is_super_admin,
    );
    tracing::debug!(
        user_id = %principal.id,
        is_admin = principal.is_admin,
        is_super_admin = principal.is_super_admin,
        "principal resolved"
    );
    principal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn account(uid: &str) -> Account {
        Account {
            uid: uid.to_string(),
            email: format!("{uid}@example.com"),
            display_name: None,
        }
    }

    #[test]
    fn members_lack_admin_capabilities() {
        let member = Principal::new("u1", "Ana", None, false, false);
        assert!(member.has_capability(CAP_INCIDENTS_REPORT));
        assert!(member.resolve_capability().is_none());

        let err = require_capabilities(&member, &[CAP_INCIDENTS_RESOLVE, CAP_ROSTER_VIEW])
            .unwrap_err();
        match err {
            TrackerError::PermissionDenied(missing) => {
                assert!(missing.contains(CAP_INCIDENTS_RESOLVE));
                assert!(missing.contains(CAP_ROSTER_VIEW));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn super_admin_implies_admin() {
        let root = Principal::new("root", "Root", None, false, true);
        assert!(root.is_admin);
        assert!(require_capabilities(&root, &[CAP_INCIDENTS_RESOLVE]).is_ok());
        assert_eq!(
            root.resolve_capability().unwrap().action_for("i1"),
            PopupAction::ResolveIncident {
                incident_id: "i1".to_string()
            }
        );
    }

    #[test]
    fn canonicalize_role_maps_aliases() {
        assert_eq!(canonicalize_role(" Admin "), "admin");
        assert_eq!(canonicalize_role("read-only"), "view");
        assert_eq!(canonicalize_role("control"), "operator");
    }

    #[tokio::test]
    async fn resolve_principal_reads_persisted_role_flags() {
        let store = MemoryStore::new();
        let config = Config {
            super_admin_id: Some("root".to_string()),
            ..Config::default()
        };
        let flag = json!({"isAdmin": true, "displayName": "Flagged"});
        store.seed("users", "flagged", flag.as_object().cloned().unwrap());
        let role = json!({"role": "Administrator"});
        store.seed("users", "by-role", role.as_object().cloned().unwrap());

        let flagged = resolve_principal(&store, &config, &account("flagged")).await;
        assert!(flagged.is_admin);
        assert!(!flagged.is_super_admin);
        assert_eq!(flagged.display_name, "Flagged");

        assert!(resolve_principal(&store, &config, &account("by-role")).await.is_admin);

        let root = resolve_principal(&store, &config, &account("root")).await;
        assert!(root.is_super_admin && root.is_admin);

        let plain = resolve_principal(&store, &config, &account("plain")).await;
        assert!(!plain.is_admin);
        assert_eq!(plain.display_name, "plain");
    }
}
