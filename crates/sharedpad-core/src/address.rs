//! Session addressing: derives every bus name an instance needs.
//!
//! Naming scheme:
//! - interface: `<namespace>.<label>` (shared by the whole session)
//! - service:   `<namespace>.<label>._<instance>` (unique per instance)
//! - isolated:  `<namespace>.isolated._<instance>` for both, no peer interface
//!
//! The object path never changes.

use crate::identity::InstanceId;

/// Root of every bus name used by sharedpad.
pub const NAMESPACE: &str = "sharedpad";

/// Object path exported by every instance.
pub const OBJECT_PATH: &str = "/sharedpad/Document";

/// Label used when the user did not pick one.
pub const DEFAULT_SESSION_LABEL: &str = "session";

/// Namespace segment reserved for isolated instances.
const ISOLATED_SEGMENT: &str = "isolated";

/// Separator between the session interface and the instance identity.
const INSTANCE_SEPARATOR: &str = "._";

/// Every bus name one instance uses, computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAddress {
    pub object_path: String,
    pub interface_name: String,
    pub service_name: String,
    /// Interface addressing "all peers in this session". `None` when isolated.
    pub peer_interface: Option<String>,
}

impl SessionAddress {
    /// Derive the address for `instance` joining `label`.
    ///
    /// An empty label lands in the default session. When `isolated` is set the
    /// label is ignored and every name is keyed by the identity alone.
    pub fn derive(label: &str, isolated: bool, instance: &InstanceId) -> Self {
        if isolated {
            let private = format!("{NAMESPACE}.{ISOLATED_SEGMENT}{INSTANCE_SEPARATOR}{instance}");
            return Self {
                object_path: OBJECT_PATH.to_string(),
                interface_name: private.clone(),
                service_name: private,
                peer_interface: None,
            };
        }

        let interface_name = format!("{NAMESPACE}.{}", session_segment(label));
        Self {
            object_path: OBJECT_PATH.to_string(),
            service_name: format!("{interface_name}{INSTANCE_SEPARATOR}{instance}"),
            peer_interface: Some(interface_name.clone()),
            interface_name,
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.peer_interface.is_none()
    }

    /// Prefix that every peer's service name in this session starts with.
    ///
    /// Includes the instance separator so that session `foo` never matches
    /// services of session `foobar`.
    pub fn discovery_prefix(&self) -> Option<String> {
        self.peer_interface
            .as_ref()
            .map(|interface| format!("{interface}{INSTANCE_SEPARATOR}"))
    }
}

/// Turn a user label into a single bus name element.
///
/// Bus name elements only allow `[A-Za-z0-9_]` and must not start with a
/// digit. The isolated segment is reserved so that no session can overlap the
/// isolated namespace.
fn session_segment(label: &str) -> String {
    let label = label.trim();
    if label.is_empty() {
        return DEFAULT_SESSION_LABEL.to_string();
    }

    let mut segment: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if segment.starts_with(|c: char| c.is_ascii_digit()) || segment == ISOLATED_SEGMENT {
        segment.insert(0, '_');
    }
    segment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InstanceId {
        s.parse().unwrap()
    }

    #[test]
    fn test_shared_session_names() {
        let addr = SessionAddress::derive("notes", false, &id("aaa111"));
        assert_eq!(addr.object_path, OBJECT_PATH);
        assert_eq!(addr.interface_name, "sharedpad.notes");
        assert_eq!(addr.service_name, "sharedpad.notes._aaa111");
        assert_eq!(addr.peer_interface.as_deref(), Some("sharedpad.notes"));
        assert!(!addr.is_isolated());
    }

    #[test]
    fn test_empty_label_uses_default_session() {
        let addr = SessionAddress::derive("", false, &id("aaa111"));
        assert_eq!(addr.interface_name, "sharedpad.session");
        assert_eq!(addr.service_name, "sharedpad.session._aaa111");

        let blank = SessionAddress::derive("   ", false, &id("aaa111"));
        assert_eq!(blank.interface_name, addr.interface_name);
    }

    #[test]
    fn test_same_label_shares_interface_distinct_service() {
        let a = SessionAddress::derive("team", false, &InstanceId::generate());
        let b = SessionAddress::derive("team", false, &InstanceId::generate());
        assert_eq!(a.interface_name, b.interface_name);
        assert_eq!(a.peer_interface, b.peer_interface);
        assert_ne!(a.service_name, b.service_name);
    }

    #[test]
    fn test_isolated_ignores_label() {
        let addr = SessionAddress::derive("team", true, &id("bbb222"));
        assert_eq!(addr.interface_name, "sharedpad.isolated._bbb222");
        assert_eq!(addr.service_name, "sharedpad.isolated._bbb222");
        assert!(addr.peer_interface.is_none());
        assert!(addr.discovery_prefix().is_none());
        assert!(addr.is_isolated());
        assert_eq!(addr.object_path, OBJECT_PATH);
    }

    #[test]
    fn test_isolated_instances_are_distinct() {
        let a = SessionAddress::derive("team", true, &InstanceId::generate());
        let b = SessionAddress::derive("team", true, &InstanceId::generate());
        assert_ne!(a.service_name, b.service_name);
        assert_ne!(a.interface_name, b.interface_name);
    }

    #[test]
    fn test_isolated_never_discoverable() {
        let isolated = SessionAddress::derive("", true, &InstanceId::generate());
        for label in ["", "session", "isolated", "team", "isolated._x", "1isolated"] {
            let shared = SessionAddress::derive(label, false, &InstanceId::generate());
            let prefix = shared.discovery_prefix().unwrap();
            assert!(
                !isolated.service_name.starts_with(&prefix),
                "label {label:?} would discover {}",
                isolated.service_name
            );
            assert_ne!(shared.peer_interface.as_deref(), Some(isolated.interface_name.as_str()));
        }
    }

    #[test]
    fn test_prefix_does_not_cross_sessions() {
        let foo = SessionAddress::derive("foo", false, &id("aaa"));
        let foobar = SessionAddress::derive("foobar", false, &id("bbb"));
        assert!(!foobar.service_name.starts_with(&foo.discovery_prefix().unwrap()));
        assert!(foo.service_name.starts_with(&foo.discovery_prefix().unwrap()));
    }

    #[test]
    fn test_label_sanitized_into_one_element() {
        assert_eq!(session_segment("my team.v2"), "my_team_v2");
        assert_eq!(session_segment("2024"), "_2024");
        assert_eq!(session_segment("isolated"), "_isolated");
        assert_eq!(session_segment("Isolated"), "Isolated");
    }

    #[test]
    fn test_derive_is_pure() {
        let instance = InstanceId::generate();
        assert_eq!(
            SessionAddress::derive("x", false, &instance),
            SessionAddress::derive("x", false, &instance)
        );
    }
}
