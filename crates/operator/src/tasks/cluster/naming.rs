use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const BUILD_JOB_SUFFIX: &str = "-build";
const SHARD_DEPLOYMENT_PREFIX: &str = "honsefarm-shard-";

pub const CONFIG_BUNDLE_NAME: &str = "honsefarm-config";
pub const CORE_SECRET_NAME: &str = "honsefarm-secrets";
pub const TLS_SECRET_NAME: &str = "honsefarm-tls";
pub const TUNNEL_CONFIG_NAME: &str = "cloudflared-config";
pub const TUNNEL_DEPLOYMENT_NAME: &str = "cloudflared";
pub const TUNNEL_CREDENTIALS_DEFAULT: &str = "cloudflared-credentials";

/// The file-serving and API components the operator deploys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Server,
    AdminPanel,
    MainFileserver,
    ShardFileserver,
}

impl ComponentKind {
    /// Value of the `honsefarm-component` label; also the name a build
    /// component must carry to supply this component's image
    pub fn id(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::AdminPanel => "adminpanel",
            Self::MainFileserver => "main-fileserver",
            Self::ShardFileserver => "shard-fileserver",
        }
    }

    pub fn port(self) -> i32 {
        match self {
            Self::Server | Self::AdminPanel => 5000,
            Self::MainFileserver => 5001,
            Self::ShardFileserver => 5002,
        }
    }

    /// Spec path named in configuration errors
    pub fn image_field(self) -> &'static str {
        match self {
            Self::Server => "spec.images.server",
            Self::AdminPanel => "spec.images.adminPanel",
            Self::MainFileserver => "spec.images.mainFileserver",
            Self::ShardFileserver => "spec.images.shardFileserver",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "server" => Some(Self::Server),
            "adminpanel" | "adminPanel" => Some(Self::AdminPanel),
            "main-fileserver" | "mainFileserver" => Some(Self::MainFileserver),
            "shard-fileserver" | "shardFileserver" | "shard" => Some(Self::ShardFileserver),
            _ => None,
        }
    }
}

/// Names of child resources, derived from component and shard identity only
pub struct ResourceNaming;

impl ResourceNaming {
    pub fn deployment_name(kind: ComponentKind, shard: Option<&str>) -> String {
        match (kind, shard) {
            (ComponentKind::ShardFileserver, Some(shard)) => {
                format!("{SHARD_DEPLOYMENT_PREFIX}{shard}")
            }
            _ => format!("honsefarm-{}", kind.id()),
        }
    }

    pub fn service_name(kind: ComponentKind, shard: Option<&str>) -> String {
        match (kind, shard) {
            (ComponentKind::ShardFileserver, Some(shard)) => format!("shard-{shard}-svc"),
            _ => format!("{}-svc", kind.id()),
        }
    }

    pub fn pvc_name(kind: ComponentKind, shard: Option<&str>) -> String {
        match (kind, shard) {
            (ComponentKind::ShardFileserver, Some(shard)) => format!("shard-{shard}-data"),
            _ => format!("{}-data", kind.id()),
        }
    }

    /// Configuration bundle key for a component's appsettings document
    pub fn appsettings_key(kind: ComponentKind, shard: Option<&str>) -> String {
        match (kind, shard) {
            (ComponentKind::ShardFileserver, Some(shard)) => {
                format!("{shard}.appsettings.Production.json")
            }
            _ => format!("{}.appsettings.Production.json", kind.id()),
        }
    }

    /// One build job per cluster, independent of the build identifier
    pub fn build_job_name(cluster_name: &str) -> String {
        let base = format!("{cluster_name}{BUILD_JOB_SUFFIX}");
        if base.len() <= MAX_K8S_NAME_LENGTH {
            return base;
        }

        // Keep the suffix and make the truncated prefix unique with a hash
        let hash = Self::hash_string(cluster_name);
        let available = MAX_K8S_NAME_LENGTH - BUILD_JOB_SUFFIX.len() - hash.len() - 1;
        let prefix: String = cluster_name.chars().take(available).collect();
        let prefix = prefix.trim_end_matches('-');
        format!("{prefix}-{hash}{BUILD_JOB_SUFFIX}")
    }

    /// Label values are limited to 63 alphanumeric, `-`, `_` or `.` characters
    pub fn sanitize_label_value(value: &str) -> String {
        let cleaned: String = value
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .take(MAX_K8S_NAME_LENGTH)
            .collect();
        cleaned
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }

    /// Shard names end up in object names and label values, so they must be
    /// lowercase DNS labels short enough for the longest derived name
    pub fn is_valid_shard_name(name: &str) -> bool {
        let max = MAX_K8S_NAME_LENGTH - SHARD_DEPLOYMENT_PREFIX.len();
        !name.is_empty()
            && name.len() <= max
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !name.starts_with('-')
            && !name.ends_with('-')
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:x}", hasher.finish())[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_resource_names() {
        assert_eq!(
            ResourceNaming::deployment_name(ComponentKind::Server, None),
            "honsefarm-server"
        );
        assert_eq!(
            ResourceNaming::deployment_name(ComponentKind::MainFileserver, None),
            "honsefarm-main-fileserver"
        );
        assert_eq!(
            ResourceNaming::service_name(ComponentKind::AdminPanel, None),
            "adminpanel-svc"
        );
        assert_eq!(
            ResourceNaming::pvc_name(ComponentKind::Server, None),
            "server-data"
        );
    }

    #[test]
    fn shard_resource_names() {
        let shard = Some("eu");
        assert_eq!(
            ResourceNaming::deployment_name(ComponentKind::ShardFileserver, shard),
            "honsefarm-shard-eu"
        );
        assert_eq!(
            ResourceNaming::service_name(ComponentKind::ShardFileserver, shard),
            "shard-eu-svc"
        );
        assert_eq!(
            ResourceNaming::pvc_name(ComponentKind::ShardFileserver, shard),
            "shard-eu-data"
        );
        assert_eq!(
            ResourceNaming::appsettings_key(ComponentKind::ShardFileserver, shard),
            "eu.appsettings.Production.json"
        );
    }

    #[test]
    fn build_job_name_is_stable_and_bounded() {
        assert_eq!(ResourceNaming::build_job_name("forest"), "forest-build");

        let long = "a".repeat(80);
        let name = ResourceNaming::build_job_name(&long);
        assert!(name.len() <= MAX_K8S_NAME_LENGTH);
        assert!(name.ends_with("-build"));
        assert_eq!(name, ResourceNaming::build_job_name(&long));
    }

    #[test]
    fn component_ids_round_trip() {
        for kind in [
            ComponentKind::Server,
            ComponentKind::AdminPanel,
            ComponentKind::MainFileserver,
            ComponentKind::ShardFileserver,
        ] {
            assert_eq!(ComponentKind::parse(kind.id()), Some(kind));
        }
        assert_eq!(ComponentKind::parse("cdn"), None);
    }

    #[test]
    fn sanitizes_label_values() {
        assert_eq!(ResourceNaming::sanitize_label_value("release/7.1"), "release-7.1");
        assert_eq!(ResourceNaming::sanitize_label_value("-v1-"), "v1");
    }

    #[test]
    fn shard_names_must_be_dns_labels() {
        assert!(ResourceNaming::is_valid_shard_name("eu-west-2"));
        assert!(!ResourceNaming::is_valid_shard_name("EU_West"));
        assert!(!ResourceNaming::is_valid_shard_name("-eu"));
        assert!(!ResourceNaming::is_valid_shard_name(""));
        assert!(ResourceNaming::is_valid_shard_name(&"a".repeat(47)));
        assert!(!ResourceNaming::is_valid_shard_name(&"a".repeat(48)));
    }
}
