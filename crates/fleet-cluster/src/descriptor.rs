//! Cluster identity as produced by a configuration source

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use fleet_common::kube_utils::KubeconfigSource;
use fleet_common::Error;

/// How a descriptor's credential payload is interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialType {
    /// The payload is a path to a kubeconfig file
    File,
    /// The payload is kubeconfig YAML
    RawString,
}

impl FromStr for CredentialType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(CredentialType::File),
            "rawstring" | "raw" => Ok(CredentialType::RawString),
            other => Err(Error::configuration(format!(
                "unknown credential type {:?}, expected file or rawstring",
                other
            ))),
        }
    }
}

/// Identity of one reachable cluster
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    /// Unique cluster name
    pub name: String,
    /// How `credential` is interpreted
    pub credential_type: CredentialType,
    /// Kubeconfig path or content
    pub credential: String,
    /// Kubeconfig context to use instead of the current one
    pub context: Option<String>,
}

impl ClusterDescriptor {
    /// Descriptor for a kubeconfig file on disk
    pub fn from_file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential_type: CredentialType::File,
            credential: path.into(),
            context: None,
        }
    }

    /// Descriptor for in-memory kubeconfig content
    pub fn from_raw(name: impl Into<String>, kubeconfig: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential_type: CredentialType::RawString,
            credential: kubeconfig.into(),
            context: None,
        }
    }

    /// Select a kubeconfig context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// True when a live connection built from `other` would be identical.
    ///
    /// The name is not compared; the registry matches names first.
    pub fn same_connection(&self, other: &ClusterDescriptor) -> bool {
        self.credential_type == other.credential_type
            && self.credential == other.credential
            && self.context == other.context
    }

    /// Where the client configuration is loaded from
    pub fn kubeconfig_source(&self) -> KubeconfigSource {
        match self.credential_type {
            CredentialType::File => KubeconfigSource::Path(PathBuf::from(&self.credential)),
            CredentialType::RawString => KubeconfigSource::Inline(self.credential.clone()),
        }
    }
}

// Raw kubeconfig content carries tokens; keep it out of logs.
impl fmt::Debug for ClusterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credential = match self.credential_type {
            CredentialType::File => self.credential.as_str(),
            CredentialType::RawString => "<redacted>",
        };
        f.debug_struct("ClusterDescriptor")
            .field("name", &self.name)
            .field("credential_type", &self.credential_type)
            .field("credential", &credential)
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_connection_ignores_name_but_not_context() {
        let a = ClusterDescriptor::from_raw("east", "cfg-1");
        let renamed = ClusterDescriptor::from_raw("east-2", "cfg-1");
        let other_ctx = ClusterDescriptor::from_raw("east", "cfg-1").with_context("admin");
        let other_payload = ClusterDescriptor::from_raw("east", "cfg-2");
        let as_file = ClusterDescriptor::from_file("east", "cfg-1");

        assert!(a.same_connection(&renamed));
        assert!(!a.same_connection(&other_ctx));
        assert!(!a.same_connection(&other_payload));
        assert!(!a.same_connection(&as_file));
    }

    #[test]
    fn debug_redacts_raw_credentials() {
        let raw = ClusterDescriptor::from_raw("east", "token: secret");
        let rendered = format!("{:?}", raw);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));

        let file = ClusterDescriptor::from_file("west", "/etc/fleet/west.kubeconfig");
        assert!(format!("{:?}", file).contains("/etc/fleet/west.kubeconfig"));
    }

    #[test]
    fn credential_type_parses_case_insensitively() {
        assert_eq!("File".parse::<CredentialType>().ok(), Some(CredentialType::File));
        assert_eq!(
            "RawString".parse::<CredentialType>().ok(),
            Some(CredentialType::RawString)
        );
        assert!("vault".parse::<CredentialType>().is_err());
    }

    #[test]
    fn kubeconfig_source_follows_credential_type() {
        assert_eq!(
            ClusterDescriptor::from_file("a", "/tmp/a").kubeconfig_source(),
            KubeconfigSource::Path(PathBuf::from("/tmp/a"))
        );
        assert_eq!(
            ClusterDescriptor::from_raw("a", "yaml").kubeconfig_source(),
            KubeconfigSource::Inline("yaml".to_string())
        );
    }
}
