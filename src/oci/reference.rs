//! OCI reference parsing and normalization.
//!
//! Accepted forms:
//! - `oci://host/repo/name@sha256:<digest>` (pinned)
//! - `oci://host/repo/name:<alias>`
//! - `oci://host/repo/name@<semver>` (treated as a tag)
//! - two-part: `(registry_base, "name@version" | "name:alias")`
//!
//! Any non-digest form resolves to a digest before the first blob fetch.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{CpmError, OciError, Result};

/// How a packet is referenced within a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefKind {
    /// `sha256:<64 hex>`, the canonical pinned identity.
    Digest(String),
    /// An alias tag or semver string, resolved against the registry.
    Tag(String),
}

/// A parsed packet reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRef {
    pub host: String,
    pub repo: String,
    pub name: String,
    pub reference: RefKind,
}

fn digest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^sha256:[0-9a-f]{64}$").expect("static regex"))
}

/// Validate a `sha256:<hex>` digest string.
pub fn is_valid_digest(s: &str) -> bool {
    digest_re().is_match(s)
}

impl PacketRef {
    /// Parse a full `oci://` URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("oci://")
            .ok_or_else(|| bad_ref(uri, "missing oci:// scheme"))?;

        // Split off the reference part first: @digest/@tag wins over :alias,
        // but a port colon in the host must not be mistaken for an alias.
        let (path, reference) = if let Some(at) = rest.rfind('@') {
            let (path, raw) = (&rest[..at], &rest[at + 1..]);
            if raw.is_empty() {
                return Err(bad_ref(uri, "empty reference after @"));
            }
            let kind = if raw.starts_with("sha256:") {
                if !is_valid_digest(raw) {
                    return Err(bad_ref(uri, "malformed digest"));
                }
                RefKind::Digest(raw.to_string())
            } else {
                RefKind::Tag(raw.to_string())
            };
            (path, kind)
        } else {
            // Alias form: the last colon after the final slash separates it.
            match rest.rfind('/') {
                Some(slash) => match rest[slash..].rfind(':') {
                    Some(rel_colon) => {
                        let colon = slash + rel_colon;
                        let alias = &rest[colon + 1..];
                        if alias.is_empty() {
                            return Err(bad_ref(uri, "empty alias after :"));
                        }
                        (&rest[..colon], RefKind::Tag(alias.to_string()))
                    }
                    None => (rest, RefKind::Tag("latest".to_string())),
                },
                None => return Err(bad_ref(uri, "missing repository path")),
            }
        };

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 3 {
            return Err(bad_ref(uri, "expected host/repo/name"));
        }
        let host = segments[0].to_string();
        let name = segments[segments.len() - 1].to_string();
        let repo = segments[1..segments.len() - 1].join("/");

        Ok(Self {
            host,
            repo,
            name,
            reference,
        })
    }

    /// Combine a registry base (`oci://host/repo`) with a short
    /// `name@version` or `name:alias` form.
    pub fn from_parts(registry_base: &str, name_ref: &str) -> Result<Self> {
        let base = registry_base.trim_end_matches('/');
        if !base.starts_with("oci://") {
            return Err(bad_ref(registry_base, "registry base must start with oci://"));
        }
        Self::parse(&format!("{}/{}", base, name_ref))
    }

    /// Parse either a full URI, or a short form against the default registry.
    pub fn resolve_input(input: &str, default_registry: Option<&str>) -> Result<Self> {
        if input.starts_with("oci://") {
            return Self::parse(input);
        }
        match default_registry {
            Some(base) => Self::from_parts(base, input),
            None => Err(CpmError::Config(format!(
                "reference '{}' is not fully qualified and no default registry is configured",
                input
            ))),
        }
    }

    /// OCI repository path, `repo/name`.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.repo, self.name)
    }

    /// The reference string used against the registry API.
    pub fn reference_str(&self) -> &str {
        match &self.reference {
            RefKind::Digest(d) => d,
            RefKind::Tag(t) => t,
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.reference, RefKind::Digest(_))
    }

    /// The digest, when pinned.
    pub fn digest(&self) -> Option<&str> {
        match &self.reference {
            RefKind::Digest(d) => Some(d),
            RefKind::Tag(_) => None,
        }
    }

    /// The same reference pinned to `digest`.
    pub fn pinned(&self, digest: &str) -> PacketRef {
        PacketRef {
            host: self.host.clone(),
            repo: self.repo.clone(),
            name: self.name.clone(),
            reference: RefKind::Digest(digest.to_string()),
        }
    }

    /// Canonical URI rendering.
    pub fn to_uri(&self) -> String {
        match &self.reference {
            RefKind::Digest(d) => format!("oci://{}/{}/{}@{}", self.host, self.repo, self.name, d),
            RefKind::Tag(t) => format!("oci://{}/{}/{}:{}", self.host, self.repo, self.name, t),
        }
    }
}

fn bad_ref(uri: &str, reason: &str) -> CpmError {
    CpmError::Oci(OciError::InvalidReference(format!("{} ({})", uri, reason)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_parse_pinned() {
        let r = PacketRef::parse(&format!("oci://reg.example.com/team/demo@{}", DIGEST)).unwrap();
        assert_eq!(r.host, "reg.example.com");
        assert_eq!(r.repo, "team");
        assert_eq!(r.name, "demo");
        assert!(r.is_pinned());
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.repository(), "team/demo");
    }

    #[test]
    fn test_parse_alias() {
        let r = PacketRef::parse("oci://reg.example.com/team/demo:latest").unwrap();
        assert_eq!(r.reference, RefKind::Tag("latest".to_string()));
        assert!(!r.is_pinned());
    }

    #[test]
    fn test_parse_semver_tag() {
        let r = PacketRef::parse("oci://reg.example.com/team/demo@1.2.3").unwrap();
        assert_eq!(r.reference, RefKind::Tag("1.2.3".to_string()));
    }

    #[test]
    fn test_parse_defaults_to_latest() {
        let r = PacketRef::parse("oci://reg.example.com/team/demo").unwrap();
        assert_eq!(r.reference, RefKind::Tag("latest".to_string()));
    }

    #[test]
    fn test_parse_with_port_and_nested_repo() {
        let r = PacketRef::parse("oci://localhost:5000/org/sub/demo:stable").unwrap();
        assert_eq!(r.host, "localhost:5000");
        assert_eq!(r.repo, "org/sub");
        assert_eq!(r.name, "demo");
        assert_eq!(r.reference, RefKind::Tag("stable".to_string()));
    }

    #[test]
    fn test_parse_rejects_bad_forms() {
        assert!(PacketRef::parse("https://example.com/a/b").is_err());
        assert!(PacketRef::parse("oci://hostonly").is_err());
        assert!(PacketRef::parse("oci://host/name").is_err());
        assert!(PacketRef::parse("oci://host/repo/name@").is_err());
        assert!(PacketRef::parse("oci://host/repo/name@sha256:tooshort").is_err());
    }

    #[test]
    fn test_from_parts() {
        let r = PacketRef::from_parts("oci://reg.example.com/packets", "demo@1.0.0").unwrap();
        assert_eq!(r.repository(), "packets/demo");
        assert_eq!(r.reference, RefKind::Tag("1.0.0".to_string()));

        let r = PacketRef::from_parts("oci://reg.example.com/packets/", "demo:latest").unwrap();
        assert_eq!(r.reference, RefKind::Tag("latest".to_string()));
    }

    #[test]
    fn test_resolve_input() {
        let r = PacketRef::resolve_input("demo@1.0.0", Some("oci://reg.example.com/packets")).unwrap();
        assert_eq!(r.host, "reg.example.com");
        assert!(PacketRef::resolve_input("demo@1.0.0", None).is_err());

        let full = format!("oci://reg.example.com/team/demo@{}", DIGEST);
        let r = PacketRef::resolve_input(&full, None).unwrap();
        assert!(r.is_pinned());
    }

    #[test]
    fn test_to_uri_round_trip() {
        let uri = format!("oci://reg.example.com/team/demo@{}", DIGEST);
        let r = PacketRef::parse(&uri).unwrap();
        assert_eq!(r.to_uri(), uri);

        let uri = "oci://reg.example.com/team/demo:stable";
        assert_eq!(PacketRef::parse(uri).unwrap().to_uri(), uri);

        // pinned() rewrites the tag
        let r = PacketRef::parse(uri).unwrap().pinned(DIGEST);
        assert!(r.to_uri().ends_with(DIGEST));
    }

    #[test]
    fn test_is_valid_digest() {
        assert!(is_valid_digest(DIGEST));
        assert!(!is_valid_digest("sha256:XYZ"));
        assert!(!is_valid_digest("md5:abcd"));
    }
}
