//! Canonical image references derived from registry API requests.
//!
//! A HEAD on `/v2/<repository>/manifests/<reference>` against host `H`
//! identifies the image `H/<repository>:<reference>`. That string is the key
//! the pull coordinator deduplicates on.

use std::net::IpAddr;

/// Registry API prefix stripped from request paths
pub const API_PREFIX: &str = "/v2";

/// Path marker separating the repository from the tag or digest
pub const MANIFESTS_MARKER: &str = "/manifests/";

/// Namespace Docker Hub uses for official images
pub const DEFAULT_NAMESPACE: &str = "library";

/// Build the canonical reference for a manifest request.
///
/// When `mirror` is set and the repository lives in the default namespace,
/// the request host and the namespace are both replaced by the mirror, so
/// `/v2/library/foo/manifests/latest` becomes `<mirror>/foo:latest`.
pub fn normalize(host: &str, url_path: &str, mirror: Option<&str>) -> String {
    let image_path = url_path.strip_prefix(API_PREFIX).unwrap_or(url_path);
    let image = format!("{}{}", host, image_path.replace(MANIFESTS_MARKER, ":"));

    let mirror = match mirror {
        Some(m) if !m.is_empty() => m,
        _ => return image,
    };

    let mut segments = image.split('/');
    let _host = segments.next();
    if segments.next() != Some(DEFAULT_NAMESPACE) {
        return image;
    }

    let rest: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    if rest.is_empty() {
        return mirror.to_string();
    }
    format!("{}/{}", mirror.trim_end_matches('/'), rest.join("/"))
}

/// True for `/v2/<repository>/manifests/<reference>` with both parts non-empty
pub fn is_manifest_path(url_path: &str) -> bool {
    let Some(rest) = url_path.strip_prefix(API_PREFIX) else {
        return false;
    };
    let Some(idx) = rest.rfind(MANIFESTS_MARKER) else {
        return false;
    };
    let repository = rest[..idx].trim_start_matches('/');
    let reference = &rest[idx + MANIFESTS_MARKER.len()..];
    !repository.is_empty() && !reference.is_empty() && !reference.contains('/')
}

/// `<repository>:<reference>` as the client named it, without any mirror
/// rewrite. This is where a copy has to land for the forwarded request to hit.
pub fn local_repository(url_path: &str) -> String {
    let image_path = url_path.strip_prefix(API_PREFIX).unwrap_or(url_path);
    image_path
        .trim_start_matches('/')
        .replace(MANIFESTS_MARKER, ":")
}

/// Drop a leading registry host from an image reference.
///
/// The first segment counts as a host only if it has a `.` or `:` or is
/// `localhost`, the same rule docker applies, so `bitnami/redis:7` is kept
/// whole while `quay.io/cilium/cilium:v1` loses `quay.io`.
pub fn strip_registry_host(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            rest
        }
        _ => image,
    }
}

/// True for `/v2/library/...` paths
pub fn is_default_namespace(url_path: &str) -> bool {
    url_path
        .strip_prefix(API_PREFIX)
        .and_then(|p| p.strip_prefix('/'))
        .and_then(|p| p.strip_prefix(DEFAULT_NAMESPACE))
        .is_some_and(|p| p.starts_with('/'))
}

/// True when the host, with any port removed, is a literal IP address
pub fn host_is_ip(host: &str) -> bool {
    if let Some(bracketed) = host.strip_prefix('[') {
        // [v6]:port
        return bracketed
            .split_once(']')
            .is_some_and(|(addr, _)| addr.parse::<IpAddr>().is_ok());
    }
    if host.parse::<IpAddr>().is_ok() {
        // bare v6 has colons but no port
        return true;
    }
    host.split(':')
        .next()
        .is_some_and(|name| name.parse::<IpAddr>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_host_tag() {
        assert_eq!(
            normalize("registry.example.com", "/v2/app/manifests/v1", None),
            "registry.example.com/app:v1"
        );
    }

    #[test]
    fn nested_repository_with_port() {
        assert_eq!(
            normalize("reg.local:5000", "/v2/team/svc/api/manifests/1.2.3", None),
            "reg.local:5000/team/svc/api:1.2.3"
        );
    }

    #[test]
    fn digest_reference() {
        assert_eq!(
            normalize("ghcr.io", "/v2/org/tool/manifests/sha256:abc", None),
            "ghcr.io/org/tool:sha256:abc"
        );
    }

    #[test]
    fn mirror_replaces_host_and_library() {
        assert_eq!(
            normalize(
                "H",
                "/v2/library/foo/manifests/latest",
                Some("mirror.example.com")
            ),
            "mirror.example.com/foo:latest"
        );
    }

    #[test]
    fn library_without_mirror_is_left_alone() {
        assert_eq!(
            normalize("H", "/v2/library/foo/manifests/latest", None),
            "H/library/foo:latest"
        );
        assert_eq!(
            normalize("H", "/v2/library/foo/manifests/latest", Some("")),
            "H/library/foo:latest"
        );
    }

    #[test]
    fn mirror_ignored_outside_library() {
        assert_eq!(
            normalize("H", "/v2/bitnami/redis/manifests/7", Some("M")),
            "H/bitnami/redis:7"
        );
    }

    #[test]
    fn malformed_path_is_best_effort() {
        assert_eq!(normalize("H", "/other", None), "H/other");
        assert_eq!(normalize("H", "", Some("M")), "H");
    }

    #[test]
    fn manifest_paths_only() {
        assert!(is_manifest_path("/v2/app/manifests/v1"));
        assert!(is_manifest_path("/v2/library/nginx/manifests/sha256:abc"));
        assert!(!is_manifest_path("/v2/"));
        assert!(!is_manifest_path("/v2/app/blobs/sha256:abc"));
        assert!(!is_manifest_path("/v2/app/blobs/uploads/"));
        assert!(!is_manifest_path("/v2/app/manifests/"));
        assert!(!is_manifest_path("/v2/manifests/v1"));
        assert!(!is_manifest_path("/health"));
    }

    #[test]
    fn local_repository_keeps_client_namespace() {
        assert_eq!(
            local_repository("/v2/library/foo/manifests/latest"),
            "library/foo:latest"
        );
        assert_eq!(local_repository("/v2/team/app/manifests/v1"), "team/app:v1");
    }

    #[test]
    fn registry_host_stripped_only_when_it_looks_like_one() {
        assert_eq!(strip_registry_host("quay.io/cilium/cilium:v1.17.7"), "cilium/cilium:v1.17.7");
        assert_eq!(strip_registry_host("localhost/app:v1"), "app:v1");
        assert_eq!(strip_registry_host("10.0.0.5:5000/app:v1"), "app:v1");
        assert_eq!(strip_registry_host("bitnami/redis:7"), "bitnami/redis:7");
        assert_eq!(strip_registry_host("redis:7"), "redis:7");
    }

    #[test]
    fn default_namespace_detection() {
        assert!(is_default_namespace("/v2/library/foo/manifests/latest"));
        assert!(!is_default_namespace("/v2/libraryx/foo/manifests/latest"));
        assert!(!is_default_namespace("/v2/app/manifests/v1"));
        assert!(!is_default_namespace("/library/foo"));
    }

    #[test]
    fn ip_hosts() {
        assert!(host_is_ip("10.0.0.1"));
        assert!(host_is_ip("10.0.0.1:5000"));
        assert!(host_is_ip("::1"));
        assert!(host_is_ip("[::1]:5000"));
        assert!(!host_is_ip("registry.example.com"));
        assert!(!host_is_ip("localhost:5000"));
    }
}
