//! Repository URL normalization.
//!
//! The same physical location is spelled differently by each artifact kind:
//! a git remote, an image repository reference and a chart repository URL.
//! Subscriptions and incoming signals are compared only after passing
//! through the function for their kind.

use url::Url;

/// Normalizes a git remote URL.
///
/// Lowercases, rewrites scp-style `user@host:path` to `ssh://user@host/path`,
/// drops credentials from http(s) URLs and strips a trailing `.git` or `/`.
pub fn normalize_git(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let candidate = scp_to_ssh(&lowered).unwrap_or(lowered);

    let rendered = match Url::parse(&candidate) {
        Ok(mut parsed) => {
            if matches!(parsed.scheme(), "http" | "https") {
                let _ = parsed.set_username("");
                let _ = parsed.set_password(None);
            }
            parsed.to_string()
        }
        Err(_) => candidate,
    };

    let trimmed = rendered.trim_end_matches('/');
    trimmed
        .strip_suffix(".git")
        .unwrap_or(trimmed)
        .trim_end_matches('/')
        .to_string()
}

fn scp_to_ssh(url: &str) -> Option<String> {
    if url.contains("://") {
        return None;
    }
    let (host_part, path) = url.split_once(':')?;
    if host_part.is_empty() || host_part.contains('/') || path.starts_with("//") {
        return None;
    }
    Some(format!("ssh://{host_part}/{}", path.trim_start_matches('/')))
}

/// Normalizes a container image repository reference.
///
/// Strips any scheme, tag and digest, maps the Docker Hub aliases onto
/// `docker.io` and makes the implicit `docker.io` host and `library/`
/// namespace explicit.
pub fn normalize_image(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let without_scheme = strip_scheme(&lowered);
    let repo = strip_tag_and_digest(without_scheme).trim_matches('/');

    let (host, path) = match repo.split_once('/') {
        Some((first, rest)) if looks_like_registry_host(first) => (first, rest),
        _ => ("docker.io", repo),
    };
    let host = match host {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => "docker.io",
        other => other,
    };

    if host == "docker.io" && !path.contains('/') {
        format!("docker.io/library/{path}")
    } else {
        format!("{host}/{path}")
    }
}

/// Normalizes a chart repository URL.
///
/// HTTP(S) chart repositories keep their scheme; anything else is treated
/// as an OCI registry reference and rendered as `oci://host/path` without
/// tag or digest.
pub fn normalize_chart(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.starts_with("http://") || lowered.starts_with("https://") {
        return lowered.trim_end_matches('/').to_string();
    }
    let without_scheme = strip_scheme(&lowered);
    let repo = strip_tag_and_digest(without_scheme).trim_matches('/');
    format!("oci://{repo}")
}

/// What an OCI media type says about the pushed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image,
    Chart,
    Unknown,
}

/// Classifies a manifest or config media type.
///
/// Generic OCI manifest types carry both images and charts, so only
/// Docker-specific and Helm-specific types are conclusive.
pub fn classify_media_type(media_type: Option<&str>) -> ArtifactKind {
    let Some(media_type) = media_type.map(str::trim).filter(|m| !m.is_empty()) else {
        return ArtifactKind::Unknown;
    };
    let media_type = media_type.to_ascii_lowercase();
    if media_type.starts_with("application/vnd.cncf.helm.") {
        ArtifactKind::Chart
    } else if media_type.starts_with("application/vnd.docker.distribution.manifest.")
        || media_type.starts_with("application/vnd.docker.container.image.")
    {
        ArtifactKind::Image
    } else {
        ArtifactKind::Unknown
    }
}

/// Normalized candidate URLs for an artifact pushed to an OCI registry.
///
/// When the media type does not settle the kind both the image and the chart
/// form are returned and subscription matching picks the right one. The two
/// forms never coincide: chart URLs always carry a scheme, image URLs never do.
pub fn oci_repo_urls(repo: &str, media_type: Option<&str>) -> Vec<String> {
    match classify_media_type(media_type) {
        ArtifactKind::Image => vec![normalize_image(repo)],
        ArtifactKind::Chart => vec![normalize_chart(repo)],
        ArtifactKind::Unknown => vec![normalize_image(repo), normalize_chart(repo)],
    }
}

fn strip_scheme(url: &str) -> &str {
    match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    }
}

fn strip_tag_and_digest(reference: &str) -> &str {
    let reference = match reference.find('@') {
        Some(idx) => &reference[..idx],
        None => reference,
    };
    let last_segment_start = reference.rfind('/').map_or(0, |idx| idx + 1);
    match reference[last_segment_start..].rfind(':') {
        Some(idx) => &reference[..last_segment_start + idx],
        None => reference,
    }
}

fn looks_like_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}
