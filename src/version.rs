use tracing::debug;

pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SYNC_ENGINE_VERSION: &str = "v0.18.1";
pub const SSH_SERVER_IMAGE: &str = "public.ecr.aws/x0p9x6p7/bunnyshell/remote-binaries:latest";

const RELEASES_OWNER_REPO: &str = "bunnyshell/remote-dev";

/// Prints program / sync-tool / SSH-server-image versions, and (best
/// effort) a newer-release notice. Grounded on
/// `original_source/cmd/version.go`.
pub async fn run(show_all: bool) {
    println!("podwire {PROGRAM_VERSION}");
    if show_all {
        println!("sync engine (mutagen) {SYNC_ENGINE_VERSION}");
        println!("ssh server image {SSH_SERVER_IMAGE}");
    }

    match latest_release_tag().await {
        Ok(Some(tag)) if is_newer(&tag) => {
            println!("a newer release is available: {tag}");
        }
        Ok(_) => {}
        Err(err) => debug!(%err, "release check failed, skipping"),
    }
}

/// Compares the release tag against the compiled-in version with `semver`
/// rather than string inequality, so a differently-formatted but equal tag
/// (`v0.1.0` vs `0.1.0`) doesn't print a false "newer release" notice.
fn is_newer(tag: &str) -> bool {
    let trimmed = tag.trim_start_matches('v');
    let (Ok(latest), Ok(current)) = (
        semver::Version::parse(trimmed),
        semver::Version::parse(PROGRAM_VERSION),
    ) else {
        return tag != PROGRAM_VERSION && tag != format!("v{PROGRAM_VERSION}");
    };
    latest > current
}

/// HEAD against the GitHub "latest release" redirect, reading the trailing
/// path segment of the `Location` header as the latest tag. Never fails
/// the `version` command — failures are logged at `debug` only.
async fn latest_release_tag() -> anyhow::Result<Option<String>> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let url = format!("https://github.com/{RELEASES_OWNER_REPO}/releases/latest");
    let response = client.get(&url).send().await?;

    let Some(location) = response.headers().get(reqwest::header::LOCATION) else {
        return Ok(None);
    };
    let location = location.to_str()?;
    Ok(location.rsplit('/').next().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_version_is_not_newer() {
        assert!(!is_newer(PROGRAM_VERSION));
        assert!(!is_newer(&format!("v{PROGRAM_VERSION}")));
    }

    #[test]
    fn higher_patch_version_is_newer() {
        assert!(is_newer("v999.0.0"));
    }

    #[test]
    fn lower_version_is_not_newer() {
        assert!(!is_newer("v0.0.1"));
    }
}
