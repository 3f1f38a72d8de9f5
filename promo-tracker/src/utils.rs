use url::Url;

/// Resolve `path` below `base`, treating `base` as a directory even without a
/// trailing slash (`https://host/api` + `clicks` is `https://host/api/clicks`).
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    base.join(path)
}
