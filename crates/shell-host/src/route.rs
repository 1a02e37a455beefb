//! Route resolution: maps an upgrade request path to a target host and an
//! optional starting directory.

use thiserror::Error;

/// Reserved host segment that maps to the configured default host.
pub const DEFAULT_HOST_PLACEHOLDER: &str = "default";

/// Target derived once per connection from the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: String,
    /// Percent-decoded starting directory, if the path carried one.
    pub initial_dir: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("path is outside the configured base prefix")]
    OutsideBasePrefix,
    #[error("path is not a shell route")]
    NotShellRoute,
    #[error("missing host segment")]
    MissingHost,
    #[error("directory is not valid percent-encoded UTF-8")]
    BadDirectoryEncoding,
}

/// Resolve `<base>/ssh/<host>[/<dir>]`.
///
/// The base prefix is compared as literal text; it is configuration, not a
/// pattern. The directory part is percent-decoded here and quote-escaped
/// only when spliced into the spawn arguments.
pub fn resolve(path: &str, base: &str, default_host: &str) -> Result<Route, RouteError> {
    let rest = path.strip_prefix(base).ok_or(RouteError::OutsideBasePrefix)?;
    let rest = rest.strip_prefix("/ssh/").ok_or(RouteError::NotShellRoute)?;

    let (segment, dir) = match rest.split_once('/') {
        Some((segment, dir)) => (segment, Some(dir)),
        None => (rest, None),
    };
    if segment.is_empty() {
        return Err(RouteError::MissingHost);
    }

    let host = if segment == DEFAULT_HOST_PLACEHOLDER {
        default_host.to_string()
    } else {
        segment.to_string()
    };

    let initial_dir = match dir {
        None | Some("") => None,
        Some(encoded) => Some(
            urlencoding::decode(encoded)
                .map_err(|_| RouteError::BadDirectoryEncoding)?
                .into_owned(),
        ),
    };

    Ok(Route { host, initial_dir })
}

/// Make `s` safe to splice into a single-quoted shell token: every `'`
/// closes the quote, emits an escaped quote, and reopens a new quote.
pub fn escape_single_quotes(s: &str) -> String {
    s.replace('\'', r"'\''")
}
