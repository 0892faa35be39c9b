use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use super::SiteError;

/// `define( 'NAME', 'value' )` with single or double quoted string values.
static DEFINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"define\(\s*['"](DB_NAME|DB_USER|DB_PASSWORD|DB_HOST|WP_CONTENT_DIR)['"]\s*,\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")\s*\)"#,
    )
    .unwrap()
});

const DEFAULT_DB_HOST: &str = "localhost";

/// Where the database server listens, parsed from `DB_HOST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHost {
    pub host: String,
    pub port: Option<u16>,
    pub socket: Option<String>,
}

impl DbHost {
    /// Parses the forms `host`, `host:port`, `host:/path/to.sock` and `/path/to.sock`.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            return Self::plain(DEFAULT_DB_HOST);
        }
        if value.starts_with('/') {
            return Self {
                host: DEFAULT_DB_HOST.into(),
                port: None,
                socket: Some(value.into()),
            };
        }

        match value.rsplit_once(':') {
            // IPv6 literals without port: [::1]
            Some((host, _)) if host.starts_with('[') && !host.ends_with(']') => Self::plain(value),
            Some((host, tail)) if tail.starts_with('/') => Self {
                host: non_empty_host(host),
                port: None,
                socket: Some(tail.into()),
            },
            Some((host, tail)) => match tail.parse() {
                Ok(port) => Self {
                    host: non_empty_host(host),
                    port: Some(port),
                    socket: None,
                },
                Err(_) => Self::plain(value),
            },
            None => Self::plain(value),
        }
    }

    fn plain(host: &str) -> Self {
        Self {
            host: host.into(),
            port: None,
            socket: None,
        }
    }
}

fn non_empty_host(host: &str) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        DEFAULT_DB_HOST.into()
    } else {
        host.into()
    }
}

/// Connection parameters of the site database.
#[derive(Clone, PartialEq, Eq)]
pub struct DbParams {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: DbHost,
}

impl std::fmt::Debug for DbParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbParams")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"DBPASSWORD")
            .field("host", &self.host)
            .finish()
    }
}

/// The values of `wp-config.php` a backup needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpConfig {
    pub db: DbParams,
    /// `WP_CONTENT_DIR` if defined as string literal.
    pub content_dir: Option<PathBuf>,
}

impl WpConfig {
    /// Extracts the database defines from the PHP source of `wp-config.php`.
    pub fn parse(source: &str) -> Result<Self, SiteError> {
        let mut name = None;
        let mut user = None;
        let mut password = None;
        let mut host = None;
        let mut content_dir = None;

        for line in source.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with('#') || trimmed.starts_with('*') {
                continue;
            }

            for captures in DEFINE.captures_iter(line) {
                let value = captures
                    .get(2)
                    .or_else(|| captures.get(3))
                    .map(|m| unescape(m.as_str()))
                    .unwrap_or_default();
                let slot = match &captures[1] {
                    "DB_NAME" => &mut name,
                    "DB_USER" => &mut user,
                    "DB_PASSWORD" => &mut password,
                    "DB_HOST" => &mut host,
                    _ => &mut content_dir,
                };
                // PHP keeps the first definition of a constant
                if slot.is_none() {
                    *slot = Some(value);
                }
            }
        }

        let db = DbParams {
            name: name.ok_or(SiteError::MissingDefine("DB_NAME"))?,
            user: user.ok_or(SiteError::MissingDefine("DB_USER"))?,
            password: password.unwrap_or_default(),
            host: DbHost::parse(host.as_deref().unwrap_or(DEFAULT_DB_HOST)),
        };
        log::trace!(target: "wordpress", "Parsed database parameters: {db:?}");

        Ok(Self {
            db,
            content_dir: content_dir.filter(|d| !d.is_empty()).map(PathBuf::from),
        })
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                if !matches!(next, '\\' | '\'' | '"') {
                    out.push('\\');
                }
                out.push(next);
            } else {
                out.push('\\');
            }
        } else {
            out.push(c);
        }
    }
    out
}
