use lazy_static::lazy_static;
use regex::Regex;
use std::{fmt, str::FromStr};

/// Errors that can arise when parsing an `ssg://` URL.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("invalid scheme '{0}'")]
    BadScheme(String),
    #[error("invalid ssg url '{0}'")]
    Malformed(String),
}

/// The canonical reference to a blob: `ssg://<cluster>/<bucket>/<path>`.
/// A missing bucket and a missing path are both valid; a trailing slash and a
/// missing path are equivalent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SsgUrl {
    pub cluster: String,
    pub bucket: String,
    pub path: String,
}

lazy_static! {
    static ref SSG_URL: Regex =
        Regex::new(r"^(.*?)://([^/].*?)(?:/(.*?)(/.*)?)?$").expect("hardcoded regex");
}

impl SsgUrl {
    pub fn parse(s: &str) -> Result<SsgUrl, UrlError> {
        let m = SSG_URL
            .captures(s)
            .ok_or_else(|| UrlError::Malformed(s.to_owned()))?;

        let scheme = &m[1];
        if !scheme.eq_ignore_ascii_case("ssg") {
            return Err(UrlError::BadScheme(scheme.to_owned()));
        }

        Ok(SsgUrl {
            cluster: m[2].to_owned(),
            bucket: m.get(3).map(|c| c.as_str()).unwrap_or("").to_owned(),
            path: m
                .get(4)
                .map(|c| c.as_str().trim_matches('/'))
                .unwrap_or("")
                .to_owned(),
        })
    }
}

impl FromStr for SsgUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<SsgUrl, UrlError> {
        SsgUrl::parse(s)
    }
}

impl fmt::Display for SsgUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ssg://{}/{}/{}",
            self.cluster,
            self.bucket,
            self.path.trim_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_a_simple_path() {
        let u = SsgUrl::parse("ssg://cluster/bucket/simple-path").unwrap();
        assert_eq!(u.cluster, "cluster");
        assert_eq!(u.bucket, "bucket");
        assert_eq!(u.path, "simple-path");
    }

    #[test]
    fn parses_a_nested_path() {
        let u = SsgUrl::parse("ssg://prod/backups/snapshots/postgres/DECA-FBAD").unwrap();
        assert_eq!(u.cluster, "prod");
        assert_eq!(u.bucket, "backups");
        assert_eq!(u.path, "snapshots/postgres/DECA-FBAD");
    }

    #[test]
    fn parses_without_a_path() {
        for s in ["ssg://cluster/bucket/", "ssg://cluster/bucket"] {
            let u = SsgUrl::parse(s).unwrap();
            assert_eq!(u.cluster, "cluster");
            assert_eq!(u.bucket, "bucket");
            assert_eq!(u.path, "");
        }
    }

    #[test]
    fn parses_without_a_bucket_or_path() {
        for s in ["ssg://cluster/", "ssg://cluster"] {
            let u = SsgUrl::parse(s).unwrap();
            assert_eq!(u.cluster, "cluster");
            assert_eq!(u.bucket, "");
            assert_eq!(u.path, "");
        }
    }

    #[test]
    fn scheme_is_case_insensitive() {
        assert!(SsgUrl::parse("SSG://cluster/bucket/path").is_ok());
    }

    #[test]
    fn rejects_a_missing_cluster() {
        assert_matches!(SsgUrl::parse("ssg:///bucket/"), Err(UrlError::Malformed(_)));
        assert_matches!(SsgUrl::parse("ssg:///bucket"), Err(UrlError::Malformed(_)));
    }

    #[test]
    fn rejects_other_schemes() {
        assert_matches!(
            SsgUrl::parse("http://example.com"),
            Err(UrlError::BadScheme(_))
        );
    }

    #[test]
    fn stringifies_with_exactly_two_slashes_between_components() {
        let u = SsgUrl {
            cluster: "test1".to_owned(),
            bucket: "backups".to_owned(),
            path: "prod/snapshots/postgres/DECA-FBAD".to_owned(),
        };
        assert_eq!(
            u.to_string(),
            "ssg://test1/backups/prod/snapshots/postgres/DECA-FBAD"
        );
    }

    #[test]
    fn stringification_strips_surrounding_slashes_from_the_path() {
        let mut u = SsgUrl {
            cluster: "test1".to_owned(),
            bucket: "backups".to_owned(),
            path: "/a/leading/slash".to_owned(),
        };
        assert_eq!(u.to_string(), "ssg://test1/backups/a/leading/slash");

        u.path = "a/trailing/slash/".to_owned();
        assert_eq!(u.to_string(), "ssg://test1/backups/a/trailing/slash");
        assert_eq!(u.path, "a/trailing/slash/");
    }

    #[test]
    fn round_trips_through_display() {
        let u = SsgUrl::parse("ssg://c/b/x/y/z").unwrap();
        assert_eq!(SsgUrl::parse(&u.to_string()).unwrap(), u);
    }
}
