//! Per-scan cookie catalog.
//!
//! Cookies are grouped by purpose and deduplicated by name within a group.
//! Each entry remembers the shallowest URL the cookie was seen on.

use muncher_scanner::frontier::url_path_depth;
use muncher_scanner::{ResolvedCookie, UNKNOWN_PURPOSE};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieCatalogEntry {
    pub cookie: ResolvedCookie,
    pub first_found_url: String,
}

impl CookieCatalogEntry {
    pub fn name(&self) -> &str {
        self.cookie.name()
    }

    pub fn purpose(&self) -> &str {
        self.cookie.purpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurposeGroup {
    pub purpose: String,
    pub entries: Vec<CookieCatalogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CookieCatalog {
    pub groups: Vec<PurposeGroup>,
    pub unique_cookies: usize,
    pub total_cookies: usize,
    pub unidentified_cookies: usize,
}

impl CookieCatalog {
    pub fn group(&self, purpose: &str) -> Option<&PurposeGroup> {
        self.groups.iter().find(|g| g.purpose == purpose)
    }

    pub fn entry(&self, purpose: &str, name: &str) -> Option<&CookieCatalogEntry> {
        self.group(purpose)?.entries.iter().find(|e| e.name() == name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CookieCatalogEntry> {
        self.groups.iter().flat_map(|g| g.entries.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.unique_cookies == 0
    }
}

#[derive(Debug, Default)]
pub struct CookieCatalogBuilder {
    catalog: CookieCatalog,
}

impl CookieCatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cookie: ResolvedCookie, source_url: &str) {
        self.catalog.total_cookies += 1;

        let purpose = cookie.purpose().to_string();
        let group_idx = match self.catalog.groups.iter().position(|g| g.purpose == purpose) {
            Some(idx) => idx,
            None => {
                self.catalog.groups.push(PurposeGroup {
                    purpose: purpose.clone(),
                    entries: Vec::new(),
                });
                self.catalog.groups.len() - 1
            }
        };
        let group = &mut self.catalog.groups[group_idx];

        match group.entries.iter_mut().find(|e| e.name() == cookie.name()) {
            Some(existing) => {
                // ties keep the first URL seen
                if url_path_depth(source_url) < url_path_depth(&existing.first_found_url) {
                    existing.cookie = cookie;
                    existing.first_found_url = source_url.to_string();
                }
            }
            None => {
                group.entries.push(CookieCatalogEntry {
                    cookie,
                    first_found_url: source_url.to_string(),
                });
                self.catalog.unique_cookies += 1;
                if purpose == UNKNOWN_PURPOSE {
                    self.catalog.unidentified_cookies += 1;
                }
            }
        }
    }

    pub fn catalog(&self) -> &CookieCatalog {
        &self.catalog
    }

    pub fn build(self) -> CookieCatalog {
        self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use muncher_scanner::{CookieMetadata, RawCookie};

    fn resolved(name: &str, purpose: &str, source_url: &str) -> ResolvedCookie {
        ResolvedCookie {
            cookie: RawCookie {
                name: name.to_string(),
                value: format!("{}-value", name),
                domain: "site.test".to_string(),
                path: "/".to_string(),
                http_only: false,
                secure: true,
                expires: None,
                source_url: source_url.to_string(),
                captured_at: Utc::now(),
            },
            metadata: CookieMetadata {
                name: name.to_string(),
                purpose: purpose.to_string(),
                about: None,
                resolved_at: Utc::now(),
            },
        }
    }

    fn add(builder: &mut CookieCatalogBuilder, name: &str, purpose: &str, url: &str) {
        builder.add(resolved(name, purpose, url), url);
    }

    #[test]
    fn test_shallower_url_replaces_first_found() {
        let mut builder = CookieCatalogBuilder::new();
        add(&mut builder, "sid", "Strictly Necessary", "https://site.test/a/b");
        add(&mut builder, "sid", "Strictly Necessary", "https://site.test/");

        let catalog = builder.build();
        let entry = catalog.entry("Strictly Necessary", "sid").unwrap();
        assert_eq!(entry.first_found_url, "https://site.test/");
        assert_eq!(entry.cookie.cookie.source_url, "https://site.test/");
        assert_eq!(catalog.unique_cookies, 1);
        assert_eq!(catalog.total_cookies, 2);
    }

    #[test]
    fn test_equal_depth_keeps_first_seen() {
        let mut builder = CookieCatalogBuilder::new();
        add(&mut builder, "sid", "Functionality", "https://site.test/a");
        add(&mut builder, "sid", "Functionality", "https://site.test/b");
        add(&mut builder, "sid", "Functionality", "https://site.test/c/d");

        let catalog = builder.build();
        assert_eq!(
            catalog.entry("Functionality", "sid").unwrap().first_found_url,
            "https://site.test/a"
        );
    }

    #[test]
    fn test_minimum_depth_wins_over_any_order() {
        let urls = [
            "https://site.test/x/y/z",
            "https://site.test/x",
            "https://site.test/x/y",
            "https://site.test/q",
        ];
        let mut builder = CookieCatalogBuilder::new();
        for url in urls {
            add(&mut builder, "_ga", "Performance", url);
        }

        let catalog = builder.build();
        assert_eq!(catalog.group("Performance").unwrap().entries.len(), 1);
        assert_eq!(
            catalog.entry("Performance", "_ga").unwrap().first_found_url,
            "https://site.test/x"
        );
    }

    #[test]
    fn test_unknown_purpose_is_counted_as_unidentified() {
        let mut builder = CookieCatalogBuilder::new();
        add(&mut builder, "xyz", UNKNOWN_PURPOSE, "https://site.test/");
        add(&mut builder, "xyz", UNKNOWN_PURPOSE, "https://site.test/other");
        add(&mut builder, "_ga", "Performance", "https://site.test/");

        let catalog = builder.build();
        let entry = catalog.entry(UNKNOWN_PURPOSE, "xyz").unwrap();
        assert_eq!(entry.purpose(), UNKNOWN_PURPOSE);
        assert_eq!(catalog.unidentified_cookies, 1);
        assert_eq!(catalog.unique_cookies, 2);
        assert_eq!(catalog.total_cookies, 3);
    }

    #[test]
    fn test_blank_purpose_lands_in_unknown() {
        let mut builder = CookieCatalogBuilder::new();
        add(&mut builder, "odd", "  ", "https://site.test/");

        let catalog = builder.build();
        assert!(catalog.entry(UNKNOWN_PURPOSE, "odd").is_some());
        assert_eq!(catalog.unidentified_cookies, 1);
    }

    #[test]
    fn test_same_name_different_purpose_are_separate_entries() {
        let mut builder = CookieCatalogBuilder::new();
        add(&mut builder, "id", "Targeting/Advertising", "https://site.test/");
        add(&mut builder, "id", UNKNOWN_PURPOSE, "https://site.test/");

        let catalog = builder.build();
        assert_eq!(catalog.unique_cookies, 2);
        let purposes: Vec<&str> = catalog.groups.iter().map(|g| g.purpose.as_str()).collect();
        assert_eq!(purposes, vec!["Targeting/Advertising", UNKNOWN_PURPOSE]);
    }

    #[test]
    fn test_unparsable_url_never_replaces_parsable() {
        let mut builder = CookieCatalogBuilder::new();
        add(&mut builder, "sid", "Functionality", "https://site.test/a/b/c");
        add(&mut builder, "sid", "Functionality", "not a url");

        let catalog = builder.build();
        assert_eq!(
            catalog.entry("Functionality", "sid").unwrap().first_found_url,
            "https://site.test/a/b/c"
        );
    }

    #[test]
    fn test_catalog_serializes_to_json() {
        let mut builder = CookieCatalogBuilder::new();
        add(&mut builder, "sid", "Strictly Necessary", "https://site.test/");

        let json = serde_json::to_value(builder.catalog()).unwrap();
        assert_eq!(json["unique_cookies"], 1);
        assert_eq!(json["groups"][0]["purpose"], "Strictly Necessary");
        assert_eq!(
            json["groups"][0]["entries"][0]["first_found_url"],
            "https://site.test/"
        );
    }
}
