//! Extended-info (`#EXTINF`) playlist parser.
//!
//! The input is a loosely structured list of metadata/url line pairs:
//!
//! ```text
//! #EXTINF:-1 tvg-logo="https://x/logo.png" group-title="Rock",Station Name
//! https://stream.example/live
//! #EXTINF:-1,Other Station | Jazz
//! https://other.example/live
//! ```
//!
//! Parsing is lossy on error: malformed or partial entries are dropped and the
//! parser never fails.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::protocol::{Station, StationId};

pub const EXTINF_PREFIX: &str = "#EXTINF:";
pub const DEFAULT_NAME: &str = "Unknown Station";
pub const DEFAULT_LOGO: &str = "https://via.placeholder.com/200?text=Radio";
/// Generic category used when nothing is declared or inferred.
pub const GENERIC_CATEGORY: &str = "Genel";
/// Label of the "every station" listing.
pub const ALL_CATEGORY: &str = "Tümü";

/// Categories listed first, in this order.
pub const PREFERRED_CATEGORIES: &[&str] = &[
    "Pop", "Rock", "Türkü", "Arabesk", "Haber", "Spor", "Jazz", "Klasik", "Rap", "Hip Hop",
];

/// Keyword → category table, matched against the lowercased name.  First
/// match wins.
const KEYWORD_CATEGORIES: &[(&str, &str)] = &[
    ("pop", "Pop"),
    ("rock", "Rock"),
    ("türkü", "Türkü"),
    ("turkü", "Türkü"),
    ("arabesk", "Arabesk"),
    ("haber", "Haber"),
    ("spor", "Spor"),
    ("jazz", "Jazz"),
    ("klasik", "Klasik"),
    ("rap", "Rap"),
    ("hip hop", "Hip Hop"),
    ("hiphop", "Hip Hop"),
    ("türk sanat", "Türk Sanat Müziği"),
    ("tsm", "Türk Sanat Müziği"),
    ("türk halk", "Türk Halk Müziği"),
    ("thm", "Türk Halk Müziği"),
    ("slow", "Slow"),
    ("dini", "Dini"),
    ("çocuk", "Çocuk"),
    ("nostalji", "Nostalji"),
    ("remix", "Remix"),
    ("türkçe", "Türkçe Pop"),
    ("foreign", "Yabancı"),
    ("yabancı", "Yabancı"),
    ("english", "Yabancı"),
    ("ingilizce", "Yabancı"),
    ("news", "Haber"),
    ("info", "Haber"),
];

/// Generic channel-list headers that never form a category.
const HEADER_LABELS: &[&str] = &["RADYO KANALLARI"];

/// Minimum run of leading dashes that marks a separator/header label.
const DASH_RUN: &str = "---";

fn attribute_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([^\s=",]+)="([^"]*)""#).ok())
        .as_ref()
}

/// Result of parsing one metadata line.
#[derive(Debug, Clone, PartialEq, Default)]
struct ExtInf {
    name: String,
    logo: String,
    group: String,
}

/// Parsed playlist: ordered stations plus the ordered category set.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    stations: Vec<Station>,
    categories: Vec<String>,
}

impl Playlist {
    /// Parse raw playlist text.  Never fails; malformed entries are dropped.
    pub fn parse(content: &str) -> Self {
        let mut stations = Vec::new();
        let mut pending: Option<ExtInf> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with(EXTINF_PREFIX) {
                // A header line clears whatever was pending; a second metadata
                // line before a url silently replaces the first.
                pending = parse_extinf(line);
                continue;
            }

            if line.starts_with('#') {
                continue;
            }

            let Some(info) = pending.take() else {
                // url without metadata
                continue;
            };
            stations.push(Station {
                name: non_empty_or(info.name, DEFAULT_NAME),
                logo_url: non_empty_or(info.logo, DEFAULT_LOGO),
                group: non_empty_or(info.group, GENERIC_CATEGORY),
                url: line.to_string(),
            });
        }

        let categories = collect_categories(&stations);
        Self {
            stations,
            categories,
        }
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Stations whose category matches `label` exactly, or every station for
    /// the "all" sentinel.
    pub fn get_stations_by_category(&self, label: &str) -> Vec<&Station> {
        if is_all_sentinel(label) {
            return self.stations.iter().collect();
        }
        self.stations.iter().filter(|s| s.group == label).collect()
    }

    /// Case-insensitive substring match against name or category.  An empty
    /// query returns every station in playlist order.
    pub fn search_stations(&self, query: &str) -> Vec<&Station> {
        if query.is_empty() {
            return self.stations.iter().collect();
        }
        let needle = query.to_lowercase();
        self.stations
            .iter()
            .filter(|s| {
                s.name.to_lowercase().contains(&needle) || s.group.to_lowercase().contains(&needle)
            })
            .collect()
    }

    /// First station with the given identity.
    pub fn find(&self, id: &StationId) -> Option<&Station> {
        self.stations.iter().find(|s| s.is(id))
    }
}

pub fn is_all_sentinel(label: &str) -> bool {
    label.is_empty() || label == ALL_CATEGORY || label.eq_ignore_ascii_case("all")
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

/// Parse a `#EXTINF:` line.  Returns `None` for separator/header lines.
fn parse_extinf(line: &str) -> Option<ExtInf> {
    let mut info = ExtInf::default();
    let mut declared_group = String::new();

    let attributes = attribute_re().into_iter().flat_map(|re| re.captures_iter(line));
    for caps in attributes {
        let key = &caps[1];
        let value = &caps[2];
        if value.is_empty() {
            continue;
        }
        if key.contains("logo") {
            info.logo = value.to_string();
        } else if key.contains("group-title") {
            declared_group = value.to_string();
        }
    }

    let Some(comma) = line.rfind(',') else {
        info.group = declared_group;
        return Some(info);
    };
    let label = line[comma + 1..].trim();
    if is_header_label(label) {
        return None;
    }

    match split_label(label) {
        Some((name, category)) => {
            info.name = name.to_string();
            info.group = category.to_string();
        }
        None => {
            info.name = label.to_string();
            info.group = if declared_group.is_empty() {
                infer_category(label).to_string()
            } else {
                declared_group
            };
        }
    }
    Some(info)
}

/// Split `<name> | <category>` at the first pipe.  An empty category part is
/// not a split.
fn split_label(label: &str) -> Option<(&str, &str)> {
    let (name, category) = label.split_once('|')?;
    let category = category.trim();
    if category.is_empty() {
        return None;
    }
    Some((name.trim(), category))
}

fn is_header_label(label: &str) -> bool {
    label.starts_with(DASH_RUN)
}

/// Category from name keywords, falling back to the generic label.
pub fn infer_category(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    KEYWORD_CATEGORIES
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, category)| *category)
        .unwrap_or(GENERIC_CATEGORY)
}

/// Separator lines, channel-list headers and anything under 2 characters.
pub fn is_noise_category(label: &str) -> bool {
    label.chars().count() < 2
        || label.starts_with(DASH_RUN)
        || HEADER_LABELS.iter().any(|h| label.contains(h))
}

fn collect_categories(stations: &[Station]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut categories: Vec<String> = stations
        .iter()
        .map(|s| s.group.as_str())
        .filter(|g| !is_noise_category(g))
        .filter(|g| seen.insert(*g))
        .map(str::to_string)
        .collect();
    categories.sort_by(|a, b| compare_categories(a, b));
    categories
}

/// Preferred categories first (in list order), the rest by Turkish collation.
pub fn compare_categories(a: &str, b: &str) -> Ordering {
    let rank = |c: &str| PREFERRED_CATEGORIES.iter().position(|p| *p == c);
    match (rank(a), rank(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => turkish_cmp(a, b),
    }
}

const TURKISH_ALPHABET: &str = "abcçdefgğhıijklmnoöpqrsştuüvwxyz";

/// Primary collation key of one character: (class, weight).
/// Punctuation and spaces sort before digits, digits before letters.
fn primary_key(c: char) -> (u8, u32) {
    let lower = turkish_lower(c);
    if let Some(pos) = TURKISH_ALPHABET.chars().position(|l| l == lower) {
        return (2, pos as u32);
    }
    if lower.is_ascii_digit() {
        return (1, lower as u32);
    }
    if lower.is_alphabetic() {
        return (3, lower as u32);
    }
    (0, lower as u32)
}

fn turkish_lower(c: char) -> char {
    match c {
        'I' => 'ı',
        'İ' => 'i',
        other => other.to_lowercase().next().unwrap_or(other),
    }
}

/// Locale-aware comparison for the Turkish alphabet: letters compare
/// case-insensitively first (ç after c, ı before i, ...), then lowercase sorts
/// before uppercase.
pub fn turkish_cmp(a: &str, b: &str) -> Ordering {
    let primary = a.chars().map(primary_key).cmp(b.chars().map(primary_key));
    if primary != Ordering::Equal {
        return primary;
    }
    // tertiary: lowercase first
    let case_key = |c: char| !c.is_lowercase();
    a.chars()
        .map(case_key)
        .cmp(b.chars().map(case_key))
        .then_with(|| a.cmp(b))
}
