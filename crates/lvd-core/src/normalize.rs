//! Field normalization shared by every adapter: postcode, borough, cuisine and
//! dietary inference, slug generation. Nothing here fails; missing input yields
//! `None` or a default.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::DietaryTags;

pub const DEFAULT_BOROUGH: &str = "Central London";
pub const DEFAULT_CUISINE: &str = "international";
pub const SLUG_FALLBACK: &str = "venue";
const SLUG_ID_SUFFIX_LEN: usize = 8;

static FULL_POSTCODE: OnceLock<Regex> = OnceLock::new();
static OUTWARD_POSTCODE: OnceLock<Regex> = OnceLock::new();
static LOOSE_POSTCODE: OnceLock<Regex> = OnceLock::new();

fn full_postcode() -> &'static Regex {
    FULL_POSTCODE.get_or_init(|| {
        Regex::new(r"(?i)\b([A-Z]{1,2}[0-9][A-Z0-9]?)\s*([0-9][A-Z]{2})\b")
            .expect("Invalid regular expression -- this is a bug.")
    })
}

fn outward_postcode() -> &'static Regex {
    OUTWARD_POSTCODE.get_or_init(|| {
        Regex::new(r"(?i)\b([A-Z]{1,2}[0-9][A-Z0-9]?)\b")
            .expect("Invalid regular expression -- this is a bug.")
    })
}

fn loose_postcode() -> &'static Regex {
    LOOSE_POSTCODE.get_or_init(|| {
        Regex::new(r"(?i)\b([A-Z]+[0-9]+)\b").expect("Invalid regular expression -- this is a bug.")
    })
}

/// A full postcode closes the address: nothing follows it but a separator or
/// the country. Keeps "W1 4th Floor" from reading as "W1 4TH".
fn ends_address(rest: &str) -> bool {
    let rest = rest.trim_start();
    let lowered = rest.to_ascii_lowercase();
    rest.is_empty()
        || rest.starts_with([',', ';', ')', '.'])
        || lowered.starts_with("uk")
        || lowered.starts_with("united kingdom")
}

/// Pulls a UK postcode out of a free-text address.
///
/// Patterns are tried in order: full postcode, outward code only, then any
/// letters+digits token. Within a pattern the last occurrence wins, since
/// formatted addresses end with the postcode.
pub fn extract_postcode(address: &str) -> Option<String> {
    if address.trim().is_empty() {
        return None;
    }
    let full = full_postcode()
        .captures_iter(address)
        .filter(|caps| caps.get(0).is_some_and(|m| ends_address(&address[m.end()..])))
        .last();
    if let Some(caps) = full {
        return Some(format!(
            "{} {}",
            caps[1].to_ascii_uppercase(),
            caps[2].to_ascii_uppercase()
        ));
    }
    for pattern in [outward_postcode(), loose_postcode()] {
        if let Some(caps) = pattern.captures_iter(address).last() {
            return Some(caps[1].to_ascii_uppercase());
        }
    }
    None
}

/// Area name → borough. First substring hit wins, so more specific names
/// must come before names they contain.
pub const BOROUGH_TABLE: &[(&str, &str)] = &[
    ("shoreditch", "Hackney"),
    ("hoxton", "Hackney"),
    ("dalston", "Hackney"),
    ("stoke newington", "Hackney"),
    ("hackney", "Hackney"),
    ("brick lane", "Tower Hamlets"),
    ("spitalfields", "Tower Hamlets"),
    ("whitechapel", "Tower Hamlets"),
    ("bethnal green", "Tower Hamlets"),
    ("canary wharf", "Tower Hamlets"),
    ("soho", "Westminster"),
    ("mayfair", "Westminster"),
    ("covent garden", "Westminster"),
    ("marylebone", "Westminster"),
    ("fitzrovia", "Westminster"),
    ("paddington", "Westminster"),
    ("westminster", "Westminster"),
    ("king's cross", "Camden"),
    ("kings cross", "Camden"),
    ("camden", "Camden"),
    ("kentish town", "Camden"),
    ("hampstead", "Camden"),
    ("holborn", "Camden"),
    ("islington", "Islington"),
    ("angel", "Islington"),
    ("clerkenwell", "Islington"),
    ("highbury", "Islington"),
    ("brixton", "Lambeth"),
    ("clapham", "Lambeth"),
    ("vauxhall", "Lambeth"),
    ("waterloo", "Lambeth"),
    ("peckham", "Southwark"),
    ("bermondsey", "Southwark"),
    ("borough", "Southwark"),
    ("southwark", "Southwark"),
    ("greenwich", "Greenwich"),
    ("notting hill", "Kensington and Chelsea"),
    ("kensington", "Kensington and Chelsea"),
    ("chelsea", "Kensington and Chelsea"),
    ("hammersmith", "Hammersmith and Fulham"),
    ("fulham", "Hammersmith and Fulham"),
    ("shepherd's bush", "Hammersmith and Fulham"),
    ("wembley", "Brent"),
    ("kilburn", "Brent"),
    ("southall", "Ealing"),
    ("ealing", "Ealing"),
    ("stratford", "Newham"),
    ("east ham", "Newham"),
    ("walthamstow", "Waltham Forest"),
    ("tooting", "Wandsworth"),
    ("battersea", "Wandsworth"),
    ("wandsworth", "Wandsworth"),
    ("lewisham", "Lewisham"),
    ("croydon", "Croydon"),
    ("richmond", "Richmond upon Thames"),
    ("city of london", "City of London"),
    ("the city", "City of London"),
];

pub fn infer_borough(address: &str) -> String {
    let lowered = address.to_lowercase();
    BOROUGH_TABLE
        .iter()
        .find(|(area, _)| lowered.contains(area))
        .map(|(_, borough)| borough.to_string())
        .unwrap_or_else(|| DEFAULT_BOROUGH.to_string())
}

/// Cuisine tag → whole-word keywords.
pub const CUISINE_TABLE: &[(&str, &[&str])] = &[
    ("indian", &["indian", "curry", "tandoori", "biryani", "masala", "dosa", "punjabi"]),
    ("pakistani", &["pakistani", "karahi", "lahori"]),
    ("bangladeshi", &["bangladeshi", "bengali"]),
    ("italian", &["italian", "pizza", "pizzeria", "pasta", "trattoria", "osteria"]),
    ("chinese", &["chinese", "dim sum", "dumpling", "dumplings", "cantonese", "sichuan", "szechuan"]),
    ("japanese", &["japanese", "sushi", "ramen", "izakaya", "udon", "yakitori"]),
    ("korean", &["korean", "bibimbap"]),
    ("thai", &["thai"]),
    ("vietnamese", &["vietnamese", "pho", "banh mi"]),
    ("turkish", &["turkish", "ocakbasi", "kebab", "kebabs"]),
    ("middle_eastern", &["lebanese", "persian", "syrian", "shawarma", "falafel", "middle eastern"]),
    ("greek", &["greek", "souvlaki", "gyros"]),
    ("mediterranean", &["mediterranean"]),
    ("spanish", &["spanish", "tapas"]),
    ("french", &["french", "brasserie", "patisserie"]),
    ("british", &["british", "gastropub", "pub", "fish and chips", "pie and mash", "sunday roast"]),
    ("american", &["american", "burger", "burgers", "bbq", "barbecue", "diner"]),
    ("mexican", &["mexican", "taco", "tacos", "burrito", "taqueria"]),
    ("caribbean", &["caribbean", "jamaican", "jerk"]),
    ("african", &["african", "nigerian", "ethiopian", "ghanaian"]),
    ("peruvian", &["peruvian", "ceviche"]),
    ("cafe", &["cafe", "coffee", "bakery", "brunch"]),
];

const HALAL_KEYWORDS: &[&str] = &["halal", "zabiha"];
const VEGAN_KEYWORDS: &[&str] = &["vegan", "plant based"];
const VEGETARIAN_KEYWORDS: &[&str] = &["vegetarian", "veggie", "meat free"];
const GLUTEN_FREE_KEYWORDS: &[&str] = &["gluten free", "coeliac", "celiac"];

/// The free-text parts of a record that tags are inferred from.
#[derive(Debug, Clone, Copy, Default)]
pub struct VenueText<'a> {
    pub name: &'a str,
    pub types: &'a [String],
    pub description: Option<&'a str>,
}

impl VenueText<'_> {
    /// Lowercased, punctuation folded to spaces, padded so `" kw "` lookups
    /// match whole words.
    fn searchable(&self) -> String {
        let mut raw = String::from(self.name);
        for t in self.types {
            raw.push(' ');
            raw.push_str(t);
        }
        if let Some(description) = self.description {
            raw.push(' ');
            raw.push_str(description);
        }
        let folded = raw
            .to_lowercase()
            .replace('\'', "")
            .replace('’', "")
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>();
        format!(" {} ", folded.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| haystack.contains(&format!(" {kw} ")))
}

pub fn infer_cuisines(text: &VenueText<'_>) -> BTreeSet<String> {
    let haystack = text.searchable();
    let mut cuisines = CUISINE_TABLE
        .iter()
        .filter(|(_, keywords)| contains_any(&haystack, keywords))
        .map(|(tag, _)| tag.to_string())
        .collect::<BTreeSet<_>>();
    if cuisines.is_empty() {
        cuisines.insert(DEFAULT_CUISINE.to_string());
    }
    cuisines
}

pub fn infer_dietary_tags(text: &VenueText<'_>) -> DietaryTags {
    let haystack = text.searchable();
    DietaryTags {
        halal: contains_any(&haystack, HALAL_KEYWORDS),
        vegan: contains_any(&haystack, VEGAN_KEYWORDS),
        vegetarian: contains_any(&haystack, VEGETARIAN_KEYWORDS),
        gluten_free: contains_any(&haystack, GLUTEN_FREE_KEYWORDS),
    }
}

/// `name` cleaned into a URL segment plus the tail of the place id.
pub fn generate_slug(name: &str, place_id: &str) -> String {
    let kept = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect::<String>();
    let hyphenated = kept.split_whitespace().collect::<Vec<_>>().join("-");
    let collapsed = hyphenated
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let base = if collapsed.is_empty() {
        SLUG_FALLBACK.to_string()
    } else {
        collapsed
    };

    let chars = place_id.chars().collect::<Vec<_>>();
    let start = chars.len().saturating_sub(SLUG_ID_SUFFIX_LEN);
    let suffix = chars[start..].iter().collect::<String>();
    if suffix.is_empty() {
        base
    } else {
        format!("{base}-{suffix}")
    }
}
