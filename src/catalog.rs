//! NIST SP 800-53 Rev 5 control catalog.
//!
//! The catalog is immutable reference data: it is parsed once from the
//! embedded `data/catalog.toml` (baselines and templates) and
//! `data/controls.toml` (titles and requirement statements) and shared
//! read-only by every session. Baselines are cumulative
//! (`low ⊂ moderate ⊂ high ⊂ all`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CATALOG_TOML: &str = include_str!("../data/catalog.toml");
const CONTROL_TEXT_TOML: &str = include_str!("../data/controls.toml");

static CONTROL_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z]{2,3})-(\d+)(?:\((\d+)\))?$").expect("Invalid control id regex")
});

// =============================================================================
// FAMILIES
// =============================================================================

/// A NIST 800-53 control family, ordered as the catalog lists them.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ControlFamily {
    AC,
    AT,
    AU,
    CA,
    CM,
    CP,
    IA,
    IR,
    MA,
    MP,
    PE,
    PL,
    PM,
    PS,
    PT,
    RA,
    SA,
    SC,
    SI,
    SR,
}

impl ControlFamily {
    pub const ALL: [ControlFamily; 20] = [
        Self::AC,
        Self::AT,
        Self::AU,
        Self::CA,
        Self::CM,
        Self::CP,
        Self::IA,
        Self::IR,
        Self::MA,
        Self::MP,
        Self::PE,
        Self::PL,
        Self::PM,
        Self::PS,
        Self::PT,
        Self::RA,
        Self::SA,
        Self::SC,
        Self::SI,
        Self::SR,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Self::AC => "AC",
            Self::AT => "AT",
            Self::AU => "AU",
            Self::CA => "CA",
            Self::CM => "CM",
            Self::CP => "CP",
            Self::IA => "IA",
            Self::IR => "IR",
            Self::MA => "MA",
            Self::MP => "MP",
            Self::PE => "PE",
            Self::PL => "PL",
            Self::PM => "PM",
            Self::PS => "PS",
            Self::PT => "PT",
            Self::RA => "RA",
            Self::SA => "SA",
            Self::SC => "SC",
            Self::SI => "SI",
            Self::SR => "SR",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AC => "Access Control",
            Self::AT => "Awareness and Training",
            Self::AU => "Audit and Accountability",
            Self::CA => "Assessment, Authorization, and Monitoring",
            Self::CM => "Configuration Management",
            Self::CP => "Contingency Planning",
            Self::IA => "Identification and Authentication",
            Self::IR => "Incident Response",
            Self::MA => "Maintenance",
            Self::MP => "Media Protection",
            Self::PE => "Physical and Environmental Protection",
            Self::PL => "Planning",
            Self::PM => "Program Management",
            Self::PS => "Personnel Security",
            Self::PT => "PII Processing and Transparency",
            Self::RA => "Risk Assessment",
            Self::SA => "System and Services Acquisition",
            Self::SC => "System and Communications Protection",
            Self::SI => "System and Information Integrity",
            Self::SR => "Supply Chain Risk Management",
        }
    }

    /// Whether the family is primarily technical rather than policy-based.
    pub fn is_technical(&self) -> bool {
        matches!(
            self,
            Self::AC
                | Self::AU
                | Self::CM
                | Self::CP
                | Self::IA
                | Self::MA
                | Self::SC
                | Self::SI
                | Self::SR
        )
    }
}

impl fmt::Display for ControlFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ControlFamily {
    type Err = ControlIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.code() == code)
            .ok_or(ControlIdError::UnknownFamily(code))
    }
}

// =============================================================================
// CONTROL IDS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlIdError {
    #[error("malformed control id '{0}' (expected e.g. AC-2 or AC-17(1))")]
    Malformed(String),
    #[error("unknown control family '{0}'")]
    UnknownFamily(String),
}

/// A control identifier such as `AC-2` or `AC-17(1)`.
///
/// Ordering follows the catalog: family, then control number, then
/// enhancement (base control first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlId {
    family: ControlFamily,
    number: u16,
    enhancement: Option<u16>,
}

impl ControlId {
    pub fn new(family: ControlFamily, number: u16, enhancement: Option<u16>) -> Self {
        Self {
            family,
            number,
            enhancement,
        }
    }

    pub fn family(&self) -> ControlFamily {
        self.family
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn enhancement(&self) -> Option<u16> {
        self.enhancement
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.enhancement {
            Some(e) => write!(f, "{}-{}({})", self.family, self.number, e),
            None => write!(f, "{}-{}", self.family, self.number),
        }
    }
}

impl FromStr for ControlId {
    type Err = ControlIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let caps = CONTROL_ID_PATTERN
            .captures(trimmed)
            .ok_or_else(|| ControlIdError::Malformed(trimmed.to_string()))?;
        let family: ControlFamily = caps[1].parse()?;
        let number = caps[2]
            .parse()
            .map_err(|_| ControlIdError::Malformed(trimmed.to_string()))?;
        let enhancement = match caps.get(3) {
            Some(m) => Some(
                m.as_str()
                    .parse()
                    .map_err(|_| ControlIdError::Malformed(trimmed.to_string()))?,
            ),
            None => None,
        };
        Ok(Self::new(family, number, enhancement))
    }
}

impl Serialize for ControlId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ControlId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// BASELINES AND TEMPLATES
// =============================================================================

/// Baseline impact level selected for an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Baseline {
    Low,
    #[default]
    Moderate,
    High,
    /// No baseline set: selection comes only from families and explicit IDs.
    Custom,
    All,
}

impl Baseline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Custom => "custom",
            Self::All => "all",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Low => "NIST 800-53 Rev 5 Low Baseline",
            Self::Moderate => "NIST 800-53 Rev 5 Moderate Baseline",
            Self::High => "NIST 800-53 Rev 5 High Baseline",
            Self::Custom => "Custom Selection",
            Self::All => "Full NIST 800-53 Catalog",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Low => "For low-impact systems",
            Self::Moderate => "For moderate-impact systems (recommended)",
            Self::High => "For high-impact systems and classified data",
            Self::Custom => "Families and explicit controls only",
            Self::All => "All controls (not recommended for initial assessment)",
        }
    }
}

impl fmt::Display for Baseline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named scope template that expands to a family list.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub baseline: Baseline,
    pub families: Vec<ControlFamily>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BaselineSummary {
    pub id: Baseline,
    pub name: &'static str,
    pub control_count: usize,
    pub description: &'static str,
}

/// One row of the control listing.
#[derive(Debug, Clone, Serialize)]
pub struct ControlSummary<'a> {
    pub id: ControlId,
    pub title: &'a str,
    pub family: ControlFamily,
}

/// Catalog text a reasoning call checks an implementation against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlReference {
    pub id: ControlId,
    /// Enhancements read "Base Title | Enhancement Title".
    pub title: String,
    /// Enhancements carry their base control's statement.
    pub statement: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FamilySummary {
    pub code: ControlFamily,
    pub name: &'static str,
    pub control_count: usize,
    pub technical: bool,
}

// =============================================================================
// CATALOG
// =============================================================================

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("catalog entry {entry:?} in '{list}': {source}")]
    Entry {
        list: &'static str,
        entry: String,
        source: ControlIdError,
    },
    #[error("control text given for {0}, which no baseline lists")]
    TextWithoutControl(ControlId),
}

#[derive(Deserialize)]
struct CatalogFile {
    baselines: BaselineLists,
    #[serde(default)]
    templates: BTreeMap<String, TemplateEntry>,
}

#[derive(Deserialize)]
struct BaselineLists {
    low: Vec<String>,
    moderate: Vec<String>,
    high: Vec<String>,
    catalog_only: Vec<String>,
}

#[derive(Deserialize)]
struct ControlTextFile {
    controls: BTreeMap<ControlId, ControlText>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ControlText {
    title: String,
    #[serde(default)]
    statement: Option<String>,
}

#[derive(Deserialize)]
struct TemplateEntry {
    name: String,
    description: String,
    baseline: Baseline,
    families: Vec<ControlFamily>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    low: BTreeSet<ControlId>,
    moderate: BTreeSet<ControlId>,
    high: BTreeSet<ControlId>,
    all: BTreeSet<ControlId>,
    templates: BTreeMap<String, ScopeTemplate>,
    text: BTreeMap<ControlId, ControlText>,
}

static CATALOG: OnceLock<Catalog> = OnceLock::new();

impl Catalog {
    /// The embedded catalog, parsed on first use.
    pub fn global() -> &'static Catalog {
        CATALOG.get_or_init(|| {
            Catalog::from_toml(CATALOG_TOML)
                .and_then(|catalog| catalog.with_text(CONTROL_TEXT_TOML))
                .expect("Invalid embedded catalog")
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(raw)?;

        let parse = |list: &'static str, ids: &[String]| -> Result<BTreeSet<ControlId>, CatalogError> {
            ids.iter()
                .map(|id| {
                    id.parse().map_err(|source| CatalogError::Entry {
                        list,
                        entry: id.clone(),
                        source,
                    })
                })
                .collect()
        };

        let low = parse("low", &file.baselines.low)?;
        let mut moderate = low.clone();
        moderate.extend(parse("moderate", &file.baselines.moderate)?);
        let mut high = moderate.clone();
        high.extend(parse("high", &file.baselines.high)?);
        let mut all = high.clone();
        all.extend(parse("catalog_only", &file.baselines.catalog_only)?);

        let templates = file
            .templates
            .into_iter()
            .map(|(id, t)| {
                let template = ScopeTemplate {
                    id: id.clone(),
                    name: t.name,
                    description: t.description,
                    baseline: t.baseline,
                    families: t.families,
                };
                (id, template)
            })
            .collect();

        Ok(Self {
            low,
            moderate,
            high,
            all,
            templates,
            text: BTreeMap::new(),
        })
    }

    /// Attach titles and statements. Every entry must name a catalog control.
    pub fn with_text(mut self, raw: &str) -> Result<Self, CatalogError> {
        let file: ControlTextFile = toml::from_str(raw)?;
        if let Some(stray) = file.controls.keys().find(|id| !self.all.contains(id)) {
            return Err(CatalogError::TextWithoutControl(*stray));
        }
        self.text = file.controls;
        Ok(self)
    }

    pub fn title(&self, id: &ControlId) -> Option<&str> {
        self.text.get(id).map(|t| t.title.as_str())
    }

    pub fn reference(&self, id: &ControlId) -> Option<ControlReference> {
        let own = self.text.get(id)?;
        let (title, statement) = match id.enhancement() {
            None => (own.title.clone(), own.statement.clone().unwrap_or_default()),
            Some(_) => {
                let base = self.text.get(&ControlId::new(id.family(), id.number(), None));
                let title = match base {
                    Some(b) => format!("{} | {}", b.title, own.title),
                    None => own.title.clone(),
                };
                let statement = own
                    .statement
                    .clone()
                    .or_else(|| base.and_then(|b| b.statement.clone()))
                    .unwrap_or_default();
                (title, statement)
            }
        };
        Some(ControlReference {
            id: *id,
            title,
            statement,
        })
    }

    /// Every control with its title, optionally limited to one family.
    pub fn control_listing(&self, family: Option<ControlFamily>) -> Vec<ControlSummary<'_>> {
        self.all
            .iter()
            .filter(|id| family.map_or(true, |f| id.family() == f))
            .map(|id| ControlSummary {
                id: *id,
                title: self.title(id).unwrap_or_default(),
                family: id.family(),
            })
            .collect()
    }

    /// Controls in a baseline. `Custom` has no baseline set.
    pub fn baseline(&self, baseline: Baseline) -> Option<&BTreeSet<ControlId>> {
        match baseline {
            Baseline::Low => Some(&self.low),
            Baseline::Moderate => Some(&self.moderate),
            Baseline::High => Some(&self.high),
            Baseline::All => Some(&self.all),
            Baseline::Custom => None,
        }
    }

    pub fn all_controls(&self) -> &BTreeSet<ControlId> {
        &self.all
    }

    pub fn contains(&self, id: &ControlId) -> bool {
        self.all.contains(id)
    }

    pub fn controls_in_family(&self, family: ControlFamily) -> impl Iterator<Item = &ControlId> {
        self.all.iter().filter(move |c| c.family() == family)
    }

    pub fn template(&self, id: &str) -> Option<&ScopeTemplate> {
        self.templates.get(id)
    }

    pub fn templates(&self) -> impl Iterator<Item = &ScopeTemplate> {
        self.templates.values()
    }

    pub fn baseline_summaries(&self) -> Vec<BaselineSummary> {
        [Baseline::Low, Baseline::Moderate, Baseline::High, Baseline::All]
            .into_iter()
            .map(|b| BaselineSummary {
                id: b,
                name: b.display_name(),
                control_count: self.baseline(b).map(BTreeSet::len).unwrap_or(0),
                description: b.description(),
            })
            .collect()
    }

    pub fn family_summaries(&self) -> Vec<FamilySummary> {
        ControlFamily::ALL
            .iter()
            .map(|&family| FamilySummary {
                code: family,
                name: family.name(),
                control_count: self.controls_in_family(family).count(),
                technical: family.is_technical(),
            })
            .collect()
    }
}
