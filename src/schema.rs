use crate::error::{ReconcileError, Result};
use crate::utils::{first_day_of_month, last_day_of_month};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Reporting category of a declared amount, matching the three tables of the
/// recapitulative statement forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Intra-community supplies of goods
    Goods,
    /// Supplies of goods made in the context of triangular operations
    Triangular,
    /// Intra-community supplies of services
    Services,
}

impl Category {
    pub fn table_code(&self) -> char {
        match self {
            Category::Goods => 'L',
            Category::Triangular => 'T',
            Category::Services => 'S',
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_code())
    }
}

/// Filing cadence of a declaration type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Periodicity {
    Monthly,
    Quarterly,
}

impl Periodicity {
    pub fn periods_per_year(&self) -> u32 {
        match self {
            Periodicity::Monthly => 12,
            Periodicity::Quarterly => 4,
        }
    }

    pub fn months_per_period(&self) -> u32 {
        match self {
            Periodicity::Monthly => 1,
            Periodicity::Quarterly => 3,
        }
    }
}

const GOODS_CATEGORIES: [Category; 2] = [Category::Goods, Category::Triangular];
const SERVICES_CATEGORIES: [Category; 1] = [Category::Services];

/// One of the four recapitulative statement types of the exchange format:
/// goods (with its triangular table) or services, filed monthly or quarterly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeclarationType {
    GoodsMonthly,
    GoodsQuarterly,
    ServicesMonthly,
    ServicesQuarterly,
}

impl DeclarationType {
    /// The declaration type code used in the exchange format.
    pub fn code(&self) -> &'static str {
        match self {
            DeclarationType::GoodsMonthly => "TVA_LICM",
            DeclarationType::GoodsQuarterly => "TVA_LICT",
            DeclarationType::ServicesMonthly => "TVA_PSIM",
            DeclarationType::ServicesQuarterly => "TVA_PSIT",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "TVA_LICM" => Some(DeclarationType::GoodsMonthly),
            "TVA_LICT" => Some(DeclarationType::GoodsQuarterly),
            "TVA_PSIM" => Some(DeclarationType::ServicesMonthly),
            "TVA_PSIT" => Some(DeclarationType::ServicesQuarterly),
            _ => None,
        }
    }

    pub fn periodicity(&self) -> Periodicity {
        match self {
            DeclarationType::GoodsMonthly | DeclarationType::ServicesMonthly => {
                Periodicity::Monthly
            }
            DeclarationType::GoodsQuarterly | DeclarationType::ServicesQuarterly => {
                Periodicity::Quarterly
            }
        }
    }

    pub fn is_services(&self) -> bool {
        matches!(
            self,
            DeclarationType::ServicesMonthly | DeclarationType::ServicesQuarterly
        )
    }

    /// The categories a declaration of this type reports on. Goods
    /// declarations carry both the goods and the triangular tables; services
    /// declarations carry the services table only. Cross-category keys never
    /// mix.
    pub fn categories(&self) -> &'static [Category] {
        if self.is_services() {
            &SERVICES_CATEGORIES
        } else {
            &GOODS_CATEGORIES
        }
    }

    /// Same family (goods/services), different filing cadence. Used to build
    /// the target type of a corrective line, whose back-reference fields
    /// carry the cadence of the corrected declaration.
    pub fn with_periodicity(&self, periodicity: Periodicity) -> Self {
        match (self.is_services(), periodicity) {
            (false, Periodicity::Monthly) => DeclarationType::GoodsMonthly,
            (false, Periodicity::Quarterly) => DeclarationType::GoodsQuarterly,
            (true, Periodicity::Monthly) => DeclarationType::ServicesMonthly,
            (true, Periodicity::Quarterly) => DeclarationType::ServicesQuarterly,
        }
    }
}

impl fmt::Display for DeclarationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Identifies one historical filing: declaration type, year and period
/// (month 1-12 or quarter 1-4, depending on the type's cadence).
///
/// Keys order chronologically, so a `BTreeMap` keyed by `DeclarationKey`
/// iterates oldest filing first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeclarationKey {
    pub declaration_type: DeclarationType,
    pub year: i32,
    pub period: u32,
}

impl DeclarationKey {
    pub fn new(declaration_type: DeclarationType, year: i32, period: u32) -> Result<Self> {
        if period < 1 || period > declaration_type.periodicity().periods_per_year() {
            return Err(ReconcileError::InvalidPeriod {
                declaration_type,
                period,
            });
        }
        Ok(Self {
            declaration_type,
            year,
            period,
        })
    }

    /// First calendar month (1-12) covered by this key's period.
    pub fn first_month(&self) -> u32 {
        match self.declaration_type.periodicity() {
            Periodicity::Monthly => self.period,
            Periodicity::Quarterly => self.period * 3 - 2,
        }
    }

    /// Last calendar month (1-12) covered by this key's period.
    pub fn last_month(&self) -> u32 {
        match self.declaration_type.periodicity() {
            Periodicity::Monthly => self.period,
            Periodicity::Quarterly => self.period * 3,
        }
    }

    /// Absolute month index of the first covered month, for chronological
    /// comparison across years and cadences.
    pub fn first_month_index(&self) -> i64 {
        self.year as i64 * 12 + self.first_month() as i64 - 1
    }

    /// Absolute month index of the last covered month.
    pub fn last_month_index(&self) -> i64 {
        self.year as i64 * 12 + self.last_month() as i64 - 1
    }

    /// Whether every month covered by this key precedes every month covered
    /// by `current`. Correcting the same declaring period is not allowed,
    /// and correcting a later one makes no sense, so any overlap fails the
    /// chronology check.
    pub fn is_strictly_before(&self, current: &DeclarationKey) -> bool {
        self.last_month_index() < current.first_month_index()
    }

    /// First and last calendar day of the denoted month or quarter — the
    /// range handed to the ledger collaborator when recomputing this period.
    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        (
            first_day_of_month(self.year, self.first_month()),
            last_day_of_month(self.year, self.last_month()),
        )
    }

    pub fn categories(&self) -> &'static [Category] {
        self.declaration_type.categories()
    }
}

impl Ord for DeclarationKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.year, self.first_month(), self.declaration_type).cmp(&(
            other.year,
            other.first_month(),
            other.declaration_type,
        ))
    }
}

impl PartialOrd for DeclarationKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DeclarationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.declaration_type.code(),
            self.year,
            self.period
        )
    }
}

impl FromStr for DeclarationKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (code, rest) = s
            .split_once(' ')
            .ok_or_else(|| format!("invalid declaration key: {s}"))?;
        let declaration_type = DeclarationType::from_code(code)
            .ok_or_else(|| format!("unknown declaration type: {code}"))?;
        let (year, period) = rest
            .split_once('/')
            .ok_or_else(|| format!("invalid declaration key: {s}"))?;
        let year: i32 = year.parse().map_err(|_| format!("invalid year: {year}"))?;
        let period: u32 = period
            .parse()
            .map_err(|_| format!("invalid period: {period}"))?;
        DeclarationKey::new(declaration_type, year, period).map_err(|e| e.to_string())
    }
}

// Keys appear as map keys in serialized correction sets, so they round-trip
// through their display form rather than a nested struct.
impl Serialize for DeclarationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeclarationKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The (country code, VAT identifier) pair naming the other party of a
/// reported transaction. Both components are normalized on construction:
/// trimmed, uppercased, and the VAT id stripped of interior spaces and dots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CounterpartyKey {
    pub country: String,
    pub vat: String,
}

impl CounterpartyKey {
    pub fn new(country: &str, vat: &str) -> Self {
        Self {
            country: country.trim().to_uppercase(),
            vat: vat
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '.')
                .collect::<String>()
                .to_uppercase(),
        }
    }
}

impl fmt::Display for CounterpartyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.country, self.vat)
    }
}

impl FromStr for CounterpartyKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (country, vat) = s
            .split_once(' ')
            .ok_or_else(|| format!("invalid counterparty key: {s}"))?;
        Ok(CounterpartyKey::new(country, vat))
    }
}

impl Serialize for CounterpartyKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CounterpartyKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One reported amount, always in the filing currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    pub category: Category,
    pub counterparty: CounterpartyKey,
    pub amount: Decimal,
    /// Whether this line itself corrects an earlier period. Corrective
    /// amounts are signed deltas, not replacement values.
    pub corrective: bool,
}

/// The parsed content of one historical declaration document. For corrective
/// lines the associated key is the *target* key read from the line's
/// back-reference fields; for original lines it is the enclosing
/// declaration's own key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedBundle {
    pub original_lines: Vec<(DeclarationKey, LineRecord)>,
    pub corrective_lines: Vec<(DeclarationKey, LineRecord)>,
    /// Every period the filer declared in this document, even with zero
    /// lines.
    pub declared_keys: Vec<DeclarationKey>,
}

impl ParsedBundle {
    pub fn is_empty(&self) -> bool {
        self.original_lines.is_empty()
            && self.corrective_lines.is_empty()
            && self.declared_keys.is_empty()
    }

    /// All lines, original and corrective, with the key each amount applies
    /// to.
    pub fn lines(&self) -> impl Iterator<Item = &(DeclarationKey, LineRecord)> {
        self.original_lines.iter().chain(self.corrective_lines.iter())
    }
}
