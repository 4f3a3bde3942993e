//! Precision-aware bounds of date, dateTime and time values.
//!
//! A partial literal such as `@2018-03` stands for the half-open range
//! `[2018-03-01, 2018-04-01)`. Comparisons between values of different
//! precision are decided on those ranges and are unknown (`NULL`) when the
//! ranges overlap.

use time::{Date, Duration, Month, PrimitiveDateTime, Time};

use crate::ast::LiteralType;
use crate::dialect::SqlDialect;
use crate::{Error, Result};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Granularity a temporal value was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Precision {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
}

impl Precision {
    fn from_time_components(count: usize, has_fraction: bool) -> Self {
        match (count, has_fraction) {
            (1, _) => Self::Hour,
            (2, _) => Self::Minute,
            (_, false) => Self::Second,
            (_, true) => Self::Millisecond,
        }
    }

    fn duration(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Minute => Duration::minutes(1),
            Self::Second => Duration::seconds(1),
            _ => Duration::milliseconds(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Instant {
    Date(Date),
    DateTime(PrimitiveDateTime),
    /// Milliseconds since midnight; may equal a whole day for an exclusive upper bound.
    Time(i64),
}

impl Instant {
    fn render(self, dialect: &dyn SqlDialect, with_millis: bool) -> String {
        match self {
            Self::Date(date) => dialect.date_literal(&date.to_string()),
            Self::DateTime(datetime) => {
                let mut text = format!(
                    "{}T{:02}:{:02}:{:02}",
                    datetime.date(),
                    datetime.hour(),
                    datetime.minute(),
                    datetime.second()
                );
                if with_millis {
                    text.push_str(&format!(".{:03}", datetime.millisecond()));
                }
                dialect.datetime_literal(&text)
            }
            Self::Time(millis) => {
                let seconds = millis / 1000;
                let mut text = format!(
                    "{:02}:{:02}:{:02}",
                    seconds / 3600,
                    (seconds / 60) % 60,
                    seconds % 60
                );
                if with_millis {
                    text.push_str(&format!(".{:03}", millis % 1000));
                }
                dialect.time_literal(&text)
            }
        }
    }
}

/// A parsed date, dateTime or time literal.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TemporalLiteral {
    pub literal_type: LiteralType,
    pub precision: Precision,
    lower: Instant,
    upper: Instant,
}

impl TemporalLiteral {
    /// Parse the value of a temporal literal (without the leading `@`).
    pub fn parse(value: &str, literal_type: LiteralType) -> Result<Self> {
        let invalid = || Error::InvalidLiteral(format!("{literal_type} literal '{value}'"));
        match literal_type {
            LiteralType::Date => {
                let (date, precision) = parse_date(value).ok_or_else(invalid)?;
                let upper = next_date(date, precision).ok_or_else(invalid)?;
                Ok(Self {
                    literal_type,
                    precision,
                    lower: Instant::Date(date),
                    upper: Instant::Date(upper),
                })
            }
            LiteralType::DateTime => {
                let (date_part, time_part) = match value.split_once('T') {
                    Some((date, time)) => (date, strip_timezone(time)),
                    None => (value, ""),
                };
                let (date, date_precision) = parse_date(date_part).ok_or_else(invalid)?;
                if time_part.is_empty() {
                    let upper = next_date(date, date_precision).ok_or_else(invalid)?;
                    return Ok(Self {
                        literal_type,
                        precision: date_precision,
                        lower: Instant::DateTime(PrimitiveDateTime::new(date, Time::MIDNIGHT)),
                        upper: Instant::DateTime(PrimitiveDateTime::new(upper, Time::MIDNIGHT)),
                    });
                }
                if date_precision != Precision::Day {
                    return Err(invalid());
                }
                let (millis, precision) = parse_time(time_part).ok_or_else(invalid)?;
                let start = Time::MIDNIGHT + Duration::milliseconds(millis);
                let lower = PrimitiveDateTime::new(date, start);
                let upper = lower
                    .checked_add(precision.duration())
                    .ok_or_else(invalid)?;
                Ok(Self {
                    literal_type,
                    precision,
                    lower: Instant::DateTime(lower),
                    upper: Instant::DateTime(upper),
                })
            }
            LiteralType::Time => {
                let (millis, precision) = parse_time(value).ok_or_else(invalid)?;
                let step = precision.duration().whole_milliseconds() as i64;
                Ok(Self {
                    literal_type,
                    precision,
                    lower: Instant::Time(millis),
                    upper: Instant::Time((millis + step).min(MILLIS_PER_DAY)),
                })
            }
            other => Err(Error::UnsupportedLiteralType(other.to_string())),
        }
    }

    /// Whether the literal carries every component of its type.
    pub fn is_full_precision(&self) -> bool {
        match self.literal_type {
            LiteralType::Date => self.precision >= Precision::Day,
            _ => self.precision >= Precision::Second,
        }
    }

    /// Half-open `[lower, upper)` bounds rendered as SQL literals.
    pub fn bounds(&self, dialect: &dyn SqlDialect) -> TemporalBounds {
        let with_millis = self.precision == Precision::Millisecond;
        TemporalBounds {
            lower: self.lower.render(dialect, with_millis),
            upper: self.upper.render(dialect, with_millis),
            point: false,
        }
    }
}

fn parse_date(text: &str) -> Option<(Date, Precision)> {
    fn number(part: &str, digits: usize) -> Option<u16> {
        if part.len() != digits || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    }

    let parts: Vec<&str> = text.split('-').collect();
    let (year, month, day, precision) = match parts.as_slice() {
        [year] => (number(year, 4)?, 1, 1, Precision::Year),
        [year, month] => (number(year, 4)?, number(month, 2)?, 1, Precision::Month),
        [year, month, day] => (
            number(year, 4)?,
            number(month, 2)?,
            number(day, 2)?,
            Precision::Day,
        ),
        _ => return None,
    };
    let month = Month::try_from(u8::try_from(month).ok()?).ok()?;
    let date =
        Date::from_calendar_date(i32::from(year), month, u8::try_from(day).ok()?).ok()?;
    Some((date, precision))
}

fn next_date(date: Date, precision: Precision) -> Option<Date> {
    match precision {
        Precision::Year => Date::from_calendar_date(date.year() + 1, Month::January, 1).ok(),
        Precision::Month if date.month() == Month::December => {
            Date::from_calendar_date(date.year() + 1, Month::January, 1).ok()
        }
        Precision::Month => Date::from_calendar_date(date.year(), date.month().next(), 1).ok(),
        _ => date.next_day(),
    }
}

/// Parse `hh[:mm[:ss[.fff]]]` into milliseconds since midnight.
fn parse_time(text: &str) -> Option<(i64, Precision)> {
    let (clock, fraction) = match text.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (text, None),
    };
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.is_empty() || parts.len() > 3 || (fraction.is_some() && parts.len() != 3) {
        return None;
    }

    let mut components = [0u8; 3];
    for (slot, part) in components.iter_mut().zip(&parts) {
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse().ok()?;
    }
    let millis = match fraction {
        Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            let padded = format!("{digits:0<3}");
            padded.get(..3)?.parse::<u16>().ok()?
        }
        Some(_) => return None,
        None => 0,
    };

    let time = Time::from_hms_milli(components[0], components[1], components[2], millis).ok()?;
    let total = i64::from(time.hour()) * 3_600_000
        + i64::from(time.minute()) * 60_000
        + i64::from(time.second()) * 1000
        + i64::from(time.millisecond());
    Some((
        total,
        Precision::from_time_components(parts.len(), fraction.is_some()),
    ))
}

fn strip_timezone(time: &str) -> &str {
    let end = time
        .find(|c: char| c == 'Z' || c == '+' || c == '-')
        .unwrap_or(time.len());
    &time[..end]
}

/// Bounds of one comparison operand.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TemporalBounds {
    pub lower: String,
    /// Exclusive for ranges, equal to `lower` for points.
    pub upper: String,
    pub point: bool,
}

impl TemporalBounds {
    /// A value of unknown precision treated as a single instant.
    pub fn point(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self {
            lower: sql.clone(),
            upper: sql,
            point: true,
        }
    }
}

/// `max(a) < min(b)`
fn entirely_before(a: &TemporalBounds, b: &TemporalBounds) -> String {
    if a.point {
        format!("{} < {}", a.upper, b.lower)
    } else {
        format!("{} <= {}", a.upper, b.lower)
    }
}

/// `max(a) <= min(b)`
fn at_or_before(a: &TemporalBounds, b: &TemporalBounds) -> String {
    format!("{} <= {}", a.upper, b.lower)
}

/// `min(a) > max(b)`
fn entirely_after(a: &TemporalBounds, b: &TemporalBounds) -> String {
    if b.point {
        format!("{} > {}", a.lower, b.upper)
    } else {
        format!("{} >= {}", a.lower, b.upper)
    }
}

/// `min(a) >= max(b)`
fn at_or_after(a: &TemporalBounds, b: &TemporalBounds) -> String {
    format!("{} >= {}", a.lower, b.upper)
}

/// Three-valued comparison of two temporal ranges.
///
/// Returns `None` for operators that have no range semantics.
pub(crate) fn compare_ranges(
    operator: &str,
    left: &TemporalBounds,
    right: &TemporalBounds,
) -> Option<String> {
    let (when_true, when_false) = match operator {
        "<" => (entirely_before(left, right), at_or_after(left, right)),
        "<=" => (at_or_before(left, right), entirely_after(left, right)),
        ">" => (entirely_after(left, right), at_or_before(left, right)),
        ">=" => (at_or_after(left, right), entirely_before(left, right)),
        "=" | "!=" => {
            let disjoint = format!(
                "{} OR {}",
                entirely_before(left, right),
                entirely_before(right, left)
            );
            let outcome = if operator == "=" { "FALSE" } else { "TRUE" };
            return Some(format!(
                "(CASE WHEN {disjoint} THEN {outcome} ELSE NULL END)"
            ));
        }
        _ => return None,
    };
    Some(format!(
        "(CASE WHEN {when_true} THEN TRUE WHEN {when_false} THEN FALSE ELSE NULL END)"
    ))
}
