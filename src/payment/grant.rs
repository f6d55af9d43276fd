//! Outgoing payment grants
//!
//! A grant authorizes payment creation up to cumulative send/receive
//! limits, optionally renewed on an ISO 8601 repeating interval
//! (`R[n]/<start>/<period>`). Creations against one grant are serialized
//! on the grant row so concurrent requests see each other's spending.

use chrono::{DateTime, Duration, Months, Utc};

use crate::db::Amount;

/// Limits attached to a grant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantLimits {
    /// Only this receiver may be paid
    pub receiver: Option<String>,
    /// Cumulative debit budget per interval
    pub debit_amount: Option<Amount>,
    /// Cumulative receive budget per interval
    pub receive_amount: Option<Amount>,
    /// Repeating interval the budgets renew on
    pub interval: Option<RepeatingInterval>,
}

/// A grant presented with a payment creation
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentGrant {
    /// Grant id issued by the authorization server
    pub id: String,
    /// Limits, if the grant carries any
    pub limits: Option<GrantLimits>,
}

/// An ISO 8601 period: calendar months plus an exact duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPeriod {
    months: u32,
    duration: Duration,
}

impl IsoPeriod {
    /// Parse `PnYnMnWnDTnHnMnS`
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('P')?;
        let (date_part, time_part) = match rest.split_once('T') {
            Some((d, t)) => (d, Some(t)),
            None => (rest, None),
        };

        let mut months: u32 = 0;
        let mut duration = Duration::zero();
        let mut any = false;

        let mut number = String::new();
        for c in date_part.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            let value: u32 = number.parse().ok()?;
            number.clear();
            any = true;
            match c {
                'Y' => months = months.checked_add(value.checked_mul(12)?)?,
                'M' => months = months.checked_add(value)?,
                'W' => duration = duration + Duration::weeks(value as i64),
                'D' => duration = duration + Duration::days(value as i64),
                _ => return None,
            }
        }
        if !number.is_empty() {
            return None;
        }

        if let Some(time_part) = time_part {
            for c in time_part.chars() {
                if c.is_ascii_digit() {
                    number.push(c);
                    continue;
                }
                let value: u32 = number.parse().ok()?;
                number.clear();
                any = true;
                match c {
                    'H' => duration = duration + Duration::hours(value as i64),
                    'M' => duration = duration + Duration::minutes(value as i64),
                    'S' => duration = duration + Duration::seconds(value as i64),
                    _ => return None,
                }
            }
            if !number.is_empty() {
                return None;
            }
        }

        if !any {
            return None;
        }
        Some(Self { months, duration })
    }

    /// Add the period to a point in time
    pub fn add_to(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let with_months = if self.months > 0 {
            at.checked_add_months(Months::new(self.months)).unwrap_or(at)
        } else {
            at
        };
        with_months + self.duration
    }

    fn is_zero(&self) -> bool {
        self.months == 0 && self.duration.is_zero()
    }
}

/// `R[n]/<start>/<period>`: a period repeated from a start instant.
/// `R` without a count repeats forever; `Rn` runs the base interval plus
/// `n` repetitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatingInterval {
    repetitions: Option<u32>,
    start: DateTime<Utc>,
    period: IsoPeriod,
}

impl RepeatingInterval {
    /// Parse the interval expression
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '/');
        let repeat = parts.next()?;
        let start = parts.next()?;
        let period = parts.next()?;

        let repeat = repeat.strip_prefix('R')?;
        let repetitions = if repeat.is_empty() || repeat == "-1" {
            None
        } else {
            Some(repeat.parse::<u32>().ok()?)
        };
        let start = DateTime::parse_from_rfc3339(start).ok()?.with_timezone(&Utc);
        let period = IsoPeriod::parse(period)?;
        if period.is_zero() {
            return None;
        }
        Some(Self {
            repetitions,
            start,
            period,
        })
    }

    /// The occurrence `[start, end)` covering `at`, if any
    pub fn interval_containing(&self, at: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if at < self.start {
            return None;
        }
        let mut occurrence: u32 = 0;
        let mut current = self.start;
        loop {
            let end = self.period.add_to(current);
            if at < end {
                return Some((current, end));
            }
            if let Some(n) = self.repetitions {
                if occurrence >= n {
                    return None;
                }
            }
            occurrence += 1;
            current = end;
            // degenerate periods cannot advance past `at`
            if current <= self.start && occurrence > 0 {
                return None;
            }
        }
    }
}

/// Reasons a grant cannot cover a new payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantValidation {
    /// The grant covers the payment
    Ok,
    /// The quoted amount exceeds the remaining budget, or the interval does
    /// not cover now
    Insufficient,
    /// The limit currency disagrees with the quote
    CurrencyMismatch,
    /// The limit receiver disagrees with the quote
    ReceiverMismatch,
}

impl GrantLimits {
    /// Validate static (non-budget) constraints against a quote
    pub fn check_static(
        &self,
        receiver: &str,
        debit: &Amount,
        receive: &Amount,
        now: DateTime<Utc>,
    ) -> GrantValidation {
        if let Some(allowed) = &self.receiver {
            if !receiver.starts_with(allowed.as_str()) {
                return GrantValidation::ReceiverMismatch;
            }
        }
        if let Some(limit) = &self.debit_amount {
            if limit.asset_code != debit.asset_code || limit.asset_scale != debit.asset_scale {
                return GrantValidation::CurrencyMismatch;
            }
        }
        if let Some(limit) = &self.receive_amount {
            if limit.asset_code != receive.asset_code || limit.asset_scale != receive.asset_scale {
                return GrantValidation::CurrencyMismatch;
            }
        }
        if let Some(interval) = &self.interval {
            if interval.interval_containing(now).is_none() {
                return GrantValidation::Insufficient;
            }
        }
        GrantValidation::Ok
    }
}

impl std::str::FromStr for RepeatingInterval {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_parsing() {
        let p = IsoPeriod::parse("P1M").unwrap();
        assert_eq!(p.months, 1);
        assert!(p.duration.is_zero());

        let p = IsoPeriod::parse("P1Y2M3DT4H5M6S").unwrap();
        assert_eq!(p.months, 14);
        assert_eq!(
            p.duration,
            Duration::days(3) + Duration::hours(4) + Duration::minutes(5) + Duration::seconds(6)
        );

        let p = IsoPeriod::parse("PT30S").unwrap();
        assert_eq!(p.months, 0);
        assert_eq!(p.duration, Duration::seconds(30));

        assert!(IsoPeriod::parse("P").is_none());
        assert!(IsoPeriod::parse("1M").is_none());
        assert!(IsoPeriod::parse("P1X").is_none());
    }

    #[test]
    fn test_month_period_respects_calendar() {
        let p = IsoPeriod::parse("P1M").unwrap();
        let jan31 = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        // clamped to the end of February
        assert_eq!(
            p.add_to(jan31),
            Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_single_occurrence_interval() {
        // the base interval with no repetitions
        let start = Utc::now() - Duration::days(5);
        let interval =
            RepeatingInterval::parse(&format!("R0/{}/P1M", start.to_rfc3339())).unwrap();

        let (lo, hi) = interval.interval_containing(Utc::now()).unwrap();
        assert_eq!(lo, start);
        assert!(hi > Utc::now());

        // beyond the single occurrence there is no interval
        assert!(interval
            .interval_containing(start + Duration::days(40))
            .is_none());
        // before the start there is no interval
        assert!(interval
            .interval_containing(start - Duration::seconds(1))
            .is_none());
    }

    #[test]
    fn test_unbounded_interval_rolls_forward() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let interval =
            RepeatingInterval::parse(&format!("R/{}/P1D", start.to_rfc3339())).unwrap();

        let at = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let (lo, hi) = interval.interval_containing(at).unwrap();
        assert_eq!(lo, Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap());
        assert_eq!(hi, Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_bounded_repetitions_expire() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        // base + 2 repetitions = three days of coverage
        let interval =
            RepeatingInterval::parse(&format!("R2/{}/P1D", start.to_rfc3339())).unwrap();

        assert!(interval
            .interval_containing(Utc.with_ymd_and_hms(2026, 1, 3, 12, 0, 0).unwrap())
            .is_some());
        assert!(interval
            .interval_containing(Utc.with_ymd_and_hms(2026, 1, 4, 12, 0, 0).unwrap())
            .is_none());
    }

    #[test]
    fn test_static_checks() {
        let limits = GrantLimits {
            receiver: Some("https://pay.example/bob".to_string()),
            debit_amount: Some(Amount::new(200, "USD", 2)),
            receive_amount: None,
            interval: None,
        };
        let now = Utc::now();
        let debit = Amount::new(190, "USD", 2);
        let receive = Amount::new(95, "XRP", 9);

        assert_eq!(
            limits.check_static("https://pay.example/bob/incoming-payments/1", &debit, &receive, now),
            GrantValidation::Ok
        );
        assert_eq!(
            limits.check_static("https://pay.example/eve/incoming-payments/1", &debit, &receive, now),
            GrantValidation::ReceiverMismatch
        );

        let wrong_scale = Amount::new(190, "USD", 9);
        assert_eq!(
            limits.check_static("https://pay.example/bob/x", &wrong_scale, &receive, now),
            GrantValidation::CurrencyMismatch
        );
    }
}
