use chrono::NaiveDate;

/// Advisor calls allowed per UTC calendar day. The counter resets the first
/// time it is consulted on a new day.
#[derive(Debug, Clone)]
pub struct DailyBudget {
    limit: u32,
    used: u32,
    day: Option<NaiveDate>,
}

impl DailyBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: 0,
            day: None,
        }
    }

    /// Take one call from today's allowance. On exhaustion returns `(used, limit)`.
    pub fn try_acquire(&mut self, today: NaiveDate) -> Result<(), (u32, u32)> {
        if self.day != Some(today) {
            self.day = Some(today);
            self.used = 0;
        }
        if self.used >= self.limit {
            return Err((self.used, self.limit));
        }
        self.used += 1;
        Ok(())
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_exhausts_within_day() {
        let mut b = DailyBudget::new(2);
        assert!(b.try_acquire(day(1)).is_ok());
        assert!(b.try_acquire(day(1)).is_ok());
        assert_eq!(b.try_acquire(day(1)), Err((2, 2)));
    }

    #[test]
    fn test_resets_on_new_day() {
        let mut b = DailyBudget::new(1);
        assert!(b.try_acquire(day(1)).is_ok());
        assert!(b.try_acquire(day(1)).is_err());
        assert!(b.try_acquire(day(2)).is_ok());
        assert_eq!(b.used(), 1);
    }

    #[test]
    fn test_zero_limit_never_grants() {
        let mut b = DailyBudget::new(0);
        assert_eq!(b.try_acquire(day(5)), Err((0, 0)));
    }
}
